use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Storage unavailable"))]
    StorageUnavailable {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Broker has not been booted"))]
    NotBooted,

    #[snafu(display("Unknown actor: {actor_name}"))]
    UnknownActor { actor_name: String },

    #[snafu(display("Actor {actor_name} is already registered"))]
    DuplicateActor { actor_name: String },

    #[snafu(display("Actor {actor_name} failed"))]
    ActorExecutionFailure {
        actor_name: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Error (de)serializing message data"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Invalid configuration"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },

    #[snafu(display("Timed out waiting for {what}"))]
    Timeout { what: String },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::StorageUnavailable { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Config { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn unknown_actor(actor_name: impl Into<String>) -> Self {
        Self::UnknownActor {
            actor_name: actor_name.into(),
        }
    }

    pub fn duplicate_actor(actor_name: impl Into<String>) -> Self {
        Self::DuplicateActor {
            actor_name: actor_name.into(),
        }
    }

    pub fn actor_failed(actor_name: impl Into<String>, report: eyre::Report) -> Self {
        Self::ActorExecutionFailure {
            actor_name: actor_name.into(),
            source: Some(report),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout { what: what.into() }
    }

    /// Whether the error came from the storage layer and the operation can be
    /// retried once the database is reachable again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. } | Self::NotBooted)
    }
}
