use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Acquire, SqlitePool,
};

use crate::{
    config::Config,
    db::{
        consumer::ConsumerRecord,
        message::NewMessage,
    },
    error::Error,
    message::{delayed_queue_name, validate_queue_name, Message, MessageOptions, Payload},
    token,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts an eta to unix milliseconds, rounding up so that a message is
/// never considered due before the requested instant.
pub fn eta_millis(at: DateTime<Utc>) -> i64 {
    let micros = at.timestamp_micros();
    micros.div_euclid(1000) + i64::from(micros.rem_euclid(1000) != 0)
}

/// Handle to the message table. Cheap to clone; all clones share one
/// connection pool.
#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(&Config::default()).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(db_path = config.db_path(), "Connected message store");

        Ok(Self { db: pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Inserts a new message and returns its id. A non-zero `delay` puts the
    /// message into the delayed sub-queue with an eta of now + delay.
    pub async fn enqueue(
        &self,
        queue: &str,
        actor_name: &str,
        payload: &Payload,
        mut options: MessageOptions,
        delay: Option<Duration>,
    ) -> Result<String, Error> {
        validate_queue_name(queue)?;

        let id = token::message_id()?;
        let now = Utc::now();

        let queue = match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let eta = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        Error::invalid_parameter(format!("delay {delay:?} is out of range"))
                    })?;
                options.eta = Some(eta_millis(eta));
                delayed_queue_name(queue)
            }
            None => {
                options.eta = None;
                queue.to_owned()
            }
        };

        let mut tx = self.db.begin().await?;

        Message::insert(
            tx.acquire().await?,
            NewMessage {
                id: &id,
                queue: &queue,
                actor_name,
                args: &payload.args,
                kwargs: &payload.kwargs,
                options: &options,
                created_at: now.timestamp_millis(),
            },
        )
        .await?;

        tx.commit().await?;

        tracing::debug!(message_id = %id, %queue, actor_name, "Enqueued message");

        Ok(id)
    }

    pub async fn claim(
        &self,
        queue: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<Message>, Error> {
        let mut tx = self.db.begin().await?;

        let claimed = Message::claim(tx.acquire().await?, queue, consumer_id, max_count).await?;

        tx.commit().await?;

        Ok(claimed)
    }

    /// Idempotent: deleting a missing message is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        Message::delete(&mut conn, id).await?;
        Ok(())
    }

    pub async fn requeue_delayed(
        &self,
        id: &str,
        eta: DateTime<Utc>,
        retries_remaining: u32,
    ) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;

        let found =
            Message::requeue_delayed(tx.acquire().await?, id, eta_millis(eta), retries_remaining)
                .await?;

        tx.commit().await?;

        if !found {
            tracing::warn!(message_id = id, "Requeued message no longer exists");
        }

        Ok(())
    }

    pub async fn promote_ready(&self, queue_dq: &str, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut tx = self.db.begin().await?;

        let moved =
            Message::promote_ready(tx.acquire().await?, queue_dq, now.timestamp_millis()).await?;

        tx.commit().await?;

        Ok(moved)
    }

    /// Gives up ownership of messages claimed by `consumer_id` without
    /// processing them.
    pub async fn release(&self, ids: &[String], consumer_id: &str) -> Result<u64, Error> {
        let mut tx = self.db.begin().await?;

        let mut released = 0;
        for id in ids {
            if Message::release(tx.acquire().await?, id, consumer_id).await? {
                released += 1;
            }
        }

        tx.commit().await?;

        Ok(released)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Message::get(&mut conn, id).await
    }

    pub async fn list(&self) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;
        Message::list(&mut conn).await
    }

    /// Messages in `queue` and its delayed sub-queue.
    pub async fn count(&self, queue: &str) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Message::count(&mut conn, queue).await
    }

    pub async fn total_count(&self) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Message::count_all(&mut conn).await
    }

    pub async fn claimed_count(&self) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Message::count_claimed(&mut conn).await
    }

    pub async fn flush(&self, queue: &str) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Message::flush(&mut conn, queue).await
    }

    pub async fn flush_all(&self) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        Message::flush_all(&mut conn).await
    }

    pub async fn heartbeat(&self, consumer_id: &str) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        ConsumerRecord::heartbeat(&mut conn, consumer_id, now_millis()).await
    }

    pub async fn deregister(&self, consumer_id: &str) -> Result<(), Error> {
        let mut conn = self.db.acquire().await?;
        ConsumerRecord::deregister(&mut conn, consumer_id).await
    }

    pub async fn consumers(&self) -> Result<Vec<ConsumerRecord>, Error> {
        let mut conn = self.db.acquire().await?;
        ConsumerRecord::list(&mut conn).await
    }

    /// Releases messages owned by consumers whose last heartbeat is older
    /// than `timeout`.
    pub async fn release_orphaned(&self, timeout: Duration) -> Result<u64, Error> {
        let cutoff = now_millis() - timeout.as_millis() as i64;

        let mut tx = self.db.begin().await?;

        let released = ConsumerRecord::release_orphaned(tx.acquire().await?, cutoff).await?;

        tx.commit().await?;

        Ok(released)
    }
}
