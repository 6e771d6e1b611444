use sqlx::SqliteConnection;

use crate::error::Error;

/// Liveness record for a consumer. Only used to find messages whose owner
/// died without releasing them.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsumerRecord {
    pub id: String,
    /// Unix milliseconds.
    pub last_alive: i64,
}

impl ConsumerRecord {
    pub async fn heartbeat(db: &mut SqliteConnection, id: &str, now: i64) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO consumers (id, last_alive) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET last_alive = excluded.last_alive
            ",
        )
        .bind(id)
        .bind(now)
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn deregister(db: &mut SqliteConnection, id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM consumers WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }

    /// Releases messages held by consumers that are unknown or have not
    /// been seen since `cutoff`, then forgets those consumers. Returns the
    /// number of messages released.
    pub async fn release_orphaned(db: &mut SqliteConnection, cutoff: i64) -> Result<u64, Error> {
        let released = sqlx::query(
            "
            UPDATE messages
            SET consumer_id = NULL
            WHERE consumer_id IS NOT NULL
              AND consumer_id NOT IN (SELECT id FROM consumers WHERE last_alive >= $1)
            ",
        )
        .bind(cutoff)
        .execute(&mut *db)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM consumers WHERE last_alive < $1")
            .bind(cutoff)
            .execute(&mut *db)
            .await?;

        Ok(released)
    }

    pub async fn list(db: &mut SqliteConnection) -> Result<Vec<ConsumerRecord>, Error> {
        Ok(sqlx::query_as("SELECT id, last_alive FROM consumers")
            .fetch_all(db)
            .await?)
    }
}
