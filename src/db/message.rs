use serde_json::{Map, Value};
use sqlx::{types::Json, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    error::Error,
    message::{base_queue_name, delayed_queue_name, Message, MessageOptions},
};

/// Columns needed to insert a message row.
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub queue: &'a str,
    pub actor_name: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
    pub options: &'a MessageOptions,
    pub created_at: i64,
}

impl Message {
    pub async fn insert(db: &mut SqliteConnection, new: NewMessage<'_>) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO messages (id, queue, actor_name, args, kwargs, options, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(new.id)
        .bind(new.queue)
        .bind(new.actor_name)
        .bind(Json(new.args))
        .bind(Json(new.kwargs))
        .bind(Json(new.options))
        .bind(new.created_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Assigns up to `max_count` unclaimed rows of `queue` to `consumer_id`.
    ///
    /// Selection and assignment happen in one statement, so two concurrent
    /// calls can never return the same row.
    pub async fn claim(
        db: &mut SqliteConnection,
        queue: &str,
        consumer_id: &str,
        max_count: usize,
    ) -> Result<Vec<Message>, Error> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut claimed: Vec<Message> = sqlx::query_as(
            "
            UPDATE messages
            SET consumer_id = $1
            WHERE id IN (
                SELECT id FROM messages
                WHERE queue = $2 AND consumer_id IS NULL
                ORDER BY created_at ASC, rowid ASC
                LIMIT $3
            )
            RETURNING id, queue, actor_name, args, kwargs, options, consumer_id, created_at
            ",
        )
        .bind(consumer_id)
        .bind(queue)
        .bind(max_count as i64)
        .fetch_all(db)
        .await?;

        // RETURNING gives no ordering guarantee.
        claimed.sort_by_key(|m| m.created_at);

        Ok(claimed)
    }

    /// Returns whether a row was removed.
    pub async fn delete(db: &mut SqliteConnection, id: &str) -> Result<bool, Error> {
        let res = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Moves a message into its delayed sub-queue and releases its owner.
    pub async fn requeue_delayed(
        db: &mut SqliteConnection,
        id: &str,
        eta: i64,
        retries_remaining: u32,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET queue = CASE WHEN queue LIKE '%.DQ' THEN queue ELSE queue || '.DQ' END,
                options = json_set(
                    options,
                    '$.eta', $2,
                    '$.retries_remaining', $3,
                    '$.retries', COALESCE(json_extract(options, '$.retries'), 0) + 1
                ),
                consumer_id = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(eta)
        .bind(retries_remaining as i64)
        .execute(db)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Moves every row of `queue_dq` whose eta is at or before `now` into
    /// the matching base queue. Returns how many rows moved.
    pub async fn promote_ready(
        db: &mut SqliteConnection,
        queue_dq: &str,
        now: i64,
    ) -> Result<u64, Error> {
        let queue_dq = delayed_queue_name(queue_dq);

        let res = sqlx::query(
            "
            UPDATE messages
            SET queue = $1, options = json_remove(options, '$.eta')
            WHERE queue = $2 AND COALESCE(json_extract(options, '$.eta'), 0) <= $3
            ",
        )
        .bind(base_queue_name(&queue_dq))
        .bind(&queue_dq)
        .bind(now)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Clears the owner of a message still held by `consumer_id`.
    pub async fn release(
        db: &mut SqliteConnection,
        id: &str,
        consumer_id: &str,
    ) -> Result<bool, Error> {
        let res = sqlx::query(
            "UPDATE messages SET consumer_id = NULL WHERE id = $1 AND consumer_id = $2",
        )
        .bind(id)
        .bind(consumer_id)
        .execute(db)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    pub async fn get(db: &mut SqliteConnection, id: &str) -> Result<Option<Message>, Error> {
        Ok(sqlx::query_as(
            "
            SELECT id, queue, actor_name, args, kwargs, options, consumer_id, created_at
            FROM messages WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    /// Every row, oldest first.
    pub async fn list(db: &mut SqliteConnection) -> Result<Vec<Message>, Error> {
        let mut stream = sqlx::query_as(
            "
            SELECT id, queue, actor_name, args, kwargs, options, consumer_id, created_at
            FROM messages ORDER BY created_at ASC, rowid ASC
            ",
        )
        .fetch(db);

        let mut messages = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            messages.push(res);
        }

        Ok(messages)
    }

    /// Rows in `queue` or its delayed sub-queue.
    pub async fn count(db: &mut SqliteConnection, queue: &str) -> Result<u64, Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = $1 OR queue = $2")
                .bind(base_queue_name(queue))
                .bind(delayed_queue_name(queue))
                .fetch_one(db)
                .await?;

        Ok(count as u64)
    }

    pub async fn count_all(db: &mut SqliteConnection) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(db)
            .await?;

        Ok(count as u64)
    }

    pub async fn count_claimed(db: &mut SqliteConnection) -> Result<u64, Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE consumer_id IS NOT NULL")
                .fetch_one(db)
                .await?;

        Ok(count as u64)
    }

    /// Deletes every row in `queue` and its delayed sub-queue.
    pub async fn flush(db: &mut SqliteConnection, queue: &str) -> Result<u64, Error> {
        let res = sqlx::query("DELETE FROM messages WHERE queue = $1 OR queue = $2")
            .bind(base_queue_name(queue))
            .bind(delayed_queue_name(queue))
            .execute(db)
            .await?;

        Ok(res.rows_affected())
    }

    pub async fn flush_all(db: &mut SqliteConnection) -> Result<u64, Error> {
        let res = sqlx::query("DELETE FROM messages").execute(db).await?;

        Ok(res.rows_affected())
    }
}
