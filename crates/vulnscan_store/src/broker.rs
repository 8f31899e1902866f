//! Durable work broker.
//!
//! A direct exchange with named bindings (`routing_key -> queue`) carried by
//! two tables. Messages are persistent and delivered at least once: a consume
//! leases the oldest deliverable message, and a lease that expires before the
//! ack makes the message deliverable again. Consumers must be idempotent.

use std::time::Duration;

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// One leased message. `ack` (delete) or `nack` (requeue) by `delivery_id`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: i64,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
    /// True when this message had been leased before (crash or lease expiry).
    pub redelivered: bool,
}

/// Client handle to the durable direct exchange.
#[derive(Clone)]
pub struct WorkBroker {
    pool: Pool<Sqlite>,
    exchange: String,
}

impl WorkBroker {
    pub fn new(pool: Pool<Sqlite>, exchange: impl Into<String>) -> Self {
        Self {
            pool,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Create the broker tables if they do not exist yet.
    pub async fn declare_exchange(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mq_bindings (
                exchange TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                queue TEXT NOT NULL,
                PRIMARY KEY (exchange, routing_key, queue)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mq_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                correlation_id TEXT,
                body BLOB NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                lease_until INTEGER,
                published_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mq_messages_queue ON mq_messages (queue, state, id)",
        )
        .execute(&self.pool)
        .await?;

        debug!(exchange = %self.exchange, "Exchange declared");
        Ok(())
    }

    /// Bind a queue to this exchange under a routing key. Idempotent.
    pub async fn bind_queue(&self, routing_key: &str, queue: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO mq_bindings (exchange, routing_key, queue) VALUES (?, ?, ?)",
        )
        .bind(&self.exchange)
        .bind(routing_key)
        .bind(queue)
        .execute(&self.pool)
        .await?;
        info!(exchange = %self.exchange, routing_key, queue, "Queue bound");
        Ok(())
    }

    /// Publish a persistent message to every queue bound under `routing_key`.
    pub async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let queues: Vec<String> = sqlx::query_scalar(
            "SELECT queue FROM mq_bindings WHERE exchange = ? AND routing_key = ?",
        )
        .bind(&self.exchange)
        .bind(routing_key)
        .fetch_all(&self.pool)
        .await?;

        if queues.is_empty() {
            // A direct exchange with no matching binding drops the message.
            warn!(exchange = %self.exchange, routing_key, "No binding for routing key; message dropped");
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        for queue in &queues {
            sqlx::query(
                r#"
                INSERT INTO mq_messages (queue, routing_key, correlation_id, body, state, published_at)
                VALUES (?, ?, ?, ?, 'queued', ?)
                "#,
            )
            .bind(queue)
            .bind(routing_key)
            .bind(correlation_id)
            .bind(body)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Atomically claim the oldest deliverable message on `queue`.
    ///
    /// A message is deliverable when queued, or when leased with an expired
    /// lease (the at-least-once redelivery path). Returns `None` when the
    /// queue is empty.
    pub async fn consume(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>> {
        let now_ms = Utc::now().timestamp_millis();
        let lease_until = now_ms + lease.as_millis() as i64;

        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, String, Option<String>, Vec<u8>, i64)> = sqlx::query_as(
            r#"
            SELECT id, routing_key, correlation_id, body, attempts
            FROM mq_messages
            WHERE queue = ?
              AND (state = 'queued' OR (state = 'leased' AND lease_until < ?))
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, routing_key, correlation_id, body, attempts)) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query(
            r#"
            UPDATE mq_messages
            SET state = 'leased', lease_until = ?, attempts = attempts + 1
            WHERE id = ?
              AND (state = 'queued' OR (state = 'leased' AND lease_until < ?))
            "#,
        )
        .bind(lease_until)
        .bind(id)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if claimed == 0 {
            // Raced with another consumer on the same queue.
            return Ok(None);
        }

        Ok(Some(Delivery {
            delivery_id: id,
            routing_key,
            correlation_id,
            body,
            redelivered: attempts > 0,
        }))
    }

    /// Acknowledge (and drop) a leased message.
    pub async fn ack(&self, delivery_id: i64) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM mq_messages WHERE id = ?")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::not_found(format!(
                "delivery {delivery_id} already acked"
            )));
        }
        Ok(())
    }

    /// Return a leased message to the queue for immediate redelivery.
    pub async fn nack(&self, delivery_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE mq_messages SET state = 'queued', lease_until = NULL WHERE id = ?",
        )
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of messages currently sitting in a queue (leased included).
    pub async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mq_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }

    /// Drop every message in a queue.
    pub async fn purge(&self, queue: &str) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM mq_messages WHERE queue = ?")
            .bind(queue)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}
