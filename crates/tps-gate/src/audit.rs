//! Per-request audit records.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Channel capacity for the database writer.
const CHANNEL_CAPACITY: usize = 1024;

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS request_logs (
    id BIGSERIAL PRIMARY KEY,
    client_ip TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    url TEXT NOT NULL,
    had_valid_token BOOLEAN NOT NULL DEFAULT FALSE,
    was_presented_challenge BOOLEAN NOT NULL DEFAULT FALSE,
    challenge_succeeded BOOLEAN NOT NULL DEFAULT FALSE
)";

const INSERT_RECORD: &str = r"
INSERT INTO request_logs
    (client_ip, timestamp, url, had_valid_token, was_presented_challenge, challenge_succeeded)
VALUES ($1, $2, $3, $4, $5, $6)";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One terminal outcome of request handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub client_ip: String,
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub had_valid_token: bool,
    pub was_presented_challenge: bool,
    pub challenge_succeeded: bool,
}

impl RequestRecord {
    /// Request that carried a valid session token.
    pub fn authenticated(client_ip: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            timestamp: Utc::now(),
            url: url.into(),
            had_valid_token: true,
            was_presented_challenge: false,
            challenge_succeeded: false,
        }
    }

    /// Challenge submission with the authority's verdict.
    pub fn challenge(client_ip: impl Into<String>, url: impl Into<String>, succeeded: bool) -> Self {
        Self {
            client_ip: client_ip.into(),
            timestamp: Utc::now(),
            url: url.into(),
            had_valid_token: false,
            was_presented_challenge: true,
            challenge_succeeded: succeeded,
        }
    }
}

/// Sink for audit records.
///
/// Implementations must not block the caller; delivery is best effort.
pub trait RequestLogger: Send + Sync {
    fn log_request(&self, record: RequestRecord);
}

/// Emits each record as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRequestLogger;

impl RequestLogger for TracingRequestLogger {
    fn log_request(&self, record: RequestRecord) {
        tracing::info!(
            target: "tps::audit",
            client_ip = %record.client_ip,
            timestamp = %record.timestamp.to_rfc3339(),
            url = %record.url,
            had_valid_token = record.had_valid_token,
            was_presented_challenge = record.was_presented_challenge,
            challenge_succeeded = record.challenge_succeeded,
            "request"
        );
    }
}

/// Writes records to the `request_logs` table from a background task.
pub struct PgRequestLogger {
    tx: mpsc::Sender<RequestRecord>,
}

impl PgRequestLogger {
    /// Connect, create the table if missing and spawn the writer.
    pub async fn connect(database_url: &str) -> Result<Self, AuditError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, AuditError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(write_loop(pool, rx));
        tracing::info!("audit records go to the request_logs table");
        Ok(Self { tx })
    }
}

impl RequestLogger for PgRequestLogger {
    fn log_request(&self, record: RequestRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                tracing::warn!(url = %record.url, "audit channel full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                tracing::warn!(url = %record.url, "audit writer stopped, dropping record");
            }
        }
    }
}

async fn write_loop(pool: PgPool, mut rx: mpsc::Receiver<RequestRecord>) {
    while let Some(record) = rx.recv().await {
        let result = sqlx::query(INSERT_RECORD)
            .bind(&record.client_ip)
            .bind(record.timestamp)
            .bind(&record.url)
            .bind(record.had_valid_token)
            .bind(record.was_presented_challenge)
            .bind(record.challenge_succeeded)
            .execute(&pool)
            .await;

        if let Err(e) = result {
            tracing::warn!(url = %record.url, error = %e, "failed to write audit record");
        }
    }
    tracing::debug!("audit writer stopped");
}

/// Logger whose records land in a channel the test can drain.
#[cfg(test)]
fn test_logger(capacity: usize) -> (PgRequestLogger, mpsc::Receiver<RequestRecord>) {
    let (tx, rx) = mpsc::channel(capacity);
    (PgRequestLogger { tx }, rx)
}
