//! Error taxonomy for the synchronization core.
//!
//! Every failure the core surfaces falls into one of the kinds below; the
//! executor and rate limiter branch on the classification helpers rather
//! than on concrete error sites.

use std::time::Duration;

use thiserror::Error;

use crate::models::Platform;

/// Main error type for the synchronization core
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed for {platform}: {message}")]
    AuthFailed { platform: Platform, message: String },

    #[error("rate limited by {platform}")]
    RateLimited {
        platform: Platform,
        retry_after: Option<Duration>,
    },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("operation not permitted: {reason}")]
    NotPermitted { reason: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("emergency stop is active")]
    Stopped,

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("database error")]
    Database(#[source] sqlx::Error),
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::Transient {
            message: message.into(),
        }
    }

    pub fn not_permitted(reason: impl Into<String>) -> Self {
        SyncError::NotPermitted {
            reason: reason.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        SyncError::Conflict {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        SyncError::NotFound {
            resource: resource.into(),
        }
    }

    /// Whether the rate limiter's retry loop may re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::Transient { .. }
        )
    }

    /// Whether this failure aborts the whole job (local transaction rolls
    /// back, no snapshot is written). Per-item failures within a batch are
    /// never job-fatal. A `RateLimited` only reaches callers once the retry
    /// loop has spent its attempt budget, so here it means exhaustion.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFailed { .. }
                | SyncError::RateLimited { .. }
                | SyncError::Cancelled
                | SyncError::Stopped
                | SyncError::Conflict { .. }
                | SyncError::Database(_)
        )
    }

    /// Stable machine-readable kind, used in progress events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::AuthFailed { .. } => "auth_failed",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Transient { .. } => "transient",
            SyncError::NotPermitted { .. } => "not_permitted",
            SyncError::Conflict { .. } => "conflict",
            SyncError::NotFound { .. } => "not_found",
            SyncError::Cancelled => "cancelled",
            SyncError::Stopped => "stopped",
            SyncError::Config { .. } => "config",
            SyncError::Database(_) => "database",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    SyncError::Conflict {
                        message: db_err.message().to_string(),
                    }
                } else {
                    SyncError::Database(err)
                }
            }
            sqlx::Error::RowNotFound => SyncError::NotFound {
                resource: "row".to_string(),
            },
            _ => SyncError::Database(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Conflict {
            message: format!("malformed persisted document: {}", err),
        }
    }
}

/// Result type alias for the synchronization core
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transient("503").is_retryable());
        assert!(SyncError::RateLimited {
            platform: Platform::Spotify,
            retry_after: None
        }
        .is_retryable());

        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::not_permitted("read only").is_retryable());
        assert!(!SyncError::AuthFailed {
            platform: Platform::Youtube,
            message: "revoked".into()
        }
        .is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::Stopped.is_job_fatal());
        assert!(SyncError::Cancelled.is_job_fatal());
        assert!(SyncError::conflict("duplicate link").is_job_fatal());
        // Rate limiting is retried first; one that escapes the retry loop
        // has exhausted its budget and aborts the job.
        assert!(SyncError::RateLimited {
            platform: Platform::Spotify,
            retry_after: None
        }
        .is_job_fatal());
        assert!(!SyncError::not_found("track").is_job_fatal());
        assert!(!SyncError::not_permitted("shared playlist").is_job_fatal());
    }
}
