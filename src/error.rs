use thiserror::Error;

/// SQL Server error numbers considered transient (connection drops,
/// throttling, login timeouts on busy replicas). Anything else fails the
/// command on first attempt.
pub const TRANSIENT_ERROR_CODES: &[u32] = &[4060, 40197, 40501, 40613, 49918, 49919, 49920, 11001];

#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed job definition (empty column lists, missing table names).
    /// Raised before any database I/O is attempted.
    #[error("invalid job definition: {0}")]
    Definition(String),

    /// Endpoint resolution or connect failure. Fatal for the current run,
    /// never retried; the next attempt is governed by the schedule.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server-side SQL error. `code` is the SQL Server error number when the
    /// driver surfaced one.
    #[error("database error: {message}")]
    Database { code: Option<u32>, message: String },

    /// Command exceeded the configured timeout.
    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl TransferError {
    pub fn database(code: Option<u32>, message: impl Into<String>) -> Self {
        TransferError::Database {
            code,
            message: message.into(),
        }
    }

    /// Whether a retry is likely to succeed. Only timeout-class errors and
    /// the fixed allow-list of server error numbers qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Timeout(_) => true,
            TransferError::Database {
                code: Some(code), ..
            } => TRANSIENT_ERROR_CODES.contains(code),
            _ => false,
        }
    }
}
