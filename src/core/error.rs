/// Error types for the sqlgate crate.
///
/// One enum covers the whole error taxonomy: connection and credential
/// resolution failures, statement-level request failures, forced rollbacks,
/// and transaction bookkeeping problems. Statement and rollback failures
/// carry an immutable snapshot of the offending query rather than a live
/// reference, so errors stay shareable.
use rusqlite::types::Value;
use thiserror::Error;

/// Immutable capture of a query's text and positional parameters, taken at
/// the moment a failure is raised.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub text: Option<String>,
    pub params: Vec<Value>,
}

impl std::fmt::Display for QuerySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "<no query text>"),
        }
    }
}

/// Error type for all sqlgate operations.
#[derive(Error, Debug)]
pub enum SqlGateError {
    /// Connection establishment failed or no connection is open
    #[error("Connection error: {0}")]
    Connection(String),

    /// No credential source resolves for the requested database name
    #[error("Credential error: {0}")]
    Credentials(String),

    /// A single statement failed at the driver, or the execute dispatch was
    /// given arguments it cannot act on
    #[error("Request error: {message}")]
    Request {
        message: String,
        /// Driver extended error code, when the driver reported one
        code: Option<i32>,
        /// Snapshot of the failing query, when raised from an execution
        query: Option<QuerySnapshot>,
    },

    /// A transaction was forcibly rolled back as a consequence of a failed
    /// statement; subsumes the originating request error
    #[error("Rollback error: {message}")]
    Rollback {
        message: String,
        code: Option<i32>,
        query: Option<QuerySnapshot>,
        #[source]
        source: Box<SqlGateError>,
    },

    /// Transaction bookkeeping failures (begin/commit at the driver)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Statement whose leading keyword is not one this layer executes
    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),

    /// Registry state lock failures
    #[error("State error: {0}")]
    State(String),

    /// Driver errors from paths that are not statement execution
    /// (connection pragmas, transaction control)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Credential file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Credential file parse errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SqlGateError {
    /// Driver error code attached to a request or rollback error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            SqlGateError::Request { code, .. } | SqlGateError::Rollback { code, .. } => *code,
            _ => None,
        }
    }

    /// Snapshot of the failing query, for request and rollback errors raised
    /// from an execution.
    pub fn query(&self) -> Option<&QuerySnapshot> {
        match self {
            SqlGateError::Request { query, .. } | SqlGateError::Rollback { query, .. } => {
                query.as_ref()
            }
            _ => None,
        }
    }
}

/// Type alias for Result to use SqlGateError as the error type.
pub type Result<T> = std::result::Result<T, SqlGateError>;
