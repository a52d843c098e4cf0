/// Core Module
///
/// Shared infrastructure for the crate: the database layer and the common
/// error type.
pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{QuerySnapshot, Result, SqlGateError};
