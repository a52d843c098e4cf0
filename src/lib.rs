// Core infrastructure modules
pub mod core;

// Configuration modules
pub mod credentials;

pub use crate::core::db::{ConnectionRegistry, Query, QueryError, QueryOutcome, QueryQueue};
pub use crate::core::{Result, SqlGateError};
