/// Database Module
///
/// The query-execution layer, split into three concerns:
/// - **Connection Registry** (`connection.rs`): named connections, transaction and commit-lock state
/// - **Query Execution** (`query.rs`): the query object, statement classification, result shaping
/// - **Query Queue** (`queue.rs`): forward-only traversal over pre-built queries
///
/// All operations use the shared `SqlGateError` type for error propagation.
pub mod connection;
pub mod query;
pub mod queue;

pub use connection::*;
pub use query::*;
pub use queue::*;
