/// Connection Registry Module
///
/// Maps logical database names to live connections and owns the per-name
/// transaction state: an in-transaction flag plus an optional commit-lock
/// token. The registry is also the factory callers use to obtain `Query`
/// instances, and the boundary where a statement failure inside an open
/// transaction is converted into a forced rollback.
use crate::core::db::query::Query;
use crate::core::error::{Result, SqlGateError};
use crate::credentials::{AltCredentials, CredentialStore, Credentials};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Driver code for a unique-constraint violation (SQLITE_CONSTRAINT_UNIQUE).
/// Callers compare `QueryError::code()` against this to special-case
/// duplicate keys.
pub const ERROR_DUPLICATE_KEY: i32 = 2067;

/// Per-name transaction state.
#[derive(Debug, Default, Clone)]
struct TxState {
    in_transaction: bool,
    commit_token: Option<String>,
}

/// Named-connection registry with per-name transaction and lock-token state.
///
/// One explicit instance per process or test; there are no hidden statics.
/// The name-keyed transaction map sits behind a mutex so transaction
/// begin/commit/rollback stay consistent when the registry is shared.
#[derive(Debug)]
pub struct ConnectionRegistry {
    credentials: CredentialStore,
    connections: HashMap<String, Connection>,
    states: Mutex<HashMap<String, TxState>>,
    current: Option<String>,
}

impl ConnectionRegistry {
    /// Creates a registry resolving names against the given credential store.
    pub fn new(credentials: CredentialStore) -> Self {
        ConnectionRegistry {
            credentials,
            connections: HashMap::new(),
            states: Mutex::new(HashMap::new()),
            current: None,
        }
    }

    /// Creates a registry over the process-wide credential cache. Fails if
    /// `credentials::load_default_credentials` has not run.
    pub fn from_default_credentials() -> Result<Self> {
        let store = crate::credentials::default_credentials()
            .ok_or_else(|| SqlGateError::Credentials("default credentials not loaded".to_string()))?;
        Ok(ConnectionRegistry::new(store.clone()))
    }

    /// Opens (or re-opens) the connection for `name`, resolving credentials
    /// from the store (falling back to the store's default name when `name`
    /// is absent) and applying any `alt` overrides. A prior connection under
    /// the same name is replaced. The opened name becomes current.
    pub fn open(&mut self, name: Option<&str>, alt: Option<AltCredentials>) -> Result<()> {
        let (name, credentials) = self.credentials.resolve(name)?;
        let credentials = match alt {
            Some(alt) => alt.apply(credentials),
            None => credentials,
        };
        self.connect(name, credentials)
    }

    /// Opens the connection for `name` from an explicit credential struct,
    /// bypassing the store.
    pub fn open_with(&mut self, name: &str, credentials: Credentials) -> Result<()> {
        self.connect(name.to_string(), credentials)
    }

    fn connect(&mut self, name: String, credentials: Credentials) -> Result<()> {
        debug!(name = %name, dsn = %credentials.dsn(), "opening connection");
        let conn = Connection::open(&credentials.db).map_err(|e| {
            SqlGateError::Connection(format!("could not open {}: {}", credentials.dsn(), e))
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        // a reused handle may come up mid-transaction
        let in_flight = !conn.is_autocommit();
        self.connections.insert(name.clone(), conn);
        {
            let mut states = self.lock_states()?;
            let state = states.entry(name.clone()).or_default();
            state.in_transaction = in_flight;
        }
        self.current = Some(name);
        Ok(())
    }

    /// Drops the connection and transaction state for `name`.
    pub fn close(&mut self, name: &str) {
        self.connections.remove(name);
        if let Ok(mut states) = self.states.lock() {
            states.remove(name);
        }
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
    }

    /// Drops every connection held by this registry.
    pub fn close_all(&mut self) {
        self.connections.clear();
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
        self.current = None;
    }

    /// The current logical database name, if a connection is open.
    pub fn database(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// The current live connection.
    pub fn connection(&self) -> Result<&Connection> {
        let name = self.current_name()?;
        self.connections
            .get(name)
            .ok_or_else(|| SqlGateError::Connection(format!("no connection for '{}'", name)))
    }

    /// Constructs an un-executed `Query` bound to the current connection.
    pub fn query(&self) -> Result<Query<'_>> {
        Ok(Query::new(self.connection()?))
    }

    /// Constructs and immediately executes a `Query` against the current
    /// connection, returning the `Query` so history and errors can be
    /// inspected. A statement failure while this registry's transaction is
    /// open forces a rollback and surfaces as `SqlGateError::Rollback`.
    pub fn execute(&self, sql: &str, params: Vec<Value>, single: bool) -> Result<Query<'_>> {
        let mut query = Query::new(self.connection()?);
        let outcome = query.execute(Some(sql), params, single).map(|_| ());
        match outcome {
            Ok(()) => Ok(query),
            Err(err @ SqlGateError::Request { .. }) if self.in_transaction() => {
                self.rollback(Some(err))?;
                Ok(query)
            }
            Err(err) => Err(err),
        }
    }

    /// Whether this registry considers the current database to be inside a
    /// transaction.
    pub fn in_transaction(&self) -> bool {
        match (&self.current, self.states.lock()) {
            (Some(name), Ok(states)) => states
                .get(name)
                .map(|state| state.in_transaction)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The commit-lock token currently held for the current database name.
    pub fn commit_token(&self) -> Option<String> {
        let name = self.current.as_deref()?;
        self.states
            .lock()
            .ok()?
            .get(name)
            .and_then(|state| state.commit_token.clone())
    }

    /// Starts a transaction on the current connection.
    ///
    /// When no lock token is held for this name: an already-open transaction
    /// is rolled back first, then `lock_token` (if given) is recorded as the
    /// commit lock. A transaction is begun only if one is not already active.
    /// Returns whether a transaction is now active.
    pub fn start_transaction(&self, lock_token: Option<&str>) -> Result<bool> {
        let name = self.current_name()?.to_string();
        let conn = self.connection()?;
        let mut states = self.lock_states()?;
        let state = states.entry(name.clone()).or_default();

        if state.commit_token.is_none() {
            if state.in_transaction {
                rollback_locked(conn, state, None)?;
            }
            if let Some(token) = lock_token {
                state.commit_token = Some(token.to_string());
            }
        }

        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")
                .map_err(|e| SqlGateError::Transaction(format!("could not begin: {}", e)))?;
        }
        state.in_transaction = !conn.is_autocommit();
        debug!(name = %name, locked = state.commit_token.is_some(), "transaction started");
        Ok(state.in_transaction)
    }

    /// Commits the current transaction, but only when no lock token is held
    /// or the supplied token matches. A mismatched token is a silent no-op
    /// and the transaction stays open: a soft safety check, not an
    /// authorization boundary.
    pub fn commit(&self, lock_token: Option<&str>) -> Result<()> {
        let name = self.current_name()?.to_string();
        let conn = self.connection()?;
        let mut states = self.lock_states()?;
        let state = states.entry(name.clone()).or_default();

        if !state.in_transaction {
            return Ok(());
        }
        if let Some(held) = &state.commit_token {
            if lock_token != Some(held.as_str()) {
                debug!(name = %name, "commit skipped, lock token mismatch");
                return Ok(());
            }
        }

        conn.execute_batch("COMMIT")
            .map_err(|e| SqlGateError::Transaction(format!("could not commit: {}", e)))?;
        state.in_transaction = false;
        state.commit_token = None;
        debug!(name = %name, "transaction committed");
        Ok(())
    }

    /// Rolls back the current transaction, clearing the lock token. A silent
    /// no-op when no transaction is active. When `cause` is supplied, the
    /// rollback is re-raised as `SqlGateError::Rollback` carrying the
    /// original error's message, code, and query snapshot.
    pub fn rollback(&self, cause: Option<SqlGateError>) -> Result<()> {
        let name = self.current_name()?.to_string();
        let conn = self.connection()?;
        let mut states = self.lock_states()?;
        let state = states.entry(name).or_default();
        rollback_locked(conn, state, cause)
    }

    fn current_name(&self) -> Result<&str> {
        self.current
            .as_deref()
            .ok_or_else(|| SqlGateError::Connection("no database opened".to_string()))
    }

    fn lock_states(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TxState>>> {
        self.states
            .lock()
            .map_err(|_| SqlGateError::State("registry state lock poisoned".to_string()))
    }
}

fn rollback_locked(
    conn: &Connection,
    state: &mut TxState,
    cause: Option<SqlGateError>,
) -> Result<()> {
    if !state.in_transaction {
        return Ok(());
    }

    conn.execute_batch("ROLLBACK")
        .map_err(|e| SqlGateError::Transaction(format!("could not roll back: {}", e)))?;
    state.in_transaction = false;
    state.commit_token = None;

    if let Some(cause) = cause {
        warn!(error = %cause, "transaction rolled back after failed statement");
        return Err(SqlGateError::Rollback {
            message: format!("forced rollback: {}", cause),
            code: cause.code(),
            query: cause.query().cloned(),
            source: Box::new(cause),
        });
    }
    debug!("transaction rolled back");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::query::QueryOutcome;

    fn memory_registry() -> ConnectionRegistry {
        let store = CredentialStore::from_json_str(
            r#"{
                "main": { "host": "localhost", "user": "sys", "pass": "", "db": ":memory:" }
            }"#,
        )
        .unwrap()
        .with_default("main");

        let mut registry = ConnectionRegistry::new(store);
        registry.open(None, None).unwrap();
        registry
            .connection()
            .unwrap()
            .execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, x INTEGER, tag TEXT UNIQUE);",
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_open_resolves_default_name() {
        let registry = memory_registry();
        assert_eq!(registry.database(), Some("main"));
        assert!(!registry.in_transaction());
    }

    #[test]
    fn test_open_unknown_name_fails() {
        let store = CredentialStore::from_json_str("{}").unwrap();
        let mut registry = ConnectionRegistry::new(store);
        match registry.open(Some("missing"), None) {
            Err(SqlGateError::Credentials(msg)) => assert!(msg.contains("missing")),
            other => panic!("expected Credentials error, got {:?}", other),
        }
    }

    #[test]
    fn test_execute_returns_query_with_history() {
        let registry = memory_registry();

        let q = registry
            .execute("INSERT INTO t (x) VALUES (?)", vec![Value::Integer(5)], false)
            .unwrap();
        assert_eq!(q.insert_id(false), Some(1));
        assert_eq!(q.affected_rows(false), Some(1));

        let q = registry.execute("SELECT x FROM t", vec![], false).unwrap();
        match q.result(false).unwrap() {
            QueryOutcome::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected Rows, got {:?}", other),
        }
    }

    #[test]
    fn test_transaction_commit_roundtrip() {
        let registry = memory_registry();

        assert!(registry.start_transaction(None).unwrap());
        assert!(registry.in_transaction());
        registry
            .execute("INSERT INTO t (x) VALUES (1)", vec![], false)
            .unwrap();
        registry.commit(None).unwrap();
        assert!(!registry.in_transaction());

        let q = registry.execute("SELECT x FROM t", vec![], true).unwrap();
        assert!(matches!(q.result(false), Some(QueryOutcome::Row(Some(_)))));
    }

    #[test]
    fn test_commit_lock_token_soft_semantics() {
        let registry = memory_registry();

        registry.start_transaction(Some("tokenA")).unwrap();
        assert_eq!(registry.commit_token().as_deref(), Some("tokenA"));

        // wrong token: no-op, transaction stays open
        registry.commit(Some("tokenB")).unwrap();
        assert!(registry.in_transaction());
        assert_eq!(registry.commit_token().as_deref(), Some("tokenA"));

        // no token at all: same no-op
        registry.commit(None).unwrap();
        assert!(registry.in_transaction());

        // matching token commits and releases the lock
        registry.commit(Some("tokenA")).unwrap();
        assert!(!registry.in_transaction());
        assert_eq!(registry.commit_token(), None);

        // an unlocked transaction can now start without forcing a rollback
        assert!(registry.start_transaction(None).unwrap());
        registry.rollback(None).unwrap();
    }

    #[test]
    fn test_start_transaction_rolls_back_unlocked_open_transaction() {
        let registry = memory_registry();

        registry.start_transaction(None).unwrap();
        registry
            .execute("INSERT INTO t (x) VALUES (1)", vec![], false)
            .unwrap();

        // restart discards the uncommitted insert
        registry.start_transaction(None).unwrap();
        registry.commit(None).unwrap();

        let q = registry
            .execute("SELECT COUNT(*) AS n FROM t", vec![], true)
            .unwrap();
        match q.result(false).unwrap() {
            QueryOutcome::Row(Some(row)) => assert_eq!(row.get("n"), Some(&Value::Integer(0))),
            other => panic!("expected a count row, got {:?}", other),
        }
    }

    #[test]
    fn test_locked_transaction_survives_start_attempts() {
        let registry = memory_registry();

        registry.start_transaction(Some("outer")).unwrap();
        registry
            .execute("INSERT INTO t (x) VALUES (1)", vec![], false)
            .unwrap();

        // a nested start without the token must not roll the work back
        assert!(registry.start_transaction(None).unwrap());
        assert_eq!(registry.commit_token().as_deref(), Some("outer"));

        registry.commit(Some("outer")).unwrap();
        let q = registry
            .execute("SELECT COUNT(*) AS n FROM t", vec![], true)
            .unwrap();
        match q.result(false).unwrap() {
            QueryOutcome::Row(Some(row)) => assert_eq!(row.get("n"), Some(&Value::Integer(1))),
            other => panic!("expected a count row, got {:?}", other),
        }
    }

    #[test]
    fn test_request_inside_transaction_becomes_rollback() {
        let registry = memory_registry();
        registry
            .execute("INSERT INTO t (tag) VALUES ('dup')", vec![], false)
            .unwrap();

        registry.start_transaction(None).unwrap();
        let err = registry
            .execute("INSERT INTO t (tag) VALUES ('dup')", vec![], false)
            .unwrap_err();

        match &err {
            SqlGateError::Rollback { code, query, .. } => {
                assert_eq!(*code, Some(ERROR_DUPLICATE_KEY));
                assert!(query
                    .as_ref()
                    .unwrap()
                    .text
                    .as_deref()
                    .unwrap()
                    .contains("INSERT INTO t"));
            }
            other => panic!("expected Rollback error, got {:?}", other),
        }
        assert!(!registry.in_transaction());
        assert!(registry.connection().unwrap().is_autocommit());
    }

    #[test]
    fn test_request_outside_transaction_stays_request() {
        let registry = memory_registry();
        registry
            .execute("INSERT INTO t (tag) VALUES ('dup')", vec![], false)
            .unwrap();

        let err = registry
            .execute("INSERT INTO t (tag) VALUES ('dup')", vec![], false)
            .unwrap_err();
        match err {
            SqlGateError::Request { code, .. } => assert_eq!(code, Some(ERROR_DUPLICATE_KEY)),
            other => panic!("expected Request error, got {:?}", other),
        }
    }

    #[test]
    fn test_rollback_without_transaction_is_noop() {
        let registry = memory_registry();
        registry.rollback(None).unwrap();
        // with a cause but no open transaction: still silent
        let cause = SqlGateError::Request {
            message: "x".to_string(),
            code: None,
            query: None,
        };
        registry.rollback(Some(cause)).unwrap();
    }

    #[test]
    fn test_reopen_replaces_connection() {
        let mut registry = memory_registry();
        registry
            .execute("INSERT INTO t (x) VALUES (1)", vec![], false)
            .unwrap();

        // re-opening the same name produces a fresh in-memory database
        registry.open(Some("main"), None).unwrap();
        let q = registry.execute("SELECT 1 AS one", vec![], true).unwrap();
        assert!(matches!(q.result(false), Some(QueryOutcome::Row(Some(_)))));
    }

    #[test]
    fn test_close_drops_state() {
        let mut registry = memory_registry();
        registry.close("main");
        assert_eq!(registry.database(), None);
        assert!(registry.connection().is_err());
    }

    #[test]
    fn test_execute_without_open_fails() {
        let store = CredentialStore::from_json_str("{}").unwrap();
        let registry = ConnectionRegistry::new(store);
        match registry.execute("SELECT 1", vec![], false) {
            Err(SqlGateError::Connection(_)) => {}
            other => panic!("expected Connection error, got {:?}", other),
        };
    }
}
