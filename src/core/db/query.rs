/// Query Execution Module
///
/// Owns the lifecycle of one logical query: raw text, positional parameters,
/// prepared-statement reuse, and a two-generation history (current and
/// previous) of every execution's text, parameters, and outcome. Queries are
/// created by the connection registry and execute against its live
/// connection.
use crate::core::error::{QuerySnapshot, Result, SqlGateError};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Statement};
use std::collections::HashMap;
use tracing::debug;

/// One fetched row, keyed by column name.
pub type Row = HashMap<String, Value>;

/// Classification of a SQL statement, computed once per execution from the
/// leading keyword and passed explicitly to the run paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    /// Anything else (ALTER, DROP, PRAGMA, ...) - not executed by this layer
    Other,
}

impl StatementKind {
    /// Determines the statement kind from a SQL string, tolerating leading
    /// whitespace and lowercase keywords.
    pub fn from_sql(sql: &str) -> Self {
        let sql_upper = sql.trim().to_uppercase();

        if sql_upper.starts_with("SELECT") {
            StatementKind::Select
        } else if sql_upper.starts_with("INSERT") {
            StatementKind::Insert
        } else if sql_upper.starts_with("UPDATE") {
            StatementKind::Update
        } else if sql_upper.starts_with("DELETE") {
            StatementKind::Delete
        } else if sql_upper.starts_with("CREATE") {
            StatementKind::Create
        } else {
            StatementKind::Other
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Create => "CREATE",
            StatementKind::Other => "execute",
        }
    }
}

/// Result shape of a successful execution, selected by statement kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// All matching rows of a SELECT
    Rows(Vec<Row>),
    /// A single-row SELECT; `None` when no row matched
    Row(Option<Row>),
    /// INSERT/UPDATE/DELETE bookkeeping; `insert_id` is only meaningful
    /// after an INSERT
    Change { insert_id: i64, rows_affected: usize },
    /// A CREATE statement that ran to completion
    Created,
}

/// Stored record of a failed execution: the request-level message wrapping
/// the driver failure that produced it. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryError {
    message: String,
    driver_message: String,
    code: Option<i32>,
}

impl QueryError {
    fn new(message: String, driver_message: String, code: Option<i32>) -> Self {
        QueryError {
            message,
            driver_message,
            code,
        }
    }

    /// The driver's extended error code, when the driver reported one.
    /// Compare against `connection::ERROR_DUPLICATE_KEY` to special-case
    /// unique-constraint violations.
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// The driver-level failure text.
    pub fn driver_message(&self) -> &str {
        &self.driver_message
    }

    /// The request-level failure text.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One generation of execution state. The whole record shifts from current
/// to previous in a single `mem::take`, so the two can never drift apart.
#[derive(Debug, Default)]
struct Generation<'conn> {
    stmt: Option<Statement<'conn>>,
    raw: Option<String>,
    params: Option<Vec<Value>>,
    escaped: bool,
    transaction: Option<bool>,
    outcome: Option<std::result::Result<QueryOutcome, QueryError>>,
}

/// A single logical query with a two-generation execution history.
///
/// Created empty by the registry; the first `execute` call moves it to
/// generation 1. A subsequent call with no query text re-runs the previous
/// generation, reusing its prepared statement (and its parameters, unless
/// new ones are supplied).
#[derive(Debug)]
pub struct Query<'conn> {
    conn: &'conn Connection,
    current: Generation<'conn>,
    previous: Generation<'conn>,
    executions: u32,
}

impl<'conn> Query<'conn> {
    pub(crate) fn new(conn: &'conn Connection) -> Self {
        Query {
            conn,
            current: Generation::default(),
            previous: Generation::default(),
            executions: 0,
        }
    }

    /// Executes a statement against the owning connection.
    ///
    /// Pass `text` alone to run a bare statement, `text` plus `params` to
    /// prepare and bind, or no `text` after a prior execution to re-run the
    /// previous generation (with `params` replacing the previous values for
    /// a prepared statement). `single` narrows a SELECT to at most one row.
    ///
    /// Statement-level failures are stored in the current generation as a
    /// [`QueryError`] and surfaced as `SqlGateError::Request`; rolling back
    /// an enclosing transaction is the registry's concern, not this one's.
    pub fn execute(
        &mut self,
        text: Option<&str>,
        params: Vec<Value>,
        single: bool,
    ) -> Result<&QueryOutcome> {
        if self.executions > 0 {
            self.previous = std::mem::take(&mut self.current);
        }

        self.current.transaction = Some(!self.conn.is_autocommit());

        match text {
            Some(sql) => {
                let kind = StatementKind::from_sql(sql);
                if kind == StatementKind::Other {
                    return Err(SqlGateError::UnsupportedStatement(sql.to_string()));
                }
                self.current.raw = Some(sql.to_string());
                if params.is_empty() {
                    self.current.escaped = false;
                } else {
                    self.current.escaped = true;
                    self.current.params = Some(params);
                }
                self.run(kind, single)?;
            }
            None if self.executions > 0 && self.previous.escaped => {
                let params = if params.is_empty() {
                    self.previous.params.clone().unwrap_or_default()
                } else {
                    params
                };
                self.current.raw = self.previous.raw.clone();
                self.current.escaped = true;
                self.current.params = Some(params);
                self.current.stmt = self.previous.stmt.take();
                if self.current.stmt.is_none() {
                    return Err(self.dispatch_error("no previous prepared statement available"));
                }
                let kind = self.previous_kind()?;
                self.run(kind, single)?;
            }
            None if self.executions > 0 && !self.previous.escaped && params.is_empty() => {
                self.current.raw = self.previous.raw.clone();
                self.current.escaped = false;
                let kind = self.previous_kind()?;
                self.run(kind, single)?;
            }
            None if self.executions > 0 => {
                return Err(self.dispatch_error(
                    "previous query was executed without parameters; pass query text to bind new ones",
                ));
            }
            None => {
                return Err(self.dispatch_error("no query text provided"));
            }
        }

        self.executions += 1;
        match &self.current.outcome {
            Some(Ok(outcome)) => Ok(outcome),
            _ => Err(SqlGateError::Request {
                message: "statement produced no result".to_string(),
                code: None,
                query: Some(self.snapshot()),
            }),
        }
    }

    fn previous_kind(&self) -> Result<StatementKind> {
        match self.current.raw.as_deref() {
            Some(sql) => Ok(StatementKind::from_sql(sql)),
            None => Err(self.dispatch_error("no query text to execute")),
        }
    }

    /// Runs the current generation's statement, preparing it first when no
    /// reusable handle is present.
    fn run(&mut self, kind: StatementKind, single: bool) -> Result<()> {
        let conn = self.conn;

        if self.current.stmt.is_none() {
            let sql = match self.current.raw.clone() {
                Some(sql) => sql,
                None => return Err(self.dispatch_error("no query text to execute")),
            };
            debug!(query = %sql, escaped = self.current.escaped, "preparing statement");
            match conn.prepare(&sql) {
                Ok(stmt) => self.current.stmt = Some(stmt),
                Err(e) => return Err(self.driver_failure(kind, e)),
            }
        }

        let params = self.current.params.take().unwrap_or_default();
        let mut stmt = match self.current.stmt.take() {
            Some(stmt) => stmt,
            None => return Err(self.dispatch_error("no prepared statement to execute")),
        };

        let outcome = run_statement(conn, &mut stmt, kind, &params, single);

        self.current.stmt = Some(stmt);
        if self.current.escaped {
            self.current.params = Some(params);
        }

        match outcome {
            Ok(outcome) => {
                self.current.outcome = Some(Ok(outcome));
                Ok(())
            }
            Err(e) => Err(self.driver_failure(kind, e)),
        }
    }

    fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            text: self.current.raw.clone(),
            params: self.current.params.clone().unwrap_or_default(),
        }
    }

    /// Records a driver failure in the current generation and raises the
    /// request error wrapping it.
    fn driver_failure(&mut self, kind: StatementKind, err: rusqlite::Error) -> SqlGateError {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
            _ => None,
        };
        let message = format!("could not {}: {}", kind.verb(), err);
        self.current.outcome = Some(Err(QueryError::new(
            message.clone(),
            err.to_string(),
            code,
        )));
        SqlGateError::Request {
            message,
            code,
            query: Some(self.snapshot()),
        }
    }

    fn dispatch_error(&self, message: &str) -> SqlGateError {
        SqlGateError::Request {
            message: message.to_string(),
            code: None,
            query: Some(self.snapshot()),
        }
    }

    fn generation(&self, prev: bool) -> &Generation<'conn> {
        if prev {
            &self.previous
        } else {
            &self.current
        }
    }

    /// Number of completed executions.
    pub fn executions(&self) -> u32 {
        self.executions
    }

    /// The stored outcome of the current (or previous) generation, if it
    /// succeeded.
    pub fn result(&self, prev: bool) -> Option<&QueryOutcome> {
        match &self.generation(prev).outcome {
            Some(Ok(outcome)) => Some(outcome),
            _ => None,
        }
    }

    /// The stored error of the current (or previous) generation, if it
    /// failed.
    pub fn error(&self, prev: bool) -> Option<&QueryError> {
        match &self.generation(prev).outcome {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Raw SQL text of the current (or previous) generation.
    pub fn raw_query(&self, prev: bool) -> Option<&str> {
        self.generation(prev).raw.as_deref()
    }

    /// Bound parameters of the current (or previous) generation; absent when
    /// the generation ran without parameter binding.
    pub fn escape_values(&self, prev: bool) -> Option<&[Value]> {
        self.generation(prev).params.as_deref()
    }

    /// Whether the owning connection was inside a transaction when the
    /// generation executed.
    pub fn transaction(&self, prev: bool) -> Option<bool> {
        self.generation(prev).transaction
    }

    /// Prepared-statement handle of the current (or previous) generation.
    pub fn statement(&self, prev: bool) -> Option<&Statement<'conn>> {
        self.generation(prev).stmt.as_ref()
    }

    /// Last-insert id, when the generation's outcome was an
    /// INSERT/UPDATE/DELETE change record.
    pub fn insert_id(&self, prev: bool) -> Option<i64> {
        match self.result(prev) {
            Some(QueryOutcome::Change { insert_id, .. }) => Some(*insert_id),
            _ => None,
        }
    }

    /// Affected-row count, when the generation's outcome was an
    /// INSERT/UPDATE/DELETE change record.
    pub fn affected_rows(&self, prev: bool) -> Option<usize> {
        match self.result(prev) {
            Some(QueryOutcome::Change { rows_affected, .. }) => Some(*rows_affected),
            _ => None,
        }
    }

    /// Debug-only rendering of the generation's text with `?` placeholders
    /// substituted by quoted literal parameter values. NOT injection-safe;
    /// never feed the output back into execution.
    pub fn unsafe_interpolated_query(&self, prev: bool) -> Option<String> {
        let generation = self.generation(prev);
        let raw = generation.raw.as_deref()?;
        if generation.escaped {
            Some(unsafe_fill_escape_values(
                raw,
                generation.params.as_deref().unwrap_or(&[]),
            ))
        } else {
            Some(raw.to_string())
        }
    }
}

impl std::fmt::Display for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw_query(false).unwrap_or(""))
    }
}

/// Runs one statement and shapes its result by kind.
fn run_statement(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    kind: StatementKind,
    params: &[Value],
    single: bool,
) -> std::result::Result<QueryOutcome, rusqlite::Error> {
    match kind {
        StatementKind::Select => {
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            if single {
                match rows.next()? {
                    Some(row) => Ok(QueryOutcome::Row(Some(read_row(&columns, row)?))),
                    None => Ok(QueryOutcome::Row(None)),
                }
            } else {
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(read_row(&columns, row)?);
                }
                Ok(QueryOutcome::Rows(out))
            }
        }
        StatementKind::Insert | StatementKind::Update | StatementKind::Delete => {
            let rows_affected = stmt.execute(params_from_iter(params.iter()))?;
            Ok(QueryOutcome::Change {
                insert_id: conn.last_insert_rowid(),
                rows_affected,
            })
        }
        StatementKind::Create => {
            stmt.execute(params_from_iter(params.iter()))?;
            Ok(QueryOutcome::Created)
        }
        // filtered out before dispatch reaches the driver
        StatementKind::Other => Err(rusqlite::Error::InvalidQuery),
    }
}

fn read_row(
    columns: &[String],
    row: &rusqlite::Row<'_>,
) -> std::result::Result<Row, rusqlite::Error> {
    let mut out = Row::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
        out.insert(name.clone(), owned_value(row.get_ref(i)?));
    }
    Ok(out)
}

fn owned_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// FOR DEVELOPMENT PURPOSES ONLY. Fills `?` placeholders in `query` with the
/// corresponding quoted value from `values`. The output is for logs and
/// debugging; it is not escaped and must never be executed.
pub fn unsafe_fill_escape_values(query: &str, values: &[Value]) -> String {
    let mut out = String::with_capacity(query.len());
    let mut values = values.iter();
    for (i, piece) in query.split('?').enumerate() {
        if i > 0 {
            match values.next() {
                Some(value) => {
                    out.push('"');
                    out.push_str(&value_literal(value));
                    out.push('"');
                }
                None => out.push('?'),
            }
        }
        out.push_str(piece);
    }
    out
}

fn value_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(t) => t.clone(),
        Value::Blob(b) => format!("<BLOB: {} bytes>", b.len()),
    }
}
