/// Credential resolution for named database connections.
///
/// Credentials live in a JSON file mapping logical database names to
/// connection settings; the file is loaded once per process and cached.
/// For test isolation a `CredentialStore` can also be built directly from a
/// JSON string, bypassing the cache.
use crate::core::error::{Result, SqlGateError};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_CONNECTION_PORT: u16 = 3306;

/// Connection settings for one logical database.
///
/// For the SQLite driver the `db` field is the path actually opened (or
/// `:memory:`); host, user, pass, and port are carried through resolution so
/// a networked driver could sit behind the same credential model.
///
/// Example credentials file:
/// ```json
/// {
///     "rooms_api_dev": {
///         "host": "localhost",
///         "user": "sys",
///         "pass": "",
///         "db": "rooms_api"
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub db: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_CONNECTION_PORT
}

impl Credentials {
    /// The driver connection string these credentials resolve to, for
    /// logging and display.
    pub fn dsn(&self) -> String {
        format!(
            "sqlite://{}:{}/{}?charset=utf8mb4",
            self.host, self.port, self.db
        )
    }
}

/// Overrides applied on top of resolved credentials; explicit values take
/// precedence over the named lookup.
#[derive(Debug, Clone, Default)]
pub struct AltCredentials {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub db: Option<String>,
}

impl AltCredentials {
    pub fn apply(self, mut credentials: Credentials) -> Credentials {
        if let Some(user) = self.user {
            credentials.user = user;
        }
        if let Some(pass) = self.pass {
            credentials.pass = pass;
        }
        if let Some(db) = self.db {
            credentials.db = db;
        }
        credentials
    }
}

/// Name-keyed credential map with an optional default name used when a
/// caller opens a connection without naming one.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: HashMap<String, Credentials>,
    default_name: Option<String>,
}

impl CredentialStore {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: HashMap<String, Credentials> = serde_json::from_str(json)?;
        Ok(CredentialStore {
            entries,
            default_name: None,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Sets the name resolved when no explicit name is given.
    pub fn with_default(mut self, name: &str) -> Self {
        self.default_name = Some(name.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Credentials> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: &str, credentials: Credentials) {
        self.entries.insert(name.to_string(), credentials);
    }

    /// Resolves `name` (or the store default) to its credentials.
    pub fn resolve(&self, name: Option<&str>) -> Result<(String, Credentials)> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.default_name.clone().ok_or_else(|| {
                SqlGateError::Credentials(
                    "no database name given and no default configured".to_string(),
                )
            })?,
        };
        let credentials = self.entries.get(&name).cloned().ok_or_else(|| {
            SqlGateError::Credentials(format!("no credentials for database '{}'", name))
        })?;
        Ok((name, credentials))
    }
}

static DEFAULT_CREDENTIALS: OnceCell<CredentialStore> = OnceCell::new();

/// Loads the process-wide credential store from `path`. A no-op returning
/// the cached store if one was already loaded.
pub fn load_default_credentials<P: AsRef<Path>>(path: P) -> Result<&'static CredentialStore> {
    DEFAULT_CREDENTIALS.get_or_try_init(|| {
        debug!(path = %path.as_ref().display(), "loading default credentials");
        CredentialStore::from_path(path.as_ref())
    })
}

/// The process-wide credential store, if one has been loaded.
pub fn default_credentials() -> Option<&'static CredentialStore> {
    DEFAULT_CREDENTIALS.get()
}
