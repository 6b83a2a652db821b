use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::identity::{Account, DEFAULT_HASH_COST, Directory, IdentityError};
use crate::model::Role;

/// Runtime settings, read from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// JSON account list; see [`crate::identity::Directory::load`].
    pub accounts_file: Option<PathBuf>,
    pub admin_user: String,
    /// Bootstrap administrator is only created when this is set.
    pub admin_password: Option<String>,
    /// bcrypt cost for the bootstrap administrator's hash.
    pub password_cost: u32,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

/// `None` when unset; a set but unparsable value names its variable.
fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| value.parse().map_err(|_| ConfigError { var, value }))
        .transpose()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            port: parsed(&lookup, "SLOTD_PORT")?.unwrap_or(5433),
            bind: lookup("SLOTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SLOTD_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            accounts_file: lookup("SLOTD_ACCOUNTS").map(PathBuf::from),
            admin_user: lookup("SLOTD_ADMIN_USER").unwrap_or_else(|| "admin".into()),
            admin_password: lookup("SLOTD_ADMIN_PASSWORD"),
            password_cost: parsed(&lookup, "SLOTD_PASSWORD_COST")?.unwrap_or(DEFAULT_HASH_COST),
            max_connections: parsed(&lookup, "SLOTD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: lookup("SLOTD_TLS_CERT"),
            tls_key: lookup("SLOTD_TLS_KEY"),
            metrics_port: parsed(&lookup, "SLOTD_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotd.wal")
    }

    /// Accounts from `SLOTD_ACCOUNTS`, plus the bootstrap administrator if a
    /// password was given for it.
    pub fn directory(&self) -> Result<Directory, IdentityError> {
        let mut directory = match &self.accounts_file {
            Some(path) => Directory::load(path)?,
            None => Directory::default(),
        };
        if let Some(password) = &self.admin_password {
            directory.insert(Account::with_password(
                directory.next_id(),
                self.admin_user.clone(),
                password,
                Role::Admin,
                self.password_cost,
            )?)?;
        }
        Ok(directory)
    }
}
