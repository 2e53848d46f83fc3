//! Database connection settings from the environment.

use std::env;

use anyhow::{Context, Result};
use log::{debug, info};
use postgres::{Client, NoTls};

use crate::error::IngestError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "pegasus";
pub const DEFAULT_USER: &str = "asega";
pub const DEFAULT_APPLICATION_NAME: &str = "site-ingest";

#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub application_name: String,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl DbConfig {
    /// Loads `.env` when present, then reads the `PG*` variables.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {path:?}"),
            Err(err) if err.not_found() => {}
            Err(err) => return Err(err).context("Reading .env file"),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through `lookup`; blank values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let port = match lookup("PGPORT").filter(|value| !value.trim().is_empty()) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                IngestError::InvalidOption(format!("PGPORT must be a port number, got '{raw}'"))
            })?,
            None => DEFAULT_PORT,
        };
        Ok(Self {
            host: read("PGHOST", DEFAULT_HOST),
            port,
            database: read("PGDATABASE", DEFAULT_DATABASE),
            user: read("PGUSER", DEFAULT_USER),
            password: lookup("PGPASSWORD").unwrap_or_default(),
            application_name: read("PGAPPNAME", DEFAULT_APPLICATION_NAME),
        })
    }

    pub fn connect(&self) -> Result<Client> {
        info!(
            "Connecting to {}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        );
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .application_name(&self.application_name);
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config.connect(NoTls).with_context(|| {
            format!(
                "Connecting to {}:{}/{} as {}",
                self.host, self.port, self.database, self.user
            )
        })
    }
}
