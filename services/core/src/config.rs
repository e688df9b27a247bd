use std::str::FromStr;

use sqlx::postgres::PgConnectOptions;

use crate::error::ConfigError;

/// Rows per commit when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Connection settings for the chart database.
///
/// `DB_URL` wins when present; otherwise the discrete `DATABASE_*` variables
/// are used, each with a local default.
#[derive(Debug, Clone, PartialEq)]
pub enum DbConfig {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

impl DbConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DbConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DB_URL").filter(|u| !u.trim().is_empty()) {
            return Ok(Self::Url(url));
        }

        let port = match lookup("DATABASE_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
                var: "DATABASE_PORT",
                value: raw.clone(),
            })?,
            None => 5432,
        };

        Ok(Self::Parts {
            host: lookup("DATABASE_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            database: lookup("DATABASE_NAME").unwrap_or_else(|| "postgres".to_string()),
            user: lookup("DATABASE_USER").unwrap_or_else(|| "postgres".to_string()),
            password: lookup("DATABASE_PASSWORD").unwrap_or_else(|| "postgres".to_string()),
        })
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        match self {
            Self::Url(url) => PgConnectOptions::from_str(url).map_err(ConfigError::InvalidUrl),
            Self::Parts {
                host,
                port,
                database,
                user,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)),
        }
    }

    /// Printable target without credentials.
    pub fn describe(&self) -> String {
        match self {
            Self::Url(_) => "DB_URL".to_string(),
            Self::Parts {
                host,
                port,
                database,
                user,
                ..
            } => format!("{}@{}:{}/{}", user, host, port, database),
        }
    }
}
