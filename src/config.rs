// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration
//!
//! Read once from the environment (a `.env` file is honored) and validated up
//! front. Any bad value stops startup with `GateError::Config`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gate_core::policy::{DEFAULT_BLOCKED_SCHEMAS, DEFAULT_MAX_ROWS, DEFAULT_SCHEMA, DEFAULT_TIMEOUT_SECS};
use gate_core::{parse_identifier, GateError, GateResult, PolicySnapshot, QualifiedName};
use gate_drivers::postgres::{parse_ssl_mode, DEFAULT_APPLICATION_NAME};
use gate_drivers::PostgresConfig;
use sqlx::postgres::PgSslMode;

use crate::observability::{default_log_directory, Sensitive};

const DEFAULT_AUDIT_LOG_PATH: &str = "querygate_audit.jsonl";
const DEFAULT_POOL_MIN: u32 = 2;
const DEFAULT_POOL_MAX: u32 = 10;

/// Where to connect and as whom
#[derive(Debug, Clone)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Sensitive<String>,
    pub ssl_mode: PgSslMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_idle: u32,
    pub max_size: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_idle: DEFAULT_POOL_MIN,
            max_size: DEFAULT_POOL_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database: DatabaseTarget,
    pub policy: PolicySnapshot,
    pub pool: PoolSettings,
    pub audit_log_path: PathBuf,
    pub log_dir: PathBuf,
}

impl GatewayConfig {
    /// Loads `.env` (if any) and reads the process environment
    pub fn from_env() -> GateResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(GateError::config(format!("failed to read .env: {}", e)));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> GateResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database = DatabaseTarget {
            host: get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or("POSTGRES_PORT", get("POSTGRES_PORT"), 5432u16)?,
            database: get("POSTGRES_DATABASE").unwrap_or_else(|| "postgres".to_string()),
            username: get("POSTGRES_USER").unwrap_or_else(|| "postgres".to_string()),
            // passwords may legitimately carry surrounding spaces
            password: Sensitive::new(lookup("POSTGRES_PASSWORD").unwrap_or_default()),
            ssl_mode: match get("POSTGRES_SSL") {
                Some(raw) => parse_ssl_mode(&raw)?,
                None => PgSslMode::Prefer,
            },
        };

        let default_schema = match get("DEFAULT_SCHEMA") {
            Some(raw) => identifier("DEFAULT_SCHEMA", &raw)?,
            None => DEFAULT_SCHEMA.to_string(),
        };

        let max_rows = parse_or("MAX_ROWS_LIMIT", get("MAX_ROWS_LIMIT"), DEFAULT_MAX_ROWS)?;
        if max_rows == 0 {
            return Err(GateError::config("MAX_ROWS_LIMIT must be at least 1"));
        }

        let timeout_secs = parse_or(
            "QUERY_TIMEOUT_SECONDS",
            get("QUERY_TIMEOUT_SECONDS"),
            DEFAULT_TIMEOUT_SECS as f64,
        )?;
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(GateError::config("QUERY_TIMEOUT_SECONDS must be greater than 0"));
        }
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|e| GateError::config(format!("QUERY_TIMEOUT_SECONDS: {}", e)))?;

        let allowed_tables = match get("ALLOWED_TABLES") {
            Some(raw) => parse_allowed_tables(&raw, &default_schema)?,
            None => BTreeSet::new(),
        };

        let blocked_schemas = match get("BLOCKED_SCHEMAS") {
            Some(raw) => split_list(&raw)
                .map(|s| identifier("BLOCKED_SCHEMAS", s))
                .collect::<GateResult<BTreeSet<_>>>()?,
            None => DEFAULT_BLOCKED_SCHEMAS.iter().map(|s| s.to_string()).collect(),
        };

        let audit_enabled = match get("ENABLE_AUDIT_LOG") {
            Some(raw) => parse_bool("ENABLE_AUDIT_LOG", &raw)?,
            None => true,
        };

        let pool = PoolSettings {
            min_idle: parse_or("POOL_MIN_CONNECTIONS", get("POOL_MIN_CONNECTIONS"), DEFAULT_POOL_MIN)?,
            max_size: parse_or("POOL_MAX_CONNECTIONS", get("POOL_MAX_CONNECTIONS"), DEFAULT_POOL_MAX)?,
        };
        if pool.max_size == 0 {
            return Err(GateError::config("POOL_MAX_CONNECTIONS must be at least 1"));
        }
        if pool.min_idle > pool.max_size {
            return Err(GateError::config(format!(
                "POOL_MIN_CONNECTIONS ({}) exceeds POOL_MAX_CONNECTIONS ({})",
                pool.min_idle, pool.max_size
            )));
        }

        Ok(Self {
            database,
            policy: PolicySnapshot {
                max_rows,
                timeout,
                allowed_tables,
                blocked_schemas,
                audit_enabled,
                default_schema,
            },
            pool,
            audit_log_path: get("AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG_PATH)),
            log_dir: get("QUERYGATE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_log_directory),
        })
    }

    /// Driver settings for the configured target
    ///
    /// The server-side statement timeout mirrors the policy timeout.
    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.database.host.clone(),
            port: self.database.port,
            database: self.database.database.clone(),
            username: self.database.username.clone(),
            password: self.database.password.expose().clone(),
            ssl_mode: self.database.ssl_mode,
            statement_timeout: self.policy.timeout,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_allowed_tables(raw: &str, default_schema: &str) -> GateResult<BTreeSet<QualifiedName>> {
    split_list(raw)
        .map(|entry| {
            QualifiedName::parse(entry)
                .map(|name| name.resolve(default_schema))
                .map_err(|e| GateError::config(format!("ALLOWED_TABLES: {}", e)))
        })
        .collect()
}

fn identifier(key: &str, raw: &str) -> GateResult<String> {
    parse_identifier(raw).map_err(|e| GateError::config(format!("{}: {}", key, e)))
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> GateResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e| GateError::config(format!("{} has invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> GateResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(GateError::config(format!(
            "{} has invalid value '{}': expected true or false",
            key, raw
        ))),
    }
}
