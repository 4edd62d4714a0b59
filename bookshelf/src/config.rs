//! Environment-driven configuration.
//!
//! Variables are read from the process environment, seeded from `.env` when present.

use std::str::FromStr;
use std::time::Duration;

use bookshelf_core::{BackoffStrategy, BrokerError, ReconnectPolicy};
use bookshelf_tokio_postgres::{PgConfig, SslMode};
use config::Config as RawConfig;
use serde::Deserialize;

const DEFAULT_API_PORT: u16 = 9000;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: PgConfig,
    pub reconnect: ReconnectPolicy,
    pub api_port: u16,
    pub log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct FlatConfig {
    db_dialect: Option<String>,
    db_username: Option<String>,
    db_pass: Option<String>,
    db_name: Option<String>,
    db_host: Option<String>,
    db_port: Option<String>,
    db_charset: Option<String>,
    db_sslmode: Option<String>,
    db_reconnect_secs: Option<String>,
    db_reconnect_strategy: Option<String>,
    db_reconnect_max_secs: Option<String>,
    db_connect_timeout_secs: Option<String>,
    api_port: Option<String>,
    log_level: Option<String>,
}

/// Collects every problem so one failed start reports all of them.
#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn required(&mut self, name: &str, value: Option<String>) -> String {
        value.unwrap_or_else(|| {
            self.0.push(format!("{name} is not set"));
            String::new()
        })
    }

    fn parse<T: FromStr>(&mut self, name: &str, value: Option<String>, default: T) -> T {
        match value {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                self.0.push(format!("{name} has an invalid value `{raw}`"));
                default
            }),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn load() -> Result<Self, BrokerError> {
        dotenvy::dotenv().ok();
        Self::from_environment(config::Environment::default())
    }

    pub fn from_environment(env: config::Environment) -> Result<Self, BrokerError> {
        let flat: FlatConfig = RawConfig::builder()
            .add_source(env.ignore_empty(true))
            .build()
            .and_then(RawConfig::try_deserialize)
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        flat.resolve()
    }
}

impl FlatConfig {
    fn resolve(self) -> Result<AppConfig, BrokerError> {
        let mut problems = Problems::default();

        let dialect = self.db_dialect.unwrap_or_else(|| "postgres".into());
        if !dialect.eq_ignore_ascii_case("postgres") {
            problems
                .0
                .push(format!("DB_DIALECT `{dialect}` is not supported, use `postgres`"));
        }

        let user = problems.required("DB_USERNAME", self.db_username);
        let password = problems.required("DB_PASS", self.db_pass);
        let dbname = problems.required("DB_NAME", self.db_name);
        let host = problems.required("DB_HOST", self.db_host);
        let port = match self.db_port {
            None => {
                problems.0.push("DB_PORT is not set".into());
                0
            }
            port => problems.parse("DB_PORT", port, 0u16),
        };
        let sslmode = match self.db_sslmode.as_deref().map(SslMode::from_str) {
            None => SslMode::default(),
            Some(Ok(mode)) => mode,
            Some(Err(e)) => {
                problems.0.push(e.to_string());
                SslMode::default()
            }
        };

        let backoff = problems.parse("DB_RECONNECT_SECS", self.db_reconnect_secs, 10u64);
        let max = problems.parse(
            "DB_RECONNECT_MAX_SECS",
            self.db_reconnect_max_secs,
            DEFAULT_RECONNECT_MAX_SECS,
        );
        let strategy = match self
            .db_reconnect_strategy
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("fixed") => BackoffStrategy::Fixed,
            Some("exponential") => BackoffStrategy::Exponential {
                max: Duration::from_secs(max),
            },
            Some(other) => {
                problems.0.push(format!(
                    "DB_RECONNECT_STRATEGY must be `fixed` or `exponential`, got `{other}`"
                ));
                BackoffStrategy::Fixed
            }
        };
        let connect_timeout = problems.parse("DB_CONNECT_TIMEOUT_SECS", self.db_connect_timeout_secs, 5u64);
        let api_port = problems.parse("API_PORT", self.api_port, DEFAULT_API_PORT);

        if !problems.0.is_empty() {
            return Err(BrokerError::Configuration(problems.0.join(", ")));
        }

        let database = PgConfig {
            user,
            password,
            dbname,
            host,
            port,
            charset: self.db_charset.unwrap_or_else(|| "utf8".into()),
            sslmode,
        };
        database.validate()?;

        Ok(AppConfig {
            database,
            reconnect: ReconnectPolicy {
                backoff: Duration::from_secs(backoff),
                strategy,
                connect_timeout: Duration::from_secs(connect_timeout),
            },
            api_port,
            log_level: self.log_level.unwrap_or_else(|| "info".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().source(Some(map))
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DB_USERNAME", "books"),
        ("DB_PASS", "secret"),
        ("DB_NAME", "library"),
        ("DB_HOST", "localhost"),
        ("DB_PORT", "5432"),
    ];

    #[test]
    fn defaults_apply_to_optional_variables() {
        let cfg = AppConfig::from_environment(env(REQUIRED)).unwrap();
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.database.charset, "utf8");
        assert_eq!(cfg.database.sslmode, SslMode::Disable);
        assert_eq!(cfg.api_port, 9000);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn optional_variables_override_defaults() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("DB_SSLMODE", "prefer"),
            ("API_PORT", "8080"),
            ("LOG_LEVEL", "debug"),
            ("DB_RECONNECT_SECS", "2"),
            ("DB_RECONNECT_STRATEGY", "exponential"),
            ("DB_RECONNECT_MAX_SECS", "60"),
            ("DB_CONNECT_TIMEOUT_SECS", "1"),
        ]);
        let cfg = AppConfig::from_environment(env(&vars)).unwrap();
        assert_eq!(cfg.database.sslmode, SslMode::Prefer);
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.reconnect.backoff, Duration::from_secs(2));
        assert_eq!(
            cfg.reconnect.strategy,
            BackoffStrategy::Exponential {
                max: Duration::from_secs(60)
            }
        );
        assert_eq!(cfg.reconnect.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn missing_and_invalid_variables_are_all_reported() {
        let err = AppConfig::from_environment(env(&[
            ("DB_USERNAME", "books"),
            ("DB_PORT", "not-a-port"),
            ("DB_DIALECT", "mysql"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
        let msg = err.to_string();
        for name in ["DB_PASS", "DB_NAME", "DB_HOST", "DB_PORT", "DB_DIALECT"] {
            assert!(msg.contains(name), "{name} missing from `{msg}`");
        }
        assert!(!msg.contains("DB_USERNAME"));
    }
}
