//! Configuration loading and representation.
//!
//! Everything is read once at process start and handed to the components that
//! need it. Nothing below consults the environment again after construction.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Max claims per tick.
    pub batch_size: usize,
    pub tick_interval: Duration,
    /// How often the recovery sweep runs.
    pub recovery_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            tick_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(30),
        }
    }
}

/// MailerSend client settings. Missing credentials are allowed here; the
/// provider reports them on every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailerSendConfig {
    pub api_key: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub subject: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for MailerSendConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from_email: None,
            from_name: None,
            subject: "Your OTP code".to_string(),
            base_url: "https://api.mailersend.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub worker: WorkerConfig,
    pub mailersend: MailerSendConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            // Only an explicit "false" turns the worker off.
            enabled: get("NOTIF_WORKER_ENABLED").is_none_or(|v| v.trim() != "false"),
            batch_size: parse_or(
                "NOTIF_WORKER_BATCH_SIZE",
                get("NOTIF_WORKER_BATCH_SIZE"),
                "a positive integer",
                worker_defaults.batch_size,
                |n: &usize| *n > 0,
            )?,
            tick_interval: millis_or(
                "NOTIF_WORKER_INTERVAL_MS",
                get("NOTIF_WORKER_INTERVAL_MS"),
                worker_defaults.tick_interval,
            )?,
            recovery_interval: millis_or(
                "NOTIF_RECOVERY_INTERVAL_MS",
                get("NOTIF_RECOVERY_INTERVAL_MS"),
                worker_defaults.recovery_interval,
            )?,
        };

        let mail_defaults = MailerSendConfig::default();
        let mailersend = MailerSendConfig {
            api_key: get("MAILERSEND_API_KEY"),
            from_email: get("MAILERSEND_FROM_EMAIL"),
            from_name: get("MAILERSEND_FROM_NAME"),
            subject: get("MAILERSEND_SUBJECT").unwrap_or(mail_defaults.subject),
            base_url: get("MAILERSEND_BASE_URL").unwrap_or(mail_defaults.base_url),
            timeout: millis_or(
                "MAILERSEND_TIMEOUT_MS",
                get("MAILERSEND_TIMEOUT_MS"),
                mail_defaults.timeout,
            )?,
        };

        let bind_addr = match get("HERALD_BIND_ADDR") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "HERALD_BIND_ADDR",
                expected: "a socket address",
                value: raw,
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        Ok(Self {
            bind_addr,
            database_url: get("DATABASE_URL"),
            worker,
            mailersend,
        })
    }
}

fn parse_or<T, P>(
    var: &'static str,
    raw: Option<String>,
    expected: &'static str,
    default: T,
    valid: P,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    P: Fn(&T) -> bool,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Ok(value),
        _ => Err(ConfigError::Invalid {
            var,
            expected,
            value: raw,
        }),
    }
}

fn millis_or(
    var: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(var, raw, "a positive number of milliseconds", default_ms, |ms: &u64| {
        *ms > 0
    })
    .map(Duration::from_millis)
}
