//! Environment-driven configuration.
//!
//! [`Settings::from_env`] loads an optional `.env` file, then reads:
//!
//! | Variable | Default |
//! |---|---|
//! | `SERVICE_NAME` | `fulcrum` |
//! | `LOG_LEVEL` | `debug` |
//! | `HOST` | `0.0.0.0` |
//! | `PORT` | `5000` |
//! | `APP_ENV` | `development` |
//! | `DEV_LATENCY_WARNING_MS` | `500` |
//! | `DEV_LATENCY_ERROR_MS` | `2000` |
//! | `GIT_COMMIT` | unset |
//!
//! Concern middlewares read their own variables through the same [`Env`]
//! lookup, so every default can be overridden explicitly in code.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::compose::LatencyThresholds;
use crate::error::Error;

// ── Runtime mode ──────────────────────────────────────────────────────────────

/// Selected by `APP_ENV`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RuntimeMode {
    #[default]
    Development,
    Test,
    Production,
}

impl RuntimeMode {
    /// Development and test both get diagnostics: latency logging, stack
    /// traces in failure bodies, permissive CORS defaults, non-secure cookies.
    pub fn is_development(self) -> bool {
        !matches!(self, Self::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test        => "test",
            Self::Production  => "production",
        }
    }
}

impl FromStr for RuntimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown runtime mode `{other}`")),
        }
    }
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Env lookup ────────────────────────────────────────────────────────────────

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// A variable source. Process environment by default; a map in tests.
#[derive(Clone)]
pub struct Env(Arc<Lookup>);

impl Env {
    /// The process environment, after loading `.env` if present.
    pub fn process() -> Self {
        dotenvy::dotenv().ok();
        Self(Arc::new(|name: &str| std::env::var(name).ok()))
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let map: std::collections::HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Self(Arc::new(move |name: &str| map.get(name).cloned()))
    }

    /// A set, non-empty variable.
    pub fn var(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    /// A comma-separated list. Unset means empty.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.var(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parses a variable, falling back to `default` when unset.
    pub fn parse<T>(&self, name: &str, default: T) -> Result<T, Error>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.var(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("{name}: {e}"))),
        }
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Env")
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Process-level settings.
#[derive(Clone, Debug)]
pub struct Settings {
    pub service_name: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
    pub mode: RuntimeMode,
    pub latency: LatencyThresholds,
    pub git_commit: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "fulcrum".to_owned(),
            log_level: "debug".to_owned(),
            host: "0.0.0.0".to_owned(),
            port: 5000,
            mode: RuntimeMode::Development,
            latency: LatencyThresholds::default(),
            git_commit: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(&Env::process())
    }

    pub fn from_lookup(env: &Env) -> Result<Self, Error> {
        let defaults = Self::default();
        let warn_ms: u64 = env.parse("DEV_LATENCY_WARNING_MS", 500)?;
        let error_ms: u64 = env.parse("DEV_LATENCY_ERROR_MS", 2000)?;
        Ok(Self {
            service_name: env.var("SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: env.var("LOG_LEVEL").unwrap_or(defaults.log_level),
            host: env.var("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT", defaults.port)?,
            mode: env.parse("APP_ENV", defaults.mode)?,
            latency: LatencyThresholds {
                warn_at: Duration::from_millis(warn_ms),
                error_at: Duration::from_millis(error_ms),
            },
            git_commit: env.var("GIT_COMMIT"),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::config(format!("HOST/PORT: {e}")))
    }
}
