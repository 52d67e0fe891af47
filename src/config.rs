use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("both CHAIRTIME_TLS_CERT and CHAIRTIME_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `CHAIRTIME_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "chairtime".into(),
            max_connections: 256,
            compact_threshold: 1000,
            reaper_interval: Duration::from_secs(60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_connections = parsed(&get, "CHAIRTIME_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Zero("CHAIRTIME_MAX_CONNECTIONS"));
        }
        let compact_threshold = parsed(&get, "CHAIRTIME_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold);
        if compact_threshold == 0 {
            return Err(ConfigError::Zero("CHAIRTIME_COMPACT_THRESHOLD"));
        }
        let reaper_interval = match parsed::<u64>(&get, "CHAIRTIME_REAPER_INTERVAL_SECS")? {
            Some(0) => return Err(ConfigError::Zero("CHAIRTIME_REAPER_INTERVAL_SECS")),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.reaper_interval,
        };

        let tls_cert = get("CHAIRTIME_TLS_CERT");
        let tls_key = get("CHAIRTIME_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parsed(&get, "CHAIRTIME_PORT")?.unwrap_or(defaults.port),
            bind: get("CHAIRTIME_BIND").unwrap_or(defaults.bind),
            data_dir: get("CHAIRTIME_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("CHAIRTIME_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold,
            reaper_interval,
            metrics_port: parsed(&get, "CHAIRTIME_METRICS_PORT")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
