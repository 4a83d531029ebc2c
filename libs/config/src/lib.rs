use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

/// Default dial timeout for the store connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound for point operations (grant, put, get, delete)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default lease TTL granted on registration
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);
/// Keep-alive interval never goes below this
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Username/password used to authenticate against the store
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// registry config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    endpoints: Vec<String>,
    dial_timeout: Duration,
    operation_timeout: Duration,
    lease_ttl: Duration,
    keep_alive_interval: Duration,
    connect_retry_max: u32,
    credentials: Option<Credentials>,
    path: Option<PathBuf>,
}

impl RegistryConfig {
    /// config with every default applied and the given endpoints
    pub fn new<I, S>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::try_from(wire::Config {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        })
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire = match serde_json::from_str::<wire::Config>(s) {
            Ok(wire) => wire,
            Err(_err) => serde_yaml::from_str::<wire::Config>(s).context("invalid config")?,
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    /// replace the endpoint list, keeping everything else
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = endpoints.into_iter().map(Into::into).collect();
        self.endpoints = validate_endpoints(endpoints)?;
        Ok(self)
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }
    /// lease TTL in the store's unit (whole seconds)
    pub fn lease_ttl_secs(&self) -> i64 {
        // bounded to i64::MAX when the config was built
        i64::try_from(self.lease_ttl.as_secs()).unwrap_or(i64::MAX)
    }
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }
    pub fn connect_retry_max(&self) -> u32 {
        self.connect_retry_max
    }
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TryFrom<wire::Config> for RegistryConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let wire::Config {
            endpoints,
            dial_timeout,
            operation_timeout,
            lease_ttl,
            keep_alive_interval,
            connect_retry_max,
            username,
            password,
        } = cfg;

        let endpoints = validate_endpoints(endpoints)?;
        let dial_timeout = nonzero(dial_timeout, DEFAULT_DIAL_TIMEOUT, "dial_timeout")?;
        let operation_timeout =
            nonzero(operation_timeout, DEFAULT_OPERATION_TIMEOUT, "operation_timeout")?;
        let lease_ttl = nonzero(lease_ttl, DEFAULT_LEASE_TTL, "lease_ttl")?;
        if lease_ttl.subsec_nanos() != 0 {
            bail!("lease_ttl must be a whole number of seconds, got {lease_ttl:?}");
        }
        if i64::try_from(lease_ttl.as_secs()).is_err() {
            bail!("lease_ttl {lease_ttl:?} is too large, at most {} seconds", i64::MAX);
        }

        let keep_alive_interval = match keep_alive_interval {
            Some(interval) => interval.to_duration().context("invalid keep_alive_interval")?,
            None => (lease_ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL),
        };
        if keep_alive_interval.is_zero() || keep_alive_interval >= lease_ttl {
            bail!(
                "keep_alive_interval {keep_alive_interval:?} must be non-zero and shorter than lease_ttl {lease_ttl:?}"
            );
        }

        let credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => bail!("username and password must be configured together"),
        };

        Ok(Self {
            endpoints,
            dial_timeout,
            operation_timeout,
            lease_ttl,
            keep_alive_interval,
            connect_retry_max,
            credentials,
            path: None,
        })
    }
}

fn validate_endpoints(endpoints: Vec<String>) -> Result<Vec<String>> {
    let endpoints = endpoints
        .into_iter()
        .map(|e| e.trim().to_owned())
        .collect::<Vec<_>>();
    if endpoints.is_empty() {
        bail!("at least one store endpoint is required");
    }
    if endpoints.iter().any(|e| e.is_empty()) {
        bail!("store endpoints must not be blank");
    }
    Ok(endpoints)
}

fn nonzero(value: Option<wire::WireDuration>, default: Duration, name: &str) -> Result<Duration> {
    let duration = match value {
        Some(value) => value
            .to_duration()
            .with_context(|| format!("invalid {name}"))?,
        None => default,
    };
    if duration.is_zero() {
        bail!("{name} must be greater than zero");
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static CONFIG_YAML: &str = include_str!("../sample/config.yaml");

    #[test]
    fn test_sample_config() {
        let cfg = RegistryConfig::parse_str(CONFIG_YAML).unwrap();
        assert_eq!(cfg.endpoints(), ["http://127.0.0.1:2379"]);
        assert_eq!(cfg.lease_ttl_secs(), 5);
    }

    #[test]
    fn test_defaults() {
        let cfg = RegistryConfig::new(["127.0.0.1:2379"]).unwrap();
        assert_eq!(cfg.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
        assert_eq!(cfg.operation_timeout(), DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(cfg.lease_ttl_secs(), 5);
        assert_eq!(cfg.keep_alive_interval(), DEFAULT_LEASE_TTL / 3);
        assert_eq!(cfg.connect_retry_max(), 0);
        assert!(cfg.credentials().is_none());
        assert!(cfg.path().is_none());
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        assert!(RegistryConfig::new(Vec::<String>::new()).is_err());
        assert!(RegistryConfig::new(["  "]).is_err());
    }

    #[test]
    fn test_json_config() {
        let cfg = RegistryConfig::parse_str(
            r#"{"endpoints": ["a:2379", "b:2379"], "lease_ttl": "10s", "operation_timeout": "750ms", "connect_retry_max": 3}"#,
        )
        .unwrap();
        assert_eq!(cfg.endpoints().len(), 2);
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(10));
        assert_eq!(cfg.operation_timeout(), Duration::from_millis(750));
        assert_eq!(cfg.connect_retry_max(), 3);
    }

    #[test]
    fn test_fractional_ttl_rejected() {
        let err = RegistryConfig::parse_str("endpoints: [a]\nlease_ttl: 1500ms\n").unwrap_err();
        assert!(format!("{err:#}").contains("whole number of seconds"));
    }

    #[test]
    fn test_ttl_must_fit_store_seconds() {
        for ttl in ["9223372036854775808", "18446744073709551615"] {
            let err = RegistryConfig::parse_str(format!("endpoints: [a]\nlease_ttl: {ttl}\n"))
                .unwrap_err();
            assert!(format!("{err:#}").contains("too large"), "{ttl}: {err:#}");
        }
        let max = RegistryConfig::parse_str("endpoints: [a]\nlease_ttl: 9223372036854775807\n")
            .unwrap();
        assert_eq!(max.lease_ttl_secs(), i64::MAX);
    }

    #[test]
    fn test_keep_alive_must_be_shorter_than_ttl() {
        assert!(
            RegistryConfig::parse_str("endpoints: [a]\nlease_ttl: 5\nkeep_alive_interval: 5s\n")
                .is_err()
        );
        let cfg = RegistryConfig::parse_str("endpoints: [a]\nlease_ttl: 1\n").unwrap();
        assert_eq!(cfg.keep_alive_interval(), MIN_KEEP_ALIVE_INTERVAL);
    }

    #[test]
    fn test_credentials_pairing() {
        assert!(RegistryConfig::parse_str("endpoints: [a]\nusername: root\n").is_err());
        let cfg =
            RegistryConfig::parse_str("endpoints: [a]\nusername: root\npassword: hunter2\n")
                .unwrap();
        let creds = cfg.credentials().unwrap();
        assert_eq!(creds.username, "root");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn test_with_endpoints() {
        let cfg = RegistryConfig::new(["a:2379"])
            .unwrap()
            .with_endpoints(["b:2379", "c:2379"])
            .unwrap();
        assert_eq!(cfg.endpoints(), ["b:2379", "c:2379"]);
        assert!(cfg.clone().with_endpoints(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_parse_missing_file() {
        let err = RegistryConfig::parse("/nonexistent/beacon.yaml").unwrap_err();
        assert!(format!("{err}").contains("failed to find config"));
    }
}
