//! Serialized (on-disk) form of the registry configuration.
//!
//! Everything here is optional so a config file can be as small as a list of
//! endpoints; defaults and validation are applied when converting into
//! [`RegistryConfig`].
//!
//! [`RegistryConfig`]: crate::RegistryConfig

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// top-level config type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub dial_timeout: Option<WireDuration>,
    pub operation_timeout: Option<WireDuration>,
    pub lease_ttl: Option<WireDuration>,
    pub keep_alive_interval: Option<WireDuration>,
    #[serde(default)]
    pub connect_retry_max: u32,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A duration given either as bare seconds or as a string with a unit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            WireDuration::String(s) => parse_duration(s),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "5", "5s", "500ms", "1m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num
        .parse::<u64>()
        .with_context(|| format!("invalid number in duration '{s}'"))?;

    let millis_per_unit: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}
