//! tracing configuration
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Output format of the log lines, chosen with `LOG_FORMAT`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// unstructured single-line output
    #[default]
    Standard,
    /// multi-line human readable output
    Pretty,
    /// one json object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => Ok(LogFormat::Standard),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{other}', expected standard, pretty or json"),
        }
    }
}

/// Logging setup
#[derive(Debug)]
pub struct Config {
    pub format: LogFormat,
}

impl Config {
    /// Install the global subscriber. Level comes from `beacon_log`, format
    /// from `LOG_FORMAT`
    pub fn parse(beacon_log: &str) -> Result<Self> {
        let format = match std::env::var("LOG_FORMAT") {
            Ok(frmt) => frmt.parse().context("LOG_FORMAT")?,
            Err(std::env::VarError::NotPresent) => LogFormat::default(),
            Err(err) => return Err(err).context("LOG_FORMAT"),
        };

        // etcd-client's grpc transport logs every frame below warn
        let filter = EnvFilter::try_new(beacon_log)
            .or_else(|_| EnvFilter::try_new("info"))?
            .add_directive("h2=off".parse()?)
            .add_directive("tower=off".parse()?);

        // stdout carries command output
        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new())
                        .with_writer(std::io::stderr),
                )
                .init(),
            LogFormat::Standard => registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .init(),
        }

        Ok(Self { format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" Pretty ".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Standard);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
