//! Parse from either cli or env var

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
pub use clap::Parser;
use clap::Subcommand;
use config::RegistryConfig;

/// endpoint used when neither the cli nor a config file names one
pub static DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
/// default log level. Can use this argument or BEACON_LOG env var
pub const DEFAULT_BEACON_LOG: &str = "info";
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "beacon-worker";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "beacon", bin_name = "beacon", about, long_about = None)]
/// register and discover services in etcd
pub struct Config {
    /// etcd endpoints, comma separated. Overrides endpoints from the config file
    #[clap(long, env = "BEACON_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Vec<String>,
    /// path to a registry config (yaml or json)
    #[clap(short, long, env = "BEACON_CONFIG_PATH", value_parser)]
    pub config_path: Option<PathBuf>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env = "BEACON_LOG", value_parser, default_value = DEFAULT_BEACON_LOG)]
    pub log: String,
    /// Worker thread count, defaults to the number of logical CPUs
    #[clap(long, env = "BEACON_THREADS", value_parser)]
    pub threads: Option<usize>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// register a key and keep it alive until interrupted
    Register {
        key: String,
        value: String,
        /// how often to re-publish the value, defaults to the lease ttl
        #[clap(long, value_parser = config::wire::parse_duration)]
        refresh: Option<Duration>,
    },
    /// print the value of a key
    Get { key: String },
    /// print every `key=value` under a prefix
    List { prefix: String },
    /// print changes to a key until interrupted
    Watch {
        key: String,
        /// watch every key under `key`
        #[clap(long)]
        prefix: bool,
    },
}

impl Config {
    /// Build the registry config from the config file (if any) and the
    /// endpoint flags, which take precedence.
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        match (&self.config_path, self.endpoints.is_empty()) {
            (Some(path), true) => RegistryConfig::parse(path),
            (Some(path), false) => {
                RegistryConfig::parse(path)?.with_endpoints(self.endpoints.iter().cloned())
            }
            (None, true) => RegistryConfig::new([DEFAULT_ENDPOINT]),
            (None, false) => RegistryConfig::new(self.endpoints.iter().cloned()),
        }
    }
}
