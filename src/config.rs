//! Indexer configuration and subscription list loading
//!
//! Settings come from an optional TOML file, overridden by command-line flags
//! which also read `INDEXER_*` environment variables.

use crate::bootstrap::DEFAULT_SUB_LIMIT;
use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::processor::DEFAULT_NEW_SUBSCRIPTION_LIMIT;
use crate::records::{parse_address, Subscription};
use crate::rpc::DEFAULT_BATCH_SIZE as DEFAULT_RPC_BATCH_SIZE;
use crate::watcher::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL};
use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Indexer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub rpc_url: String,
    pub db_path: PathBuf,
    /// First block to index on an empty database
    pub start_block: u64,
    pub poll_interval_secs: u64,
    /// Blocks per pipeline batch
    pub batch_size: u64,
    /// Requests per JSON-RPC batch
    pub rpc_batch_size: usize,
    pub cache_capacity: usize,
    /// Subscriptions per bootstrap page
    pub sub_limit: u64,
    /// New subscriptions picked up per block
    pub new_subscription_limit: u64,
    pub log_level: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            db_path: PathBuf::from("./index_db"),
            start_block: 0,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            batch_size: DEFAULT_BATCH_SIZE,
            rpc_batch_size: DEFAULT_RPC_BATCH_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            sub_limit: DEFAULT_SUB_LIMIT,
            new_subscription_limit: DEFAULT_NEW_SUBSCRIPTION_LIMIT,
            log_level: "info".to_string(),
        }
    }
}

impl IndexerConfig {
    /// Load settings from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            anyhow::bail!("rpc_url must not be empty");
        }
        if self.batch_size == 0 || self.rpc_batch_size == 0 {
            anyhow::bail!("batch sizes must be positive");
        }
        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be positive");
        }
        if self.sub_limit == 0 || self.new_subscription_limit == 0 {
            anyhow::bail!("subscription limits must be positive");
        }
        Ok(())
    }
}

/// Command-line overrides for [`IndexerConfig`].
#[derive(Debug, Default, Args)]
pub struct ConfigArgs {
    /// Path to a TOML config file
    #[arg(short, long, env = "INDEXER_CONFIG")]
    pub config: Option<PathBuf>,

    /// RPC endpoint URL
    #[arg(short, long, env = "INDEXER_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Path to RocksDB database directory
    #[arg(short, long, env = "INDEXER_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// First block to index on an empty database
    #[arg(long, env = "INDEXER_START_BLOCK")]
    pub start_block: Option<u64>,

    /// Head polling interval in seconds
    #[arg(long, env = "INDEXER_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Blocks per pipeline batch
    #[arg(long, env = "INDEXER_BATCH_SIZE")]
    pub batch_size: Option<u64>,

    /// ARC cache capacity per object kind
    #[arg(long, env = "INDEXER_CACHE_CAPACITY")]
    pub cache_capacity: Option<usize>,

    /// Log level filter used when RUST_LOG is unset
    #[arg(long, env = "INDEXER_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    /// Load the config file if given, then apply flag overrides.
    pub fn resolve(&self) -> Result<IndexerConfig> {
        let mut config = match &self.config {
            Some(path) => IndexerConfig::load(path)?,
            None => IndexerConfig::default(),
        };

        if let Some(rpc_url) = &self.rpc_url {
            config.rpc_url = rpc_url.clone();
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Some(start_block) = self.start_block {
            config.start_block = start_block;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(capacity) = self.cache_capacity {
            config.cache_capacity = capacity;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Load subscriptions from a file.
///
/// Each line holds an address, optionally followed by a comma and a group id
/// (group 0 when omitted). Empty lines and lines starting with '#' are ignored.
///
/// # Example file format:
/// ```text
/// 0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb,1
/// 0xdAC17F958D2ee523a2206206994597C13D831ec7
/// # This is a comment
/// ```
pub fn load_subscriptions(path: &Path) -> Result<Vec<Subscription>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read subscription file: {:?}", path))?;

    let mut subscriptions = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (address, group) = match line.split_once(',') {
            Some((address, group)) => {
                let group = group.trim().parse::<u64>().with_context(|| {
                    format!("Invalid group on line {}: {}", line_num + 1, line)
                })?;
                (address, group)
            }
            None => (line, 0),
        };
        let address = parse_address(address)
            .with_context(|| format!("Invalid address on line {}: {}", line_num + 1, line))?;

        subscriptions.push(Subscription::new(address, group));
    }

    if subscriptions.is_empty() {
        anyhow::bail!("Subscription file is empty (no valid addresses found)");
    }

    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_subscriptions() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb, 7").unwrap();
        writeln!(file, "# This is a comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "0xdAC17F958D2ee523a2206206994597C13D831ec7").unwrap();
        file.flush().unwrap();

        let subs = load_subscriptions(file.path()).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].address, address!("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb"));
        assert_eq!(subs[0].group, 7);
        assert_eq!(subs[1].group, 0);
        assert!(subs.iter().all(|s| s.is_new()));
    }

    #[test]
    fn test_load_subscriptions_rejects_bad_lines() {
        let file = NamedTempFile::new().unwrap();
        assert!(load_subscriptions(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0xdAC17F958D2ee523a2206206994597C13D831ec7,abc").unwrap();
        file.flush().unwrap();
        assert!(load_subscriptions(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x1234").unwrap();
        file.flush().unwrap();
        assert!(load_subscriptions(file.path()).is_err());
    }

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rpc_url = \"http://node:8545\"").unwrap();
        writeln!(file, "start_block = 17000000").unwrap();
        writeln!(file, "sub_limit = 50").unwrap();
        file.flush().unwrap();

        let config = IndexerConfig::load(file.path()).unwrap();
        assert_eq!(config.rpc_url, "http://node:8545");
        assert_eq!(config.start_block, 17_000_000);
        assert_eq!(config.sub_limit, 50);
        assert_eq!(config.cache_capacity, 128);
        assert_eq!(config.new_subscription_limit, 900);
        assert_eq!(config.poll_interval(), Duration::from_secs(12));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rpc_urls = \"http://node:8545\"").unwrap();
        file.flush().unwrap();
        assert!(IndexerConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "rpc_url = \"http://node:8545\"").unwrap();
        writeln!(file, "batch_size = 5").unwrap();
        file.flush().unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            batch_size: Some(20),
            db_path: Some(PathBuf::from("/tmp/db")),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.rpc_url, "http://node:8545");
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.db_path, PathBuf::from("/tmp/db"));

        let zero = ConfigArgs {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(zero.resolve().is_err());
    }
}
