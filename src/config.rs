//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub product: ProductConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

/// Which product stream to collect. Row keys are built as
/// `<tag>::<version>:<minute>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductConfig {
    pub tag: String,
    pub version: String,
    /// Column-qualifier prefix holding the located counters.
    #[serde(default = "default_column_prefix")]
    pub column_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Root of the snapshot tree the dashboard polls.
    pub json_root: PathBuf,
    /// Primary checkpoint file; the backup lives next to it as `<path>.bak`.
    pub checkpoint: PathBuf,
    /// The `{country: continent}` reference table.
    pub continents: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Seconds past the minute boundary before reading that minute's data,
    /// so the store's own ingestion has settled.
    #[serde(default = "default_settle_second")]
    pub settle_second: u32,
    /// Snapshot cadence advertised to the dashboard.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Days of snapshot directories the cleanup sweep keeps.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Minutes fetched per store scan during catch-up replay.
    #[serde(default = "default_catchup_chunk")]
    pub catchup_chunk: u32,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_column_prefix() -> String {
    "location:".to_string()
}

fn default_settle_second() -> u32 {
    15
}

fn default_interval_secs() -> u64 {
    60
}

fn default_retention_days() -> i64 {
    2
}

fn default_catchup_chunk() -> u32 {
    60
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            settle_second: default_settle_second(),
            interval_secs: default_interval_secs(),
            retention_days: default_retention_days(),
            catchup_chunk: default_catchup_chunk(),
        }
    }
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("EMBER").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.host.is_empty() {
            anyhow::bail!("Store host cannot be empty");
        }
        if self.store.port == 0 {
            anyhow::bail!("Invalid store port: 0 is not allowed");
        }

        if self.product.tag.is_empty() || self.product.version.is_empty() {
            anyhow::bail!("Product tag and version cannot be empty");
        }

        if self.collector.settle_second >= 60 {
            anyhow::bail!(
                "Invalid settle_second {}: must be below 60",
                self.collector.settle_second
            );
        }
        if self.collector.interval_secs == 0 {
            anyhow::bail!("Invalid interval_secs: 0 is not allowed");
        }
        if self.collector.retention_days < 1 {
            anyhow::bail!(
                "Invalid retention_days {}: must be at least 1",
                self.collector.retention_days
            );
        }
        if self.collector.catchup_chunk == 0 || self.collector.catchup_chunk > 100 {
            anyhow::bail!(
                "Invalid catchup_chunk {}: must be between 1 and 100",
                self.collector.catchup_chunk
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            store: StoreConfig {
                host: "localhost".into(),
                port: 9090,
                connect_timeout_secs: 10,
                read_timeout_secs: 30,
            },
            product: ProductConfig {
                tag: "firefox".into(),
                version: "4.0".into(),
                column_prefix: "location:".into(),
            },
            paths: PathsConfig {
                json_root: "json".into(),
                checkpoint: "ember.ckpt".into(),
                continents: "continents.json".into(),
            },
            collector: CollectorConfig::default(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = valid();
        config.store.port = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.collector.settle_second = 60;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.product.tag.clear();
        assert!(config.validate().is_err());
    }
}
