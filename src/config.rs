//! Configuration: an optional YAML file layered under environment
//! variables, resolved once at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pair::Pair;

fn default_data_root() -> String {
    std::env::var("DATA_ROOT").unwrap_or_else(|_| "/data".to_string())
}

fn default_file_name_pattern() -> String {
    std::env::var("DATA_FILE_NAME_PATTERN").unwrap_or_else(|_| "{name}_{ts}.json.gz".to_string())
}

fn default_snapshot_period_s() -> u64 {
    std::env::var("SNAPSHOT_PERIOD_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Deserialize)]
struct RawCurrencyPair {
    base: String,
    quote: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    default_currency_pair: Option<RawCurrencyPair>,
    port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: String,
    pub file_name_pattern: String,
    pub snapshot_period_s: u64,
    pub default_currency_pair: Pair,
    pub port: u16,
}

impl Config {
    /// Loads the optional YAML file at `path` (if given) and layers the
    /// environment on top. `default_currency_pair` is required, either
    /// from the file or falling back to BTC/USDT.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let raw: RawConfig = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&text)
                    .map_err(|e| Error::Decode(format!("invalid config file: {e}")))?
            }
            None => RawConfig::default(),
        };

        let default_currency_pair = match raw.default_currency_pair {
            Some(p) => Pair::new(p.base, p.quote),
            None => Pair::new("btc", "usdt"),
        };

        Ok(Self {
            data_root: default_data_root(),
            file_name_pattern: default_file_name_pattern(),
            snapshot_period_s: default_snapshot_period_s(),
            default_currency_pair,
            port: raw.port.unwrap_or_else(default_port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.default_currency_pair.symbol(), "btcusdt");
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn load_reads_currency_pair_and_port_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "default_currency_pair:\n  base: eth\n  quote: usdt\nport: 8080\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.default_currency_pair.symbol(), "ethusdt");
        assert_eq!(config.port, 8080);
    }
}
