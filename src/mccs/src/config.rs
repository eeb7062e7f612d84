use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::transport::{DEFAULT_BUFFER_SIZE, NUM_PROTOCOLS};

pub const DEFAULT_MAX_ASYNC_OPS: usize = 128;
pub const DEFAULT_P2P_NET_THRESHOLD: usize = 131072;
pub const DEFAULT_SENDRECV_SLICE_FACTOR: usize = 4;

pub const ENV_P2P_NET_THRESHOLD: &str = "MCCS_P2P_NET_THRESHOLD";
pub const ENV_MAX_ASYNC_OPS: &str = "MCCS_MAX_ASYNC_OPS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultCommConfig {
    #[serde(rename = "buffer_sizes")]
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub channel_count: u32,
    pub p2p_channel_count: u32,
    pub p2p_channels_per_peer: u32,
    // route large P2P transfers through the proxied network connection
    pub p2p_net: bool,
    pub p2p_net_threshold: usize,
    pub sendrecv_slice_factor: usize,
}

impl Default for DefaultCommConfig {
    fn default() -> Self {
        DefaultCommConfig {
            buf_sizes: [DEFAULT_BUFFER_SIZE],
            channel_count: 2,
            p2p_channel_count: 4,
            p2p_channels_per_peer: 2,
            p2p_net: true,
            p2p_net_threshold: DEFAULT_P2P_NET_THRESHOLD,
            sendrecv_slice_factor: DEFAULT_SENDRECV_SLICE_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Capacity of the pending operation list of one group.
    pub max_async_ops: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            max_async_ops: DEFAULT_MAX_ASYNC_OPS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub comm_default_config: DefaultCommConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides thresholds from the environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(threshold) = parse_env(ENV_P2P_NET_THRESHOLD)? {
            self.comm_default_config.p2p_net_threshold = threshold;
        }
        if let Some(max_ops) = parse_env::<usize>(ENV_MAX_ASYNC_OPS)? {
            if max_ops == 0 {
                anyhow::bail!("{} must be positive", ENV_MAX_ASYNC_OPS);
            }
            self.group.max_async_ops = max_ops;
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, value, e))?;
            log::info!("{} overridden to {}", key, value.trim());
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("invalid {}: {}", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[group]
max_async_ops = 16

[comm_default_config]
buffer_sizes = [65536]
p2p_net = false
"#
        )
        .unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.group.max_async_ops, 16);
        assert_eq!(config.comm_default_config.buf_sizes, [65536]);
        assert!(!config.comm_default_config.p2p_net);
        assert_eq!(config.comm_default_config.channel_count, 2);
        assert_eq!(config.comm_default_config.sendrecv_slice_factor, 4);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\nport = 1").unwrap();
        assert!(Config::from_path(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::from_path(dir.path().join("mccs.toml")).is_err());
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.group.max_async_ops, 128);
        assert_eq!(config.comm_default_config.p2p_net_threshold, 131072);
        assert_eq!(config.comm_default_config.buf_sizes, [1 << 22]);
    }
}
