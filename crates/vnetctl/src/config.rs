use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vnet::AddressPool;

use crate::error::{CtlError, CtlResult};

pub(crate) const DEFAULT_STATE_FILE: &str = "topology.json";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnetConfig {
    /// Persisted topology, read and rewritten by every command.
    pub state_file: PathBuf,
    /// Network links are addressed from, e.g. `10.0.0.0/24`.
    pub network: Option<String>,
    /// Hardware address whose prefix generated MACs share.
    pub mac_seed: Option<String>,
    /// Where supervised processes write their output.
    pub output_dir: PathBuf,
    /// Force (or suppress) running commands through `sudo`.
    pub sudo: Option<bool>,
}

impl Default for VnetConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            network: None,
            mac_seed: None,
            output_dir: std::env::temp_dir(),
            sudo: None,
        }
    }
}

/// Load a config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> CtlResult<VnetConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CtlError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: VnetConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| CtlError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.pool()?;
    Ok(config)
}

impl VnetConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.state_file);
        resolve(&mut self.output_dir);
    }

    /// Address pool described by `network` and `mac_seed`.
    pub fn pool(&self) -> CtlResult<AddressPool> {
        let pool = match &self.network {
            Some(network) => AddressPool::with_network(network)
                .map_err(|e| CtlError::Config(format!("network: {e}")))?,
            None => AddressPool::new(),
        };
        match &self.mac_seed {
            Some(seed) => pool
                .with_mac_seed(seed)
                .map_err(|e| CtlError::Config(format!("mac_seed: {e}"))),
            None => Ok(pool),
        }
    }

    /// Lock file guarding the state file.
    pub fn lock_file(&self) -> PathBuf {
        let mut name = self.state_file.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}
