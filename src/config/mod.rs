use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level node configuration, loaded from TOML with per-field defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_genesis_file")]
    pub genesis_file: String,
    #[serde(default = "default_priv_validator_file")]
    pub priv_validator_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_timeout_propose_ms")]
    pub timeout_propose_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_prevote_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_precommit_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_commit_ms: u64,
    #[serde(default = "default_delta_ms")]
    pub timeout_delta_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_stop_syncing_secs")]
    pub stop_syncing_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObservabilitySection {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen_addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_genesis_file() -> String {
    "genesis.json".to_string()
}
fn default_priv_validator_file() -> String {
    "priv_validator.json".to_string()
}
fn default_timeout_propose_ms() -> u64 {
    3000
}
fn default_timeout_ms() -> u64 {
    1000
}
fn default_delta_ms() -> u64 {
    500
}
fn default_stop_syncing_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_metrics_listen() -> String {
    "0.0.0.0:26660".to_string()
}
fn default_log_format() -> String {
    "plain".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            genesis_file: default_genesis_file(),
            priv_validator_file: default_priv_validator_file(),
        }
    }
}
impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            timeout_propose_ms: default_timeout_propose_ms(),
            timeout_prevote_ms: default_timeout_ms(),
            timeout_precommit_ms: default_timeout_ms(),
            timeout_commit_ms: default_timeout_ms(),
            timeout_delta_ms: default_delta_ms(),
        }
    }
}
impl Default for SyncSection {
    fn default() -> Self {
        Self {
            stop_syncing_secs: default_stop_syncing_secs(),
        }
    }
}
impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_listen_addr: default_metrics_listen(),
        }
    }
}
impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            consensus: ConsensusSection::default(),
            sync: SyncSection::default(),
            observability: ObservabilitySection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
