// src/config.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Node configuration, written by `init` and read by `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub name: String,
    pub node_id: String,
    /// Gossip listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub bootstrap_nodes: Vec<String>,
    pub tags: Vec<String>,
    pub data_dir: String,
    /// The genesis leader orders the ledger and signs escrow releases.
    pub is_genesis_node: bool,
    #[serde(default = "default_genesis_supply")]
    pub genesis_supply: i64,
    #[serde(default = "default_token")]
    pub token: String,
    /// Flat fee charged on capsule and task publishes; 0 disables it.
    #[serde(default = "default_publish_fee")]
    pub publish_fee: i64,
    #[serde(default = "default_confirmation_target")]
    pub confirmation_target: u64,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    pub created_at: String,
}

fn default_genesis_supply() -> i64 {
    1_000_000
}

fn default_token() -> String {
    "MESH".to_string()
}

fn default_publish_fee() -> i64 {
    1
}

fn default_confirmation_target() -> u64 {
    1
}

fn default_confirm_timeout_ms() -> u64 {
    15_000
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".capsule-mesh.json")
    }

    pub fn load(path: Option<PathBuf>) -> Option<Self> {
        let file = path.unwrap_or_else(Self::default_path);
        let text = fs::read_to_string(file).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn save(&self, path: Option<PathBuf>) -> std::io::Result<()> {
        let file = path.unwrap_or_else(Self::default_path);
        let text = serde_json::to_string_pretty(self).expect("config serializes");
        let tmp = file.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(tmp, file)
    }

    pub fn wallet_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("wallet.json")
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("db")
    }

    pub fn peers_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("peers.json")
    }
}
