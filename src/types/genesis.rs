use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{hex, PubKey};
use crate::types::Address;

/// Genesis file: chain id, bootstrap validators and funded accounts.
/// Byte fields are hex strings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub chain_id: String,
    /// Microseconds since the Unix epoch.
    #[serde(default)]
    pub genesis_time: i64,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: String,
    pub amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: String,
    pub amount: u64,
}

impl GenesisDoc {
    pub fn from_json(bytes: &[u8]) -> Result<GenesisDoc> {
        let doc: GenesisDoc = serde_json::from_slice(bytes).context("parse genesis json")?;
        if doc.validators.is_empty() {
            anyhow::bail!("genesis has no validators");
        }
        Ok(doc)
    }

    pub fn from_file(path: &Path) -> Result<GenesisDoc> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read genesis file {}", path.display()))?;
        GenesisDoc::from_json(&bytes)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl GenesisValidator {
    pub fn parsed_pub_key(&self) -> Result<PubKey> {
        let bytes = hex::decode_array::<32>(&self.pub_key)
            .ok_or_else(|| anyhow::anyhow!("bad validator pub key hex"))?;
        Ok(PubKey(bytes))
    }
}

impl GenesisAccount {
    pub fn parsed_address(&self) -> Result<Address> {
        let bytes = hex::decode_array::<20>(&self.address)
            .ok_or_else(|| anyhow::anyhow!("bad account address hex"))?;
        Ok(Address(bytes))
    }
}
