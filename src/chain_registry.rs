//! Chain Registry.
//!
//! A static per-chain parameter table: bridge selector, router address,
//! native gas token decimals, explorer URL. Built once at startup from
//! config and handed out read-only (no component mutates it afterwards).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ConfigError;
use crate::model::{ChainId, ChainSelector};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub chain_id: ChainId,
    pub name: String,
    pub chain_selector: ChainSelector,
    pub router_address: String,
    pub link_token_address: String,
    pub explorer_url: String,
    pub native_decimals: u8,
    /// Gas price ceiling (native gas units) above which Signal Agent
    /// suppresses opportunities and Automation refuses to submit (spec
    /// §4.4 rule 3, §4.7 condition 4).
    pub gas_ceiling: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    by_chain_id: BTreeMap<ChainId, ChainEntry>,
    selector_to_chain: BTreeMap<ChainSelector, ChainId>,
}

impl ChainRegistry {
    pub fn build(entries: Vec<ChainEntry>) -> Result<Self, ConfigError> {
        let mut by_chain_id = BTreeMap::new();
        let mut selector_to_chain = BTreeMap::new();

        for entry in entries {
            if by_chain_id.contains_key(&entry.chain_id) {
                return Err(ConfigError(format!(
                    "duplicate chain id {} in chain registry",
                    entry.chain_id
                )));
            }
            if selector_to_chain.contains_key(&entry.chain_selector) {
                return Err(ConfigError(format!(
                    "duplicate chain selector {} in chain registry",
                    entry.chain_selector
                )));
            }
            selector_to_chain.insert(entry.chain_selector, entry.chain_id);
            by_chain_id.insert(entry.chain_id, entry);
        }

        Ok(Self {
            by_chain_id,
            selector_to_chain,
        })
    }

    pub fn get(&self, chain_id: ChainId) -> Option<&ChainEntry> {
        self.by_chain_id.get(&chain_id)
    }

    pub fn selector_for(&self, chain_id: ChainId) -> Option<ChainSelector> {
        self.by_chain_id.get(&chain_id).map(|e| e.chain_selector)
    }

    pub fn chain_for_selector(&self, selector: ChainSelector) -> Option<ChainId> {
        self.selector_to_chain.get(&selector).copied()
    }

    pub fn gas_ceiling(&self, chain_id: ChainId) -> Option<u64> {
        self.by_chain_id.get(&chain_id).map(|e| e.gas_ceiling)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.by_chain_id.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_chain_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chain_id.is_empty()
    }
}
