//! On-chain data source

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tally_core::error::{Result, TallyError};
use tally_core::types::WalletAddress;

/// Read-only view of a chain, typically backed by JSON-RPC
#[async_trait]
pub trait ChainInspector: Send + Sync {
    /// Outgoing transaction count (nonce)
    async fn transaction_count(&self, wallet: &WalletAddress) -> Result<u64>;

    /// Native balance in wei
    async fn balance_wei(&self, wallet: &WalletAddress) -> Result<u128>;

    /// Sender of the wallet's first incoming transfer, if known
    async fn first_funder(&self, wallet: &WalletAddress) -> Result<Option<WalletAddress>>;
}

/// Known facts about one wallet
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletProfile {
    pub transaction_count: u64,
    pub balance_wei: u128,
    pub funder: Option<WalletAddress>,
}

/// Table-backed inspector for tests and offline replay
#[derive(Default)]
pub struct StaticInspector {
    profiles: RwLock<HashMap<WalletAddress, WalletProfile>>,
    unreachable: RwLock<HashSet<WalletAddress>>,
}

impl StaticInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, wallet: WalletAddress, profile: WalletProfile) {
        self.profiles.write().insert(wallet, profile);
    }

    /// Make every lookup for `wallet` fail like a dead RPC endpoint
    pub fn set_unreachable(&self, wallet: WalletAddress) {
        self.unreachable.write().insert(wallet);
    }

    fn profile(&self, wallet: &WalletAddress) -> Result<WalletProfile> {
        if self.unreachable.read().contains(wallet) {
            return Err(TallyError::StorageUnavailable(format!(
                "rpc unreachable for {wallet}"
            )));
        }
        Ok(self.profiles.read().get(wallet).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ChainInspector for StaticInspector {
    async fn transaction_count(&self, wallet: &WalletAddress) -> Result<u64> {
        Ok(self.profile(wallet)?.transaction_count)
    }

    async fn balance_wei(&self, wallet: &WalletAddress) -> Result<u128> {
        Ok(self.profile(wallet)?.balance_wei)
    }

    async fn first_funder(&self, wallet: &WalletAddress) -> Result<Option<WalletAddress>> {
        Ok(self.profile(wallet)?.funder)
    }
}
