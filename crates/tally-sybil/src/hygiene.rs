//! Wallet hygiene checks
//!
//! Every check fails open: an inspector error means the check passes.

use crate::inspector::ChainInspector;
use tally_core::config::SybilConfig;
use tally_core::types::WalletAddress;
use tracing::debug;

pub const ZERO_TRANSACTIONS: &str = "zero_transactions";
pub const LOW_BALANCE: &str = "low_balance";
pub const NO_TRANSACTION_HISTORY: &str = "no_transaction_history";

/// A failed check and the risk it adds
#[derive(Clone, Debug, PartialEq)]
pub struct HygieneSignal {
    pub flag: String,
    pub increment: f64,
}

/// Run all hygiene checks for one wallet
pub async fn wallet_hygiene(
    inspector: &dyn ChainInspector,
    wallet: &WalletAddress,
    config: &SybilConfig,
) -> Vec<HygieneSignal> {
    let (tx_count, balance) = tokio::join!(
        inspector.transaction_count(wallet),
        inspector.balance_wei(wallet)
    );

    let mut signals = Vec::new();
    match tx_count {
        Ok(0) => {
            signals.push(HygieneSignal {
                flag: ZERO_TRANSACTIONS.to_string(),
                increment: config.zero_transactions_increment,
            });
            signals.push(HygieneSignal {
                flag: NO_TRANSACTION_HISTORY.to_string(),
                increment: config.no_history_increment,
            });
        }
        Ok(_) => {}
        Err(e) => debug!(wallet = %wallet, "Transaction count unavailable, passing: {}", e),
    }
    match balance {
        Ok(wei) if wei < config.min_balance_wei as u128 => signals.push(HygieneSignal {
            flag: LOW_BALANCE.to_string(),
            increment: config.low_balance_increment,
        }),
        Ok(_) => {}
        Err(e) => debug!(wallet = %wallet, "Balance unavailable, passing: {}", e),
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::{StaticInspector, WalletProfile};

    fn wallet(n: u8) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_wallet_fails_all_checks() {
        let inspector = StaticInspector::new();
        let signals = wallet_hygiene(&inspector, &wallet(1), &SybilConfig::default()).await;
        let flags: Vec<&str> = signals.iter().map(|s| s.flag.as_str()).collect();
        assert_eq!(flags, vec![ZERO_TRANSACTIONS, NO_TRANSACTION_HISTORY, LOW_BALANCE]);
        let total: f64 = signals.iter().map(|s| s.increment).sum();
        assert!((total - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_healthy_wallet_passes() {
        let inspector = StaticInspector::new();
        inspector.insert(
            wallet(2),
            WalletProfile {
                transaction_count: 40,
                balance_wei: 5_000_000_000_000_000,
                funder: None,
            },
        );
        let signals = wallet_hygiene(&inspector, &wallet(2), &SybilConfig::default()).await;
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failure_fails_open() {
        let inspector = StaticInspector::new();
        inspector.set_unreachable(wallet(3));
        let signals = wallet_hygiene(&inspector, &wallet(3), &SybilConfig::default()).await;
        assert!(signals.is_empty());
    }
}
