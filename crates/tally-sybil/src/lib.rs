//! # Tally Anti-Sybil
//!
//! Risk scoring for participant wallets. Detection passes only ever raise a
//! wallet's risk; lowering it is reserved for manual review. Risk maps to a
//! score multiplier through a monotone step function and is pushed to every
//! score row of the wallet's users until their season is snapshotted.
//!
//! ## Signals
//!
//! | Signal | Source | Increment |
//! |--------|--------|-----------|
//! | `zero_transactions` | chain inspector | +0.30 |
//! | `low_balance` | chain inspector | +0.15 |
//! | `no_transaction_history` | chain inspector | +0.20 |
//! | `funding_cluster` | clustering batch | +0.20 at 3+ wallets per funder |
//! | `funding_cluster_5`, `funding_cluster_10` | clustering batch | +0.15 each, up to +0.50 |
//! | `regular_timing_pattern` | event log | +0.15 |
//! | `single_event_type_spam` | event log | +0.15 |

pub mod behavioral;
pub mod clustering;
pub mod evaluator;
pub mod hygiene;
pub mod inspector;

pub use behavioral::behavior_signals;
pub use clustering::{find_clusters, FundingCluster};
pub use evaluator::{ClusteringReport, RaiseOutcome, ReviewDecision, SybilEvaluator, WalletCheck};
pub use hygiene::{wallet_hygiene, HygieneSignal};
pub use inspector::{ChainInspector, StaticInspector, WalletProfile};
