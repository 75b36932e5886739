//! Funding-source clustering
//!
//! Funders point at the wallets they first funded in a directed funding
//! graph. A cluster is the set of registered wallets one funder points at;
//! chains through intermediate wallets do not merge clusters.

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use tally_core::types::WalletAddress;

/// One group of wallets that share a first funder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingCluster {
    /// Deterministic id derived from the funder
    pub cluster_id: String,
    pub funder: WalletAddress,
    /// Registered wallets funded by `funder`, ascending
    pub members: Vec<WalletAddress>,
}

/// Group `funding` (each registered wallet with its known first funder) into
/// clusters of at least `min_size` wallets
pub fn find_clusters(
    funding: &[(WalletAddress, Option<WalletAddress>)],
    min_size: usize,
) -> Vec<FundingCluster> {
    let mut graph: DiGraphMap<&WalletAddress, ()> = DiGraphMap::new();
    for (wallet, funder) in funding {
        if let Some(funder) = funder {
            if funder != wallet {
                graph.add_edge(funder, wallet, ());
            }
        }
    }

    let mut clusters: Vec<FundingCluster> = graph
        .nodes()
        .filter_map(|funder| {
            let mut members: Vec<WalletAddress> = graph
                .neighbors_directed(funder, Direction::Outgoing)
                .cloned()
                .collect();
            if members.len() < min_size {
                return None;
            }
            members.sort();
            Some(FundingCluster {
                cluster_id: cluster_id(funder),
                funder: funder.clone(),
                members,
            })
        })
        .collect();
    clusters.sort_by(|a, b| a.funder.cmp(&b.funder));
    clusters
}

fn cluster_id(funder: &WalletAddress) -> String {
    let digest = tally_crypto::derive("tally sybil cluster v1", funder.as_str().as_bytes());
    format!("cl-{}", hex::encode(&digest[..8]))
}
