use super::ring::TokenRing;
use super::Token;
use crate::transport::node::Node;
use crate::transport::topology::Strategy;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Computes replica sets for tokens from the ring and a keyspace's
/// replication strategy.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    ring: TokenRing<Arc<Node>>,
    unique_nodes_in_global_ring: Vec<Arc<Node>>,
    datacenters: HashMap<String, Datacenter>,
}

#[derive(Debug, Clone)]
pub struct Datacenter {
    pub unique_nodes_in_dc_ring: Vec<Arc<Node>>,
    /// Number of distinct racks in this datacenter, counting nodes
    /// with no rack as one collective rack.
    pub rack_count: usize,
}

impl ReplicaLocator {
    pub(crate) fn empty() -> Self {
        Self {
            ring: TokenRing::empty(),
            unique_nodes_in_global_ring: Vec::new(),
            datacenters: HashMap::new(),
        }
    }

    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<Node>)>) -> Self {
        let ring = TokenRing::new(ring_iter);

        let unique_nodes_in_global_ring: Vec<Arc<Node>> = ring
            .iter()
            .map(|(_t, n)| n.clone())
            .unique()
            .sorted_by(|a, b| a.host_id.cmp(&b.host_id))
            .collect();

        let mut datacenters: HashMap<String, Datacenter> = HashMap::new();
        for node in unique_nodes_in_global_ring.iter() {
            if let Some(dc) = &node.datacenter {
                let entry = datacenters.entry(dc.clone()).or_insert_with(|| Datacenter {
                    unique_nodes_in_dc_ring: Vec::new(),
                    rack_count: 0,
                });
                entry.unique_nodes_in_dc_ring.push(node.clone());
            }
        }
        for datacenter in datacenters.values_mut() {
            datacenter.rack_count = datacenter
                .unique_nodes_in_dc_ring
                .iter()
                .map(|node| node.rack.as_deref())
                .unique()
                .count();
        }

        Self {
            ring,
            unique_nodes_in_global_ring,
            datacenters,
        }
    }

    pub fn token_ring(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    pub fn unique_nodes_in_global_ring(&self) -> &[Arc<Node>] {
        &self.unique_nodes_in_global_ring
    }

    pub fn unique_nodes_in_datacenter_ring(&self, datacenter: &str) -> Option<&[Arc<Node>]> {
        self.datacenters
            .get(datacenter)
            .map(|dc| dc.unique_nodes_in_dc_ring.as_slice())
    }

    pub fn datacenter_names(&self) -> impl Iterator<Item = &str> {
        self.datacenters.keys().map(|s| s.as_str())
    }

    /// Returns the replica set of the given token under the given strategy,
    /// in ring order (the primary replica first).
    pub fn replicas_for_token(&self, token: &Token, strategy: &Strategy) -> Vec<Arc<Node>> {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => {
                self.simple_strategy_replicas(token, *replication_factor)
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => self.network_topology_strategy_replicas(token, datacenter_repfactors),
            // LocalStrategy and unknown strategies degrade to the primary replica.
            Strategy::LocalStrategy | Strategy::Other { .. } => {
                self.simple_strategy_replicas(token, 1)
            }
        }
    }

    fn simple_strategy_replicas(&self, token: &Token, replication_factor: usize) -> Vec<Arc<Node>> {
        self.ring
            .walk_from(token)
            .unique()
            .take(replication_factor)
            .cloned()
            .collect()
    }

    // Walks the ring once, giving every datacenter its configured number
    // of replicas. Within a datacenter, a rack that already supplied a
    // replica is passed over while unrepresented racks remain; each
    // datacenter may repeat racks only (rf - rack count) times, which is
    // exactly the surplus left once every rack hosts one replica.
    fn network_topology_strategy_replicas(
        &self,
        token: &Token,
        datacenter_repfactors: &HashMap<String, usize>,
    ) -> Vec<Arc<Node>> {
        struct DcProgress<'a> {
            wanted: usize,
            picked: usize,
            racks_used: HashSet<Option<&'a str>>,
            rack_repeats_left: usize,
        }

        let mut progress: HashMap<&str, DcProgress> = datacenter_repfactors
            .iter()
            .map(|(name, replication_factor)| {
                let rack_count = self
                    .datacenters
                    .get(name)
                    .map(|dc| dc.rack_count)
                    .unwrap_or(0);
                let state = DcProgress {
                    wanted: *replication_factor,
                    picked: 0,
                    racks_used: HashSet::new(),
                    rack_repeats_left: replication_factor.saturating_sub(rack_count),
                };
                (name.as_str(), state)
            })
            .collect();

        let wanted_total: usize = datacenter_repfactors.values().sum();
        let mut replicas: Vec<Arc<Node>> = Vec::with_capacity(wanted_total);

        for node in self.ring.walk_from(token).unique() {
            if replicas.len() == wanted_total {
                break;
            }

            // Nodes outside any configured datacenter never replicate.
            let Some(dc_name) = node.datacenter.as_deref() else {
                continue;
            };
            let Some(dc) = progress.get_mut(dc_name) else {
                continue;
            };
            if dc.picked == dc.wanted {
                continue;
            }

            let rack = node.rack.as_deref();
            let rack_is_fresh = dc.racks_used.insert(rack);
            if !rack_is_fresh {
                if dc.rack_repeats_left == 0 {
                    continue;
                }
                dc.rack_repeats_left -= 1;
            }

            dc.picked += 1;
            replicas.push(node.clone());
        }

        replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::node::tests::mock_node;

    fn ring_with(entries: &[(i64, &Arc<Node>)]) -> ReplicaLocator {
        ReplicaLocator::new(
            entries
                .iter()
                .map(|(t, n)| (Token::Murmur3(*t), (*n).clone())),
        )
    }

    #[test]
    fn simple_strategy_walks_the_ring() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r1"));
        let locator = ring_with(&[(100, &a), (200, &b), (300, &c)]);

        let strategy = Strategy::SimpleStrategy {
            replication_factor: 2,
        };

        let replicas = locator.replicas_for_token(&Token::Murmur3(150), &strategy);
        assert_eq!(replicas, vec![b.clone(), c.clone()]);

        // Wrap-around
        let replicas = locator.replicas_for_token(&Token::Murmur3(301), &strategy);
        assert_eq!(replicas, vec![a.clone(), b.clone()]);
    }

    #[test]
    fn simple_strategy_skips_duplicate_nodes() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        // Node `a` owns two tokens in a row.
        let locator = ring_with(&[(100, &a), (200, &a), (300, &b)]);

        let strategy = Strategy::SimpleStrategy {
            replication_factor: 2,
        };
        let replicas = locator.replicas_for_token(&Token::Murmur3(50), &strategy);
        assert_eq!(replicas, vec![a, b]);
    }

    #[test]
    fn network_topology_strategy_collects_per_dc() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc2"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r2"));
        let d = mock_node(4, Some("dc2"), Some("r2"));
        let locator = ring_with(&[(100, &a), (200, &b), (300, &c), (400, &d)]);

        let mut repfactors = HashMap::new();
        repfactors.insert("dc1".to_string(), 2);
        repfactors.insert("dc2".to_string(), 1);
        let strategy = Strategy::NetworkTopologyStrategy {
            datacenter_repfactors: repfactors,
        };

        let replicas = locator.replicas_for_token(&Token::Murmur3(50), &strategy);
        assert_eq!(replicas.len(), 3);
        assert_eq!(
            replicas
                .iter()
                .filter(|n| n.datacenter.as_deref() == Some("dc1"))
                .count(),
            2
        );
        assert_eq!(
            replicas
                .iter()
                .filter(|n| n.datacenter.as_deref() == Some("dc2"))
                .count(),
            1
        );
        // Ring order is preserved: primary replica first.
        assert_eq!(replicas[0], a);
    }

    #[test]
    fn network_topology_strategy_prefers_distinct_racks() {
        // Two nodes in r1, one in r2; with RF=2 the r2 node must be picked
        // over the second r1 node even though it is further on the ring.
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r2"));
        let locator = ring_with(&[(100, &a), (200, &b), (300, &c)]);

        let mut repfactors = HashMap::new();
        repfactors.insert("dc1".to_string(), 2);
        let strategy = Strategy::NetworkTopologyStrategy {
            datacenter_repfactors: repfactors,
        };

        let replicas = locator.replicas_for_token(&Token::Murmur3(50), &strategy);
        assert_eq!(replicas, vec![a.clone(), c.clone()]);
    }

    #[test]
    fn network_topology_strategy_allows_rack_repeats_when_rf_exceeds_racks() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r2"));
        let locator = ring_with(&[(100, &a), (200, &b), (300, &c)]);

        let mut repfactors = HashMap::new();
        repfactors.insert("dc1".to_string(), 3);
        let strategy = Strategy::NetworkTopologyStrategy {
            datacenter_repfactors: repfactors,
        };

        let replicas = locator.replicas_for_token(&Token::Murmur3(50), &strategy);
        assert_eq!(replicas, vec![a, b, c]);
    }

    #[test]
    fn local_strategy_returns_primary_replica() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let locator = ring_with(&[(100, &a), (200, &b)]);

        let replicas = locator.replicas_for_token(&Token::Murmur3(150), &Strategy::LocalStrategy);
        assert_eq!(replicas, vec![b]);
    }
}
