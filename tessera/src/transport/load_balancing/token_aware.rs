use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan, Statement};
use crate::transport::{cluster::ClusterData, node::Node};
use crate::transport::topology::Strategy;

use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// A wrapper load balancing policy that adds token awareness to a child policy.
///
/// When a statement has a token, the replica set computed from the ring and
/// the keyspace's strategy is yielded first (shuffled to spread load across
/// replicas), then the child policy's plan follows as a fallback tail.
pub struct TokenAwarePolicy {
    child_policy: Box<dyn ChildLoadBalancingPolicy>,
    shuffle_replicas: bool,
}

impl TokenAwarePolicy {
    pub fn new(child_policy: Box<dyn ChildLoadBalancingPolicy>) -> Self {
        Self {
            child_policy,
            shuffle_replicas: true,
        }
    }

    /// Controls whether replicas are shuffled or always tried in ring order.
    /// Ring order concentrates load on primary replicas but gives more
    /// predictable plans.
    pub fn set_shuffle_replicas(&mut self, shuffle_replicas: bool) {
        self.shuffle_replicas = shuffle_replicas;
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn plan<'a>(&self, statement: &Statement, cluster: &'a ClusterData) -> Plan<'a> {
        match &statement.token {
            Some(token) => {
                let keyspace = statement
                    .keyspace
                    .as_ref()
                    .and_then(|keyspace_name| cluster.keyspaces.get(keyspace_name));

                let default_strategy = Strategy::SimpleStrategy {
                    replication_factor: 1,
                };
                let strategy = keyspace.map(|k| &k.strategy).unwrap_or(&default_strategy);

                let mut replicas: Vec<Arc<Node>> = cluster
                    .replica_locator()
                    .replicas_for_token(token, strategy)
                    .into_iter()
                    .filter(|node| node.is_up())
                    .collect();

                let replica_ids: HashSet<Uuid> =
                    replicas.iter().map(|node| node.host_id).collect();

                let replicas: Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> =
                    if self.shuffle_replicas {
                        replicas.shuffle(&mut thread_rng());
                        Box::new(replicas.into_iter())
                    } else {
                        // Let the child policy decide the order among replicas.
                        self.child_policy.apply_child_policy(replicas)
                    };

                // The rest of the child's plan serves as the tail, with
                // replicas excluded so that the plan never repeats a node.
                let tail = self
                    .child_policy
                    .plan(statement, cluster)
                    .filter(move |node| !replica_ids.contains(&node.host_id));

                Box::new(replicas.chain(tail))
            }
            // Fall back to the child policy when there is nothing to route by.
            None => self.child_policy.plan(statement, cluster),
        }
    }

    fn name(&self) -> String {
        format!(
            "TokenAwarePolicy{{child_policy: {}}}",
            self.child_policy.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Token;
    use crate::transport::load_balancing::tests::{
        plan_ids, mock_cluster_data,
    };
    use crate::transport::load_balancing::RoundRobinPolicy;
    use crate::transport::node::tests::mock_node;
    use std::collections::HashMap;

    fn token_aware_no_shuffle() -> TokenAwarePolicy {
        let mut policy = TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new()));
        // Tests need deterministic plans.
        policy.set_shuffle_replicas(false);
        policy
    }

    #[test]
    fn replicas_come_first_in_ring_order() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r1"));
        let cluster = mock_cluster_data(
            vec![(100, a), (200, b), (300, c)],
            vec![(
                "ks_rf2",
                Strategy::SimpleStrategy {
                    replication_factor: 2,
                },
            )],
        );

        let policy = token_aware_no_shuffle();
        let statement = Statement {
            token: Some(Token::Murmur3(150)),
            keyspace: Some("ks_rf2".to_string()),
        };

        let plan = plan_ids(&policy, &statement, &cluster);
        // Replicas for token 150 with RF=2: nodes 2 and 3; node 1 trails.
        assert_eq!(&plan[..2], &[2, 3]);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn expected_replica_set_for_rf3_keyspace() {
        // The first three nodes of the plan are exactly the replica set.
        let nodes: Vec<_> = (1..=5)
            .map(|i| mock_node(i, Some("dc1"), Some("r1")))
            .collect();
        let ring = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (100 * (i as i64 + 1), n.clone()))
            .collect();
        let cluster = mock_cluster_data(
            ring,
            vec![(
                "ks_rf3",
                Strategy::SimpleStrategy {
                    replication_factor: 3,
                },
            )],
        );

        let policy = token_aware_no_shuffle();
        let statement = Statement {
            token: Some(Token::Murmur3(250)),
            keyspace: Some("ks_rf3".to_string()),
        };

        let plan = plan_ids(&policy, &statement, &cluster);
        assert_eq!(&plan[..3], &[3, 4, 5]);
        // The tail covers the rest of the ring without repeats.
        let mut sorted = plan.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn network_topology_strategy_replicas_first() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc2"), Some("r1"));
        let c = mock_node(3, Some("dc1"), Some("r2"));
        let d = mock_node(4, Some("dc2"), Some("r2"));
        let cluster = mock_cluster_data(
            vec![(100, a), (200, b), (300, c), (400, d)],
            vec![("ks_nts", {
                let mut datacenter_repfactors = HashMap::new();
                datacenter_repfactors.insert("dc1".to_string(), 1);
                datacenter_repfactors.insert("dc2".to_string(), 1);
                Strategy::NetworkTopologyStrategy {
                    datacenter_repfactors,
                }
            })],
        );

        let policy = token_aware_no_shuffle();
        let statement = Statement {
            token: Some(Token::Murmur3(50)),
            keyspace: Some("ks_nts".to_string()),
        };

        let plan = plan_ids(&policy, &statement, &cluster);
        // One replica per datacenter, in ring order: 1 (dc1), 2 (dc2).
        assert_eq!(&plan[..2], &[1, 2]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn no_token_delegates_to_child() {
        let a = mock_node(1, Some("dc1"), Some("r1"));
        let b = mock_node(2, Some("dc1"), Some("r1"));
        let cluster = mock_cluster_data(vec![(100, a), (200, b)], vec![]);

        let policy = token_aware_no_shuffle();
        let plan = plan_ids(
            &policy,
            &Statement {
                token: None,
                keyspace: None,
            },
            &cluster,
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn shuffled_replicas_are_a_permutation_of_the_replica_set() {
        let nodes: Vec<_> = (1..=4)
            .map(|i| mock_node(i, Some("dc1"), Some("r1")))
            .collect();
        let ring = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (100 * (i as i64 + 1), n.clone()))
            .collect();
        let cluster = mock_cluster_data(
            ring,
            vec![(
                "ks_rf3",
                Strategy::SimpleStrategy {
                    replication_factor: 3,
                },
            )],
        );

        let policy = TokenAwarePolicy::new(Box::new(RoundRobinPolicy::new()));
        let statement = Statement {
            token: Some(Token::Murmur3(150)),
            keyspace: Some("ks_rf3".to_string()),
        };

        for _ in 0..16 {
            let plan = plan_ids(&policy, &statement, &cluster);
            let mut replicas = plan[..3].to_vec();
            replicas.sort_unstable();
            assert_eq!(replicas, vec![2, 3, 4]);
        }
    }
}
