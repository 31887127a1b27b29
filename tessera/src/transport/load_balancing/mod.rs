//! Host selection policies.
//!
//! A policy turns a statement plus the current cluster snapshot into a
//! plan: a finite, non-repeating sequence of candidate nodes, best first.

mod dc_aware_round_robin;
mod rack_aware_round_robin;
mod round_robin;
mod token_aware;

pub use dc_aware_round_robin::DcAwareRoundRobinPolicy;
pub use rack_aware_round_robin::RackAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

use super::cluster::ClusterData;
use super::node::Node;
use crate::routing::Token;
use std::sync::Arc;

/// Represents info about a statement that can be used by load balancing policies.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    /// The token the statement is routed to, if it could be computed.
    pub token: Option<Token>,
    /// The keyspace in effect, used to look up the replication strategy.
    pub keyspace: Option<String>,
}

/// The ordered sequence of candidate nodes for one query execution.
pub type Plan<'a> = Box<dyn Iterator<Item = Arc<Node>> + Send + Sync + 'a>;

/// Policy that decides which nodes to contact for each query.
///
/// Producing a plan must not block and must be safe to call concurrently
/// for distinct statements. A plan may consult the cluster snapshot lazily
/// but never yields the same node twice.
pub trait LoadBalancingPolicy: Send + Sync {
    /// Returns an iterator over nodes to use for a given statement.
    fn plan<'a>(&self, statement: &Statement, cluster: &'a ClusterData) -> Plan<'a>;

    /// Returns the name of the load balancing policy.
    fn name(&self) -> String;
}

/// A policy usable as the inner policy of a wrapper (e.g. [TokenAwarePolicy]),
/// deciding the order within a node set the wrapper computed.
pub trait ChildLoadBalancingPolicy: LoadBalancingPolicy {
    fn apply_child_policy(
        &self,
        plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync>;
}

// Walks `nodes` once, starting at `seed % len` and wrapping around.
// Every round-robin flavor here is this walk over a different node set.
pub(super) fn rotated(nodes: &[Arc<Node>], seed: usize) -> impl Iterator<Item = &Arc<Node>> + Clone {
    let len = nodes.len().max(1);
    nodes.iter().cycle().skip(seed % len).take(nodes.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::routing::locator::ReplicaLocator;
    use crate::routing::partitioner::PartitionerName;
    use crate::routing::Token;
    use crate::transport::node::tests::mock_node;
    use crate::transport::topology::{Keyspace, Strategy};
    use std::collections::HashMap;

    pub(crate) const EMPTY_STATEMENT: Statement = Statement {
        token: None,
        keyspace: None,
    };

    /// Builds ClusterData out of (token, node) assignments and keyspaces.
    pub(crate) fn mock_cluster_data(
        ring: Vec<(i64, Arc<Node>)>,
        keyspaces: Vec<(&str, Strategy)>,
    ) -> ClusterData {
        let locator =
            ReplicaLocator::new(ring.iter().map(|(t, n)| (Token::Murmur3(*t), n.clone())));
        let known_peers = ring
            .iter()
            .map(|(_t, n)| (n.host_id, n.clone()))
            .collect();
        let keyspaces = keyspaces
            .into_iter()
            .map(|(name, strategy)| {
                (
                    name.to_string(),
                    Keyspace {
                        strategy,
                        tables: HashMap::new(),
                        views: HashMap::new(),
                        user_defined_types: HashMap::new(),
                        functions: HashMap::new(),
                        aggregates: HashMap::new(),
                    },
                )
            })
            .collect();

        ClusterData {
            known_peers,
            keyspaces,
            locator,
            partitioner: PartitionerName::Murmur3,
        }
    }

    /// Two datacenters: dc1 holds nodes 1 (rack r1), 2 (r1) and 3 (r2);
    /// dc2 holds nodes 4 (r1) and 5 (r2).
    pub(crate) fn two_dc_cluster() -> ClusterData {
        let nodes = [
            mock_node(1, Some("dc1"), Some("r1")),
            mock_node(2, Some("dc1"), Some("r1")),
            mock_node(3, Some("dc1"), Some("r2")),
            mock_node(4, Some("dc2"), Some("r1")),
            mock_node(5, Some("dc2"), Some("r2")),
        ];
        let ring = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (100 * (i as i64 + 1), n.clone()))
            .collect();
        mock_cluster_data(ring, vec![])
    }

    pub(crate) fn plan_ids(
        policy: &impl LoadBalancingPolicy,
        statement: &Statement,
        cluster: &ClusterData,
    ) -> Vec<u128> {
        policy
            .plan(statement, cluster)
            .map(|node| node.host_id.as_u128())
            .collect()
    }

    #[test]
    fn plans_never_repeat_a_node() {
        let cluster = two_dc_cluster();
        let policies: Vec<Box<dyn LoadBalancingPolicy>> = vec![
            Box::new(RoundRobinPolicy::new()),
            Box::new(DcAwareRoundRobinPolicy::new("dc1".to_string())),
            Box::new(RackAwareRoundRobinPolicy::new(
                "dc1".to_string(),
                "r1".to_string(),
            )),
        ];

        for policy in &policies {
            for _ in 0..10 {
                let plan: Vec<u128> = policy
                    .plan(&EMPTY_STATEMENT, &cluster)
                    .map(|node| node.host_id.as_u128())
                    .collect();
                let mut deduplicated = plan.clone();
                deduplicated.sort_unstable();
                deduplicated.dedup();
                assert_eq!(plan.len(), deduplicated.len(), "{}", policy.name());
            }
        }
    }

    #[test]
    fn rotated_wraps_and_visits_everything_once() {
        let nodes: Vec<_> = (1..=4).map(|i| mock_node(i, None, None)).collect();

        let walk: Vec<u128> = rotated(&nodes, 2).map(|n| n.host_id.as_u128()).collect();
        assert_eq!(walk, vec![3, 4, 1, 2]);

        // Seeds beyond the length wrap around.
        let walk: Vec<u128> = rotated(&nodes, 6).map(|n| n.host_id.as_u128()).collect();
        assert_eq!(walk, vec![3, 4, 1, 2]);

        assert_eq!(rotated(&[], 3).count(), 0);
    }
}
