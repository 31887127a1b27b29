use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan, Statement};
use crate::transport::{cluster::ClusterData, node::Node};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Plain round robin: every plan starts one node further along the list
/// of known nodes, so load spreads evenly across the cluster.
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    fn advance_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&self, _statement: &Statement, cluster: &'a ClusterData) -> Plan<'a> {
        let nodes = cluster.replica_locator().unique_nodes_in_global_ring();
        let seed = self.advance_cursor();

        Box::new(
            super::rotated(nodes, seed)
                .filter(|node| node.is_up())
                .cloned(),
        )
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

impl ChildLoadBalancingPolicy for RoundRobinPolicy {
    fn apply_child_policy(
        &self,
        mut plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> {
        if !plan.is_empty() {
            let seed = self.advance_cursor();
            let plan_len = plan.len();
            plan.rotate_left(seed % plan_len);
        }
        Box::new(plan.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::load_balancing::tests::{
        mock_cluster_data, plan_ids, EMPTY_STATEMENT,
    };
    use crate::transport::node::tests::mock_node;

    fn three_node_cluster() -> ClusterData {
        let ring = (1..=3)
            .map(|i| (100 * i as i64, mock_node(i, None, None)))
            .collect();
        mock_cluster_data(ring, vec![])
    }

    #[test]
    fn successive_plans_start_at_successive_nodes() {
        let cluster = three_node_cluster();
        let policy = RoundRobinPolicy::new();

        let starts: Vec<u128> = (0..7)
            .map(|_| plan_ids(&policy, &EMPTY_STATEMENT, &cluster)[0])
            .collect();
        assert_eq!(starts, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn each_plan_covers_the_whole_cluster() {
        let cluster = three_node_cluster();
        let policy = RoundRobinPolicy::new();

        for _ in 0..5 {
            let mut plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
            plan.sort_unstable();
            assert_eq!(plan, vec![1, 2, 3]);
        }
    }

    #[test]
    fn down_nodes_are_left_out() {
        let cluster = three_node_cluster();
        cluster
            .known_peers
            .values()
            .find(|node| node.host_id.as_u128() == 2)
            .unwrap()
            .set_is_down(true);

        let policy = RoundRobinPolicy::new();
        for _ in 0..3 {
            let mut plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
            plan.sort_unstable();
            assert_eq!(plan, vec![1, 3]);
        }
    }

    #[test]
    fn child_policy_rotates_the_replica_set() {
        let policy = RoundRobinPolicy::new();
        let replicas: Vec<_> = (1..=3).map(|i| mock_node(i, None, None)).collect();

        let first: Vec<u128> = policy
            .apply_child_policy(replicas.clone())
            .map(|n| n.host_id.as_u128())
            .collect();
        let second: Vec<u128> = policy
            .apply_child_policy(replicas)
            .map(|n| n.host_id.as_u128())
            .collect();

        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![2, 3, 1]);
    }

    #[test]
    fn empty_cluster_yields_an_empty_plan() {
        let cluster = mock_cluster_data(vec![], vec![]);
        let policy = RoundRobinPolicy::new();
        assert!(plan_ids(&policy, &EMPTY_STATEMENT, &cluster).is_empty());
    }
}
