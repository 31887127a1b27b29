use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan, Statement};
use crate::transport::{cluster::ClusterData, node::Node};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Round robin with a home datacenter: plans walk the local datacenter
/// first and only then, optionally, the rest of the cluster. Both groups
/// rotate with the shared cursor so load stays even within each tier.
pub struct DcAwareRoundRobinPolicy {
    cursor: AtomicUsize,
    local_dc: String,
    include_remote_nodes: bool,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: String) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            local_dc,
            include_remote_nodes: true,
        }
    }

    /// When disabled, plans never leave the local datacenter.
    pub fn set_include_remote_nodes(&mut self, include: bool) {
        self.include_remote_nodes = include;
    }

    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    fn belongs_to_local_dc(&self, node: &Node) -> bool {
        node.datacenter.as_deref() == Some(self.local_dc.as_str())
    }

    // Every node of the cluster outside the home datacenter, in a fixed
    // order, rotated by the seed.
    fn remote_tier(&self, cluster: &ClusterData, seed: usize) -> Vec<Arc<Node>> {
        let mut remote: Vec<Arc<Node>> = cluster
            .replica_locator()
            .unique_nodes_in_global_ring()
            .iter()
            .filter(|node| !self.belongs_to_local_dc(node) && node.is_up())
            .cloned()
            .collect();
        if !remote.is_empty() {
            let remote_len = remote.len();
            remote.rotate_left(seed % remote_len);
        }
        remote
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan<'a>(&self, _statement: &Statement, cluster: &'a ClusterData) -> Plan<'a> {
        let seed = self.cursor.fetch_add(1, Ordering::Relaxed);

        let local_nodes = cluster
            .replica_locator()
            .unique_nodes_in_datacenter_ring(&self.local_dc)
            .unwrap_or(&[]);
        let local_tier = super::rotated(local_nodes, seed)
            .filter(|node| node.is_up())
            .cloned();

        if self.include_remote_nodes {
            let remote_tier = self.remote_tier(cluster, seed);
            Box::new(local_tier.chain(remote_tier))
        } else {
            Box::new(local_tier)
        }
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

impl ChildLoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn apply_child_policy(
        &self,
        plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> {
        let seed = self.cursor.fetch_add(1, Ordering::Relaxed);

        let (mut local, mut remote): (Vec<_>, Vec<_>) = plan
            .into_iter()
            .partition(|node| self.belongs_to_local_dc(node));

        if !local.is_empty() {
            let local_len = local.len();
            local.rotate_left(seed % local_len);
        }
        if !self.include_remote_nodes {
            remote.clear();
        } else if !remote.is_empty() {
            let remote_len = remote.len();
            remote.rotate_left(seed % remote_len);
        }

        Box::new(local.into_iter().chain(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::load_balancing::tests::{plan_ids, two_dc_cluster, EMPTY_STATEMENT};
    use crate::transport::node::tests::mock_node;

    #[test]
    fn home_datacenter_forms_the_head_of_every_plan() {
        let cluster = two_dc_cluster();
        let policy = DcAwareRoundRobinPolicy::new("dc1".to_string());

        for _ in 0..6 {
            let plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
            assert_eq!(plan.len(), 5);
            // dc1 holds nodes 1-3, dc2 holds 4-5.
            assert!(plan[..3].iter().all(|id| (1..=3).contains(id)));
            assert!(plan[3..].iter().all(|id| (4..=5).contains(id)));
        }
    }

    #[test]
    fn local_tier_rotates_between_plans() {
        let cluster = two_dc_cluster();
        let policy = DcAwareRoundRobinPolicy::new("dc1".to_string());

        let heads: Vec<u128> = (0..4)
            .map(|_| plan_ids(&policy, &EMPTY_STATEMENT, &cluster)[0])
            .collect();
        assert_eq!(heads, vec![1, 2, 3, 1]);
    }

    #[test]
    fn remote_nodes_can_be_cut_off() {
        let cluster = two_dc_cluster();
        let mut policy = DcAwareRoundRobinPolicy::new("dc2".to_string());
        policy.set_include_remote_nodes(false);

        let mut plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
        plan.sort_unstable();
        assert_eq!(plan, vec![4, 5]);
    }

    #[test]
    fn unknown_home_datacenter_still_reaches_the_cluster() {
        let cluster = two_dc_cluster();
        let policy = DcAwareRoundRobinPolicy::new("no_such_dc".to_string());

        let plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn child_policy_keeps_local_replicas_in_front() {
        let policy = DcAwareRoundRobinPolicy::new("dc1".to_string());
        let replicas = vec![
            mock_node(7, Some("dc2"), None),
            mock_node(8, Some("dc1"), None),
            mock_node(9, Some("dc2"), None),
        ];

        let ordered: Vec<u128> = policy
            .apply_child_policy(replicas)
            .map(|n| n.host_id.as_u128())
            .collect();
        assert_eq!(ordered[0], 8);
        assert_eq!(ordered.len(), 3);
    }
}
