use super::{ChildLoadBalancingPolicy, LoadBalancingPolicy, Plan, Statement};
use crate::transport::{cluster::ClusterData, node::Node};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Round robin with a home rack: plans prefer the local rack, then the
/// remaining nodes of the local datacenter, then (optionally) the rest
/// of the cluster.
pub struct RackAwareRoundRobinPolicy {
    cursor: AtomicUsize,
    local_dc: String,
    local_rack: String,
    include_remote_nodes: bool,
}

impl RackAwareRoundRobinPolicy {
    pub fn new(local_dc: String, local_rack: String) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            local_dc,
            local_rack,
            include_remote_nodes: true,
        }
    }

    /// When disabled, plans never leave the local datacenter.
    pub fn set_include_remote_nodes(&mut self, include: bool) {
        self.include_remote_nodes = include;
    }

    fn belongs_to_local_dc(&self, node: &Node) -> bool {
        node.datacenter.as_deref() == Some(self.local_dc.as_str())
    }

    fn belongs_to_local_rack(&self, node: &Node) -> bool {
        self.belongs_to_local_dc(node)
            && node.rack.as_deref() == Some(self.local_rack.as_str())
    }

    // The three preference tiers, rotated by the seed and already
    // filtered to live nodes.
    fn tiers(&self, cluster: &ClusterData, seed: usize) -> [Vec<Arc<Node>>; 3] {
        let locator = cluster.replica_locator();

        let (rack, other_local): (Vec<_>, Vec<_>) = locator
            .unique_nodes_in_datacenter_ring(&self.local_dc)
            .unwrap_or(&[])
            .iter()
            .filter(|node| node.is_up())
            .cloned()
            .partition(|node| self.belongs_to_local_rack(node));

        let remote: Vec<Arc<Node>> = if self.include_remote_nodes {
            locator
                .unique_nodes_in_global_ring()
                .iter()
                .filter(|node| !self.belongs_to_local_dc(node) && node.is_up())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut tiers = [rack, other_local, remote];
        for tier in tiers.iter_mut() {
            if !tier.is_empty() {
                let tier_len = tier.len();
                tier.rotate_left(seed % tier_len);
            }
        }
        tiers
    }
}

impl LoadBalancingPolicy for RackAwareRoundRobinPolicy {
    fn plan<'a>(&self, _statement: &Statement, cluster: &'a ClusterData) -> Plan<'a> {
        let seed = self.cursor.fetch_add(1, Ordering::Relaxed);
        let [rack, other_local, remote] = self.tiers(cluster, seed);

        Box::new(rack.into_iter().chain(other_local).chain(remote))
    }

    fn name(&self) -> String {
        "RackAwareRoundRobinPolicy".to_string()
    }
}

impl ChildLoadBalancingPolicy for RackAwareRoundRobinPolicy {
    fn apply_child_policy(
        &self,
        plan: Vec<Arc<Node>>,
    ) -> Box<dyn Iterator<Item = Arc<Node>> + Send + Sync> {
        let seed = self.cursor.fetch_add(1, Ordering::Relaxed);

        let (rack, rest): (Vec<_>, Vec<_>) = plan
            .into_iter()
            .partition(|node| self.belongs_to_local_rack(node));
        let (local, remote): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|node| self.belongs_to_local_dc(node));

        let mut tiers = [rack, local, remote];
        if !self.include_remote_nodes {
            tiers[2].clear();
        }
        for tier in tiers.iter_mut() {
            if !tier.is_empty() {
                let tier_len = tier.len();
                tier.rotate_left(seed % tier_len);
            }
        }

        let [rack, local, remote] = tiers;
        Box::new(rack.into_iter().chain(local).chain(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::load_balancing::tests::{plan_ids, two_dc_cluster, EMPTY_STATEMENT};

    #[test]
    fn preference_order_is_rack_then_dc_then_remote() {
        // dc1: nodes 1 and 2 in r1, node 3 in r2; dc2: nodes 4 and 5.
        let cluster = two_dc_cluster();
        let policy = RackAwareRoundRobinPolicy::new("dc1".to_string(), "r1".to_string());

        for _ in 0..6 {
            let plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
            assert_eq!(plan.len(), 5);
            assert!(plan[..2].iter().all(|id| [1, 2].contains(id)));
            assert_eq!(plan[2], 3);
            assert!(plan[3..].iter().all(|id| [4, 5].contains(id)));
        }
    }

    #[test]
    fn rack_tier_rotates_between_plans() {
        let cluster = two_dc_cluster();
        let policy = RackAwareRoundRobinPolicy::new("dc1".to_string(), "r1".to_string());

        let heads: Vec<u128> = (0..4)
            .map(|_| plan_ids(&policy, &EMPTY_STATEMENT, &cluster)[0])
            .collect();
        assert_eq!(heads, vec![1, 2, 1, 2]);
    }

    #[test]
    fn remote_nodes_can_be_cut_off() {
        let cluster = two_dc_cluster();
        let mut policy = RackAwareRoundRobinPolicy::new("dc1".to_string(), "r2".to_string());
        policy.set_include_remote_nodes(false);

        let plan = plan_ids(&policy, &EMPTY_STATEMENT, &cluster);
        assert_eq!(plan[0], 3);
        assert_eq!(plan.len(), 3);
    }
}
