use uuid::Uuid;

use crate::routing::Token;
use crate::transport::connection::{Connection, VerifiedKeyspaceName};
use crate::transport::connection_pool::{NodeConnectionPool, PoolConfig};
use crate::transport::errors::QueryError;

use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

/// Exponentially decaying average of request latencies to one node.
///
/// The weight of the stored average halves for every half-life the node
/// stays silent, so after a quiet period fresh samples dominate quickly
/// instead of fighting months of history.
#[derive(Debug, Clone, Copy)]
pub struct LatencyEstimate {
    pub average: Duration,
    pub measured_at: Instant,
    pub sample_count: u64,
}

impl LatencyEstimate {
    const HALF_LIFE: Duration = Duration::from_secs(15);

    pub(crate) fn update(previous: Option<Self>, sample: Duration) -> Option<Self> {
        // Sub-resolution samples carry no information.
        if sample.is_zero() {
            return previous;
        }

        let now = Instant::now();
        let updated = match previous {
            None => Self {
                average: sample,
                measured_at: now,
                sample_count: 1,
            },
            Some(old) => {
                let silence = now.duration_since(old.measured_at).as_secs_f64();
                let old_weight = 0.5_f64.powf(silence / Self::HALF_LIFE.as_secs_f64());
                let blended = old.average.as_secs_f64() * old_weight
                    + sample.as_secs_f64() * (1.0 - old_weight);
                Self {
                    average: Duration::from_secs_f64(blended),
                    measured_at: now,
                    sample_count: old.sample_count + 1,
                }
            }
        };
        Some(updated)
    }
}

/// One host of the cluster.
///
/// The host's identity is its `host_id`; the connect address can change
/// over the host's lifetime, in which case the pool is rebuilt while
/// routing keeps seeing the same host.
#[derive(Debug)]
pub struct Node {
    pub host_id: Uuid,
    pub address: SocketAddr,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,

    pub latency: RwLock<Option<LatencyEstimate>>,

    pool: Option<NodeConnectionPool>,

    down_flag: AtomicBool,
}

impl Node {
    /// Creates a new node; its pool starts opening connections right away.
    pub(crate) fn new(
        host_id: Uuid,
        address: SocketAddr,
        pool_config: PoolConfig,
        datacenter: Option<String>,
        rack: Option<String>,
        release_version: Option<String>,
        keyspace_name: Option<VerifiedKeyspaceName>,
    ) -> Self {
        Node {
            host_id,
            address,
            datacenter,
            rack,
            release_version,
            pool: Some(NodeConnectionPool::new(
                Some(host_id),
                address,
                pool_config,
                keyspace_name,
            )),
            down_flag: AtomicBool::new(false),
            latency: RwLock::new(None),
        }
    }

    /// Whether the node is believed to be serving requests. Flipped by
    /// status events; transitions are serialized through the cluster worker.
    pub fn is_up(&self) -> bool {
        !self.down_flag.load(Ordering::Relaxed)
    }

    pub fn is_down(&self) -> bool {
        self.down_flag.load(Ordering::Relaxed)
    }

    pub(crate) fn set_is_down(&self, is_down: bool) {
        self.down_flag.store(is_down, Ordering::Relaxed);
    }

    /// A connection for a request routed with `token`. Connections carry
    /// no per-token state, so any pool member will do; the token stays in
    /// the signature for symmetry with the planners.
    pub(crate) async fn connection_for_token(
        &self,
        _token: &Token,
    ) -> Result<Arc<Connection>, QueryError> {
        self.random_connection().await
    }

    pub(crate) async fn random_connection(&self) -> Result<Arc<Connection>, QueryError> {
        self.pool()?.random_connection()
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, QueryError> {
        self.pool()?.get_working_connections()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        match &self.pool {
            Some(pool) => pool.use_keyspace(keyspace_name).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    pub(crate) fn note_request_latency(&self, elapsed: Duration) {
        let mut estimate = self.latency.write().unwrap();
        *estimate = LatencyEstimate::update(*estimate, elapsed);
    }

    fn pool(&self) -> Result<&NodeConnectionPool, QueryError> {
        self.pool.as_ref().ok_or_else(|| {
            QueryError::IoError(Arc::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "The node has no connection pool",
            )))
        })
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// A node with no pool, suitable for planner and locator tests.
    pub(crate) fn mock_node(id: u128, datacenter: Option<&str>, rack: Option<&str>) -> Arc<Node> {
        Arc::new(Node {
            host_id: Uuid::from_u128(id),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, id as u8)), 9042),
            datacenter: datacenter.map(ToOwned::to_owned),
            rack: rack.map(ToOwned::to_owned),
            release_version: None,
            latency: RwLock::new(None),
            pool: None,
            down_flag: AtomicBool::new(false),
        })
    }

    #[test]
    fn latency_estimate_counts_and_blends() {
        let first = LatencyEstimate::update(None, Duration::from_millis(100)).unwrap();
        assert_eq!(first.average, Duration::from_millis(100));
        assert_eq!(first.sample_count, 1);

        let second = LatencyEstimate::update(Some(first), Duration::from_millis(10)).unwrap();
        assert_eq!(second.sample_count, 2);
        // The blend lands strictly between the old average and the sample.
        assert!(second.average < Duration::from_millis(100));
        assert!(second.average >= Duration::from_millis(10));
    }

    #[test]
    fn zero_latency_samples_are_ignored()  {
        let estimate = LatencyEstimate::update(None, Duration::ZERO);
        assert!(estimate.is_none());
    }
}
