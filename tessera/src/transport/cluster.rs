/// Cluster manages up-to-date information and connections to database nodes
use crate::routing::locator::ReplicaLocator;
use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;
use crate::transport::connection::{Connection, VerifiedKeyspaceName};
use crate::transport::connection_pool::PoolConfig;
use crate::transport::errors::QueryError;
use crate::transport::node::Node;
use crate::transport::topology::{Keyspace, Metadata, MetadataReader, Strategy};
use tessera_cql::frame::response::event::{Event, StatusChangeEvent};

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cluster manages up-to-date information and connections to database nodes.
/// All state can be accessed by cloning the Arc<ClusterData> in the `data` field
pub(crate) struct Cluster {
    // `ArcSwap<ClusterData>` is wrapped in `Arc` to support sharing cluster data
    // between `Cluster` and `ClusterWorker`
    data: Arc<ArcSwap<ClusterData>>,

    refresh_channel: tokio::sync::mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: tokio::sync::mpsc::Sender<UseKeyspaceRequest>,

    _worker_handle: RemoteHandle<()>,
}

/// An immutable snapshot of the cluster's state: hosts keyed by their
/// stable identity, the token ring, and keyspace metadata. Readers take
/// the current snapshot; the worker swaps in new ones atomically.
pub struct ClusterData {
    pub(crate) known_peers: HashMap<Uuid, Arc<Node>>, // Invariant: nonempty after Cluster::new()
    pub(crate) keyspaces: HashMap<String, Keyspace>,
    pub(crate) locator: ReplicaLocator,
    pub(crate) partitioner: PartitionerName,
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    // Cluster data to keep updated:
    cluster_data: Arc<ArcSwap<ClusterData>>,

    // Cluster connections
    metadata_reader: MetadataReader,
    pool_config: PoolConfig,

    // To listen for refresh requests
    refresh_channel: tokio::sync::mpsc::Receiver<RefreshRequest>,

    // Channel used to receive use keyspace requests
    use_keyspace_channel: tokio::sync::mpsc::Receiver<UseKeyspaceRequest>,

    // Channel used to receive server events
    server_events_channel: tokio::sync::mpsc::Receiver<Event>,

    // Keyspace send in "USE <keyspace name>" when opening each connection
    used_keyspace: Option<VerifiedKeyspaceName>,

    cluster_metadata_refresh_interval: Duration,
}

#[derive(Debug)]
struct RefreshRequest {
    response_chan: tokio::sync::oneshot::Sender<Result<(), QueryError>>,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: tokio::sync::oneshot::Sender<Result<(), QueryError>>,
}

impl Cluster {
    pub(crate) async fn new(
        initial_peers: Vec<SocketAddr>,
        pool_config: PoolConfig,
        fetch_schema_metadata: bool,
        disable_schema_events: bool,
        cluster_metadata_refresh_interval: Duration,
    ) -> Result<Cluster, QueryError> {
        let cluster_data = Arc::new(ArcSwap::from(Arc::new(ClusterData {
            known_peers: HashMap::new(),
            keyspaces: HashMap::new(),
            locator: ReplicaLocator::empty(),
            partitioner: PartitionerName::default(),
        })));

        let (refresh_sender, refresh_receiver) = tokio::sync::mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = tokio::sync::mpsc::channel(32);
        let (server_events_sender, server_events_receiver) = tokio::sync::mpsc::channel(32);

        let mut metadata_reader = MetadataReader::new(
            &initial_peers,
            pool_config.connection_config.clone(),
            pool_config.reconnect_interval,
            server_events_sender,
            fetch_schema_metadata,
            disable_schema_events,
        );

        let metadata = metadata_reader.read_metadata(true).await?;
        let initial_cluster_data =
            ClusterData::new(metadata, &pool_config, &HashMap::new(), &None);
        initial_cluster_data
            .wait_until_all_pools_are_initialized()
            .await;
        cluster_data.store(Arc::new(initial_cluster_data));

        let worker = ClusterWorker {
            cluster_data: cluster_data.clone(),

            metadata_reader,
            pool_config,

            refresh_channel: refresh_receiver,
            server_events_channel: server_events_receiver,

            use_keyspace_channel: use_keyspace_receiver,
            used_keyspace: None,

            cluster_metadata_refresh_interval,
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        let result = Cluster {
            data: cluster_data,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            _worker_handle: worker_handle,
        };

        Ok(result)
    }

    pub(crate) fn get_data(&self) -> Arc<ClusterData> {
        self.data.load_full()
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = tokio::sync::oneshot::channel();

        // The worker outlives this handle, so both the send and the wait
        // can only fail if the worker panicked.
        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .expect("the cluster worker is gone");
        response_receiver
            .await
            .expect("the cluster worker dropped a refresh request")
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = tokio::sync::oneshot::channel();

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .expect("the cluster worker is gone");
        response_receiver
            .await
            .expect("the cluster worker dropped a keyspace request")
    }
}

impl ClusterData {
    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in self.known_peers.values() {
            node.wait_until_pool_initialized().await;
        }
    }

    /// Creates new ClusterData using information about topology held in `metadata`.
    /// Uses the provided `known_peers` hashmap to recycle nodes if possible.
    pub(crate) fn new(
        metadata: Metadata,
        pool_config: &PoolConfig,
        known_peers: &HashMap<Uuid, Arc<Node>>,
        used_keyspace: &Option<VerifiedKeyspaceName>,
    ) -> Self {
        // Create new updated known_peers and ring
        let mut new_known_peers: HashMap<Uuid, Arc<Node>> =
            HashMap::with_capacity(metadata.peers.len());
        let mut ring: Vec<(Token, Arc<Node>)> = Vec::new();

        for peer in metadata.peers {
            // Take the existing Arc<Node> if possible. A host whose address
            // changed keeps its identity but gets a new node with a fresh
            // pool against the new address (a "replacement").
            let node: Arc<Node> = match known_peers.get(&peer.host_id) {
                Some(node)
                    if node.address == peer.address
                        && node.datacenter == peer.datacenter
                        && node.rack == peer.rack =>
                {
                    node.clone()
                }
                _ => Arc::new(Node::new(
                    peer.host_id,
                    peer.address,
                    pool_config.clone(),
                    peer.datacenter,
                    peer.rack,
                    peer.release_version,
                    used_keyspace.clone(),
                )),
            };

            new_known_peers.insert(peer.host_id, node.clone());

            for token in peer.tokens {
                ring.push((token, node.clone()));
            }
        }

        let locator = ReplicaLocator::new(ring.into_iter());

        ClusterData {
            known_peers: new_known_peers,
            keyspaces: metadata.keyspaces,
            locator,
            partitioner: metadata.partitioner,
        }
    }

    /// Access keyspace details collected by the driver.
    pub fn get_keyspace_info(&self) -> &HashMap<String, Keyspace> {
        &self.keyspaces
    }

    /// Access all nodes known to the driver, by their host ids.
    pub fn get_nodes_info(&self) -> &HashMap<Uuid, Arc<Node>> {
        &self.known_peers
    }

    /// The replica locator holding the ring and per-datacenter views.
    pub fn replica_locator(&self) -> &ReplicaLocator {
        &self.locator
    }

    /// The partitioner in effect for the cluster.
    pub fn partitioner_name(&self) -> &PartitionerName {
        &self.partitioner
    }

    /// Returns the replica set for the given keyspace and token, in ring order.
    pub fn get_token_endpoints(&self, keyspace: &str, token: &Token) -> Vec<Arc<Node>> {
        let default_strategy = Strategy::SimpleStrategy {
            replication_factor: 1,
        };
        let strategy = self
            .keyspaces
            .get(keyspace)
            .map(|ks| &ks.strategy)
            .unwrap_or(&default_strategy);
        self.locator.replicas_for_token(token, strategy)
    }

    /// An iterator over all open connections of all nodes.
    pub(crate) fn iter_working_connections(
        &self,
    ) -> Result<impl Iterator<Item = Arc<Connection>> + '_, QueryError> {
        let mut connections = Vec::new();
        let mut last_error: Option<QueryError> = None;

        for node in self.known_peers.values() {
            match node.get_working_connections() {
                Ok(conns) => connections.extend(conns),
                Err(e) => last_error = Some(e),
            }
        }

        if connections.is_empty() {
            // By the invariant, known_peers is nonempty, so there is an error.
            return Err(last_error.expect("Bug: no connections and no error"));
        }

        Ok(connections.into_iter())
    }

    fn node_by_address(&self, address: SocketAddr) -> Option<&Arc<Node>> {
        self.known_peers
            .values()
            .find(|node| node.address == address || node.address.ip() == address.ip())
    }
}

// Possible outcomes of one pass through the worker's wait.
enum Wakeup {
    /// Time (or an event) says the snapshot should be rebuilt.
    RefreshDue,
    /// A caller explicitly asked for a refresh and awaits the outcome.
    RefreshAsked(RefreshRequest),
    /// Handled in place, nothing to rebuild.
    NothingToDo,
    /// A channel closed: the session is going away.
    Shutdown,
}

impl ClusterWorker {
    pub(crate) async fn work(mut self) {
        use tokio::time::Instant;

        let mut next_scheduled_refresh = Instant::now() + self.cluster_metadata_refresh_interval;

        loop {
            let wakeup = self.wait_for_wakeup(next_scheduled_refresh).await;

            let refresh_requester = match wakeup {
                Wakeup::Shutdown => return,
                Wakeup::NothingToDo => continue,
                Wakeup::RefreshDue => None,
                Wakeup::RefreshAsked(request) => Some(request),
            };

            debug!("Refreshing cluster metadata");
            next_scheduled_refresh = Instant::now() + self.cluster_metadata_refresh_interval;
            let outcome = self.refresh_once().await;

            if let Some(request) = refresh_requester {
                // A closed response channel just means the requester went away.
                let _ = request.response_chan.send(outcome);
            }
        }
    }

    async fn wait_for_wakeup(&mut self, next_scheduled_refresh: tokio::time::Instant) -> Wakeup {
        tokio::select! {
            _ = tokio::time::sleep_until(next_scheduled_refresh) => Wakeup::RefreshDue,
            request = self.refresh_channel.recv() => {
                match request {
                    Some(request) => Wakeup::RefreshAsked(request),
                    None => Wakeup::Shutdown,
                }
            }
            event = self.server_events_channel.recv() => {
                match event {
                    Some(event) => self.apply_event(event),
                    // The metadata reader is gone; so is our job.
                    None => Wakeup::Shutdown,
                }
            }
            request = self.use_keyspace_channel.recv() => {
                match request {
                    Some(request) => {
                        self.used_keyspace = Some(request.keyspace_name.clone());
                        let snapshot = self.cluster_data.load_full();
                        tokio::spawn(Self::handle_use_keyspace_request(snapshot, request));
                        Wakeup::NothingToDo
                    }
                    None => Wakeup::Shutdown,
                }
            }
        }
    }

    // Classifies a server event: some are handled by flipping a marker,
    // others make the current snapshot stale.
    fn apply_event(&mut self, event: Event) -> Wakeup {
        debug!("Server event: {:?}", event);
        match event {
            // The ring changed under us. The refresh also runs before any
            // subsequent status event is acted on, so a newly announced
            // node is part of the snapshot before it can be marked Up.
            Event::TopologyChange(_) => Wakeup::RefreshDue,
            // Replication settings and prepared statement metadata may
            // have moved; rebuild the keyspace snapshot.
            Event::SchemaChange(_) => Wakeup::RefreshDue,
            // Up/Down only flips a marker on the already-known node.
            Event::StatusChange(status) => {
                let (addr, is_down) = match status {
                    StatusChangeEvent::Up(addr) => (addr, false),
                    StatusChangeEvent::Down(addr) => (addr, true),
                };
                match self.cluster_data.load().node_by_address(addr) {
                    Some(node) => node.set_is_down(is_down),
                    None => warn!("Status event for unknown address {}", addr),
                }
                Wakeup::NothingToDo
            }
        }
    }

    async fn handle_use_keyspace_request(
        cluster_data: Arc<ClusterData>,
        request: UseKeyspaceRequest,
    ) {
        let result = Self::broadcast_use_keyspace(cluster_data, &request.keyspace_name).await;

        // The requester may be gone by now; that is fine.
        let _ = request.response_chan.send(result);
    }

    // Applies USE <keyspace> on every node. A mix of successes and broken
    // connections still counts as success: the name is valid, and broken
    // connections re-apply it when their pool reopens them. Any error
    // other than an I/O one is reported as-is.
    async fn broadcast_use_keyspace(
        cluster_data: Arc<ClusterData>,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let per_node = join_all(
            cluster_data
                .known_peers
                .values()
                .map(|node| node.use_keyspace(keyspace_name.clone())),
        )
        .await;

        let mut saw_success = false;
        let mut sample_io_error = None;
        for outcome in per_node {
            match outcome {
                Ok(()) => saw_success = true,
                Err(QueryError::IoError(io_error)) => sample_io_error = Some(io_error),
                Err(other) => return Err(other),
            }
        }

        match sample_io_error {
            Some(io_error) if !saw_success => Err(QueryError::IoError(io_error)),
            // Including the no-nodes case: the keyspace is remembered and
            // applied to every connection opened from now on.
            _ => Ok(()),
        }
    }

    async fn refresh_once(&mut self) -> Result<(), QueryError> {
        let metadata = self.metadata_reader.read_metadata(false).await?;
        let previous: Arc<ClusterData> = self.cluster_data.load_full();

        let rebuilt = Arc::new(ClusterData::new(
            metadata,
            &self.pool_config,
            &previous.known_peers,
            &self.used_keyspace,
        ));

        if rebuilt.known_peers.len() != previous.known_peers.len() {
            debug!(
                "Topology changed: {} -> {} hosts",
                previous.known_peers.len(),
                rebuilt.known_peers.len()
            );
        }

        rebuilt.wait_until_all_pools_are_initialized().await;
        self.cluster_data.store(rebuilt);

        Ok(())
    }
}
