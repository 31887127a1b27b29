use crate::transport::connection::{
    open_connection, Connection, ConnectionConfig, VerifiedKeyspaceName,
};
use crate::transport::errors::QueryError;

use futures::future::{join_all, BoxFuture, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration of a per-node connection pool.
#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    /// Number of connections the pool keeps to its node.
    pub(crate) pool_size: usize,
    /// Backoff between reconnect attempts when opening connections fails.
    pub(crate) reconnect_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            pool_size: 1,
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

/// A set of connections to one node, kept full by a background keeper task.
pub(crate) struct NodeConnectionPool {
    conns: Arc<RwLock<Vec<Arc<Connection>>>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    initialized_receiver: watch::Receiver<bool>,
    _keeper_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool").finish_non_exhaustive()
    }
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), QueryError>>,
}

impl NodeConnectionPool {
    pub(crate) fn new(
        host_id: Option<Uuid>,
        address: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let conns = Arc::new(RwLock::new(Vec::new()));
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let (initialized_sender, initialized_receiver) = watch::channel(false);

        let keeper = PoolKeeper {
            host_id,
            address,
            pool_config,
            shared_conns: conns.clone(),
            use_keyspace_request_receiver,
            initialized_sender,
            current_keyspace,
            connections: HashMap::new(),
            next_connection_id: 0,
            error_watchers: FuturesUnordered::new(),
        };

        let (fut, keeper_handle) = keeper.work().remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            initialized_receiver,
            _keeper_handle: keeper_handle,
        }
    }

    /// Picks a random healthy connection; fails fast when the pool is empty
    /// so that the caller can move on to a sibling node.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, QueryError> {
        let conns = self.conns.read().unwrap();
        conns
            .choose(&mut thread_rng())
            .cloned()
            .ok_or_else(Self::no_connections_error)
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, QueryError> {
        let conns = self.conns.read().unwrap();
        if conns.is_empty() {
            return Err(Self::no_connections_error());
        }
        Ok(conns.clone())
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        let (response_sender, response_receiver) = oneshot::channel();

        // The keeper task outlives the pool handle, so both the send and
        // the wait can only fail if the keeper panicked.
        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .expect("the pool keeper is gone");
        response_receiver
            .await
            .expect("the pool keeper dropped a keyspace request")
    }

    /// Waits until the keeper has finished its first fill attempt.
    pub(crate) async fn wait_until_initialized(&self) {
        let mut receiver = self.initialized_receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    fn no_connections_error() -> QueryError {
        QueryError::IoError(Arc::new(std::io::Error::new(
            ErrorKind::Other,
            "No connections in the pool",
        )))
    }
}

// Keeps the pool filled: opens missing connections with a backoff,
// watches per-connection fatal errors and replaces broken connections,
// and propagates USE keyspace to every connection.
struct PoolKeeper {
    host_id: Option<Uuid>,
    address: SocketAddr,
    pool_config: PoolConfig,

    shared_conns: Arc<RwLock<Vec<Arc<Connection>>>>,
    use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>,
    initialized_sender: watch::Sender<bool>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    connections: HashMap<u64, Arc<Connection>>,
    next_connection_id: u64,
    error_watchers: FuturesUnordered<BoxFuture<'static, (u64, QueryError)>>,
}

impl PoolKeeper {
    async fn work(mut self) {
        loop {
            let fill_failed = self.refill().await;
            self.publish();
            let _ = self.initialized_sender.send(true);

            if fill_failed {
                tokio::select! {
                    _ = tokio::time::sleep(self.pool_config.reconnect_interval) => {}
                    Some((broken_id, err)) = self.error_watchers.next() => {
                        self.handle_broken_connection(broken_id, err);
                    }
                    request = self.use_keyspace_request_receiver.recv() => {
                        match request {
                            Some(request) => self.handle_use_keyspace(request).await,
                            None => return, // The pool was dropped
                        }
                    }
                }
            } else {
                tokio::select! {
                    Some((broken_id, err)) = self.error_watchers.next() => {
                        self.handle_broken_connection(broken_id, err);
                    }
                    request = self.use_keyspace_request_receiver.recv() => {
                        match request {
                            Some(request) => self.handle_use_keyspace(request).await,
                            None => return, // The pool was dropped
                        }
                    }
                }
            }
        }
    }

    // Returns true if any connection failed to open; the caller then
    // backs off before the next attempt.
    async fn refill(&mut self) -> bool {
        while self.connections.len() < self.pool_config.pool_size {
            match open_connection(
                self.host_id,
                self.address,
                self.pool_config.connection_config.clone(),
            )
            .await
            {
                Ok((connection, error_receiver)) => {
                    let connection = Arc::new(connection);

                    if let Some(keyspace) = &self.current_keyspace {
                        if let Err(err) = connection.use_keyspace(keyspace).await {
                            warn!(
                                "Failed to set keyspace on a fresh connection to {}: {}",
                                self.address, err
                            );
                            return true;
                        }
                    }

                    let connection_id = self.next_connection_id;
                    self.next_connection_id += 1;

                    self.connections.insert(connection_id, connection);
                    self.error_watchers.push(
                        async move {
                            let error = match error_receiver.await {
                                Ok(error) => error,
                                // The router never drops the sender without
                                // an error, but be defensive.
                                Err(_) => QueryError::IoError(Arc::new(std::io::Error::new(
                                    ErrorKind::Other,
                                    "Connection broken",
                                ))),
                            };
                            (connection_id, error)
                        }
                        .boxed(),
                    );

                    debug!("Opened connection to {}", self.address);
                }
                Err(err) => {
                    warn!("Failed to open connection to {}: {}", self.address, err);
                    return true;
                }
            }
        }

        false
    }

    fn handle_broken_connection(&mut self, connection_id: u64, error: QueryError) {
        warn!("Connection to {} broke: {}", self.address, error);
        self.connections.remove(&connection_id);
        self.publish();
    }

    async fn handle_use_keyspace(&mut self, request: UseKeyspaceRequest) {
        self.current_keyspace = Some(request.keyspace_name.clone());

        let mut use_keyspace_futures = Vec::new();
        for connection in self.connections.values() {
            let keyspace_name = request.keyspace_name.clone();
            let connection = connection.clone();
            use_keyspace_futures
                .push(async move { connection.use_keyspace(&keyspace_name).await });
        }

        let use_keyspace_results: Vec<Result<(), QueryError>> =
            join_all(use_keyspace_futures).await;

        // If at least one succeeded and the rest were IoErrors we can
        // report success: the keyspace name is correct, and broken
        // connections apply it on their next reconnect.
        // Any non-IO error means something is genuinely wrong.
        let mut was_ok = self.connections.is_empty();
        let mut io_error: Option<Arc<std::io::Error>> = None;

        let mut result = Ok(());
        for use_keyspace_result in use_keyspace_results {
            match use_keyspace_result {
                Ok(()) => was_ok = true,
                Err(err) => match err {
                    QueryError::IoError(io_err) => io_error = Some(io_err),
                    _ => {
                        result = Err(err);
                        break;
                    }
                },
            }
        }

        if result.is_ok() && !was_ok {
            result = Err(QueryError::IoError(
                io_error.expect("no success implies at least one IO error"),
            ));
        }

        // Don't care if the requester is gone
        let _ = request.response_sender.send(result);
    }

    fn publish(&self) {
        let snapshot: Vec<Arc<Connection>> = self.connections.values().cloned().collect();
        *self.shared_conns.write().unwrap() = snapshot;
    }
}
