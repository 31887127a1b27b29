//! SessionBuilder provides an easy way to create new sessions.

use super::errors::NewSessionError;
use super::load_balancing::LoadBalancingPolicy;
use super::retry_policy::RetryPolicy;
use super::session::{Session, SessionConfig};
use super::speculative_execution::SpeculativeExecutionPolicy;
use super::Compression;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::statement::{Consistency, SerialConsistency};
use std::borrow::Borrow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tessera_cql::frame::ProtocolVersion;

/// SessionBuilder is used to create new Session instances.
///
/// # Example
///
/// ```rust,no_run
/// # use tessera::{Session, SessionBuilder};
/// # use tessera::transport::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Lz4))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Creates a new SessionBuilder with default configuration
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node with a hostname.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a known node with an IP address
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Adds a list of known nodes with hostnames
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Adds a list of known nodes with IP addresses
    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) -> Self {
        self.config.add_known_nodes_addr(node_addrs);
        self
    }

    /// The port used for nodes given without an explicit one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the preferred compression algorithm.
    /// The default is no compression.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Pins the native protocol version instead of auto-detecting it.
    pub fn protocol_version(mut self, version: Option<ProtocolVersion>) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Sets the TCP_NODELAY option; true by default.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Sets the keyspace to be used on all connections.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Sets the default consistency level.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Sets the default serial consistency level for conditional statements.
    pub fn default_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.default_serial_consistency = serial_consistency;
        self
    }

    /// Sets the client-side request timeout; `None` disables it.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the timeout for establishing a TCP connection;
    /// 5 seconds by default.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the timeout for a single socket write.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Sets the backoff between reconnect attempts to a node.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Sets how many connections the driver opens to every node.
    pub fn num_conns_per_host(mut self, count: usize) -> Self {
        self.config.num_conns_per_host = count;
        self
    }

    /// Bounds the per-host prepared statement cache.
    pub fn max_prepared_stmts(mut self, count: usize) -> Self {
        self.config.max_prepared_stmts = count;
        self
    }

    /// Bounds the routing info cache used for unprepared statements.
    pub fn max_routing_key_info(mut self, count: usize) -> Self {
        self.config.max_routing_key_info = count;
        self
    }

    /// Sets the default retry policy, overridable per statement.
    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    /// Sets the speculative execution policy.
    pub fn speculative_execution_policy(
        mut self,
        policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    ) -> Self {
        self.config.speculative_execution_policy = policy;
        self
    }

    /// Sets the host selection (load balancing) policy.
    pub fn host_selection_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.host_selection_policy = policy;
        self
    }

    /// Uses the plaintext password authenticator with given credentials.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            password.into(),
        )));
        self
    }

    /// Uses a custom authenticator provider.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Opts out of registering for schema change events.
    pub fn disable_schema_events(mut self, disable: bool) -> Self {
        self.config.disable_schema_events = disable;
        self
    }

    /// Controls whether full schema metadata is fetched on refresh;
    /// true by default.
    pub fn fetch_schema_metadata(mut self, fetch: bool) -> Self {
        self.config.fetch_schema_metadata = fetch;
        self
    }

    /// Sets the heartbeat interval; 30 seconds by default.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Sets the heartbeat response timeout; 30 seconds by default.
    pub fn keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    /// Asks the server to reject requests instead of queueing them
    /// when it is overloaded.
    pub fn throw_on_overload(mut self, throw: bool) -> Self {
        self.config.throw_on_overload = throw;
        self
    }

    /// Sets the interval between periodic metadata refreshes.
    pub fn cluster_metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cluster_metadata_refresh_interval = interval;
        self
    }

    /// Controls write coalescing on connections; enabled by default.
    pub fn write_coalescing(mut self, enable: bool) -> Self {
        self.config.enable_write_coalescing = enable;
        self
    }

    /// Builds the Session after setting all the options
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

/// Creates a [`SessionBuilder`] with default configuration, same as
/// [`SessionBuilder::new`]
impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionBuilder;
    use crate::transport::session::KnownNode;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    #[test]
    fn default_session_builder() {
        let builder = SessionBuilder::new();

        assert!(builder.config.known_nodes.is_empty());
        assert_eq!(builder.config.compression, None);
        assert_eq!(builder.config.port, 9042);
    }

    #[test]
    fn add_known_nodes() {
        let builder = SessionBuilder::new()
            .known_node("test_hostname")
            .known_node_addr(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(172, 17, 0, 3)),
                8465,
            ));

        assert_eq!(builder.config.known_nodes.len(), 2);
        assert!(matches!(
            &builder.config.known_nodes[0],
            KnownNode::Hostname(hostname) if hostname == "test_hostname"
        ));
        assert!(matches!(
            &builder.config.known_nodes[1],
            KnownNode::Address(address) if address.port() == 8465
        ));
    }

    #[test]
    fn all_knobs_are_applied() {
        let builder = SessionBuilder::new()
            .known_node("127.0.0.1")
            .num_conns_per_host(3)
            .max_prepared_stmts(500)
            .max_routing_key_info(250)
            .reconnect_interval(Duration::from_secs(5))
            .request_timeout(Some(Duration::from_secs(7)))
            .use_keyspace("some_keyspace", true)
            .disable_schema_events(true);

        assert_eq!(builder.config.num_conns_per_host, 3);
        assert_eq!(builder.config.max_prepared_stmts, 500);
        assert_eq!(builder.config.max_routing_key_info, 250);
        assert_eq!(builder.config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(builder.config.request_timeout, Some(Duration::from_secs(7)));
        assert_eq!(
            builder.config.used_keyspace,
            Some("some_keyspace".to_string())
        );
        assert!(builder.config.keyspace_case_sensitive);
        assert!(builder.config.disable_schema_events);
    }
}
