use crate::routing::partitioner::PartitionerName;
use crate::routing::Token;
use crate::statement::query::Query;
use crate::transport::connection::{Connection, ConnectionConfig};
use crate::transport::connection_pool::{NodeConnectionPool, PoolConfig};
use crate::transport::errors::{DbError, QueryError};
use crate::transport::iterator::RowIterator;

use futures::TryStreamExt;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tessera_cql::frame::response::event::Event;
use tessera_cql::frame::response::result::Row;
use tessera_cql::utils::parse::{ScanResult, Scanner};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Allows to read current metadata from the cluster
pub(crate) struct MetadataReader {
    connection_config: ConnectionConfig,
    reconnect_interval: Duration,

    control_connection_address: SocketAddr,
    control_connection: NodeConnectionPool,

    // When the control connection fails, MetadataReader tries to connect
    // to one of the known peers instead.
    known_peers: Vec<SocketAddr>,
    fetch_schema: bool,
}

/// Describes all metadata retrieved from the cluster
pub struct Metadata {
    pub peers: Vec<Peer>,
    pub keyspaces: HashMap<String, Keyspace>,
    /// The cluster-wide partitioner, read from the local node.
    pub partitioner: PartitionerName,
}

#[non_exhaustive] // <- so that we can add more fields in a backwards-compatible way
pub struct Peer {
    pub host_id: Uuid,
    pub address: SocketAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keyspace {
    pub strategy: Strategy,
    /// Empty HashMap may as well mean that the client disabled schema fetching in SessionConfig
    pub tables: HashMap<String, Table>,
    /// Empty HashMap may as well mean that the client disabled schema fetching in SessionConfig
    pub views: HashMap<String, MaterializedView>,
    /// Empty HashMap may as well mean that the client disabled schema fetching in SessionConfig
    pub user_defined_types: HashMap<String, Vec<(String, CqlType)>>,
    pub functions: HashMap<String, CqlFunction>,
    pub aggregates: HashMap<String, CqlAggregate>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub columns: HashMap<String, Column>,
    pub partition_key: Vec<String>,
    pub clustering_key: Vec<String>,
    pub partitioner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedView {
    pub view_metadata: Table,
    pub base_table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub type_: CqlType,
    pub kind: ColumnKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CqlType {
    Native(NativeType),
    Collection { frozen: bool, type_: CollectionType },
    Tuple(Vec<CqlType>),
    Vector { type_: Box<CqlType>, dimensions: u16 },
    UserDefinedType { frozen: bool, name: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeType {
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Uuid,
    Varint,
}

impl FromStr for NativeType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let typ = match s {
            "ascii" => NativeType::Ascii,
            "boolean" => NativeType::Boolean,
            "blob" => NativeType::Blob,
            "counter" => NativeType::Counter,
            "date" => NativeType::Date,
            "decimal" => NativeType::Decimal,
            "double" => NativeType::Double,
            "duration" => NativeType::Duration,
            "float" => NativeType::Float,
            "int" => NativeType::Int,
            "bigint" => NativeType::BigInt,
            "text" | "varchar" => NativeType::Text,
            "timestamp" => NativeType::Timestamp,
            "inet" => NativeType::Inet,
            "smallint" => NativeType::SmallInt,
            "tinyint" => NativeType::TinyInt,
            "time" => NativeType::Time,
            "timeuuid" => NativeType::Timeuuid,
            "uuid" => NativeType::Uuid,
            "varint" => NativeType::Varint,
            _ => return Err(()),
        };
        Ok(typ)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionType {
    List(Box<CqlType>),
    Map(Box<CqlType>, Box<CqlType>),
    Set(Box<CqlType>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Regular,
    Static,
    Clustering,
    PartitionKey,
}

impl FromStr for ColumnKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "static" => Ok(Self::Static),
            "clustering" => Ok(Self::Clustering),
            "partition_key" => Ok(Self::PartitionKey),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqlFunction {
    pub argument_names: Vec<String>,
    pub argument_types: Vec<CqlType>,
    pub return_type: CqlType,
    pub language: String,
    pub body: String,
    pub called_on_null_input: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqlAggregate {
    pub argument_types: Vec<CqlType>,
    pub state_type: CqlType,
    pub return_type: CqlType,
    pub state_func: String,
    pub final_func: Option<String>,
    pub initial_condition: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

#[derive(Clone, Debug)]
struct InvalidCqlType {
    type_: String,
    position: usize,
    reason: String,
}

impl fmt::Display for InvalidCqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<InvalidCqlType> for QueryError {
    fn from(e: InvalidCqlType) -> Self {
        QueryError::InvalidMessage(format!(
            "error parsing type \"{:?}\" at position {}: {}",
            e.type_, e.position, e.reason
        ))
    }
}

impl Metadata {
    /// Creates new, dummy metadata from a given list of peers.
    ///
    /// It can be used as a replacement for real metadata when the initial
    /// metadata read fails.
    pub fn new_dummy(initial_peers: &[SocketAddr]) -> Self {
        let peers = initial_peers
            .iter()
            .enumerate()
            .map(|(id, addr)| {
                // Given N nodes, divide the ring into N roughly equal parts
                // and assign them to each node.
                let token = ((id as u128) << 64) / initial_peers.len() as u128;

                Peer {
                    address: *addr,
                    tokens: vec![Token::Murmur3(token as i64)],
                    datacenter: None,
                    rack: None,
                    release_version: None,
                    host_id: Uuid::new_v4(),
                }
            })
            .collect();

        Metadata {
            peers,
            keyspaces: HashMap::new(),
            partitioner: PartitionerName::default(),
        }
    }
}

impl MetadataReader {
    /// Creates a new MetadataReader, which connects to known_peers in the background
    pub(crate) fn new(
        known_peers: &[SocketAddr],
        mut connection_config: ConnectionConfig,
        reconnect_interval: Duration,
        server_event_sender: mpsc::Sender<Event>,
        fetch_schema: bool,
        disable_schema_events: bool,
    ) -> Self {
        let control_connection_address = *known_peers
            .choose(&mut thread_rng())
            .expect("Tried to initialize MetadataReader with empty known_peers list!");

        // Setting the event sender in the connection config will cause the
        // control connection to REGISTER for server events and forward them.
        if !disable_schema_events {
            connection_config.event_sender = Some(server_event_sender);
        }

        let control_connection = Self::make_control_connection_pool(
            control_connection_address,
            connection_config.clone(),
            reconnect_interval,
        );

        MetadataReader {
            control_connection_address,
            control_connection,
            reconnect_interval,
            connection_config,
            known_peers: known_peers.into(),
            fetch_schema,
        }
    }

    /// Fetches current metadata from the cluster
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, QueryError> {
        let mut result = self.fetch_metadata(initial).await;
        if let Ok(metadata) = result {
            self.update_known_peers(&metadata);
            debug!("Fetched new metadata");
            return Ok(metadata);
        }

        // Shuffle known_peers to iterate through them in random order later
        self.known_peers.shuffle(&mut thread_rng());
        debug!(
            "Known peers: {}",
            self.known_peers
                .iter()
                .map(SocketAddr::to_string)
                .collect::<Vec<String>>()
                .join(", ")
        );

        let address_of_failed_control_connection = self.control_connection_address;
        let filtered_known_peers = self
            .known_peers
            .clone()
            .into_iter()
            .filter(|peer| peer != &address_of_failed_control_connection);

        // If fetching metadata on the current control connection failed,
        // try to fetch metadata from another known peer
        for peer in filtered_known_peers {
            let err = match result {
                Ok(_) => break,
                Err(err) => err,
            };

            warn!(
                control_connection_address = self.control_connection_address.to_string().as_str(),
                error = err.to_string().as_str(),
                "Failed to fetch metadata using current control connection"
            );

            self.control_connection_address = peer;
            self.control_connection = Self::make_control_connection_pool(
                self.control_connection_address,
                self.connection_config.clone(),
                self.reconnect_interval,
            );

            debug!(
                "Retrying to establish the control connection on {}",
                self.control_connection_address
            );
            result = self.fetch_metadata(initial).await;
        }

        match &result {
            Ok(metadata) => {
                self.update_known_peers(metadata);
                debug!("Fetched new metadata");
            }
            Err(error) => error!(
                error = error.to_string().as_str(),
                "Could not fetch metadata"
            ),
        }

        result
    }

    async fn fetch_metadata(&self, initial: bool) -> Result<Metadata, QueryError> {
        self.control_connection.wait_until_initialized().await;
        let conn = &self.control_connection.random_connection()?;

        let res = query_metadata(
            conn,
            self.control_connection_address.port(),
            self.fetch_schema,
        )
        .await;

        if initial {
            if let Err(err) = res {
                warn!(
                    error = ?err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and dummy tokens. \
                    This might result in suboptimal performance and schema \
                    information not being available."
                );
                return Ok(Metadata::new_dummy(&self.known_peers));
            }
        }

        res
    }

    fn update_known_peers(&mut self, metadata: &Metadata) {
        self.known_peers = metadata.peers.iter().map(|peer| peer.address).collect();
    }

    fn make_control_connection_pool(
        addr: SocketAddr,
        connection_config: ConnectionConfig,
        reconnect_interval: Duration,
    ) -> NodeConnectionPool {
        let pool_config = PoolConfig {
            connection_config,
            // We want to have only one connection to receive events from
            pool_size: 1,
            reconnect_interval,
        };

        NodeConnectionPool::new(None, addr, pool_config, None)
    }
}

async fn query_metadata(
    conn: &Arc<Connection>,
    connect_port: u16,
    fetch_schema: bool,
) -> Result<Metadata, QueryError> {
    let (peers, partitioner) = query_peers(conn, connect_port).await?;
    let keyspaces = query_keyspaces(conn, fetch_schema).await?;

    // There must be at least one peer
    if peers.is_empty() {
        return Err(QueryError::ProtocolError(
            "Bad Metadata: peers list is empty",
        ));
    }

    // At least one peer has to have some tokens
    if peers.iter().all(|peer| peer.tokens.is_empty()) {
        return Err(QueryError::ProtocolError(
            "Bad Metadata: All peers have empty token list",
        ));
    }

    Ok(Metadata {
        peers,
        keyspaces,
        partitioner,
    })
}

async fn query_rows(
    conn: &Arc<Connection>,
    query_str: &str,
) -> Result<Vec<Row>, QueryError> {
    let mut query = Query::new(query_str);
    query.set_page_size(1024);
    let iterator = RowIterator::new_for_connection_query_iter(query, conn.clone()).await?;
    iterator.try_collect().await
}

type PeerRow = (
    Option<Uuid>,
    Option<IpAddr>,
    Option<i32>,
    Option<String>,
    Option<String>,
    Option<Vec<String>>,
    Option<String>,
);

async fn query_peers(
    conn: &Arc<Connection>,
    connect_port: u16,
) -> Result<(Vec<Peer>, PartitionerName), QueryError> {
    // The local node also carries the cluster-wide partitioner.
    let local_rows = query_rows(
        conn,
        "select host_id, rpc_address, data_center, rack, tokens, release_version, partitioner \
         from system.local",
    )
    .await?;

    // Prefer the v2 peers table: it carries an explicit native port.
    let peers_v2_result = query_rows(
        conn,
        "select host_id, peer, native_port, data_center, rack, tokens, release_version \
         from system.peers_v2",
    )
    .await;
    let peer_rows: Vec<(PeerRow, NodeInfoSource)> = match peers_v2_result {
        Ok(rows) => rows
            .into_iter()
            .map(|row| {
                row.into_typed::<PeerRow>()
                    .map(|r| (r, NodeInfoSource::Peer))
            })
            .collect::<Result<_, _>>()
            .map_err(|_| QueryError::ProtocolError("system.peers_v2 has invalid column type"))?,
        // Older clusters do not have system.peers_v2.
        Err(QueryError::DbError(DbError::Invalid, _)) => {
            let rows = query_rows(
                conn,
                "select host_id, rpc_address, data_center, rack, tokens, release_version \
                 from system.peers",
            )
            .await?;
            rows.into_iter()
                .map(|row| {
                    row.into_typed::<(
                        Option<Uuid>,
                        Option<IpAddr>,
                        Option<String>,
                        Option<String>,
                        Option<Vec<String>>,
                        Option<String>,
                    )>()
                    .map(|(host_id, ip, dc, rack, tokens, version)| {
                        ((host_id, ip, None, dc, rack, tokens, version), NodeInfoSource::Peer)
                    })
                })
                .collect::<Result<_, _>>()
                .map_err(|_| QueryError::ProtocolError("system.peers has invalid column type"))?
        }
        Err(err) => return Err(err),
    };

    let mut partitioner_name = PartitionerName::default();

    let local_address = SocketAddr::new(conn.get_connect_address().ip(), connect_port);

    let mut peers = Vec::with_capacity(peer_rows.len() + 1);

    for row in local_rows {
        let (host_id, _rpc_address, datacenter, rack, tokens, release_version, partitioner): (
            Option<Uuid>,
            Option<IpAddr>,
            Option<String>,
            Option<String>,
            Option<Vec<String>>,
            Option<String>,
            Option<String>,
        ) = row
            .into_typed()
            .map_err(|_| QueryError::ProtocolError("system.local has invalid column type"))?;

        if let Some(partitioner) = partitioner.as_deref() {
            partitioner_name = match PartitionerName::from_str(partitioner) {
                Some(name) => name,
                None => {
                    warn!(
                        "Unknown partitioner {}, defaulting to Murmur3; \
                         token-aware routing may be ineffective",
                        partitioner
                    );
                    PartitionerName::default()
                }
            };
        }

        // The local node's rpc_address is likely unreachable from here;
        // the control connection's address is authoritative.
        if let Some(peer) = create_peer(
            NodeInfoSource::Local,
            host_id,
            local_address,
            datacenter,
            rack,
            tokens,
            release_version,
            partitioner_name,
        ) {
            peers.push(peer);
        }
    }

    for ((host_id, ip, native_port, datacenter, rack, tokens, release_version), source) in peer_rows
    {
        let ip = match ip {
            Some(ip) => ip,
            None => {
                warn!("{} has no address set; skipping node.", source.describe());
                continue;
            }
        };
        let port = native_port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(connect_port);
        let address = SocketAddr::new(ip, port);

        if let Some(peer) = create_peer(
            source,
            host_id,
            address,
            datacenter,
            rack,
            tokens,
            release_version,
            partitioner_name,
        ) {
            peers.push(peer);
        }
    }

    Ok((peers, partitioner_name))
}

#[derive(Clone, Copy)]
enum NodeInfoSource {
    Local,
    Peer,
}

impl NodeInfoSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Local => "local node",
            Self::Peer => "peer",
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_peer(
    source: NodeInfoSource,
    host_id: Option<Uuid>,
    address: SocketAddr,
    datacenter: Option<String>,
    rack: Option<String>,
    tokens: Option<Vec<String>>,
    release_version: Option<String>,
    partitioner: PartitionerName,
) -> Option<Peer> {
    let host_id = match host_id {
        Some(host_id) => host_id,
        None => {
            warn!(
                "{} (address: {}, dc: {:?}, rack: {:?}) has Host ID set to null; skipping node.",
                source.describe(),
                address,
                datacenter,
                rack
            );
            return None;
        }
    };

    let tokens_str: Vec<String> = tokens.unwrap_or_default();

    // Parse the string representation of tokens according to the partitioner.
    let tokens: Vec<Token> = match tokens_str
        .iter()
        .map(|s| partitioner.parse_token(s))
        .collect::<Result<Vec<Token>, _>>()
    {
        Ok(parsed) => parsed,
        Err(e) => {
            trace!(
                "Couldn't parse tokens: {}, proceeding with a dummy token.",
                e
            );
            vec![Token::Murmur3(rand::random::<i64>())]
        }
    };

    Some(Peer {
        host_id,
        address,
        tokens,
        datacenter,
        rack,
        release_version,
    })
}

async fn query_keyspaces(
    conn: &Arc<Connection>,
    fetch_schema: bool,
) -> Result<HashMap<String, Keyspace>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, replication from system_schema.keyspaces",
    )
    .await?;

    let (mut all_tables, mut all_views, mut all_user_defined_types, mut all_functions, mut all_aggregates) =
        if fetch_schema {
            (
                query_tables(conn).await?,
                query_views(conn).await?,
                query_user_defined_types(conn).await?,
                query_functions(conn).await?,
                query_aggregates(conn).await?,
            )
        } else {
            Default::default()
        };

    let mut keyspaces = HashMap::with_capacity(rows.len());
    for row in rows {
        let (keyspace_name, strategy_map): (String, HashMap<String, String>) =
            row.into_typed().map_err(|_| {
                QueryError::ProtocolError("system_schema.keyspaces has invalid column type")
            })?;

        let strategy: Strategy = replication_strategy_from_options(strategy_map)?;
        let tables = all_tables.remove(&keyspace_name).unwrap_or_default();
        let views = all_views.remove(&keyspace_name).unwrap_or_default();
        let user_defined_types = all_user_defined_types
            .remove(&keyspace_name)
            .unwrap_or_default();
        let functions = all_functions.remove(&keyspace_name).unwrap_or_default();
        let aggregates = all_aggregates.remove(&keyspace_name).unwrap_or_default();

        keyspaces.insert(
            keyspace_name,
            Keyspace {
                strategy,
                tables,
                views,
                user_defined_types,
                functions,
                aggregates,
            },
        );
    }

    Ok(keyspaces)
}

async fn query_user_defined_types(
    conn: &Arc<Connection>,
) -> Result<HashMap<String, HashMap<String, Vec<(String, CqlType)>>>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, type_name, field_names, field_types from system_schema.types",
    )
    .await?;

    let mut result = HashMap::new();

    for row in rows {
        let (keyspace_name, type_name, field_names, field_types): (
            String,
            String,
            Vec<String>,
            Vec<String>,
        ) = row.into_typed().map_err(|_| {
            QueryError::ProtocolError("system_schema.types has invalid column type")
        })?;

        let mut fields = Vec::with_capacity(field_names.len());

        for (field_name, field_type) in field_names.into_iter().zip(field_types.iter()) {
            fields.push((field_name, map_string_to_cql_type(field_type)?));
        }

        result
            .entry(keyspace_name)
            .or_insert_with(HashMap::new)
            .insert(type_name, fields);
    }

    Ok(result)
}

async fn query_tables(
    conn: &Arc<Connection>,
) -> Result<HashMap<String, HashMap<String, Table>>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, table_name from system_schema.tables",
    )
    .await?;
    let mut result = HashMap::new();
    let mut tables = query_tables_schema(conn).await?;

    for row in rows {
        let (keyspace_name, table_name): (String, String) = row.into_typed().map_err(|_| {
            QueryError::ProtocolError("system_schema.tables has invalid column type")
        })?;

        let keyspace_and_table_name = (keyspace_name, table_name);

        let table = tables.remove(&keyspace_and_table_name).unwrap_or(Table {
            columns: HashMap::new(),
            partition_key: vec![],
            clustering_key: vec![],
            partitioner: None,
        });

        result
            .entry(keyspace_and_table_name.0)
            .or_insert_with(HashMap::new)
            .insert(keyspace_and_table_name.1, table);
    }

    Ok(result)
}

async fn query_views(
    conn: &Arc<Connection>,
) -> Result<HashMap<String, HashMap<String, MaterializedView>>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, view_name, base_table_name from system_schema.views",
    )
    .await?;

    let mut result = HashMap::new();
    let mut tables = query_tables_schema(conn).await?;

    for row in rows {
        let (keyspace_name, view_name, base_table_name): (String, String, String) =
            row.into_typed().map_err(|_| {
                QueryError::ProtocolError("system_schema.views has invalid column type")
            })?;

        let keyspace_and_view_name = (keyspace_name, view_name);

        let table = tables.remove(&keyspace_and_view_name).unwrap_or(Table {
            columns: HashMap::new(),
            partition_key: vec![],
            clustering_key: vec![],
            partitioner: None,
        });
        let materialized_view = MaterializedView {
            view_metadata: table,
            base_table_name,
        };

        result
            .entry(keyspace_and_view_name.0)
            .or_insert_with(HashMap::new)
            .insert(keyspace_and_view_name.1, materialized_view);
    }

    Ok(result)
}

async fn query_tables_schema(
    conn: &Arc<Connection>,
) -> Result<HashMap<(String, String), Table>, QueryError> {
    // Upon migration from thrift to CQL, the server internally creates a
    // surrogate column "value" of type EmptyType for dense tables. This
    // resolves into this CQL type name and should not reach the user.
    const THRIFT_EMPTY_TYPE: &str = "empty";

    let rows = query_rows(
        conn,
        "select keyspace_name, table_name, column_name, kind, position, type \
         from system_schema.columns",
    )
    .await?;

    type ColumnMaps = (
        HashMap<String, Column>,
        HashMap<i32, String>,
        HashMap<i32, String>,
    );
    let mut tables_schema: HashMap<(String, String), ColumnMaps> = HashMap::new();

    for row in rows {
        let (keyspace_name, table_name, column_name, kind, position, type_): (
            String,
            String,
            String,
            String,
            i32,
            String,
        ) = row.into_typed().map_err(|_| {
            QueryError::ProtocolError("system_schema.columns has invalid column type")
        })?;

        if type_ == THRIFT_EMPTY_TYPE {
            continue;
        }

        let entry = tables_schema
            .entry((keyspace_name, table_name))
            .or_insert_with(|| (HashMap::new(), HashMap::new(), HashMap::new()));

        let cql_type = map_string_to_cql_type(&type_)?;

        let kind = ColumnKind::from_str(&kind)
            .map_err(|_| QueryError::InvalidMessage(format!("invalid column kind {}", kind)))?;

        if kind == ColumnKind::PartitionKey {
            entry.1.insert(position, column_name.clone());
        } else if kind == ColumnKind::Clustering {
            entry.2.insert(position, column_name.clone());
        }

        entry.0.insert(
            column_name,
            Column {
                type_: cql_type,
                kind,
            },
        );
    }

    let mut result = HashMap::new();

    for ((keyspace_name, table_name), (columns, partition_key_columns, clustering_key_columns)) in
        tables_schema
    {
        let mut partition_key = vec!["".to_string(); partition_key_columns.len()];
        for (position, column_name) in partition_key_columns {
            partition_key[position as usize] = column_name;
        }

        let mut clustering_key = vec!["".to_string(); clustering_key_columns.len()];
        for (position, column_name) in clustering_key_columns {
            clustering_key[position as usize] = column_name;
        }

        result.insert(
            (keyspace_name, table_name),
            Table {
                columns,
                partition_key,
                clustering_key,
                partitioner: None,
            },
        );
    }

    Ok(result)
}

async fn query_functions(
    conn: &Arc<Connection>,
) -> Result<HashMap<String, HashMap<String, CqlFunction>>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, function_name, argument_names, argument_types, return_type, \
         language, body, called_on_null_input from system_schema.functions",
    )
    .await?;

    let mut result: HashMap<String, HashMap<String, CqlFunction>> = HashMap::new();

    for row in rows {
        let (keyspace_name, function_name, argument_names, argument_types, return_type, language, body, called_on_null_input): (
            String,
            String,
            Vec<String>,
            Vec<String>,
            String,
            String,
            String,
            bool,
        ) = row.into_typed().map_err(|_| {
            QueryError::ProtocolError("system_schema.functions has invalid column type")
        })?;

        let function = CqlFunction {
            argument_names,
            argument_types: argument_types
                .iter()
                .map(|t| map_string_to_cql_type(t))
                .collect::<Result<_, _>>()?,
            return_type: map_string_to_cql_type(&return_type)?,
            language,
            body,
            called_on_null_input,
        };

        result
            .entry(keyspace_name)
            .or_default()
            .insert(function_name, function);
    }

    Ok(result)
}

async fn query_aggregates(
    conn: &Arc<Connection>,
) -> Result<HashMap<String, HashMap<String, CqlAggregate>>, QueryError> {
    let rows = query_rows(
        conn,
        "select keyspace_name, aggregate_name, argument_types, state_type, return_type, \
         state_func, final_func, initcond from system_schema.aggregates",
    )
    .await?;

    let mut result: HashMap<String, HashMap<String, CqlAggregate>> = HashMap::new();

    for row in rows {
        let (keyspace_name, aggregate_name, argument_types, state_type, return_type, state_func, final_func, initial_condition): (
            String,
            String,
            Vec<String>,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
        ) = row.into_typed().map_err(|_| {
            QueryError::ProtocolError("system_schema.aggregates has invalid column type")
        })?;

        let aggregate = CqlAggregate {
            argument_types: argument_types
                .iter()
                .map(|t| map_string_to_cql_type(t))
                .collect::<Result<_, _>>()?,
            state_type: map_string_to_cql_type(&state_type)?,
            return_type: map_string_to_cql_type(&return_type)?,
            state_func,
            final_func,
            initial_condition,
        };

        result
            .entry(keyspace_name)
            .or_default()
            .insert(aggregate_name, aggregate);
    }

    Ok(result)
}


// The `type` column of system_schema tables holds CQL-style type names
// like `frozen<map<text, list<int>>>`; parse them recursively.
fn map_string_to_cql_type(input: &str) -> Result<CqlType, InvalidCqlType> {
    let mut scanner = Scanner::new(input);
    let invalid = |position: usize, reason: &str| InvalidCqlType {
        type_: input.to_string(),
        position,
        reason: reason.to_string(),
    };

    let typ = scan_cql_type(&mut scanner)
        .map_err(|err| invalid(err.position, err.message))?;
    scanner.skip_spaces();
    if !scanner.done() {
        return Err(invalid(scanner.position(), "leftover characters"));
    }
    Ok(typ)
}

fn scan_cql_type(scanner: &mut Scanner<'_>) -> ScanResult<CqlType> {
    if scanner.eat("frozen<") {
        let inner = scan_cql_type(scanner)?;
        scanner.expect(">", "unclosed frozen<>")?;
        return Ok(frozen_variant_of(inner));
    }

    if scanner.eat("list<") {
        let element = scan_cql_type(scanner)?;
        scanner.expect(">", "unclosed list<>")?;
        return Ok(CqlType::Collection {
            frozen: false,
            type_: CollectionType::List(Box::new(element)),
        });
    }

    if scanner.eat("set<") {
        let element = scan_cql_type(scanner)?;
        scanner.expect(">", "unclosed set<>")?;
        return Ok(CqlType::Collection {
            frozen: false,
            type_: CollectionType::Set(Box::new(element)),
        });
    }

    if scanner.eat("map<") {
        let key = scan_cql_type(scanner)?;
        scanner.expect(",", "a map type needs a key and a value")?;
        scanner.skip_spaces();
        let value = scan_cql_type(scanner)?;
        scanner.expect(">", "unclosed map<>")?;
        return Ok(CqlType::Collection {
            frozen: false,
            type_: CollectionType::Map(Box::new(key), Box::new(value)),
        });
    }

    if scanner.eat("tuple<") {
        let mut elements = vec![scan_cql_type(scanner)?];
        loop {
            if scanner.eat(">") {
                return Ok(CqlType::Tuple(elements));
            }
            scanner.expect(",", "expected ',' or '>' in tuple<>")?;
            scanner.skip_spaces();
            elements.push(scan_cql_type(scanner)?);
        }
    }

    if scanner.eat("vector<") {
        let element = scan_cql_type(scanner)?;
        scanner.expect(",", "a vector type needs a dimension")?;
        scanner.skip_spaces();
        let dimensions = scanner.number("bad vector dimension")?;
        scanner.expect(">", "unclosed vector<>")?;
        return Ok(CqlType::Vector {
            type_: Box::new(element),
            dimensions,
        });
    }

    // A bare word: either a native type or the (possibly qualified) name
    // of a user-defined type.
    let word = scanner.take_while(|c| c.is_alphanumeric() || "._$".contains(c));
    if word.is_empty() {
        return Err(scanner.error("a type name cannot be empty"));
    }
    if let Ok(native) = word.parse::<NativeType>() {
        return Ok(CqlType::Native(native));
    }
    Ok(CqlType::UserDefinedType {
        frozen: false,
        name: word.to_string(),
    })
}

// `frozen<>` is meaningful for collections and UDTs; anything else
// freezes to itself.
fn frozen_variant_of(typ: CqlType) -> CqlType {
    match typ {
        CqlType::Collection { type_, .. } => CqlType::Collection {
            frozen: true,
            type_,
        },
        CqlType::UserDefinedType { name, .. } => CqlType::UserDefinedType { frozen: true, name },
        other => other,
    }
}

const STRATEGY_PACKAGE_PREFIX: &str = "org.apache.cassandra.locator.";

// Builds a [Strategy] from a keyspace's replication map, as stored in
// system_schema.keyspaces: a "class" entry plus class-specific options.
fn replication_strategy_from_options(
    mut options: HashMap<String, String>,
) -> Result<Strategy, QueryError> {
    let class = options.remove("class").ok_or(QueryError::ProtocolError(
        "replication options are missing the 'class' entry",
    ))?;
    let short_name = class.strip_prefix(STRATEGY_PACKAGE_PREFIX).unwrap_or(&class);

    let strategy = match short_name {
        "SimpleStrategy" => {
            let replication_factor = options
                .get("replication_factor")
                .and_then(|rf| rf.parse::<usize>().ok())
                .ok_or(QueryError::ProtocolError(
                    "SimpleStrategy needs a numeric replication_factor",
                ))?;
            Strategy::SimpleStrategy { replication_factor }
        }
        "NetworkTopologyStrategy" => {
            // Anything that parses as a number is a datacenter's
            // replication factor; other entries are configuration noise.
            let datacenter_repfactors = options
                .into_iter()
                .filter_map(|(datacenter, rf)| {
                    rf.parse::<usize>().ok().map(|rf| (datacenter, rf))
                })
                .collect();
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: class,
            data: options,
        },
    };

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(typ: NativeType) -> CqlType {
        CqlType::Native(typ)
    }

    #[test]
    fn scalar_type_names_parse() {
        for (name, expected) in [
            ("timestamp", NativeType::Timestamp),
            ("varchar", NativeType::Text),
            ("duration", NativeType::Duration),
            ("timeuuid", NativeType::Timeuuid),
        ] {
            assert_eq!(map_string_to_cql_type(name).unwrap(), native(expected));
        }
    }

    #[test]
    fn nested_composites_parse() {
        assert_eq!(
            map_string_to_cql_type("map<uuid, frozen<set<inet>>>").unwrap(),
            CqlType::Collection {
                frozen: false,
                type_: CollectionType::Map(
                    Box::new(native(NativeType::Uuid)),
                    Box::new(CqlType::Collection {
                        frozen: true,
                        type_: CollectionType::Set(Box::new(native(NativeType::Inet))),
                    }),
                ),
            }
        );

        assert_eq!(
            map_string_to_cql_type("tuple<bigint, duration>").unwrap(),
            CqlType::Tuple(vec![
                native(NativeType::BigInt),
                native(NativeType::Duration)
            ])
        );

        assert_eq!(
            map_string_to_cql_type("list<frozen<address_udt>>").unwrap(),
            CqlType::Collection {
                frozen: false,
                type_: CollectionType::List(Box::new(CqlType::UserDefinedType {
                    frozen: true,
                    name: "address_udt".to_string(),
                })),
            }
        );
    }

    #[test]
    fn vector_types_parse() {
        assert_eq!(
            map_string_to_cql_type("vector<float, 1536>").unwrap(),
            CqlType::Vector {
                type_: Box::new(native(NativeType::Float)),
                dimensions: 1536,
            }
        );
        assert_eq!(
            map_string_to_cql_type("vector<frozen<tuple<int, int>>, 4>").unwrap(),
            CqlType::Vector {
                type_: Box::new(CqlType::Tuple(vec![
                    native(NativeType::Int),
                    native(NativeType::Int)
                ])),
                dimensions: 4,
            }
        );
    }

    #[test]
    fn qualified_udt_names_parse() {
        assert_eq!(
            map_string_to_cql_type("com.example.udt$inner").unwrap(),
            CqlType::UserDefinedType {
                frozen: false,
                name: "com.example.udt$inner".to_string(),
            }
        );
    }

    #[test]
    fn malformed_type_strings_are_rejected() {
        for bad in [
            "list<int",
            "map<int>",
            "vector<float>",
            "tuple<>",
            "list<int> trailing",
            "",
        ] {
            assert!(map_string_to_cql_type(bad).is_err(), "{:?}", bad);
        }
    }

    fn options(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn simple_strategy_needs_a_numeric_rf() {
        assert_eq!(
            replication_strategy_from_options(options(&[
                ("class", "SimpleStrategy"),
                ("replication_factor", "2"),
            ]))
            .unwrap(),
            Strategy::SimpleStrategy {
                replication_factor: 2
            }
        );

        assert!(replication_strategy_from_options(options(&[
            ("class", "SimpleStrategy"),
            ("replication_factor", "several"),
        ]))
        .is_err());
        assert!(
            replication_strategy_from_options(options(&[("class", "SimpleStrategy")])).is_err()
        );
    }

    #[test]
    fn network_topology_strategy_collects_numeric_entries() {
        let strategy = replication_strategy_from_options(options(&[
            (
                "class",
                "org.apache.cassandra.locator.NetworkTopologyStrategy",
            ),
            ("east", "3"),
            ("west", "1"),
            ("replication_factor_warn_threshold", "none"),
        ]))
        .unwrap();

        let mut expected = HashMap::new();
        expected.insert("east".to_string(), 3);
        expected.insert("west".to_string(), 1);
        assert_eq!(
            strategy,
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: expected
            }
        );
    }

    #[test]
    fn unknown_strategies_are_kept_verbatim() {
        assert_eq!(
            replication_strategy_from_options(options(&[("class", "LocalStrategy")])).unwrap(),
            Strategy::LocalStrategy
        );

        let strategy = replication_strategy_from_options(options(&[
            ("class", "com.example.EverywhereStrategy"),
            ("knob", "11"),
        ]))
        .unwrap();
        match strategy {
            Strategy::Other { name, data } => {
                assert_eq!(name, "com.example.EverywhereStrategy");
                assert_eq!(data.get("knob").map(String::as_str), Some("11"));
            }
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn missing_class_is_rejected() {
        assert!(replication_strategy_from_options(HashMap::new()).is_err());
    }
}
