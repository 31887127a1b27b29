//! Error types shared by the codec and the driver.

use crate::frame::frame_errors::{FrameError, ParseError};
use crate::frame::types::Consistency;
use crate::frame::value::SerializeValuesError;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Error that occurred during query execution
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// The server rejected the query; carries the typed error plus the
    /// server's free-form message.
    #[error("Server error: {0} (message: {1})")]
    DbError(DbError, String),

    /// The query was invalid before it ever reached the wire.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// The connection failed underneath the query.
    #[error("I/O error: {0}")]
    IoError(Arc<std::io::Error>),

    /// The peer broke the protocol; fatal for its connection.
    #[error("Protocol violation: {0}")]
    ProtocolError(&'static str),

    /// A frame could not be understood.
    #[error("Unreadable message: {0}")]
    InvalidMessage(String),

    /// The client-side deadline passed before a response arrived.
    #[error("Deadline exceeded: {0}")]
    ClientTimeout(String),

    /// An operation ran out of time.
    #[error("Timed out")]
    TimeoutError,

    /// All stream ids on the connection are taken; the caller should try
    /// another connection rather than queue up.
    #[error("No free stream id on the connection")]
    UnableToAllocStreamId,

    /// Too many stream ids on the connection belong to cancelled requests
    /// whose responses never came back; the connection is stuck.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),
}

/// An error sent from the database in response to a query,
/// selected by the server's error code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The statement does not parse
    #[error("The statement does not parse")]
    SyntaxError,

    /// The statement parses but cannot be executed as written
    #[error("The statement parses but cannot be executed as written")]
    Invalid,

    /// The keyspace or table to be created already exists
    #[error("Keyspace or table already exists (keyspace: {keyspace}, table: {table})")]
    AlreadyExists {
        /// The keyspace created, or the keyspace holding the created table
        keyspace: String,
        /// The table created; empty when a keyspace was being created
        table: String,
    },

    /// A user defined function failed mid-execution
    #[error(
        "User defined function {keyspace}.{function}({arg_types:?}) failed during execution"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    /// The provided credentials were rejected
    #[error("The provided credentials were rejected")]
    AuthenticationError,

    /// The authenticated user may not run this statement
    #[error("The authenticated user may not run this statement")]
    Unauthorized,

    /// A server-side configuration problem blocks the statement
    #[error("A server-side configuration problem blocks the statement")]
    ConfigError,

    /// Too few live replicas to reach the requested consistency
    #[error(
        "Too few live replicas for consistency {consistency}: {required} required, {alive} alive"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    /// The coordinator shed the request due to overload
    #[error("The coordinator shed the request due to overload")]
    Overloaded,

    /// The coordinator is still bootstrapping and cannot serve requests
    #[error("The coordinator is still bootstrapping and cannot serve requests")]
    IsBootstrapping,

    /// A truncation failed on the server
    #[error("A truncation failed on the server")]
    TruncateError,

    /// Replica reads did not arrive within the coordinator's timeout
    #[error("Read timed out at consistency {consistency}: {received} of {required} replies, data_present: {data_present}")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Whether the replica holding the actual data replied
        data_present: bool,
    },

    /// Replica writes did not arrive within the coordinator's timeout
    #[error("Write timed out at consistency {consistency}: {received} of {required} replies during a {write_type} write")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// The stage of the write that timed out
        write_type: WriteType,
    },

    /// Replicas failed (rather than timed out) while serving a read
    #[error(
        "Read failed at consistency {consistency}: {numfailures} replica failures, \
        {received} of {required} replies, data_present: {data_present}"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    /// Replicas failed (rather than timed out) while serving a write
    #[error(
        "Write failed at consistency {consistency}: {numfailures} replica failures, \
        {received} of {required} replies during a {write_type} write"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// The coordinator does not know whether a conditional update was
    /// applied; the paxos round timed out after the proposal.
    #[error(
        "Unknown outcome of a conditional update at consistency {consistency}: \
        {received} of {required} replies"
    )]
    CasWriteUnknown {
        consistency: Consistency,
        received: i32,
        required: i32,
    },

    /// The executed statement is not known to this node;
    /// the driver re-prepares and retries on its own.
    #[error("The statement is not prepared on this node")]
    Unprepared {
        /// Id of the unprepared statement
        statement_id: Bytes,
    },

    /// An internal server error, i.e. a server-side bug
    #[error("An internal server error, i.e. a server-side bug")]
    ServerError,

    /// The server could not make sense of a frame this driver sent
    #[error("The server could not make sense of a frame this driver sent")]
    ProtocolError,

    /// An error code this driver does not know
    #[error("An error code this driver does not know: {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// Whether a retry on another (or the same) node can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Unavailable { .. }
                | DbError::Overloaded
                | DbError::IsBootstrapping
                | DbError::TruncateError
                | DbError::ReadTimeout { .. }
                | DbError::WriteTimeout { .. }
                | DbError::ServerError
        )
    }
}

/// The stage of a write operation an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// An ordinary single-partition write
    Simple,
    /// The batch proper; the batch log had already been written
    Batch,
    /// An unlogged batch, skipping the batch log entirely
    UnloggedBatch,
    /// A counter update, batched or not
    Counter,
    /// The preliminary write to the batch log of a logged batch
    BatchLog,
    /// The commit stage of a conditional update
    Cas,
    /// A materialized-view update waiting on the view lock
    View,
    /// A write into CDC-tracked data that ran into the CDC space cap
    Cdc,
    /// A stage name this driver does not know
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

/// The caller handed the session something unusable.
#[derive(Error, Debug, Clone)]
#[error("Invalid query passed to Session")]
pub enum BadQuery {
    /// A bind value refused to serialize
    #[error("Serializing values failed: {0} ")]
    SerializeValuesError(#[from] SerializeValuesError),

    /// A batch got a different number of value lists than statements
    #[error("Got {0} value lists for {1} batch statements")]
    ValueLenMismatch(usize, usize),

    /// A partition key component too long for the composite key format
    #[error("Partition key component of {0} bytes exceeds the limit of {1}")]
    ValuesTooLongForKey(usize, usize),

    /// Too many statements in a batch; the server's field is 16 bits
    #[error("Batch has {0} statements, while the maximum is 65,535")]
    TooManyQueriesInBatchStatement(usize),

    /// The requested keyspace name is not a legal keyspace name
    #[error("Bad keyspace name: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// Error that occurred while bringing a session up.
#[derive(Error, Debug, Clone)]
pub enum NewSessionError {
    /// A contact point's hostname did not resolve
    #[error("Couldn't resolve address: {0}")]
    FailedToResolveAddress(String),

    /// The config names no contact points at all
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// A server rejected one of the setup requests
    #[error("Server error: {0} (message: {1})")]
    DbError(DbError, String),

    /// A setup query was invalid
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Connecting failed at the socket level
    #[error("I/O error: {0}")]
    IoError(Arc<std::io::Error>),

    /// A peer broke the protocol during setup
    #[error("Protocol violation: {0}")]
    ProtocolError(&'static str),

    /// A setup-time frame could not be understood
    #[error("Unreadable message: {0}")]
    InvalidMessage(String),

    /// No node could be reached in time
    #[error("Timed out")]
    TimeoutError,
}

/// A keyspace name that `Session::use_keyspace()` cannot accept.
#[derive(Debug, Error, Clone)]
pub enum BadKeyspaceName {
    /// The name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// The name exceeds the 48-character cap
    #[error("Keyspace name '{0}' is {1} characters long; the cap is 48")]
    TooLong(String, usize),

    /// The name holds something other than alphanumerics and underscores
    #[error("Keyspace name '{0}' contains the forbidden character '{1}'")]
    IllegalCharacter(String, char),
}

impl From<std::io::Error> for QueryError {
    fn from(io_error: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(io_error))
    }
}

impl From<SerializeValuesError> for QueryError {
    fn from(serialized_err: SerializeValuesError) -> QueryError {
        QueryError::BadQuery(BadQuery::SerializeValuesError(serialized_err))
    }
}

impl From<ParseError> for QueryError {
    fn from(parse_error: ParseError) -> QueryError {
        QueryError::InvalidMessage(format!("Error parsing message: {}", parse_error))
    }
}

impl From<FrameError> for QueryError {
    fn from(frame_error: FrameError) -> QueryError {
        QueryError::InvalidMessage(format!("Frame error: {}", frame_error))
    }
}

impl From<tokio::time::error::Elapsed> for QueryError {
    fn from(timer_error: tokio::time::error::Elapsed) -> QueryError {
        QueryError::ClientTimeout(format!("{}", timer_error))
    }
}

impl From<BadKeyspaceName> for QueryError {
    fn from(keyspace_err: BadKeyspaceName) -> QueryError {
        QueryError::BadQuery(BadQuery::BadKeyspaceName(keyspace_err))
    }
}

impl From<std::io::Error> for NewSessionError {
    fn from(io_error: std::io::Error) -> NewSessionError {
        NewSessionError::IoError(Arc::new(io_error))
    }
}

impl From<QueryError> for NewSessionError {
    fn from(query_error: QueryError) -> NewSessionError {
        match query_error {
            QueryError::DbError(e, msg) => NewSessionError::DbError(e, msg),
            QueryError::BadQuery(e) => NewSessionError::BadQuery(e),
            QueryError::IoError(e) => NewSessionError::IoError(e),
            QueryError::ProtocolError(m) => NewSessionError::ProtocolError(m),
            QueryError::InvalidMessage(m) => NewSessionError::InvalidMessage(m),
            QueryError::ClientTimeout(_) => NewSessionError::TimeoutError,
            QueryError::TimeoutError => NewSessionError::TimeoutError,
            QueryError::UnableToAllocStreamId => {
                NewSessionError::ProtocolError("Unable to allocate stream id")
            }
            QueryError::TooManyOrphanedStreamIds(_) => {
                NewSessionError::ProtocolError("Too many orphaned stream ids")
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{DbError, QueryError, WriteType};
    use crate::frame::types::Consistency;

    #[test]
    fn write_type_from_str() {
        let test_cases: [(&str, WriteType); 9] = [
            ("SIMPLE", WriteType::Simple),
            ("BATCH", WriteType::Batch),
            ("UNLOGGED_BATCH", WriteType::UnloggedBatch),
            ("COUNTER", WriteType::Counter),
            ("BATCH_LOG", WriteType::BatchLog),
            ("CAS", WriteType::Cas),
            ("VIEW", WriteType::View),
            ("CDC", WriteType::Cdc),
            ("SOMEOTHER", WriteType::Other("SOMEOTHER".to_string())),
        ];

        for (write_type_str, expected_write_type) in &test_cases {
            let write_type = WriteType::from(*write_type_str);
            assert_eq!(write_type, *expected_write_type);
        }
    }

    // Error displays carry the typed fields plus the server's own message.
    #[test]
    fn dberror_display_carries_all_details() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };
        assert_eq!(
            db_error.to_string(),
            "Too few live replicas for consistency Three: 3 required, 2 alive"
        );

        let query_error = QueryError::DbError(db_error, "cluster is degraded".to_string());
        assert_eq!(
            query_error.to_string(),
            "Server error: Too few live replicas for consistency Three: 3 required, 2 alive (message: cluster is degraded)"
        );
    }
}
