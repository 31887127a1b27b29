use std::sync::Arc;

use super::{Consistency, SerialConsistency, StatementConfig};
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::transport::retry_policy::RetryPolicy;

pub use tessera_cql::frame::request::batch::BatchType;

/// CQL batch statement.
///
/// This represents a CQL batch that can be executed on a server.
#[derive(Clone)]
pub struct Batch {
    pub config: StatementConfig,

    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    /// Creates a new, empty `Batch` of `batch_type` type.
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            config: Default::default(),
        }
    }

    /// Creates a new, empty `Batch` of `batch_type` type with the
    /// provided statements.
    pub fn new_with_statements(batch_type: BatchType, statements: Vec<BatchStatement>) -> Self {
        Self {
            batch_type,
            statements,
            config: Default::default(),
        }
    }

    /// Appends a new statement to the batch.
    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    /// Gets the type of the batch.
    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    /// Sets the consistency to be used when executing this batch.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Sets the serial consistency to be used when executing this batch.
    /// (Ignored unless the batch is an LWT)
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency
    }

    /// Sets the idempotence of this batch.
    /// A batch is idempotent if it can be applied multiple times without
    /// changing the result of the initial application.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Sets the tracing flag for this batch.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Sets the default timestamp for this batch in microseconds.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the retry policy for this batch, overriding the session one.
    pub fn set_retry_policy(&mut self, retry_policy: Arc<dyn RetryPolicy>) {
        self.config.retry_policy = Some(retry_policy);
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new(BatchType::Logged)
    }
}

/// This enum represents a CQL statement that can be part of a batch:
/// either an unprepared query or a prepared statement.
#[derive(Clone)]
pub enum BatchStatement {
    Query(Query),
    PreparedStatement(PreparedStatement),
}

impl From<&str> for BatchStatement {
    fn from(s: &str) -> Self {
        BatchStatement::Query(Query::from(s))
    }
}

impl From<Query> for BatchStatement {
    fn from(q: Query) -> Self {
        BatchStatement::Query(q)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(p: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(p)
    }
}

impl<'s> From<&'s BatchStatement> for tessera_cql::frame::request::batch::BatchStatement<'s> {
    fn from(value: &'s BatchStatement) -> Self {
        use tessera_cql::frame::request::batch::BatchStatement as FrameStatement;
        use std::borrow::Cow;

        match value {
            BatchStatement::Query(query) => FrameStatement::Query {
                text: Cow::Borrowed(&query.contents),
            },
            BatchStatement::PreparedStatement(prepared) => FrameStatement::Prepared {
                id: Cow::Borrowed(prepared.get_id()),
            },
        }
    }
}
