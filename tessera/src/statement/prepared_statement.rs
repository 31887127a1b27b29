use bytes::Bytes;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use uuid::Uuid;

use super::StatementConfig;
use crate::routing::partitioner::PartitionerName;
use crate::routing::{compute_routing_key, PartitionKeyError, Token};
use crate::transport::errors::{BadQuery, QueryError};
use tessera_cql::frame::response::result::PreparedMetadata;
use tessera_cql::frame::value::SerializedValues;

/// Represents a statement prepared on the server.
#[derive(Debug)]
pub struct PreparedStatement {
    id: Bytes,
    metadata: PreparedMetadata,
    // Protocol 5: id of the result metadata at prepare time. Updated when
    // the server reports Metadata_changed; stale readers converge on the
    // next execution.
    result_metadata_id: StdMutex<Option<Bytes>>,
    statement: String,
    page_size: Option<i32>,
    partitioner_name: PartitionerName,
    pub config: StatementConfig,
    pub prepare_tracing_ids: Vec<Uuid>,
}

impl Clone for PreparedStatement {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            result_metadata_id: StdMutex::new(self.get_result_metadata_id()),
            statement: self.statement.clone(),
            page_size: self.page_size,
            partitioner_name: self.partitioner_name.clone(),
            config: self.config.clone(),
            prepare_tracing_ids: self.prepare_tracing_ids.clone(),
        }
    }
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        result_metadata_id: Option<Bytes>,
        metadata: PreparedMetadata,
        statement: String,
        page_size: Option<i32>,
        config: StatementConfig,
    ) -> Self {
        Self {
            id,
            metadata,
            result_metadata_id: StdMutex::new(result_metadata_id),
            statement,
            page_size,
            partitioner_name: Default::default(),
            config,
            prepare_tracing_ids: Vec::new(),
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement
    }

    /// Sets the page size for this CQL query.
    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(page_size > 0, "page size must be larger than 0");
        self.page_size = Some(page_size);
    }

    /// Disables paging for this CQL query.
    pub fn disable_paging(&mut self) {
        self.page_size = None;
    }

    /// Returns the page size for this CQL query.
    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// The prepared statement can compute a routing key only when the
    /// server reported which bound variables form the partition key.
    pub fn is_token_aware(&self) -> bool {
        !self.metadata.pk_indexes.is_empty()
    }

    /// Returns the name of the keyspace this statement operates on.
    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.metadata
            .col_specs
            .first()
            .map(|col_spec| col_spec.table_spec.ks_name.as_str())
    }

    /// Returns the name of the table this statement operates on.
    pub fn get_table_name(&self) -> Option<&str> {
        self.metadata
            .col_specs
            .first()
            .map(|col_spec| col_spec.table_spec.table_name.as_str())
    }

    pub(crate) fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    pub(crate) fn get_result_metadata_id(&self) -> Option<Bytes> {
        self.result_metadata_id.lock().unwrap().clone()
    }

    pub(crate) fn update_result_metadata_id(&self, new_id: Bytes) {
        *self.result_metadata_id.lock().unwrap() = Some(new_id);
    }

    pub(crate) fn set_partitioner_name(&mut self, partitioner_name: PartitionerName) {
        self.partitioner_name = partitioner_name;
    }

    pub(crate) fn get_partitioner_name(&self) -> &PartitionerName {
        &self.partitioner_name
    }

    /// Computes the routing key for the given bound values.
    pub fn compute_partition_key(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Bytes>, PartitionKeyError> {
        compute_routing_key(&self.metadata.pk_indexes, bound_values)
    }

    /// Calculates the token the statement and values are routed to.
    /// Returns `None` for statements whose partition key cannot be derived.
    pub fn calculate_token(
        &self,
        bound_values: &SerializedValues,
    ) -> Result<Option<Token>, QueryError> {
        let routing_key = match self.compute_partition_key(bound_values) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(None),
            Err(PartitionKeyError::ValueTooLong(len, max)) => {
                return Err(QueryError::BadQuery(BadQuery::ValuesTooLongForKey(
                    len, max,
                )))
            }
            // A statement with null or unbound partition key values is still
            // executable; it is just not routable.
            Err(PartitionKeyError::NullValueInPartitionKey)
            | Err(PartitionKeyError::NoPkIndexValue(_, _)) => return Ok(None),
        };
        Ok(Some(self.partitioner_name.hash(&routing_key)))
    }

    /// Sets the consistency to be used when executing this statement.
    pub fn set_consistency(&mut self, c: super::Consistency) {
        self.config.consistency = Some(c);
    }

    /// Sets the idempotence of this statement.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Sets the tracing flag for this statement.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    /// Sets the default timestamp for this statement in microseconds.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Sets the retry policy for this statement, overriding the session one.
    pub fn set_retry_policy(&mut self, retry_policy: Arc<dyn crate::transport::retry_policy::RetryPolicy>) {
        self.config.retry_policy = Some(retry_policy);
    }
}
