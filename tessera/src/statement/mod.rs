pub mod batch;
pub mod prepared_statement;
pub mod query;

use std::sync::Arc;
use std::time::Duration;

use crate::transport::retry_policy::RetryPolicy;
use crate::transport::speculative_execution::SpeculativeExecutionPolicy;

pub use tessera_cql::frame::types::{Consistency, SerialConsistency};

/// Configuration shared by all statement kinds: unprepared, prepared
/// and batches.
#[derive(Debug, Clone, Default)]
pub struct StatementConfig {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<SerialConsistency>,

    /// A statement is idempotent if it can be applied multiple times without
    /// changing the result of the initial application.
    /// Only idempotent statements are retried after unclear failures and
    /// raced by speculative executions.
    pub is_idempotent: bool,

    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    pub tracing: bool,
    pub timestamp: Option<i64>,
    pub request_timeout: Option<Duration>,
}

impl StatementConfig {
    /// Consistency to use for the statement: its own, or the session default.
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}
