//! Per-query retry decisions.
//!
//! When an attempt fails, the executor asks a [RetrySession] what to do
//! with the error; the session lives for one user-level execution and may
//! keep per-query state (e.g. how many retries it has already granted).

use crate::statement::Consistency;
use crate::transport::errors::{DbError, QueryError, WriteType};

/// Information about a failed query
pub struct QueryInfo<'a> {
    /// The error with which the query failed
    pub error: &'a QueryError,
    /// Whether the caller marked the statement as idempotent. `false`
    /// means "unknown", which the policies treat as "not idempotent".
    pub is_idempotent: bool,
    /// Consistency with which the query failed
    pub consistency: Consistency,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameNode(Option<Consistency>),
    RetryNextNode(Option<Consistency>),
    DontRetry,
    /// Swallow a write error; the caller observes a zero-row success.
    IgnoreWriteError,
}

/// Specifies a policy used to decide when to retry a query
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new query, starts a session of deciding about retries
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single query to decide when to retry it
/// After this query is finished it is destroyed or reset
pub trait RetrySession: Send + Sync {
    /// Called after the query failed - decide what to do next
    fn decide_should_retry(&mut self, query_info: QueryInfo) -> RetryDecision;

    /// Reset before using for a new query
    fn reset(&mut self);
}

/// Overrides unsafe retry decisions for non-idempotent statements.
///
/// A write timeout, read timeout or a transport error leaves the outcome of
/// the attempt unknown; retrying could apply a non-idempotent write twice.
/// Such decisions are downgraded to a rethrow unless the statement was
/// declared idempotent.
pub(crate) fn enforce_idempotency_gate(
    decision: RetryDecision,
    error: &QueryError,
    is_idempotent: bool,
) -> RetryDecision {
    if is_idempotent {
        return decision;
    }

    let outcome_unknown = matches!(
        error,
        QueryError::IoError(_)
            | QueryError::TimeoutError
            | QueryError::ClientTimeout(_)
            | QueryError::DbError(DbError::WriteTimeout { .. }, _)
            | QueryError::DbError(DbError::ReadTimeout { .. }, _)
    );

    match decision {
        RetryDecision::RetrySameNode(_) | RetryDecision::RetryNextNode(_) if outcome_unknown => {
            RetryDecision::DontRetry
        }
        other => other,
    }
}

/// Forwards all errors directly to the user, never retries
#[derive(Debug)]
pub struct FallthroughRetryPolicy;
pub struct FallthroughRetrySession;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl Default for FallthroughRetryPolicy {
    fn default() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _query_info: QueryInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

/// The default policy: retries only where a retry has a real chance of
/// succeeding and cannot corrupt anything.
#[derive(Debug)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

// One single-use retry token per error class. Granting at most one retry
// for each class keeps a flapping coordinator from trapping the query in
// a retry storm.
pub struct DefaultRetrySession {
    unavailable_token: bool,
    read_timeout_token: bool,
    write_timeout_token: bool,
}

impl DefaultRetrySession {
    pub fn new() -> DefaultRetrySession {
        DefaultRetrySession {
            unavailable_token: true,
            read_timeout_token: true,
            write_timeout_token: true,
        }
    }

    fn spend(token: &mut bool) -> bool {
        std::mem::replace(token, false)
    }
}

impl Default for DefaultRetrySession {
    fn default() -> DefaultRetrySession {
        DefaultRetrySession::new()
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, query_info: QueryInfo) -> RetryDecision {
        // Paxos rounds are not replayed.
        if query_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        }

        let QueryInfo {
            error,
            is_idempotent,
            ..
        } = query_info;

        match error {
            // Whatever ails this coordinator - an I/O failure, overload,
            // an internal error, a failed truncation - the next node is
            // unaffected by it. The attempt may have reached the cluster
            // though, so only idempotent statements go again.
            QueryError::IoError(_)
            | QueryError::DbError(
                DbError::Overloaded | DbError::ServerError | DbError::TruncateError,
                _,
            ) => {
                if is_idempotent {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }

            // The coordinator thinks too few replicas are alive; often
            // it is the coordinator itself that is partitioned away, so
            // one try through a different node is worth it. Nothing was
            // written, hence idempotency does not matter.
            QueryError::DbError(DbError::Unavailable { .. }, _) => {
                if Self::spend(&mut self.unavailable_token) {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }

            // A read timed out although enough replicas answered - they
            // just sent digests instead of data, which happens when the
            // chosen data replica was dying. The same coordinator will
            // avoid it on the second try. If actual data was present or
            // replicas are genuinely short, retrying cannot help.
            QueryError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                let only_digests_arrived = received >= required && !*data_present;
                if only_digests_arrived && Self::spend(&mut self.read_timeout_token) {
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }

            // A timed-out batch-log write means the batch never started
            // to apply, so replaying an idempotent statement is safe.
            // Any other write stage is ambiguous and is not replayed.
            QueryError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                let batch_log_stage = *write_type == WriteType::BatchLog;
                if batch_log_stage && is_idempotent && Self::spend(&mut self.write_timeout_token) {
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }

            // A bootstrapping coordinator rejects queries without doing
            // any work; any other node is a strictly better choice.
            QueryError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextNode(None)
            }

            // This connection ran out of stream slots; a sibling node
            // (or a sibling connection picked by its pool) has free ones.
            QueryError::UnableToAllocStreamId => RetryDecision::RetryNextNode(None),

            // Everything else - syntax errors, auth problems, protocol
            // violations, read/write failures - would fail identically
            // anywhere.
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::ErrorKind;
    use std::sync::Arc;

    fn db_error(error: DbError) -> QueryError {
        QueryError::DbError(error, "message".to_string())
    }

    fn io_error() -> QueryError {
        QueryError::IoError(Arc::new(std::io::Error::new(ErrorKind::Other, "broken")))
    }

    fn read_timeout(received: i32, required: i32, data_present: bool) -> QueryError {
        db_error(DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received,
            required,
            data_present,
        })
    }

    fn write_timeout(write_type: WriteType) -> QueryError {
        db_error(DbError::WriteTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            write_type,
        })
    }

    fn unavailable() -> QueryError {
        db_error(DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        })
    }

    // Asks a fresh default session for a decision.
    fn first_decision(error: &QueryError, is_idempotent: bool) -> RetryDecision {
        DefaultRetryPolicy::new()
            .new_session()
            .decide_should_retry(QueryInfo {
                error,
                is_idempotent,
                consistency: Consistency::Quorum,
            })
    }

    #[test]
    fn hard_errors_are_never_retried() {
        let hard_errors = [
            db_error(DbError::SyntaxError),
            db_error(DbError::Invalid),
            db_error(DbError::Unauthorized),
            db_error(DbError::AuthenticationError),
            db_error(DbError::ConfigError),
            db_error(DbError::ProtocolError),
            db_error(DbError::AlreadyExists {
                keyspace: "ks".to_string(),
                table: "t".to_string(),
            }),
            db_error(DbError::FunctionFailure {
                keyspace: "ks".to_string(),
                function: "f".to_string(),
                arg_types: vec![],
            }),
            db_error(DbError::ReadFailure {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                numfailures: 1,
                data_present: false,
            }),
            db_error(DbError::WriteFailure {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                numfailures: 1,
                write_type: WriteType::Simple,
            }),
            db_error(DbError::Unprepared {
                statement_id: Bytes::from_static(b"id"),
            }),
            db_error(DbError::Other(0x5555)),
            QueryError::ProtocolError("bad frame"),
        ];

        for error in &hard_errors {
            for is_idempotent in [false, true] {
                assert_eq!(
                    first_decision(error, is_idempotent),
                    RetryDecision::DontRetry,
                    "{:?}",
                    error
                );
            }
        }
    }

    #[test]
    fn node_local_problems_move_on_only_when_idempotent() {
        let node_local = [
            io_error(),
            db_error(DbError::Overloaded),
            db_error(DbError::ServerError),
            db_error(DbError::TruncateError),
        ];

        for error in &node_local {
            assert_eq!(
                first_decision(error, true),
                RetryDecision::RetryNextNode(None)
            );
            assert_eq!(first_decision(error, false), RetryDecision::DontRetry);
        }
    }

    #[test]
    fn bootstrapping_node_is_always_skipped() {
        let error = db_error(DbError::IsBootstrapping);
        assert_eq!(
            first_decision(&error, false),
            RetryDecision::RetryNextNode(None)
        );
        assert_eq!(
            first_decision(&error, true),
            RetryDecision::RetryNextNode(None)
        );
    }

    #[test]
    fn stream_exhaustion_moves_to_another_target() {
        assert_eq!(
            first_decision(&QueryError::UnableToAllocStreamId, false),
            RetryDecision::RetryNextNode(None)
        );
    }

    #[test]
    fn unavailable_gets_exactly_one_retry() {
        let error = unavailable();
        let mut session = DefaultRetryPolicy::new().new_session();

        let ask = |session: &mut Box<dyn RetrySession>| {
            session.decide_should_retry(QueryInfo {
                error: &error,
                is_idempotent: false,
                consistency: Consistency::Quorum,
            })
        };

        assert_eq!(ask(&mut session), RetryDecision::RetryNextNode(None));
        assert_eq!(ask(&mut session), RetryDecision::DontRetry);
    }

    #[test]
    fn read_timeout_retried_once_when_only_digests_arrived() {
        let digests_only = read_timeout(2, 2, false);
        let mut session = DefaultRetryPolicy::new().new_session();
        let ask = |session: &mut Box<dyn RetrySession>, error: &QueryError| {
            session.decide_should_retry(QueryInfo {
                error,
                is_idempotent: true,
                consistency: Consistency::Quorum,
            })
        };

        assert_eq!(
            ask(&mut session, &digests_only),
            RetryDecision::RetrySameNode(None)
        );
        assert_eq!(ask(&mut session, &digests_only), RetryDecision::DontRetry);

        // Data did arrive, or not enough replicas answered: no point.
        assert_eq!(
            first_decision(&read_timeout(2, 2, true), true),
            RetryDecision::DontRetry
        );
        assert_eq!(
            first_decision(&read_timeout(1, 2, false), true),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn write_timeout_retried_only_for_idempotent_batch_log() {
        let batch_log = write_timeout(WriteType::BatchLog);
        let mut session = DefaultRetryPolicy::new().new_session();
        let ask = |session: &mut Box<dyn RetrySession>| {
            session.decide_should_retry(QueryInfo {
                error: &batch_log,
                is_idempotent: true,
                consistency: Consistency::Quorum,
            })
        };
        assert_eq!(ask(&mut session), RetryDecision::RetrySameNode(None));
        assert_eq!(ask(&mut session), RetryDecision::DontRetry);

        assert_eq!(
            first_decision(&write_timeout(WriteType::BatchLog), false),
            RetryDecision::DontRetry
        );
        assert_eq!(
            first_decision(&write_timeout(WriteType::Simple), true),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn serial_consistency_is_never_retried() {
        let error = db_error(DbError::IsBootstrapping);
        let decision = DefaultRetryPolicy::new()
            .new_session()
            .decide_should_retry(QueryInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::Serial,
            });
        assert_eq!(decision, RetryDecision::DontRetry);
    }

    #[test]
    fn reset_returns_the_spent_tokens() {
        let error = unavailable();
        let mut session = DefaultRetrySession::new();
        let info = |error: &QueryError| QueryInfo {
            error,
            is_idempotent: false,
            consistency: Consistency::Quorum,
        };

        assert_eq!(
            session.decide_should_retry(info(&error)),
            RetryDecision::RetryNextNode(None)
        );
        session.reset();
        assert_eq!(
            session.decide_should_retry(info(&error)),
            RetryDecision::RetryNextNode(None)
        );
    }

    // The gate: a non-idempotent statement is never retried after an error
    // which leaves the attempt's outcome unknown, regardless of what the
    // policy recommended.
    #[test]
    fn idempotency_gate_overrides_unsafe_retries() {
        let ambiguous_errors = [
            write_timeout(WriteType::BatchLog),
            read_timeout(2, 2, false),
            io_error(),
        ];

        for error in &ambiguous_errors {
            assert_eq!(
                enforce_idempotency_gate(RetryDecision::RetrySameNode(None), error, false),
                RetryDecision::DontRetry
            );
            assert_eq!(
                enforce_idempotency_gate(RetryDecision::RetryNextNode(None), error, false),
                RetryDecision::DontRetry
            );
            // Idempotent statements keep the policy's decision.
            assert_eq!(
                enforce_idempotency_gate(RetryDecision::RetryNextNode(None), error, true),
                RetryDecision::RetryNextNode(None)
            );
        }
    }

    #[test]
    fn idempotency_gate_keeps_safe_retries() {
        // Unavailable means the request was rejected before any write;
        // replaying a non-idempotent statement is safe.
        assert_eq!(
            enforce_idempotency_gate(RetryDecision::RetryNextNode(None), &unavailable(), false),
            RetryDecision::RetryNextNode(None)
        );

        // Ignore decisions pass through untouched.
        assert_eq!(
            enforce_idempotency_gate(
                RetryDecision::IgnoreWriteError,
                &write_timeout(WriteType::Simple),
                false
            ),
            RetryDecision::IgnoreWriteError
        );
    }
}
