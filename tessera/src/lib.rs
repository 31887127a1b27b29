//! Async CQL driver for Tessera, a token-partitioned wide-column database.
//!
//! # Driver overview
//! ### Connecting
//! The driver maintains pooled connections to every live node of the
//! cluster. To connect, use [SessionBuilder]:
//!
//! ```rust,no_run
//! use tessera::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Making queries
//! Queries can be made with [`Session::query`], or prepared first with
//! [`Session::prepare`] and executed with [`Session::execute`] - prepared
//! statements are routed to the replicas of their partition key:
//!
//! ```rust,no_run
//! # use tessera::Session;
//! # use std::error::Error;
//! # async fn example(session: &Session) -> Result<(), Box<dyn Error>> {
//! let prepared = session
//!     .prepare("INSERT INTO ks.tab (a, b) VALUES (?, ?)")
//!     .await?;
//! session.execute(&prepared, (3_i32, "some text")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Reading rows
//! Received rows can be read as a dynamic list of values, or parsed into
//! Rust types:
//!
//! ```rust,no_run
//! # use tessera::Session;
//! # use std::error::Error;
//! # async fn example(session: &Session) -> Result<(), Box<dyn Error>> {
//! use tessera::IntoTypedRows;
//!
//! let rows = session
//!     .query("SELECT a, b FROM ks.tab", ())
//!     .await?
//!     .rows()?;
//! for row in rows.into_typed::<(i32, String)>() {
//!     let (a, b) = row?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod routing;
pub mod statement;
pub mod transport;

pub use statement::batch;
pub use statement::prepared_statement;
pub use statement::query;

pub use statement::batch::Batch;
pub use statement::prepared_statement::PreparedStatement;
pub use statement::query::Query;

pub use transport::iterator::RowIterator;
pub use transport::query_result::{IntoTypedRows, QueryResult};
pub use transport::session::{KnownNode, Session, SessionConfig};
pub use transport::session_builder::SessionBuilder;
pub use transport::{Compression, ProtocolVersion};

pub use tessera_cql::cql_to_rust::{FromCqlVal, FromRow};
pub use tessera_cql::frame::response::result::{ColumnType, CqlValue, Row};
pub use tessera_cql::frame::types::{Consistency, SerialConsistency};
pub use tessera_cql::frame::value::{
    Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid, CqlVector, MaybeUnset,
    SerializedValues, Unset, Value, ValueList,
};

pub use transport::errors::{BadQuery, DbError, NewSessionError, QueryError, WriteType};
pub use transport::load_balancing;
pub use transport::metrics::Metrics;
pub use transport::retry_policy::{
    DefaultRetryPolicy, FallthroughRetryPolicy, RetryDecision, RetryPolicy, RetrySession,
};
pub use transport::speculative_execution::{
    PercentileSpeculativeExecutionPolicy, SimpleSpeculativeExecutionPolicy,
    SpeculativeExecutionPolicy,
};
