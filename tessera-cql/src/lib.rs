//! Implementation of the CQL binary protocol used by the Tessera driver.
//!
//! This crate is an implementation detail of the `tessera` crate and its
//! public API is not guaranteed to be stable. It covers:
//! - frame (de)serialization for protocol versions 3, 4 and 5, including
//!   the protocol-5 checksummed segment layer,
//! - value marshalling for every CQL type,
//! - request serialization and response parsing,
//! - conversion of received rows into Rust types.

pub mod errors;
pub mod frame;
#[doc(hidden)]
pub mod utils;

pub use crate::frame::response::cql_to_rust;
pub use crate::frame::types::Consistency;
