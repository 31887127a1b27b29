//! Errors which can be returned by the driver. The bulk of the taxonomy
//! lives in the codec crate and is re-exported here.

pub use tessera_cql::errors::{
    BadKeyspaceName, BadQuery, DbError, NewSessionError, QueryError, WriteType,
};
