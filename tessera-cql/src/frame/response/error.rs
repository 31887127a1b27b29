use crate::errors::{DbError, QueryError, WriteType};
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use bytes::Bytes;

#[derive(Debug)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: types::read_exact_slice(1, buf)?[0] != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: types::read_exact_slice(1, buf)?[0] != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_string(),
                function: types::read_string(buf)?.to_string(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1700 => DbError::CasWriteUnknown {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

impl From<Error> for QueryError {
    fn from(error: Error) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::errors::{DbError, WriteType};
    use crate::frame::types::{self, Consistency};

    #[test]
    fn deserialize_simple_errors() {
        for (code, expected) in [
            (0x0000, DbError::ServerError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x2000, DbError::SyntaxError),
            (0x1234, DbError::Other(0x1234)),
        ] {
            let mut buf: Vec<u8> = Vec::new();
            types::write_int(code, &mut buf);
            types::write_string("message", &mut buf).unwrap();

            let err = Error::deserialize(&mut &buf[..]).unwrap();
            assert_eq!(err.error, expected);
            assert_eq!(err.reason, "message");
        }
    }

    #[test]
    fn deserialize_unavailable() {
        let mut buf: Vec<u8> = Vec::new();
        types::write_int(0x1000, &mut buf);
        types::write_string("message 2", &mut buf).unwrap();
        types::write_consistency(Consistency::One, &mut buf);
        types::write_int(2, &mut buf);
        types::write_int(1, &mut buf);

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unavailable {
                consistency: Consistency::One,
                required: 2,
                alive: 1,
            }
        );
    }

    #[test]
    fn deserialize_write_timeout() {
        let mut buf: Vec<u8> = Vec::new();
        types::write_int(0x1100, &mut buf);
        types::write_string("message 2", &mut buf).unwrap();
        types::write_consistency(Consistency::Quorum, &mut buf);
        types::write_int(1, &mut buf);
        types::write_int(2, &mut buf);
        types::write_string("BATCH_LOG", &mut buf).unwrap();

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            }
        );
    }

    #[test]
    fn deserialize_unprepared() {
        let statement_id = b"deadbeef";
        let mut buf: Vec<u8> = Vec::new();
        types::write_int(0x2500, &mut buf);
        types::write_string("message 3", &mut buf).unwrap();
        types::write_short_bytes(statement_id, &mut buf).unwrap();

        let err = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unprepared {
                statement_id: bytes::Bytes::from_static(statement_id),
            }
        );
    }
}
