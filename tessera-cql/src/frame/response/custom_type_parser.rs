//! Parser for the server's marshal class-name type strings.

use super::result::ColumnType;
use crate::frame::frame_errors::ParseError;
use crate::utils::parse::{ScanResult, Scanner};

/// Parses type names of the form the server stores in its schema tables,
/// e.g. `org.apache.cassandra.db.marshal.MapType(UTF8Type,Int32Type)`,
/// with arbitrary nesting.
pub(crate) struct CustomTypeParser<'a> {
    scanner: Scanner<'a>,
}

const MARSHAL_PACKAGE_PREFIX: &str = "org.apache.cassandra.db.marshal.";

impl<'a> CustomTypeParser<'a> {
    pub(crate) fn parse(input: &str) -> Result<ColumnType, ParseError> {
        let mut parser = CustomTypeParser {
            scanner: Scanner::new(input),
        };
        let typ = parser.parse_type()?;
        parser.scanner.skip_spaces();
        if !parser.scanner.done() {
            return Err(ParseError::CustomTypeParseError(format!(
                "leftover characters at position {} of {:?}",
                parser.scanner.position(),
                input,
            )));
        }
        Ok(typ)
    }

    fn error(&self, msg: impl Into<String>) -> ParseError {
        ParseError::CustomTypeParseError(msg.into())
    }

    fn read_identifier(&mut self) -> &'a str {
        self.scanner
            .take_while(|c| c.is_alphanumeric() || "+-_.&".contains(c))
    }

    // Parameter lists separate entries with at most one comma
    // surrounded by whitespace.
    fn skip_separators(&mut self) {
        self.scanner.skip_spaces();
        if self.scanner.eat(",") {
            self.scanner.skip_spaces();
        }
    }

    fn open_paren(&mut self) -> ScanResult<()> {
        self.scanner.expect("(", "expected '('")
    }

    fn parse_type(&mut self) -> Result<ColumnType, ParseError> {
        self.scanner.skip_spaces();

        let mut name = self.read_identifier();

        if name.is_empty() {
            if !self.scanner.done() {
                return Err(self.error(format!(
                    "unexpected character at position {}",
                    self.scanner.position()
                )));
            }
            // An empty type string historically denotes bytes.
            return Ok(ColumnType::Blob);
        }

        // The name may be prefixed by a hex number and a colon; the number
        // is irrelevant to the wire format.
        if self.scanner.eat(":") {
            name = self.read_identifier();
        }
        self.scanner.skip_spaces();

        let name = name.strip_prefix(MARSHAL_PACKAGE_PREFIX).unwrap_or(name);

        // A parameter list makes it a composite type.
        let mut lookahead = self.scanner;
        if lookahead.eat("(") {
            self.parse_composite(name)
        } else {
            self.lookup_simple(name)
        }
    }

    fn lookup_simple(&self, name: &str) -> Result<ColumnType, ParseError> {
        let typ = match name {
            "AsciiType" => ColumnType::Ascii,
            "BooleanType" => ColumnType::Boolean,
            "BytesType" => ColumnType::Blob,
            "CounterColumnType" => ColumnType::Counter,
            "DateType" => ColumnType::Timestamp,
            "DecimalType" => ColumnType::Decimal,
            "DoubleType" => ColumnType::Double,
            "DurationType" => ColumnType::Duration,
            "FloatType" => ColumnType::Float,
            "InetAddressType" => ColumnType::Inet,
            "Int32Type" => ColumnType::Int,
            "IntegerType" => ColumnType::Varint,
            "LongType" => ColumnType::BigInt,
            "SimpleDateType" => ColumnType::Date,
            "ShortType" | "SmallIntType" => ColumnType::SmallInt,
            "UTF8Type" => ColumnType::Text,
            "ByteType" | "TinyIntType" => ColumnType::TinyInt,
            "UUIDType" => ColumnType::Uuid,
            "TimeUUIDType" => ColumnType::Timeuuid,
            "TimeType" => ColumnType::Time,
            "TimestampType" => ColumnType::Timestamp,
            other => {
                return Err(ParseError::CustomTypeParseError(format!(
                    "unknown type name: {}",
                    other
                )))
            }
        };
        Ok(typ)
    }

    fn parse_composite(&mut self, name: &str) -> Result<ColumnType, ParseError> {
        match name {
            // Ordering and freezing do not affect the wire format.
            "ReversedType" | "FrozenType" => {
                let mut params = self.parse_parameters()?;
                if params.len() != 1 {
                    return Err(self.error(format!(
                        "{} takes 1 parameter, got {}",
                        name,
                        params.len()
                    )));
                }
                Ok(params.remove(0))
            }
            "ListType" => {
                let mut params = self.parse_parameters()?;
                if params.len() != 1 {
                    return Err(
                        self.error(format!("ListType takes 1 parameter, got {}", params.len()))
                    );
                }
                Ok(ColumnType::List(Box::new(params.remove(0))))
            }
            "SetType" => {
                let mut params = self.parse_parameters()?;
                if params.len() != 1 {
                    return Err(
                        self.error(format!("SetType takes 1 parameter, got {}", params.len()))
                    );
                }
                Ok(ColumnType::Set(Box::new(params.remove(0))))
            }
            "MapType" => {
                let mut params = self.parse_parameters()?;
                if params.len() != 2 {
                    return Err(
                        self.error(format!("MapType takes 2 parameters, got {}", params.len()))
                    );
                }
                let value = params.remove(1);
                let key = params.remove(0);
                Ok(ColumnType::Map(Box::new(key), Box::new(value)))
            }
            "TupleType" => {
                let params = self.parse_parameters()?;
                if params.is_empty() {
                    return Err(self.error("TupleType takes at least 1 parameter, got 0"));
                }
                Ok(ColumnType::Tuple(params))
            }
            "VectorType" => self.parse_vector(),
            "UserType" => self.parse_udt(),
            other => Err(self.error(format!("unknown composite type name: {}", other))),
        }
    }

    fn parse_parameters(&mut self) -> Result<Vec<ColumnType>, ParseError> {
        self.open_paren()
            .map_err(|err| self.error(err.to_string()))?;

        let mut params = Vec::new();
        loop {
            self.skip_separators();
            if self.scanner.done() {
                return Err(self.error("unexpected end of input in type parameters"));
            }
            if self.scanner.eat(")") {
                return Ok(params);
            }
            params.push(self.parse_type()?);
        }
    }

    fn parse_vector(&mut self) -> Result<ColumnType, ParseError> {
        self.open_paren()
            .map_err(|err| self.error(err.to_string()))?;

        self.skip_separators();
        if self.scanner.eat(")") {
            return Err(self.error("vector type takes 2 parameters, got 0"));
        }

        let element = self.parse_type()?;
        self.skip_separators();
        let dimensions: u16 = self
            .scanner
            .number("bad vector dimension")
            .map_err(|err| self.error(err.to_string()))?;
        self.scanner
            .expect(")", "expected ')'")
            .map_err(|err| self.error(err.to_string()))?;

        Ok(ColumnType::Vector {
            typ: Box::new(element),
            dimensions,
        })
    }

    fn parse_udt(&mut self) -> Result<ColumnType, ParseError> {
        self.open_paren()
            .map_err(|err| self.error(err.to_string()))?;

        self.skip_separators();
        let keyspace = self.read_identifier().to_owned();
        self.skip_separators();
        let type_name = self.hex_encoded_name()?;

        let mut field_types = Vec::new();
        loop {
            self.skip_separators();
            if self.scanner.done() {
                return Err(self.error("unexpected end of input in UserType parameters"));
            }
            if self.scanner.eat(")") {
                return Ok(ColumnType::UserDefinedType {
                    type_name,
                    keyspace,
                    field_types,
                });
            }

            let field_name = self.hex_encoded_name()?;
            self.scanner
                .expect(":", "expected ':' after a UserType field name")
                .map_err(|err| self.error(err.to_string()))?;
            let field_type = self.parse_type()?;
            field_types.push((field_name, field_type));
        }
    }

    // UDT and field names travel hex-encoded inside the class name.
    fn hex_encoded_name(&mut self) -> Result<String, ParseError> {
        let hex = self.read_identifier();
        if hex.len() % 2 != 0 || hex.bytes().any(|b| !b.is_ascii_hexdigit()) {
            return Err(self.error(format!("bad hex string: {:?}", hex)));
        }
        let raw: Vec<u8> = hex
            .as_bytes()
            .chunks_exact(2)
            .map(|pair| {
                let pair = std::str::from_utf8(pair).expect("hex digits are ASCII");
                u8::from_str_radix(pair, 16).expect("checked to be hex digits")
            })
            .collect();
        String::from_utf8(raw).map_err(|_| self.error("hex-encoded name is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ColumnType {
        CustomTypeParser::parse(s).unwrap()
    }

    #[test]
    fn simple_types() {
        assert_eq!(
            parse("org.apache.cassandra.db.marshal.UTF8Type"),
            ColumnType::Text
        );
        assert_eq!(parse("Int32Type"), ColumnType::Int);
        assert_eq!(
            parse("org.apache.cassandra.db.marshal.DurationType"),
            ColumnType::Duration
        );
        assert_eq!(parse(""), ColumnType::Blob);
    }

    #[test]
    fn nested_collections() {
        assert_eq!(
            parse("org.apache.cassandra.db.marshal.ListType(org.apache.cassandra.db.marshal.Int32Type)"),
            ColumnType::List(Box::new(ColumnType::Int))
        );
        assert_eq!(
            parse("MapType(UTF8Type,SetType(LongType))"),
            ColumnType::Map(
                Box::new(ColumnType::Text),
                Box::new(ColumnType::Set(Box::new(ColumnType::BigInt)))
            )
        );
        assert_eq!(
            parse("TupleType(Int32Type, FloatType, UTF8Type)"),
            ColumnType::Tuple(vec![
                ColumnType::Int,
                ColumnType::Float,
                ColumnType::Text
            ])
        );
    }

    #[test]
    fn reversed_and_frozen_are_transparent() {
        assert_eq!(parse("ReversedType(TimeUUIDType)"), ColumnType::Timeuuid);
        assert_eq!(
            parse("FrozenType(ListType(Int32Type))"),
            ColumnType::List(Box::new(ColumnType::Int))
        );
    }

    #[test]
    fn vector_type() {
        assert_eq!(
            parse("org.apache.cassandra.db.marshal.VectorType(org.apache.cassandra.db.marshal.FloatType, 3)"),
            ColumnType::Vector {
                typ: Box::new(ColumnType::Float),
                dimensions: 3,
            }
        );
        assert_eq!(
            parse("VectorType(VectorType(Int32Type, 2), 5)"),
            ColumnType::Vector {
                typ: Box::new(ColumnType::Vector {
                    typ: Box::new(ColumnType::Int),
                    dimensions: 2,
                }),
                dimensions: 5,
            }
        );
    }

    #[test]
    fn user_type() {
        // "xyz" = 78797a, field "a" = 61, field "b" = 62
        let parsed = parse("UserType(ks,78797a,61:Int32Type,62:UTF8Type)");
        assert_eq!(
            parsed,
            ColumnType::UserDefinedType {
                type_name: "xyz".to_string(),
                keyspace: "ks".to_string(),
                field_types: vec![
                    ("a".to_string(), ColumnType::Int),
                    ("b".to_string(), ColumnType::Text),
                ],
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(CustomTypeParser::parse("NoSuchType").is_err());
        assert!(CustomTypeParser::parse("ListType(Int32Type").is_err());
        assert!(CustomTypeParser::parse("VectorType(FloatType)").is_err());
        assert!(CustomTypeParser::parse("UserType(ks,7879,6:Int32Type)").is_err());
    }
}
