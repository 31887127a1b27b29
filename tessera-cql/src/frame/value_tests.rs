use super::response::result::{deser_cql_value, ColumnType, CqlValue};
use super::value::{
    Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid, CqlVector, MaybeUnset,
    SerializedValues, Unset, Value, ValueList, ValueSerializationError,
};
use crate::frame::frame_errors::ParseError;
use crate::frame::types::RawValue;
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use uuid::Uuid;

fn serialized(val: impl Value) -> Vec<u8> {
    let mut result: Vec<u8> = Vec::new();
    val.serialize(&mut result).unwrap();
    result
}

// The [bytes] body, without the four-byte length prefix.
fn body(val: impl Value) -> Vec<u8> {
    serialized(val)[4..].to_vec()
}

fn deser(typ: &ColumnType, bytes: &[u8]) -> CqlValue {
    deser_cql_value(typ, &mut &bytes[..]).unwrap()
}

fn deser_err(typ: &ColumnType, bytes: &[u8]) -> ParseError {
    deser_cql_value(typ, &mut &bytes[..]).unwrap_err()
}

#[test]
fn basic_serialization() {
    assert_eq!(serialized(8_i8), vec![0, 0, 0, 1, 8]);
    assert_eq!(serialized(16_i16), vec![0, 0, 0, 2, 0, 16]);
    assert_eq!(serialized(32_i32), vec![0, 0, 0, 4, 0, 0, 0, 32]);
    assert_eq!(serialized(64_i64), vec![0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 64]);

    assert_eq!(serialized(false), vec![0, 0, 0, 1, 0]);
    assert_eq!(serialized(true), vec![0, 0, 0, 1, 1]);

    assert_eq!(serialized("abc"), vec![0, 0, 0, 3, 97, 98, 99]);
    assert_eq!(serialized("abc".to_string()), vec![0, 0, 0, 3, 97, 98, 99]);
}

#[test]
fn fixed_width_ints_round_trip() {
    assert_eq!(deser(&ColumnType::TinyInt, &body(-1_i8)), CqlValue::TinyInt(-1));
    assert_eq!(
        deser(&ColumnType::SmallInt, &body(i16::MIN)),
        CqlValue::SmallInt(i16::MIN)
    );
    assert_eq!(deser(&ColumnType::Int, &body(42_i32)), CqlValue::Int(42));
    assert_eq!(
        deser(&ColumnType::BigInt, &body(i64::MAX)),
        CqlValue::BigInt(i64::MAX)
    );
}

#[test]
fn int_decode_rejects_wrong_width() {
    // 8 bytes where 4 are expected
    let err = deser_err(&ColumnType::Int, &body(1_i64));
    assert!(err.to_string().contains("needs exactly 4 bytes, got 8"));

    let err = deser_err(&ColumnType::BigInt, &body(1_i32));
    assert!(err.to_string().contains("needs exactly 8 bytes, got 4"));
}

#[test]
fn floats_round_trip_bit_exact() {
    for val in [std::f32::consts::PI, -0.0_f32, f32::NAN, f32::INFINITY] {
        let decoded = deser(&ColumnType::Float, &body(val));
        match decoded {
            CqlValue::Float(f) => assert_eq!(f.to_bits(), val.to_bits()),
            other => panic!("expected float, got {:?}", other),
        }
    }

    let val = std::f64::consts::E;
    assert_eq!(deser(&ColumnType::Double, &body(val)), CqlValue::Double(val));
}

#[test]
fn uuid_round_trip() {
    let uuid = Uuid::parse_str("3dcd9800-f3d9-11bf-86d4-b8e8562c0cd0").unwrap();
    let serialized_uuid = body(uuid);
    assert_eq!(serialized_uuid.len(), 16);
    assert_eq!(deser(&ColumnType::Uuid, &serialized_uuid), CqlValue::Uuid(uuid));

    let timeuuid = CqlTimeuuid::from(uuid);
    assert_eq!(
        deser(&ColumnType::Timeuuid, &body(timeuuid)),
        CqlValue::Timeuuid(timeuuid)
    );
}

#[test]
fn short_uuid_is_rejected() {
    let err = deser_err(&ColumnType::Timeuuid, &[0, 1, 2, 3, 4, 5]);
    assert!(err.to_string().contains("must be exactly 16 bytes long"));

    let err = deser_err(&ColumnType::Uuid, &[0, 1, 2, 3, 4, 5]);
    assert!(err.to_string().contains("must be exactly 16 bytes long"));
}

#[test]
fn duration_wire_format() {
    // {months: 1, days: 2, nanos: 115} -> 02 04 80 E6
    let duration = CqlDuration {
        months: 1,
        days: 2,
        nanoseconds: 115,
    };
    assert_eq!(body(duration), vec![0x02, 0x04, 0x80, 0xE6]);

    assert_eq!(
        deser(&ColumnType::Duration, &[0x02, 0x04, 0x80, 0xE6]),
        CqlValue::Duration(duration)
    );
}

#[test]
fn duration_round_trip() {
    for duration in [
        CqlDuration {
            months: 0,
            days: 0,
            nanoseconds: 0,
        },
        CqlDuration {
            months: -1,
            days: -15,
            nanoseconds: -3_000_000,
        },
        CqlDuration {
            months: i32::MAX,
            days: i32::MIN,
            nanoseconds: i64::MAX,
        },
    ] {
        assert_eq!(
            deser(&ColumnType::Duration, &body(duration)),
            CqlValue::Duration(duration)
        );
    }
}

#[test]
fn truncated_duration_is_rejected() {
    let err = deser_err(&ColumnType::Duration, &[0x02, 0x04]);
    assert!(err.to_string().contains("missing its nanoseconds vint"));

    let err = deser_err(&ColumnType::Duration, &[0x02]);
    assert!(err.to_string().contains("missing its days vint"));
}

#[test]
fn varint_wire_format() {
    // From the datastax/python-driver test suite, via the conformance table.
    let cases: &[(&str, &[u8])] = &[
        ("0", &[0x00]),
        ("1", &[0x01]),
        ("-1", &[0xFF]),
        ("127", &[0x7F]),
        ("128", &[0x00, 0x80]),
        ("-128", &[0x80]),
        (
            "123456789123456789123456789",
            &[0x66, 0x1E, 0xFD, 0xF2, 0xE3, 0xB1, 0x9F, 0x7C, 0x04, 0x5F, 0x15],
        ),
    ];

    for (decimal_str, expected) in cases {
        let varint = BigInt::from_str(decimal_str).unwrap();
        assert_eq!(&body(varint.clone()), expected, "varint {}", decimal_str);
        assert_eq!(deser(&ColumnType::Varint, expected), CqlValue::Varint(varint));
    }
}

#[test]
fn varint_minimality_at_boundaries() {
    // Shortest two's-complement form at the 64-bit and 72-bit edges.
    let pow63 = BigInt::from(1u8) << 63;
    let pow71 = BigInt::from(1u8) << 71;

    let cases: &[(BigInt, usize)] = &[
        (BigInt::from(-1), 1),
        (BigInt::from(0), 1),
        (BigInt::from(1), 1),
        (pow63.clone(), 9),
        (-pow63.clone() - 1, 9),
        (pow71.clone(), 10),
        (-pow71.clone(), 9),
    ];

    for (value, expected_len) in cases {
        let encoded = body(value.clone());
        assert_eq!(
            encoded.len(),
            *expected_len,
            "varint {} should take {} bytes, got {:?}",
            value,
            expected_len,
            encoded
        );
        assert_eq!(
            deser(&ColumnType::Varint, &encoded),
            CqlValue::Varint(value.clone())
        );
    }

    assert_eq!(
        body(pow63),
        vec![0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn decimal_round_trip() {
    for s in ["1234.56", "-0.001", "0", "123456789123456789123456789.123456789"] {
        let decimal = BigDecimal::from_str(s).unwrap();
        assert_eq!(
            deser(&ColumnType::Decimal, &body(decimal.clone())),
            CqlValue::Decimal(decimal)
        );
    }
}

#[test]
fn time_types_round_trip() {
    let date = CqlDate(1 << 31);
    assert_eq!(deser(&ColumnType::Date, &body(date)), CqlValue::Date(date));

    let time = CqlTime(86399999999999);
    assert_eq!(deser(&ColumnType::Time, &body(time)), CqlValue::Time(time));

    let timestamp = CqlTimestamp(-1000);
    assert_eq!(
        deser(&ColumnType::Timestamp, &body(timestamp)),
        CqlValue::Timestamp(timestamp)
    );
}

#[test]
fn inet_round_trip() {
    let v4 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    assert_eq!(body(v4), vec![127, 0, 0, 1]);
    assert_eq!(deser(&ColumnType::Inet, &body(v4)), CqlValue::Inet(v4));

    let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
    assert_eq!(deser(&ColumnType::Inet, &body(v6)), CqlValue::Inet(v6));
}

#[test]
fn counter_round_trip() {
    let counter = Counter(1_000_000);
    assert_eq!(
        deser(&ColumnType::Counter, &body(counter)),
        CqlValue::Counter(counter)
    );
}

#[test]
fn null_vs_empty_values() {
    // NULL is length -1; a present empty value is length 0.
    assert_eq!(serialized(Option::<i32>::None), vec![255, 255, 255, 255]);
    assert_eq!(serialized(Unset), vec![255, 255, 255, 254]);
    assert_eq!(
        serialized(MaybeUnset::<i32>::Unset),
        vec![255, 255, 255, 254]
    );

    // An empty collection is a present value: length 4, inner count 0.
    let empty_list: Vec<i32> = Vec::new();
    assert_eq!(serialized(empty_list), vec![0, 0, 0, 4, 0, 0, 0, 0]);

    // Decoding a zero-length buffer yields the special Empty value
    // for types which support it, and a regular value for strings/blobs.
    assert_eq!(deser(&ColumnType::Int, &[]), CqlValue::Empty);
    assert_eq!(deser(&ColumnType::Text, &[]), CqlValue::Text(String::new()));
    assert_eq!(deser(&ColumnType::Blob, &[]), CqlValue::Blob(Vec::new()));
}

#[test]
fn collections_round_trip() {
    let list_type = ColumnType::List(Box::new(ColumnType::Int));
    let decoded = deser(&list_type, &body(vec![1_i32, 2, 3]));
    assert_eq!(
        decoded,
        CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2), CqlValue::Int(3)])
    );

    let mut map = std::collections::BTreeMap::new();
    map.insert("a".to_string(), 1_i32);
    map.insert("b".to_string(), 2_i32);
    let map_type = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Int));
    assert_eq!(
        deser(&map_type, &body(map)),
        CqlValue::Map(vec![
            (CqlValue::Text("a".to_string()), CqlValue::Int(1)),
            (CqlValue::Text("b".to_string()), CqlValue::Int(2)),
        ])
    );
}

#[test]
fn nested_collections_round_trip() {
    let inner = vec![vec![1_i32, 2], vec![3]];
    let typ = ColumnType::List(Box::new(ColumnType::List(Box::new(ColumnType::Int))));
    assert_eq!(
        deser(&typ, &body(inner)),
        CqlValue::List(vec![
            CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]),
            CqlValue::List(vec![CqlValue::Int(3)]),
        ])
    );
}

#[test]
fn tuple_round_trip() {
    let typ = ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text]);
    let decoded = deser(&typ, &body((5_i32, "uno")));
    assert_eq!(
        decoded,
        CqlValue::Tuple(vec![
            Some(CqlValue::Int(5)),
            Some(CqlValue::Text("uno".to_string()))
        ])
    );

    // An absent tuple field has length -1 and decodes to None.
    let decoded = deser(&typ, &body((5_i32, Option::<&str>::None)));
    assert_eq!(
        decoded,
        CqlValue::Tuple(vec![Some(CqlValue::Int(5)), None])
    );
}

#[test]
fn udt_trailing_fields_can_be_absent() {
    let typ = ColumnType::UserDefinedType {
        type_name: "person".to_string(),
        keyspace: "ks".to_string(),
        field_types: vec![
            ("name".to_string(), ColumnType::Text),
            ("age".to_string(), ColumnType::Int),
        ],
    };

    // Only the first field present.
    let decoded = deser(&typ, &body(("alice",)));
    assert_eq!(
        decoded,
        CqlValue::UserDefinedType {
            type_name: "person".to_string(),
            keyspace: "ks".to_string(),
            fields: vec![("name".to_string(), Some(CqlValue::Text("alice".to_string())))],
        }
    );
}

#[test]
fn fixed_vector_wire_format() {
    // vector<float, 3> [8.0, 2.5, -5.0]: three bare big-endian floats.
    let vector = CqlVector::new(3, vec![8.0_f32, 2.5, -5.0]);
    let serialized_body = body(vector);
    assert_eq!(serialized_body.len(), 12);

    let typ = ColumnType::Vector {
        typ: Box::new(ColumnType::Float),
        dimensions: 3,
    };
    let decoded = deser(&typ, &serialized_body);
    match decoded {
        CqlValue::Vector(elements) => {
            let floats: Vec<u32> = elements
                .iter()
                .map(|e| e.as_float().unwrap().to_bits())
                .collect();
            assert_eq!(
                floats,
                vec![8.0_f32.to_bits(), 2.5_f32.to_bits(), (-5.0_f32).to_bits()]
            );
        }
        other => panic!("expected vector, got {:?}", other),
    }
}

#[test]
fn vector_dimension_mismatch_on_encode() {
    let vector = CqlVector::new(3, vec![8.0_f32, -5.0]);
    let mut buf = Vec::new();
    let err = vector.serialize(&mut buf).unwrap_err();
    assert_eq!(
        err,
        ValueSerializationError::VectorDimensionMismatch {
            expected: 3,
            received: 2,
        }
    );
    assert_eq!(
        err.to_string(),
        "expected vector with 3 dimensions, received 2"
    );
}

#[test]
fn vector_dimension_mismatch_on_decode() {
    let typ = ColumnType::Vector {
        typ: Box::new(ColumnType::Float),
        dimensions: 3,
    };
    // Two floats where three are declared.
    let err = deser_err(&typ, &body(CqlVector::new(2, vec![8.0_f32, -5.0])));
    assert!(err
        .to_string()
        .contains("expected vector with 3 dimensions, received 2"));
}

#[test]
fn variable_width_vector_round_trip() {
    // Variable-width elements carry unsigned-vint length prefixes.
    let value = CqlValue::Vector(vec![
        CqlValue::Text("ab".to_string()),
        CqlValue::Text("cdef".to_string()),
    ]);
    let typ = ColumnType::Vector {
        typ: Box::new(ColumnType::Text),
        dimensions: 2,
    };
    assert_eq!(deser(&typ, &body(value.clone())), value);
}

#[test]
fn vector_nested_in_collection_round_trip() {
    let vector = CqlValue::Vector(vec![CqlValue::Float(1.0), CqlValue::Float(2.0)]);
    let value = CqlValue::List(vec![vector.clone(), vector]);
    let typ = ColumnType::List(Box::new(ColumnType::Vector {
        typ: Box::new(ColumnType::Float),
        dimensions: 2,
    }));
    assert_eq!(deser(&typ, &body(value.clone())), value);
}

#[test]
fn cql_value_reserialization_round_trip() {
    // Dynamic-tier values re-encode to the same wire form.
    let typ = ColumnType::List(Box::new(ColumnType::Int));
    let original_body = body(vec![7_i32, 8, 9]);
    let decoded = deser(&typ, &original_body);
    assert_eq!(body(decoded), original_body);
}

#[test]
fn serialized_values_iteration() {
    let mut values = SerializedValues::new();
    values.add_value(&12_i32).unwrap();
    values.add_value(&Option::<i32>::None).unwrap();
    values.add_value(&Unset).unwrap();

    assert_eq!(values.len(), 3);
    let collected: Vec<RawValue> = values.iter().collect();
    assert_eq!(
        collected,
        vec![
            RawValue::Value(&[0, 0, 0, 12]),
            RawValue::Null,
            RawValue::Unset,
        ]
    );
}

#[test]
fn value_list_for_tuples_and_slices() {
    let tuple_values = (1_i32, "two");
    let serialized = tuple_values.serialized().unwrap().into_owned();
    assert_eq!(serialized.len(), 2);

    let slice_values: &[i32] = &[1, 2, 3];
    let serialized = slice_values.serialized().unwrap().into_owned();
    assert_eq!(serialized.len(), 3);

    let empty = ().serialized().unwrap().into_owned();
    assert!(empty.is_empty());
}

#[test]
fn named_values() {
    let mut values: HashMap<&str, i32> = HashMap::new();
    values.insert("the_answer", 42);
    let serialized: Cow<SerializedValues> = values.serialized().unwrap();
    assert!(serialized.has_names());
    assert_eq!(serialized.len(), 1);
}
