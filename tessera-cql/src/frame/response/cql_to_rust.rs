//! Conversion of received `CqlValue`s and `Row`s into plain Rust types.

use super::result::{CqlValue, Row};
use crate::frame::value::{
    Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid,
};
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{BuildHasher, Hash};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FromRowError {
    #[error("{err} in the column with index {column}")]
    BadCqlVal { err: FromCqlValError, column: usize },
    #[error("Wrong row size: expected {expected}, actual {actual}")]
    WrongRowSize { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FromCqlValError {
    #[error("Bad CQL type")]
    BadCqlType,
    #[error("Value is null")]
    ValIsNull,
    #[error("Value is too large to fit in the Rust type")]
    BadVal,
}

/// This trait defines a way to convert CqlValue or `Option<CqlValue>` into some rust type.
// We can't use From trait because impl From<Option<CqlValue>> for String {...}
// is forbidden since neither From nor String are defined in this crate.
pub trait FromCqlVal<T>: Sized {
    fn from_cql(cql_val: T) -> Result<Self, FromCqlValError>;
}

/// This trait defines a way to convert a whole CQL Row into some rust type.
pub trait FromRow: Sized {
    fn from_row(row: Row) -> Result<Self, FromRowError>;
}

// CqlValue can be converted to CqlValue
impl FromCqlVal<CqlValue> for CqlValue {
    fn from_cql(cql_val: CqlValue) -> Result<CqlValue, FromCqlValError> {
        Ok(cql_val)
    }
}

impl<T: FromCqlVal<CqlValue>> FromCqlVal<Option<CqlValue>> for T {
    fn from_cql(cql_val_opt: Option<CqlValue>) -> Result<Self, FromCqlValError> {
        T::from_cql(cql_val_opt.ok_or(FromCqlValError::ValIsNull)?)
    }
}

impl<T: FromCqlVal<CqlValue>> FromCqlVal<Option<CqlValue>> for Option<T> {
    fn from_cql(cql_val_opt: Option<CqlValue>) -> Result<Self, FromCqlValError> {
        match cql_val_opt {
            Some(CqlValue::Empty) => Ok(None),
            Some(cql_val) => Ok(Some(T::from_cql(cql_val)?)),
            None => Ok(None),
        }
    }
}

macro_rules! impl_from_cql_val {
    ($T:ty, $convert_func:ident) => {
        impl FromCqlVal<CqlValue> for $T {
            fn from_cql(cql_val: CqlValue) -> Result<$T, FromCqlValError> {
                cql_val.$convert_func().ok_or(FromCqlValError::BadCqlType)
            }
        }
    };
}

impl_from_cql_val!(i32, as_int);
impl_from_cql_val!(i64, as_bigint);
impl_from_cql_val!(Counter, as_counter);
impl_from_cql_val!(i16, as_smallint);
impl_from_cql_val!(i8, as_tinyint);
impl_from_cql_val!(f32, as_float);
impl_from_cql_val!(f64, as_double);
impl_from_cql_val!(bool, as_boolean);
impl_from_cql_val!(String, into_string);
impl_from_cql_val!(Vec<u8>, into_blob);
impl_from_cql_val!(IpAddr, as_inet);
impl_from_cql_val!(Uuid, as_uuid);
impl_from_cql_val!(CqlTimeuuid, as_timeuuid);
impl_from_cql_val!(BigInt, into_varint);
impl_from_cql_val!(BigDecimal, into_decimal);
impl_from_cql_val!(CqlDuration, as_cql_duration);
impl_from_cql_val!(CqlDate, as_cql_date);
impl_from_cql_val!(CqlTime, as_cql_time);
impl_from_cql_val!(CqlTimestamp, as_cql_timestamp);

// Vec<T> can be converted from a list, a set or a vector
impl<T: FromCqlVal<CqlValue>> FromCqlVal<CqlValue> for Vec<T> {
    fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
        cql_val
            .into_vec()
            .ok_or(FromCqlValError::BadCqlType)?
            .into_iter()
            .map(T::from_cql)
            .collect::<Result<Vec<T>, FromCqlValError>>()
    }
}

impl<T1: FromCqlVal<CqlValue> + Eq + Hash, T2: FromCqlVal<CqlValue>, S: BuildHasher + Default>
    FromCqlVal<CqlValue> for HashMap<T1, T2, S>
{
    fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
        let vec = cql_val.into_pair_vec().ok_or(FromCqlValError::BadCqlType)?;
        let mut res = HashMap::with_capacity_and_hasher(vec.len(), S::default());
        for (key, value) in vec {
            res.insert(T1::from_cql(key)?, T2::from_cql(value)?);
        }
        Ok(res)
    }
}

impl<T: FromCqlVal<CqlValue> + Eq + Hash, S: BuildHasher + Default> FromCqlVal<CqlValue>
    for HashSet<T, S>
{
    fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
        cql_val
            .into_vec()
            .ok_or(FromCqlValError::BadCqlType)?
            .into_iter()
            .map(T::from_cql)
            .collect::<Result<HashSet<T, S>, FromCqlValError>>()
    }
}

impl<T: FromCqlVal<CqlValue> + Ord> FromCqlVal<CqlValue> for BTreeSet<T> {
    fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
        cql_val
            .into_vec()
            .ok_or(FromCqlValError::BadCqlType)?
            .into_iter()
            .map(T::from_cql)
            .collect::<Result<BTreeSet<T>, FromCqlValError>>()
    }
}

impl<K: FromCqlVal<CqlValue> + Ord, V: FromCqlVal<CqlValue>> FromCqlVal<CqlValue>
    for BTreeMap<K, V>
{
    fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
        let vec = cql_val.into_pair_vec().ok_or(FromCqlValError::BadCqlType)?;
        let mut res = BTreeMap::new();
        for (key, value) in vec {
            res.insert(K::from_cql(key)?, V::from_cql(value)?);
        }
        Ok(res)
    }
}

// This macro implements FromCqlVal for tuples, mapped from CQL tuple values.
macro_rules! impl_tuple_from_cql {
    ( $($Ti:tt),+ ) => {
        impl<$($Ti),+> FromCqlVal<CqlValue> for ($($Ti,)+)
        where
            $($Ti: FromCqlVal<Option<CqlValue>>),+
        {
            fn from_cql(cql_val: CqlValue) -> Result<Self, FromCqlValError> {
                let tuple_fields = match cql_val {
                    CqlValue::Tuple(fields) => fields,
                    _ => return Err(FromCqlValError::BadCqlType)
                };

                let mut tuple_fields_iter = tuple_fields.into_iter();

                Ok((
                    $(
                        // Tuples in CQL can have fewer fields than declared
                        $Ti::from_cql(tuple_fields_iter.next().flatten())?
                    ,)+
                ))
            }
        }
    }
}

impl_tuple_from_cql!(T1);
impl_tuple_from_cql!(T1, T2);
impl_tuple_from_cql!(T1, T2, T3);
impl_tuple_from_cql!(T1, T2, T3, T4);
impl_tuple_from_cql!(T1, T2, T3, T4, T5);
impl_tuple_from_cql!(T1, T2, T3, T4, T5, T6);
impl_tuple_from_cql!(T1, T2, T3, T4, T5, T6, T7);
impl_tuple_from_cql!(T1, T2, T3, T4, T5, T6, T7, T8);

/// A row can be parsed as a tuple of rust types, a column each.
macro_rules! impl_from_row_for_tuple {
    ( $($Ti:tt),+ ; $size:expr ) => {
        impl<$($Ti),+> FromRow for ($($Ti,)+)
        where
            $($Ti: FromCqlVal<Option<CqlValue>>),+
        {
            fn from_row(row: Row) -> Result<Self, FromRowError> {
                if row.columns.len() != $size {
                    return Err(FromRowError::WrongRowSize {
                        expected: $size,
                        actual: row.columns.len(),
                    });
                }
                let mut columns = row.columns.into_iter().enumerate();

                Ok((
                    $(
                        {
                            // The size check above guarantees a column
                            // for every tuple element.
                            let (position, cell) = columns.next().expect("column count checked");

                            $Ti::from_cql(cell).map_err(|err| FromRowError::BadCqlVal {
                                err,
                                column: position,
                            })?
                        }
                    ,)+
                ))
            }
        }
    }
}

impl_from_row_for_tuple!(T1; 1);
impl_from_row_for_tuple!(T1, T2; 2);
impl_from_row_for_tuple!(T1, T2, T3; 3);
impl_from_row_for_tuple!(T1, T2, T3, T4; 4);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5; 5);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6; 6);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7; 7);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8; 8);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9; 9);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10; 10);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11; 11);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12; 12);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13; 13);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14; 14);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15; 15);
impl_from_row_for_tuple!(T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15, T16; 16);
