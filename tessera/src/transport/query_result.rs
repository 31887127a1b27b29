use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use tessera_cql::cql_to_rust::{FromRow, FromRowError};
use tessera_cql::frame::response::result::{ColumnSpec, ColumnType, CqlValue, Row};

/// Iterator over rows parsed as the given type,
/// returned by `rows_typed::<(...)>()`
pub struct TypedRowIter<RowT: FromRow> {
    row_iter: std::vec::IntoIter<Row>,
    phantom_data: std::marker::PhantomData<RowT>,
}

impl<RowT: FromRow> Iterator for TypedRowIter<RowT> {
    type Item = Result<RowT, FromRowError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.row_iter.next().map(RowT::from_row)
    }
}

/// Trait used to convert a `Vec<Row>` into a typed row iterator.
pub trait IntoTypedRows {
    fn into_typed<RowT: FromRow>(self) -> TypedRowIter<RowT>;
}

impl IntoTypedRows for Vec<Row> {
    fn into_typed<RowT: FromRow>(self) -> TypedRowIter<RowT> {
        TypedRowIter {
            row_iter: self.into_iter(),
            phantom_data: Default::default(),
        }
    }
}

/// Result of a single query\
/// Contains all rows returned by the database and some more information
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Rows returned by the database.\
    /// Queries like `SELECT` will have `Some(Vec)`, while queries like
    /// `INSERT` will have `None`.\
    /// Can contain an empty Vec.
    pub rows: Option<Vec<Row>>,
    /// Warnings returned by the database
    pub warnings: Vec<String>,
    /// CQL Tracing id (if tracing was enabled)
    pub tracing_id: Option<Uuid>,
    /// Paging state returned from the server; pass it to the next query
    /// to resume where this one stopped.
    pub paging_state: Option<Bytes>,
    /// Column specs returned from the server
    pub col_specs: Vec<ColumnSpec>,
    /// The original size of the serialized rows in the request
    pub serialized_size: usize,
}

impl QueryResult {
    /// Returns the number of received rows.\
    /// Fails when the query isn't of a type that could return rows,
    /// same as [`rows()`](QueryResult::rows).
    pub fn rows_num(&self) -> Result<usize, RowsExpectedError> {
        match &self.rows {
            Some(rows) => Ok(rows.len()),
            None => Err(RowsExpectedError),
        }
    }

    /// Returns the received rows when present.\
    /// If `QueryResult.rows` is `None`, which means that this query is not
    /// supposed to return rows (e.g `INSERT`), returns an error.\
    /// Can return an empty `Vec`.
    pub fn rows(self) -> Result<Vec<Row>, RowsExpectedError> {
        match self.rows {
            Some(rows) => Ok(rows),
            None => Err(RowsExpectedError),
        }
    }

    /// Returns the received rows parsed as the given type.\
    /// Equal to `rows()?.into_typed()`.
    pub fn rows_typed<RowT: FromRow>(self) -> Result<TypedRowIter<RowT>, RowsExpectedError> {
        Ok(self.rows()?.into_typed())
    }

    /// Returns `Ok` for a result of a query that shouldn't contain any rows.\
    /// Will return `Ok` for `INSERT` result, but a `SELECT` result, even an
    /// empty one, will cause an error.
    pub fn result_not_rows(&self) -> Result<(), RowsNotExpectedError> {
        match self.rows {
            Some(_) => Err(RowsNotExpectedError),
            None => Ok(()),
        }
    }

    /// Returns rows when `QueryResult.rows` is `Some`, otherwise an empty Vec.
    pub fn rows_or_empty(self) -> Vec<Row> {
        self.rows.unwrap_or_default()
    }

    /// Returns `Option<RowT>` containing the first of a result.\
    /// Fails when the query isn't of a type that could return rows,
    /// same as [`rows()`](QueryResult::rows).
    pub fn maybe_first_row(self) -> Result<Option<Row>, RowsExpectedError> {
        Ok(self.rows()?.into_iter().next())
    }

    /// Returns the first row of the result parsed as the given type.
    pub fn maybe_first_row_typed<RowT: FromRow>(
        self,
    ) -> Result<Option<RowT>, MaybeFirstRowTypedError> {
        match self.maybe_first_row()? {
            Some(row) => Ok(Some(row.into_typed::<RowT>()?)),
            None => Ok(None),
        }
    }

    /// Returns the first row of the received result.\
    /// When the first row is not available, returns an error.
    pub fn first_row(self) -> Result<Row, FirstRowError> {
        match self.maybe_first_row()? {
            Some(row) => Ok(row),
            None => Err(FirstRowError::RowsEmpty),
        }
    }

    /// Returns the first row of the received result parsed as the given type.
    pub fn first_row_typed<RowT: FromRow>(self) -> Result<RowT, FirstRowTypedError> {
        Ok(self.first_row()?.into_typed()?)
    }

    /// Returns the only received row.\
    /// Fails if the result is anything else than a single row.
    pub fn single_row(self) -> Result<Row, SingleRowError> {
        let rows = self.rows()?;

        if rows.len() != 1 {
            return Err(SingleRowError::BadNumberOfRows(rows.len()));
        }

        Ok(rows.into_iter().next().unwrap())
    }

    /// Returns the only received row parsed as the given type.
    pub fn single_row_typed<RowT: FromRow>(self) -> Result<RowT, SingleRowTypedError> {
        Ok(self.single_row()?.into_typed::<RowT>()?)
    }

    /// Returns a column specification for a column with given name,
    /// along with its index, if it exists.
    pub fn get_column_spec<'a>(&'a self, name: &str) -> Option<(usize, &'a ColumnSpec)> {
        self.col_specs
            .iter()
            .enumerate()
            .find(|(_id, spec)| spec.name == name)
    }

    /// The outcome of a conditional (lightweight-transaction) statement:
    /// whether it was applied, and the current row that blocked the update
    /// when it was not.
    ///
    /// Fails with [NotACasResult] when the result has no leading boolean
    /// `[applied]` column, i.e. the statement was not conditional.
    pub fn cas_applied(&self) -> Result<(bool, Option<&Row>), NotACasResult> {
        let applied_spec = self.col_specs.first().ok_or(NotACasResult)?;
        if applied_spec.name != "[applied]" || applied_spec.typ != ColumnType::Boolean {
            return Err(NotACasResult);
        }

        let row = self
            .rows
            .as_ref()
            .and_then(|rows| rows.first())
            .ok_or(NotACasResult)?;
        let applied = match row.columns.first() {
            Some(Some(CqlValue::Boolean(applied))) => *applied,
            _ => return Err(NotACasResult),
        };

        // On a rejected conditional statement the row carries the current
        // state of the partition that blocked the update.
        let existing_row = if applied { None } else { Some(row) };

        Ok((applied, existing_row))
    }
}

/// An error returned by [`QueryResult::rows()`] when the query
/// was not supposed to return rows, e.g. it was an `INSERT`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "QueryResult::rows() or similar function called on a bad QueryResult.
         Expected QueryResult.rows to be Some, but it was None.
         QueryResult.rows is Some for queries that can return rows (e.g SELECT).
         It is None for queries that can't return rows (e.g INSERT)."
)]
pub struct RowsExpectedError;

/// An error returned by [`QueryResult::result_not_rows()`] when the query
/// was supposed to return rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "QueryResult::result_not_rows() called on a bad QueryResult.
         Expected QueryResult.rows to be None, but it was Some.
         QueryResult.rows is Some for queries that can return rows (e.g SELECT).
         It is None for queries that can't return rows (e.g INSERT)."
)]
pub struct RowsNotExpectedError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirstRowError {
    /// [`QueryResult::first_row()`] called on a bad QueryResult
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    /// Rows in `QueryResult` are empty
    #[error("Rows in QueryResult are empty")]
    RowsEmpty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirstRowTypedError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    #[error("Rows in QueryResult are empty")]
    RowsEmpty,

    #[error(transparent)]
    FromRowError(#[from] FromRowError),
}

impl From<FirstRowError> for FirstRowTypedError {
    fn from(err: FirstRowError) -> FirstRowTypedError {
        match err {
            FirstRowError::RowsExpected(e) => FirstRowTypedError::RowsExpected(e),
            FirstRowError::RowsEmpty => FirstRowTypedError::RowsEmpty,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MaybeFirstRowTypedError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    #[error(transparent)]
    FromRowError(#[from] FromRowError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SingleRowError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    /// Expected a single row, found other number of rows
    #[error("Expected a single row, found {0} rows")]
    BadNumberOfRows(usize),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SingleRowTypedError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    #[error("Expected a single row, found {0} rows")]
    BadNumberOfRows(usize),

    #[error(transparent)]
    FromRowError(#[from] FromRowError),
}

impl From<SingleRowError> for SingleRowTypedError {
    fn from(err: SingleRowError) -> SingleRowTypedError {
        match err {
            SingleRowError::RowsExpected(e) => SingleRowTypedError::RowsExpected(e),
            SingleRowError::BadNumberOfRows(r) => SingleRowTypedError::BadNumberOfRows(r),
        }
    }
}

/// An error returned by [`QueryResult::cas_applied()`] for a result that
/// does not carry the `[applied]` column of a conditional statement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Result has no [applied] column: not a result of a conditional statement")]
pub struct NotACasResult;

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_cql::frame::response::result::TableSpec;

    fn make_string_rows(rows: &[&str]) -> QueryResult {
        QueryResult {
            rows: Some(
                rows.iter()
                    .map(|s| Row {
                        columns: vec![Some(CqlValue::Text(s.to_string()))],
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn cas_result(applied: bool, extra_columns: Vec<Option<CqlValue>>) -> QueryResult {
        let table_spec = TableSpec {
            ks_name: "ks".to_string(),
            table_name: "t".to_string(),
        };
        let mut col_specs = vec![ColumnSpec {
            table_spec: table_spec.clone(),
            name: "[applied]".to_string(),
            typ: ColumnType::Boolean,
        }];
        for (i, _) in extra_columns.iter().enumerate() {
            col_specs.push(ColumnSpec {
                table_spec: table_spec.clone(),
                name: format!("col{}", i),
                typ: ColumnType::Text,
            });
        }

        let mut columns = vec![Some(CqlValue::Boolean(applied))];
        columns.extend(extra_columns);

        QueryResult {
            rows: Some(vec![Row { columns }]),
            col_specs,
            ..Default::default()
        }
    }

    #[test]
    fn single_row_works() {
        assert!(make_string_rows(&["a"]).single_row().is_ok());
        assert_eq!(
            make_string_rows(&["a", "b"]).single_row(),
            Err(SingleRowError::BadNumberOfRows(2))
        );
        assert_eq!(
            make_string_rows(&[]).single_row(),
            Err(SingleRowError::BadNumberOfRows(0))
        );
    }

    #[test]
    fn first_row_works() {
        let (text,): (String,) = make_string_rows(&["a", "b"]).first_row_typed().unwrap();
        assert_eq!(text, "a");

        assert_eq!(
            make_string_rows(&[]).first_row(),
            Err(FirstRowError::RowsEmpty)
        );
    }

    #[test]
    fn not_rows_result() {
        let void = QueryResult::default();
        assert!(void.result_not_rows().is_ok());
        assert_eq!(void.rows_num(), Err(RowsExpectedError));
    }

    #[test]
    fn cas_applied_true_has_no_existing_row() {
        let result = cas_result(true, vec![]);
        let (applied, row) = result.cas_applied().unwrap();
        assert!(applied);
        assert!(row.is_none());
    }

    #[test]
    fn cas_applied_false_surfaces_current_row() {
        let result = cas_result(
            false,
            vec![Some(CqlValue::Text("existing value".to_string()))],
        );
        let (applied, row) = result.cas_applied().unwrap();
        assert!(!applied);
        let row = row.unwrap();
        assert_eq!(
            row.columns[1],
            Some(CqlValue::Text("existing value".to_string()))
        );
    }

    #[test]
    fn non_cas_result_is_detected() {
        let result = make_string_rows(&["a"]);
        assert_eq!(result.cas_applied(), Err(NotACasResult));

        let void = QueryResult::default();
        assert_eq!(void.cas_applied(), Err(NotACasResult));
    }
}
