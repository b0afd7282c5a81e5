//! Column schemas, typed cell values and the rules for matching a client's
//! view of a table against the tablet's current schema.
//!
//! A tablet schema always carries a stable [`ColumnId`] per column. Ids are
//! assigned by the tablet when it is created and when the schema is altered;
//! stored rows reference cells by id, so rows written under an older schema
//! version stay readable after columns are added or dropped. Client schemas
//! (write requests, scan projections) never carry ids: the tablet resolves
//! client columns by name.

pub mod row;

use crate::encoding::keycode;
use crate::error::Result;
use crate::Error;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub use row::{apply_change, Row, RowChange};

/// Stable identifier of a column across schema versions.
pub type ColumnId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Int64,
    String,
    Binary,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::String => "string",
            DataType::Binary => "binary",
        }
    }

    /// Byte width of fixed-size types, `None` for variable-length ones.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            DataType::UInt8 => Some(1),
            DataType::UInt16 => Some(2),
            DataType::UInt32 | DataType::Int32 => Some(4),
            DataType::UInt64 | DataType::Int64 => Some(8),
            DataType::String | DataType::Binary => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell value.
///
/// Values of the same type order numerically (integers) or byte-wise
/// (strings and binary); `Null` orders before everything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::UInt8(_) => Some(DataType::UInt8),
            Value::UInt16(_) => Some(DataType::UInt16),
            Value::UInt32(_) => Some(DataType::UInt32),
            Value::UInt64(_) => Some(DataType::UInt64),
            Value::Int32(_) => Some(DataType::Int32),
            Value::Int64(_) => Some(DataType::Int64),
            Value::String(_) => Some(DataType::String),
            Value::Binary(_) => Some(DataType::Binary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rough in-memory footprint, used for batch and flush sizing.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::String(s) => s.len() + 4,
            Value::Binary(b) => b.len() + 4,
            other => other
                .data_type()
                .and_then(|t| t.fixed_size())
                .unwrap_or(1),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "\"{v}\""),
            Value::Binary(v) => write!(f, "{v:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Value reported for rows written before this column existed
    pub read_default: Option<Value>,
    /// Value stored when a writer omits this column
    pub write_default: Option<Value>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            read_default: None,
            write_default: None,
        }
    }

    pub fn with_defaults(mut self, read_default: Option<Value>, write_default: Option<Value>) -> Self {
        self.read_default = read_default;
        self.write_default = write_default;
        self
    }

    /// `uint32 NOT NULL` / `string NULLABLE`
    pub fn type_to_string(&self) -> String {
        let nullability = if self.nullable { "NULLABLE" } else { "NOT NULL" };
        format!("{} {}", self.data_type, nullability)
    }

    /// Same type and nullability; names and defaults are not compared.
    pub fn equals_type(&self, other: &ColumnSchema) -> bool {
        self.data_type == other.data_type && self.nullable == other.nullable
    }

    /// Check that `value` can be stored in this column.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        match value.data_type() {
            None if self.nullable => Ok(()),
            None => Err(Error::InvalidMutation(format!(
                "NULL value for non-nullable column {self}"
            ))),
            Some(t) if t == self.data_type => Ok(()),
            Some(t) => Err(Error::MismatchedSchema(format!(
                "value of type {t} for column {self}"
            ))),
        }
    }

    /// The value a reader sees for a cell that was never stored.
    pub fn missing_value(&self) -> Value {
        self.read_default.clone().unwrap_or(Value::Null)
    }
}

impl fmt::Display for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.type_to_string())
    }
}

/// An ordered list of columns whose first `num_key_columns` form the
/// primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    column_ids: Vec<ColumnId>,
    num_key_columns: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if num_key_columns > columns.len() {
            return Err(Error::InvalidSchema(format!(
                "{} key columns declared but only {} columns present",
                num_key_columns,
                columns.len()
            )));
        }

        let mut names = HashSet::new();
        for (idx, col) in columns.iter().enumerate() {
            if !names.insert(col.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "Duplicate column name: {}",
                    col.name
                )));
            }
            if idx < num_key_columns && col.nullable {
                return Err(Error::InvalidSchema(format!(
                    "Key column {col} may not be nullable"
                )));
            }
            for default in [&col.read_default, &col.write_default].into_iter().flatten() {
                col.check_value(default).map_err(|_| {
                    Error::InvalidSchema(format!("Default {default} does not match column {col}"))
                })?;
            }
        }

        Ok(Self {
            columns,
            column_ids: Vec::new(),
            num_key_columns,
        })
    }

    /// Attach column ids. Ids must be unique and one per column.
    pub fn with_column_ids(mut self, ids: Vec<ColumnId>) -> Result<Self> {
        if ids.len() != self.columns.len() {
            return Err(Error::InvalidSchema(format!(
                "{} column ids for {} columns",
                ids.len(),
                self.columns.len()
            )));
        }
        if ids.iter().duplicates().next().is_some() {
            return Err(Error::InvalidSchema("Duplicate column id".to_string()));
        }
        self.column_ids = ids;
        Ok(self)
    }

    pub fn without_column_ids(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            column_ids: Vec::new(),
            num_key_columns: self.num_key_columns,
        }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> &ColumnSchema {
        &self.columns[idx]
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column_ids(&self) -> bool {
        !self.column_ids.is_empty()
    }

    pub fn column_id(&self, idx: usize) -> Option<ColumnId> {
        self.column_ids.get(idx).copied()
    }

    pub fn column_ids(&self) -> &[ColumnId] {
        &self.column_ids
    }

    fn require_ids(&self) -> Result<()> {
        if self.has_column_ids() {
            Ok(())
        } else {
            Err(Error::InvalidState(
                "Operation requires a schema with column ids".to_string(),
            ))
        }
    }

    /// The tablet-side copy of a freshly created table schema.
    pub fn assign_column_ids(&self) -> Result<Self> {
        if self.num_key_columns == 0 {
            return Err(Error::InvalidSchema(
                "Tablet schema needs at least one key column".to_string(),
            ));
        }
        let ids = (0..self.columns.len() as ColumnId).collect();
        self.without_column_ids().with_column_ids(ids)
    }

    /// Resolve an altered client schema against this (id-carrying) schema.
    ///
    /// Columns keep their id when the name is unchanged; new columns get
    /// fresh ids above every id this schema has used.
    pub fn alter_to(&self, altered: &Schema) -> Result<Self> {
        self.require_ids()?;

        if altered.num_key_columns != self.num_key_columns
            || altered
                .key_columns()
                .iter()
                .zip(self.key_columns())
                .any(|(a, b)| a.name != b.name || !a.equals_type(b))
        {
            return Err(Error::InvalidSchema(
                "Key columns may not be altered".to_string(),
            ));
        }

        let mut next_id = self.column_ids.iter().max().map_or(0, |id| id + 1);
        let mut ids = Vec::with_capacity(altered.num_columns());
        for col in altered.columns() {
            match self.find_column(&col.name) {
                Some(idx) => {
                    if !self.columns[idx].equals_type(col) {
                        return Err(Error::InvalidSchema(format!(
                            "Cannot change the type of column {} from {} to {}",
                            col.name,
                            self.columns[idx].type_to_string(),
                            col.type_to_string()
                        )));
                    }
                    ids.push(self.column_ids[idx]);
                }
                None => {
                    if !col.nullable && col.read_default.is_none() {
                        return Err(Error::InvalidSchema(format!(
                            "Added column {col} must be nullable or have a read default"
                        )));
                    }
                    ids.push(next_id);
                    next_id += 1;
                }
            }
        }

        altered.without_column_ids().with_column_ids(ids)
    }

    fn reject_client_ids(client: &Schema) -> Result<()> {
        if client.has_column_ids() {
            return Err(Error::InvalidSchema(
                "User requests should not have Column IDs".to_string(),
            ));
        }
        Ok(())
    }

    fn check_column_type(tablet_col: &ColumnSchema, client_col: &ColumnSchema) -> Result<()> {
        if !tablet_col.equals_type(client_col) {
            return Err(Error::MismatchedSchema(format!(
                "The column '{}' must have type {} found {}",
                tablet_col.name,
                tablet_col.type_to_string(),
                client_col.type_to_string()
            )));
        }
        Ok(())
    }

    /// Validate a scan projection. Every projected column must exist in this
    /// schema with the same type and nullability.
    pub fn validate_projection(&self, projection: &Schema) -> Result<()> {
        Self::reject_client_ids(projection)?;

        let missing = projection
            .columns()
            .iter()
            .filter(|c| self.find_column(&c.name).is_none())
            .map(|c| c.name.as_str())
            .collect_vec();
        if !missing.is_empty() {
            return Err(Error::MismatchedSchema(format!(
                "Some columns are not present in the current schema: {}",
                missing.join(", ")
            )));
        }

        for col in projection.columns() {
            if let Some(idx) = self.find_column(&col.name) {
                Self::check_column_type(&self.columns[idx], col)?;
            }
        }
        Ok(())
    }

    /// Validate the schema a client wrote its rows with.
    ///
    /// On top of the projection rules, every key column and every
    /// non-nullable column without a write default must be supplied.
    pub fn validate_client_write_schema(&self, client: &Schema) -> Result<()> {
        Self::reject_client_ids(client)?;

        for col in client.columns() {
            match self.find_column(&col.name) {
                None => {
                    return Err(Error::MismatchedSchema(format!(
                        "Client provided column {col} not present in tablet"
                    )))
                }
                Some(idx) => Self::check_column_type(&self.columns[idx], col)?,
            }
        }

        for (idx, col) in self.columns.iter().enumerate() {
            let required =
                idx < self.num_key_columns || (!col.nullable && col.write_default.is_none());
            if required && client.find_column(&col.name).is_none() {
                return Err(Error::MismatchedSchema(format!(
                    "Client missing required column: {col}"
                )));
            }
        }
        Ok(())
    }

    /// Build a stored row from values laid out by `client`. Columns the
    /// client omitted get their write default, or NULL.
    pub fn row_from_client(&self, client: &Schema, values: &[Value]) -> Result<Row> {
        self.require_ids()?;
        if values.len() != client.num_columns() {
            return Err(Error::MismatchedSchema(format!(
                "Row has {} values, schema has {} columns",
                values.len(),
                client.num_columns()
            )));
        }

        let mut row = Row::new();
        for (idx, col) in self.columns.iter().enumerate() {
            let value = match client.find_column(&col.name) {
                Some(client_idx) => values[client_idx].clone(),
                None => match &col.write_default {
                    Some(default) => default.clone(),
                    None if col.nullable => Value::Null,
                    None => {
                        return Err(Error::MismatchedSchema(format!(
                            "Client missing required column: {col}"
                        )))
                    }
                },
            };
            col.check_value(&value)?;
            row.set(self.column_ids[idx], value);
        }
        Ok(row)
    }

    /// Order-preserving encoding of a row's primary key.
    pub fn encode_row_key(&self, row: &Row) -> Result<Vec<u8>> {
        self.require_ids()?;
        let mut buf = Vec::new();
        for (idx, col) in self.key_columns().iter().enumerate() {
            let value = row.get(self.column_ids[idx]).ok_or_else(|| {
                Error::MismatchedSchema(format!("Row is missing key column {col}"))
            })?;
            col.check_value(value)?;
            keycode::encode_value_into(&mut buf, value)?;
        }
        Ok(buf)
    }

    /// Order-preserving encoding of primary key values given in key order.
    pub fn encode_key(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.num_key_columns {
            return Err(Error::InvalidMutation(format!(
                "Expected {} key values, got {}",
                self.num_key_columns,
                values.len()
            )));
        }
        let mut buf = Vec::new();
        for (col, value) in self.key_columns().iter().zip(values) {
            col.check_value(value)?;
            keycode::encode_value_into(&mut buf, value)?;
        }
        Ok(buf)
    }

    /// Human readable form of an encoded key, e.g. `(1234, "a")`.
    pub fn debug_key(&self, encoded: &[u8]) -> String {
        let types = self.key_columns().iter().map(|c| c.data_type).collect_vec();
        match keycode::decode_values(encoded, &types) {
            Ok(values) => format!("({})", values.iter().join(", ")),
            Err(_) => format!("{encoded:?}"),
        }
    }

    /// Values of a stored row laid out by this schema, falling back to each
    /// column's read default for cells the row never stored.
    pub fn project_row(&self, row: &Row) -> Vec<Value> {
        self.columns
            .iter()
            .zip(&self.column_ids)
            .map(|(col, id)| row.get(*id).cloned().unwrap_or_else(|| col.missing_value()))
            .collect()
    }

    /// A tablet-side projection: the client's columns resolved to this
    /// schema's ids and defaults.
    pub fn resolve_projection(&self, projection: &Schema) -> Result<Schema> {
        self.require_ids()?;
        self.validate_projection(projection)?;
        let mut columns = Vec::with_capacity(projection.num_columns());
        let mut ids = Vec::with_capacity(projection.num_columns());
        for col in projection.columns() {
            let idx = self.find_column(&col.name).ok_or_else(|| {
                Error::MismatchedSchema(format!("Unknown column {}", col.name))
            })?;
            columns.push(self.columns[idx].clone());
            ids.push(self.column_ids[idx]);
        }
        Schema {
            columns,
            column_ids: Vec::new(),
            num_key_columns: projection.num_key_columns.min(projection.num_columns()),
        }
        .with_column_ids(ids)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.columns.iter().join(", "))
    }
}

/// Builder for schemas, used by clients to declare tables and alterations.
#[derive(Debug, Default, Clone)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing schema (ids are dropped).
    pub fn from_schema(schema: &Schema) -> Self {
        Self {
            columns: schema.columns.clone(),
            num_key_columns: schema.num_key_columns,
        }
    }

    pub fn add_key_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let col = ColumnSchema::new(name, data_type, false);
        self.columns.insert(self.num_key_columns, col);
        self.num_key_columns += 1;
        self
    }

    pub fn add_column(mut self, name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        self.columns.push(ColumnSchema::new(name, data_type, nullable));
        self
    }

    pub fn add_column_with_defaults(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        nullable: bool,
        read_default: Option<Value>,
        write_default: Option<Value>,
    ) -> Self {
        self.columns.push(
            ColumnSchema::new(name, data_type, nullable).with_defaults(read_default, write_default),
        );
        self
    }

    pub fn remove_column(mut self, name: &str) -> Self {
        if let Some(idx) = self.columns.iter().position(|c| c.name == name) {
            if idx >= self.num_key_columns {
                self.columns.remove(idx);
            }
        }
        self
    }

    pub fn build(self) -> Result<Schema> {
        Schema::new(self.columns, self.num_key_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
        SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .add_column("string_val", DataType::String, true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_column_display() {
        let schema = test_schema();
        assert_eq!(schema.column(0).to_string(), "key[uint32 NOT NULL]");
        assert_eq!(schema.column(2).type_to_string(), "string NULLABLE");
    }

    #[test]
    fn test_invalid_schemas() {
        let dup = Schema::new(
            vec![
                ColumnSchema::new("a", DataType::UInt32, false),
                ColumnSchema::new("a", DataType::UInt32, false),
            ],
            1,
        );
        assert!(matches!(dup, Err(Error::InvalidSchema(_))));

        let nullable_key = Schema::new(vec![ColumnSchema::new("k", DataType::UInt32, true)], 1);
        assert!(matches!(nullable_key, Err(Error::InvalidSchema(_))));

        let bad_default = SchemaBuilder::new()
            .add_key_column("k", DataType::UInt32)
            .add_column_with_defaults("c", DataType::UInt32, false, Some(Value::Int64(1)), None)
            .build();
        assert!(matches!(bad_default, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_client_write_schema_validation() {
        let tablet = test_schema().assign_column_ids().unwrap();

        let err = tablet.validate_client_write_schema(&tablet).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid schema: User requests should not have Column IDs"
        );

        let missing_key = SchemaBuilder::new()
            .add_column("int_val", DataType::UInt32, false)
            .add_column("string_val", DataType::String, true)
            .build()
            .unwrap();
        let err = tablet.validate_client_write_schema(&missing_key).unwrap_err();
        assert!(matches!(err, Error::MismatchedSchema(_)));
        assert!(err
            .to_string()
            .contains("Client missing required column: key[uint32 NOT NULL]"));

        let extra = SchemaBuilder::from_schema(&test_schema())
            .add_column("col_doesnt_exist", DataType::UInt32, false)
            .build()
            .unwrap();
        let err = tablet.validate_client_write_schema(&extra).unwrap_err();
        assert!(err.to_string().contains(
            "Client provided column col_doesnt_exist[uint32 NOT NULL] not present in tablet"
        ));

        // Nullable columns may be omitted.
        let no_string = SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .build()
            .unwrap();
        tablet.validate_client_write_schema(&no_string).unwrap();
    }

    #[test]
    fn test_projection_validation() {
        let tablet = test_schema().assign_column_ids().unwrap();

        let missing = Schema::new(vec![ColumnSchema::new("col_doesnt_exist", DataType::UInt32, false)], 0)
            .unwrap();
        let err = tablet.validate_projection(&missing).unwrap_err();
        assert!(err
            .to_string()
            .contains("Some columns are not present in the current schema: col_doesnt_exist"));

        let wrong_null = Schema::new(vec![ColumnSchema::new("int_val", DataType::UInt32, true)], 0)
            .unwrap();
        let err = tablet.validate_projection(&wrong_null).unwrap_err();
        assert!(err.to_string().contains(
            "The column 'int_val' must have type uint32 NOT NULL found uint32 NULLABLE"
        ));

        let wrong_type = Schema::new(vec![ColumnSchema::new("string_val", DataType::UInt32, true)], 0)
            .unwrap();
        let err = tablet.validate_projection(&wrong_type).unwrap_err();
        assert!(err.to_string().contains(
            "The column 'string_val' must have type string NULLABLE found uint32 NULLABLE"
        ));
    }

    #[test]
    fn test_row_from_client_fills_defaults() {
        let tablet = SchemaBuilder::from_schema(&test_schema())
            .add_column_with_defaults(
                "c2",
                DataType::UInt32,
                false,
                Some(Value::UInt32(7)),
                Some(Value::UInt32(5)),
            )
            .build()
            .unwrap()
            .assign_column_ids()
            .unwrap();

        let client = SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .build()
            .unwrap();

        let row = tablet
            .row_from_client(&client, &[Value::UInt32(1), Value::UInt32(2)])
            .unwrap();
        assert_eq!(
            tablet.project_row(&row),
            vec![Value::UInt32(1), Value::UInt32(2), Value::Null, Value::UInt32(5)]
        );
    }

    #[test]
    fn test_alter_assigns_fresh_ids_and_read_defaults() {
        let v0 = test_schema().assign_column_ids().unwrap();
        let altered = SchemaBuilder::from_schema(&test_schema())
            .remove_column("string_val")
            .add_column_with_defaults(
                "c2",
                DataType::UInt32,
                false,
                Some(Value::UInt32(7)),
                Some(Value::UInt32(5)),
            )
            .build()
            .unwrap();

        let v1 = v0.alter_to(&altered).unwrap();
        assert_eq!(v1.column_ids(), &[0, 1, 3]);

        // A row stored under v0 has no c2 cell and reads its read default.
        let mut row = Row::new();
        row.set(0, Value::UInt32(1));
        row.set(1, Value::UInt32(10));
        row.set(2, Value::String("gone".into()));
        assert_eq!(
            v1.project_row(&row),
            vec![Value::UInt32(1), Value::UInt32(10), Value::UInt32(7)]
        );

        let no_default = SchemaBuilder::from_schema(&test_schema())
            .add_column("c3", DataType::UInt32, false)
            .build()
            .unwrap();
        assert!(matches!(v0.alter_to(&no_default), Err(Error::InvalidSchema(_))));

        let new_key = SchemaBuilder::new()
            .add_key_column("other", DataType::UInt32)
            .build()
            .unwrap();
        assert!(matches!(v0.alter_to(&new_key), Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_key_encoding_orders_rows() {
        let tablet = test_schema().assign_column_ids().unwrap();
        let k1 = tablet.encode_key(&[Value::UInt32(2)]).unwrap();
        let k2 = tablet.encode_key(&[Value::UInt32(10)]).unwrap();
        assert!(k1 < k2);
        assert_eq!(tablet.debug_key(&k2), "(10)");

        assert!(tablet.encode_key(&[Value::String("x".into())]).is_err());
    }
}
