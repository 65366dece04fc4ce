//! Storage target descriptors
//!
//! A [`SchemaDescriptor`] names a table, its typed columns and the columns
//! forming its composite key. The storage layer uses it to turn a loosely
//! typed [`FlatRecord`] into bound SQL values and to compute the key a record
//! collides on.
//!
//! Column values are looked up by column name first, then by the column's
//! source alias, so normalizers can pass upstream field names such as
//! `marketCapitalization` through untouched.

use crate::error::RegistryError;
use crate::model::FlatRecord;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Json,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double",
            ColumnType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Alternative field name to read when `name` is absent from the record.
    pub source: Option<String>,
    pub ty: ColumnType,
}

/// A column value after coercion. `None` is a typed SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    BigInt(Option<i64>),
    Double(Option<f64>),
    Json(Option<Value>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            SqlValue::Text(v) => v.is_none(),
            SqlValue::BigInt(v) => v.is_none(),
            SqlValue::Double(v) => v.is_none(),
            SqlValue::Json(v) => v.is_none(),
        }
    }

    fn canonical(&self) -> String {
        match self {
            SqlValue::Text(Some(s)) => s.clone(),
            SqlValue::BigInt(Some(n)) => n.to_string(),
            SqlValue::Double(Some(n)) => n.to_string(),
            SqlValue::Json(Some(v)) => v.to_string(),
            _ => String::new(),
        }
    }
}

/// The value of a record's composite key, one canonical string per key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(Vec<String>);

impl CompositeKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

/// Table, typed columns and composite key of a storage target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    table: String,
    columns: Vec<ColumnSpec>,
    key: Vec<String>,
}

impl SchemaDescriptor {
    pub fn builder(table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            table: table.into(),
            columns: Vec::new(),
            key: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Column names forming the composite key, in declaration order.
    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::invalid_schema(&self.table, reason);

        if !is_identifier(&self.table) {
            return Err(invalid("table name is not a plain identifier".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("no columns declared".to_string()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return Err(invalid(format!("column '{}' is not a plain identifier", column.name)));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("column '{}' declared twice", column.name)));
            }
        }

        if self.key.is_empty() {
            return Err(invalid("composite key is empty".to_string()));
        }
        for key in &self.key {
            if !seen.contains(key.as_str()) {
                return Err(invalid(format!("key column '{key}' is not a declared column")));
            }
        }

        Ok(())
    }

    /// The raw value a record holds for `column`, ignoring nulls.
    pub fn lookup<'r>(&self, column: &ColumnSpec, record: &'r FlatRecord) -> Option<&'r Value> {
        let direct = record.get(&column.name).filter(|v| !v.is_null());
        direct.or_else(|| {
            column
                .source
                .as_ref()
                .and_then(|source| record.get(source))
                .filter(|v| !v.is_null())
        })
    }

    /// Key columns the record has no non-null value for.
    pub fn missing_key_fields(&self, record: &FlatRecord) -> Vec<&str> {
        self.key_columns()
            .filter(|column| self.lookup(column, record).is_none())
            .map(|column| column.name.as_str())
            .collect()
    }

    /// Compute the composite key of `record`.
    pub fn key_of(&self, record: &FlatRecord) -> Result<CompositeKey, String> {
        let missing = self.missing_key_fields(record);
        if !missing.is_empty() {
            return Err(format!(
                "{}: missing key field(s) {}",
                self.table,
                missing.join(", ")
            ));
        }

        let parts = self
            .key_columns()
            .map(|column| self.coerce(column, record).map(|v| v.canonical()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompositeKey(parts))
    }

    /// Coerce every column of `record`, in declaration order.
    ///
    /// Fails when a key column is missing or any value cannot be coerced to
    /// its column type. Absent non-key columns become typed NULLs.
    pub fn bind_row(&self, record: &FlatRecord) -> Result<Vec<SqlValue>, String> {
        self.key_of(record)?;
        self.columns
            .iter()
            .map(|column| self.coerce(column, record))
            .collect()
    }

    fn key_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.key.iter().filter_map(|k| self.column(k))
    }

    fn coerce(&self, column: &ColumnSpec, record: &FlatRecord) -> Result<SqlValue, String> {
        coerce_value(column.ty, self.lookup(column, record)).map_err(|found| {
            format!(
                "{}.{}: cannot store {} as {}",
                self.table,
                column.name,
                found,
                column.ty.as_str()
            )
        })
    }
}

fn coerce_value(ty: ColumnType, value: Option<&Value>) -> Result<SqlValue, String> {
    let Some(value) = value else {
        return Ok(match ty {
            ColumnType::Text => SqlValue::Text(None),
            ColumnType::BigInt => SqlValue::BigInt(None),
            ColumnType::Double => SqlValue::Double(None),
            ColumnType::Json => SqlValue::Json(None),
        });
    };

    let reject = || Err(value.to_string());

    match ty {
        ColumnType::Text => Ok(SqlValue::Text(Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))),
        ColumnType::BigInt => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(SqlValue::BigInt(Some(i))),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(SqlValue::BigInt(Some(f as i64)))
                    },
                    _ => reject(),
                },
            },
            Value::String(s) => s.trim().parse().map(|i| SqlValue::BigInt(Some(i))).or_else(|_| reject()),
            _ => reject(),
        },
        ColumnType::Double => match value {
            Value::Number(n) => n.as_f64().map(|f| SqlValue::Double(Some(f))).ok_or_else(|| value.to_string()),
            Value::String(s) => s.trim().parse().map(|f| SqlValue::Double(Some(f))).or_else(|_| reject()),
            _ => reject(),
        },
        ColumnType::Json => Ok(SqlValue::Json(Some(value.clone()))),
    }
}

/// Lowercase ASCII identifier safe to splice into SQL.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Builder for [`SchemaDescriptor`]
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    table: String,
    columns: Vec<ColumnSpec>,
    key: Vec<String>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            source: None,
            ty,
        });
        self
    }

    /// A column read from `source` when the record lacks `name`.
    pub fn column_from(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
        ty: ColumnType,
    ) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            source: Some(source.into()),
            ty,
        });
        self
    }

    pub fn text(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Text)
    }

    pub fn bigint(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::BigInt)
    }

    pub fn double(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Double)
    }

    pub fn json(self, name: impl Into<String>) -> Self {
        self.column(name, ColumnType::Json)
    }

    pub fn key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor, RegistryError> {
        let schema = SchemaDescriptor {
            table: self.table,
            columns: self.columns,
            key: self.key,
        };
        schema.validate()?;
        Ok(schema)
    }
}
