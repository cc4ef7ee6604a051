//! Core value types shared by planner, gateways and engine.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Schema-qualified table name.
///
/// Ordering is by the bytes of `schema.table`, which is what the planner
/// uses to break ties inside a level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Create a qualified name
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Schema part
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Unqualified table part
    #[inline]
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// `schema.table`
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl Ord for TableName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.schema
            .as_bytes()
            .iter()
            .chain(b".")
            .chain(self.table.as_bytes())
            .cmp(
                other
                    .schema
                    .as_bytes()
                    .iter()
                    .chain(b".")
                    .chain(other.table.as_bytes()),
            )
    }
}

impl PartialOrd for TableName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Rejected table name text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid table name `{0}`: expected `schema.table`")]
pub struct InvalidTableName(pub String);

impl FromStr for TableName {
    type Err = InvalidTableName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(InvalidTableName(s.to_string())),
        }
    }
}

impl TryFrom<String> for TableName {
    type Error = InvalidTableName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.qualified()
    }
}

/// Single column value as moved between databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type
    Int(i64),
    /// Any floating point / numeric type
    Float(f64),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Text(_) => 4,
            Self::Bytes(_) => 5,
        }
    }

    /// Whether the value is NULL
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Append the canonical, length-prefixed encoding used by checksums
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.rank());
        match self {
            Self::Null => {}
            Self::Bool(b) => out.push(u8::from(*b)),
            Self::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
            Self::Float(f) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
            Self::Text(s) => {
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "x'{}'", hex::encode(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One row, values in the column order of its [`TableSchema`]
pub type Row = Vec<Value>;

/// Keyset position: the key column values of the last row read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub Vec<Value>);

/// A page of source rows plus the key to resume after.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    /// Rows in key order
    pub rows: Vec<Row>,
    /// Key of the last row, `None` for an empty batch
    pub last_key: Option<RowKey>,
}

impl RowBatch {
    /// Number of rows in the batch
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch carries no rows
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// Declared type as the database reports it
    pub data_type: String,
    /// Whether NULL is accepted
    pub nullable: bool,
}

impl ColumnSpec {
    /// Create a column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Foreign key edge from the owning table to `references`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing columns on the owning table
    pub columns: Vec<String>,
    /// Referenced table
    pub references: TableName,
}

/// Table structure as discovered through a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Qualified name
    pub name: TableName,
    /// Columns in ordinal order
    pub columns: Vec<ColumnSpec>,
    /// Primary key column names, empty when the table has none
    pub primary_key: Vec<String>,
    /// Outgoing foreign keys
    pub foreign_keys: Vec<ForeignKey>,
}

/// Coarse type family used for compatibility checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeFamily {
    Integer,
    Real,
    Text,
    Binary,
    Boolean,
    Temporal,
    Unknown,
}

fn type_family(data_type: &str) -> TypeFamily {
    let t = data_type.to_ascii_lowercase();
    if t.is_empty() {
        TypeFamily::Unknown
    } else if t.starts_with("bool") {
        TypeFamily::Boolean
    } else if t.contains("int") || t.contains("serial") {
        TypeFamily::Integer
    } else if ["real", "float", "double", "numeric", "decimal"]
        .iter()
        .any(|k| t.contains(k))
    {
        TypeFamily::Real
    } else if ["char", "text", "clob", "uuid", "json", "string"]
        .iter()
        .any(|k| t.contains(k))
    {
        TypeFamily::Text
    } else if ["blob", "bytea", "binary"].iter().any(|k| t.contains(k)) {
        TypeFamily::Binary
    } else if ["date", "time"].iter().any(|k| t.contains(k)) {
        TypeFamily::Temporal
    } else {
        TypeFamily::Unknown
    }
}

impl TableSchema {
    /// Create a schema without keys
    pub fn new(name: TableName, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name,
            columns,
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Builder: set primary key columns
    #[must_use]
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: add a foreign key
    #[must_use]
    pub fn with_foreign_key<I, S>(mut self, columns: I, references: TableName) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_keys.push(ForeignKey {
            columns: columns.into_iter().map(Into::into).collect(),
            references,
        });
        self
    }

    /// Column names in ordinal order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Position of a column by name (ASCII case-insensitive)
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Positions of the primary key columns, `None` if any is missing
    #[must_use]
    pub fn key_indices(&self) -> Option<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|k| self.column_index(k))
            .collect()
    }

    /// Extract the key of `row`: primary key values, or the whole row when
    /// the table has no primary key
    #[must_use]
    pub fn key_of(&self, row: &[Value]) -> RowKey {
        match self.key_indices() {
            Some(indices) if !indices.is_empty() => RowKey(
                indices
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => RowKey(row.to_vec()),
        }
    }

    /// Tables this one references, excluding itself
    #[must_use]
    pub fn referenced_tables(&self) -> BTreeSet<TableName> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.references.clone())
            .filter(|t| *t != self.name)
            .collect()
    }

    /// For every destination column, the position of the same column in
    /// this (source) schema. `None` means the destination column has no
    /// source and receives NULL.
    #[must_use]
    pub fn positions_in(&self, destination: &TableSchema) -> Vec<Option<usize>> {
        destination
            .columns
            .iter()
            .map(|c| self.column_index(&c.name))
            .collect()
    }

    /// Check that rows of this table can be written into `destination`.
    ///
    /// Every source column must exist in the destination, and destination
    /// columns without a source must accept NULL. Type differences only warn.
    pub fn check_compatible(&self, destination: &TableSchema) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        for column in &self.columns {
            let Some(index) = destination.column_index(&column.name) else {
                return Err(format!("destination lacks column `{}`", column.name));
            };
            let target = &destination.columns[index];
            let (from, to) = (type_family(&column.data_type), type_family(&target.data_type));
            if from != to {
                let note = if from == TypeFamily::Unknown || to == TypeFamily::Unknown {
                    "cannot compare"
                } else {
                    "differs"
                };
                warnings.push(format!(
                    "column `{}`: type `{}` {note} from `{}`",
                    column.name, column.data_type, target.data_type
                ));
            }
            if column.nullable && !target.nullable {
                warnings.push(format!(
                    "column `{}` is nullable in source but NOT NULL in destination",
                    column.name
                ));
            }
        }
        for extra in &destination.columns {
            if self.column_index(&extra.name).is_some() {
                continue;
            }
            if extra.nullable {
                warnings.push(format!(
                    "destination column `{}` has no source and will be NULL",
                    extra.name
                ));
            } else {
                return Err(format!(
                    "destination column `{}` is NOT NULL and has no source",
                    extra.name
                ));
            }
        }
        Ok(warnings)
    }
}

/// A table found during discovery together with its size estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTable {
    /// Structure
    pub schema: TableSchema,
    /// Row count at discovery time
    pub row_count: u64,
}

impl DiscoveredTable {
    /// Qualified name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &TableName {
        &self.schema.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        TableSchema::new(
            TableName::new("public", "users"),
            vec![
                ColumnSpec::new("id", "integer", false),
                ColumnSpec::new("email", "varchar(255)", true),
            ],
        )
        .with_primary_key(["id"])
    }

    #[test]
    fn test_table_name_orders_by_qualified_bytes() {
        let mut names = vec![
            TableName::new("public", "orders"),
            TableName::new("audit", "zeta"),
            TableName::new("public", "customers"),
        ];
        names.sort();
        let rendered: Vec<String> = names.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["audit.zeta", "public.customers", "public.orders"]
        );
    }

    #[test]
    fn test_table_name_serializes_as_string() {
        let name = TableName::new("public", "users");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"public.users\"");
        let back: TableName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
        assert!(serde_json::from_str::<TableName>("\"users\"").is_err());
    }

    #[test]
    fn test_value_ordering_is_total() {
        assert!(Value::Null < Value::Int(0));
        assert!(Value::Int(2) < Value::Int(10));
        assert!(Value::Float(f64::NAN) == Value::Float(f64::NAN));
        assert!(Value::Text("a".into()) < Value::Text("b".into()));
    }

    #[test]
    fn test_key_of_uses_primary_key() {
        let row = vec![Value::Int(7), Value::from("a@b.c")];
        assert_eq!(users().key_of(&row), RowKey(vec![Value::Int(7)]));

        let keyless = TableSchema::new(users().name, users().columns);
        assert_eq!(keyless.key_of(&row), RowKey(row.clone()));
    }

    #[test]
    fn test_compatible_identical_schema() {
        assert_eq!(users().check_compatible(&users()), Ok(vec![]));
    }

    #[test]
    fn test_missing_destination_column_is_incompatible() {
        let mut dest = users();
        dest.columns.pop();
        let err = users().check_compatible(&dest).unwrap_err();
        assert!(err.contains("email"));
    }

    #[test]
    fn test_type_difference_only_warns() {
        let mut dest = users();
        dest.columns[1].data_type = "bytea".into();
        let warnings = users().check_compatible(&dest).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("differs"));
    }

    #[test]
    fn test_required_destination_column_without_source_is_incompatible() {
        let mut dest = users();
        dest.columns.push(ColumnSpec::new("tenant", "integer", false));
        assert!(users().check_compatible(&dest).is_err());
    }

    #[test]
    fn test_extra_nullable_destination_column_warns() {
        let mut dest = users();
        dest.columns.push(ColumnSpec::new("nickname", "text", true));
        let warnings = users().check_compatible(&dest).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(users().positions_in(&dest), vec![Some(0), Some(1), None]);
    }

    #[test]
    fn test_self_reference_is_not_a_dependency() {
        let schema = users()
            .with_foreign_key(["manager_id"], TableName::new("public", "users"))
            .with_foreign_key(["org_id"], TableName::new("public", "orgs"));
        let deps: Vec<_> = schema.referenced_tables().into_iter().collect();
        assert_eq!(deps, vec![TableName::new("public", "orgs")]);
    }
}
