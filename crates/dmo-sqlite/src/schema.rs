//! Introspection and value conversion

use dmo_kernel::{ColumnSpec, ForeignKey, GatewayError, TableName, TableSchema, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;

/// Quote an identifier for SQL text
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `"schema"."table"`
pub(crate) fn qualified(table: &TableName) -> String {
    format!("{}.{}", quote(table.schema()), quote(table.table()))
}

/// Comma-separated quoted column list
pub(crate) fn column_list<'a>(columns: impl IntoIterator<Item = &'a str>) -> String {
    columns.into_iter().map(quote).collect::<Vec<_>>().join(", ")
}

pub(crate) fn map_err(err: rusqlite::Error) -> GatewayError {
    match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied) => {
            GatewayError::Connectivity(err.to_string())
        }
        _ => GatewayError::Database(err.to_string()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

/// Attached database names, `temp` excluded
pub(crate) fn list_schemas(conn: &Connection) -> Result<Vec<String>, GatewayError> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_database_list WHERE name <> 'temp' ORDER BY seq")
        .map_err(map_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(map_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_err)?;
    Ok(names)
}

/// User tables of `schema`, sorted by name
pub(crate) fn list_tables(conn: &Connection, schema: &str) -> Result<Vec<TableSchema>, GatewayError> {
    let sql = format!(
        "SELECT name FROM {}.sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        quote(schema)
    );
    let mut stmt = conn.prepare(&sql).map_err(map_err)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(map_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_err)?;
    names
        .into_iter()
        .map(|name| describe(conn, &TableName::new(schema, name)))
        .collect()
}

/// Structure of one table; [`GatewayError::TableNotFound`] if it has no
/// columns
pub(crate) fn describe(conn: &Connection, table: &TableName) -> Result<TableSchema, GatewayError> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
        )
        .map_err(map_err)?;
    let rows = stmt
        .query_map(params![table.table(), table.schema()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(map_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_err)?;
    if rows.is_empty() {
        return Err(GatewayError::TableNotFound(table.clone()));
    }

    let mut key: Vec<(i64, String)> = Vec::new();
    let mut columns = Vec::with_capacity(rows.len());
    for (name, data_type, not_null, pk) in rows {
        if pk > 0 {
            key.push((pk, name.clone()));
        }
        columns.push(ColumnSpec::new(name, data_type.to_ascii_lowercase(), !not_null));
    }
    key.sort();

    let mut schema = TableSchema::new(table.clone(), columns)
        .with_primary_key(key.into_iter().map(|(_, name)| name));
    schema.foreign_keys = foreign_keys(conn, table)?;
    Ok(schema)
}

fn foreign_keys(conn: &Connection, table: &TableName) -> Result<Vec<ForeignKey>, GatewayError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\" FROM pragma_foreign_key_list(?1, ?2) ORDER BY id, seq",
        )
        .map_err(map_err)?;
    let rows = stmt
        .query_map(params![table.table(), table.schema()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(map_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(map_err)?;

    let mut grouped: BTreeMap<i64, ForeignKey> = BTreeMap::new();
    for (id, references, column) in rows {
        grouped
            .entry(id)
            .or_insert_with(|| ForeignKey {
                columns: Vec::new(),
                references: TableName::new(table.schema(), references),
            })
            .columns
            .push(column);
    }
    Ok(grouped.into_values().collect())
}

/// `CREATE TABLE IF NOT EXISTS` reproducing the columns, nullability,
/// primary key and foreign keys of `table`. Foreign keys reference the
/// parent's primary key in the same schema.
pub(crate) fn create_table_sql(table: &TableSchema) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut def = quote(&column.name);
            let data_type = type_name(&column.data_type);
            if !data_type.is_empty() {
                def.push(' ');
                def.push_str(data_type);
            }
            if !column.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    if !table.primary_key.is_empty() {
        parts.push(format!(
            "PRIMARY KEY ({})",
            column_list(table.primary_key.iter().map(String::as_str))
        ));
    }
    for fk in &table.foreign_keys {
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            column_list(fk.columns.iter().map(String::as_str)),
            quote(fk.references.table())
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(&table.name),
        parts.join(", ")
    )
}

/// Declared type, or nothing when it is not plain SQL type syntax
fn type_name(data_type: &str) -> &str {
    let plain = data_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '(' | ')' | ','));
    if plain {
        data_type.trim()
    } else {
        ""
    }
}

pub(crate) fn row_count(conn: &Connection, table: &TableName) -> Result<u64, GatewayError> {
    let sql = format!("SELECT COUNT(*) FROM {}", qualified(table));
    let count: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .optional()
        .map_err(map_err)?
        .unwrap_or(0);
    Ok(u64::try_from(count).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_double_quotes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            qualified(&TableName::new("main", "orders")),
            "\"main\".\"orders\""
        );
    }

    #[test]
    fn test_describe_reads_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE orders (
                 id INTEGER NOT NULL,
                 line INTEGER NOT NULL,
                 customer_id INTEGER REFERENCES customers(id),
                 PRIMARY KEY (id, line)
             );",
        )
        .unwrap();

        let tables = list_tables(&conn, "main").unwrap();
        let names: Vec<String> = tables.iter().map(|t| t.name.qualified()).collect();
        assert_eq!(names, vec!["main.customers", "main.orders"]);

        let orders = &tables[1];
        assert_eq!(orders.primary_key, vec!["id", "line"]);
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(
            orders.foreign_keys[0].references,
            TableName::new("main", "customers")
        );
        assert!(!orders.columns[0].nullable);
        assert!(orders.columns[2].nullable);

        assert!(matches!(
            describe(&conn, &TableName::new("main", "missing")),
            Err(GatewayError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_create_table_round_trips_through_describe() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY);")
            .unwrap();
        let lines = TableSchema::new(
            TableName::new("main", "order lines"),
            vec![
                ColumnSpec::new("order_id", "integer", false),
                ColumnSpec::new("line", "integer", false),
                ColumnSpec::new("customer_id", "integer", true),
                ColumnSpec::new("price", "numeric(10,2)", true),
                ColumnSpec::new("odd", "text\"; drop", true),
            ],
        )
        .with_primary_key(["order_id", "line"])
        .with_foreign_key(["customer_id"], TableName::new("main", "customers"));

        let sql = create_table_sql(&lines);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"main\".\"order lines\" ("));
        assert!(sql.contains("\"odd\", PRIMARY KEY"));
        conn.execute_batch(&sql).unwrap();
        conn.execute_batch(&sql).unwrap();

        let created = describe(&conn, &lines.name).unwrap();
        assert_eq!(created.primary_key, lines.primary_key);
        assert_eq!(created.foreign_keys, lines.foreign_keys);
        assert_eq!(created.columns[3].data_type, "numeric(10,2)");
        assert_eq!(created.columns[4].data_type, "");
        assert!(!created.columns[0].nullable);
        assert!(lines.check_compatible(&created).is_ok());
    }

    #[test]
    fn test_value_conversion_keeps_types() {
        for value in [
            Value::Null,
            Value::Int(-3),
            Value::Float(1.5),
            Value::Text("x".into()),
            Value::Bytes(vec![1, 2]),
        ] {
            let sql = to_sql(&value);
            assert_eq!(from_sql(ValueRef::from(&sql)), value);
        }
        assert_eq!(to_sql(&Value::Bool(true)), SqlValue::Integer(1));
    }
}
