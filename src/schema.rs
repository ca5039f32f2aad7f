//! Table introspection and patch-table provisioning.
//!
//! Identifiers that end up interpolated into SQL are either vetted against
//! `sqlite_master` first (table names from the wire) or come out of
//! `PRAGMA table_info` (column names); both are double-quote escaped on
//! top of that.

use rusqlite::{params, Connection};

use crate::error::{Error, Result};

pub(crate) const COL_PATCHED_AT: &str = "_patchedAt";
pub(crate) const COL_SEQUENCE_ID: &str = "_sequenceId";
pub(crate) const COL_PEER_ID: &str = "_peerId";
pub(crate) const COL_DELETED_AT: &str = "deletedAt";
pub(crate) const PATCH_TABLE_SUFFIX: &str = "_patches";

/// One column of a base table, as reported by the store.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub decl_type: String,
    /// 1-based position within the primary key, 0 for non-key columns.
    pub pk_ordinal: i64,
}

/// Ordered column list and primary key of one replicated base table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Primary key column names in key order.
    pub fn primary_key(&self) -> Vec<&str> {
        let mut keys: Vec<&Column> = self.columns.iter().filter(|c| c.pk_ordinal > 0).collect();
        keys.sort_by_key(|c| c.pk_ordinal);
        keys.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn patch_table(&self) -> String {
        format!("{}{}", self.table, PATCH_TABLE_SUFFIX)
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Read the column list and primary key of `table`.
///
/// A table without a primary key cannot be replicated and is rejected
/// here, at the first write that touches it.
pub(crate) fn introspect(conn: &Connection, table: &str) -> Result<TableSchema> {
    if !table_exists(conn, table)? {
        return Err(Error::UnknownTable { table: table.to_string() });
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(Column {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                pk_ordinal: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let schema = TableSchema { table: table.to_string(), columns };
    if schema.primary_key().is_empty() {
        return Err(Error::NoPrimaryKey { table: table.to_string() });
    }
    Ok(schema)
}

/// Create the companion patch table for `table` if it does not exist:
/// the three metadata columns, a nullable mirror of every base column,
/// and a `deletedAt` tombstone marker.
pub(crate) fn ensure_patch_table(conn: &Connection, table: &TableSchema) -> Result<()> {
    let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (\n", quote_ident(&table.patch_table()));
    ddl.push_str("    \"_patchedAt\" INTEGER NOT NULL,\n");
    ddl.push_str("    \"_sequenceId\" INTEGER NOT NULL,\n");
    ddl.push_str("    \"_peerId\" INTEGER NOT NULL,\n");
    for col in &table.columns {
        let quoted = quote_ident(&col.name);
        if col.decl_type.is_empty() {
            ddl.push_str(&format!("    {quoted},\n"));
        } else {
            ddl.push_str(&format!("    {quoted} {},\n", col.decl_type));
        }
    }
    if !table.has_column(COL_DELETED_AT) {
        ddl.push_str("    \"deletedAt\" INTEGER,\n");
    }
    ddl.push_str("    PRIMARY KEY (\"_patchedAt\", \"_sequenceId\", \"_peerId\")\n");
    ddl.push_str(") WITHOUT ROWID;");
    conn.execute_batch(&ddl)?;
    Ok(())
}

/// Names of every patch table in the database.
pub(crate) fn patch_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE '%\\_patches' ESCAPE '\\'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_users() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_introspect_columns_and_pk() {
        let conn = conn_with_users();
        let schema = introspect(&conn, "users").unwrap();
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "name", "email"]);
        assert_eq!(schema.primary_key(), ["id"]);
    }

    #[test]
    fn test_introspect_composite_pk_in_key_order() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE grants (role TEXT, user TEXT, level INTEGER,
             PRIMARY KEY (user, role));",
        )
        .unwrap();
        let schema = introspect(&conn, "grants").unwrap();
        assert_eq!(schema.primary_key(), ["user", "role"]);
    }

    #[test]
    fn test_missing_table_rejected() {
        let conn = conn_with_users();
        assert!(matches!(
            introspect(&conn, "nope"),
            Err(Error::UnknownTable { .. })
        ));
    }

    #[test]
    fn test_table_without_pk_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE log (line TEXT);").unwrap();
        assert!(matches!(
            introspect(&conn, "log"),
            Err(Error::NoPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_patch_table_mirrors_base_columns() {
        let conn = conn_with_users();
        let schema = introspect(&conn, "users").unwrap();
        ensure_patch_table(&conn, &schema).unwrap();

        let mut stmt = conn.prepare("PRAGMA table_info(\"users_patches\")").unwrap();
        let cols: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(1)?, row.get(5)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["_patchedAt", "_sequenceId", "_peerId", "id", "name", "email", "deletedAt"]
        );
        // Composite key over the metadata columns only.
        let pk: Vec<&str> = cols.iter().filter(|(_, pk)| *pk > 0).map(|(n, _)| n.as_str()).collect();
        assert_eq!(pk, ["_patchedAt", "_sequenceId", "_peerId"]);

        assert_eq!(patch_tables(&conn).unwrap(), ["users_patches"]);
    }

    #[test]
    fn test_patch_table_listing_needs_exact_suffix() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE scratchpatches (x INTEGER PRIMARY KEY);")
            .unwrap();
        assert!(patch_tables(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
