use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine not migrated; call migrate() before writing")]
    NotMigrated,
    #[error("no such table: {table}")]
    UnknownTable { table: String },
    #[error("table {table} has no primary key and cannot be replicated")]
    NoPrimaryKey { table: String },
    #[error("table {table} has no column named {column}")]
    UnknownColumn { table: String, column: String },
    #[error("write to {table} is missing primary key column {column}")]
    MissingPrimaryKey { table: String, column: String },
    #[error("patch carries schema version {remote} but the local database is at {local}")]
    SchemaVersionAhead { remote: i64, local: i64 },
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
