//! Conflict-free multi-writer replication over SQLite.
//!
//! Every write becomes an immutable patch row stamped with a hybrid
//! logical clock and a per-peer sequence id. Peers exchange patches in
//! any order and fold them into their base tables with a deterministic
//! last-writer-wins merge, so replicas converge without coordination.
//!
//! # Example
//! ```
//! use std::collections::HashMap;
//! use patch_sync::{Config, Engine, Migration, Value};
//!
//! let mut engine = Engine::open_in_memory(42, Config::default())?;
//! engine.migrate(&[Migration::new(
//!     "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
//!     "DROP TABLE users;",
//! )])?;
//!
//! let mut row = HashMap::new();
//! row.insert("id".to_string(), Value::Integer(1));
//! row.insert("name".to_string(), Value::from("Ada"));
//! assert_eq!(engine.upsert("users", row)?, "42.1");
//!
//! // Hand everything in `engine.take_outbox()` to the transport.
//! # Ok::<(), patch_sync::Error>(())
//! ```

mod config;
mod engine;
mod error;
mod hlc;
mod merge;
mod message;
mod migrate;
mod peer;
mod schema;
mod value;

pub use config::Config;
pub use engine::{Engine, Status};
pub use error::{Error, Result};
pub use hlc::{generate_peer_id, now_millis, Hlc, HlcState, EPOCH_MS, MAX_COUNTER};
pub use message::{Message, MissingPatchRequest, Patch, Ping};
pub use migrate::{MigrateOutcome, Migration};
pub use peer::PeerStats;
pub use schema::{Column, TableSchema};
pub use value::Value;
