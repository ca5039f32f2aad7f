//! Forward/rollback schema migrations and peer-sequence recovery.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::hlc::Hlc;
use crate::schema::{self, quote_ident};

/// One reversible migration step. The schema version of a database is the
/// number of steps applied to it.
#[derive(Debug, Clone)]
pub struct Migration {
    pub up: String,
    pub down: String,
}

impl Migration {
    pub fn new(up: &str, down: &str) -> Self {
        Self { up: up.to_string(), down: down.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOutcome {
    pub prev: i64,
    pub curr: i64,
}

const MIGRATIONS_DDL: &str = "
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY,
    up TEXT NOT NULL,
    down TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Bring the database to `migrations.len()`: apply pending steps in
/// ascending id order, or roll surplus steps back in descending id order
/// using the `down` text recorded when each was applied.
///
/// Failures surface immediately; already-executed steps stay recorded, so
/// a rerun resumes where the failure left off.
pub(crate) fn run(conn: &Connection, migrations: &[Migration]) -> Result<MigrateOutcome> {
    conn.execute_batch(MIGRATIONS_DDL)?;

    let prev: i64 = conn.query_row("SELECT coalesce(max(id), 0) FROM migrations", [], |row| {
        row.get(0)
    })?;
    let target = migrations.len() as i64;

    if target > prev {
        for id in (prev + 1)..=target {
            let step = &migrations[(id - 1) as usize];
            conn.execute_batch(&step.up)?;
            conn.execute(
                "INSERT INTO migrations (id, up, down) VALUES (?1, ?2, ?3)",
                params![id, step.up, step.down],
            )?;
        }
    } else if target < prev {
        let mut stmt = conn.prepare("SELECT id, down FROM migrations WHERE id > ?1 ORDER BY id DESC")?;
        let surplus = stmt
            .query_map(params![target], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, down) in surplus {
            conn.execute_batch(&down)?;
            conn.execute("DELETE FROM migrations WHERE id = ?1", params![id])?;
        }
    }

    Ok(MigrateOutcome { prev, curr: target })
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PeerSequence {
    pub last_sequence_id: i64,
    pub last_patch_at: Hlc,
}

/// Recover the local write frontier after a restart: the highest sequence
/// id and timestamp this peer has recorded in any patch table.
pub(crate) fn init_peer_sequence(conn: &Connection, peer_id: i64) -> Result<PeerSequence> {
    let mut recovered = PeerSequence::default();
    for table in schema::patch_tables(conn)? {
        let sql = format!(
            "SELECT coalesce(max(\"_sequenceId\"), 0), coalesce(max(\"_patchedAt\"), 0)
             FROM {} WHERE \"_peerId\" = ?1",
            quote_ident(&table)
        );
        let (seq, at): (i64, i64) =
            conn.query_row(&sql, params![peer_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        if seq > recovered.last_sequence_id {
            recovered.last_sequence_id = seq;
        }
        if at > recovered.last_patch_at.raw() {
            recovered.last_patch_at = Hlc::from_raw(at);
        }
    }
    Ok(recovered)
}
