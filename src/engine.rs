//! The replication engine: patch writer, patch receiver, and the
//! maintenance heartbeat, all driving one SQLite handle.
//!
//! The engine is single-threaded by construction. It owns the connection,
//! the clock, and the peer map; callers serialise through its public
//! surface and the transport moves whatever [`take_outbox`](Engine::take_outbox)
//! hands it.

use std::collections::{HashMap, VecDeque};

use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hlc::{generate_peer_id, now_millis, Hlc, HlcState};
use crate::merge;
use crate::message::{Message, MissingPatchRequest, Patch, Ping};
use crate::migrate::{self, MigrateOutcome, Migration};
use crate::peer::{PeerBook, PeerStats};
use crate::schema::{
    self, quote_ident, TableSchema, COL_DELETED_AT, COL_PATCHED_AT, COL_PEER_ID, COL_SEQUENCE_ID,
    PATCH_TABLE_SUFFIX,
};
use crate::value::Value;

/// Minimum interval between retention sweeps.
const GC_INTERVAL_MS: i64 = 3_600_000;

/// Point-in-time view of the engine, safe to hold across writes.
#[derive(Debug, Clone)]
pub struct Status {
    pub peer_id: i64,
    pub db_version: i64,
    pub last_sequence_id: i64,
    pub last_patch_at: Hlc,
    pub clock_drift: i64,
    pub peers: HashMap<i64, PeerStats>,
}

pub struct Engine {
    conn: Connection,
    peer_id: i64,
    config: Config,
    hlc: HlcState,
    peers: PeerBook,
    schemas: HashMap<String, TableSchema>,
    outbox: VecDeque<Message>,
    db_version: i64,
    /// -1 until `migrate` has run; writes are rejected before that.
    last_sequence_id: i64,
    last_patch_at: Hlc,
    last_gc_at_ms: i64,
    last_gap_scan_at_ms: i64,
}

impl Engine {
    /// Wrap an open connection. A `peer_id` of zero or less draws a fresh
    /// one; pass a persisted id to keep a stable identity.
    pub fn new(conn: Connection, peer_id: i64, config: Config) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL;\nPRAGMA synchronous = NORMAL;")?;
        let peer_id = if peer_id <= 0 { generate_peer_id() } else { peer_id };
        Ok(Self {
            conn,
            peer_id,
            config,
            hlc: HlcState::new(),
            peers: PeerBook::default(),
            schemas: HashMap::new(),
            outbox: VecDeque::new(),
            db_version: 0,
            last_sequence_id: -1,
            last_patch_at: Hlc::default(),
            last_gc_at_ms: 0,
            last_gap_scan_at_ms: 0,
        })
    }

    pub fn open(path: &str, peer_id: i64, config: Config) -> Result<Self> {
        Self::new(Connection::open(path)?, peer_id, config)
    }

    pub fn open_in_memory(peer_id: i64, config: Config) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, peer_id, config)
    }

    pub fn peer_id(&self) -> i64 {
        self.peer_id
    }

    /// The underlying connection, for reads. The base tables are the
    /// converged view; rows with a non-null `deletedAt` are tombstones.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Bring the database to the given migration list and recover this
    /// peer's write frontier. Must run before any write, on every start.
    pub fn migrate(&mut self, migrations: &[Migration]) -> Result<MigrateOutcome> {
        let outcome = migrate::run(&self.conn, migrations)?;
        self.db_version = outcome.curr;
        self.schemas.clear();
        let recovered = migrate::init_peer_sequence(&self.conn, self.peer_id)?;
        self.last_sequence_id = recovered.last_sequence_id;
        self.last_patch_at = recovered.last_patch_at;
        Ok(outcome)
    }

    /// Write a row: record a patch under a fresh timestamp and sequence,
    /// fold it into the base table, and queue the patch for the transport.
    ///
    /// `row` must contain every primary key column. A missing non-key
    /// column leaves the stored value unchanged; an explicit
    /// [`Value::Null`] does too, by the merge rule. Returns the session
    /// token `"peer.seq"`.
    pub fn upsert(&mut self, table: &str, row: HashMap<String, Value>) -> Result<String> {
        if self.last_sequence_id < 0 {
            return Err(Error::NotMigrated);
        }
        let table_schema = self.table_schema(table)?;
        validate_delta(&table_schema, &row)?;

        let at = self.hlc.create();
        let seq = self.last_sequence_id + 1;
        self.insert_patch_row(&table_schema, at, seq, self.peer_id, &row, false)?;
        self.last_sequence_id = seq;
        self.last_patch_at = at;
        merge::fold(&self.conn, &table_schema, at)?;

        self.outbox.push_back(Message::Patch(Patch {
            at,
            peer: self.peer_id,
            seq,
            schema_version: self.db_version,
            table: table.to_string(),
            delta: row,
        }));
        Ok(format!("{}.{}", self.peer_id, seq))
    }

    /// Apply a patch from a remote peer. Duplicate deliveries are
    /// swallowed; patches from this node are discarded.
    pub fn receive_patch(&mut self, patch: &Patch) -> Result<()> {
        if patch.peer == self.peer_id {
            return Ok(());
        }
        if self.last_sequence_id < 0 {
            return Err(Error::NotMigrated);
        }
        if patch.schema_version > self.db_version {
            return Err(Error::SchemaVersionAhead {
                remote: patch.schema_version,
                local: self.db_version,
            });
        }

        self.hlc.receive(patch.at);
        let table_schema = self.table_schema(&patch.table)?;
        validate_delta(&table_schema, &patch.delta)?;
        self.insert_patch_row(&table_schema, patch.at, patch.seq, patch.peer, &patch.delta, true)?;

        let gap = self.peers.record_patch(patch.peer, patch.seq, patch.at, now_millis());
        if gap > 1 && self.config.debug {
            debug!(peer = patch.peer, seq = patch.seq, gap, "sequence gap behind received patch");
        }
        merge::fold(&self.conn, &table_schema, patch.at)?;
        Ok(())
    }

    /// Absorb a peer's advertised frontier; the next gap scan requests
    /// anything we are missing from it.
    pub fn receive_ping(&mut self, ping: &Ping) {
        if ping.peer == self.peer_id {
            return;
        }
        self.hlc.receive(ping.last_at);
        self.peers
            .record_advertised(ping.peer, ping.last_seq, ping.last_at, now_millis());
    }

    /// Route a decoded message. Missing-patch requests addressed to this
    /// node queue the served patches on the outbox.
    pub fn handle_message(&mut self, message: &Message) -> Result<()> {
        match message {
            Message::Patch(patch) => self.receive_patch(patch),
            Message::Ping(ping) => {
                self.receive_ping(ping);
                Ok(())
            }
            Message::MissingPatchRequest(request) => {
                if request.peer != self.peer_id {
                    return Ok(());
                }
                for patch in self.patches_between(request.min_seq, request.max_seq)? {
                    self.outbox.push_back(Message::Patch(patch));
                }
                Ok(())
            }
        }
    }

    pub fn add_remote_peer(&mut self, peer: i64) {
        if peer != self.peer_id {
            self.peers.add(peer);
        }
    }

    pub fn status(&self) -> Status {
        Status {
            peer_id: self.peer_id,
            db_version: self.db_version,
            last_sequence_id: self.last_sequence_id,
            last_patch_at: self.last_patch_at,
            clock_drift: self.hlc.clock_drift(),
            peers: self.peers.snapshot(),
        }
    }

    /// Whether every write from `peer` up to `seq` is reflected locally.
    /// Session tokens from [`upsert`](Self::upsert) probe this for
    /// read-your-writes across nodes.
    pub fn is_consistent(&self, peer: i64, seq: i64) -> bool {
        if peer == self.peer_id {
            return self.last_sequence_id >= seq;
        }
        self.peers.is_consistent(peer, seq)
    }

    /// Periodic maintenance: retention GC (hourly), then a gap scan and a
    /// ping, both rate-limited by the configured heartbeat interval. Call
    /// on a timer; the work is bounded and synchronous.
    pub fn heartbeat(&mut self) -> Result<()> {
        let now = now_millis();
        if now - self.last_gc_at_ms >= GC_INTERVAL_MS {
            self.last_gc_at_ms = now;
            self.collect_garbage(now)?;
        }
        if now - self.last_gap_scan_at_ms >= self.config.heartbeat_interval_ms {
            self.last_gap_scan_at_ms = now;
            self.scan_for_gaps();
            self.outbox.push_back(Message::Ping(Ping {
                peer: self.peer_id,
                last_at: self.last_patch_at,
                last_seq: self.last_sequence_id,
            }));
        }
        Ok(())
    }

    /// Drain queued outbound messages for the transport to deliver.
    pub fn take_outbox(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    /// Reconstruct this node's own patches with sequence ids in
    /// `[min_seq, max_seq]`, capped at the retransmission limit. Serves
    /// inbound missing-patch requests.
    pub fn patches_between(&self, min_seq: i64, max_seq: i64) -> Result<Vec<Patch>> {
        let mut out = Vec::new();
        for patch_table in schema::patch_tables(&self.conn)? {
            let base = patch_table
                .strip_suffix(PATCH_TABLE_SUFFIX)
                .unwrap_or(&patch_table)
                .to_string();
            let sql = format!(
                "SELECT * FROM {} WHERE \"_peerId\" = ?1 AND \"_sequenceId\" BETWEEN ?2 AND ?3",
                quote_ident(&patch_table)
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let col_names: Vec<String> =
                stmt.column_names().iter().map(|n| n.to_string()).collect();
            let mut rows = stmt.query(params![self.peer_id, min_seq, max_seq])?;
            while let Some(row) = rows.next()? {
                let mut at = Hlc::default();
                let mut seq = 0;
                let mut delta = HashMap::new();
                for (i, name) in col_names.iter().enumerate() {
                    match name.as_str() {
                        COL_PATCHED_AT => at = row.get(i)?,
                        COL_SEQUENCE_ID => seq = row.get(i)?,
                        COL_PEER_ID => {}
                        _ => {
                            let value: Value = row.get(i)?;
                            if !value.is_null() {
                                delta.insert(name.clone(), value);
                            }
                        }
                    }
                }
                out.push(Patch {
                    at,
                    peer: self.peer_id,
                    seq,
                    schema_version: self.db_version,
                    table: base.clone(),
                    delta,
                });
            }
        }
        out.sort_by_key(|p| p.seq);
        out.truncate(self.config.max_patch_per_retransmission as usize);
        Ok(out)
    }

    fn table_schema(&mut self, table: &str) -> Result<TableSchema> {
        if let Some(cached) = self.schemas.get(table) {
            return Ok(cached.clone());
        }
        let introspected = schema::introspect(&self.conn, table)?;
        schema::ensure_patch_table(&self.conn, &introspected)?;
        self.schemas.insert(table.to_string(), introspected.clone());
        Ok(introspected)
    }

    fn insert_patch_row(
        &self,
        table: &TableSchema,
        at: Hlc,
        seq: i64,
        peer: i64,
        delta: &HashMap<String, Value>,
        ignore_duplicate: bool,
    ) -> Result<()> {
        let mut cols = vec![
            quote_ident(COL_PATCHED_AT),
            quote_ident(COL_SEQUENCE_ID),
            quote_ident(COL_PEER_ID),
        ];
        let mut vals = vec![
            Value::Integer(at.raw()),
            Value::Integer(seq),
            Value::Integer(peer),
        ];
        for col in &table.columns {
            if let Some(value) = delta.get(&col.name) {
                cols.push(quote_ident(&col.name));
                vals.push(value.clone());
            }
        }
        if !table.has_column(COL_DELETED_AT) {
            if let Some(value) = delta.get(COL_DELETED_AT) {
                cols.push(quote_ident(COL_DELETED_AT));
                vals.push(value.clone());
            }
        }

        let placeholders = (1..=cols.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        // Only a key collision counts as a duplicate delivery; other
        // constraint failures still surface.
        let conflict = if ignore_duplicate {
            " ON CONFLICT (\"_patchedAt\", \"_sequenceId\", \"_peerId\") DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}){}",
            quote_ident(&table.patch_table()),
            cols.join(", "),
            placeholders,
            conflict
        );
        self.conn.execute(&sql, params_from_iter(vals))?;
        Ok(())
    }

    fn collect_garbage(&mut self, now_ms: i64) -> Result<()> {
        let oldest = Hlc::encode(now_ms - self.config.max_patch_retention_ms, 0);
        for table in schema::patch_tables(&self.conn)? {
            let sql = format!(
                "DELETE FROM {} WHERE \"_patchedAt\" < ?1",
                quote_ident(&table)
            );
            let removed = self.conn.execute(&sql, params![oldest])?;
            if removed > 0 {
                debug!(table = table.as_str(), removed, "expired patches removed");
            }
        }
        Ok(())
    }

    fn scan_for_gaps(&mut self) {
        let cap = self.config.max_patch_per_retransmission;
        let mut requests = Vec::new();
        for (peer, stats) in self.peers.behind() {
            let min_seq = stats.guaranteed_contiguous_seq + 1;
            let max_seq = stats.last_seq_id.min(min_seq + cap - 1);
            if self.config.debug {
                debug!(peer, min_seq, max_seq, "requesting missing patches");
            }
            requests.push(Message::MissingPatchRequest(MissingPatchRequest {
                peer,
                min_seq,
                max_seq,
                for_peer: self.peer_id,
            }));
        }
        self.outbox.extend(requests);
    }
}

fn validate_delta(table: &TableSchema, delta: &HashMap<String, Value>) -> Result<()> {
    for name in delta.keys() {
        if !table.has_column(name) && name != COL_DELETED_AT {
            return Err(Error::UnknownColumn {
                table: table.table.clone(),
                column: name.clone(),
            });
        }
    }
    for key in table.primary_key() {
        match delta.get(key) {
            Some(value) if !value.is_null() => {}
            _ => {
                return Err(Error::MissingPrimaryKey {
                    table: table.table.clone(),
                    column: key.to_string(),
                })
            }
        }
    }
    Ok(())
}
