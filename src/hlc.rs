//! Hybrid logical clock for causal ordering.
//!
//! A clock value packs a 40-bit millisecond offset from [`EPOCH_MS`] and a
//! 13-bit counter into the low 53 bits of an `i64`, so the numeric value
//! survives systems that only carry IEEE-754 doubles. The state machine
//! never emits a value at or below anything it has seen, which keeps local
//! timestamps totally ordered even when the wall clock moves backwards.

use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 2025-01-01T00:00:00Z, the zero point of the millisecond offset.
pub const EPOCH_MS: i64 = 1_735_689_600_000;

const COUNTER_BITS: i64 = 13;
const COUNTER_MASK: i64 = 0x1FFF;

/// Highest counter value that fits in the 13 counter bits.
pub const MAX_COUNTER: i64 = COUNTER_MASK;

/// A packed hybrid-logical-clock timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Hlc(i64);

impl Hlc {
    /// Pack a wall-clock millisecond reading and a counter.
    ///
    /// Readings before [`EPOCH_MS`] clamp to the epoch; the counter is
    /// masked to its 13 bits.
    pub const fn encode(unix_ms: i64, counter: i64) -> Self {
        let offset = unix_ms - EPOCH_MS;
        let offset = if offset < 0 { 0 } else { offset };
        Self((offset << COUNTER_BITS) | (counter & COUNTER_MASK))
    }

    /// The wall-clock millisecond part.
    pub const fn unix_ms(self) -> i64 {
        (self.0 >> COUNTER_BITS) + EPOCH_MS
    }

    /// The counter part.
    pub const fn counter(self) -> i64 {
        self.0 & COUNTER_MASK
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl ToSql for Hlc {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Hlc {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Hlc)
    }
}

/// Current wall time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Derive a peer id from the wall clock plus random low bits.
///
/// Callers that need a stable identity across restarts persist the result
/// (or configure their own); a fresh draw per process is only collision-safe
/// for peers that do not boot within the same millisecond.
pub fn generate_peer_id() -> i64 {
    let offset = (now_millis() - EPOCH_MS).max(0);
    (offset << COUNTER_BITS) | i64::from(rand::random::<u32>() % 8092)
}

/// Mutable clock state for one node.
#[derive(Debug, Default)]
pub struct HlcState {
    highest_seen: Hlc,
    counter: i64,
    clock_drift: i64,
    saturation_warned: bool,
}

impl HlcState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a timestamp observed from a remote peer into the clock.
    ///
    /// Guarantees the next [`create`](Self::create) returns a value greater
    /// than `remote`. Older timestamps are a no-op.
    pub fn receive(&mut self, remote: Hlc) {
        if remote > self.highest_seen {
            if remote.unix_ms() > self.highest_seen.unix_ms() {
                self.counter = 0;
                self.saturation_warned = false;
            }
            self.highest_seen = remote;
        }
    }

    /// Produce the next local timestamp.
    ///
    /// While the wall clock is ahead of everything seen, timestamps are
    /// plain wall-clock readings. Once a remote (or an earlier local value
    /// in the same millisecond) is ahead, the counter takes over; counter
    /// exhaustion is logged and the value carries into the millisecond
    /// bits rather than stalling the writer.
    pub fn create(&mut self) -> Hlc {
        let now = Hlc::encode(now_millis(), 0);
        if now > self.highest_seen {
            self.highest_seen = now;
            self.counter = 0;
            self.saturation_warned = false;
            return now;
        }
        self.counter += 1;
        if self.counter > MAX_COUNTER && !self.saturation_warned {
            self.saturation_warned = true;
            warn!(
                counter = self.counter,
                behind_ms = (self.highest_seen.raw() - now.raw()) >> COUNTER_BITS,
                "hlc counter exhausted; local clock lags the newest observed timestamp"
            );
        }
        self.clock_drift = self.highest_seen.raw() - now.raw();
        Hlc::from_raw(self.highest_seen.raw() + self.counter)
    }

    /// Distance between the newest observed timestamp and the local wall
    /// clock, in raw clock units. Nonzero values point at NTP trouble.
    pub fn clock_drift(&self) -> i64 {
        self.clock_drift
    }
}
