//! Logical message shapes exchanged between peers.
//!
//! The engine defines what travels, not how it is framed; the transport
//! picks an encoding and moves the bytes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::value::Value;

/// One logical write to one row, the unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub at: Hlc,
    pub peer: i64,
    pub seq: i64,
    pub schema_version: i64,
    pub table: String,
    pub delta: HashMap<String, Value>,
}

/// Periodic liveness beacon advertising the sender's write frontier, so
/// receivers can notice they are missing patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub peer: i64,
    pub last_at: Hlc,
    pub last_seq: i64,
}

/// Ask `peer` to resend its own patches with sequence ids in
/// `[min_seq, max_seq]`, on behalf of `for_peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPatchRequest {
    pub peer: i64,
    pub min_seq: i64,
    pub max_seq: i64,
    pub for_peer: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Patch(Patch),
    Ping(Ping),
    MissingPatchRequest(MissingPatchRequest),
}

impl Message {
    /// Numeric discriminant for transports that tag frames by hand.
    pub fn kind(&self) -> u8 {
        match self {
            Message::Patch(_) => 10,
            Message::Ping(_) => 20,
            Message::MissingPatchRequest(_) => 30,
        }
    }
}
