//! Per-peer replication bookkeeping.

use std::collections::HashMap;

use crate::hlc::Hlc;

/// Everything tracked about one remote peer. `guaranteed_contiguous_seq`
/// is the frontier up to which every patch from that peer has been seen;
/// `last_seq_id` is the highest sequence observed, so the two diverging
/// means patches are missing in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub last_patch_at: Hlc,
    pub last_seq_id: i64,
    pub guaranteed_contiguous_at: Hlc,
    pub guaranteed_contiguous_seq: i64,
    pub last_message_time_ms: i64,
}

#[derive(Debug, Default)]
pub(crate) struct PeerBook {
    peers: HashMap<i64, PeerStats>,
}

impl PeerBook {
    /// Create an empty stats entry if the peer is unknown.
    pub fn add(&mut self, peer: i64) {
        self.peers.entry(peer).or_default();
    }

    /// Account for one received patch. Returns the sequence gap relative
    /// to the contiguous frontier (1 means in-order).
    pub fn record_patch(&mut self, peer: i64, seq: i64, at: Hlc, now_ms: i64) -> i64 {
        let stats = self.peers.entry(peer).or_default();
        stats.last_message_time_ms = now_ms;

        let gap = seq - stats.guaranteed_contiguous_seq;
        if gap == 1 {
            stats.guaranteed_contiguous_seq = seq;
            stats.guaranteed_contiguous_at = at;
        }
        // The frontier only moves when the next-in-line sequence arrives;
        // sequences that showed up early are re-requested rather than
        // replayed from here.
        if seq > stats.last_seq_id {
            stats.last_seq_id = seq;
            stats.last_patch_at = at;
        }
        gap
    }

    /// Absorb a peer's advertised write frontier from a ping.
    pub fn record_advertised(&mut self, peer: i64, last_seq: i64, last_at: Hlc, now_ms: i64) {
        let stats = self.peers.entry(peer).or_default();
        stats.last_message_time_ms = now_ms;
        if last_seq > stats.last_seq_id {
            stats.last_seq_id = last_seq;
            stats.last_patch_at = last_at;
        }
    }

    /// Whether every patch from `peer` up to `seq` has been seen. Unknown
    /// peers are assumed consistent.
    pub fn is_consistent(&self, peer: i64, seq: i64) -> bool {
        self.peers
            .get(&peer)
            .map_or(true, |s| s.guaranteed_contiguous_seq >= seq)
    }

    /// Peers whose contiguous frontier trails their highest observed
    /// sequence, i.e. peers we are missing patches from.
    pub fn behind(&self) -> impl Iterator<Item = (i64, &PeerStats)> {
        self.peers
            .iter()
            .filter(|(_, s)| s.guaranteed_contiguous_seq < s.last_seq_id)
            .map(|(&id, s)| (id, s))
    }

    pub fn snapshot(&self) -> HashMap<i64, PeerStats> {
        self.peers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(n: i64) -> Hlc {
        Hlc::from_raw(n)
    }

    #[test]
    fn test_in_order_patches_advance_frontier() {
        let mut book = PeerBook::default();
        assert_eq!(book.record_patch(2, 1, at(10), 1000), 1);
        assert_eq!(book.record_patch(2, 2, at(20), 1001), 1);

        let stats = book.snapshot()[&2];
        assert_eq!(stats.guaranteed_contiguous_seq, 2);
        assert_eq!(stats.guaranteed_contiguous_at, at(20));
        assert_eq!(stats.last_seq_id, 2);
        assert_eq!(stats.last_message_time_ms, 1001);
    }

    #[test]
    fn test_gap_holds_frontier_but_tracks_high_water() {
        let mut book = PeerBook::default();
        book.record_patch(2, 1, at(10), 1000);
        let gap = book.record_patch(2, 4, at(40), 1001);
        assert_eq!(gap, 3);

        let stats = book.snapshot()[&2];
        assert_eq!(stats.guaranteed_contiguous_seq, 1);
        assert_eq!(stats.last_seq_id, 4);
        assert_eq!(stats.last_patch_at, at(40));
    }

    #[test]
    fn test_frontier_does_not_rescan_buffered_sequences() {
        let mut book = PeerBook::default();
        book.record_patch(2, 1, at(10), 1000);
        book.record_patch(2, 3, at(30), 1001);
        // Filling the hole advances past it, but not through seq 3.
        book.record_patch(2, 2, at(20), 1002);

        let stats = book.snapshot()[&2];
        assert_eq!(stats.guaranteed_contiguous_seq, 2);
        assert_eq!(stats.last_seq_id, 3);
    }

    #[test]
    fn test_duplicate_or_stale_patch_is_harmless() {
        let mut book = PeerBook::default();
        book.record_patch(2, 1, at(10), 1000);
        book.record_patch(2, 2, at(20), 1001);
        let gap = book.record_patch(2, 1, at(10), 1002);
        assert!(gap < 1);

        let stats = book.snapshot()[&2];
        assert_eq!(stats.guaranteed_contiguous_seq, 2);
        assert_eq!(stats.last_seq_id, 2);
    }

    #[test]
    fn test_advertised_frontier_opens_a_gap() {
        let mut book = PeerBook::default();
        book.record_patch(2, 1, at(10), 1000);
        book.record_advertised(2, 6, at(60), 1001);

        let behind: Vec<i64> = book.behind().map(|(id, _)| id).collect();
        assert_eq!(behind, [2]);
        let stats = book.snapshot()[&2];
        assert_eq!(stats.last_seq_id, 6);
        assert_eq!(stats.guaranteed_contiguous_seq, 1);
    }

    #[test]
    fn test_is_consistent() {
        let mut book = PeerBook::default();
        assert!(book.is_consistent(99, 1_000_000));

        book.record_patch(2, 1, at(10), 1000);
        book.record_patch(2, 2, at(20), 1001);
        assert!(book.is_consistent(2, 2));
        assert!(!book.is_consistent(2, 3));
    }

    #[test]
    fn test_add_creates_empty_entry_once() {
        let mut book = PeerBook::default();
        book.add(5);
        book.record_patch(5, 1, at(10), 1000);
        book.add(5);

        let stats = book.snapshot()[&5];
        assert_eq!(stats.guaranteed_contiguous_seq, 1);
    }
}
