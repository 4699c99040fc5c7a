//! Per-group member table.
//!
//! The original Tasmota source keeps members on an intrusive singly-linked
//! list (`struct device_group_member *flink`). A map keyed by IPv4 captures
//! the same semantics — unique keys, O(1) find — without the pointer
//! surgery (see Design Notes).

use std::collections::HashMap;
use std::net::Ipv4Addr;

/// How long a member may go unseen before it's eligible for `gc`.
pub const MEMBER_TIMEOUT_MS: u32 = 45_000;

/// Unicast retry count past which a member is dropped even if not yet
/// timed out on liveness alone.
pub const MAX_UNICAST_RETRIES: u32 = 10;

/// A peer known to the local engine for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// The member's IPv4 address (the table's key, duplicated here for
    /// convenience when a `Member` is passed around by value).
    pub ip: Ipv4Addr,
    /// Last inbound sequence number seen from this peer.
    pub received_sequence: u16,
    /// Last sequence number from us that this peer has acked.
    pub acked_sequence: u16,
    /// Outgoing unicast retry counter for the currently pending message.
    pub unicast_count: u32,
    /// Timestamp (engine clock) this member was last heard from.
    pub last_seen_ms: u32,
    /// Sequence number of a `MORE_TO_COME` send currently being reassembled
    /// from this peer, if any. Cleared once the commit fragment (no
    /// `MORE_TO_COME` bit) for that sequence arrives.
    pub fragment_seq: Option<u16>,
}

impl Member {
    fn new(ip: Ipv4Addr, now: u32) -> Self {
        Self {
            ip,
            received_sequence: 0,
            acked_sequence: 0,
            unicast_count: 0,
            last_seen_ms: now,
            fragment_seq: None,
        }
    }
}

/// Circular (modulo 2^16) sequence comparison: is `a` "after" `b`?
///
/// Matches the spec's comparator: treat the difference as a signed 16-bit
/// integer and test its sign. Equality is "fully acknowledged", not "after".
pub fn seq_after(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Per-group member set, keyed by IPv4.
#[derive(Debug, Default)]
pub struct MemberTable {
    members: HashMap<Ipv4Addr, Member>,
}

impl MemberTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
        }
    }

    /// Look up a member, creating it (at `now`) if it isn't already known.
    pub fn find_or_create(&mut self, ip: Ipv4Addr, now: u32) -> &mut Member {
        self.members.entry(ip).or_insert_with(|| Member::new(ip, now))
    }

    /// Look up a member without creating it.
    pub fn get(&self, ip: Ipv4Addr) -> Option<&Member> {
        self.members.get(&ip)
    }

    /// Mark a member as seen at `now`.
    pub fn touch(&mut self, ip: Ipv4Addr, now: u32) {
        self.find_or_create(ip, now).last_seen_ms = now;
    }

    /// Record an ack from `ip` for `seq`.
    pub fn mark_ack(&mut self, ip: Ipv4Addr, seq: u16) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.acked_sequence = seq;
        }
    }

    /// Record an inbound sequence number from `ip`.
    pub fn record_received(&mut self, ip: Ipv4Addr, seq: u16) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.received_sequence = seq;
        }
    }

    /// Mark `ip` as mid-reassembly of a `MORE_TO_COME` send at `seq`: a
    /// continuation fragment, not a duplicate of the last committed message.
    pub fn begin_fragment(&mut self, ip: Ipv4Addr, seq: u16) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.fragment_seq = Some(seq);
        }
    }

    /// Is `ip` mid-reassembly of exactly `seq`?
    pub fn is_fragment_in_progress(&self, ip: Ipv4Addr, seq: u16) -> bool {
        self.members.get(&ip).and_then(|m| m.fragment_seq) == Some(seq)
    }

    /// Clear `ip`'s in-progress fragment marker (the commit fragment arrived).
    pub fn finish_fragment(&mut self, ip: Ipv4Addr) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.fragment_seq = None;
        }
    }

    /// Every member whose `acked_sequence` doesn't yet match `current_seq`
    /// — candidates for unicast retransmission.
    pub fn pending_unicast_targets(&self, current_seq: u16) -> Vec<Ipv4Addr> {
        self.members
            .values()
            .filter(|m| m.acked_sequence != current_seq)
            .map(|m| m.ip)
            .collect()
    }

    /// Increment a member's unicast retry counter.
    pub fn bump_unicast_count(&mut self, ip: Ipv4Addr) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.unicast_count += 1;
        }
    }

    /// Reset a member's unicast retry counter (called once it acks).
    pub fn reset_unicast_count(&mut self, ip: Ipv4Addr) {
        if let Some(m) = self.members.get_mut(&ip) {
            m.unicast_count = 0;
        }
    }

    /// Do all known members ack `seq`?
    pub fn all_acked(&self, seq: u16) -> bool {
        self.members.values().all(|m| m.acked_sequence == seq)
    }

    /// Drop members that have timed out on liveness or exhausted their
    /// retry budget. Returns the IPs removed.
    pub fn gc(&mut self, now: u32) -> Vec<Ipv4Addr> {
        let stale: Vec<Ipv4Addr> = self
            .members
            .values()
            .filter(|m| {
                now.wrapping_sub(m.last_seen_ms) > MEMBER_TIMEOUT_MS
                    || m.unicast_count > MAX_UNICAST_RETRIES
            })
            .map(|m| m.ip)
            .collect();
        for ip in &stale {
            self.members.remove(ip);
        }
        stale
    }

    /// Iterate over all known members.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Number of known members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the table has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_after_handles_wraparound() {
        assert!(seq_after(1, 65_535));
        assert!(seq_after(2, 1));
        assert!(!seq_after(1, 2));
        assert!(!seq_after(1, 1)); // equal is not "after"
    }

    #[test]
    fn gc_removes_timed_out_members() {
        let mut table = MemberTable::new();
        let ip: Ipv4Addr = "192.0.2.10".parse().unwrap();
        table.touch(ip, 0);
        assert!(table.gc(MEMBER_TIMEOUT_MS).is_empty());
        let removed = table.gc(MEMBER_TIMEOUT_MS + 1);
        assert_eq!(removed, vec![ip]);
        assert!(table.get(ip).is_none());
    }

    #[test]
    fn gc_removes_members_past_retry_budget() {
        let mut table = MemberTable::new();
        let ip: Ipv4Addr = "192.0.2.11".parse().unwrap();
        table.touch(ip, 0);
        for _ in 0..=MAX_UNICAST_RETRIES {
            table.bump_unicast_count(ip);
        }
        let removed = table.gc(0);
        assert_eq!(removed, vec![ip]);
    }

    #[test]
    fn fragment_in_progress_tracks_until_commit() {
        let mut table = MemberTable::new();
        let ip: Ipv4Addr = "192.0.2.12".parse().unwrap();
        table.touch(ip, 0);

        table.begin_fragment(ip, 7);
        assert!(table.is_fragment_in_progress(ip, 7));
        assert!(!table.is_fragment_in_progress(ip, 8));

        table.finish_fragment(ip);
        assert!(!table.is_fragment_in_progress(ip, 7));
    }

    #[test]
    fn pending_unicast_targets_excludes_acked_members() {
        let mut table = MemberTable::new();
        let a: Ipv4Addr = "192.0.2.10".parse().unwrap();
        let b: Ipv4Addr = "192.0.2.11".parse().unwrap();
        table.touch(a, 0);
        table.touch(b, 0);
        table.mark_ack(a, 5);

        let pending = table.pending_unicast_targets(5);
        assert_eq!(pending, vec![b]);
        assert!(table.all_acked(5) == false);
        table.mark_ack(b, 5);
        assert!(table.all_acked(5));
    }
}
