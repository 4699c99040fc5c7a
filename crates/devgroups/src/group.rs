//! Group state and item store.

use std::collections::BTreeMap;

use crate::config::{GroupConfig, DGR_ACK_WAIT_TIME_MS, DGR_ANNOUNCEMENT_INTERVAL_MS};
use crate::member::MemberTable;
use crate::wire::{blocked_by_mask, Item, Value};

/// Lifecycle state of a group (`DevGroupState` in the original source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// Not yet started.
    Uninitialized,
    /// Started; probing for an initial FULL_STATUS reply.
    Initializing,
    /// Converged with at least one peer (or ran out of probes).
    Initialized,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupState::Uninitialized => "uninitialized",
            GroupState::Initializing => "initializing",
            GroupState::Initialized => "initialized",
        };
        f.write_str(s)
    }
}

/// One configured Device Group: its item store, member table, and
/// sequencing/timer state.
pub struct Group {
    /// Static configuration (name, share masks).
    pub config: GroupConfig,
    /// Current lifecycle state.
    pub state: GroupState,
    /// Next sequence number to assign; monotone modulo 2^16, never 0.
    pub outgoing_sequence: u16,
    /// Sequence number of the last FULL_STATUS sent.
    pub last_full_status_sequence: u16,
    /// Known peers.
    pub members: MemberTable,
    /// Current item values, keyed by tag. A `BTreeMap` so FULL_STATUS
    /// iterates tags in ascending order for free.
    pub item_store: BTreeMap<u8, Value>,
    /// Per-item bitmask suppressing items from outgoing FULL_STATUS only.
    pub no_status_share: u32,
    /// Deadline (engine clock) for the next announcement heartbeat.
    pub next_announcement_time: u32,
    /// Deadline for the next ack-check / retransmit pass.
    pub next_ack_check_time: u32,
    /// Current ack-check backoff interval, doubled on each unacked pass.
    pub ack_check_interval: u32,
    /// Remaining FULL_STATUS|STATUS_REQUEST probes to send on startup.
    pub initial_status_requests_remaining: u8,
    /// Remaining scheduled repeat-multicasts for the in-flight send.
    pub multicasts_remaining: u8,
    /// The last built message's wire fragments, in send order — one element
    /// unless the content needed `MORE_TO_COME` splitting — held until every
    /// member acks the shared sequence number.
    pub pending_fragments: Option<Vec<Vec<u8>>>,
    /// Reentrancy guard: true while applying a received item, to suppress
    /// the outbound echo a local controller's reaction might otherwise
    /// produce. This is deliberate (see Design Notes), not a workaround.
    pub building_status: bool,
}

impl Group {
    /// A freshly constructed, uninitialized group.
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            state: GroupState::Uninitialized,
            outgoing_sequence: 1,
            last_full_status_sequence: 0,
            members: MemberTable::new(),
            item_store: BTreeMap::new(),
            no_status_share: 0,
            next_announcement_time: 0,
            next_ack_check_time: 0,
            ack_check_interval: DGR_ACK_WAIT_TIME_MS,
            initial_status_requests_remaining: 0,
            multicasts_remaining: 0,
            pending_fragments: None,
            building_status: false,
        }
    }

    /// Allocate the next outgoing sequence number, skipping 0 on wrap.
    pub fn next_sequence(&mut self) -> u16 {
        self.outgoing_sequence = (self.outgoing_sequence % 0xFFFF) + 1;
        self.outgoing_sequence
    }

    /// Store `value` under `tag`, applying no share-mask gating (callers
    /// decide whether a tag is eligible to apply before calling this).
    pub fn set_item(&mut self, tag: u8, value: Value) {
        self.item_store.insert(tag, value);
    }

    /// Read the current value of `tag`, if known.
    pub fn get_item(&self, tag: u8) -> Option<&Value> {
        self.item_store.get(&tag)
    }

    /// Every item eligible for outgoing FULL_STATUS: in `send_mask`'s
    /// categories and not suppressed by `no_status_share`, in ascending
    /// tag order.
    pub fn full_status_items(&self) -> Vec<Item> {
        self.item_store
            .iter()
            .filter(|(tag, _)| {
                !blocked_by_mask(**tag, self.config.send_mask)
                    && !blocked_by_mask(**tag, !self.no_status_share)
            })
            .map(|(tag, value)| Item::new(*tag, value.clone()))
            .collect()
    }

    /// Is `tag` accepted on ingress per this group's receive mask?
    pub fn accepts_item(&self, tag: u8) -> bool {
        !blocked_by_mask(tag, self.config.receive_mask)
    }

    /// Reset the ack-check backoff to its initial value (called once every
    /// member has acked the pending message).
    pub fn reset_ack_backoff(&mut self) {
        self.ack_check_interval = DGR_ACK_WAIT_TIME_MS;
        self.pending_fragments = None;
    }

    /// Double the ack-check backoff (exponential, per spec §4.E.3).
    pub fn backoff_ack_check(&mut self, now: u32) {
        self.ack_check_interval = self.ack_check_interval.saturating_mul(2);
        self.next_ack_check_time = now + self.ack_check_interval;
    }

    /// Schedule the next announcement heartbeat.
    pub fn schedule_announcement(&mut self, now: u32) {
        self.next_announcement_time = now + DGR_ANNOUNCEMENT_INTERVAL_MS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DgrItem;

    #[test]
    fn sequence_wraps_without_hitting_zero() {
        let mut g = Group::new(GroupConfig::new("lab"));
        g.outgoing_sequence = 0xFFFF;
        assert_eq!(g.next_sequence(), 1);
        assert_ne!(g.outgoing_sequence, 0);
    }

    #[test]
    fn full_status_respects_send_mask_and_no_status_share() {
        let mut g = Group::new(
            GroupConfig::new("lab").with_send_mask(crate::wire::ShareItem::POWER),
        );
        g.set_item(DgrItem::POWER, Value::U32(1));
        g.set_item(DgrItem::LIGHT_BRI, Value::U8(200)); // not in send_mask
        let items = g.full_status_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, DgrItem::POWER);

        // Now allow both categories but suppress POWER from status only.
        g.config.send_mask = 0xFFFF_FFFF;
        g.no_status_share = crate::wire::ShareItem::POWER;
        let items = g.full_status_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, DgrItem::LIGHT_BRI);
    }
}
