//! Protocol engine: sequencing, acks, retransmits, announcements, initial
//! status, and message dispatch. This is the ~35%-of-the-core component;
//! everything else in the crate exists to let this module stay readable.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::command::{DevGroupSend, DevGroupStatus};
use crate::config::{Config, DGR_ACK_WAIT_TIME_MS, DGR_MULTICAST_REPEAT_COUNT, INITIAL_STATUS_REQUESTS};
use crate::device::{DeviceAdapter, NullDevice, Source};
use crate::error::{Error, Result};
use crate::group::{Group, GroupState};
use crate::transport::{Datagram, Transport};
use crate::wire::{flags, DgrItem, Item, Message, MessageType, Value};

/// Where a built message should be sent.
#[derive(Debug, Clone, Copy)]
enum Destination {
    /// The configured multicast group.
    Multicast,
    /// A single peer, by unicast.
    Unicast(Ipv4Addr),
}

struct GroupRuntime {
    group: Group,
    device: Box<dyn DeviceAdapter>,
    /// Deadline for the next FULL_STATUS|STATUS_REQUEST probe while
    /// initializing. Not part of the spec's `Group` attribute list, but
    /// needed so probes are paced rather than fired every tick.
    next_initial_status_time: u32,
}

/// The protocol engine: owns every configured group's state and the shared
/// transport they multiplex over.
pub struct Engine<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    multicast_address: Ipv4Addr,
    port: u16,
    groups: HashMap<String, GroupRuntime>,
    group_order: Vec<String>,
}

impl<T: Transport, C: Clock> Engine<T, C> {
    /// Build an engine from configuration, a transport, and a clock. Every
    /// configured group starts with a [`NullDevice`] adapter; call
    /// [`Engine::set_device`] to attach real ones.
    pub fn new(config: Config, transport: T, clock: C) -> Self {
        let mut groups = HashMap::new();
        let mut group_order = Vec::new();
        for group_config in config.groups {
            let name = group_config.name.clone();
            groups.insert(
                name.clone(),
                GroupRuntime {
                    group: Group::new(group_config),
                    device: Box::new(NullDevice),
                    next_initial_status_time: 0,
                },
            );
            group_order.push(name);
        }
        Self {
            transport,
            clock,
            multicast_address: config.multicast_address,
            port: config.port,
            groups,
            group_order,
        }
    }

    /// Attach a device adapter to a configured group.
    pub fn set_device(&mut self, group_name: &str, device: Box<dyn DeviceAdapter>) {
        if let Some(rt) = self.groups.get_mut(group_name) {
            rt.device = device;
        }
    }

    /// The transport this engine is driving.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// `DeviceGroupsStart`: begin initial-status probing for every group.
    pub fn start(&mut self) {
        let now = self.clock.now_ms();
        for rt in self.groups.values_mut() {
            rt.group.state = GroupState::Initializing;
            rt.group.initial_status_requests_remaining = INITIAL_STATUS_REQUESTS;
            rt.group.schedule_announcement(now);
            rt.next_initial_status_time = now;
        }
    }

    /// Run forever, driving both inbound datagrams and timer ticks. Intended
    /// for production use with [`crate::clock::SystemClock`]; tests drive
    /// [`Engine::handle_datagram`] and [`Engine::tick`] directly against a
    /// [`crate::clock::FakeClock`] instead, so timer behavior is
    /// deterministic without waiting on `tokio::time`.
    ///
    /// Not re-entrant: do not call `tick`/`handle_datagram` from inside a
    /// `DeviceAdapter::on_apply` triggered by this loop.
    pub async fn run(&mut self) -> Result<()> {
        const TICK_PERIOD: std::time::Duration = std::time::Duration::from_millis(20);
        loop {
            tokio::select! {
                result = self.transport.recv() => {
                    match result {
                        Ok(dg) => {
                            let now = self.clock.now_ms();
                            if let Err(e) = self.handle_datagram(dg, now).await {
                                warn!(error = %e, "failed handling inbound datagram");
                            }
                        }
                        Err(e) => warn!(error = %e, "transport recv failed"),
                    }
                }
                _ = tokio::time::sleep(TICK_PERIOD) => {
                    let now = self.clock.now_ms();
                    self.tick(now).await;
                }
            }
        }
    }

    /// Run every group's per-tick timer work: ack-check/retransmit,
    /// multicast repeats, member gc, announcements, and initial-status
    /// probing.
    pub async fn tick(&mut self, now: u32) {
        let names = self.group_order.clone();
        for name in names {
            self.tick_group(&name, now).await;
        }
    }

    async fn tick_group(&mut self, name: &str, now: u32) {
        self.tick_multicast_repeat(name, now).await;
        self.tick_ack_check(name, now).await;
        self.tick_gc(name, now);
        self.tick_announcement(name, now).await;
        self.tick_initial_status(name, now).await;
    }

    async fn tick_multicast_repeat(&mut self, name: &str, _now: u32) {
        let (pending, remaining) = {
            let rt = match self.groups.get_mut(name) {
                Some(rt) => rt,
                None => return,
            };
            if rt.group.multicasts_remaining == 0 {
                return;
            }
            rt.group.multicasts_remaining -= 1;
            (rt.group.pending_fragments.clone(), rt.group.multicasts_remaining)
        };
        if let Some(fragments) = pending {
            for bytes in &fragments {
                if let Err(e) = self.transport.send(self.multicast_address, self.port, bytes).await {
                    warn!(error = %e, group = name, "repeat multicast send failed");
                }
            }
            trace!(group = name, remaining, fragments = fragments.len(), "multicast repeat sent");
        }
    }

    async fn tick_ack_check(&mut self, name: &str, now: u32) {
        let (should_check, seq, pending) = {
            let rt = match self.groups.get(name) {
                Some(rt) => rt,
                None => return,
            };
            let should_check =
                rt.group.pending_fragments.is_some() && now >= rt.group.next_ack_check_time;
            (should_check, rt.group.outgoing_sequence, rt.group.pending_fragments.clone())
        };
        if !should_check {
            return;
        }
        let Some(fragments) = pending else { return };

        let targets = self
            .groups
            .get(name)
            .map(|rt| rt.group.members.pending_unicast_targets(seq))
            .unwrap_or_default();

        if targets.is_empty() {
            if let Some(rt) = self.groups.get_mut(name) {
                rt.group.reset_ack_backoff();
            }
            return;
        }

        for ip in targets {
            for bytes in &fragments {
                if let Err(e) = self.transport.send(ip, self.port, bytes).await {
                    warn!(error = %e, group = name, member = %ip, "unicast retransmit failed");
                }
            }
            if let Some(rt) = self.groups.get_mut(name) {
                rt.group.members.bump_unicast_count(ip);
            }
            debug!(group = name, member = %ip, seq, fragments = fragments.len(), "retransmitted unacked message");
        }
        if let Some(rt) = self.groups.get_mut(name) {
            rt.group.backoff_ack_check(now);
        }
    }

    fn tick_gc(&mut self, name: &str, now: u32) {
        if let Some(rt) = self.groups.get_mut(name) {
            for ip in rt.group.members.gc(now) {
                debug!(group = name, member = %ip, "member removed (timeout or retry budget exceeded)");
            }
        }
    }

    async fn tick_announcement(&mut self, name: &str, now: u32) {
        let should_send = self
            .groups
            .get(name)
            .map(|rt| now >= rt.group.next_announcement_time)
            .unwrap_or(false);
        if !should_send {
            return;
        }
        let (group_name, seq) = match self.groups.get_mut(name) {
            Some(rt) => {
                rt.group.schedule_announcement(now);
                (rt.group.config.name.clone(), rt.group.outgoing_sequence)
            }
            None => return,
        };
        let msg = Message::announcement(&group_name, seq);
        if let Ok(bytes) = msg.encode() {
            if let Err(e) = self.transport.send(self.multicast_address, self.port, &bytes).await {
                warn!(error = %e, group = name, "announcement send failed");
            } else {
                trace!(group = name, "announcement sent");
            }
        }
    }

    async fn tick_initial_status(&mut self, name: &str, now: u32) {
        let due = {
            let rt = match self.groups.get(name) {
                Some(rt) => rt,
                None => return,
            };
            rt.group.state == GroupState::Initializing
                && rt.group.initial_status_requests_remaining > 0
                && now >= rt.next_initial_status_time
        };
        if !due {
            return;
        }

        if let Err(e) = self
            .send_full_status(name, Destination::Multicast, true, now)
            .await
        {
            warn!(error = %e, group = name, "initial status probe failed");
        }

        if let Some(rt) = self.groups.get_mut(name) {
            rt.group.initial_status_requests_remaining -= 1;
            rt.next_initial_status_time = now + DGR_ACK_WAIT_TIME_MS;
            if rt.group.initial_status_requests_remaining == 0 && rt.group.state == GroupState::Initializing
            {
                // No peer replied to any probe; stop waiting and consider
                // ourselves converged (alone, or peers are simply gone).
                rt.group.state = GroupState::Initialized;
            }
        }
    }

    /// `publish`/`PARTIAL_UPDATE` or `UPDATE`: originate an update from a
    /// local change. The caller's device state is assumed already mutated;
    /// this only propagates it. A no-op while `building_status` is true
    /// (loop suppression, spec §4.E.7).
    pub async fn publish(&mut self, group_name: &str, tag: u8, value: Value, now: u32) -> Result<()> {
        self.publish_many(group_name, vec![Item::new(tag, value)], now).await
    }

    /// Publish several items at once (`UPDATE`, or `PARTIAL_UPDATE` if only
    /// one item is given).
    pub async fn publish_many(&mut self, group_name: &str, items: Vec<Item>, now: u32) -> Result<()> {
        self.publish_inner(group_name, items, false, now).await
    }

    /// Publish items with `WITH_LOCAL` semantics: the engine itself invokes
    /// `DeviceAdapter::on_apply` (source = Local) before sending, rather
    /// than assuming the caller already mutated device state.
    pub async fn publish_with_local(
        &mut self,
        group_name: &str,
        items: Vec<Item>,
        now: u32,
    ) -> Result<()> {
        self.publish_inner(group_name, items, true, now).await
    }

    async fn publish_inner(
        &mut self,
        group_name: &str,
        items: Vec<Item>,
        with_local: bool,
        now: u32,
    ) -> Result<()> {
        let rt = self
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;

        if rt.group.building_status {
            // An item apply transitively triggered a publish; suppress it.
            return Ok(());
        }

        for item in &items {
            rt.group.set_item(item.tag, item.value.clone());
        }

        let msg_type = message_type_for_items(&items);

        if with_local {
            rt.group.building_status = true;
            for item in &items {
                rt.device.on_apply(item.tag, &item.value, msg_type, Source::Local);
            }
            rt.group.building_status = false;
        }

        self.send_message(group_name, msg_type, items, Destination::Multicast, now)
            .await
    }

    /// `DevGroupStatus`: force a FULL_STATUS build. Multicasts if no
    /// specific requester is given.
    pub async fn request_full_status(&mut self, group_name: &str, now: u32) -> Result<()> {
        self.send_full_status(group_name, Destination::Multicast, false, now)
            .await
    }

    async fn send_full_status(
        &mut self,
        group_name: &str,
        destination: Destination,
        force_status_request: bool,
        now: u32,
    ) -> Result<()> {
        // Pull the device adapter's current view into the item store before
        // snapshotting, so FULL_STATUS reflects device state even for items
        // that changed without going through `publish` (spec §4.F: collect()
        // "invoked when building FULL_STATUS").
        if let Some(rt) = self.groups.get_mut(group_name) {
            for (tag, value) in rt.device.collect() {
                rt.group.set_item(tag, value);
            }
        }

        let items = self
            .groups
            .get(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?
            .group
            .full_status_items();
        self.send_message_with_status_request(
            group_name,
            MessageType::FullStatus,
            items,
            destination,
            force_status_request,
            now,
        )
        .await
    }

    async fn send_message(
        &mut self,
        group_name: &str,
        msg_type: MessageType,
        items: Vec<Item>,
        destination: Destination,
        now: u32,
    ) -> Result<()> {
        self.send_message_with_status_request(group_name, msg_type, items, destination, false, now)
            .await
    }

    async fn send_message_with_status_request(
        &mut self,
        group_name: &str,
        msg_type: MessageType,
        items: Vec<Item>,
        destination: Destination,
        force_status_request: bool,
        now: u32,
    ) -> Result<()> {
        let items: Vec<Item> = items
            .into_iter()
            .filter(|item| match item.value.payload_len() {
                Some(len) if len > 255 => {
                    warn!(group = group_name, tag = item.tag, len, "dropping oversized item from outgoing message");
                    false
                }
                _ => true,
            })
            .collect();

        let (seq, fragments) = {
            let rt = self
                .groups
                .get_mut(group_name)
                .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;

            let seq = rt.group.next_sequence();
            let is_first_full_status = rt.group.last_full_status_sequence == 0;
            let mut wire_flags = flags_for(msg_type);
            if msg_type == MessageType::FullStatus && (force_status_request || is_first_full_status) {
                wire_flags |= flags::STATUS_REQUEST;
            }

            let message = Message {
                flags: wire_flags,
                seq,
                group_name: rt.group.config.name.clone(),
                items,
            };
            // Packets MUST NOT exceed 512 bytes (spec §6); content that
            // doesn't fit comes back as several MORE_TO_COME fragments
            // sharing `seq`, collapsing to one fragment otherwise.
            let fragments = message.encode_fragments()?;

            if msg_type == MessageType::FullStatus {
                rt.group.last_full_status_sequence = seq;
            }
            (seq, fragments)
        };

        if fragments.len() > 1 {
            debug!(group = group_name, seq, fragments = fragments.len(), "message split into MORE_TO_COME fragments");
        }

        match destination {
            Destination::Multicast => {
                for bytes in &fragments {
                    self.transport
                        .send(self.multicast_address, self.port, bytes)
                        .await?;
                }
                if let Some(rt) = self.groups.get_mut(group_name) {
                    rt.group.multicasts_remaining = DGR_MULTICAST_REPEAT_COUNT;
                    rt.group.pending_fragments = Some(fragments);
                    rt.group.next_ack_check_time = now + DGR_ACK_WAIT_TIME_MS;
                    rt.group.ack_check_interval = DGR_ACK_WAIT_TIME_MS;
                }
            }
            Destination::Unicast(ip) => {
                for bytes in &fragments {
                    self.transport.send(ip, self.port, bytes).await?;
                }
                if let Some(rt) = self.groups.get_mut(group_name) {
                    rt.group.pending_fragments = Some(fragments);
                    rt.group.next_ack_check_time = now + DGR_ACK_WAIT_TIME_MS;
                    rt.group.ack_check_interval = DGR_ACK_WAIT_TIME_MS;
                }
            }
        }

        debug!(group = group_name, seq, ?msg_type, "message sent");
        Ok(())
    }

    /// Process one inbound datagram (spec §4.E.4).
    pub async fn handle_datagram(&mut self, dg: Datagram, now: u32) -> Result<()> {
        let message = match Message::decode(&dg.bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, from = %dg.ip, "dropping undecodable packet");
                return Err(Error::BadFrame(e));
            }
        };

        let group_name = message.group_name.clone();
        if !self.groups.contains_key(&group_name) {
            trace!(group = %group_name, from = %dg.ip, "dropping packet for unknown group");
            return Err(Error::UnknownGroup(group_name));
        }

        if message.has_flag(flags::ANNOUNCEMENT) {
            if let Some(rt) = self.groups.get_mut(&group_name) {
                rt.group.members.touch(dg.ip, now);
            }
            return Ok(());
        }

        if let Some(rt) = self.groups.get_mut(&group_name) {
            rt.group.members.touch(dg.ip, now);
        }

        let seq = message.seq;

        if message.has_flag(flags::ACK) {
            if let Some(rt) = self.groups.get_mut(&group_name) {
                rt.group.members.mark_ack(dg.ip, seq);
                rt.group.members.reset_unicast_count(dg.ip);
                if rt.group.pending_fragments.is_some()
                    && seq == rt.group.outgoing_sequence
                    && rt.group.members.all_acked(seq)
                {
                    rt.group.reset_ack_backoff();
                }
            }
            return Ok(());
        }

        let received_sequence = self
            .groups
            .get(&group_name)
            .and_then(|rt| rt.group.members.get(dg.ip))
            .map(|m| m.received_sequence)
            .unwrap_or(0);
        // A MORE_TO_COME continuation carries the same `seq` as the fragment
        // that opened it, so it would otherwise look like a retransmitted
        // duplicate of an already-committed message (spec §6). Treat it as
        // new whenever it continues a reassembly we already started.
        let fragment_in_progress = self
            .groups
            .get(&group_name)
            .map(|rt| rt.group.members.is_fragment_in_progress(dg.ip, seq))
            .unwrap_or(false);
        let is_new = crate::member::seq_after(seq, received_sequence)
            || fragment_in_progress
            || message.has_flag(flags::FULL_STATUS);

        // Ack immediately, whether or not the body is new (spec step 6).
        let ack = Message::ack(&group_name, seq);
        if let Ok(bytes) = ack.encode() {
            if let Err(e) = self.transport.send(dg.ip, self.port, &bytes).await {
                warn!(error = %e, to = %dg.ip, "ack send failed");
            }
        }

        if message.has_flag(flags::STATUS_REQUEST) {
            if let Err(e) = self
                .send_full_status(&group_name, Destination::Unicast(dg.ip), false, now)
                .await
            {
                warn!(error = %e, group = %group_name, to = %dg.ip, "full status reply failed");
            }
        }

        if is_new {
            let msg_type = message_type_for_flags(message.flags, &message.items);
            for item in &message.items {
                let accepted = self
                    .groups
                    .get(&group_name)
                    .map(|rt| rt.group.accepts_item(item.tag))
                    .unwrap_or(false);
                if !accepted {
                    continue;
                }
                if let Some(rt) = self.groups.get_mut(&group_name) {
                    rt.group.building_status = true;
                    rt.group.set_item(item.tag, item.value.clone());
                }
                if let Some(rt) = self.groups.get_mut(&group_name) {
                    rt.device.on_apply(item.tag, &item.value, msg_type, Source::Remote);
                    rt.group.building_status = false;
                }
            }

            if message.has_flag(flags::FULL_STATUS) {
                if let Some(rt) = self.groups.get_mut(&group_name) {
                    if rt.group.state != GroupState::Initialized {
                        rt.group.state = GroupState::Initialized;
                    }
                }
            }
        }

        if let Some(rt) = self.groups.get_mut(&group_name) {
            if message.has_flag(flags::MORE_TO_COME) {
                rt.group.members.begin_fragment(dg.ip, seq);
            } else {
                rt.group.members.finish_fragment(dg.ip);
                rt.group.members.record_received(dg.ip, seq);
            }
        }

        Ok(())
    }

    /// Dispatch a `DevGroupSend` command from the host's command dispatcher.
    pub async fn handle_send(&mut self, cmd: DevGroupSend, now: u32) -> Result<()> {
        self.publish_many(&cmd.group, cmd.items, now).await
    }

    /// Dispatch a `DevGroupStatus` command from the host's command
    /// dispatcher.
    pub fn handle_status(&self, cmd: DevGroupStatus) -> Option<GroupStatusReport> {
        self.status(cmd.group_index)
    }

    /// A snapshot of one group's state and member table, for `DevGroupStatus`.
    pub fn status(&self, group_index: Option<usize>) -> Option<GroupStatusReport> {
        let name = match group_index {
            Some(i) => self.group_order.get(i)?,
            None => self.group_order.first()?,
        };
        self.status_by_name(name)
    }

    /// Same as [`Engine::status`] but looked up by name rather than index.
    pub fn status_by_name(&self, group_name: &str) -> Option<GroupStatusReport> {
        let rt = self.groups.get(group_name)?;
        Some(GroupStatusReport {
            name: rt.group.config.name.clone(),
            state: rt.group.state,
            members: rt
                .group
                .members
                .iter()
                .map(|m| MemberStatus {
                    ip: m.ip,
                    received_sequence: m.received_sequence,
                    acked_sequence: m.acked_sequence,
                    last_seen_ms: m.last_seen_ms,
                })
                .collect(),
        })
    }

    /// Read back one item's current value from a group's item store.
    pub fn item(&self, group_name: &str, tag: u8) -> Option<Value> {
        self.groups.get(group_name)?.group.get_item(tag).cloned()
    }
}

fn flags_for(msg_type: MessageType) -> u16 {
    match msg_type {
        MessageType::FullStatus => flags::FULL_STATUS,
        MessageType::PartialUpdate | MessageType::Update | MessageType::UpdateCommand => 0,
        MessageType::UpdateMoreToCome => flags::MORE_TO_COME,
        MessageType::UpdateDirect => flags::DIRECT,
    }
}

/// The logical type of an outgoing message, before any wire splitting. Never
/// returns `UpdateMoreToCome`: that bit is decided per-packet by
/// `Message::encode_fragments`, not by what's being sent.
fn message_type_for_items(items: &[Item]) -> MessageType {
    if items.iter().any(|i| i.tag == DgrItem::COMMAND) {
        MessageType::UpdateCommand
    } else if items.len() == 1 {
        MessageType::PartialUpdate
    } else {
        MessageType::Update
    }
}

fn message_type_for_flags(wire_flags: u16, items: &[Item]) -> MessageType {
    if wire_flags & flags::FULL_STATUS != 0 {
        MessageType::FullStatus
    } else if wire_flags & flags::MORE_TO_COME != 0 {
        MessageType::UpdateMoreToCome
    } else if wire_flags & flags::DIRECT != 0 {
        MessageType::UpdateDirect
    } else {
        message_type_for_items(items)
    }
}

/// Per-member snapshot for a status report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemberStatus {
    /// The member's IPv4 address.
    pub ip: Ipv4Addr,
    /// Last inbound sequence number seen from this peer.
    pub received_sequence: u16,
    /// Last sequence number this peer has acked.
    pub acked_sequence: u16,
    /// Engine-clock timestamp this member was last heard from.
    pub last_seen_ms: u32,
}

/// `DevGroupStatus` response: a human-renderable snapshot of one group.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupStatusReport {
    /// The group's name.
    pub name: String,
    /// Current lifecycle state.
    pub state: GroupState,
    /// Known members.
    pub members: Vec<MemberStatus>,
}
