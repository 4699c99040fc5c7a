//! End-to-end scenarios exercising the protocol engine over an in-memory
//! network of peers, matching the concrete scenarios in the protocol's
//! testable-properties section.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use devgroups::clock::FakeClock;
use devgroups::command::{DevGroupSend, DevGroupStatus};
use devgroups::config::Config;
use devgroups::device::{DeviceAdapter, Source};
use devgroups::engine::Engine;
use devgroups::error::Error;
use devgroups::group::GroupState;
use devgroups::transport::{Datagram, MockNetwork, MockTransport};
use devgroups::wire::{flags, DgrItem, Item, Message, MessageType, Value};

const PEER_A: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
const PEER_B: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 11);
const PEER_C: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 12);
const PEER_D: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 13);

type TestEngine = Engine<Arc<MockTransport>, Arc<FakeClock>>;

fn spawn(
    network: &Arc<MockNetwork>,
    clock: &Arc<FakeClock>,
    ip: Ipv4Addr,
    group: &str,
) -> (TestEngine, Arc<MockTransport>) {
    let config = Config::new(group);
    let transport = network.join(ip, config.port);
    let engine = Engine::new(config, transport.clone(), clock.clone());
    (engine, transport)
}

fn one(transport: &MockTransport) -> Datagram {
    let mut pending = transport.drain();
    assert_eq!(pending.len(), 1, "expected exactly one queued datagram");
    pending.remove(0)
}

/// Records every `on_apply` invocation, to assert idempotence/duplicate
/// suppression without needing real device state.
#[derive(Default)]
struct CountingDevice {
    applies: Arc<Mutex<Vec<(u8, Value)>>>,
}

impl CountingDevice {
    fn new() -> (Self, Arc<Mutex<Vec<(u8, Value)>>>) {
        let applies = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                applies: applies.clone(),
            },
            applies,
        )
    }
}

impl DeviceAdapter for CountingDevice {
    fn on_apply(&mut self, tag: u8, value: &Value, _msg_type: MessageType, _source: Source) {
        self.applies.lock().unwrap().push((tag, value.clone()));
    }

    fn collect(&self) -> Vec<(u8, Value)> {
        Vec::new()
    }
}

#[tokio::test]
async fn single_item_power_update_is_applied_and_acked() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut b, b_t) = spawn(&network, &clock, PEER_B, "lab");

    a.publish("lab", DgrItem::POWER, Value::U32(1), 0)
        .await
        .unwrap();

    let dg = one(&b_t);
    assert_eq!(dg.ip, PEER_A);
    b.handle_datagram(dg, 0).await.unwrap();
    assert_eq!(b.item("lab", DgrItem::POWER), Some(Value::U32(1)));

    let ack_dg = one(&a_t);
    let ack = Message::decode(&ack_dg.bytes).unwrap();
    assert!(ack.has_flag(flags::ACK));
    assert_eq!(ack.seq, 1);

    a.handle_datagram(ack_dg, 0).await.unwrap();
    let member = a
        .status_by_name("lab")
        .unwrap()
        .members
        .into_iter()
        .find(|m| m.ip == PEER_B)
        .unwrap();
    assert_eq!(member.acked_sequence, 1);
}

#[tokio::test]
async fn lost_ack_triggers_unicast_retransmit_with_exponential_backoff() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut b, b_t) = spawn(&network, &clock, PEER_B, "lab");

    // Establish B as a known member of A via one successful round trip.
    a.publish("lab", DgrItem::POWER, Value::U32(1), 0)
        .await
        .unwrap();
    b.handle_datagram(one(&b_t), 0).await.unwrap();
    a.handle_datagram(one(&a_t), 0).await.unwrap();

    // Second update: B's ack is lost, so A must fall back to unicast retry.
    a.publish("lab", DgrItem::POWER, Value::U32(0), 150)
        .await
        .unwrap();
    let _lost_in_transit = one(&b_t);

    a.tick(150).await; // ack-check not yet due (scheduled for 150 + 150)
    assert!(b_t.drain().is_empty());

    a.tick(300).await;
    let first_retry = one(&b_t);
    assert_eq!(Message::decode(&first_retry.bytes).unwrap().seq, 2);

    a.tick(600).await; // backoff doubled: next check at 300 + 300
    let second_retry = one(&b_t);
    assert_eq!(Message::decode(&second_retry.bytes).unwrap().seq, 2);

    b.handle_datagram(second_retry, 600).await.unwrap();
    a.handle_datagram(one(&a_t), 600).await.unwrap();

    let member = a
        .status_by_name("lab")
        .unwrap()
        .members
        .into_iter()
        .find(|m| m.ip == PEER_B)
        .unwrap();
    assert_eq!(member.acked_sequence, 2);
}

#[tokio::test]
async fn late_joiner_converges_via_full_status_reply() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, a_t) = spawn(&network, &clock, PEER_A, "lab");

    a.publish("lab", DgrItem::POWER, Value::U32(1), 0)
        .await
        .unwrap();
    a.publish("lab", DgrItem::LIGHT_BRI, Value::U8(200), 0)
        .await
        .unwrap();

    // C joins the network only now, after A has already converged on state
    // with no other peers around to receive those two earlier multicasts.
    let (mut c, c_t) = spawn(&network, &clock, PEER_C, "lab");

    c.start();
    c.tick(0).await; // fires the first FULL_STATUS|STATUS_REQUEST probe

    let probe = one(&a_t);
    let decoded = Message::decode(&probe.bytes).unwrap();
    assert!(decoded.has_flag(flags::FULL_STATUS));
    assert!(decoded.has_flag(flags::STATUS_REQUEST));

    a.handle_datagram(probe, 0).await.unwrap();

    // A answers with an ack plus a unicast FULL_STATUS reply.
    let mut replies = c_t.drain();
    assert_eq!(replies.len(), 2);
    for reply in replies.drain(..) {
        c.handle_datagram(reply, 0).await.unwrap();
    }

    assert_eq!(c.item("lab", DgrItem::POWER), Some(Value::U32(1)));
    assert_eq!(c.item("lab", DgrItem::LIGHT_BRI), Some(Value::U8(200)));
    assert_eq!(c.status_by_name("lab").unwrap().state, GroupState::Initialized);
}

#[tokio::test]
async fn duplicate_packet_is_acked_but_not_reapplied() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, _a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut b, b_t) = spawn(&network, &clock, PEER_B, "lab");

    let (device, applies) = CountingDevice::new();
    b.set_device("lab", Box::new(device));

    a.publish("lab", DgrItem::POWER, Value::U32(1), 0)
        .await
        .unwrap();
    let dg = one(&b_t);

    b.handle_datagram(dg.clone(), 0).await.unwrap();
    b.handle_datagram(dg, 0).await.unwrap(); // router duplicate

    assert_eq!(applies.lock().unwrap().len(), 1);
    assert_eq!(b.item("lab", DgrItem::POWER), Some(Value::U32(1)));
}

#[tokio::test]
async fn group_name_mismatch_is_dropped_without_creating_a_member() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, _a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut d, d_t) = spawn(&network, &clock, PEER_D, "kitchen");

    a.publish("lab", DgrItem::POWER, Value::U32(1), 0)
        .await
        .unwrap();
    let dg = one(&d_t);

    let err = d.handle_datagram(dg, 0).await.unwrap_err();
    assert!(matches!(err, Error::UnknownGroup(name) if name == "lab"));

    let status = d.status_by_name("kitchen").unwrap();
    assert!(status.members.is_empty());
}

#[tokio::test]
async fn sequence_wraparound_is_still_treated_as_newer() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut b, _b_t) = spawn(&network, &clock, PEER_B, "lab");

    let (device, applies) = CountingDevice::new();
    b.set_device("lab", Box::new(device));

    let at_max = Message {
        flags: 0,
        seq: 0xFFFF,
        group_name: "lab".to_string(),
        items: vec![Item::new(DgrItem::POWER, Value::U32(1))],
    };
    b.handle_datagram(datagram_from(PEER_A, at_max.encode().unwrap()), 0)
        .await
        .unwrap();

    let wrapped = Message {
        flags: 0,
        seq: 1,
        group_name: "lab".to_string(),
        items: vec![Item::new(DgrItem::POWER, Value::U32(0))],
    };
    b.handle_datagram(datagram_from(PEER_A, wrapped.encode().unwrap()), 1)
        .await
        .unwrap();

    assert_eq!(applies.lock().unwrap().len(), 2);
    assert_eq!(b.item("lab", DgrItem::POWER), Some(Value::U32(0)));
}

fn datagram_from(ip: Ipv4Addr, bytes: Vec<u8>) -> Datagram {
    Datagram {
        bytes,
        ip,
        port: devgroups::config::DEFAULT_PORT,
    }
}

/// A device that reports a fixed set of items via `collect`, independent of
/// whatever has been published through the engine so far.
struct FixedDevice(Vec<(u8, Value)>);

impl DeviceAdapter for FixedDevice {
    fn on_apply(&mut self, _tag: u8, _value: &Value, _msg_type: MessageType, _source: Source) {}

    fn collect(&self) -> Vec<(u8, Value)> {
        self.0.clone()
    }
}

#[tokio::test]
async fn full_status_pulls_in_values_from_device_collect() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, _a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut c, c_t) = spawn(&network, &clock, PEER_C, "lab");

    // A's device reports BRI_POWER_ON even though nothing was ever published
    // through `publish`/`publish_many` for that tag.
    a.set_device(
        "lab",
        Box::new(FixedDevice(vec![(DgrItem::BRI_POWER_ON, Value::U8(128))])),
    );

    a.request_full_status("lab", 0).await.unwrap();
    let dg = one(&c_t); // multicast; C is the only other peer listening
    assert_eq!(dg.ip, PEER_A);

    c.handle_datagram(dg, 0).await.unwrap();
    assert_eq!(c.item("lab", DgrItem::BRI_POWER_ON), Some(Value::U8(128)));
}

#[tokio::test]
async fn oversized_update_is_split_and_reassembled_across_more_to_come_fragments() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, _a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut b, b_t) = spawn(&network, &clock, PEER_B, "lab");

    let (device, applies) = CountingDevice::new();
    b.set_device("lab", Box::new(device));

    // Eight 150-byte string items don't fit in a single 512-byte packet.
    let items: Vec<Item> = (192..200)
        .map(|tag| Item::new(tag, Value::Str("x".repeat(150))))
        .collect();
    a.publish_many("lab", items.clone(), 0).await.unwrap();

    let fragments = b_t.drain();
    assert!(fragments.len() > 1, "expected more than one wire fragment");
    let seq = Message::decode(&fragments[0].bytes).unwrap().seq;

    for (i, dg) in fragments.iter().enumerate() {
        let decoded = Message::decode(&dg.bytes).unwrap();
        assert_eq!(decoded.seq, seq);
        let is_last = i == fragments.len() - 1;
        assert_eq!(decoded.has_flag(flags::MORE_TO_COME), !is_last);
        b.handle_datagram(dg.clone(), 0).await.unwrap();
    }

    // Every item across every fragment was applied exactly once, not just
    // the ones carried by the first packet.
    assert_eq!(applies.lock().unwrap().len(), items.len());
    for item in &items {
        assert_eq!(b.item("lab", item.tag), Some(item.value.clone()));
    }

    // Resending the exact same fragments again (a router-level duplicate of
    // the whole sequence) must not re-apply anything.
    for dg in &fragments {
        b.handle_datagram(dg.clone(), 0).await.unwrap();
    }
    assert_eq!(applies.lock().unwrap().len(), items.len());
}

#[tokio::test]
async fn command_surface_dispatches_send_and_status() {
    let network = MockNetwork::new();
    let clock = Arc::new(FakeClock::new());
    let (mut a, a_t) = spawn(&network, &clock, PEER_A, "lab");
    let (mut b, b_t) = spawn(&network, &clock, PEER_B, "lab");

    a.handle_send(
        DevGroupSend {
            group: "lab".to_string(),
            items: vec![Item::new(DgrItem::POWER, Value::U32(1))],
        },
        0,
    )
    .await
    .unwrap();

    let dg = one(&b_t);
    b.handle_datagram(dg, 0).await.unwrap();
    let _ack = a_t.drain();

    let report = b
        .handle_status(DevGroupStatus { group_index: None })
        .unwrap();
    assert_eq!(report.name, "lab");
    assert!(report.members.iter().any(|m| m.ip == PEER_A));
    assert_eq!(b.item("lab", DgrItem::POWER), Some(Value::U32(1)));
}
