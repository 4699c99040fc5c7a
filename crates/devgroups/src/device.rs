//! Device adapter: the seam between the protocol engine and local device
//! drivers (lights, switches, power bits). Driver internals are out of
//! scope; this module only specifies the callbacks the engine invokes.

use crate::wire::{MessageType, Value};

/// Where an applied item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Applied because of a message from a remote peer.
    Remote,
    /// Applied because of a local controller action.
    Local,
}

/// Translates applied items into device effects, and reports current
/// values back for outgoing snapshots.
///
/// Implementations must be idempotent: reapplying the same `(tag, value)`
/// is a no-op on device state (spec §8, "Idempotence").
pub trait DeviceAdapter: Send {
    /// A remote update has been accepted into the item store; mutate local
    /// device state to match.
    fn on_apply(&mut self, tag: u8, value: &Value, msg_type: MessageType, source: Source);

    /// Every currently shareable item, for building a FULL_STATUS.
    fn collect(&self) -> Vec<(u8, Value)>;
}

/// A [`DeviceAdapter`] that does nothing, useful for tests and for groups
/// that exist purely to relay state between other members.
#[derive(Debug, Default)]
pub struct NullDevice;

impl DeviceAdapter for NullDevice {
    fn on_apply(&mut self, _tag: u8, _value: &Value, _msg_type: MessageType, _source: Source) {}

    fn collect(&self) -> Vec<(u8, Value)> {
        Vec::new()
    }
}
