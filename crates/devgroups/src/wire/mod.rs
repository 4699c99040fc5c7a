//! TASMOTA_DGR wire codec.
//!
//! Pure encode/decode of the Device Groups frame: an 11-byte magic, a
//! 2-byte flags field, a 2-byte sequence number, a NUL-terminated group
//! name, and a tag-length-value item stream terminated by an EOL tag. No
//! I/O happens in this module; it only ever touches the buffers handed to
//! it.

mod builder;
mod item;
mod message;

pub use builder::MessageBuilder;
pub use item::{blocked_by_mask, category_of, width_of, DgrItem, Item, ShareItem, Value, Width};
pub use message::{Message, MAX_PACKET_LEN};

/// The literal that opens every Device Groups packet. No NUL terminator.
pub const MAGIC: &[u8] = b"TASMOTA_DGR";

/// Maximum content length (excluding the NUL) of a group name.
pub const MAX_GROUP_NAME_LEN: usize = 150;

/// Message flag bits (`DevGroupMessageFlag` in the original Tasmota source).
pub mod flags {
    /// Message requests the receiver forget existing state and start fresh.
    pub const RESET: u16 = 1;
    /// Sender wants the receiver to reply with a FULL_STATUS.
    pub const STATUS_REQUEST: u16 = 2;
    /// Message is a full item-store snapshot.
    pub const FULL_STATUS: u16 = 4;
    /// Message is an acknowledgment (empty body, echoes `seq`).
    pub const ACK: u16 = 8;
    /// More fragments of this sequence number follow.
    pub const MORE_TO_COME: u16 = 16;
    /// Message originated directly at the sender, not relayed.
    pub const DIRECT: u16 = 32;
    /// Message is a bodyless heartbeat used for peer discovery.
    pub const ANNOUNCEMENT: u16 = 64;
    /// Message should also be applied locally before being sent.
    pub const LOCAL: u16 = 128;
}

/// Message types (`DevGroupMessageType` in the original Tasmota source).
///
/// These aren't wire bits — they describe the *intent* behind a flag
/// combination the engine builds, used internally when constructing an
/// outgoing message and when deciding how a received item was framed. The
/// original's `WITH_LOCAL` high bit (OR'd into its single type byte to signal
/// "apply locally before sending") has no wire-bit counterpart here: loopback
/// apply is a call-site choice (`Engine::publish_with_local`) that invokes
/// `DeviceAdapter::on_apply` with `Source::Local` before the send, rather
/// than a bit a receiver would ever need to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Full snapshot of every shareable item.
    FullStatus,
    /// A single item.
    PartialUpdate,
    /// Multiple items, final fragment.
    Update,
    /// Multiple items, more fragments follow.
    UpdateMoreToCome,
    /// Sender-originated, not a relay.
    UpdateDirect,
    /// Carries a COMMAND item.
    UpdateCommand,
}
