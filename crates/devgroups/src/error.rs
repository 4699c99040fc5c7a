//! Error types for device group operations.

use std::io;
use std::net::Ipv4Addr;

/// Result type for device group operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during device group operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The network stack reported no interface ready to bind/join on.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// `sendto` failed after exhausting retries.
    #[error("send to {dest} failed after {retries} retries: {source}")]
    SendFailed {
        /// Destination that the send was aimed at.
        dest: Ipv4Addr,
        /// Number of retries attempted before giving up.
        retries: u8,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The codec rejected an inbound packet.
    #[error("bad frame: {0}")]
    BadFrame(#[from] BadFrame),

    /// A packet's group name didn't match any locally configured group.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// A member hasn't acked or been heard from within the timeout.
    #[error("member {0} timed out")]
    MemberTimeout(Ipv4Addr),

    /// A string/opaque item payload exceeded the 255-byte wire limit.
    #[error("item {tag} payload of {len} bytes exceeds the 255-byte limit")]
    ItemTooLarge {
        /// The item's tag.
        tag: u8,
        /// The payload length that was rejected.
        len: usize,
    },

    /// A command-line `<tag>=<value>` argument couldn't be parsed.
    #[error("invalid item argument: {0}")]
    Parse(String),
}

/// Reasons the wire codec can reject a packet.
///
/// Kept as its own type (rather than folded into [`Error`]) so callers that
/// only care about decode failures can match on it without pulling in the
/// rest of the engine's error surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BadFrame {
    /// Packet is shorter than the fixed header.
    #[error("packet shorter than header")]
    Truncated,
    /// The `TASMOTA_DGR` magic did not match.
    #[error("magic mismatch")]
    BadMagic,
    /// The group name wasn't NUL-terminated within the 150-byte bound.
    #[error("group name not terminated")]
    UnterminatedGroupName,
    /// A string/opaque item's declared length ran past the buffer end.
    #[error("item length runs past end of packet")]
    ItemOverrun,
    /// Total packet size exceeded the 512-byte wire cap.
    #[error("packet exceeds 512 bytes")]
    TooLarge,
}
