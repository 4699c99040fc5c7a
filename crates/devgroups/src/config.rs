//! Configuration surface (set once at construction).

use std::net::Ipv4Addr;

/// Default UDP port for Device Groups traffic.
pub const DEFAULT_PORT: u16 = 4447;

/// Default multicast group address.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 250, 250);

/// Initial ms to wait for an ack before the first retransmit.
pub const DGR_ACK_WAIT_TIME_MS: u32 = 150;

/// ms between announcement heartbeats.
pub const DGR_ANNOUNCEMENT_INTERVAL_MS: u32 = 60_000;

/// Number of additional multicasts sent per outgoing message, beyond the
/// first immediate one.
pub const DGR_MULTICAST_REPEAT_COUNT: u8 = 1;

/// Number of FULL_STATUS|STATUS_REQUEST probes sent on startup before
/// giving up on an initial reply.
pub const INITIAL_STATUS_REQUESTS: u8 = 10;

/// Configuration for one Device Group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Group name, ≤150 ASCII bytes, matched exactly on ingress.
    pub name: String,
    /// Bitmask of [`crate::wire::ShareItem`] categories this instance will
    /// emit.
    pub send_mask: u32,
    /// Bitmask of [`crate::wire::ShareItem`] categories this instance will
    /// accept.
    pub receive_mask: u32,
}

impl GroupConfig {
    /// A group with the default "share everything" masks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            send_mask: 0xFFFF_FFFF,
            receive_mask: 0xFFFF_FFFF,
        }
    }

    /// Override the send (share-out) mask.
    pub fn with_send_mask(mut self, mask: u32) -> Self {
        self.send_mask = mask;
        self
    }

    /// Override the receive (share-in) mask.
    pub fn with_receive_mask(mut self, mask: u32) -> Self {
        self.receive_mask = mask;
        self
    }
}

/// Top-level configuration: the shared transport plus every group
/// multiplexed over it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Multicast group address to join and send to.
    pub multicast_address: Ipv4Addr,
    /// UDP port for both multicast and unicast traffic.
    pub port: u16,
    /// Groups this instance participates in.
    pub groups: Vec<GroupConfig>,
}

impl Config {
    /// A config for a single group at the default address/port.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            multicast_address: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_PORT,
            groups: vec![GroupConfig::new(group_name)],
        }
    }

    /// Add another group to this configuration.
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }
}
