//! Peer-to-peer device-group state synchronization, wire-compatible with
//! Tasmota's `TASMOTA_DGR` UDP protocol.
//!
//! A *device group* is a named set of peers on the same multicast segment
//! that converge on a shared set of item values (relay state, light
//! brightness, and so on) without any central coordinator. Membership is
//! discovered passively from traffic; delivery is at-least-once via
//! multicast plus per-member unicast retransmission.
//!
//! # Example
//!
//! ```ignore
//! use devgroups::clock::SystemClock;
//! use devgroups::config::Config;
//! use devgroups::engine::Engine;
//! use devgroups::transport::UdpTransport;
//! use devgroups::wire::{DgrItem, Value};
//!
//! #[tokio::main]
//! async fn main() -> devgroups::error::Result<()> {
//!     let config = Config::new("lab");
//!     let transport = UdpTransport::bind(config.port, config.multicast_address).await?;
//!     let mut engine = Engine::new(config, transport, SystemClock::new());
//!
//!     engine.start();
//!     engine.publish("lab", DgrItem::POWER, Value::U32(1), 0).await?;
//!     engine.run().await
//! }
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod group;
pub mod member;
pub mod transport;
pub mod wire;

pub use clock::{Clock, FakeClock, SystemClock};
pub use command::{DevGroupSend, DevGroupStatus};
pub use config::{Config, GroupConfig};
pub use device::{DeviceAdapter, NullDevice, Source};
pub use engine::{Engine, GroupStatusReport, MemberStatus};
pub use error::{BadFrame, Error, Result};
pub use group::{Group, GroupState};
pub use member::{Member, MemberTable};
pub use transport::{Datagram, MockNetwork, MockTransport, Transport, UdpTransport};
