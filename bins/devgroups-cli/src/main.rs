//! devgroups-cli - Device Groups diagnostics and control utility
//!
//! Joins a device group over UDP multicast and either runs indefinitely,
//! logging inbound traffic, or sends a single item and waits briefly for it
//! to be acknowledged.

mod item_arg;

use std::time::Duration;

use clap::{Parser, Subcommand};
use devgroups::clock::SystemClock;
use devgroups::config::Config;
use devgroups::device::{DeviceAdapter, Source};
use devgroups::engine::Engine;
use devgroups::error::Result;
use devgroups::transport::UdpTransport;
use devgroups::wire::{MessageType, Value};

#[derive(Parser)]
#[command(name = "devgroups-cli")]
#[command(about = "Device Groups diagnostics and control utility", long_about = None)]
#[command(version)]
struct Cli {
    /// Group name to join.
    #[arg(short, long, global = true, default_value = "tasmota")]
    group: String,

    /// UDP port (multicast and unicast).
    #[arg(short, long, global = true, default_value_t = devgroups::config::DEFAULT_PORT)]
    port: u16,

    /// Multicast group address.
    #[arg(long, global = true, default_value_t = devgroups::config::DEFAULT_MULTICAST_ADDR)]
    multicast_addr: std::net::Ipv4Addr,

    /// Emit JSON instead of text.
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine indefinitely, logging applied items and announcements.
    Run,

    /// Publish a single item (`tag=value`) and wait for it to be acked.
    Send {
        /// `<tag>=<value>`, e.g. `power=1` or `light_bri=200`.
        item: String,

        /// How long to wait for acks/retransmits before exiting.
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
    },

    /// Print the current member table after a short listen window.
    Status {
        /// How long to listen for announcements/full-status before printing.
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config {
        multicast_address: cli.multicast_addr,
        port: cli.port,
        groups: vec![devgroups::config::GroupConfig::new(cli.group.clone())],
    };

    let transport = UdpTransport::bind(config.port, config.multicast_address).await?;
    let mut engine = Engine::new(config, transport, SystemClock::new());
    engine.set_device(&cli.group, Box::new(LoggingDevice));
    engine.start();

    match cli.command {
        Command::Run => engine.run().await,
        Command::Send { item, timeout_ms } => {
            let item = item_arg::parse(&item)?;
            engine.publish(&cli.group, item.tag, item.value, 0).await?;
            let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), engine.run()).await;
            Ok(())
        }
        Command::Status { timeout_ms } => {
            let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), engine.run()).await;
            if let Some(report) = engine.status_by_name(&cli.group) {
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&report).unwrap());
                } else {
                    println!("group {} ({})", report.name, report.state);
                    for member in &report.members {
                        println!(
                            "  {} recv={} acked={} last_seen_ms={}",
                            member.ip, member.received_sequence, member.acked_sequence, member.last_seen_ms
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

/// A [`DeviceAdapter`] that only logs; this tool has no real device state to
/// mutate, it just observes the group.
struct LoggingDevice;

impl DeviceAdapter for LoggingDevice {
    fn on_apply(&mut self, tag: u8, value: &Value, msg_type: MessageType, source: Source) {
        tracing::info!(tag, ?value, ?msg_type, ?source, "item applied");
    }

    fn collect(&self) -> Vec<(u8, Value)> {
        Vec::new()
    }
}
