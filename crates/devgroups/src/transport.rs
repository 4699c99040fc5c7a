//! Datagram transport.
//!
//! The production implementation wraps a non-blocking `tokio::net::UdpSocket`
//! configured via `socket2` (bind, `SO_REUSEADDR`, multicast join) — the
//! async-runtime equivalent of the spec's "non-blocking send/recv" contract:
//! `recv().await` only resolves once a datagram is actually queued, so the
//! calling task never blocks a thread waiting on the network, matching "no
//! suspension points, all I/O non-blocking" from the concurrency model.
//!
//! A channel-backed [`MockTransport`] is provided for tests that need
//! several peers to actually exchange packets without real sockets.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Maximum `EWOULDBLOCK` retries before a send is reported as failed.
const SEND_RETRIES: u8 = 3;

/// Backoff between send retries.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A datagram in flight: bytes plus sender/destination address.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload bytes.
    pub bytes: Vec<u8>,
    /// Sender's IPv4 address.
    pub ip: Ipv4Addr,
    /// Sender's UDP port.
    pub port: u16,
}

/// Send/receive contract the protocol engine needs from a socket.
pub trait Transport: Send + Sync {
    /// Send `bytes` to `dest_ip:dest_port`, retrying on `WouldBlock`.
    async fn send(&self, dest_ip: Ipv4Addr, dest_port: u16, bytes: &[u8]) -> Result<()>;

    /// Await the next inbound datagram.
    async fn recv(&self) -> Result<Datagram>;

    /// The primary non-loopback IPv4 of the active interface, if known.
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Production transport: one UDP socket, bound and joined to a multicast
/// group, multiplexing every configured group by name.
pub struct UdpTransport {
    socket: UdpSocket,
    local_ip: Option<Ipv4Addr>,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:port`, join `multicast_addr` on the primary local
    /// interface, and return a ready transport.
    ///
    /// Fails with [`Error::TransportUnavailable`] before attempting either
    /// step if no interface is ready yet (`local_ip()` would be zero) —
    /// callers on a host with flaky link-up timing should retry this on
    /// their own next tick rather than treating it as fatal.
    pub async fn bind(port: u16, multicast_addr: Ipv4Addr) -> Result<Self> {
        let local_ip = detect_local_ipv4().ok_or_else(|| {
            Error::TransportUnavailable("no network interface ready yet".to_string())
        })?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&bind_addr.into())?;

        socket
            .join_multicast_v4(&multicast_addr, &local_ip)
            .map_err(|e| {
                Error::TransportUnavailable(format!("join_multicast_v4 failed: {e}"))
            })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            socket,
            local_ip: Some(local_ip),
        })
    }
}

impl Transport for UdpTransport {
    async fn send(&self, dest_ip: Ipv4Addr, dest_port: u16, bytes: &[u8]) -> Result<()> {
        let dest: std::net::SocketAddr = (dest_ip, dest_port).into();
        let mut attempts = 0u8;
        loop {
            match self.socket.send_to(bytes, dest).await {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && attempts < SEND_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(Error::SendFailed {
                        dest: dest_ip,
                        retries: attempts,
                        source: e,
                    })
                }
            }
        }
    }

    async fn recv(&self) -> Result<Datagram> {
        let mut buf = BytesMut::zeroed(crate::wire::MAX_PACKET_LEN);
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        let ip = match from.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(Error::TransportUnavailable(
                    "received from an IPv6 peer; IPv6 is out of scope".to_string(),
                ))
            }
        };
        Ok(Datagram {
            bytes: buf.to_vec(),
            ip,
            port: from.port(),
        })
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.local_ip
    }
}

/// Resolve the primary outbound IPv4 address without sending any traffic:
/// connecting a UDP socket doesn't transmit a packet, it only asks the
/// kernel to pick a route, which is enough to read back the local address.
fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("255.255.255.255:1").ok()?;
    match probe.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, dest_ip: Ipv4Addr, dest_port: u16, bytes: &[u8]) -> Result<()> {
        (**self).send(dest_ip, dest_port, bytes).await
    }

    async fn recv(&self) -> Result<Datagram> {
        (**self).recv().await
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        (**self).local_ip()
    }
}

/// In-memory transport for tests: every `MockTransport` sharing a
/// [`MockNetwork`] can send to / receive from every other one.
pub struct MockTransport {
    ip: Ipv4Addr,
    port: u16,
    network: std::sync::Arc<MockNetwork>,
    inbox: Mutex<VecDeque<Datagram>>,
    notify: Notify,
}

/// The shared medium a set of [`MockTransport`]s exchange packets over.
#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<Vec<std::sync::Arc<MockTransport>>>,
}

impl MockNetwork {
    /// A fresh, empty network.
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Create and register a new transport on this network at `ip:port`.
    pub fn join(self: &std::sync::Arc<Self>, ip: Ipv4Addr, port: u16) -> std::sync::Arc<MockTransport> {
        let transport = std::sync::Arc::new(MockTransport {
            ip,
            port,
            network: self.clone(),
            inbox: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.peers.lock().unwrap().push(transport.clone());
        transport
    }
}

impl MockTransport {
    /// Pop one queued inbound datagram without waiting, for deterministic
    /// tests that drive delivery by hand rather than racing a real `await`.
    pub fn try_recv(&self) -> Option<Datagram> {
        self.inbox.lock().unwrap().pop_front()
    }

    /// Drain every datagram currently queued, in arrival order.
    pub fn drain(&self) -> Vec<Datagram> {
        self.inbox.lock().unwrap().drain(..).collect()
    }
}

impl Transport for MockTransport {
    async fn send(&self, dest_ip: Ipv4Addr, dest_port: u16, bytes: &[u8]) -> Result<()> {
        let is_multicast = dest_ip.octets()[0] >= 224 && dest_ip.octets()[0] <= 239;
        let peers = self.network.peers.lock().unwrap().clone();
        for peer in peers {
            if peer.ip == self.ip && peer.port == self.port {
                continue; // never loop our own send back to ourselves
            }
            let matches = if is_multicast {
                peer.port == dest_port
            } else {
                peer.ip == dest_ip && peer.port == dest_port
            };
            if matches {
                peer.inbox.lock().unwrap().push_back(Datagram {
                    bytes: bytes.to_vec(),
                    ip: self.ip,
                    port: self.port,
                });
                peer.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Datagram> {
        loop {
            if let Some(dg) = self.inbox.lock().unwrap().pop_front() {
                return Ok(dg);
            }
            self.notify.notified().await;
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(self.ip)
    }
}
