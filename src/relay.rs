//! Relay engine: the tunnel port's receive loop.
//!
//! Every datagram carries an 8-byte header of two little-endian client ids,
//! sender then receiver. Reserved id values select the ping and maintenance
//! subprotocols; everything else is admitted against the client table and
//! forwarded to the receiver's last known endpoint.

use anyhow::{Context, Result};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::clients::{canonical_ip, ClientId, TunnelState, ID_COMMAND, ID_NONE};
use crate::maintenance::{MaintenanceGate, DIGEST_LEN};

/// Largest datagram the relay accepts.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Two little-endian u32 client ids.
pub const HEADER_LEN: usize = 8;

/// A latency probe is exactly this long.
const PING_PACKET_LEN: usize = 50;

/// A ping reply echoes this many bytes of the request.
const PING_REPLY_LEN: usize = 12;

/// Header + command byte + SHA-1 digest.
const COMMAND_PACKET_MIN_LEN: usize = HEADER_LEN + 1 + DIGEST_LEN;

/// Bind the tunnel socket dual-stack: IPv6 any-address with v4-mapped
/// acceptance, so one socket serves both families.
///
/// tokio's bind cannot clear `IPV6_V6ONLY`, hence the socket2 detour.
pub fn bind_tunnel_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .context("failed creating tunnel socket")?;
    socket
        .set_only_v6(false)
        .context("failed enabling v4-mapped acceptance")?;
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed binding tunnel socket to {addr}"))?;
    socket
        .set_nonblocking(true)
        .context("failed setting nonblocking mode")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed converting tunnel socket")
}

/// Sources the relay never answers: spoof-friendly or nonsensical origins.
pub(crate) fn is_hostile_source(src: &SocketAddr) -> bool {
    if src.port() == 0 {
        return true;
    }
    match src.ip() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_broadcast(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_broadcast(),
            None => v6.is_loopback() || v6.is_unspecified(),
        },
    }
}

/// What to do with a parsed datagram. Decided before any state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Drop,
    Command,
    Ping,
    Forward,
}

fn classify(sender: ClientId, receiver: ClientId, len: usize, src: &SocketAddr) -> Dispatch {
    if sender == receiver && sender != ID_NONE {
        return Dispatch::Drop;
    }
    if is_hostile_source(src) {
        return Dispatch::Drop;
    }
    if sender == ID_NONE {
        if receiver == ID_COMMAND && len >= COMMAND_PACKET_MIN_LEN {
            return Dispatch::Command;
        }
        if receiver == ID_NONE && len == PING_PACKET_LEN {
            return Dispatch::Ping;
        }
        // Sender id 0 cannot be admitted; nothing else to do.
        return Dispatch::Drop;
    }
    if sender == ID_COMMAND {
        return Dispatch::Drop;
    }
    Dispatch::Forward
}

/// The tunnel port's packet processor.
pub struct RelayEngine {
    socket: Arc<UdpSocket>,
    state: Arc<TunnelState>,
    gate: MaintenanceGate,
}

impl RelayEngine {
    pub fn new(socket: Arc<UdpSocket>, state: Arc<TunnelState>, gate: MaintenanceGate) -> Self {
        Self {
            socket,
            state,
            gate,
        }
    }

    /// Process one received datagram.
    ///
    /// Packet-level failures are drops, never errors; only the send calls
    /// can fail and those are logged at debug.
    pub async fn handle_datagram(&mut self, payload: &[u8], src: SocketAddr) {
        if payload.len() < HEADER_LEN {
            return;
        }
        let sender = ClientId::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let receiver = ClientId::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

        match classify(sender, receiver, payload.len(), &src) {
            Dispatch::Drop => {}
            Dispatch::Command => {
                self.gate.handle_command(
                    payload[HEADER_LEN],
                    &payload[HEADER_LEN + 1..HEADER_LEN + 1 + DIGEST_LEN],
                    src,
                    &self.state.maintenance_enabled,
                );
            }
            Dispatch::Ping => self.handle_ping(payload, src).await,
            Dispatch::Forward => self.forward(sender, receiver, payload, src).await,
        }
    }

    async fn handle_ping(&self, payload: &[u8], src: SocketAddr) {
        let admitted = {
            let mut tables = self.state.tables.lock().await;
            tables.allow_ping(canonical_ip(&src))
        };
        if !admitted {
            return;
        }
        // The reply does not touch the table, so it is sent lock-free.
        if let Err(e) = self.socket.send_to(&payload[..PING_REPLY_LEN], src).await {
            debug!("Failed to send ping reply to {}: {}", src, e);
        }
    }

    async fn forward(&self, sender: ClientId, receiver: ClientId, payload: &[u8], src: SocketAddr) {
        let maintenance_on = self.state.maintenance_enabled.load(Ordering::SeqCst);
        let mut tables = self.state.tables.lock().await;
        if !tables.admit_sender(sender, src, maintenance_on) {
            return;
        }
        // The send stays inside the critical section: a rebind racing this
        // datagram must not redirect an in-flight forward.
        if let Some(target) = tables.forward_target(receiver, src) {
            if let Err(e) = self.socket.send_to(payload, target).await {
                debug!("Failed to forward to {}: {}", target, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn header(sender: ClientId, receiver: ClientId) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[0..4].copy_from_slice(&sender.to_le_bytes());
        h[4..8].copy_from_slice(&receiver.to_le_bytes());
        h
    }

    async fn engine() -> (RelayEngine, Arc<TunnelState>, Arc<UdpSocket>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        let gate = MaintenanceGate::new(Some("pw"));
        (
            RelayEngine::new(socket.clone(), state.clone(), gate),
            state,
            socket,
        )
    }

    #[test]
    fn test_classify_precedence() {
        let src = addr("198.51.100.7:4000");

        // Sender equals receiver (non-zero): hostile.
        assert_eq!(classify(5, 5, 100, &src), Dispatch::Drop);
        // Maintenance pattern requires the full command length.
        assert_eq!(classify(0, u32::MAX, 29, &src), Dispatch::Command);
        assert_eq!(classify(0, u32::MAX, 28, &src), Dispatch::Drop);
        // Ping is exactly 50 bytes with an all-zero header.
        assert_eq!(classify(0, 0, 50, &src), Dispatch::Ping);
        assert_eq!(classify(0, 0, 49, &src), Dispatch::Drop);
        // Zero sender with any other receiver is dropped silently.
        assert_eq!(classify(0, 7, 50, &src), Dispatch::Drop);
        // Reserved sender id can never be admitted.
        assert_eq!(classify(u32::MAX, 1, 50, &src), Dispatch::Drop);
        // Everything else is a relay packet.
        assert_eq!(classify(1, 0, 8, &src), Dispatch::Forward);
        assert_eq!(classify(1, 2, 8, &src), Dispatch::Forward);
    }

    #[test]
    fn test_hostile_sources() {
        assert!(is_hostile_source(&addr("127.0.0.1:5000")));
        assert!(is_hostile_source(&addr("0.0.0.0:5000")));
        assert!(is_hostile_source(&addr("255.255.255.255:5000")));
        assert!(is_hostile_source(&addr("[::1]:5000")));
        assert!(is_hostile_source(&addr("[::ffff:127.0.0.1]:5000")));
        assert!(is_hostile_source(&addr("198.51.100.7:0")));
        assert!(!is_hostile_source(&addr("198.51.100.7:4000")));
        assert!(!is_hostile_source(&addr("[2001:db8::1]:4000")));
    }

    #[tokio::test]
    async fn test_short_datagram_is_dropped() {
        let (mut engine, state, _socket) = engine().await;
        engine
            .handle_datagram(&[1, 0, 0, 0], addr("198.51.100.7:4000"))
            .await;
        assert_eq!(state.tables.lock().await.client_count(), 0);
    }

    #[tokio::test]
    async fn test_announce_packet_admits_without_forwarding() {
        let (mut engine, state, _socket) = engine().await;
        // Receiver 2 is unknown: the NAT-traversal registration idiom.
        engine
            .handle_datagram(&header(1, 2), addr("198.51.100.7:4000"))
            .await;
        let tables = state.tables.lock().await;
        assert_eq!(tables.client_count(), 1);
    }

    #[tokio::test]
    async fn test_forward_delivers_full_payload() {
        let (mut engine, state, _socket) = engine().await;

        // Client 42's endpoint is a real local socket so the forwarded
        // datagram can be observed.
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        {
            let mut tables = state.tables.lock().await;
            assert!(tables.admit_sender(42, receiver_addr, false));
        }

        let mut packet = header(1, 42).to_vec();
        packet.extend_from_slice(b"payload bytes");
        engine
            .handle_datagram(&packet, addr("198.51.100.7:4000"))
            .await;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("forwarded datagram not received")
            .unwrap();
        assert_eq!(&buf[..len], packet.as_slice());
    }

    #[tokio::test]
    async fn test_loopback_source_is_ignored() {
        let (mut engine, state, _socket) = engine().await;
        engine
            .handle_datagram(&header(1, 2), addr("127.0.0.1:4000"))
            .await;
        assert_eq!(state.tables.lock().await.client_count(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_command_gates_admission() {
        use sha1::{Digest, Sha1};

        let (mut engine, state, _socket) = engine().await;

        let mut packet = header(ID_NONE, ID_COMMAND).to_vec();
        packet.push(0x00);
        packet.extend_from_slice(&Sha1::digest(b"pw"));
        engine
            .handle_datagram(&packet, addr("198.51.100.7:7777"))
            .await;
        assert!(state.maintenance_enabled.load(Ordering::SeqCst));

        // New clients are refused while maintenance is on.
        engine
            .handle_datagram(&header(1, 2), addr("198.51.100.8:4000"))
            .await;
        assert_eq!(state.tables.lock().await.client_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_consumes_quota() {
        let (mut engine, state, _socket) = engine().await;
        let src = addr("198.51.100.9:4000");

        let mut ping = [0u8; 50];
        ping[20] = 0xAB;
        engine.handle_datagram(&ping, src).await;

        // Quota was consumed under the lock even though the reply went to an
        // unreachable address.
        let mut tables = state.tables.lock().await;
        for _ in 1..crate::clients::MAX_PINGS_PER_IP {
            assert!(tables.allow_ping(canonical_ip(&src)));
        }
        assert!(!tables.allow_ping(canonical_ip(&src)));
    }
}
