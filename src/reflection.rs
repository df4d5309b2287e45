//! Endpoint-reflection responder.
//!
//! A STUN-like sidecar on its own IPv4 socket: correctly tagged 48-byte
//! requests are answered with a 40-byte reply whose first six bytes encode
//! the requester's observed IP and port, XOR-obfuscated. The rest of the
//! reply is a random preamble seeded once at startup.

use anyhow::{Context, Result};
use log::{debug, error, info};
use rand::RngCore;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

use crate::relay::is_hostile_source;

/// Tag expected in the first two bytes of a request, network byte order.
pub const STUN_ID: u16 = 26262;

/// Requests are exactly this long; anything else is dropped unanswered.
const REQUEST_LEN: usize = 48;

/// Replies are exactly this long.
pub const REPLY_LEN: usize = 40;

const RECV_BUF_LEN: usize = 64;

/// Requests per IP per window.
pub const MAX_REQUESTS_PER_IP: u32 = 20;
/// Distinct IPs tracked per window.
pub const MAX_CONNECTIONS_GLOBAL: usize = 5000;

const COUNTER_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// The bytes of the reply that carry the reflected endpoint.
const ENDPOINT_LEN: usize = 6;

/// Obfuscation mask applied to the reflected endpoint bytes.
const XOR_MASK: u8 = 0x20;

/// Build the reply for a request observed from `src`.
///
/// The template's tail (offsets 6..40, including the tag bytes written at
/// startup) is carried through untouched.
fn build_reply(template: &[u8; REPLY_LEN], src: &SocketAddrV4) -> [u8; REPLY_LEN] {
    let mut reply = *template;
    reply[0..4].copy_from_slice(&src.ip().octets());
    reply[4..6].copy_from_slice(&src.port().to_be_bytes());
    for b in reply[..ENDPOINT_LEN].iter_mut() {
        *b ^= XOR_MASK;
    }
    reply
}

/// Windowed per-IP request counter with a global distinct-IP cap.
struct RequestCounter {
    counts: HashMap<IpAddr, u32>,
}

impl RequestCounter {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }

    fn allow(&mut self, ip: IpAddr) -> bool {
        match self.counts.get_mut(&ip) {
            Some(count) => {
                if *count >= MAX_REQUESTS_PER_IP {
                    return false;
                }
                *count += 1;
                true
            }
            None => {
                if self.counts.len() >= MAX_CONNECTIONS_GLOBAL {
                    return false;
                }
                self.counts.insert(ip, 1);
                true
            }
        }
    }

    fn reset(&mut self) {
        self.counts.clear();
    }
}

/// The reflection responder task. Owns its socket and counter outright;
/// nothing here touches the relay's state.
pub struct ReflectionResponder {
    socket: UdpSocket,
    template: [u8; REPLY_LEN],
    counter: RequestCounter,
}

impl ReflectionResponder {
    /// Bind on all IPv4 interfaces. The reply format carries four address
    /// octets, so the responder is IPv4-only by construction.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("failed binding reflection socket on port {port}"))?;
        info!(
            "Reflection responder listening on {}",
            socket.local_addr().context("reflection socket has no local address")?
        );

        let mut template = [0u8; REPLY_LEN];
        rand::thread_rng().fill_bytes(&mut template);
        template[6..8].copy_from_slice(&STUN_ID.to_be_bytes());

        Ok(Self {
            socket,
            template,
            counter: RequestCounter::new(),
        })
    }

    /// Receive loop plus the counter-reset timer, until the task is aborted.
    pub async fn run(mut self) {
        let mut buf = [0u8; RECV_BUF_LEN];
        let mut reset = interval(COUNTER_RESET_INTERVAL);
        reset.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reset.tick() => {
                    self.counter.reset();
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.handle_request(len, &buf, src).await,
                        Err(e) => error!("Reflection socket error: {}", e),
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, len: usize, buf: &[u8; RECV_BUF_LEN], src: SocketAddr) {
        if len != REQUEST_LEN {
            return;
        }
        if is_hostile_source(&src) {
            return;
        }
        if !self.counter.allow(src.ip()) {
            debug!("Reflection request from {} rate-limited", src.ip());
            return;
        }
        if buf[0..2] != STUN_ID.to_be_bytes() {
            return;
        }
        let SocketAddr::V4(v4) = src else {
            return;
        };

        let reply = build_reply(&self.template, &v4);
        if let Err(e) = self.socket.send_to(&reply, src).await {
            debug!("Failed to send reflection reply to {}: {}", src, e);
        }
    }
}
