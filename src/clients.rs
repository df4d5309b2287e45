//! Client registry for the tunnel relay.
//!
//! The table maps a 32-bit client id to the endpoint it was last heard from.
//! Admission is bounded three ways: total table size, admitted clients per
//! source IP, and a maintenance flag that refuses new ids and endpoint
//! rebinds while set. The per-IP admitted count and the ping quota share the
//! table's lock because every admission decision reads both.

use log::{debug, info};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Client identifier chosen by the client; not authenticated.
pub type ClientId = u32;

/// Never stored as a table key: marks ping and command packets.
pub const ID_NONE: ClientId = 0;
/// Never stored as a table key: marks the maintenance command receiver.
pub const ID_COMMAND: ClientId = u32::MAX;

/// Distinct IPs the ping map may hold per cleanup window.
pub const MAX_PINGS_GLOBAL: usize = 5000;
/// Ping replies per IP per cleanup window.
pub const MAX_PINGS_PER_IP: u32 = 20;

/// A registered tunnel client.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    pub endpoint: SocketAddr,
    pub last_receive: Instant,
}

impl TunnelClient {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            last_receive: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive.elapsed() >= timeout
    }
}

/// Normalize an endpoint's IP for per-IP accounting.
///
/// The relay socket is dual-stack, so the same host may surface as a bare
/// IPv4 address or as its v4-mapped IPv6 form depending on the bind; both
/// must count against one bucket.
pub fn canonical_ip(addr: &SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => IpAddr::V6(v6),
    }
}

/// Client table plus the per-IP counters that gate it.
///
/// One lock covers all three maps: the admission invariant (table size,
/// per-IP count) must be decided against a consistent snapshot.
pub struct TunnelTables {
    clients: HashMap<ClientId, TunnelClient>,
    ip_counts: HashMap<IpAddr, u32>,
    ping_counts: HashMap<IpAddr, u32>,
    max_clients: usize,
    ip_limit: u32,
    client_timeout: Duration,
}

impl TunnelTables {
    pub fn new(max_clients: usize, ip_limit: u32, client_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            ip_counts: HashMap::new(),
            ping_counts: HashMap::new(),
            max_clients,
            ip_limit,
            client_timeout,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Admit, refresh, or rebind the sender of a relay packet.
    ///
    /// Returns `true` when the sender is present in the table afterwards and
    /// the packet may proceed to the forward stage.
    pub fn admit_sender(
        &mut self,
        id: ClientId,
        endpoint: SocketAddr,
        maintenance_on: bool,
    ) -> bool {
        let now = Instant::now();

        if let Some(stored) = self.clients.get(&id).map(|c| (c.endpoint, c.last_receive)) {
            let (stored_endpoint, last_receive) = stored;

            if stored_endpoint == endpoint {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.last_receive = now;
                }
                return true;
            }

            // A different endpoint may only take over an id that has gone
            // idle, and never while maintenance is on.
            let timed_out = now.duration_since(last_receive) >= self.client_timeout;
            if !timed_out || maintenance_on {
                return false;
            }
            if !self.allow_connection(canonical_ip(&endpoint), Some(canonical_ip(&stored_endpoint)))
            {
                return false;
            }
            if let Some(client) = self.clients.get_mut(&id) {
                client.endpoint = endpoint;
                client.last_receive = now;
            }
            debug!("Client {} rebound to {}", id, endpoint);
            return true;
        }

        if self.clients.len() >= self.max_clients {
            info!(
                "Client table full ({} entries), refusing client {}",
                self.clients.len(),
                id
            );
            return false;
        }
        if maintenance_on {
            return false;
        }
        if !self.allow_connection(canonical_ip(&endpoint), None) {
            return false;
        }
        self.clients.insert(id, TunnelClient::new(endpoint));
        true
    }

    /// Where to forward a packet addressed to `receiver`, if anywhere.
    ///
    /// `sender_endpoint` is the already-admitted sender's endpoint; a packet
    /// is never echoed back to its origin.
    pub fn forward_target(
        &self,
        receiver: ClientId,
        sender_endpoint: SocketAddr,
    ) -> Option<SocketAddr> {
        let target = self.clients.get(&receiver)?;
        if target.endpoint == sender_endpoint {
            return None;
        }
        Some(target.endpoint)
    }

    /// Per-IP admission check with counter transfer on rebind.
    ///
    /// Increments the count for `new_ip` when admitting; on a rebind that
    /// changes address, the old address's count is released in the same
    /// step so the joint invariant holds under one lock.
    fn allow_connection(&mut self, new_ip: IpAddr, old_ip: Option<IpAddr>) -> bool {
        let current = self.ip_counts.get(&new_ip).copied().unwrap_or(0);
        if current >= self.ip_limit {
            debug!("Per-IP limit reached for {}", new_ip);
            return false;
        }
        match old_ip {
            None => {
                self.ip_counts.insert(new_ip, current + 1);
                true
            }
            Some(old) if old != new_ip => {
                self.ip_counts.insert(new_ip, current + 1);
                self.release_ip(old);
                true
            }
            Some(_) => true,
        }
    }

    fn release_ip(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_counts.remove(&ip);
            }
        }
    }

    /// Consume one unit of ping quota for `ip`.
    pub fn allow_ping(&mut self, ip: IpAddr) -> bool {
        match self.ping_counts.get_mut(&ip) {
            Some(count) => {
                if *count >= MAX_PINGS_PER_IP {
                    debug!("Ping quota exhausted for {}", ip);
                    return false;
                }
                *count += 1;
                true
            }
            None => {
                if self.ping_counts.len() >= MAX_PINGS_GLOBAL {
                    debug!("Global ping map full, dropping ping from {}", ip);
                    return false;
                }
                self.ping_counts.insert(ip, 1);
                true
            }
        }
    }

    /// Remove timed-out clients and reset the ping window.
    ///
    /// Returns the number of clients remaining.
    pub fn evict_timed_out(&mut self) -> usize {
        let stale: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(self.client_timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some(client) = self.clients.remove(id) {
                self.release_ip(canonical_ip(&client.endpoint));
            }
        }
        if !stale.is_empty() {
            debug!("Evicted {} idle clients", stale.len());
        }

        self.ping_counts.clear();
        self.clients.len()
    }

    #[cfg(test)]
    pub fn ip_count(&self, ip: IpAddr) -> u32 {
        self.ip_counts.get(&ip).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn endpoint_of(&self, id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&id).map(|c| c.endpoint)
    }

    #[cfg(test)]
    pub fn backdate(&mut self, id: ClientId, by: Duration) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.last_receive -= by;
        }
    }
}

/// Shared relay state: the locked tables plus the maintenance flag.
///
/// The flag is atomic because the heartbeat reads it for the announce while
/// the relay path owns all writes.
pub struct TunnelState {
    pub tables: Mutex<TunnelTables>,
    pub maintenance_enabled: AtomicBool,
}

impl TunnelState {
    pub fn new(max_clients: usize, ip_limit: u32, client_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(TunnelTables::new(max_clients, ip_limit, client_timeout)),
            maintenance_enabled: AtomicBool::new(false),
        }
    }
}
