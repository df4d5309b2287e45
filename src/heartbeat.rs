//! Periodic cleanup and master-directory announce.
//!
//! Every tick evicts timed-out clients under the table lock, releases it,
//! and then reports the instance to the master directory over HTTP. The
//! announce is best-effort: failures are logged and the relay keeps running.

use anyhow::{Context, Result};
use log::{error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::TunnelState;
use crate::config::Config;

/// Cleanup period; also the ping-quota window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol dialect reported to the master.
const ANNOUNCE_VERSION: &str = "3";

pub struct Heartbeat {
    state: Arc<TunnelState>,
    client: reqwest::Client,
    master_url: String,
    name: String,
    tunnel_port: u16,
    max_clients: usize,
    master_password: String,
    no_master_announce: bool,
}

impl Heartbeat {
    /// Validates the master URL up front: a relay that is supposed to
    /// announce but never could is a misconfiguration, not a runtime fault.
    pub fn new(state: Arc<TunnelState>, config: &Config) -> Result<Self> {
        if !config.no_master_announce {
            reqwest::Url::parse(&config.master_url)
                .with_context(|| format!("invalid master URL {:?}", config.master_url))?;
        }
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .context("failed building announce HTTP client")?;

        Ok(Self {
            state,
            client,
            master_url: config.master_url.clone(),
            name: config.name.clone(),
            tunnel_port: config.tunnel_port,
            max_clients: config.max_clients,
            master_password: config.master_password.clone(),
            no_master_announce: config.no_master_announce,
        })
    }

    /// One heartbeat: evict, then announce.
    pub async fn tick(&self) {
        let clients = {
            let mut tables = self.state.tables.lock().await;
            tables.evict_timed_out()
        };

        if self.no_master_announce {
            return;
        }
        if let Err(e) = self.announce(clients).await {
            error!("Master announce failed: {:#}", e);
        }
    }

    async fn announce(&self, clients: usize) -> Result<()> {
        let maintenance = self.state.maintenance_enabled.load(Ordering::SeqCst);

        let port = self.tunnel_port.to_string();
        let clients = clients.to_string();
        let maxclients = self.max_clients.to_string();
        let response = self
            .client
            .get(&self.master_url)
            .query(&[
                ("version", ANNOUNCE_VERSION),
                ("name", self.name.as_str()),
                ("port", port.as_str()),
                ("clients", clients.as_str()),
                ("maxclients", maxclients.as_str()),
                ("masterpw", self.master_password.as_str()),
                ("maintenance", if maintenance { "1" } else { "0" }),
            ])
            .send()
            .await
            .context("announce request failed")?
            .error_for_status()
            .context("master returned an error status")?;

        let body = response
            .text()
            .await
            .context("failed reading announce response")?;
        if !body.eq_ignore_ascii_case("OK") {
            anyhow::bail!("master rejected announce: {:?}", body);
        }
        info!("Announced to master: {} clients", clients);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-shot HTTP server: returns the captured request head.
    async fn serve_once(body: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(request);
        });

        (url, rx)
    }

    fn config_with_master(url: String) -> Config {
        Config {
            master_url: url,
            name: "Test Relay".to_string(),
            master_password: "secret pw".to_string(),
            ..Config::default()
        }
        .sanitized()
    }

    #[tokio::test]
    async fn test_announce_sends_expected_query() {
        let (url, request_rx) = serve_once("OK").await;
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        let heartbeat = Heartbeat::new(state.clone(), &config_with_master(url)).unwrap();

        heartbeat.announce(3).await.unwrap();

        let request = request_rx.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("GET /announce?"));
        assert!(request_line.contains("version=3"));
        assert!(request_line.contains("name=Test+Relay") || request_line.contains("name=Test%20Relay"));
        assert!(request_line.contains("port=50001"));
        assert!(request_line.contains("clients=3"));
        assert!(request_line.contains("maxclients=200"));
        assert!(request_line.contains("maintenance=0"));
    }

    #[tokio::test]
    async fn test_announce_reports_maintenance_flag() {
        let (url, request_rx) = serve_once("ok").await;
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        state.maintenance_enabled.store(true, Ordering::SeqCst);
        let heartbeat = Heartbeat::new(state, &config_with_master(url)).unwrap();

        // Lower-case body still counts as success.
        heartbeat.announce(0).await.unwrap();

        let request = request_rx.await.unwrap();
        assert!(request.lines().next().unwrap().contains("maintenance=1"));
    }

    #[tokio::test]
    async fn test_non_ok_body_is_a_failure() {
        let (url, _request_rx) = serve_once("bad password").await;
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        let heartbeat = Heartbeat::new(state, &config_with_master(url)).unwrap();

        assert!(heartbeat.announce(0).await.is_err());
    }

    #[tokio::test]
    async fn test_tick_evicts_without_announcing() {
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        {
            let mut tables = state.tables.lock().await;
            assert!(tables.admit_sender(1, "198.51.100.7:4000".parse().unwrap(), false));
            tables.backdate(1, Duration::from_secs(30));
        }
        let config = Config {
            no_master_announce: true,
            ..Config::default()
        };
        let heartbeat = Heartbeat::new(state.clone(), &config).unwrap();

        heartbeat.tick().await;
        assert_eq!(state.tables.lock().await.client_count(), 0);
    }

    #[test]
    fn test_invalid_master_url_is_fatal() {
        let state = Arc::new(TunnelState::new(200, 8, Duration::from_secs(30)));
        let config = Config {
            master_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(Heartbeat::new(state, &config).is_err());
    }
}
