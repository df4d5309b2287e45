use anyhow::{Context, Result};
use clap::Parser;
use gamerelay::{
    config::Config,
    heartbeat::{Heartbeat, HEARTBEAT_INTERVAL},
    maintenance::MaintenanceGate,
    reflection::ReflectionResponder,
    relay::{self, RelayEngine, MAX_PACKET_SIZE},
    TunnelState,
};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(
    name = "gamerelay",
    version,
    about = "UDP tunnel relay for peer-to-peer game clients behind NAT",
    long_about = "gamerelay\n\n\
        Forwards short datagrams between registered game clients that cannot\n\
        reach each other directly, answers latency probes, reflects observed\n\
        endpoints STUN-style on a side port, and announces itself to a master\n\
        directory.\n\n\
        Examples:\n  \
          # Private relay, no directory announce\n  \
          gamerelay --no-master-announce\n\n  \
          # Public relay listed on a master directory\n  \
          gamerelay --name \"EU Relay 1\" --master-url https://master.example/announce"
)]
struct Args {
    /// UDP port for the tunnel relay
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// UDP port for the endpoint-reflection responder
    #[arg(long)]
    reflection_port: Option<u16>,

    /// Ceiling on the client table size
    #[arg(long)]
    max_clients: Option<usize>,

    /// Maximum admitted clients per source IP
    #[arg(long)]
    ip_limit: Option<u32>,

    /// Instance name reported to the master directory
    #[arg(long)]
    name: Option<String>,

    /// Master directory announce URL
    #[arg(long)]
    master_url: Option<String>,

    /// Credential passed to the master on announce
    #[arg(long)]
    master_password: Option<String>,

    /// Password enabling the maintenance command
    #[arg(long)]
    maintenance_password: Option<String>,

    /// Skip master announces; cleanup still runs
    #[arg(long)]
    no_master_announce: bool,

    /// Idle seconds before a client is evicted
    #[arg(long)]
    client_timeout_secs: Option<u64>,

    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,
}

/// File config overlaid with CLI flags; CLI wins.
fn resolve_config(args: &Args) -> Config {
    let mut config = if let Some(path) = &args.config {
        Config::load(path).unwrap_or_else(|e| {
            warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            Config::default()
        })
    } else {
        Config::load_or_default()
    };

    if let Some(v) = args.tunnel_port {
        config.tunnel_port = v;
    }
    if let Some(v) = args.reflection_port {
        config.reflection_port = v;
    }
    if let Some(v) = args.max_clients {
        config.max_clients = v;
    }
    if let Some(v) = args.ip_limit {
        config.ip_limit = v;
    }
    if let Some(v) = &args.name {
        config.name = v.clone();
    }
    if let Some(v) = &args.master_url {
        config.master_url = v.clone();
    }
    if let Some(v) = &args.master_password {
        config.master_password = v.clone();
    }
    if let Some(v) = &args.maintenance_password {
        config.maintenance_password = Some(v.clone());
    }
    if args.no_master_announce {
        config.no_master_announce = true;
    }
    if let Some(v) = args.client_timeout_secs {
        config.client_timeout_secs = v;
    }

    config.sanitized()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let config = resolve_config(&args);

    let state = Arc::new(TunnelState::new(
        config.max_clients,
        config.ip_limit,
        config.client_timeout(),
    ));

    // Fails fast on an unusable master URL; binds fail fast below.
    let heartbeat = Heartbeat::new(state.clone(), &config)?;

    let tunnel_socket = Arc::new(
        relay::bind_tunnel_socket(config.tunnel_port).context("tunnel socket setup failed")?,
    );
    info!(
        "Tunnel relay '{}' listening on UDP/{} (max {} clients, {} per IP, {}s timeout)",
        config.name,
        config.tunnel_port,
        config.max_clients,
        config.ip_limit,
        config.client_timeout_secs
    );
    if config.maintenance_password.is_none() {
        info!("No maintenance password configured; maintenance command disabled");
    }

    let responder = ReflectionResponder::bind(config.reflection_port)
        .await
        .context("reflection socket setup failed")?;
    let reflection_task = tokio::spawn(responder.run());

    let gate = MaintenanceGate::new(config.maintenance_password.as_deref());
    let mut engine = RelayEngine::new(tunnel_socket.clone(), state.clone(), gate);

    // First tick fires immediately: one eager cleanup-and-announce at startup.
    let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);

    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Exiting...");
                break;
            }
            _ = heartbeat_interval.tick() => {
                heartbeat.tick().await;
            }
            result = tunnel_socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => engine.handle_datagram(&buf[..len], src).await,
                    Err(e) => error!("Tunnel socket error: {}", e),
                }
            }
        }
    }

    reflection_task.abort();

    Ok(())
}
