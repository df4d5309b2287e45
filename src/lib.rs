pub mod clients;
pub mod config;
pub mod heartbeat;
pub mod maintenance;
pub mod reflection;
pub mod relay;

// Re-export key types for easier access by consumers
pub use clients::{ClientId, TunnelClient, TunnelState};
pub use config::Config;
pub use heartbeat::Heartbeat;
pub use maintenance::MaintenanceGate;
pub use reflection::ReflectionResponder;
pub use relay::RelayEngine;
