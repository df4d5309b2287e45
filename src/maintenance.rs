//! Password-gated maintenance command.
//!
//! A maintenance packet carries a command byte and a 20-byte SHA-1 digest of
//! the configured password. Command `0x00` toggles maintenance mode, which
//! quiesces new admissions while leaving established clients untouched.

use log::{debug, info, warn};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

/// Minimum spacing between acknowledged command attempts.
pub const COMMAND_RATE_LIMIT: Duration = Duration::from_secs(60);

/// SHA-1 digest length carried in the packet.
pub const DIGEST_LEN: usize = 20;

/// Toggle maintenance mode. All other command bytes are reserved.
const CMD_TOGGLE_MAINTENANCE: u8 = 0x00;

/// Authenticates and applies maintenance commands.
///
/// Owned by the relay receive path; only the resulting flag is shared.
pub struct MaintenanceGate {
    password_digest: Option<[u8; DIGEST_LEN]>,
    last_command: Option<Instant>,
}

impl MaintenanceGate {
    /// With no password configured the command is disabled entirely.
    pub fn new(password: Option<&str>) -> Self {
        let password_digest = password.map(|pw| {
            let mut out = [0u8; DIGEST_LEN];
            out.copy_from_slice(&Sha1::digest(pw.as_bytes()));
            out
        });
        Self {
            password_digest,
            last_command: None,
        }
    }

    /// Process one command attempt.
    ///
    /// Guards run in order: command rate limit, password configured, digest
    /// match. Any attempt that reaches the digest compare consumes the rate
    /// window, so the password cannot be probed faster than once a minute.
    pub fn handle_command(
        &mut self,
        command: u8,
        digest: &[u8],
        src: SocketAddr,
        maintenance_enabled: &AtomicBool,
    ) {
        let now = Instant::now();
        if let Some(last) = self.last_command {
            if now.duration_since(last) < COMMAND_RATE_LIMIT {
                debug!("Maintenance command from {} rate-limited", src);
                return;
            }
        }
        let Some(expected) = &self.password_digest else {
            debug!("Maintenance command from {} but no password configured", src);
            return;
        };
        self.last_command = Some(now);
        if digest.len() != DIGEST_LEN || !bool::from(digest.ct_eq(expected)) {
            warn!("Maintenance command with invalid digest from {}", src);
            return;
        }

        match command {
            CMD_TOGGLE_MAINTENANCE => {
                let was = maintenance_enabled.fetch_xor(true, Ordering::SeqCst);
                info!(
                    "Maintenance mode {} by {}",
                    if was { "disabled" } else { "enabled" },
                    src
                );
            }
            other => {
                debug!("Reserved maintenance command 0x{:02x} from {}", other, src);
            }
        }
    }

    #[cfg(test)]
    fn backdate_last_command(&mut self, by: Duration) {
        if let Some(last) = self.last_command.as_mut() {
            *last -= by;
        }
    }
}
