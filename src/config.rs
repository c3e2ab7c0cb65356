//! The configuration surface: every knob and the
//! effect it has on the connection/backpressure layers.

use crate::extensions::FrameTransform;
use std::time::Duration;

/// Which side of the handshake this connection is on. Governs masking direction:
/// a `Server` requires masked incoming frames and emits unmasked outgoing frames; a
/// `Client` does the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

impl Mode {
    pub fn requires_masked_incoming(self) -> bool {
        matches!(self, Mode::Server)
    }

    pub fn masks_outgoing(self) -> bool {
        matches!(self, Mode::Client)
    }
}

/// Bound on the close-handshake drain loop: the connection stops waiting for the
/// peer's Close frame after whichever of `max_frames` or `max_wall_clock` is hit
/// first. The exact budget is a deliberate choice, recorded in DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDrainBudget {
    pub max_frames: u32,
    pub max_wall_clock: Duration,
}

impl Default for CloseDrainBudget {
    fn default() -> Self {
        CloseDrainBudget {
            max_frames: 100,
            max_wall_clock: Duration::from_secs(5),
        }
    }
}

/// Per-connection configuration. `extensions` holds the negotiated, ready-to-run
/// transform chain (see [`crate::extensions`]), empty unless the handshake
/// negotiated one.
pub struct ConnectionConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub auto_reply_ping: bool,
    pub mode: Mode,
    pub subprotocols: Vec<String>,
    pub close_drain_budget: CloseDrainBudget,
    pub extensions: Vec<Box<dyn FrameTransform>>,
}

impl ConnectionConfig {
    pub fn new(mode: Mode) -> Self {
        ConnectionConfig {
            max_frame_size: 64 * 1024,
            max_message_size: 16 * 1024 * 1024,
            auto_reply_ping: true,
            mode,
            subprotocols: Vec::new(),
            close_drain_budget: CloseDrainBudget::default(),
            extensions: Vec::new(),
        }
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_auto_reply_ping(mut self, auto: bool) -> Self {
        self.auto_reply_ping = auto;
        self
    }

    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    pub fn with_close_drain_budget(mut self, budget: CloseDrainBudget) -> Self {
        self.close_drain_budget = budget;
        self
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("auto_reply_ping", &self.auto_reply_ping)
            .field("mode", &self.mode)
            .field("subprotocols", &self.subprotocols)
            .field("close_drain_budget", &self.close_drain_budget)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ConnectionConfig::new(Mode::Server);
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert!(config.auto_reply_ping);
    }

    #[test]
    fn mode_governs_masking_direction() {
        assert!(Mode::Server.requires_masked_incoming());
        assert!(!Mode::Server.masks_outgoing());
        assert!(!Mode::Client.requires_masked_incoming());
        assert!(Mode::Client.masks_outgoing());
    }
}
