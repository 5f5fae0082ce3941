//! Tunnel lifecycle models.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the secure tunnel.
///
/// `Idle → Connecting → Ready → Closing → Idle`. A failed connect returns to
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelPhase {
    /// No session
    #[default]
    Idle,
    /// Authentication in progress
    Connecting,
    /// Authenticated session available
    Ready,
    /// Session being terminated
    Closing,
}

impl TunnelPhase {
    /// Lowercase name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for TunnelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
