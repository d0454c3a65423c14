//! Error types for the VPN.

use thiserror::Error;

/// VPN-specific errors.
#[derive(Debug, Error)]
pub enum VpnError {
    /// TUN device creation or I/O failed.
    #[error("TUN device error: {0}")]
    TunDevice(String),

    /// Configuration error (fatal at startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level error (dial, upgrade, malformed frame).
    #[error("transport error: {0}")]
    Transport(String),

    /// An established connection broke (recoverable via reconnect).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Packet encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The peer presented an invalid token or a conflicting address.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Host route installation or removal failed.
    #[error("route error: {0}")]
    Route(String),

    /// Network I/O error.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Maximum reconnection attempts exceeded.
    #[error("failed to connect to server after {0} attempts")]
    ReconnectExhausted(u32),
}

impl VpnError {
    /// Returns true if this error is potentially recoverable via reconnection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VpnError::ConnectionLost(_) | VpnError::Network(_) | VpnError::Transport(_)
        )
    }
}

/// Result type alias for VPN operations.
pub type VpnResult<T> = Result<T, VpnError>;
