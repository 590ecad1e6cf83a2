use std::time::Duration;

/// WebSocket subprotocol negotiated at upgrade.
pub const SUBPROTOCOL: &str = "duo";

/// Close code sent when the authentication handshake is rejected.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4003;

/// Per-connection timing knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Idle time after which the server pings the client.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before the connection is dropped.
    /// Also the limit on any single write to the peer.
    pub ping_timeout: Duration,
    /// How long a new connection has to send its authenticate request.
    pub handshake_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
