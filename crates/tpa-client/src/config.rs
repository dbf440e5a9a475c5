use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:7002/tpa-ws";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`crate::TpaSession`].
#[derive(Debug, Clone)]
pub struct TpaSessionConfig {
    /// Unique identifier of the app, e.g. `org.company.appname`.
    pub package_name: String,
    /// Credential checked by the cloud during the handshake.
    pub api_key: String,
    pub server_url: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Base delay; attempt `k` waits `reconnect_delay * 2^k`.
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
}

impl TpaSessionConfig {
    pub fn new(package_name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            api_key: api_key.into(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Backoff before reconnect attempt `attempt` (0-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Full websocket URL with an explicit scheme.
    pub fn endpoint(&self) -> String {
        let url = self.server_url.trim();
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return url.to_string();
        }

        // Bare hosts default to TLS unless they point at this machine.
        if url.contains("localhost") || url.contains("127.0.0.1") {
            format!("ws://{url}")
        } else {
            format!("wss://{url}")
        }
    }
}
