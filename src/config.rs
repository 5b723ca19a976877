use std::time::Duration;

/// Size of the per-connection receive buffer. Kept small so that ordinary
/// commands routinely arrive over several reads.
pub const RECEIVE_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name announced in the greeting and in HELO/EHLO replies
    pub hostname: String,
    /// Connections without a complete line for this long are closed by the sweep
    pub idle_timeout: Duration,
    /// How often the sweep looks for idle connections
    pub sweep_interval: Duration,
    /// How often aggregate status is logged
    pub status_interval: Duration,
    /// Cadence of the background loop itself
    pub tick: Duration,
    /// Listen backlog of the accepting socket
    pub backlog: u32,
    /// Treat a full read starting with a NUL byte as a disconnect
    pub drop_nul_flood: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            idle_timeout: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            status_interval: Duration::from_secs(20 * 60),
            tick: Duration::from_secs(1),
            backlog: 100,
            drop_nul_flood: true,
        }
    }
}

impl ServerConfig {
    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }
}
