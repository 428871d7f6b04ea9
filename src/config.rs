use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Shared password required from every client. Production deployments
    /// must set one; `None` disables authentication entirely.
    pub password: Option<String>,
    /// How long FETCH blocks waiting for a job before returning a null blob.
    pub fetch_timeout: Duration,
    /// Deadline for the whole HI/HELLO exchange.
    pub handshake_timeout: Duration,
    /// How often due scheduled and retry entries are promoted to their queue.
    pub sweep_interval_secs: u64,
    /// How often expired reservations and silent workers are reaped.
    pub reaper_interval_secs: u64,
    /// How often the dead set is trimmed to its caps.
    pub dead_trim_interval_secs: u64,
    /// A worker missing heartbeats for this long is dropped from the registry.
    pub heartbeat_timeout: Duration,
    pub dead_max_size: usize,
    pub dead_max_age: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7419".parse().unwrap(),
            password: None,
            fetch_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(1),
            sweep_interval_secs: 5,
            reaper_interval_secs: 15,
            dead_trim_interval_secs: 3600,
            heartbeat_timeout: Duration::from_secs(60),
            dead_max_size: 10_000,
            dead_max_age: Duration::from_secs(180 * 24 * 3600),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}
