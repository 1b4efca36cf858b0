//! Configuration for the cluster transport.

use {
    serde::{Deserialize, Serialize},
    std::{
        net::{IpAddr, SocketAddr},
        time::Duration,
    },
};

/// Six bytes every node sends ahead of its [`ConnectInfo`] during the
/// handshake. Nodes with different cookies refuse each other.
///
/// [`ConnectInfo`]: crate::connection::ConnectInfo
pub const DEFAULT_VERSION_COOKIE: [u8; 6] = *b"CMESH1";

/// Release identity exchanged in the first handshake step.
///
/// A mismatch is only logged; the cookie decides compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

impl Default for ProductVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 1,
            revision: 0,
        }
    }
}

impl std::fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Configuration for the connection table, peer connections and
/// dedicated senders.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address of the primary NIC listener. The port is the first one
    /// tried; `port_range` consecutive ports are attempted.
    /// Default: `127.0.0.1:7800`
    pub bind_addr: SocketAddr,

    /// Number of consecutive ports tried when binding the listeners.
    pub port_range: u16,

    /// Secondary NIC to listen on and dial from. `None` disables dual NIC.
    pub secondary_bind_addr: Option<IpAddr>,

    /// Keep a second socket per peer on the primary NIC and round-robin
    /// sends across both.
    pub use_dual_socket: bool,

    /// Per-connection scratch buffer used to bound socket writes (bytes).
    pub send_buffer_size: usize,

    /// Initial receive buffer size (bytes). It grows for larger frames.
    pub recv_buffer_size: usize,

    /// Largest frame a receive loop accepts before dropping the connection.
    pub max_frame_size: usize,

    /// Route outbound traffic through a per-peer sender thread.
    pub use_dedicated_sender: bool,

    /// Batch queued messages into one frame.
    pub nagling: bool,

    /// Upper bound of a batched frame (bytes).
    pub nagling_size: usize,

    /// Messages a single peer's outbound queue may hold.
    pub sender_queue_capacity: usize,

    /// TCP connect timeout (ms).
    pub connect_timeout_ms: u64,

    /// Read timeout applied while the handshake is in progress (ms).
    pub handshake_timeout_ms: u64,

    /// How many times a broken primary connection is re-dialed.
    pub connection_retries: u32,

    /// Pause between reconnection attempts (ms).
    pub connection_retry_interval_ms: u64,

    /// Pause after a successful reconnect before the in-flight frame is
    /// sent again (ms).
    pub reconnect_resend_delay_ms: u64,

    /// How long `synchronize_membership` waits for each asynchronous dial (ms).
    pub async_connect_wait_ms: u64,

    /// Destroy connections that stay idle past `conn_expire_time_ms`.
    pub use_idle_reaper: bool,

    /// Period of the idle reaper (ms).
    pub reaper_interval_ms: u64,

    /// Idle time after which the reaper destroys a connection (ms).
    pub conn_expire_time_ms: u64,

    /// Wait for answers to connection-level control requests (ms).
    pub control_response_timeout_ms: u64,

    /// Cookie compared during the handshake.
    pub version_cookie: [u8; 6],

    /// Version advertised during the handshake.
    pub product_version: ProductVersion,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7800)),
            port_range: 1,
            secondary_bind_addr: None,
            use_dual_socket: false,
            send_buffer_size: 1_048_576, // 1 MiB
            recv_buffer_size: 1_048_576, // 1 MiB
            max_frame_size: 256 * 1_048_576,
            use_dedicated_sender: true,
            nagling: true,
            nagling_size: 500 * 1024,
            sender_queue_capacity: 100_000,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            connection_retries: 3,
            connection_retry_interval_ms: 1_000,
            reconnect_resend_delay_ms: 3_000,
            async_connect_wait_ms: 2_000,
            use_idle_reaper: false,
            reaper_interval_ms: 60_000,
            conn_expire_time_ms: 300_000,
            control_response_timeout_ms: 5_000,
            version_cookie: DEFAULT_VERSION_COOKIE,
            product_version: ProductVersion::default(),
        }
    }
}

impl TransportConfig {
    /// Create a config suitable for local testing with shorter timers.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_size: 64 * 1_048_576,
            nagling_size: 64 * 1024,
            sender_queue_capacity: 10_000,
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 1_000,
            connection_retries: 2,
            connection_retry_interval_ms: 50,
            reconnect_resend_delay_ms: 0,
            async_connect_wait_ms: 1_000,
            reaper_interval_ms: 100,
            conn_expire_time_ms: 500,
            control_response_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn control_response_timeout(&self) -> Duration {
        Duration::from_millis(self.control_response_timeout_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.ip().is_unspecified() {
            return Err(ConfigError::UnspecifiedBindAddr);
        }
        if self.port_range == 0 {
            return Err(ConfigError::InvalidPortRange);
        }
        if self.send_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.send_buffer_size));
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.recv_buffer_size));
        }
        if self.nagling && self.nagling_size < 8 {
            return Err(ConfigError::InvalidNaglingSize(self.nagling_size));
        }
        if self.sender_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        if self.use_idle_reaper && (self.reaper_interval_ms == 0 || self.conn_expire_time_ms == 0)
        {
            return Err(ConfigError::InvalidReaperTiming);
        }
        Ok(())
    }
}

/// Configuration for the request correlator and group requests.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Probe slow members for the state of an overdue request.
    pub allow_request_enquiry: bool,

    /// Wake-up period of a waiting group request when enquiry is on (ms).
    pub request_enquiry_interval_ms: u64,

    /// Enquiry rounds a single group request may run.
    pub request_enquiry_retries: u32,

    /// Lifetime of a request-status record (ms).
    pub status_expiry_ms: u64,

    /// Period of the request-status cleaner (ms).
    pub status_sweep_interval_ms: u64,

    /// Timeout of the nested status query (ms).
    pub status_fetch_timeout_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            allow_request_enquiry: false,
            request_enquiry_interval_ms: 20_000,
            request_enquiry_retries: 3,
            status_expiry_ms: 15_000,
            status_sweep_interval_ms: 15_000,
            status_fetch_timeout_ms: 2_000,
        }
    }
}

impl CorrelatorConfig {
    /// Create a config suitable for local testing with shorter timers.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            request_enquiry_interval_ms: 200,
            status_expiry_ms: 500,
            status_sweep_interval_ms: 100,
            status_fetch_timeout_ms: 500,
            ..Self::default()
        }
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allow_request_enquiry && self.request_enquiry_interval_ms == 0 {
            return Err(ConfigError::InvalidEnquiryInterval);
        }
        if self.status_sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        Ok(())
    }
}

/// Errors in transport or correlator configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("bind_addr must name a concrete interface; it is the node's identity")]
    UnspecifiedBindAddr,
    #[error("port_range must be > 0")]
    InvalidPortRange,
    #[error("buffer sizes must be > 0, got {0}")]
    InvalidBufferSize(usize),
    #[error("nagling_size must be at least 8 bytes, got {0}")]
    InvalidNaglingSize(usize),
    #[error("sender_queue_capacity must be > 0")]
    InvalidQueueCapacity,
    #[error("reaper_interval_ms and conn_expire_time_ms must be > 0 when the reaper is on")]
    InvalidReaperTiming,
    #[error("request_enquiry_interval_ms must be > 0 when enquiry is on")]
    InvalidEnquiryInterval,
    #[error("status_sweep_interval_ms must be > 0")]
    InvalidSweepInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.send_buffer_size, 1_048_576);
        assert_eq!(config.nagling_size, 512_000);
        assert!(config.use_dedicated_sender);
        assert!(!config.use_idle_reaper);
        assert!(config.validate().is_ok());
        assert!(CorrelatorConfig::default().validate().is_ok());
        assert_eq!(CorrelatorConfig::default().status_expiry_ms, 15_000);
    }

    #[test]
    fn test_dev_default_binds_loopback() {
        let config = TransportConfig::dev_default();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = TransportConfig::default();
        config.port_range = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortRange)
        ));
    }

    #[test]
    fn test_unspecified_bind_addr() {
        let mut config = TransportConfig::default();
        config.bind_addr = "0.0.0.0:7800".parse().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnspecifiedBindAddr)
        ));
    }

    #[test]
    fn test_invalid_reaper_timing() {
        let mut config = TransportConfig::default();
        config.use_idle_reaper = true;
        config.conn_expire_time_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReaperTiming)
        ));
    }

    #[test]
    fn test_invalid_enquiry_interval() {
        let mut config = CorrelatorConfig::default();
        config.allow_request_enquiry = true;
        config.request_enquiry_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEnquiryInterval)
        ));
    }
}
