//! Connection configuration.
//!
//! [`ConnectionConfig`] is built either with its setters or from a JSON
//! document:
//!
//! ```
//! use std::time::Duration;
//! use cqlwire_client::{ConnectionConfig, ProtocolVersion};
//!
//! let config = ConnectionConfig::new()
//!     .protocol_version(ProtocolVersion::V3)
//!     .request_timeout(Duration::from_secs(2));
//! assert_eq!(config.protocol_version, ProtocolVersion::V3);
//!
//! let from_file = ConnectionConfig::from_json(r#"{ "request_timeout_ms": 2000 }"#).unwrap();
//! assert_eq!(from_file.request_timeout, Duration::from_secs(2));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WireError};
use crate::protocol::{ProtocolVersion, DEFAULT_MAX_FRAME_LENGTH};
use crate::writer::WriterConfig;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle time before a heartbeat is sent.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time `drain` waits for in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default CQL version sent in STARTUP.
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

/// Settings for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Version to try first.
    pub protocol_version: ProtocolVersion,
    /// Retry with lower versions when the server rejects this one.
    pub allow_version_downgrade: bool,
    /// Upper bound on concurrent requests; clamped to the version's id space.
    pub max_requests_per_connection: usize,
    /// Deadline for each request.
    pub request_timeout: Duration,
    /// Deadline for TCP connect.
    pub connect_timeout: Duration,
    /// Idle time before a heartbeat; zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Deadline for a heartbeat response; `None` uses `request_timeout`.
    pub heartbeat_timeout: Option<Duration>,
    /// How long `drain` waits before aborting what is left.
    pub drain_timeout: Duration,
    /// Largest inbound body accepted, in bytes.
    pub max_frame_length: u32,
    /// CQL version advertised in STARTUP.
    pub cql_version: String,
    /// Send OPTIONS before STARTUP to learn supported compression.
    pub send_options_on_startup: bool,
    /// Set the USE_BETA flag on every request.
    pub use_beta: bool,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            allow_version_downgrade: true,
            max_requests_per_connection: ProtocolVersion::LATEST.max_stream_ids(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            cql_version: DEFAULT_CQL_VERSION.to_string(),
            send_options_on_startup: true,
            use_beta: false,
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protocol version to try first.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Allow or forbid falling back to lower protocol versions.
    pub fn allow_version_downgrade(mut self, allow: bool) -> Self {
        self.allow_version_downgrade = allow;
        self
    }

    /// Set the concurrent request limit.
    pub fn max_requests_per_connection(mut self, limit: usize) -> Self {
        self.max_requests_per_connection = limit;
        self
    }

    /// Set the per-request timeout.
    ///
    /// Default: 12 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the heartbeat interval. `Duration::ZERO` disables heartbeats.
    ///
    /// Default: 30 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat response deadline.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Set how long `drain` waits.
    ///
    /// Default: 10 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the largest accepted inbound body.
    ///
    /// Default: 256 MiB
    pub fn max_frame_length(mut self, max: u32) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Set the CQL version sent in STARTUP.
    pub fn cql_version(mut self, version: impl Into<String>) -> Self {
        self.cql_version = version.into();
        self
    }

    /// Enable or skip the OPTIONS round trip before STARTUP.
    pub fn send_options_on_startup(mut self, send: bool) -> Self {
        self.send_options_on_startup = send;
        self
    }

    /// Set the USE_BETA flag on requests.
    pub fn use_beta(mut self, beta: bool) -> Self {
        self.use_beta = beta;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer.backpressure_timeout = timeout;
        self
    }

    /// Heartbeat deadline actually used.
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout.unwrap_or(self.request_timeout)
    }

    /// Number of stream ids to use with `version`.
    pub fn stream_capacity(&self, version: ProtocolVersion) -> usize {
        self.max_requests_per_connection
            .clamp(1, version.max_stream_ids())
    }

    /// Reject settings the connection cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_connection == 0 {
            return Err(WireError::Config(
                "max_requests_per_connection must be positive".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(WireError::Config("request_timeout must be positive".into()));
        }
        if self.max_frame_length == 0 {
            return Err(WireError::Config("max_frame_length must be positive".into()));
        }
        if self.cql_version.is_empty() {
            return Err(WireError::Config("cql_version must not be empty".into()));
        }
        if self.writer.channel_capacity == 0 || self.writer.max_pending_frames == 0 {
            return Err(WireError::Config(
                "writer capacities must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parse a JSON document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// `Config` for malformed JSON, unknown keys, an unknown protocol version
    /// or settings rejected by [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let config = file.apply(Self::default())?;
        config.validate()?;
        Ok(config)
    }
}

/// On-disk form; durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    protocol_version: Option<u8>,
    allow_version_downgrade: Option<bool>,
    max_requests_per_connection: Option<usize>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    max_frame_length: Option<u32>,
    cql_version: Option<String>,
    send_options_on_startup: Option<bool>,
    use_beta: Option<bool>,
    max_pending_frames: Option<usize>,
    channel_capacity: Option<usize>,
    backpressure_timeout_ms: Option<u64>,
}

impl ConfigFile {
    fn apply(self, mut config: ConnectionConfig) -> Result<ConnectionConfig> {
        if let Some(n) = self.protocol_version {
            config.protocol_version = ProtocolVersion::from_number(n)
                .ok_or_else(|| WireError::Config(format!("unknown protocol version {}", n)))?;
        }
        if let Some(v) = self.allow_version_downgrade {
            config.allow_version_downgrade = v;
        }
        if let Some(v) = self.max_requests_per_connection {
            config.max_requests_per_connection = v;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.max_frame_length {
            config.max_frame_length = v;
        }
        if let Some(v) = self.cql_version {
            config.cql_version = v;
        }
        if let Some(v) = self.send_options_on_startup {
            config.send_options_on_startup = v;
        }
        if let Some(v) = self.use_beta {
            config.use_beta = v;
        }
        if let Some(v) = self.max_pending_frames {
            config.writer.max_pending_frames = v;
        }
        if let Some(v) = self.channel_capacity {
            config.writer.channel_capacity = v;
        }
        if let Some(ms) = self.backpressure_timeout_ms {
            config.writer.backpressure_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.protocol_version, ProtocolVersion::V4);
        assert!(config.allow_version_downgrade);
        assert_eq!(config.request_timeout, Duration::from_secs(12));
        assert_eq!(config.effective_heartbeat_timeout(), Duration::from_secs(12));
        assert_eq!(config.max_frame_length, 256 * 1024 * 1024);
        assert_eq!(config.cql_version, "3.0.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_setters() {
        let config = ConnectionConfig::new()
            .protocol_version(ProtocolVersion::V2)
            .allow_version_downgrade(false)
            .heartbeat_interval(Duration::ZERO)
            .heartbeat_timeout(Duration::from_secs(1))
            .max_pending_frames(8)
            .use_beta(true);
        assert_eq!(config.protocol_version, ProtocolVersion::V2);
        assert!(!config.allow_version_downgrade);
        assert!(config.heartbeat_interval.is_zero());
        assert_eq!(config.effective_heartbeat_timeout(), Duration::from_secs(1));
        assert_eq!(config.writer.max_pending_frames, 8);
        assert!(config.use_beta);
    }

    #[test]
    fn test_stream_capacity_clamped_to_version() {
        let config = ConnectionConfig::default();
        assert_eq!(config.stream_capacity(ProtocolVersion::V4), 32_768);
        assert_eq!(config.stream_capacity(ProtocolVersion::V2), 128);

        let small = config.max_requests_per_connection(16);
        assert_eq!(small.stream_capacity(ProtocolVersion::V2), 16);
    }

    #[test]
    fn test_from_json() {
        let config = ConnectionConfig::from_json(
            r#"{
                "protocol_version": 3,
                "allow_version_downgrade": false,
                "request_timeout_ms": 500,
                "heartbeat_interval_ms": 0,
                "cql_version": "3.4.0",
                "max_pending_frames": 16
            }"#,
        )
        .unwrap();
        assert_eq!(config.protocol_version, ProtocolVersion::V3);
        assert!(!config.allow_version_downgrade);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert!(config.heartbeat_interval.is_zero());
        assert_eq!(config.cql_version, "3.4.0");
        assert_eq!(config.writer.max_pending_frames, 16);
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    }

    #[test]
    fn test_from_json_empty_is_default() {
        assert_eq!(
            ConnectionConfig::from_json("{}").unwrap(),
            ConnectionConfig::default()
        );
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(matches!(
            ConnectionConfig::from_json(r#"{ "protocol_version": 9 }"#),
            Err(WireError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json(r#"{ "request_timeout": 5 }"#),
            Err(WireError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json(r#"{ "request_timeout_ms": 0 }"#),
            Err(WireError::Config(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json("not json"),
            Err(WireError::Config(_))
        ));
    }
}
