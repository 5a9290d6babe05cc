//! Manager configuration
//!
//! Everything the negotiation layer used to read from process-wide settings
//! is carried here and injected into [`IceManager`](crate::IceManager) at
//! construction.
//!
//! ```rust
//! use vpe_ice_core::{IceManagerConfig, IceProtocol, ServerInfo};
//!
//! let config = IceManagerConfig::new()
//!     .with_max_sessions(8)
//!     .with_primary_server(ServerInfo::new("turn.example.com", 3478).with_credentials("alice", "secret"))
//!     .with_protocol(IceProtocol::Turn)
//!     .with_privacy(true);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.stack_config().max_media_streams, 24);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineSessionConfig, EngineStackConfig, TypePreferences};
use crate::error::{IceError, Result};
use crate::logging::LoggingConfig;
use crate::server::{IceProtocol, ServerInfo};

/// Connectivity checks give up after this long
pub const DEFAULT_CONNECTIVITY_CHECK_TIMEOUT_MS: u64 = 10_000;

/// Configuration for [`IceManager`](crate::IceManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceManagerConfig {
    /// Concurrent sessions the engine is sized for
    pub max_sessions: usize,
    /// Gathering protocol used for sessions started without an override
    pub protocol: IceProtocol,
    pub primary_server: Option<ServerInfo>,
    pub alternate_server: Option<ServerInfo>,
    pub use_lite_mode: bool,
    /// Refuse calls whose remote candidates are all private host addresses
    pub reject_host_only_requests: bool,
    /// Advertise relay candidates only, with `raddr` redacted
    pub prioritize_privacy: bool,
    /// Debug override: invert type preferences so the relay wins
    pub prefer_turn: bool,
    pub ipv6_enabled: bool,
    /// NAT64-style networks: use IPv6 alone whenever it is available
    pub ipv6_only_when_available: bool,
    pub connectivity_check_timeout_ms: u64,
    /// Signal channel capacity per subscriber
    pub event_capacity: usize,
    /// Subscriber settings for [`setup_logging`](crate::logging::setup_logging)
    pub logging: LoggingConfig,
}

impl Default for IceManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            protocol: IceProtocol::Turn,
            primary_server: None,
            alternate_server: None,
            use_lite_mode: false,
            reject_host_only_requests: false,
            prioritize_privacy: false,
            prefer_turn: false,
            ipv6_enabled: true,
            ipv6_only_when_available: false,
            connectivity_check_timeout_ms: DEFAULT_CONNECTIVITY_CHECK_TIMEOUT_MS,
            event_capacity: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

impl IceManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_protocol(mut self, protocol: IceProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_primary_server(mut self, server: ServerInfo) -> Self {
        self.primary_server = Some(server);
        self
    }

    pub fn with_alternate_server(mut self, server: ServerInfo) -> Self {
        self.alternate_server = Some(server);
        self
    }

    pub fn with_lite_mode(mut self, enabled: bool) -> Self {
        self.use_lite_mode = enabled;
        self
    }

    pub fn with_reject_host_only_requests(mut self, enabled: bool) -> Self {
        self.reject_host_only_requests = enabled;
        self
    }

    pub fn with_privacy(mut self, enabled: bool) -> Self {
        self.prioritize_privacy = enabled;
        self
    }

    pub fn with_prefer_turn(mut self, enabled: bool) -> Self {
        self.prefer_turn = enabled;
        self
    }

    pub fn with_ipv6(mut self, enabled: bool, only_when_available: bool) -> Self {
        self.ipv6_enabled = enabled;
        self.ipv6_only_when_available = only_when_available;
        self
    }

    pub fn with_connectivity_check_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_check_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn connectivity_check_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_check_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(IceError::config("max_sessions must be at least 1"));
        }
        if self.connectivity_check_timeout_ms == 0 {
            return Err(IceError::config("connectivity check timeout must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(IceError::config("event_capacity must be non-zero"));
        }
        if self.alternate_server.is_some() && self.primary_server.is_none() {
            return Err(IceError::config("alternate server configured without a primary"));
        }
        for server in self.primary_server.iter().chain(self.alternate_server.iter()) {
            if server.address.trim().is_empty() {
                return Err(IceError::config("server address is empty"));
            }
            if server.port == 0 {
                return Err(IceError::config(format!("server {} has port 0", server.address)));
            }
        }
        if self.ipv6_only_when_available && !self.ipv6_enabled {
            return Err(IceError::config("ipv6_only_when_available requires ipv6_enabled"));
        }
        self.logging.validate()
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| IceError::config(format!("Invalid TOML configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)
            .map_err(|e| IceError::config(format!("Invalid JSON configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Process-wide engine settings derived from this configuration
    pub fn stack_config(&self) -> EngineStackConfig {
        EngineStackConfig::for_sessions(self.max_sessions, self.use_lite_mode, self.connectivity_check_timeout())
    }

    /// Per-session engine settings derived from this configuration
    pub fn session_config(&self) -> EngineSessionConfig {
        EngineSessionConfig {
            type_preferences: if self.prefer_turn {
                TypePreferences::prefer_relay()
            } else {
                TypePreferences::default()
            },
        }
    }
}
