//! ICE session negotiation for the videophone engine.
//!
//! This crate discovers and negotiates a usable media path between two call
//! endpoints: direct, server-reflexive or relayed, with STUN/TURN fallback
//! across every resolved server address. The STUN/TURN wire protocol and
//! connectivity checks are supplied by a pluggable [`IceEngine`]; this crate
//! drives it, keeps per-call state consistent across engine callbacks, and
//! hands negotiated transports back to call control.
//!
//! The main entry point is [`IceManager`].

// Error handling
pub mod error;

// Engine capability and callback plumbing
pub mod engine;

// SDP data holder and candidate attributes
pub mod sdp;
pub mod candidate;

// Servers, addresses, resolution
pub mod server;
pub mod net;
pub mod resolver;

// Configuration and logging
pub mod config;
pub mod logging;

// Signals toward call control
pub mod events;

// Negotiated transports
pub mod transports;

// Sessions and their manager
pub mod session;
mod registry;
pub mod manager;

// Public exports
pub use candidate::{CandidateAttribute, CandidateType, ComponentId, TransportProtocol};
pub use config::IceManagerConfig;
pub use engine::{
    CandidateDetails, CandidateId, CandidatePairDetails, CandidatePairId, EngineEvent, EngineEventSink,
    EngineResult, EngineRole, EngineSessionConfig, EngineSessionId, EngineStackConfig, GatheringReason,
    IceEngine, MediaStreamDetails, MediaStreamId, MediaTransport, SdpIceSupport, SdpInResult,
    SessionCompleteResult, TransportHandle, TrickleSupport, TypePreferences,
};
pub use error::{EngineError, IceError, Result};
pub use events::{CallbackToken, IceEvent, IceEventSubscriber};
pub use logging::{setup_logging, LogFormat, LoggingConfig};
pub use manager::{EngineLifecycle, IceManager, SessionStart};
pub use net::{AddressFamily, LocalAddressSource, StaticAddressSource, UdpProbeAddressSource};
pub use registry::RegistryStats;
pub use resolver::{HostResolver, SystemResolver};
pub use sdp::{MediaDescription, MediaType, Sdp, SdpAttribute};
pub use server::{IceProtocol, ServerInfo, StunServerConfig};
pub use session::{IceRole, IceSessionId, IceSessionState, IceSupport, RetryState, VACUOUS_ALL_PRIVATE_HOST};
pub use transports::{
    ComponentAddresses, DefaultTransports, IceSdpAttributes, LocalAddresses, MediaAddresses, MediaTransportKind,
    MediaTransports, NominatedMedia, NominatedTransports,
};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        CallbackToken, IceEngine, IceError, IceEvent, IceManager, IceManagerConfig, IceProtocol, IceRole,
        IceSessionId, IceSessionState, IceSupport, MediaType, NominatedTransports, Result, Sdp, ServerInfo,
        SessionStart,
    };
}

/// ICE protocol constants
pub mod constants {
    /// Default port for STUN/TURN servers
    pub const DEFAULT_STUN_PORT: u16 = crate::server::STANDARD_STUN_PORT;

    /// Related address written into privacy-redacted relay candidates
    pub const REDACTED_RADDR: &str = "0.0.0.0";
}
