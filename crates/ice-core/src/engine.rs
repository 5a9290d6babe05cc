//! ICE engine capability
//!
//! The STUN/TURN wire protocol, connectivity checks and candidate bookkeeping
//! live in a pluggable engine. This module defines the surface the
//! negotiation layer drives, and the event sink through which the engine
//! reports asynchronous results from its own threads.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::candidate::{CandidateType, ComponentId, TransportProtocol};
use crate::error::EngineError;
use crate::sdp::Sdp;
use crate::server::StunServerConfig;

/// Result of a single engine call
pub type EngineResult<T> = std::result::Result<T, EngineError>;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

engine_id!(
    /// Engine-side ICE session
    EngineSessionId
);
engine_id!(
    /// Media stream inside an engine session
    MediaStreamId
);
engine_id!(
    /// Local or remote candidate
    CandidateId
);
engine_id!(
    /// Candidate pair
    CandidatePairId
);

/// Offer/answer role as the engine understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Offerer,
    Answerer,
}

/// Trickle ICE support level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickleSupport {
    None,
    Half,
    Full,
}

/// Candidate type preferences used in priority computation (0..=126)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypePreferences {
    pub host: u8,
    pub peer_reflexive: u8,
    pub server_reflexive: u8,
    pub relayed: u8,
}

impl Default for TypePreferences {
    fn default() -> Self {
        Self {
            host: 126,
            peer_reflexive: 110,
            server_reflexive: 100,
            relayed: 0,
        }
    }
}

impl TypePreferences {
    /// Inverted order that steers nomination toward the relay
    pub fn prefer_relay() -> Self {
        Self {
            host: 0,
            peer_reflexive: 1,
            server_reflexive: 2,
            relayed: 126,
        }
    }
}

/// Process-wide engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStackConfig {
    pub max_sessions: usize,
    pub max_media_streams: usize,
    pub lite_mode: bool,
    pub turn_rtp_even_port: bool,
    pub turn_rtcp_odd_port: bool,
    /// Keep relay candidates even when the host is not behind a NAT
    pub create_non_nat_relayed_candidates: bool,
    pub create_tcp_candidates: bool,
    pub connectivity_check_timeout: Duration,
    pub multiplex_rtcp: bool,
    pub trickle: TrickleSupport,
}

/// Media streams per call: audio, video and text
pub const MEDIA_STREAMS_PER_SESSION: usize = 3;

impl EngineStackConfig {
    pub fn for_sessions(max_sessions: usize, lite_mode: bool, connectivity_check_timeout: Duration) -> Self {
        Self {
            max_sessions,
            max_media_streams: MEDIA_STREAMS_PER_SESSION * max_sessions,
            lite_mode,
            turn_rtp_even_port: true,
            turn_rtcp_odd_port: true,
            create_non_nat_relayed_candidates: true,
            create_tcp_candidates: false,
            connectivity_check_timeout,
            multiplex_rtcp: true,
            trickle: TrickleSupport::Half,
        }
    }
}

/// Per-session engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSessionConfig {
    pub type_preferences: TypePreferences,
}

/// Engine's own view of ICE support in a received SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpIceSupport {
    NotSupported,
    Mismatch,
    Supported,
    ReportedMismatch,
    TrickleMismatch,
}

/// Outcome of feeding an SDP to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpInResult {
    pub status: EngineResult<()>,
    pub support: SdpIceSupport,
}

/// Media stream as enumerated by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaStreamDetails {
    pub id: MediaStreamId,
    /// Index of the matching `m=` section in the session's SDP
    pub index_in_sdp: usize,
}

/// Candidate as described by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDetails {
    pub address: SocketAddr,
    pub transport: TransportProtocol,
    pub component: ComponentId,
    pub candidate_type: CandidateType,
    pub local: bool,
    pub priority: u32,
    pub base: Option<CandidateId>,
}

/// Candidate pair as described by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePairDetails {
    pub local: CandidateId,
    pub remote: CandidateId,
    pub valid: bool,
    pub nominated: bool,
}

/// Why gathering finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringReason {
    Undefined,
    CredentialsRequired,
    Completed,
}

/// Final outcome of connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCompleteResult {
    AllSucceeded,
    SomeFailed,
    AllFailed,
}

/// A media transport created from a nominated or default candidate.
///
/// The engine creates it; ownership passes to whoever receives the handle.
pub trait MediaTransport: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> SocketAddr;
}

/// Shared handle to a media transport. With rtcp-mux both components share one.
pub type TransportHandle = Arc<dyn MediaTransport>;

/// Asynchronous notifications posted by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    GatheringCompleted {
        session: EngineSessionId,
        reason: GatheringReason,
    },
    TurnAllocation {
        session: EngineSessionId,
        success: bool,
    },
    SessionCompleted {
        session: EngineSessionId,
        result: SessionCompleteResult,
    },
}

impl EngineEvent {
    pub fn session(&self) -> EngineSessionId {
        match self {
            Self::GatheringCompleted { session, .. }
            | Self::TurnAllocation { session, .. }
            | Self::SessionCompleted { session, .. } => *session,
        }
    }
}

/// Where the engine posts its callbacks.
///
/// Cheap to clone and safe to use from any engine thread; events are queued
/// for the manager's event loop rather than touching session state directly.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event. Returns false once the manager has stopped listening.
    pub fn post(&self, event: EngineEvent) -> bool {
        trace!("Engine event queued: {:?}", event);
        self.tx.send(event).is_ok()
    }

    pub fn gathering_completed(&self, session: EngineSessionId, reason: GatheringReason) -> bool {
        self.post(EngineEvent::GatheringCompleted { session, reason })
    }

    pub fn turn_allocation(&self, session: EngineSessionId, success: bool) -> bool {
        self.post(EngineEvent::TurnAllocation { session, success })
    }

    pub fn session_completed(&self, session: EngineSessionId, result: SessionCompleteResult) -> bool {
        self.post(EngineEvent::SessionCompleted { session, result })
    }
}

/// The ICE toolkit surface used by this crate
pub trait IceEngine: Send + Sync {
    /// Construct the process-wide stack
    fn start(&self, config: &EngineStackConfig, events: EngineEventSink) -> EngineResult<()>;

    /// Destroy the process-wide stack; all sessions become invalid
    fn stop(&self);

    fn create_session(&self, config: &EngineSessionConfig) -> EngineResult<EngineSessionId>;

    /// Session sharing `parent`'s gathered candidates. Freed with the parent.
    fn create_related_session(&self, parent: EngineSessionId) -> EngineResult<EngineSessionId>;

    fn destroy_session(&self, session: EngineSessionId);

    fn set_role(&self, session: EngineSessionId, role: EngineRole) -> EngineResult<()>;

    /// Register a host address for every media stream's RTP candidates
    fn set_local_host_address(&self, session: EngineSessionId, address: IpAddr) -> EngineResult<()>;

    /// Start reflexive (STUN) or relayed (TURN) candidate gathering
    fn gather_reflexive_candidates(
        &self,
        session: EngineSessionId,
        stun: Option<&StunServerConfig>,
        turn: Option<&StunServerConfig>,
    ) -> EngineResult<()>;

    /// Feed an SDP; `remote` distinguishes a peer's offer/answer from our own
    fn sdp_in(&self, session: EngineSessionId, sdp: &Sdp, remote: bool) -> SdpInResult;

    /// Write the session's ICE attributes into an outbound SDP
    fn sdp_out(&self, session: EngineSessionId, sdp: &mut Sdp) -> EngineResult<()>;

    fn generate_credentials(&self, session: EngineSessionId) -> EngineResult<()>;

    /// Begin connectivity checks
    fn proceed(&self, session: EngineSessionId) -> EngineResult<()>;

    fn iteration_begin(&self, session: EngineSessionId) -> EngineResult<()>;

    fn iteration_end(&self, session: EngineSessionId) -> EngineResult<()>;

    fn media_streams(&self, session: EngineSessionId) -> EngineResult<Vec<MediaStreamDetails>>;

    fn candidates(&self, session: EngineSessionId, media: MediaStreamId, local: bool) -> EngineResult<Vec<CandidateId>>;

    fn candidate_details(&self, session: EngineSessionId, candidate: CandidateId) -> EngineResult<CandidateDetails>;

    /// First valid, nominated pair for a component
    fn nominated_pair(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        component: ComponentId,
    ) -> EngineResult<CandidatePairId>;

    fn pair_details(&self, session: EngineSessionId, pair: CandidatePairId) -> EngineResult<CandidatePairDetails>;

    fn add_local_candidate(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        details: &CandidateDetails,
        base: CandidateId,
    ) -> EngineResult<CandidateId>;

    fn create_media_transport(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        component: ComponentId,
    ) -> EngineResult<TransportHandle>;

    /// Transport already bound to a candidate
    fn candidate_transport(&self, session: EngineSessionId, candidate: CandidateId) -> EngineResult<TransportHandle>;

    /// ICE attribute blocks for an SDP: message scope first, then one per media stream
    fn ice_attribute_blocks(&self, sdp: &Sdp) -> EngineResult<Vec<String>>;
}

/// Iteration scope over an engine session. Ends the scope when dropped.
pub(crate) struct IterationScope<'a> {
    engine: &'a dyn IceEngine,
    session: EngineSessionId,
}

impl<'a> IterationScope<'a> {
    pub(crate) fn begin(engine: &'a dyn IceEngine, session: EngineSessionId) -> EngineResult<Self> {
        engine.iteration_begin(session)?;
        Ok(Self { engine, session })
    }
}

impl Drop for IterationScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.iteration_end(self.session) {
            warn!("Failed to end iteration on {}: {}", self.session, e);
        }
    }
}
