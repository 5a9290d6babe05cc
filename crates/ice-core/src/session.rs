//! ICE session state machine
//!
//! An [`IceSession`] is one negotiation attempt for one call leg. It owns an
//! engine session handle (or, for a related session, borrows its parent's
//! gathered state) and tracks SDP snapshots, the resolved server queue and
//! the retry state.
//!
//! Sessions never hold a reference to the engine. Every operation that talks
//! to the engine takes it as an argument, and sessions are only ever reached
//! through the manager's registry.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::candidate::{redact_candidate_raddr, CandidateAttribute, CandidateType, ComponentId, TransportProtocol};
use crate::engine::{
    CandidateDetails, EngineRole, EngineSessionConfig, EngineSessionId, GatheringReason, IceEngine,
    IterationScope, MediaStreamDetails, SdpIceSupport, SessionCompleteResult,
};
use crate::error::{IceError, Result};
use crate::events::{CallbackToken, IceEvent};
use crate::net::{is_private_ipv4, AddressFamily};
use crate::sdp::{MediaDescription, MediaType, Sdp};
use crate::server::{IceProtocol, ServerInfo, StunServerConfig};
use crate::transports::{DefaultTransports, IceSdpAttributes, LocalAddresses, NominatedTransports};

/// Result of the private-host check when no remote candidate was examined
pub const VACUOUS_ALL_PRIVATE_HOST: bool = true;

const RTCP_MUX: &str = "rtcp-mux";

/// Stable identifier of a negotiation, unchanged across server retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceSessionId(pub Uuid);

impl IceSessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IceSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IceSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of this endpoint in the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceRole {
    Offerer,
    Answerer,
    /// Gathers candidates without an offer/answer exchange yet
    Gatherer,
}

impl IceRole {
    fn engine_role(self) -> EngineRole {
        match self {
            Self::Answerer => EngineRole::Answerer,
            Self::Offerer | Self::Gatherer => EngineRole::Offerer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceSessionState {
    Created,
    Gathering,
    GatheringComplete,
    Nominating,
    Complete,
    NominationsFailed,
    Ended,
}

/// Where the negotiation stands with respect to server fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    NotStarted,
    Gathering,
    Retrying,
    Exhausted,
}

/// Classification of a received SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceSupport {
    Unknown,
    NotSupported,
    Mismatch,
    Supported,
    Error,
    ReportedMismatch,
    TrickleMismatch,
}

/// Keep only relay candidates and blank their related address.
///
/// A relay candidate without `raddr` is kept as is. One whose `raddr` cannot
/// be rewritten, or that does not parse, is dropped.
pub fn redact_for_privacy(sdp: &mut Sdp) {
    for media in &mut sdp.media {
        media.attributes.retain_mut(|attr| {
            if !attr.is_candidate() {
                return true;
            }
            let Some(value) = attr.value.as_mut() else {
                return false;
            };
            let candidate = match CandidateAttribute::parse(value) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Dropping unparseable candidate from private SDP: {}", e);
                    return false;
                }
            };
            if candidate.candidate_type != CandidateType::Relayed {
                return false;
            }
            if candidate.related_address.is_none() {
                return true;
            }
            match redact_candidate_raddr(value) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping relay candidate that could not be redacted: {}", e);
                    false
                }
            }
        });
    }
}

/// One ICE negotiation for one call leg
#[derive(Debug)]
pub struct IceSession {
    id: IceSessionId,
    role: IceRole,
    state: IceSessionState,
    engine_handle: Option<EngineSessionId>,
    related: bool,
    parent: Option<IceSessionId>,
    callback_token: CallbackToken,
    turn_queue: Option<VecDeque<IpAddr>>,
    retry: RetryState,
    turn_failure_detected: bool,
    credentials_generated: bool,
    complete_result: Option<SessionCompleteResult>,
    original_sdp: Sdp,
    remote_sdp: Sdp,
    prioritize_privacy: bool,
    public_ipv4: Option<IpAddr>,
    public_ipv6: Option<IpAddr>,
    server: Option<ServerInfo>,
    protocol: IceProtocol,
}

impl IceSession {
    /// Create the engine session and fix the role
    pub(crate) fn create(
        engine: &dyn IceEngine,
        role: IceRole,
        callback_token: CallbackToken,
        config: &EngineSessionConfig,
        prioritize_privacy: bool,
    ) -> Result<Self> {
        let handle = Self::open_engine_session(engine, role, config)?;
        debug!("Created ICE session on {} as {:?}", handle, role);

        Ok(Self {
            id: IceSessionId::new(),
            role,
            state: IceSessionState::Created,
            engine_handle: Some(handle),
            related: false,
            parent: None,
            callback_token,
            turn_queue: None,
            retry: RetryState::NotStarted,
            turn_failure_detected: false,
            credentials_generated: false,
            complete_result: None,
            original_sdp: Sdp::default(),
            remote_sdp: Sdp::default(),
            prioritize_privacy,
            public_ipv4: None,
            public_ipv6: None,
            server: None,
            protocol: IceProtocol::default(),
        })
    }

    fn open_engine_session(
        engine: &dyn IceEngine,
        role: IceRole,
        config: &EngineSessionConfig,
    ) -> Result<EngineSessionId> {
        let handle = engine.create_session(config)?;
        if let Err(e) = engine.set_role(handle, role.engine_role()) {
            engine.destroy_session(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    pub fn id(&self) -> IceSessionId {
        self.id
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn state(&self) -> IceSessionState {
        self.state
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry
    }

    pub fn callback_token(&self) -> CallbackToken {
        self.callback_token
    }

    pub fn engine_handle(&self) -> Option<EngineSessionId> {
        self.engine_handle
    }

    pub fn is_related(&self) -> bool {
        self.related
    }

    pub fn parent(&self) -> Option<IceSessionId> {
        self.parent
    }

    pub fn complete_result(&self) -> Option<SessionCompleteResult> {
        self.complete_result
    }

    pub fn credentials_generated(&self) -> bool {
        self.credentials_generated
    }

    pub fn turn_failure_detected(&self) -> bool {
        self.turn_failure_detected
    }

    /// Resolved server addresses not yet tried; `None` before resolution
    pub fn remaining_servers(&self) -> Option<&VecDeque<IpAddr>> {
        self.turn_queue.as_ref()
    }

    pub fn original_sdp(&self) -> &Sdp {
        &self.original_sdp
    }

    pub fn remote_sdp(&self) -> &Sdp {
        &self.remote_sdp
    }

    pub(crate) fn server(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    pub(crate) fn set_callback_token(&mut self, token: CallbackToken) {
        self.callback_token = token;
    }

    pub(crate) fn set_retry(&mut self, retry: RetryState) {
        self.retry = retry;
    }

    pub(crate) fn set_public_addresses(&mut self, ipv4: Option<IpAddr>, ipv6: Option<IpAddr>) {
        self.public_ipv4 = ipv4;
        self.public_ipv6 = ipv6;
    }

    pub(crate) fn set_server(&mut self, server: Option<ServerInfo>, protocol: IceProtocol) {
        self.server = server;
        self.protocol = protocol;
    }

    pub(crate) fn set_original_sdp(&mut self, sdp: Sdp) {
        self.original_sdp = sdp;
    }

    pub(crate) fn set_remote_sdp(&mut self, sdp: Sdp) {
        self.remote_sdp = sdp;
    }

    pub(crate) fn set_turn_queue(&mut self, addresses: Vec<IpAddr>) {
        self.turn_queue = Some(addresses.into());
    }

    fn handle(&self, operation: &'static str) -> Result<EngineSessionId> {
        self.engine_handle
            .ok_or_else(|| IceError::protocol_state(operation, format!("session {} has no engine session", self.id)))
    }

    /// Feed a remote offer or answer and classify its ICE support
    pub fn sdp_received(&mut self, engine: &dyn IceEngine, sdp: &Sdp) -> IceSupport {
        let Some(handle) = self.engine_handle else {
            warn!("SDP received on ended session {}", self.id);
            return IceSupport::Error;
        };

        let result = engine.sdp_in(handle, sdp, true);
        let support = match (result.support, &result.status) {
            (SdpIceSupport::Supported, Ok(())) => IceSupport::Supported,
            (SdpIceSupport::Supported, Err(e)) => {
                warn!("Engine rejected ICE SDP on session {}: {}", self.id, e);
                IceSupport::Error
            }
            (SdpIceSupport::NotSupported, _) => IceSupport::NotSupported,
            (SdpIceSupport::Mismatch, _) => IceSupport::Mismatch,
            (SdpIceSupport::ReportedMismatch, _) => IceSupport::ReportedMismatch,
            (SdpIceSupport::TrickleMismatch, _) => IceSupport::TrickleMismatch,
        };

        if support == IceSupport::Supported {
            self.remote_sdp = sdp.clone();
        }
        debug!("Session {} classified remote SDP as {:?}", self.id, support);
        support
    }

    /// Mark our own offer as ICE-capable
    pub fn sdp_ice_support_add(&self, engine: &dyn IceEngine, sdp: &Sdp) -> Result<()> {
        let handle = self.handle("sdp_ice_support_add")?;
        engine.sdp_in(handle, sdp, false).status?;
        Ok(())
    }

    /// Write our candidates into an outbound SDP
    pub fn sdp_update(&self, engine: &dyn IceEngine, sdp: &mut Sdp) -> Result<()> {
        let handle = self.handle("sdp_update")?;
        engine.sdp_out(handle, sdp)?;
        if self.prioritize_privacy {
            redact_for_privacy(sdp);
        }
        Ok(())
    }

    /// Start connectivity checks
    pub fn proceed(&mut self, engine: &dyn IceEngine) -> Result<()> {
        let handle = self.handle("proceed")?;
        engine.proceed(handle)?;
        self.state = IceSessionState::Nominating;
        info!("Session {} started connectivity checks", self.id);
        Ok(())
    }

    fn media_for<'a>(&self, sdp: &'a Sdp, stream: &MediaStreamDetails) -> Result<&'a MediaDescription> {
        sdp.media_descriptor(stream.index_in_sdp).ok_or_else(|| {
            IceError::protocol_state(
                "media lookup",
                format!("media stream {} has no m= line at index {}", stream.id, stream.index_in_sdp),
            )
        })
    }

    fn rtcp_mux(&self, media: &MediaDescription) -> bool {
        self.remote_sdp.media_type_contains_attribute(&media.media, RTCP_MUX)
    }

    /// Nominated transports after every component succeeded.
    ///
    /// Transport handles are created here and owned by the caller.
    pub fn nominations_get(&self, engine: &dyn IceEngine, with_attributes: bool) -> Result<NominatedTransports> {
        if self.complete_result != Some(SessionCompleteResult::AllSucceeded) {
            return Err(IceError::protocol_state(
                "nominations_get",
                format!("connectivity checks not successful ({:?})", self.complete_result),
            ));
        }
        let handle = self.handle("nominations_get")?;
        let _scope = IterationScope::begin(engine, handle)?;

        let mut out = NominatedTransports::default();
        for stream in engine.media_streams(handle)? {
            let media = self.media_for(&self.original_sdp, &stream)?;
            let media_type = media.media_type();
            let Some(slot) = out.get_mut(media_type) else {
                debug!("Skipping nominations for unsupported media '{}'", media.media);
                continue;
            };
            let rtcp_mux = self.rtcp_mux(media);

            let rtp_pair = engine.pair_details(handle, engine.nominated_pair(handle, stream.id, ComponentId::Rtp)?)?;
            let rtcp_pair = if rtcp_mux {
                None
            } else {
                Some(engine.pair_details(handle, engine.nominated_pair(handle, stream.id, ComponentId::Rtcp)?)?)
            };

            let rtp_local = engine.candidate_details(handle, rtp_pair.local)?;
            let rtp_remote = engine.candidate_details(handle, rtp_pair.remote)?;
            let rtp = engine.create_media_transport(handle, stream.id, ComponentId::Rtp)?;

            slot.local.rtp_local = Some(rtp_local.address);
            slot.local.rtp_remote = Some(rtp_remote.address);
            slot.local.rtp_kind = rtp_local.candidate_type.into();
            slot.remote.rtp = Some(rtp_remote.address);

            match rtcp_pair {
                Some(pair) => {
                    let rtcp_local = engine.candidate_details(handle, pair.local)?;
                    let rtcp_remote = engine.candidate_details(handle, pair.remote)?;
                    slot.local.rtcp = Some(engine.create_media_transport(handle, stream.id, ComponentId::Rtcp)?);
                    slot.local.rtcp_owned = true;
                    slot.local.rtcp_local = Some(rtcp_local.address);
                    slot.local.rtcp_remote = Some(rtcp_remote.address);
                    slot.local.rtcp_kind = rtcp_local.candidate_type.into();
                    slot.remote.rtcp = Some(rtcp_remote.address);
                }
                None => {
                    slot.local.rtcp = Some(rtp.clone());
                    slot.local.rtcp_owned = false;
                    slot.local.rtcp_local = Some(rtp_local.address);
                    slot.local.rtcp_remote = Some(rtp_remote.address);
                    slot.local.rtcp_kind = slot.local.rtp_kind;
                    slot.remote.rtcp = Some(rtp_remote.address);
                }
            }

            slot.local.rtp = Some(rtp);
            slot.local.rtcp_mux = rtcp_mux;
            slot.local.valid = true;
            slot.remote.valid = true;
            debug!(
                "Nominated {:?}: {} -> {} ({:?}, mux={})",
                media_type, rtp_local.address, rtp_remote.address, slot.local.rtp_kind, rtcp_mux
            );
        }

        if with_attributes {
            let mut blocks = engine.ice_attribute_blocks(&self.original_sdp)?.into_iter();
            let message = blocks.next().map(|b| Sdp::from_attribute_block(&b)).unwrap_or_default();
            let media = blocks.map(|b| Sdp::from_attribute_block(&b)).collect();
            out.attributes = Some(IceSdpAttributes { message, media });
        }

        Ok(out)
    }

    /// Transports matching each media description's default address:port,
    /// for calls that fall back to plain offer/answer
    pub fn default_transports_get(&self, engine: &dyn IceEngine, sdp: &Sdp) -> Result<DefaultTransports> {
        let handle = self.handle("default_transports_get")?;
        let _scope = IterationScope::begin(engine, handle)?;

        let session_address = sdp.connection.as_deref().unwrap_or("0.0.0.0");
        let mut out = DefaultTransports::default();

        for stream in engine.media_streams(handle)? {
            let media = self.media_for(sdp, &stream)?;
            let Some(slot) = out.get_mut(media.media_type()) else {
                continue;
            };

            let address = match media.connection.as_deref() {
                Some(c) if !c.starts_with('0') => c,
                _ => session_address,
            };
            let ip: IpAddr = address
                .parse()
                .map_err(|_| IceError::invalid_parameter(format!("bad connection address '{}'", address)))?;
            let rtp_addr = SocketAddr::new(ip, media.port);
            let rtcp_addr = SocketAddr::new(ip, media.rtcp_port.unwrap_or_else(|| media.port.saturating_add(1)));
            let rtcp_mux = !self.remote_sdp.is_empty() && self.rtcp_mux(media);

            for candidate in engine.candidates(handle, stream.id, true)? {
                let details = engine.candidate_details(handle, candidate)?;
                let is_rtp = details.address == rtp_addr;
                let is_rtcp = !rtcp_mux && details.address == rtcp_addr;
                if !is_rtp && !is_rtcp {
                    continue;
                }

                let component = if is_rtp { ComponentId::Rtp } else { ComponentId::Rtcp };
                let transport = match engine.create_media_transport(handle, stream.id, component) {
                    Ok(t) => t,
                    Err(e) => {
                        debug!("Falling back to candidate transport for {}: {}", details.address, e);
                        engine.candidate_transport(handle, candidate)?
                    }
                };

                if is_rtp {
                    slot.rtp_local = Some(details.address);
                    slot.rtp_kind = details.candidate_type.into();
                    if rtcp_mux {
                        slot.rtcp = Some(transport.clone());
                        slot.rtcp_owned = false;
                        slot.rtcp_local = Some(details.address);
                        slot.rtcp_kind = slot.rtp_kind;
                    }
                    slot.rtp = Some(transport);
                    slot.valid = true;
                } else {
                    slot.rtcp = Some(transport);
                    slot.rtcp_owned = true;
                    slot.rtcp_local = Some(details.address);
                    slot.rtcp_kind = details.candidate_type.into();
                }
            }
            slot.rtcp_mux = rtcp_mux;
        }

        Ok(out)
    }

    /// Host candidate addresses per media and component
    pub fn local_addresses_get(&self, engine: &dyn IceEngine) -> Result<LocalAddresses> {
        let handle = self.handle("local_addresses_get")?;
        let _scope = IterationScope::begin(engine, handle)?;

        let mut out = LocalAddresses::default();
        for stream in engine.media_streams(handle)? {
            let media = self.media_for(&self.original_sdp, &stream)?;
            let rtcp_mux = self.rtcp_mux(media);
            let Some(slot) = out.get_mut(media.media_type()) else {
                continue;
            };

            for candidate in engine.candidates(handle, stream.id, true)? {
                let details = engine.candidate_details(handle, candidate)?;
                if details.candidate_type != CandidateType::Host {
                    continue;
                }
                match details.component {
                    ComponentId::Rtp => {
                        slot.rtp = Some(details.address);
                        if rtcp_mux {
                            slot.rtcp = Some(details.address);
                        }
                    }
                    ComponentId::Rtcp => slot.rtcp = Some(details.address),
                }
            }
        }
        Ok(out)
    }

    /// Add a server-reflexive candidate on `public_ip` for every host
    /// candidate of the same family. Returns how many were added.
    pub fn server_reflexive_ports_add(&self, engine: &dyn IceEngine, public_ip: IpAddr) -> Result<usize> {
        let handle = self.handle("server_reflexive_ports_add")?;
        let family = AddressFamily::of(&public_ip);

        let mut hosts = Vec::new();
        {
            let _scope = IterationScope::begin(engine, handle)?;
            for stream in engine.media_streams(handle)? {
                for candidate in engine.candidates(handle, stream.id, true)? {
                    let details = engine.candidate_details(handle, candidate)?;
                    if details.candidate_type == CandidateType::Host
                        && AddressFamily::of(&details.address.ip()) == family
                    {
                        hosts.push((stream.id, candidate, details));
                    }
                }
            }
        }

        for (media, base, host) in &hosts {
            let reflexive = CandidateDetails {
                address: SocketAddr::new(public_ip, host.address.port()),
                transport: TransportProtocol::Udp,
                component: host.component,
                candidate_type: CandidateType::ServerReflexive,
                local: true,
                priority: 0,
                base: Some(*base),
            };
            engine.add_local_candidate(handle, *media, &reflexive, *base)?;
            debug!("Added server-reflexive {} based on {}", reflexive.address, host.address);
        }
        Ok(hosts.len())
    }

    /// True when every remote audio/video candidate is an IPv4 host address
    /// in a private range. IPv6 host candidates are not considered.
    pub fn all_remote_candidates_are_private_host(&self, engine: &dyn IceEngine) -> Result<bool> {
        let handle = self.handle("all_remote_candidates_are_private_host")?;
        let _scope = IterationScope::begin(engine, handle)?;

        let mut examined = false;
        for stream in engine.media_streams(handle)? {
            let media = self.media_for(&self.original_sdp, &stream)?;
            if !matches!(media.media_type(), MediaType::Audio | MediaType::Video) {
                continue;
            }

            for candidate in engine.candidates(handle, stream.id, false)? {
                let details = engine.candidate_details(handle, candidate)?;
                match (details.candidate_type, details.address.ip()) {
                    (CandidateType::Host, IpAddr::V4(ip)) => {
                        if !is_private_ipv4(&ip) {
                            return Ok(false);
                        }
                        examined = true;
                    }
                    (CandidateType::Host, IpAddr::V6(_)) | (CandidateType::Undefined, _) => {}
                    _ => return Ok(false),
                }
            }
        }

        Ok(if examined { true } else { VACUOUS_ALL_PRIVATE_HOST })
    }

    /// Sub-session for a forked call leg, sharing this session's candidates
    pub fn related_session_start(&self, engine: &dyn IceEngine, callback_token: CallbackToken) -> Result<IceSession> {
        let parent = self.handle("related_session_start")?;
        let handle = engine.create_related_session(parent)?;
        info!("Started related session on {} (parent {})", handle, self.id);

        Ok(Self {
            id: IceSessionId::new(),
            role: self.role,
            state: IceSessionState::GatheringComplete,
            engine_handle: Some(handle),
            related: true,
            parent: Some(self.id),
            callback_token,
            turn_queue: None,
            retry: RetryState::NotStarted,
            turn_failure_detected: false,
            // Credentials belong to the parent's gathering.
            credentials_generated: true,
            complete_result: None,
            original_sdp: self.original_sdp.clone(),
            remote_sdp: self.remote_sdp.clone(),
            prioritize_privacy: self.prioritize_privacy,
            public_ipv4: self.public_ipv4,
            public_ipv6: self.public_ipv6,
            server: self.server.clone(),
            protocol: self.protocol,
        })
    }

    /// Local candidates, for diagnostics
    pub fn candidates_list(&self, engine: &dyn IceEngine) -> Result<Vec<CandidateDetails>> {
        let handle = self.handle("candidates_list")?;
        let _scope = IterationScope::begin(engine, handle)?;

        let mut out = Vec::new();
        for stream in engine.media_streams(handle)? {
            for candidate in engine.candidates(handle, stream.id, true)? {
                out.push(engine.candidate_details(handle, candidate)?);
            }
        }
        Ok(out)
    }

    /// Generate credentials unless this engine session already has them
    pub(crate) fn generate_credentials_once(&mut self, engine: &dyn IceEngine) -> Result<()> {
        if self.credentials_generated {
            debug!("Credentials already generated for session {}", self.id);
            return Ok(());
        }
        let handle = self.handle("generate_credentials")?;
        engine.generate_credentials(handle)?;
        self.credentials_generated = true;
        Ok(())
    }

    fn register_host_addresses(&self, engine: &dyn IceEngine, handle: EngineSessionId, local_ips: &[IpAddr]) -> Result<()> {
        for ip in local_ips {
            engine.set_local_host_address(handle, *ip)?;
        }
        Ok(())
    }

    /// Begin gathering against the next queued server address
    pub(crate) fn start_gathering(&mut self, engine: &dyn IceEngine, local_ips: &[IpAddr]) -> Result<()> {
        let handle = self.handle("start_gathering")?;
        let server = self
            .server
            .clone()
            .ok_or_else(|| IceError::protocol_state("start_gathering", "no server configured"))?;
        let queue = self
            .turn_queue
            .as_mut()
            .ok_or_else(|| IceError::protocol_state("start_gathering", "server addresses not resolved"))?;

        let Some(ip) = queue.pop_front() else {
            self.retry = RetryState::Exhausted;
            return Err(IceError::server_busy(format!("no addresses left for {}", server.address)));
        };

        self.register_host_addresses(engine, handle, local_ips)?;

        let config = StunServerConfig::for_attempt(ip, &server, self.protocol);
        self.turn_failure_detected = false;
        match self.protocol {
            IceProtocol::Stun => engine.gather_reflexive_candidates(handle, Some(&config), None)?,
            IceProtocol::Turn => engine.gather_reflexive_candidates(handle, None, Some(&config))?,
        }
        info!("Session {} gathering via {:?} server {}", self.id, self.protocol, config.address);

        self.state = IceSessionState::Gathering;
        if self.retry == RetryState::NotStarted {
            self.retry = RetryState::Gathering;
        }
        self.generate_credentials_once(engine)
    }

    /// Host candidates plus synthesized server-reflexive ones; no server involved
    pub(crate) fn gather_without_server(&mut self, engine: &dyn IceEngine, local_ips: &[IpAddr]) -> Result<()> {
        let handle = self.handle("gather_without_server")?;

        // Only families we know a public address for are advertised.
        let advertised: Vec<(IpAddr, IpAddr)> = local_ips
            .iter()
            .filter_map(|local| {
                let public = match local {
                    IpAddr::V4(_) => self.public_ipv4,
                    IpAddr::V6(_) => self.public_ipv6,
                };
                public.map(|p| (*local, p))
            })
            .collect();

        for (local, _) in &advertised {
            engine.set_local_host_address(handle, *local)?;
        }
        for (local, public) in &advertised {
            if local != public {
                self.server_reflexive_ports_add(engine, *public)?;
            }
        }

        self.state = IceSessionState::GatheringComplete;
        self.generate_credentials_once(engine)
    }

    /// Feed the stored SDP to a freshly opened engine session
    pub(crate) fn reapply_sdp(&mut self, engine: &dyn IceEngine) -> Result<()> {
        let sdp = self.original_sdp.clone();
        match self.role {
            IceRole::Answerer => match self.sdp_received(engine, &sdp) {
                IceSupport::Supported => Ok(()),
                other => Err(IceError::protocol_state(
                    "reapply_sdp",
                    format!("stored offer no longer classified as ICE ({:?})", other),
                )),
            },
            IceRole::Offerer | IceRole::Gatherer => self.sdp_ice_support_add(engine, &sdp),
        }
    }

    /// Destroy the current engine session and open a fresh one with the same role
    pub(crate) fn replace_engine_session(&mut self, engine: &dyn IceEngine, config: &EngineSessionConfig) -> Result<EngineSessionId> {
        if let Some(old) = self.engine_handle.take() {
            engine.destroy_session(old);
            debug!("Destroyed {} for session {} before retry", old, self.id);
        }
        self.credentials_generated = false;
        self.turn_failure_detected = false;
        self.complete_result = None;
        self.state = IceSessionState::Created;

        let handle = Self::open_engine_session(engine, self.role, config)?;
        self.engine_handle = Some(handle);
        Ok(handle)
    }

    pub(crate) fn on_gathering_completed(&mut self, reason: GatheringReason) -> Option<IceEvent> {
        if reason != GatheringReason::Completed {
            error!("Session {} gathering finished with unexpected reason {:?}", self.id, reason);
        }

        if matches!(
            self.state,
            IceSessionState::Nominating
                | IceSessionState::Complete
                | IceSessionState::NominationsFailed
                | IceSessionState::Ended
        ) {
            debug!("Session {} ignoring late gathering result in {:?}", self.id, self.state);
            return None;
        }

        let token = self.callback_token;
        if self.turn_failure_detected {
            info!("Session {} TURN allocation failed, trying another server", self.id);
            Some(IceEvent::GatheringTryingAnother { token })
        } else {
            self.state = IceSessionState::GatheringComplete;
            Some(IceEvent::GatheringComplete { token })
        }
    }

    pub(crate) fn on_turn_allocation(&mut self, success: bool) {
        if !success {
            warn!("TURN allocation failed for session {}", self.id);
            self.turn_failure_detected = true;
        }
    }

    pub(crate) fn on_session_completed(&mut self, result: SessionCompleteResult) -> Option<IceEvent> {
        self.complete_result = Some(result);
        if self.state == IceSessionState::Complete {
            debug!("Session {} already complete, recording {:?}", self.id, result);
            return None;
        }

        let token = self.callback_token;
        if result == SessionCompleteResult::AllSucceeded {
            self.state = IceSessionState::Complete;
            Some(IceEvent::NominationsComplete { token, success: true })
        } else {
            self.state = IceSessionState::NominationsFailed;
            Some(IceEvent::NominationsComplete { token, success: false })
        }
    }

    /// Release the engine session (unless borrowed) and invalidate
    pub fn end(&mut self, engine: &dyn IceEngine) {
        if let Some(handle) = self.engine_handle.take() {
            if !self.related {
                engine.destroy_session(handle);
            }
            debug!("Ended session {} ({})", self.id, handle);
        }
        self.state = IceSessionState::Ended;
    }

    /// Drop a borrowed handle whose owner has gone away
    pub(crate) fn invalidate(&mut self) {
        self.engine_handle = None;
        self.state = IceSessionState::Ended;
    }
}
