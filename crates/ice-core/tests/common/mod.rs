// Shared helpers for ICE manager integration tests
//
// `MockEngine` records every call the manager makes and lets tests post
// engine callbacks through the captured event sink.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use vpe_ice_core::engine::{
    CandidateDetails, CandidateId, CandidatePairDetails, CandidatePairId, EngineEventSink, EngineResult, EngineRole,
    EngineSessionConfig, EngineSessionId, EngineStackConfig, GatheringReason, IceEngine, MediaStreamDetails,
    MediaStreamId, MediaTransport, SdpIceSupport, SdpInResult, SessionCompleteResult, TransportHandle,
};
use vpe_ice_core::{
    CallbackToken, CandidateAttribute, CandidateType, ComponentId, EngineError, HostResolver, IceError, IceEvent,
    IceEventSubscriber, IceManager, IceManagerConfig, MediaDescription, Sdp, SdpAttribute, StaticAddressSource,
    StunServerConfig, TransportProtocol,
};

pub const LOCAL_IPV4: &str = "192.168.1.20";
pub const PUBLIC_IPV4: &str = "203.0.113.50";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[derive(Debug)]
pub struct MockTransport {
    addr: SocketAddr,
}

impl MediaTransport for MockTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[derive(Debug, Clone)]
pub struct GatherCall {
    pub session: EngineSessionId,
    pub stun: Option<StunServerConfig>,
    pub turn: Option<StunServerConfig>,
}

#[derive(Debug, Default)]
struct MockSession {
    role: Option<EngineRole>,
    config: EngineSessionConfig,
    parent: Option<EngineSessionId>,
    streams: Vec<MediaStreamDetails>,
    next_port: u16,
    credentials: bool,
}

#[derive(Debug, Clone)]
struct MockCandidate {
    owner: EngineSessionId,
    media: MediaStreamId,
    details: CandidateDetails,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    sink: Option<EngineEventSink>,
    stack: Option<EngineStackConfig>,
    stopped: bool,
    sessions: HashMap<EngineSessionId, MockSession>,
    created: Vec<EngineSessionId>,
    destroyed: Vec<EngineSessionId>,
    credential_calls: Vec<EngineSessionId>,
    gather_calls: Vec<GatherCall>,
    candidates: BTreeMap<CandidateId, MockCandidate>,
    pairs: Vec<(EngineSessionId, MediaStreamId, ComponentId, CandidatePairId, CandidatePairDetails)>,
    outbound_candidates: Option<Vec<String>>,
    failing: HashSet<&'static str>,
    fail_media_transport: bool,
    iterations_open: i64,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Session whose candidates a handle sees (the parent for related sessions)
    fn owner(&self, handle: EngineSessionId) -> EngineResult<EngineSessionId> {
        let session = self
            .sessions
            .get(&handle)
            .ok_or(EngineError::new("lookup", -1))?;
        Ok(session.parent.unwrap_or(handle))
    }

    fn check(&mut self, op: &'static str) -> EngineResult<()> {
        if self.failing.remove(op) {
            Err(EngineError::new(op, -99))
        } else {
            Ok(())
        }
    }

    fn add_candidate(&mut self, owner: EngineSessionId, media: MediaStreamId, details: CandidateDetails) -> CandidateId {
        let id = CandidateId(self.next());
        self.candidates.insert(id, MockCandidate { owner, media, details });
        id
    }
}

/// Recording in-memory engine
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sink(&self) -> EngineEventSink {
        self.state.lock().unwrap().sink.clone().expect("engine not started")
    }

    pub fn stack_config(&self) -> Option<EngineStackConfig> {
        self.state.lock().unwrap().stack.clone()
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn created(&self) -> Vec<EngineSessionId> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn destroyed(&self) -> Vec<EngineSessionId> {
        self.state.lock().unwrap().destroyed.clone()
    }

    /// Non-related engine sessions created and not yet destroyed
    pub fn live_owned_sessions(&self) -> Vec<EngineSessionId> {
        let state = self.state.lock().unwrap();
        let mut live: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.parent.is_none())
            .map(|(h, _)| *h)
            .collect();
        live.sort();
        live
    }

    pub fn latest_session(&self) -> EngineSessionId {
        *self.state.lock().unwrap().created.last().expect("no session created")
    }

    pub fn session_config(&self, handle: EngineSessionId) -> Option<EngineSessionConfig> {
        self.state.lock().unwrap().sessions.get(&handle).map(|s| s.config.clone())
    }

    pub fn role(&self, handle: EngineSessionId) -> Option<EngineRole> {
        self.state.lock().unwrap().sessions.get(&handle).and_then(|s| s.role)
    }

    pub fn credential_calls(&self) -> Vec<EngineSessionId> {
        self.state.lock().unwrap().credential_calls.clone()
    }

    pub fn gather_calls(&self) -> Vec<GatherCall> {
        self.state.lock().unwrap().gather_calls.clone()
    }

    pub fn open_iterations(&self) -> i64 {
        self.state.lock().unwrap().iterations_open
    }

    /// Make the next call to `op` fail
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn fail_media_transports(&self, fail: bool) {
        self.state.lock().unwrap().fail_media_transport = fail;
    }

    /// Candidate lines `sdp_out` writes into every media section
    pub fn set_outbound_candidates(&self, lines: Vec<String>) {
        self.state.lock().unwrap().outbound_candidates = Some(lines);
    }

    pub fn local_candidates(&self, handle: EngineSessionId) -> Vec<CandidateDetails> {
        let state = self.state.lock().unwrap();
        let Ok(owner) = state.owner(handle) else {
            return Vec::new();
        };
        state
            .candidates
            .values()
            .filter(|c| c.owner == owner && c.details.local)
            .map(|c| c.details.clone())
            .collect()
    }

    /// Nominate a pair per component of every stream, remote side on `remote_ip`
    pub fn nominate(&self, handle: EngineSessionId, remote_ip: IpAddr, rtcp: bool) {
        let mut state = self.state.lock().unwrap();
        let owner = state.owner(handle).unwrap();
        let streams = state.sessions[&owner].streams.clone();

        for (i, stream) in streams.iter().enumerate() {
            let rtp_local = state
                .candidates
                .iter()
                .find(|(_, c)| c.owner == owner && c.media == stream.id && c.details.local)
                .map(|(id, c)| (*id, c.details.clone()))
                .expect("stream has no local candidate");

            let mut components = vec![(ComponentId::Rtp, rtp_local.0, rtp_local.1.address)];
            if rtcp {
                let rtcp_addr = SocketAddr::new(rtp_local.1.address.ip(), rtp_local.1.address.port() + 1);
                let rtcp_local = state.add_candidate(
                    owner,
                    stream.id,
                    CandidateDetails {
                        address: rtcp_addr,
                        component: ComponentId::Rtcp,
                        ..rtp_local.1.clone()
                    },
                );
                components.push((ComponentId::Rtcp, rtcp_local, rtcp_addr));
            }

            for (component, local, _) in components {
                let port = 50_000 + (i as u16) * 2 + if component == ComponentId::Rtcp { 1 } else { 0 };
                let remote = state.add_candidate(
                    owner,
                    stream.id,
                    CandidateDetails {
                        address: SocketAddr::new(remote_ip, port),
                        transport: TransportProtocol::Udp,
                        component,
                        candidate_type: CandidateType::Host,
                        local: false,
                        priority: 1,
                        base: None,
                    },
                );
                let pair_id = CandidatePairId(state.next());
                state.pairs.push((
                    owner,
                    stream.id,
                    component,
                    pair_id,
                    CandidatePairDetails {
                        local,
                        remote,
                        valid: true,
                        nominated: true,
                    },
                ));
            }
        }
    }

    pub fn complete_gathering(&self, handle: EngineSessionId, turn_ok: bool) {
        let sink = self.sink();
        if !turn_ok {
            assert!(sink.turn_allocation(handle, false));
        }
        assert!(sink.gathering_completed(handle, GatheringReason::Completed));
    }

    pub fn complete_checks(&self, handle: EngineSessionId, result: SessionCompleteResult) {
        assert!(self.sink().session_completed(handle, result));
    }
}

fn has_ice_markers(sdp: &Sdp) -> bool {
    sdp.attributes.iter().any(|a| a.name == "ice-ufrag")
        || sdp.media.iter().any(|m| m.has_attribute("ice-ufrag"))
}

fn format_candidate(id: CandidateId, details: &CandidateDetails, base: Option<SocketAddr>) -> String {
    let transport = match details.transport {
        TransportProtocol::Udp => "UDP",
        TransportProtocol::Tcp => "TCP",
    };
    let mut line = format!(
        "{} {} {} {} {} {} typ {}",
        id.0,
        details.component.as_u32(),
        transport,
        details.priority,
        details.address.ip(),
        details.address.port(),
        details.candidate_type.sdp_token()
    );
    if let Some(base) = base {
        line.push_str(&format!(" raddr {} rport {}", base.ip(), base.port()));
    }
    line
}

impl IceEngine for MockEngine {
    fn start(&self, config: &EngineStackConfig, events: EngineEventSink) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("start")?;
        state.stack = Some(config.clone());
        state.sink = Some(events);
        state.stopped = false;
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.sink = None;
        // Stopping the stack releases every session it still holds.
        state.sessions.clear();
        state.candidates.clear();
        state.pairs.clear();
    }

    fn create_session(&self, config: &EngineSessionConfig) -> EngineResult<EngineSessionId> {
        let mut state = self.state.lock().unwrap();
        state.check("create_session")?;
        let handle = EngineSessionId(state.next());
        state.sessions.insert(
            handle,
            MockSession {
                config: config.clone(),
                next_port: 40_000,
                ..MockSession::default()
            },
        );
        state.created.push(handle);
        Ok(handle)
    }

    fn create_related_session(&self, parent: EngineSessionId) -> EngineResult<EngineSessionId> {
        let mut state = self.state.lock().unwrap();
        state.check("create_related_session")?;
        let owner = state.owner(parent)?;
        let handle = EngineSessionId(state.next());
        state.sessions.insert(
            handle,
            MockSession {
                parent: Some(owner),
                ..MockSession::default()
            },
        );
        Ok(handle)
    }

    fn destroy_session(&self, session: EngineSessionId) {
        let mut state = self.state.lock().unwrap();
        if state.sessions.remove(&session).is_some() {
            state.destroyed.push(session);
            state.candidates.retain(|_, c| c.owner != session);
            state.sessions.retain(|_, s| s.parent != Some(session));
        }
    }

    fn set_role(&self, session: EngineSessionId, role: EngineRole) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("set_role")?;
        state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::new("set_role", -1))?
            .role = Some(role);
        Ok(())
    }

    fn set_local_host_address(&self, session: EngineSessionId, address: IpAddr) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("set_local_host_address")?;
        let owner = state.owner(session)?;
        let streams = state.sessions[&owner].streams.clone();
        for stream in streams {
            let port = {
                let s = state.sessions.get_mut(&owner).unwrap();
                let port = s.next_port;
                s.next_port += 2;
                port
            };
            state.add_candidate(
                owner,
                stream.id,
                CandidateDetails {
                    address: SocketAddr::new(address, port),
                    transport: TransportProtocol::Udp,
                    component: ComponentId::Rtp,
                    candidate_type: CandidateType::Host,
                    local: true,
                    priority: 2_130_706_431,
                    base: None,
                },
            );
        }
        Ok(())
    }

    fn gather_reflexive_candidates(
        &self,
        session: EngineSessionId,
        stun: Option<&StunServerConfig>,
        turn: Option<&StunServerConfig>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("gather_reflexive_candidates")?;
        state.gather_calls.push(GatherCall {
            session,
            stun: stun.cloned(),
            turn: turn.cloned(),
        });
        Ok(())
    }

    fn sdp_in(&self, session: EngineSessionId, sdp: &Sdp, remote: bool) -> SdpInResult {
        let mut state = self.state.lock().unwrap();
        let support = if !remote || has_ice_markers(sdp) {
            SdpIceSupport::Supported
        } else {
            SdpIceSupport::NotSupported
        };
        let status = state.check("sdp_in");
        let Ok(owner) = state.owner(session) else {
            return SdpInResult {
                status: Err(EngineError::new("sdp_in", -1)),
                support,
            };
        };

        if state.sessions[&owner].streams.is_empty() {
            let mut streams = Vec::new();
            for index in 0..sdp.media.len() {
                streams.push(MediaStreamDetails {
                    id: MediaStreamId(state.next()),
                    index_in_sdp: index,
                });
            }
            state.sessions.get_mut(&owner).unwrap().streams = streams;
        }

        if remote {
            let streams = state.sessions[&owner].streams.clone();
            for (stream, media) in streams.iter().zip(&sdp.media) {
                for value in media.candidates() {
                    if let Ok(c) = CandidateAttribute::parse(value) {
                        state.add_candidate(
                            owner,
                            stream.id,
                            CandidateDetails {
                                address: c.socket_addr(),
                                transport: c.transport,
                                component: c.component().unwrap_or(ComponentId::Rtp),
                                candidate_type: c.candidate_type,
                                local: false,
                                priority: c.priority,
                                base: None,
                            },
                        );
                    }
                }
            }
        }

        SdpInResult { status, support }
    }

    fn sdp_out(&self, session: EngineSessionId, sdp: &mut Sdp) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("sdp_out")?;
        let owner = state.owner(session)?;
        let (credentials, streams) = {
            let s = &state.sessions[&owner];
            (s.credentials, s.streams.clone())
        };

        if credentials {
            sdp.attributes.push(SdpAttribute::new("ice-ufrag", format!("u{}", owner.0)));
            sdp.attributes.push(SdpAttribute::new("ice-pwd", format!("p{}", owner.0)));
        }

        for (stream, media) in streams.iter().zip(sdp.media.iter_mut()) {
            let lines: Vec<String> = match &state.outbound_candidates {
                Some(lines) => lines.clone(),
                None => state
                    .candidates
                    .iter()
                    .filter(|(_, c)| c.owner == owner && c.media == stream.id && c.details.local)
                    .map(|(id, c)| {
                        let base = c
                            .details
                            .base
                            .and_then(|b| state.candidates.get(&b))
                            .map(|b| b.details.address);
                        format_candidate(*id, &c.details, base)
                    })
                    .collect(),
            };
            for line in lines {
                media.attributes.push(SdpAttribute::new("candidate", line));
            }
        }
        Ok(())
    }

    fn generate_credentials(&self, session: EngineSessionId) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("generate_credentials")?;
        state.credential_calls.push(session);
        let s = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::new("generate_credentials", -1))?;
        if s.credentials {
            return Err(EngineError::new("generate_credentials", -7));
        }
        s.credentials = true;
        Ok(())
    }

    fn proceed(&self, session: EngineSessionId) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check("proceed")?;
        state.owner(session).map(|_| ())
    }

    fn iteration_begin(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.state.lock().unwrap().iterations_open += 1;
        Ok(())
    }

    fn iteration_end(&self, _session: EngineSessionId) -> EngineResult<()> {
        self.state.lock().unwrap().iterations_open -= 1;
        Ok(())
    }

    fn media_streams(&self, session: EngineSessionId) -> EngineResult<Vec<MediaStreamDetails>> {
        let state = self.state.lock().unwrap();
        let owner = state.owner(session)?;
        Ok(state.sessions[&owner].streams.clone())
    }

    fn candidates(&self, session: EngineSessionId, media: MediaStreamId, local: bool) -> EngineResult<Vec<CandidateId>> {
        let state = self.state.lock().unwrap();
        let owner = state.owner(session)?;
        Ok(state
            .candidates
            .iter()
            .filter(|(_, c)| c.owner == owner && c.media == media && c.details.local == local)
            .map(|(id, _)| *id)
            .collect())
    }

    fn candidate_details(&self, _session: EngineSessionId, candidate: CandidateId) -> EngineResult<CandidateDetails> {
        let state = self.state.lock().unwrap();
        state
            .candidates
            .get(&candidate)
            .map(|c| c.details.clone())
            .ok_or(EngineError::new("candidate_details", -1))
    }

    fn nominated_pair(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        component: ComponentId,
    ) -> EngineResult<CandidatePairId> {
        let state = self.state.lock().unwrap();
        let owner = state.owner(session)?;
        state
            .pairs
            .iter()
            .find(|(o, m, c, _, d)| *o == owner && *m == media && *c == component && d.nominated && d.valid)
            .map(|(_, _, _, id, _)| *id)
            .ok_or(EngineError::new("nominated_pair", -2))
    }

    fn pair_details(&self, _session: EngineSessionId, pair: CandidatePairId) -> EngineResult<CandidatePairDetails> {
        let state = self.state.lock().unwrap();
        state
            .pairs
            .iter()
            .find(|(_, _, _, id, _)| *id == pair)
            .map(|(_, _, _, _, d)| *d)
            .ok_or(EngineError::new("pair_details", -1))
    }

    fn add_local_candidate(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        details: &CandidateDetails,
        _base: CandidateId,
    ) -> EngineResult<CandidateId> {
        let mut state = self.state.lock().unwrap();
        state.check("add_local_candidate")?;
        let owner = state.owner(session)?;
        Ok(state.add_candidate(owner, media, details.clone()))
    }

    fn create_media_transport(
        &self,
        session: EngineSessionId,
        media: MediaStreamId,
        component: ComponentId,
    ) -> EngineResult<TransportHandle> {
        let state = self.state.lock().unwrap();
        if state.fail_media_transport {
            return Err(EngineError::new("create_media_transport", -3));
        }
        let owner = state.owner(session)?;
        let addr = state
            .candidates
            .values()
            .find(|c| c.owner == owner && c.media == media && c.details.local && c.details.component == component)
            .map(|c| c.details.address)
            .ok_or(EngineError::new("create_media_transport", -1))?;
        Ok(Arc::new(MockTransport { addr }))
    }

    fn candidate_transport(&self, _session: EngineSessionId, candidate: CandidateId) -> EngineResult<TransportHandle> {
        let state = self.state.lock().unwrap();
        let addr = state
            .candidates
            .get(&candidate)
            .map(|c| c.details.address)
            .ok_or(EngineError::new("candidate_transport", -1))?;
        Ok(Arc::new(MockTransport { addr }))
    }

    fn ice_attribute_blocks(&self, sdp: &Sdp) -> EngineResult<Vec<String>> {
        let mut blocks = vec!["a=ice-ufrag:u\r\na=ice-pwd:p\r\na=ice-options:trickle\r\n".to_string()];
        for (i, _) in sdp.media.iter().enumerate() {
            blocks.push(format!("a=mid:{}\r\n", i));
        }
        Ok(blocks)
    }
}

/// Resolver answering from a fixed table and counting lookups
#[derive(Debug, Default)]
pub struct MockResolver {
    answers: HashMap<String, Vec<IpAddr>>,
    calls: AtomicUsize,
}

impl MockResolver {
    pub fn with(host: &str, addresses: &[&str]) -> Arc<Self> {
        let mut answers = HashMap::new();
        answers.insert(host.to_string(), addresses.iter().map(|a| ip(a)).collect());
        Arc::new(Self {
            answers,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostResolver for MockResolver {
    async fn resolve(&self, host: &str, alt_host: Option<&str>) -> vpe_ice_core::Result<Vec<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = self.answers.get(host).cloned().unwrap_or_default();
        if let Some(alt) = alt_host.and_then(|a| self.answers.get(a)) {
            out.extend(alt.iter().copied());
        }
        if out.is_empty() {
            return Err(IceError::dns(host, "no records"));
        }
        Ok(out)
    }
}

/// Resolver that parks every lookup until released
#[derive(Debug, Default)]
pub struct GatedResolver {
    addresses: Vec<IpAddr>,
    /// Notified when a lookup starts waiting
    pub entered: Notify,
    pub release: Notify,
}

impl GatedResolver {
    pub fn with(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            addresses: addresses.iter().map(|a| ip(a)).collect(),
            ..Self::default()
        })
    }
}

#[async_trait]
impl HostResolver for GatedResolver {
    async fn resolve(&self, _host: &str, _alt_host: Option<&str>) -> vpe_ice_core::Result<Vec<IpAddr>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.addresses.clone())
    }
}

pub fn local_addresses() -> Arc<StaticAddressSource> {
    Arc::new(StaticAddressSource {
        ipv4: Some(ip(LOCAL_IPV4)),
        ipv6: None,
    })
}

/// Manager running on a fresh mock engine
pub async fn running_manager(
    config: IceManagerConfig,
    resolver: Arc<MockResolver>,
) -> (IceManager, Arc<MockEngine>) {
    let engine = MockEngine::new();
    let manager = IceManager::with_collaborators(config, engine.clone(), resolver, local_addresses()).unwrap();
    manager.initialize(4).await.unwrap();
    (manager, engine)
}

/// Our own offer: one audio stream with rtcp-mux
pub fn audio_offer() -> Sdp {
    Sdp::new()
        .with_connection(LOCAL_IPV4)
        .with_media(MediaDescription::new("audio", 40_000).with_attribute(SdpAttribute::flag("rtcp-mux")))
}

/// A peer's offer carrying ICE markers and the given candidate lines on audio
pub fn remote_ice_offer(candidates: &[&str]) -> Sdp {
    let mut audio = MediaDescription::new("audio", 50_000).with_attribute(SdpAttribute::flag("rtcp-mux"));
    for c in candidates {
        audio = audio.with_attribute(SdpAttribute::new("candidate", *c));
    }
    Sdp::new()
        .with_connection("198.51.100.20")
        .with_attribute(SdpAttribute::new("ice-ufrag", "peer"))
        .with_attribute(SdpAttribute::new("ice-pwd", "peerpwd"))
        .with_media(audio)
}

pub async fn next_event(events: &mut IceEventSubscriber) -> IceEvent {
    tokio::time::timeout(Duration::from_secs(2), events.receive())
        .await
        .expect("timed out waiting for ICE signal")
        .expect("event channel closed")
}

pub fn token(n: u64) -> CallbackToken {
    CallbackToken(n)
}
