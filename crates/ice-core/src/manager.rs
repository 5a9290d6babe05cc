//! ICE manager
//!
//! Owns the engine's process-wide lifecycle, the default server
//! configuration and the session registry. Engine callbacks arrive on an
//! [`EngineEventSink`] and are applied by a single event-loop task under the
//! registry lock, so a callback never races `end()` on the same session.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vpe_ice_core::prelude::*;
//!
//! # async fn run(engine: Arc<dyn IceEngine>, offer: Sdp) -> Result<()> {
//! let manager = IceManager::new(IceManagerConfig::default(), engine)?;
//! manager.initialize(8).await?;
//!
//! let mut signals = manager.subscribe();
//! let started = manager
//!     .start_session(IceRole::Offerer, &offer, CallbackToken(1), None, None, IceProtocol::Turn)
//!     .await?;
//!
//! if let Some(id) = started.session {
//!     match signals.receive().await? {
//!         IceEvent::GatheringTryingAnother { token } => {
//!             manager.try_another_server(id, None, None, token, IceProtocol::Turn).await?;
//!         }
//!         _ => {}
//!     }
//! }
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IceManagerConfig;
use crate::engine::{CandidateDetails, EngineEvent, EngineEventSink, EngineSessionId, IceEngine};
use crate::error::{IceError, Result};
use crate::events::{CallbackToken, IceEvent, IceEventPublisher, IceEventSubscriber};
use crate::net::{AddressFamily, LocalAddressSource, UdpProbeAddressSource};
use crate::registry::{RegistryStats, SessionRegistry};
use crate::resolver::{HostResolver, SystemResolver};
use crate::sdp::Sdp;
use crate::server::{IceProtocol, ServerInfo};
use crate::session::{IceRole, IceSession, IceSessionId, IceSessionState, IceSupport, RetryState};
use crate::transports::{DefaultTransports, LocalAddresses, NominatedTransports};

/// Engine lifecycle as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLifecycle {
    Uninitialized,
    Running,
    Destroyed,
}

/// Outcome of [`IceManager::start_session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStart {
    /// `None` when an answerer's offer did not support ICE
    pub session: Option<IceSessionId>,
    pub ice_support: IceSupport,
}

/// Local addresses and the public addresses that go with them
#[derive(Debug, Clone, Default)]
struct HostAddresses {
    local: Vec<IpAddr>,
    public_ipv4: Option<IpAddr>,
    public_ipv6: Option<IpAddr>,
}

/// Destroys an engine session unless disarmed.
///
/// Covers early returns and cancellation while a session is being started
/// outside the registry.
struct EngineSessionGuard {
    engine: Arc<dyn IceEngine>,
    handle: Option<EngineSessionId>,
}

impl EngineSessionGuard {
    fn new(engine: Arc<dyn IceEngine>, handle: Option<EngineSessionId>) -> Self {
        Self { engine, handle }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for EngineSessionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Releasing {} from an unfinished start", handle);
            self.engine.destroy_session(handle);
        }
    }
}

struct ManagerState {
    lifecycle: EngineLifecycle,
    /// Bumped on every engine start; handles from an older generation are dead
    generation: u64,
    sessions: SessionRegistry,
}

impl ManagerState {
    fn ensure_running(&self) -> Result<()> {
        match self.lifecycle {
            EngineLifecycle::Running => Ok(()),
            _ => Err(IceError::NotInitialized),
        }
    }

    /// End every related session borrowing `parent`'s engine state
    fn invalidate_children(&mut self, parent: IceSessionId) {
        for child in self.sessions.children_of(parent) {
            if let Ok(session) = self.sessions.get_mut(&child) {
                let handle = session.engine_handle();
                session.invalidate();
                self.sessions.rebind(child, handle, None);
                debug!("Invalidated related session {} of {}", child, parent);
            }
        }
    }
}

struct ManagerInner {
    engine: Arc<dyn IceEngine>,
    resolver: Arc<dyn HostResolver>,
    addresses: Arc<dyn LocalAddressSource>,
    config: RwLock<IceManagerConfig>,
    state: Mutex<ManagerState>,
    events: IceEventPublisher,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    async fn handle_engine_event(&self, event: EngineEvent) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.by_handle_mut(event.session()) else {
            debug!("Dropping {:?} for an engine session no longer registered", event);
            return;
        };

        let signal = match event {
            EngineEvent::GatheringCompleted { reason, .. } => session.on_gathering_completed(reason),
            EngineEvent::TurnAllocation { success, .. } => {
                session.on_turn_allocation(success);
                None
            }
            EngineEvent::SessionCompleted { result, .. } => session.on_session_completed(result),
        };

        if let Some(signal) = signal {
            self.events.publish(signal);
        }
    }

    fn host_addresses(
        &self,
        config: &IceManagerConfig,
        public_ipv4: Option<IpAddr>,
        public_ipv6: Option<IpAddr>,
    ) -> HostAddresses {
        let use_v6 = config.ipv6_enabled && public_ipv6.is_some();
        let use_v4 = !(use_v6 && config.ipv6_only_when_available);

        let mut out = HostAddresses::default();
        if use_v4 {
            out.public_ipv4 = public_ipv4;
            match self.addresses.local_ip(AddressFamily::V4) {
                Some(ip) => out.local.push(ip),
                None => warn!("No local IPv4 address available"),
            }
        }
        if use_v6 {
            out.public_ipv6 = public_ipv6;
            match self.addresses.local_ip(AddressFamily::V6) {
                Some(ip) => out.local.push(ip),
                None => warn!("No local IPv6 address available"),
            }
        }
        out
    }
}

/// Fresh engine session for a retry, fed the stored SDP and gathering again
fn restart_session(
    session: &mut IceSession,
    engine: &dyn IceEngine,
    config: &IceManagerConfig,
    local_ips: &[IpAddr],
) -> Result<()> {
    session.replace_engine_session(engine, &config.session_config())?;
    session.set_retry(RetryState::Retrying);
    session.reapply_sdp(engine)?;
    session.start_gathering(engine, local_ips)
}

async fn run_event_loop(inner: Weak<ManagerInner>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    info!("Starting ICE engine event loop");

    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_engine_event(event).await;
    }

    info!("ICE engine event loop ended");
}

/// Coordinates ICE sessions on top of an [`IceEngine`]
pub struct IceManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for IceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceManager").field("events", &self.inner.events).finish()
    }
}

impl IceManager {
    /// Manager using the system resolver and UDP-probe address discovery
    pub fn new(config: IceManagerConfig, engine: Arc<dyn IceEngine>) -> Result<Self> {
        Self::with_collaborators(
            config,
            engine,
            Arc::new(SystemResolver),
            Arc::new(UdpProbeAddressSource::default()),
        )
    }

    pub fn with_collaborators(
        config: IceManagerConfig,
        engine: Arc<dyn IceEngine>,
        resolver: Arc<dyn HostResolver>,
        addresses: Arc<dyn LocalAddressSource>,
    ) -> Result<Self> {
        config.validate()?;
        let events = IceEventPublisher::new(config.event_capacity);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                engine,
                resolver,
                addresses,
                config: RwLock::new(config),
                state: Mutex::new(ManagerState {
                    lifecycle: EngineLifecycle::Uninitialized,
                    generation: 0,
                    sessions: SessionRegistry::new(),
                }),
                events,
                event_loop: Mutex::new(None),
            }),
        })
    }

    /// Start the engine sized for `max_sessions` calls and the callback loop
    pub async fn initialize(&self, max_sessions: usize) -> Result<()> {
        if max_sessions == 0 {
            return Err(IceError::invalid_parameter("max_sessions must be at least 1"));
        }

        let mut state = self.inner.state.lock().await;
        if state.lifecycle == EngineLifecycle::Running {
            debug!("ICE engine already running");
            return Ok(());
        }

        let stack = {
            let mut config = self.inner.config.write().await;
            config.max_sessions = max_sessions;
            config.stack_config()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.engine.start(&stack, EngineEventSink::new(tx))?;

        let task = tokio::spawn(run_event_loop(Arc::downgrade(&self.inner), rx));
        if let Some(previous) = self.inner.event_loop.lock().await.replace(task) {
            previous.abort();
        }

        state.lifecycle = EngineLifecycle::Running;
        state.generation += 1;
        info!(
            "ICE engine started: {} sessions, {} media streams, lite={}",
            stack.max_sessions, stack.max_media_streams, stack.lite_mode
        );
        Ok(())
    }

    /// End every session, stop the engine and the callback loop. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.lifecycle != EngineLifecycle::Running {
            return Ok(());
        }

        let engine = self.inner.engine.as_ref();
        for id in state.sessions.ids() {
            if let Ok(mut session) = state.sessions.remove(&id) {
                session.end(engine);
            }
        }
        engine.stop();
        state.lifecycle = EngineLifecycle::Destroyed;

        if let Some(task) = self.inner.event_loop.lock().await.take() {
            task.abort();
        }
        info!("ICE engine stopped");
        Ok(())
    }

    pub async fn lifecycle(&self) -> EngineLifecycle {
        self.inner.state.lock().await.lifecycle
    }

    pub async fn config(&self) -> IceManagerConfig {
        self.inner.config.read().await.clone()
    }

    /// Replace the default servers; sessions already started keep theirs
    pub async fn configure_servers(
        &self,
        primary: Option<ServerInfo>,
        alternate: Option<ServerInfo>,
        protocol: IceProtocol,
    ) -> Result<()> {
        let mut config = self.inner.config.write().await;
        let mut updated = config.clone();
        updated.primary_server = primary;
        updated.alternate_server = alternate;
        updated.protocol = protocol;
        updated.validate()?;
        *config = updated;
        info!(
            "ICE servers configured: primary={:?} alternate={:?} protocol={:?}",
            config.primary_server.as_ref().map(|s| &s.address),
            config.alternate_server.as_ref().map(|s| &s.address),
            protocol
        );
        Ok(())
    }

    pub async fn set_reject_host_only_requests(&self, enabled: bool) {
        self.inner.config.write().await.reject_host_only_requests = enabled;
    }

    pub async fn set_prioritize_privacy(&self, enabled: bool) {
        self.inner.config.write().await.prioritize_privacy = enabled;
    }

    pub async fn set_prefer_turn(&self, enabled: bool) {
        self.inner.config.write().await.prefer_turn = enabled;
    }

    pub async fn default_protocol(&self) -> IceProtocol {
        self.inner.config.read().await.protocol
    }

    pub fn subscribe(&self) -> IceEventSubscriber {
        self.inner.events.subscribe()
    }

    /// Create a session and start gathering.
    ///
    /// An answerer whose offer does not support ICE gets no session; the
    /// classification is still reported.
    pub async fn start_session(
        &self,
        role: IceRole,
        sdp: &Sdp,
        callback_token: CallbackToken,
        public_ipv4: Option<IpAddr>,
        public_ipv6: Option<IpAddr>,
        protocol: IceProtocol,
    ) -> Result<SessionStart> {
        let config = self.inner.config.read().await.clone();
        let engine = self.inner.engine.as_ref();

        let (mut session, guard, ice_support, hosts, generation) = {
            let mut state = self.inner.state.lock().await;
            state.ensure_running()?;
            let generation = state.generation;

            let mut session =
                IceSession::create(engine, role, callback_token, &config.session_config(), config.prioritize_privacy)?;
            let guard = EngineSessionGuard::new(self.inner.engine.clone(), session.engine_handle());

            session.set_original_sdp(sdp.clone());
            session.set_server(config.primary_server.clone(), protocol);

            let ice_support = match role {
                IceRole::Answerer => {
                    let support = session.sdp_received(engine, sdp);
                    if support != IceSupport::Supported {
                        info!("Offer does not support ICE ({:?}); no session started", support);
                        return Ok(SessionStart {
                            session: None,
                            ice_support: support,
                        });
                    }
                    if config.reject_host_only_requests && session.all_remote_candidates_are_private_host(engine)? {
                        return Err(IceError::invalid_media(
                            "all ICE candidates were private host candidates, rejecting call",
                        ));
                    }
                    support
                }
                IceRole::Offerer | IceRole::Gatherer => {
                    session.sdp_ice_support_add(engine, sdp)?;
                    session.set_remote_sdp(sdp.clone());
                    IceSupport::Unknown
                }
            };

            let hosts = self.inner.host_addresses(&config, public_ipv4, public_ipv6);
            session.set_public_addresses(hosts.public_ipv4, hosts.public_ipv6);

            if session.server().is_none() {
                session.gather_without_server(engine, &hosts.local)?;
                guard.disarm();
                let id = state.sessions.insert(session);
                self.inner.events.publish(IceEvent::GatheringComplete { token: callback_token });
                return Ok(SessionStart {
                    session: Some(id),
                    ice_support,
                });
            }

            (session, guard, ice_support, hosts, generation)
        };

        // Resolution may block on the network; the registry stays unlocked.
        let server = session
            .server()
            .cloned()
            .ok_or_else(|| IceError::internal("server vanished during start"))?;
        let alternate = config.alternate_server.as_ref().map(|s| s.host().to_string());
        let addresses = self.inner.resolver.resolve(server.host(), alternate.as_deref()).await?;
        debug!("Resolved {} to {} address(es)", server.host(), addresses.len());
        session.set_turn_queue(addresses);

        let mut state = self.inner.state.lock().await;
        if state.ensure_running().is_err() || state.generation != generation {
            // Stopping the engine already released the session.
            guard.disarm();
            warn!("Engine stopped while resolving {}; start abandoned", server.host());
            return Err(IceError::NotInitialized);
        }
        session.start_gathering(engine, &hosts.local)?;
        guard.disarm();
        let id = state.sessions.insert(session);

        Ok(SessionStart {
            session: Some(id),
            ice_support,
        })
    }

    /// Restart gathering against the next resolved server address.
    ///
    /// The session keeps its id. When no address is left the call fails with
    /// `ServerBusy` and `NominationsComplete(false)` is signalled.
    pub async fn try_another_server(
        &self,
        id: IceSessionId,
        public_ipv4: Option<IpAddr>,
        public_ipv6: Option<IpAddr>,
        callback_token: CallbackToken,
        protocol: IceProtocol,
    ) -> Result<IceSessionId> {
        let config = self.inner.config.read().await.clone();
        let engine = self.inner.engine.as_ref();
        let hosts = self.inner.host_addresses(&config, public_ipv4, public_ipv6);

        let mut state = self.inner.state.lock().await;
        state.ensure_running()?;

        let session = state.sessions.get_mut(&id)?;
        if session.is_related() {
            return Err(IceError::protocol_state(
                "try_another_server",
                "related sessions share their parent's gathering",
            ));
        }
        session.set_callback_token(callback_token);
        session.set_public_addresses(hosts.public_ipv4, hosts.public_ipv6);
        let server = session.server().cloned();
        session.set_server(server, protocol);

        let remaining = session.remaining_servers().map(|q| q.len()).unwrap_or(0);
        if remaining == 0 {
            session.set_retry(RetryState::Exhausted);
            warn!("Session {} has no server left to try", id);
            self.inner.events.publish(IceEvent::NominationsComplete {
                token: callback_token,
                success: false,
            });
            return Err(IceError::server_busy("all resolved server addresses failed"));
        }

        let old = session.engine_handle();
        let restarted = restart_session(session, engine, &config, &hosts.local);
        let new = session.engine_handle();

        state.sessions.rebind(id, old, new);
        state.invalidate_children(id);

        if let Err(e) = restarted {
            warn!("Restart of session {} failed: {}", id, e);
            if let Ok(mut session) = state.sessions.remove(&id) {
                session.end(engine);
            }
            return Err(e);
        }

        info!("Session {} retrying with {} address(es) left after this one", id, remaining - 1);
        Ok(id)
    }

    /// Feed a remote answer (or re-offer) to an existing session
    pub async fn sdp_received(&self, id: IceSessionId, sdp: &Sdp) -> Result<IceSupport> {
        let mut state = self.inner.state.lock().await;
        Ok(state.sessions.get_mut(&id)?.sdp_received(self.inner.engine.as_ref(), sdp))
    }

    pub async fn sdp_update(&self, id: IceSessionId, sdp: &mut Sdp) -> Result<()> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&id)?.sdp_update(self.inner.engine.as_ref(), sdp)
    }

    pub async fn proceed(&self, id: IceSessionId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.sessions.get_mut(&id)?.proceed(self.inner.engine.as_ref())
    }

    pub async fn nominations_get(&self, id: IceSessionId, with_attributes: bool) -> Result<NominatedTransports> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&id)?.nominations_get(self.inner.engine.as_ref(), with_attributes)
    }

    pub async fn default_transports_get(&self, id: IceSessionId, sdp: &Sdp) -> Result<DefaultTransports> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&id)?.default_transports_get(self.inner.engine.as_ref(), sdp)
    }

    pub async fn local_addresses_get(&self, id: IceSessionId) -> Result<LocalAddresses> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&id)?.local_addresses_get(self.inner.engine.as_ref())
    }

    pub async fn server_reflexive_ports_add(&self, id: IceSessionId, public_ip: IpAddr) -> Result<usize> {
        let state = self.inner.state.lock().await;
        state.sessions.get(&id)?.server_reflexive_ports_add(self.inner.engine.as_ref(), public_ip)
    }

    pub async fn all_remote_candidates_are_private_host(&self, id: IceSessionId) -> Result<bool> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .get(&id)?
            .all_remote_candidates_are_private_host(self.inner.engine.as_ref())
    }

    /// Start a sub-session for a forked call leg
    pub async fn related_session_start(&self, id: IceSessionId, callback_token: CallbackToken) -> Result<IceSessionId> {
        let mut state = self.inner.state.lock().await;
        let related = state
            .sessions
            .get(&id)?
            .related_session_start(self.inner.engine.as_ref(), callback_token)?;
        Ok(state.sessions.insert(related))
    }

    /// End a session. Related sessions of an ended parent are ended with it.
    pub async fn end(&self, id: IceSessionId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let mut session = state.sessions.remove(&id)?;
        if !session.is_related() {
            state.invalidate_children(id);
        }
        session.end(self.inner.engine.as_ref());
        Ok(())
    }

    pub async fn session_state(&self, id: IceSessionId) -> Result<IceSessionState> {
        Ok(self.inner.state.lock().await.sessions.get(&id)?.state())
    }

    pub async fn retry_state(&self, id: IceSessionId) -> Result<RetryState> {
        Ok(self.inner.state.lock().await.sessions.get(&id)?.retry_state())
    }

    /// Resolved server addresses not yet tried; `None` before resolution
    pub async fn remaining_servers(&self, id: IceSessionId) -> Result<Option<Vec<IpAddr>>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .sessions
            .get(&id)?
            .remaining_servers()
            .map(|q| q.iter().copied().collect()))
    }

    pub async fn candidates_list(&self, id: IceSessionId) -> Result<Vec<CandidateDetails>> {
        let state = self.inner.state.lock().await;
        let candidates = state.sessions.get(&id)?.candidates_list(self.inner.engine.as_ref())?;
        for c in &candidates {
            debug!(
                "Session {} candidate {:?} {} {:?} {:?} prio={}",
                id, c.candidate_type, c.address, c.component, c.transport, c.priority
            );
        }
        Ok(candidates)
    }

    pub async fn active_sessions(&self) -> Vec<IceSessionId> {
        self.inner.state.lock().await.sessions.ids()
    }

    pub async fn stats(&self) -> RegistryStats {
        self.inner.state.lock().await.sessions.stats()
    }
}

impl Drop for IceManager {
    fn drop(&mut self) {
        if let Ok(mut task) = self.inner.event_loop.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
