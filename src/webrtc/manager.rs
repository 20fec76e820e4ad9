//! Peer connection manager
//!
//! Owns the single playback session. Commands and engine callbacks both
//! mutate the session under one async mutex: callbacks arrive on a channel
//! and are drained by a per-session pump task, so they never interleave
//! with a command. Network calls (WHEP POST/PATCH/DELETE) run without the
//! lock and race the session's cancellation token.
//!
//! Lifecycle for a WHEP target:
//!
//! ```text
//! play_stream ──► Negotiating ──► codec filter ──► peer ──► offer
//!                                                           │
//!        (wait for gathering unless trickle) ◄──────────────┘
//!                      │
//!                      ▼
//!               POST offer ──► answer applied ──► ICE connected ──► Connected
//! ```
//!
//! Any other target is host-driven: the host calls `create_offer`,
//! `set_remote_description` and `add_ice_candidate` itself.

use reqwest::Url;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capability::CapabilityInspector;
use super::codec::{build_preference_list, VideoCodec};
use super::engine::{
    EngineEvent, EngineEventReceiver, EnginePeer, IceConnectivity, PeerOptions, PeerState,
    RemoteTrack, WebRtcEngine,
};
use super::signaling::{build_trickle_fragment, IceCandidate, SdpType, SessionDescription};
use super::state::{ConnectionState, ConnectionStateMachine};
use super::whep::SignalingClient;
use crate::config::{ConfigStore, PlayerConfig};
use crate::error::{PlayerError, Result};
use crate::events::{EventEmitter, PlayerEvent};

/// What `play_stream` was pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// WHEP endpoint; signaling runs automatically
    Whep(String),
    /// Opaque reference; the host drives signaling
    External(String),
}

impl StreamTarget {
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PlayerError::InvalidTarget("empty stream target".to_string()));
        }

        let lower = target.to_ascii_lowercase();
        if lower.starts_with("http:") || lower.starts_with("https:") {
            let url = Url::parse(target)
                .map_err(|e| PlayerError::InvalidTarget(format!("{}: {}", target, e)))?;
            if url.host_str().map_or(true, str::is_empty) {
                return Err(PlayerError::InvalidTarget(format!("{}: missing host", target)));
            }
            return Ok(StreamTarget::Whep(target.to_string()));
        }

        Ok(StreamTarget::External(target.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            StreamTarget::Whep(url) => url,
            StreamTarget::External(reference) => reference,
        }
    }

    pub fn is_whep(&self) -> bool {
        matches!(self, StreamTarget::Whep(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangePhase {
    NotStarted,
    InFlight,
    Completed,
}

struct Session {
    id: String,
    target: StreamTarget,
    /// Configuration snapshot taken at `play_stream`
    config: Arc<PlayerConfig>,
    machine: ConnectionStateMachine,
    peer: Option<Arc<dyn EnginePeer>>,
    cancel: CancellationToken,
    resource_url: Option<String>,
    trickle_supported: bool,
    trickle_tx: Option<mpsc::UnboundedSender<String>>,
    exchange: ExchangePhase,
    /// Local SDP the trickle fragments are derived from
    local_sdp: Option<String>,
    local_applied: Option<SdpType>,
    remote_applied: Option<SdpType>,
    /// Remote description accepted by the engine
    remote_ready: bool,
    ice_connected: bool,
    gathering_tx: watch::Sender<bool>,
    /// Gathering had finished when the offer was snapshotted for the POST
    offer_complete: bool,
    pending_local: Vec<IceCandidate>,
    pending_remote: VecDeque<IceCandidate>,
    announced_tracks: HashSet<String>,
}

impl Session {
    fn new(id: String, target: StreamTarget, config: Arc<PlayerConfig>) -> Self {
        let (gathering_tx, _) = watch::channel(false);
        Self {
            id,
            target,
            config,
            machine: ConnectionStateMachine::new(),
            peer: None,
            cancel: CancellationToken::new(),
            resource_url: None,
            trickle_supported: false,
            trickle_tx: None,
            exchange: ExchangePhase::NotStarted,
            local_sdp: None,
            local_applied: None,
            remote_applied: None,
            remote_ready: false,
            ice_connected: false,
            gathering_tx,
            offer_complete: false,
            pending_local: Vec::new(),
            pending_remote: VecDeque::new(),
            announced_tracks: HashSet::new(),
        }
    }

    fn stream_url(&self) -> String {
        self.target.as_str().to_string()
    }

    fn transition(&mut self, to: ConnectionState, events: &dyn EventEmitter) -> bool {
        match self.machine.transition(to) {
            Ok(Some((from, to))) => {
                info!("Session {} state: {} -> {}", self.id, from, to);
                events.emit(PlayerEvent::ConnectionStateChanged {
                    session_id: self.id.clone(),
                    stream_url: self.stream_url(),
                    from,
                    state: to,
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Session {}: {}", self.id, e);
                false
            }
        }
    }

    fn emit_error(&self, events: &dyn EventEmitter, error: &PlayerError) {
        events.emit(PlayerEvent::ConnectionError {
            session_id: self.id.clone(),
            stream_url: self.stream_url(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Connected needs both an applied answer and working ICE
    fn try_mark_connected(&mut self, events: &dyn EventEmitter) {
        let state = self.machine.state();
        if self.remote_ready
            && self.ice_connected
            && matches!(state, ConnectionState::Negotiating | ConnectionState::Disconnected)
        {
            self.transition(ConnectionState::Connected, events);
        }
    }

    fn on_disconnected(&mut self, events: &dyn EventEmitter) {
        self.ice_connected = false;
        if self.machine.state() == ConnectionState::Connected {
            self.transition(ConnectionState::Disconnected, events);
        }
    }

    fn fragment(&self, candidates: &[IceCandidate], end_of_candidates: bool) -> Option<String> {
        build_trickle_fragment(self.local_sdp.as_deref()?, candidates, end_of_candidates)
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate, events: &dyn EventEmitter) {
        events.emit(PlayerEvent::IceCandidateReady {
            session_id: self.id.clone(),
            candidate: candidate.candidate.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid.clone(),
        });

        if !self.target.is_whep() {
            return;
        }
        if self.exchange != ExchangePhase::Completed {
            self.pending_local.push(candidate);
            return;
        }
        match (&self.trickle_tx, self.fragment(std::slice::from_ref(&candidate), false)) {
            (Some(tx), Some(fragment)) => {
                let _ = tx.send(fragment);
            }
            _ => debug!(
                "Session {}: trickle unavailable, dropping late candidate",
                self.id
            ),
        }
    }

    fn on_gathering_complete(&mut self) {
        debug!("Session {}: ICE gathering complete", self.id);
        self.gathering_tx.send_replace(true);

        if self.exchange == ExchangePhase::Completed {
            if let (Some(tx), Some(fragment)) = (&self.trickle_tx, self.fragment(&[], true)) {
                let _ = tx.send(fragment);
            }
        }
    }

    fn on_ice_state(
        &mut self,
        state: IceConnectivity,
        events: &dyn EventEmitter,
    ) -> Option<PlayerError> {
        debug!("Session {}: ICE {:?}", self.id, state);
        match state {
            s if s.is_established() => {
                self.ice_connected = true;
                self.try_mark_connected(events);
                None
            }
            IceConnectivity::Disconnected => {
                self.on_disconnected(events);
                None
            }
            IceConnectivity::Failed => {
                Some(PlayerError::Engine("ICE connection failed".to_string()))
            }
            _ => None,
        }
    }

    fn on_peer_state(&mut self, state: PeerState, events: &dyn EventEmitter) -> Option<PlayerError> {
        match state {
            PeerState::Connected => {
                self.ice_connected = true;
                self.try_mark_connected(events);
                None
            }
            PeerState::Disconnected => {
                self.on_disconnected(events);
                None
            }
            PeerState::Failed => Some(PlayerError::Engine("peer connection failed".to_string())),
            _ => None,
        }
    }

    fn on_track(&mut self, track: RemoteTrack, events: &dyn EventEmitter) {
        if !self.announced_tracks.insert(track.track_id.clone()) {
            return;
        }
        info!(
            "Session {}: remote {:?} track {} ({})",
            self.id, track.kind, track.track_id, track.mime_type
        );
        events.emit(PlayerEvent::RemoteStreamAdded {
            session_id: self.id.clone(),
            stream_url: self.stream_url(),
            track,
        });
    }

    /// Hand candidates held back during the exchange to the trickle sender
    fn flush_local_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_local);
        let gathered = *self.gathering_tx.borrow();

        let Some(tx) = &self.trickle_tx else {
            if !pending.is_empty() {
                warn!(
                    "Session {}: server offers no trickle resource, dropping {} local candidates",
                    self.id,
                    pending.len()
                );
            }
            return;
        };

        // A complete offer already told the server there is nothing more
        let end_of_candidates = gathered && !self.offer_complete;
        if pending.is_empty() && !end_of_candidates {
            return;
        }
        if let Some(fragment) = self.fragment(&pending, end_of_candidates) {
            let _ = tx.send(fragment);
        }
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    /// Reported once no session exists (Idle, Failed or Closed)
    last_state: ConnectionState,
}

impl Inner {
    fn find(&mut self, id: &str) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.id == id)
    }
}

struct Shared {
    engine: Arc<dyn WebRtcEngine>,
    signaling: Arc<dyn SignalingClient>,
    inspector: Arc<dyn CapabilityInspector>,
    events: Arc<dyn EventEmitter>,
    config: ConfigStore,
    inner: Mutex<Inner>,
    /// Held from peer creation until the peer is owned by a session or closed
    peer_slot: Mutex<()>,
}

async fn close_peer(peer: Option<Arc<dyn EnginePeer>>) {
    if let Some(peer) = peer {
        if let Err(e) = peer.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl Shared {
    /// Emit the error, move to Failed and drop the session.
    ///
    /// Returns the peer. Callers close it before releasing `inner`, so a
    /// restart cannot create a peer while this one is still open.
    fn fail_locked(
        &self,
        inner: &mut Inner,
        id: &str,
        error: &PlayerError,
    ) -> Option<Arc<dyn EnginePeer>> {
        let session = inner.find(id)?;
        warn!("Session {} failed: {}", id, error);
        session.emit_error(self.events.as_ref(), error);
        session.transition(ConnectionState::Failed, self.events.as_ref());
        session.cancel.cancel();

        let session = inner.session.take()?;
        inner.last_state = ConnectionState::Failed;
        session.peer
    }

    async fn fail(&self, id: &str, error: &PlayerError) {
        let mut inner = self.inner.lock().await;
        let peer = self.fail_locked(&mut inner, id, error);
        close_peer(peer).await;
    }

    async fn current_id(&self) -> Option<String> {
        self.inner.lock().await.session.as_ref().map(|s| s.id.clone())
    }

    async fn negotiate(self: Arc<Self>, id: String) {
        if let Err(e) = self.prepare_peer(&id).await {
            self.fail(&id, &e).await;
            return;
        }

        let is_whep = {
            let mut inner = self.inner.lock().await;
            match inner.find(&id) {
                Some(session) => session.target.is_whep(),
                None => return,
            }
        };
        if !is_whep {
            debug!("Session {}: waiting for host-driven signaling", id);
            return;
        }

        match self.create_local(&id, SdpType::Offer).await {
            Ok((_, true)) => self.exchange(id).await,
            Ok((_, false)) => {}
            Err(e) => debug!("Session {}: automatic offer skipped: {}", id, e),
        }
    }

    /// Codec filter, peer creation and the engine event pump
    async fn prepare_peer(self: &Arc<Self>, id: &str) -> Result<()> {
        let (config, cancel) = {
            let mut inner = self.inner.lock().await;
            match inner.find(id) {
                Some(session) => (session.config.clone(), session.cancel.clone()),
                None => return Ok(()),
            }
        };

        let hardware_h265 = self.inspector.has_hardware_decoder(VideoCodec::H265);
        let simulated = self.inspector.is_simulated_environment();
        let codecs = build_preference_list(
            &self.engine.available_codecs(),
            config.codecs.enable_h265,
            hardware_h265,
            simulated,
        );
        info!(
            "Session {}: H.265 {} (requested: {}, hardware: {}, simulated: {})",
            id,
            if codecs.contains(VideoCodec::H265) {
                "offered"
            } else {
                "not offered"
            },
            config.codecs.enable_h265,
            hardware_h265,
            simulated
        );

        let _slot = self.peer_slot.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self
            .engine
            .create_peer(
                PeerOptions {
                    session_id: id.to_string(),
                    codecs,
                    ice: config.ice.clone(),
                    receive_audio: config.codecs.receive_audio,
                },
                tx,
            )
            .await?;

        tokio::spawn(self.clone().pump(id.to_string(), rx, cancel));

        let mut inner = self.inner.lock().await;
        match inner.find(id) {
            Some(session) => {
                session.peer = Some(peer);
            }
            None => {
                // Disposed while the peer was being created
                close_peer(Some(peer)).await;
            }
        }
        Ok(())
    }

    async fn pump(self: Arc<Self>, id: String, mut rx: EngineEventReceiver, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_engine_event(&id, event).await;
        }
        debug!("Engine event pump for session {} stopped", id);
    }

    async fn handle_engine_event(&self, id: &str, event: EngineEvent) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.find(id) else {
            return;
        };
        let events = self.events.as_ref();

        let failure = match event {
            EngineEvent::LocalCandidate(candidate) => {
                session.on_local_candidate(candidate, events);
                None
            }
            EngineEvent::GatheringComplete => {
                session.on_gathering_complete();
                None
            }
            EngineEvent::IceState(state) => session.on_ice_state(state, events),
            EngineEvent::PeerState(state) => session.on_peer_state(state, events),
            EngineEvent::Track(track) => {
                session.on_track(track, events);
                None
            }
            EngineEvent::Error(message) => Some(PlayerError::Engine(message)),
        };

        if let Some(error) = failure {
            let peer = self.fail_locked(&mut inner, id, &error);
            close_peer(peer).await;
        }
    }

    /// Create and apply a local offer or answer.
    ///
    /// The flag is true when the offer must be forwarded to the WHEP endpoint.
    async fn create_local(&self, id: &str, sdp_type: SdpType) -> Result<(SessionDescription, bool)> {
        let (peer, forward) = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .find(id)
                .ok_or_else(|| PlayerError::Negotiation("no active session".to_string()))?;
            let peer = session
                .peer
                .clone()
                .ok_or_else(|| PlayerError::Negotiation("peer connection not ready".to_string()))?;

            if session.local_applied.is_some() {
                return Err(PlayerError::Negotiation(
                    "local description already created".to_string(),
                ));
            }
            match sdp_type {
                SdpType::Offer if session.exchange != ExchangePhase::NotStarted => {
                    return Err(PlayerError::Negotiation(
                        "signaling exchange already in progress".to_string(),
                    ));
                }
                SdpType::Answer if session.remote_applied != Some(SdpType::Offer) => {
                    return Err(PlayerError::Negotiation("no remote offer to answer".to_string()));
                }
                _ => {}
            }

            let forward = sdp_type == SdpType::Offer && session.target.is_whep();
            if forward {
                session.exchange = ExchangePhase::InFlight;
            }
            session.local_applied = Some(sdp_type);
            (peer, forward)
        };

        let result: Result<SessionDescription> = async {
            let description = match sdp_type {
                SdpType::Offer => peer.create_offer().await?,
                SdpType::Answer => peer.create_answer().await?,
            };
            peer.set_local_description(description.clone()).await?;
            Ok(description)
        }
        .await;

        let description = match result {
            Ok(description) => description,
            Err(e) => {
                self.fail(id, &e).await;
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        let session = inner
            .find(id)
            .ok_or_else(|| PlayerError::Negotiation("session closed during negotiation".to_string()))?;
        session.local_sdp = Some(description.sdp.clone());
        self.events.emit(PlayerEvent::LocalSdpReady {
            session_id: id.to_string(),
            sdp_type: description.sdp_type,
            sdp: description.sdp.clone(),
        });
        debug!("Session {}: local {} ready", id, description.sdp_type);

        Ok((description, forward))
    }

    /// Apply a remote description, then replay buffered remote candidates
    async fn apply_remote(&self, id: &str, description: SessionDescription) -> Result<()> {
        let sdp_type = description.sdp_type;
        let peer = {
            let mut inner = self.inner.lock().await;
            let session = inner
                .find(id)
                .ok_or_else(|| PlayerError::Negotiation("no active session".to_string()))?;
            if let Some(applied) = session.remote_applied {
                return Err(PlayerError::InvalidSdp(format!(
                    "remote {} already applied",
                    applied
                )));
            }
            let peer = session
                .peer
                .clone()
                .ok_or_else(|| PlayerError::Negotiation("peer connection not ready".to_string()))?;
            session.remote_applied = Some(sdp_type);
            peer
        };

        if let Err(e) = peer.set_remote_description(description).await {
            self.fail(id, &e).await;
            return Err(e);
        }

        let mut inner = self.inner.lock().await;
        let Some(session) = inner.find(id) else {
            return Ok(());
        };
        session.remote_ready = true;
        debug!(
            "Session {}: remote {} applied, {} buffered candidates",
            id,
            sdp_type,
            session.pending_remote.len()
        );

        // Lock held so new candidates queue behind the buffered ones
        while let Some(candidate) = session.pending_remote.pop_front() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Session {}: buffered candidate rejected: {}", id, e);
                session.emit_error(self.events.as_ref(), &as_ice_error(e));
            }
        }
        session.try_mark_connected(self.events.as_ref());
        Ok(())
    }

    async fn exchange(self: Arc<Self>, id: String) {
        if let Err(e) = self.run_exchange(&id).await {
            self.fail(&id, &e).await;
        }
    }

    async fn run_exchange(self: &Arc<Self>, id: &str) -> Result<()> {
        let (endpoint, peer, config, cancel, mut gathering_rx) = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.find(id) else {
                return Ok(());
            };
            let StreamTarget::Whep(endpoint) = &session.target else {
                return Ok(());
            };
            let peer = session
                .peer
                .clone()
                .ok_or_else(|| PlayerError::Negotiation("peer connection not ready".to_string()))?;
            (
                endpoint.clone(),
                peer,
                session.config.clone(),
                session.cancel.clone(),
                session.gathering_tx.subscribe(),
            )
        };

        if !config.signaling.trickle_ice {
            let limit = Duration::from_millis(config.ice.gathering_timeout_ms);
            let gathered = async { gathering_rx.wait_for(|done| *done).await.is_ok() };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = tokio::time::timeout(limit, gathered) => {
                    if result.is_err() {
                        warn!(
                            "Session {}: ICE gathering incomplete after {}ms, sending offer with candidates so far",
                            id, config.ice.gathering_timeout_ms
                        );
                    }
                }
            }
        }

        let offer_sdp = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.find(id) else {
                return Ok(());
            };
            let sdp = match peer.local_description().await {
                Some(description) => description.sdp,
                None => session
                    .local_sdp
                    .clone()
                    .ok_or_else(|| PlayerError::Negotiation("no local offer".to_string()))?,
            };
            // Candidates gathered so far are embedded in the offer
            session.pending_local.clear();
            session.offer_complete = *session.gathering_tx.borrow();
            session.local_sdp = Some(sdp.clone());
            sdp
        };

        info!("Session {}: sending WHEP offer to {}", id, endpoint);
        let limit = Duration::from_millis(config.signaling.timeout_ms);
        let answer = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(limit, self.signaling.send_offer(&endpoint, &offer_sdp)) => {
                match result {
                    Ok(answer) => answer?,
                    Err(_) => {
                        return Err(PlayerError::SignalingTransport(format!(
                            "WHEP exchange timed out after {}ms",
                            config.signaling.timeout_ms
                        )));
                    }
                }
            }
        };

        {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.find(id) else {
                return Ok(());
            };
            session.resource_url = answer.resource_url.clone();
            session.trickle_supported = answer.trickle_supported;
        }

        self.apply_remote(id, SessionDescription::answer(answer.sdp))
            .await?;

        let mut inner = self.inner.lock().await;
        let Some(session) = inner.find(id) else {
            return Ok(());
        };
        session.exchange = ExchangePhase::Completed;
        if let (true, Some(url)) = (session.trickle_supported, session.resource_url.clone()) {
            session.trickle_tx = Some(self.spawn_trickle(url, session.cancel.clone()));
        }
        session.flush_local_candidates();
        Ok(())
    }

    /// Sequential PATCH sender for one WHEP resource
    fn spawn_trickle(
        &self,
        resource_url: String,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let signaling = self.signaling.clone();

        tokio::spawn(async move {
            loop {
                let fragment = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fragment = rx.recv() => match fragment {
                        Some(fragment) => fragment,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = signaling.send_candidates(&resource_url, &fragment) => {
                        if let Err(e) = result {
                            warn!("Trickle ICE PATCH to {} failed: {}", resource_url, e);
                        }
                    }
                }
            }
            debug!("Trickle ICE sender for {} stopped", resource_url);
        });

        tx
    }
}

fn as_ice_error(error: PlayerError) -> PlayerError {
    match error {
        PlayerError::IceApply(_) => error,
        other => PlayerError::IceApply(other.to_string()),
    }
}

/// Playback session manager
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
}

impl PeerConnectionManager {
    pub fn new(
        engine: Arc<dyn WebRtcEngine>,
        signaling: Arc<dyn SignalingClient>,
        inspector: Arc<dyn CapabilityInspector>,
        events: Arc<dyn EventEmitter>,
        config: ConfigStore,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                signaling,
                inspector,
                events,
                config,
                inner: Mutex::new(Inner::default()),
                peer_slot: Mutex::new(()),
            }),
        }
    }

    /// Start playing `target` and return the new session id.
    ///
    /// Negotiation continues in the background; progress is reported
    /// through events.
    pub async fn play_stream(&self, target: &str) -> Result<String> {
        let target = StreamTarget::parse(target)?;
        let config = self.shared.config.get();

        let mut inner = self.shared.inner.lock().await;
        if let Some(session) = &inner.session {
            if session.machine.state().is_active() {
                return Err(PlayerError::AlreadyActive);
            }
        }

        let id = Uuid::new_v4().to_string();
        info!("Session {}: playing {}", id, target.as_str());

        let mut session = Session::new(id.clone(), target, config);
        session.transition(ConnectionState::Negotiating, self.shared.events.as_ref());
        inner.session = Some(session);
        inner.last_state = ConnectionState::Negotiating;
        drop(inner);

        tokio::spawn(self.shared.clone().negotiate(id.clone()));
        Ok(id)
    }

    /// Create a local offer. For a WHEP target whose exchange has not started
    /// yet, the offer is also POSTed to the endpoint.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let id = self
            .shared
            .current_id()
            .await
            .ok_or_else(|| PlayerError::Negotiation("no active session".to_string()))?;

        let (description, forward) = self.shared.create_local(&id, SdpType::Offer).await?;
        if forward {
            tokio::spawn(self.shared.clone().exchange(id));
        }
        Ok(description)
    }

    /// Create a local answer to a remote offer set by the host
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let id = self
            .shared
            .current_id()
            .await
            .ok_or_else(|| PlayerError::Negotiation("no active session".to_string()))?;

        let (description, _) = self.shared.create_local(&id, SdpType::Answer).await?;
        Ok(description)
    }

    /// Apply a remote description from the host (`type` is "offer" or "answer")
    pub async fn set_remote_description(&self, sdp: &str, sdp_type: &str) -> Result<()> {
        let description = SessionDescription::parse(sdp, sdp_type)?;
        let id = self
            .shared
            .current_id()
            .await
            .ok_or_else(|| PlayerError::Negotiation("no active session".to_string()))?;

        self.shared.apply_remote(&id, description).await
    }

    /// Add a remote ICE candidate; buffered until a remote description exists
    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mline_index: Option<u16>,
        sdp_mid: Option<&str>,
    ) -> Result<()> {
        if candidate.trim().is_empty() {
            return Err(PlayerError::IceApply("empty candidate".to_string()));
        }
        let candidate = IceCandidate {
            candidate: candidate.trim().to_string(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_mline_index,
            username_fragment: None,
        };

        let mut inner = self.shared.inner.lock().await;
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| PlayerError::IceApply("no active session".to_string()))?;

        if !session.remote_ready {
            debug!("Session {}: buffering remote candidate", session.id);
            session.pending_remote.push_back(candidate);
            return Ok(());
        }

        let peer = session
            .peer
            .clone()
            .ok_or_else(|| PlayerError::IceApply("peer connection not ready".to_string()))?;
        peer.add_ice_candidate(candidate).await.map_err(as_ice_error)
    }

    /// Tear the session down. Safe to call any number of times.
    pub async fn dispose(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        let Some(mut session) = inner.session.take() else {
            debug!("Dispose without an active session");
            return Ok(());
        };

        session.cancel.cancel();
        session.transition(ConnectionState::Closed, self.shared.events.as_ref());
        inner.last_state = ConnectionState::Closed;
        close_peer(session.peer.take()).await;
        drop(inner);

        if session.config.signaling.terminate_on_dispose {
            if let Some(url) = session.resource_url.take() {
                let limit = Duration::from_millis(session.config.signaling.timeout_ms);
                match tokio::time::timeout(limit, self.shared.signaling.terminate(&url)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to terminate WHEP session {}: {}", url, e),
                    Err(_) => warn!("Timed out terminating WHEP session {}", url),
                }
            }
        }

        info!("Session {} disposed", session.id);
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|s| s.machine.state())
            .unwrap_or(inner.last_state)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.shared.current_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::webrtc::capability::FixedCapabilities;
    use crate::webrtc::codec::{default_codec_catalog, CodecDescriptor, MediaKind};
    use crate::webrtc::engine::{EngineEventSender, WebRtcEngine};
    use crate::webrtc::signaling::WhepAnswer;
    use crate::webrtc::whep::resolve_resource_url;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{broadcast, Notify};

    const WHEP_URL: &str = "https://example.com/whep/abc";

    const LOCAL_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=ice-ufrag:test\r\n\
a=ice-pwd:testpasswordtestpassword\r\n\
a=mid:0\r\n\
a=recvonly\r\n";

    const REMOTE_SDP: &str = "v=0\r\n\
o=- 2 1 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:0\r\n\
a=sendonly\r\n";

    const HOST_CANDIDATE: &str = "candidate:1 1 udp 2130706431 192.168.1.10 50000 typ host";

    #[derive(Debug, Clone, Copy, Default)]
    struct EngineScript {
        /// Gather one candidate and finish gathering when the local description is set
        auto_gather: bool,
        /// Report ICE connected and a remote track once the remote description is set
        auto_connect: bool,
        fail_offer: bool,
        /// Take 200ms to close the peer
        slow_close: bool,
    }

    type PeerLog = Arc<SyncMutex<Vec<&'static str>>>;

    struct ScriptedPeer {
        script: EngineScript,
        events: EngineEventSender,
        local: SyncMutex<Option<SessionDescription>>,
        gathered: AtomicBool,
        remote: SyncMutex<Vec<SessionDescription>>,
        candidates: SyncMutex<Vec<String>>,
        closed: AtomicBool,
        log: PeerLog,
    }

    impl ScriptedPeer {
        fn inject(&self, event: EngineEvent) {
            let _ = self.events.send(event);
        }
    }

    fn remote_track(id: &str) -> RemoteTrack {
        RemoteTrack {
            track_id: id.to_string(),
            stream_id: "stream".to_string(),
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            handle: Arc::new(()),
        }
    }

    #[async_trait]
    impl EnginePeer for ScriptedPeer {
        async fn create_offer(&self) -> Result<SessionDescription> {
            if self.script.fail_offer {
                return Err(PlayerError::Negotiation("scripted offer failure".to_string()));
            }
            Ok(SessionDescription::offer(LOCAL_OFFER))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer(LOCAL_OFFER))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
            *self.local.lock() = Some(description);
            if self.script.auto_gather {
                self.gathered.store(true, Ordering::SeqCst);
                self.inject(EngineEvent::LocalCandidate(
                    IceCandidate::new(HOST_CANDIDATE).with_mid("0", 0),
                ));
                self.inject(EngineEvent::GatheringComplete);
            }
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            self.remote.lock().push(description);
            if self.script.auto_connect {
                self.inject(EngineEvent::IceState(IceConnectivity::Checking));
                self.inject(EngineEvent::IceState(IceConnectivity::Connected));
                self.inject(EngineEvent::Track(remote_track("video0")));
                self.inject(EngineEvent::Track(remote_track("video0")));
            }
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            if candidate.candidate.contains("bad") {
                return Err(PlayerError::IceApply("malformed candidate".to_string()));
            }
            self.candidates.lock().push(candidate.candidate);
            Ok(())
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            let local = self.local.lock().clone()?;
            if self.gathered.load(Ordering::SeqCst) {
                let sdp = format!("{}a=candidate:{}\r\n", local.sdp, &HOST_CANDIDATE["candidate:".len()..]);
                return Some(SessionDescription::offer(sdp));
            }
            Some(local)
        }

        async fn close(&self) -> Result<()> {
            if self.script.slow_close {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.closed.store(true, Ordering::SeqCst);
            self.log.lock().push("close");
            Ok(())
        }
    }

    struct ScriptedEngine {
        script: EngineScript,
        options: SyncMutex<Vec<PeerOptions>>,
        peers: SyncMutex<Vec<Arc<ScriptedPeer>>>,
        /// Peer creation and teardown in the order they happened
        log: PeerLog,
    }

    impl ScriptedEngine {
        fn new(script: EngineScript) -> Self {
            Self {
                script,
                options: SyncMutex::new(Vec::new()),
                peers: SyncMutex::new(Vec::new()),
                log: PeerLog::default(),
            }
        }

        fn peer(&self) -> Arc<ScriptedPeer> {
            self.peers.lock().last().cloned().expect("no peer created")
        }
    }

    #[async_trait]
    impl WebRtcEngine for ScriptedEngine {
        fn available_codecs(&self) -> Vec<CodecDescriptor> {
            default_codec_catalog()
        }

        async fn create_peer(
            &self,
            options: PeerOptions,
            events: EngineEventSender,
        ) -> Result<Arc<dyn EnginePeer>> {
            self.options.lock().push(options);
            self.log.lock().push("create");
            let peer = Arc::new(ScriptedPeer {
                script: self.script,
                events,
                local: SyncMutex::new(None),
                gathered: AtomicBool::new(false),
                remote: SyncMutex::new(Vec::new()),
                candidates: SyncMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                log: self.log.clone(),
            });
            self.peers.lock().push(peer.clone());
            Ok(peer as Arc<dyn EnginePeer>)
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Answer(Option<&'static str>),
        Status(u16),
        Hang,
    }

    struct ScriptedSignaling {
        reply: Reply,
        gate: Option<Arc<Notify>>,
        offers: SyncMutex<Vec<(String, String)>>,
        patches: SyncMutex<Vec<(String, String)>>,
        deletes: SyncMutex<Vec<String>>,
    }

    impl ScriptedSignaling {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                gate: None,
                offers: SyncMutex::new(Vec::new()),
                patches: SyncMutex::new(Vec::new()),
                deletes: SyncMutex::new(Vec::new()),
            }
        }

        fn gated(reply: Reply, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(reply)
            }
        }
    }

    #[async_trait]
    impl SignalingClient for ScriptedSignaling {
        async fn send_offer(&self, endpoint_url: &str, local_sdp: &str) -> Result<WhepAnswer> {
            self.offers
                .lock()
                .push((endpoint_url.to_string(), local_sdp.to_string()));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.reply {
                Reply::Answer(location) => {
                    let resource = location.map(|l| resolve_resource_url(endpoint_url, l).unwrap());
                    Ok(WhepAnswer::new(REMOTE_SDP, resource))
                }
                Reply::Status(status) => Err(PlayerError::protocol(status, "scripted failure")),
                Reply::Hang => std::future::pending().await,
            }
        }

        async fn send_candidates(&self, resource_url: &str, fragment: &str) -> Result<()> {
            self.patches
                .lock()
                .push((resource_url.to_string(), fragment.to_string()));
            Ok(())
        }

        async fn terminate(&self, resource_url: &str) -> Result<()> {
            self.deletes.lock().push(resource_url.to_string());
            Ok(())
        }
    }

    struct Harness {
        manager: PeerConnectionManager,
        engine: Arc<ScriptedEngine>,
        signaling: Arc<ScriptedSignaling>,
        events: broadcast::Receiver<PlayerEvent>,
    }

    fn harness_with(
        script: EngineScript,
        signaling: ScriptedSignaling,
        caps: FixedCapabilities,
        config: PlayerConfig,
    ) -> Harness {
        let engine = Arc::new(ScriptedEngine::new(script));
        let signaling = Arc::new(signaling);
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let manager = PeerConnectionManager::new(
            engine.clone(),
            signaling.clone(),
            Arc::new(caps),
            bus,
            ConfigStore::in_memory(config),
        );
        Harness {
            manager,
            engine,
            signaling,
            events,
        }
    }

    fn harness(script: EngineScript, reply: Reply) -> Harness {
        harness_with(
            script,
            ScriptedSignaling::new(reply),
            FixedCapabilities::default(),
            PlayerConfig::default(),
        )
    }

    fn connecting() -> EngineScript {
        EngineScript {
            auto_gather: true,
            auto_connect: true,
            ..Default::default()
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<PlayerEvent>,
        done: impl Fn(&PlayerEvent) -> bool,
    ) -> Vec<PlayerEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }

    fn is_state(state: ConnectionState) -> impl Fn(&PlayerEvent) -> bool {
        move |event| {
            matches!(event, PlayerEvent::ConnectionStateChanged { state: s, .. } if *s == state)
        }
    }

    fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn transitions(events: &[PlayerEvent]) -> Vec<(ConnectionState, ConnectionState)> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::ConnectionStateChanged { from, state, .. } => Some((*from, *state)),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[PlayerEvent]) -> Vec<crate::error::ErrorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::ConnectionError { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_session(manager: &PeerConnectionManager, check: impl Fn(&Session) -> bool) {
        for _ in 0..500 {
            let reached = manager
                .shared
                .inner
                .lock()
                .await
                .session
                .as_ref()
                .map_or(false, &check);
            if reached {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached the expected state");
    }

    async fn wait_peer_ready(manager: &PeerConnectionManager) {
        wait_session(manager, |s| s.peer.is_some()).await;
    }

    #[tokio::test]
    async fn test_whep_playback_connects() {
        let mut h = harness(connecting(), Reply::Answer(Some("/whep/abc/session/1")));

        let id = h.manager.play_stream(WHEP_URL).await.unwrap();
        let mut seen = wait_for(&mut h.events, is_state(ConnectionState::Connected)).await;
        // Track callbacks are already queued once the answer is applied
        tokio::time::sleep(Duration::from_millis(100)).await;
        seen.extend(drain(&mut h.events));

        assert_eq!(
            transitions(&seen),
            vec![
                (ConnectionState::Idle, ConnectionState::Negotiating),
                (ConnectionState::Negotiating, ConnectionState::Connected),
            ]
        );
        let remote_added = seen
            .iter()
            .filter(|e| matches!(e, PlayerEvent::RemoteStreamAdded { .. }))
            .count();
        assert_eq!(remote_added, 1);
        assert!(seen.iter().all(|e| e.session_id() == id));
        assert!(seen.iter().any(|e| matches!(
            e,
            PlayerEvent::LocalSdpReady { sdp_type: SdpType::Offer, .. }
        )));

        {
            let offers = h.signaling.offers.lock();
            assert_eq!(offers.len(), 1);
            assert_eq!(offers[0].0, WHEP_URL);
            // Non-trickle: gathered candidates travel inside the offer
            assert!(offers[0].1.contains("a=candidate:1 1 udp"));
        }
        assert!(h.signaling.patches.lock().is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
        assert_eq!(h.engine.peer().remote.lock()[0].sdp_type, SdpType::Answer);

        h.manager.dispose().await.unwrap();
        assert_eq!(
            *h.signaling.deletes.lock(),
            vec!["https://example.com/whep/abc/session/1".to_string()]
        );
        assert!(h.engine.peer().closed.load(Ordering::SeqCst));
        assert_eq!(h.manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_second_play_is_rejected() {
        let mut h = harness(connecting(), Reply::Hang);

        let id = h.manager.play_stream(WHEP_URL).await.unwrap();
        wait_for(&mut h.events, is_state(ConnectionState::Negotiating)).await;

        let err = h.manager.play_stream(WHEP_URL).await.unwrap_err();
        assert!(matches!(err, PlayerError::AlreadyActive));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transitions(&drain(&mut h.events)).is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Negotiating);
        assert_eq!(h.manager.session_id().await, Some(id));

        h.manager.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_remote_description_is_rejected() {
        let mut h = harness(EngineScript::default(), Reply::Hang);

        h.manager.play_stream("room-42").await.unwrap();
        wait_for(&mut h.events, is_state(ConnectionState::Negotiating)).await;

        let err = h.manager.set_remote_description("", "answer").await.unwrap_err();
        assert!(matches!(err, PlayerError::InvalidSdp(_)));
        let err = h
            .manager
            .set_remote_description(REMOTE_SDP, "pranswer")
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::InvalidSdp(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut h.events);
        assert!(transitions(&events).is_empty());
        assert!(errors(&events).is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_whep_server_error_fails_session() {
        let mut h = harness(connecting(), Reply::Status(500));

        h.manager.play_stream(WHEP_URL).await.unwrap();
        let mut seen = wait_for(&mut h.events, is_state(ConnectionState::Failed)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        seen.extend(drain(&mut h.events));

        assert_eq!(errors(&seen), vec![crate::error::ErrorKind::SignalingProtocol]);
        let error_at = seen
            .iter()
            .position(|e| matches!(e, PlayerEvent::ConnectionError { .. }))
            .unwrap();
        let failed_at = seen.iter().position(is_state(ConnectionState::Failed)).unwrap();
        assert_eq!(failed_at, error_at + 1);

        assert_eq!(h.manager.state().await, ConnectionState::Failed);
        assert!(h.engine.peer().closed.load(Ordering::SeqCst));

        // Failed is terminal: dispose has nothing left to do
        h.manager.dispose().await.unwrap();
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_simulated_environment_excludes_h265() {
        let simulated = harness_with(
            EngineScript::default(),
            ScriptedSignaling::new(Reply::Hang),
            FixedCapabilities::new(vec![VideoCodec::H265], true),
            PlayerConfig::default(),
        );
        simulated.manager.play_stream("room-1").await.unwrap();
        eventually(|| !simulated.engine.options.lock().is_empty()).await;
        assert!(!simulated.engine.options.lock()[0].codecs.contains(VideoCodec::H265));

        let device = harness_with(
            EngineScript::default(),
            ScriptedSignaling::new(Reply::Hang),
            FixedCapabilities::new(vec![VideoCodec::H265], false),
            PlayerConfig::default(),
        );
        device.manager.play_stream("room-1").await.unwrap();
        eventually(|| !device.engine.options.lock().is_empty()).await;
        let options = device.engine.options.lock()[0].clone();
        assert!(options.codecs.contains(VideoCodec::H265));
        assert!(!options.receive_audio);
        assert_eq!(options.ice.stun_servers.len(), 3);
    }

    #[tokio::test]
    async fn test_signaling_timeout_fails_session() {
        let mut config = PlayerConfig::default();
        config.signaling.timeout_ms = 100;
        let mut h = harness_with(
            connecting(),
            ScriptedSignaling::new(Reply::Hang),
            FixedCapabilities::default(),
            config,
        );

        h.manager.play_stream(WHEP_URL).await.unwrap();
        let seen = wait_for(&mut h.events, is_state(ConnectionState::Failed)).await;
        assert_eq!(errors(&seen), vec![crate::error::ErrorKind::SignalingTransport]);
    }

    #[tokio::test]
    async fn test_engine_offer_failure_fails_session() {
        let script = EngineScript {
            fail_offer: true,
            ..connecting()
        };
        let mut h = harness(script, Reply::Answer(None));

        h.manager.play_stream(WHEP_URL).await.unwrap();
        let seen = wait_for(&mut h.events, is_state(ConnectionState::Failed)).await;
        assert_eq!(errors(&seen), vec![crate::error::ErrorKind::Negotiation]);
        assert!(h.signaling.offers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut h = harness(EngineScript::default(), Reply::Hang);

        // Nothing to dispose yet
        h.manager.dispose().await.unwrap();
        assert_eq!(h.manager.state().await, ConnectionState::Idle);

        let first = h.manager.play_stream("room-7").await.unwrap();
        wait_peer_ready(&h.manager).await;
        h.manager.dispose().await.unwrap();
        h.manager.dispose().await.unwrap();

        let events = drain(&mut h.events);
        assert_eq!(
            transitions(&events),
            vec![
                (ConnectionState::Idle, ConnectionState::Negotiating),
                (ConnectionState::Negotiating, ConnectionState::Closed),
            ]
        );
        assert_eq!(h.manager.state().await, ConnectionState::Closed);
        assert_eq!(h.manager.session_id().await, None);
        // No WHEP resource, nothing to DELETE
        assert!(h.signaling.deletes.lock().is_empty());

        // Reconnect is dispose + play
        let second = h.manager.play_stream("room-7").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.manager.state().await, ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_remote_candidates_apply_in_order() {
        let mut h = harness(EngineScript::default(), Reply::Hang);

        h.manager.play_stream("room-9").await.unwrap();
        wait_peer_ready(&h.manager).await;

        for candidate in ["candidate:a", "candidate:b", "candidate:bad", "candidate:c"] {
            h.manager
                .add_ice_candidate(candidate, Some(0), Some("0"))
                .await
                .unwrap();
        }
        assert!(h.engine.peer().candidates.lock().is_empty());

        h.manager
            .set_remote_description(REMOTE_SDP, "offer")
            .await
            .unwrap();
        assert_eq!(
            *h.engine.peer().candidates.lock(),
            vec!["candidate:a", "candidate:b", "candidate:c"]
        );

        // A rejected buffered candidate is reported but does not fail the session
        let events = drain(&mut h.events);
        assert_eq!(errors(&events), vec![crate::error::ErrorKind::IceApply]);
        assert_eq!(h.manager.state().await, ConnectionState::Negotiating);

        h.manager.add_ice_candidate("candidate:d", Some(0), None).await.unwrap();
        assert_eq!(h.engine.peer().candidates.lock().last().unwrap(), "candidate:d");

        let err = h
            .manager
            .add_ice_candidate("candidate:bad", Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::IceApply(_)));
        let err = h.manager.add_ice_candidate("  ", None, None).await.unwrap_err();
        assert!(matches!(err, PlayerError::IceApply(_)));

        let answer = h.manager.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::LocalSdpReady { sdp_type: SdpType::Answer, .. }
        )));

        // The remote side of this round is already set
        let err = h
            .manager
            .set_remote_description(REMOTE_SDP, "offer")
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::InvalidSdp(_)));
    }

    #[tokio::test]
    async fn test_create_answer_requires_remote_offer() {
        let mut h = harness(EngineScript::default(), Reply::Hang);

        let err = h.manager.create_answer().await.unwrap_err();
        assert!(matches!(err, PlayerError::Negotiation(_)));

        h.manager.play_stream("room-3").await.unwrap();
        wait_peer_ready(&h.manager).await;
        drain(&mut h.events);

        let err = h.manager.create_answer().await.unwrap_err();
        assert!(matches!(err, PlayerError::Negotiation(_)));
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_host_driven_offer_answer_connects() {
        let script = EngineScript {
            auto_connect: true,
            ..Default::default()
        };
        let mut h = harness(script, Reply::Hang);

        h.manager.play_stream("room-5").await.unwrap();
        wait_peer_ready(&h.manager).await;

        let offer = h.manager.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        let err = h.manager.create_offer().await.unwrap_err();
        assert!(matches!(err, PlayerError::Negotiation(_)));

        h.manager
            .set_remote_description(REMOTE_SDP, "ANSWER")
            .await
            .unwrap();
        wait_for(&mut h.events, is_state(ConnectionState::Connected)).await;

        // Host-driven targets never touch the WHEP client
        assert!(h.signaling.offers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_trickle_candidates_follow_answer() {
        let gate = Arc::new(Notify::new());
        let mut config = PlayerConfig::default();
        config.signaling.trickle_ice = true;
        let mut h = harness_with(
            EngineScript::default(),
            ScriptedSignaling::gated(Reply::Answer(Some("/whep/abc/session/7")), gate.clone()),
            FixedCapabilities::default(),
            config,
        );

        h.manager.play_stream(WHEP_URL).await.unwrap();
        // Trickle mode does not wait for gathering
        eventually(|| h.signaling.offers.lock().len() == 1).await;

        h.engine.peer().inject(EngineEvent::LocalCandidate(
            IceCandidate::new(HOST_CANDIDATE).with_mid("0", 0),
        ));
        wait_for(&mut h.events, |e| {
            matches!(e, PlayerEvent::IceCandidateReady { .. })
        })
        .await;
        // No answer yet, so nothing may be sent
        assert!(h.signaling.patches.lock().is_empty());

        gate.notify_one();
        eventually(|| h.signaling.patches.lock().len() == 1).await;
        {
            let patches = h.signaling.patches.lock();
            assert_eq!(patches[0].0, "https://example.com/whep/abc/session/7");
            assert!(patches[0].1.contains("a=ice-ufrag:test"));
            assert!(patches[0].1.contains("192.168.1.10 50000"));
            assert!(!patches[0].1.contains("end-of-candidates"));
        }

        h.engine.peer().inject(EngineEvent::GatheringComplete);
        eventually(|| h.signaling.patches.lock().len() == 2).await;
        assert!(h.signaling.patches.lock()[1].1.contains("a=end-of-candidates"));

        h.manager.dispose().await.unwrap();
        assert_eq!(h.signaling.deletes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_failure_closes_old_peer_first() {
        let script = EngineScript {
            slow_close: true,
            ..connecting()
        };
        let mut h = harness(script, Reply::Status(500));

        h.manager.play_stream(WHEP_URL).await.unwrap();
        wait_for(&mut h.events, is_state(ConnectionState::Failed)).await;

        // Retry straight from the Failed event
        h.manager.play_stream(WHEP_URL).await.unwrap();
        eventually(|| h.engine.log.lock().len() >= 3).await;
        assert_eq!(h.engine.log.lock()[..3], ["create", "close", "create"]);
        assert!(h.engine.peers.lock()[0].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_replay_after_dispose_closes_old_peer_first() {
        let script = EngineScript {
            slow_close: true,
            ..Default::default()
        };
        let h = harness(script, Reply::Hang);

        h.manager.play_stream("room-8").await.unwrap();
        wait_peer_ready(&h.manager).await;
        h.manager.dispose().await.unwrap();
        h.manager.play_stream("room-8").await.unwrap();
        wait_peer_ready(&h.manager).await;

        assert_eq!(*h.engine.log.lock(), vec!["create", "close", "create"]);
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_exchange() {
        let gate = Arc::new(Notify::new());
        let mut h = harness_with(
            connecting(),
            ScriptedSignaling::gated(Reply::Answer(Some("/whep/abc/session/2")), gate.clone()),
            FixedCapabilities::default(),
            PlayerConfig::default(),
        );

        h.manager.play_stream(WHEP_URL).await.unwrap();
        eventually(|| h.signaling.offers.lock().len() == 1).await;
        drain(&mut h.events);

        h.manager.dispose().await.unwrap();
        // The answer arrives after the session is gone
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_eq!(
            transitions(&events),
            vec![(ConnectionState::Negotiating, ConnectionState::Closed)]
        );
        let peer = h.engine.peer();
        assert!(peer.remote.lock().is_empty());
        assert!(peer.closed.load(Ordering::SeqCst));
        assert!(h.signaling.patches.lock().is_empty());
        assert!(h.signaling.deletes.lock().is_empty());
        assert_eq!(h.manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_gathering_done_before_answer_sends_end_of_candidates() {
        let gate = Arc::new(Notify::new());
        let mut config = PlayerConfig::default();
        config.ice.gathering_timeout_ms = 50;
        let h = harness_with(
            EngineScript::default(),
            ScriptedSignaling::gated(Reply::Answer(Some("/whep/abc/session/3")), gate.clone()),
            FixedCapabilities::default(),
            config,
        );

        h.manager.play_stream(WHEP_URL).await.unwrap();
        // Gathering timed out, so the offer went out incomplete
        eventually(|| h.signaling.offers.lock().len() == 1).await;

        h.engine.peer().inject(EngineEvent::GatheringComplete);
        wait_session(&h.manager, |s| *s.gathering_tx.borrow()).await;
        assert!(h.signaling.patches.lock().is_empty());

        gate.notify_one();
        eventually(|| h.signaling.patches.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let patches = h.signaling.patches.lock();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "https://example.com/whep/abc/session/3");
        assert!(patches[0].1.contains("a=end-of-candidates"));
        assert!(!patches[0].1.contains("a=candidate"));
    }

    #[tokio::test]
    async fn test_disconnect_and_recover() {
        let mut h = harness(connecting(), Reply::Answer(None));

        h.manager.play_stream(WHEP_URL).await.unwrap();
        wait_for(&mut h.events, is_state(ConnectionState::Connected)).await;

        let peer = h.engine.peer();
        peer.inject(EngineEvent::IceState(IceConnectivity::Disconnected));
        wait_for(&mut h.events, is_state(ConnectionState::Disconnected)).await;
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);

        peer.inject(EngineEvent::IceState(IceConnectivity::Connected));
        wait_for(&mut h.events, is_state(ConnectionState::Connected)).await;

        peer.inject(EngineEvent::PeerState(PeerState::Failed));
        peer.inject(EngineEvent::IceState(IceConnectivity::Failed));
        let mut seen = wait_for(&mut h.events, is_state(ConnectionState::Failed)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        seen.extend(drain(&mut h.events));
        assert_eq!(errors(&seen), vec![crate::error::ErrorKind::Engine]);

        // No resource URL was returned, so dispose has nothing to DELETE
        h.manager.dispose().await.unwrap();
        assert!(h.signaling.deletes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_targets() {
        let h = harness(EngineScript::default(), Reply::Hang);

        for target in ["", "   ", "http://", "https:// /whep"] {
            let err = h.manager.play_stream(target).await.unwrap_err();
            assert!(matches!(err, PlayerError::InvalidTarget(_)), "{:?}", target);
        }
        assert_eq!(h.manager.state().await, ConnectionState::Idle);
        assert!(h.engine.options.lock().is_empty());
    }

    #[test]
    fn test_stream_target_parsing() {
        assert_eq!(
            StreamTarget::parse(" https://example.com/whep ").unwrap(),
            StreamTarget::Whep("https://example.com/whep".to_string())
        );
        assert!(StreamTarget::parse("HTTP://example.com/whep").unwrap().is_whep());
        assert_eq!(
            StreamTarget::parse("room-42").unwrap(),
            StreamTarget::External("room-42".to_string())
        );
    }
}
