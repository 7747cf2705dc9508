//! Negotiation engine
//!
//! All inputs (UI commands, signaling messages, transport notifications,
//! negotiation outcomes, capture results) are serialized onto one queue and
//! handled one at a time by [`Engine::run`]. Description operations run on
//! the per-session worker in [`crate::peer::negotiator`]; their outcomes come
//! back through the same queue, stamped with the session generation.
//!
//! A session moves `Idle → Offering | Answering → Active → Closing → Idle`.
//! Teardown is the only cancellation: it drops the worker handle, stops the
//! remote tracks and closes the transport. Anything still in flight for the
//! old generation is discarded when it arrives.
//!
//! Glare is not resolved: an offer from the current peer while a transport
//! exists is applied to that transport without rollback.

use crate::error::{CallError, CaptureError, NegotiationError};
use crate::identity::{IdentityTracker, LocalIdentity};
use crate::logger::{EndReason, Notifier};
use crate::peer::media::{LocalMedia, MediaCapture};
use crate::peer::negotiator::{self, Step, StepOutcome};
use crate::peer::transport::{TransportEvent, TransportEventSink, TransportFactory};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{CallState, Session};
use crate::signaling::{SignalingChannel, SignalingMessage};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Per-step limit; `None` waits forever
    pub negotiation_timeout: Option<Duration>,
}

/// UI → engine requests
#[derive(Debug)]
pub enum Command {
    StartCapture,
    PlaceCall {
        target: String,
        reply: Option<oneshot::Sender<Result<(), CallError>>>,
    },
    HangUp,
    Rename(String),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Everything the engine reacts to
#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Signal(SignalingMessage),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Step {
        generation: u64,
        outcome: StepOutcome,
    },
    Captured(Result<Arc<LocalMedia>, CaptureError>),
}

/// Read-only view of the engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: CallState,
    pub remote: Option<String>,
    pub has_transport: bool,
    pub capture_ready: bool,
    pub identity: LocalIdentity,
    pub roster: Vec<String>,
}

/// Cloneable entry point for the UI and the signaling reader
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    /// A handle with no engine behind it; the receiver sees what was posted.
    #[cfg(test)]
    pub(crate) fn detached() -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EngineHandle { tx }, rx)
    }

    fn post(&self, event: EngineEvent) -> Result<(), CallError> {
        self.tx.send(event).map_err(|_| CallError::EngineStopped)
    }

    fn command(&self, cmd: Command) -> Result<(), CallError> {
        self.post(EngineEvent::Command(cmd))
    }

    pub fn start_media_capture(&self) -> Result<(), CallError> {
        self.command(Command::StartCapture)
    }

    /// Resolves once the engine has accepted or rejected the call.
    pub async fn place_call(&self, target: impl Into<String>) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::PlaceCall {
            target: target.into(),
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }

    pub fn hang_up(&self) -> Result<(), CallError> {
        self.command(Command::HangUp)
    }

    pub fn rename(&self, name: impl Into<String>) -> Result<(), CallError> {
        self.command(Command::Rename(name.into()))
    }

    pub async fn snapshot(&self) -> Result<Snapshot, CallError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply))?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Hands an inbound signaling message to the engine.
    pub fn deliver(&self, msg: SignalingMessage) -> Result<(), CallError> {
        self.post(EngineEvent::Signal(msg))
    }

    pub fn shutdown(&self) -> Result<(), CallError> {
        self.command(Command::Shutdown)
    }
}

pub struct Engine {
    identity: IdentityTracker,
    session: Session,
    next_generation: u64,
    local_media: Option<Arc<LocalMedia>>,
    capture_pending: bool,
    transports: Arc<dyn TransportFactory>,
    capture: Arc<dyn MediaCapture>,
    signaling: Arc<dyn SignalingChannel>,
    notifier: Notifier,
    config: EngineConfig,
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Engine {
    pub fn new(
        identity: IdentityTracker,
        transports: Arc<dyn TransportFactory>,
        capture: Arc<dyn MediaCapture>,
        signaling: Arc<dyn SignalingChannel>,
        notifier: Notifier,
        config: EngineConfig,
    ) -> (Engine, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx: tx.clone() };
        let engine = Engine {
            identity,
            session: Session::idle(0),
            next_generation: 1,
            local_media: None,
            capture_pending: false,
            transports,
            capture,
            signaling,
            notifier,
            config,
            tx,
            rx,
        };
        (engine, handle)
    }

    /// Processes events until shutdown.
    pub async fn run(mut self) {
        tracing::info!(name = %self.identity.name(), "engine started");
        while let Some(event) = self.rx.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }
        tracing::info!("engine stopped");
    }

    async fn handle_event(&mut self, event: EngineEvent) -> ControlFlow<()> {
        match event {
            EngineEvent::Command(cmd) => return self.on_command(cmd).await,
            EngineEvent::Signal(msg) => self.on_signal(msg).await,
            EngineEvent::Transport { generation, event } => {
                if self.is_current(generation) {
                    self.on_transport_event(event).await;
                } else {
                    tracing::debug!(generation, ?event, "dropping event from stale transport");
                    if let TransportEvent::RemoteTrackAdded(track) = event {
                        track.stop().await;
                    }
                }
            }
            EngineEvent::Step {
                generation,
                outcome,
            } => {
                if self.is_current(generation) {
                    self.on_step(outcome).await;
                } else {
                    tracing::debug!(generation, ?outcome, "discarding stale negotiation result");
                }
            }
            EngineEvent::Captured(result) => self.on_captured(result),
        }
        ControlFlow::Continue(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.has_transport() && self.session.generation == generation
    }

    async fn on_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::StartCapture => self.start_capture(),
            Command::PlaceCall { target, reply } => {
                let result = self.place_call(target).await;
                if let Err(e) = &result {
                    tracing::warn!("call rejected: {e}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::HangUp => self.hang_up().await,
            Command::Rename(name) => {
                let claim = self.identity.rename(name);
                self.send(claim);
                self.notifier.emit_identity_changed(self.identity.name());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {
                self.teardown(EndReason::Shutdown).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.session.state,
            remote: self.session.remote.clone(),
            has_transport: self.session.has_transport(),
            capture_ready: self.local_media.is_some(),
            identity: self.identity.local().clone(),
            roster: self.identity.roster().to_vec(),
        }
    }

    fn send(&self, msg: SignalingMessage) {
        let kind = msg.kind();
        if let Err(e) = self.signaling.send(msg) {
            tracing::warn!(kind, "failed to send to server: {e}");
        }
    }

    fn start_capture(&mut self) {
        if self.local_media.is_some() {
            self.notifier.emit_capture_ready();
            return;
        }
        if self.capture_pending {
            tracing::debug!("capture already in progress");
            return;
        }
        self.capture_pending = true;
        let capture = Arc::clone(&self.capture);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = capture.open().await;
            let _ = tx.send(EngineEvent::Captured(result));
        });
    }

    fn on_captured(&mut self, result: Result<Arc<LocalMedia>, CaptureError>) {
        self.capture_pending = false;
        match result {
            Ok(media) => {
                tracing::info!(stream = %media.stream_id, "capture ready");
                self.local_media = Some(media);
                self.notifier.emit_capture_ready();
            }
            Err(e) => {
                tracing::error!("media capture failed: {e}");
                self.notifier.emit_capture_failed(e.to_string());
            }
        }
    }

    async fn place_call(&mut self, target: String) -> Result<(), CallError> {
        let target = target.trim().to_owned();
        if target.is_empty() || target == self.identity.name() {
            return Err(CallError::InvalidTarget(target));
        }
        let Some(media) = self.local_media.clone() else {
            return Err(CallError::NoLocalMedia);
        };
        if self.session.state != CallState::Idle {
            return Err(CallError::Busy(self.session.remote.clone().unwrap_or_default()));
        }

        tracing::info!(%target, "placing call");
        // the offer itself is produced once the transport asks for negotiation
        if let Err(e) = self.open_session(target, CallState::Offering, &media).await {
            let reason = e.to_string();
            self.fail(e).await;
            return Err(CallError::Setup(reason));
        }
        Ok(())
    }

    /// Creates the transport for a new session and attaches local media.
    async fn open_session(
        &mut self,
        remote: String,
        state: CallState,
        media: &LocalMedia,
    ) -> Result<(), NegotiationError> {
        if self.session.has_transport() {
            tracing::warn!(session = %self.session.id, "replacing stale transport");
            self.teardown(EndReason::Failed("superseded by a new call".into()))
                .await;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = TransportEventSink::new(generation, self.tx.clone());
        let transport = self.transports.create(sink).await?;

        let mut session = Session::idle(generation);
        session.state = state;
        session.remote = Some(remote);
        session.negotiator = Some(negotiator::spawn(
            generation,
            Arc::clone(&transport),
            self.config.negotiation_timeout,
            self.tx.clone(),
        ));
        session.transport = Some(Arc::clone(&transport));
        tracing::debug!(session = %session.id, generation, %state, "transport created");
        self.session = session;

        transport.attach_media(media).await?;
        if let Some(remote) = &self.session.remote {
            self.notifier.emit_call_ready(remote);
        }
        Ok(())
    }

    fn submit(&self, step: Step) {
        if let Some(negotiator) = &self.session.negotiator {
            negotiator.submit(step);
        }
    }

    async fn hang_up(&mut self) {
        if self.session.is_idle() {
            tracing::debug!("hang up without a call");
            return;
        }
        if let Some(target) = self.session.remote.clone() {
            self.send(SignalingMessage::HangUp {
                name: Some(self.identity.name().to_owned()),
                target: Some(target),
            });
        }
        self.teardown(EndReason::LocalHangUp).await;
    }

    async fn fail(&mut self, err: NegotiationError) {
        tracing::error!(session = %self.session.id, "negotiation failed: {err}");
        self.notifier.emit_call_failed(err.to_string());
        self.teardown(EndReason::Failed(err.to_string())).await;
    }

    /// Closing → Idle. A no-op when there is nothing to tear down.
    async fn teardown(&mut self, reason: EndReason) {
        if self.session.is_idle() {
            tracing::debug!(?reason, "teardown requested with no session");
            return;
        }
        let mut session = std::mem::replace(&mut self.session, Session::idle(0));
        session.state = CallState::Closing;
        tracing::info!(session = %session.id, remote = ?session.remote, ?reason, "closing call");

        drop(session.negotiator.take());
        for track in session.remote_tracks.drain(..) {
            track.stop().await;
        }
        if let Some(transport) = session.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::debug!(session = %session.id, "transport close: {e}");
            }
        }
        session.local_candidates.log_summary();
        self.notifier.emit_session_ended(reason);
    }

    async fn on_signal(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::IdAssigned { id } => {
                let claim = self.identity.assign_id(id);
                self.send(claim);
            }
            SignalingMessage::NameRejected { name } => {
                if self.identity.reject_name(name) {
                    self.notifier.emit_identity_changed(self.identity.name());
                }
            }
            SignalingMessage::UserList { users } => {
                self.identity.replace_roster(users);
                self.notifier.emit_roster_changed(self.identity.roster());
            }
            SignalingMessage::Username { name, .. } => {
                tracing::debug!(%name, "ignoring name claim addressed to the server");
            }
            SignalingMessage::VideoOffer { name, sdp, .. } => self.on_offer(name, sdp).await,
            SignalingMessage::VideoAnswer { name, sdp, .. } => {
                if self.from_other_peer(name.as_deref(), "answer") {
                    return;
                }
                self.on_answer(sdp);
            }
            SignalingMessage::NewIceCandidate {
                name, candidate, ..
            } => {
                if self.from_other_peer(name.as_deref(), "candidate") {
                    return;
                }
                self.on_candidate(candidate);
            }
            SignalingMessage::HangUp { name, .. } => {
                if self.session.is_idle() {
                    tracing::debug!(from = ?name, "hang-up with no call, ignoring");
                    return;
                }
                if self.from_other_peer(name.as_deref(), "hang-up") {
                    return;
                }
                tracing::info!(from = ?name, "remote hung up");
                self.teardown(EndReason::RemoteHangUp).await;
            }
        }
    }

    /// A named sender that is not our current remote; such messages are stale.
    fn from_other_peer(&self, sender: Option<&str>, kind: &'static str) -> bool {
        match (sender, self.session.remote.as_deref()) {
            (Some(from), Some(remote)) if from != remote => {
                tracing::debug!(from, remote, kind, "message from a peer outside the call, discarding");
                true
            }
            _ => false,
        }
    }

    async fn on_offer(&mut self, sender: Option<String>, offer: SessionDescription) {
        let Some(sender) = sender.filter(|s| !s.is_empty()) else {
            tracing::warn!("offer without sender, ignoring");
            return;
        };

        if self.session.has_transport() {
            if self.session.remote.as_deref() != Some(sender.as_str()) {
                tracing::warn!(
                    from = %sender,
                    current = ?self.session.remote,
                    "offer while in another call, ignoring"
                );
                return;
            }
            tracing::warn!(
                from = %sender,
                state = %self.session.state,
                "offer on an existing transport, applying without rollback"
            );
            self.session.state = CallState::Answering;
            self.submit(Step::Answer(offer));
            return;
        }

        let Some(media) = self.local_media.clone() else {
            tracing::warn!(from = %sender, "offer received before local media is ready, ignoring");
            return;
        };
        tracing::info!(from = %sender, "incoming call");
        if let Err(e) = self
            .open_session(sender, CallState::Answering, &media)
            .await
        {
            self.fail(e).await;
            return;
        }
        self.submit(Step::Answer(offer));
    }

    fn on_answer(&mut self, answer: SessionDescription) {
        if !self.session.has_transport() {
            tracing::debug!("answer with no transport, discarding");
            return;
        }
        self.submit(Step::ApplyAnswer(answer));
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        if !self.session.has_transport() {
            tracing::debug!(candidate = %candidate.candidate, "candidate with no transport, discarding");
            return;
        }
        self.submit(Step::Candidate(candidate));
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::CandidateDiscovered(candidate) => {
                self.session.local_candidates.record(&candidate);
                if let Some(target) = self.session.remote.clone() {
                    self.send(SignalingMessage::NewIceCandidate {
                        name: None,
                        target: Some(target),
                        candidate,
                    });
                }
            }
            TransportEvent::ConnectivityChanged(st) => {
                if st.ends_session() {
                    self.teardown(EndReason::ConnectivityLost(st.to_string()))
                        .await;
                } else {
                    tracing::debug!(session = %self.session.id, "connectivity {st}");
                }
            }
            TransportEvent::NegotiationNeeded => {
                if self.session.state == CallState::Offering && !self.session.offer_in_flight {
                    self.session.offer_in_flight = true;
                    self.submit(Step::Offer);
                } else {
                    tracing::debug!(state = %self.session.state, "negotiation needed ignored");
                }
            }
            TransportEvent::RemoteTrackAdded(track) => {
                self.notifier.emit_remote_track(track.id(), track.kind());
                self.session.remote_tracks.push(track);
            }
            TransportEvent::SignalingStateChanged(st) => {
                if st == crate::peer::state::SignalingState::Closed {
                    self.teardown(EndReason::SignalingClosed).await;
                } else {
                    tracing::debug!(session = %self.session.id, "signaling state {st:?}");
                }
            }
        }
    }

    async fn on_step(&mut self, outcome: StepOutcome) {
        let remote = self.session.remote.clone().unwrap_or_default();
        match outcome {
            StepOutcome::OfferReady(sdp) => {
                self.session.offer_in_flight = false;
                if self.session.state != CallState::Offering {
                    tracing::debug!(state = %self.session.state, "offer no longer needed");
                    return;
                }
                self.send(SignalingMessage::VideoOffer {
                    name: Some(self.identity.name().to_owned()),
                    target: Some(remote),
                    sdp,
                });
            }
            StepOutcome::AnswerReady(sdp) => {
                self.send(SignalingMessage::VideoAnswer {
                    name: Some(self.identity.name().to_owned()),
                    target: Some(remote.clone()),
                    sdp,
                });
                self.activate(&remote);
            }
            StepOutcome::AnswerApplied => self.activate(&remote),
            StepOutcome::Failed(e) => self.fail(e).await,
        }
    }

    fn activate(&mut self, remote: &str) {
        if self.session.state == CallState::Active {
            return;
        }
        tracing::info!(session = %self.session.id, %remote, "call active");
        self.session.state = CallState::Active;
        self.notifier.emit_session_active(remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Notification;
    use crate::peer::media::RemoteTrack;
    use crate::peer::state::{ConnectivityState, SignalingState};
    use crate::peer::transport::TransportHandle;
    use crate::peer::types::SdpKind;
    use crate::error::SignalingError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        AttachMedia,
        CreateOffer,
        CreateAnswer,
        SetLocal(SdpKind),
        SetRemote(SdpKind),
        AddCandidate(String),
        Close,
    }

    #[derive(Default, Clone)]
    struct Behaviour {
        gate_offer: Option<Arc<Notify>>,
        fail_set_remote: bool,
    }

    struct FakeTransport {
        calls: Mutex<Vec<Call>>,
        closed: AtomicBool,
        behaviour: Behaviour,
        sink: TransportEventSink,
    }

    impl FakeTransport {
        fn record(&self, call: Call) -> Result<(), NegotiationError> {
            self.calls.lock().unwrap().push(call);
            if self.closed.load(Ordering::SeqCst) {
                return Err(NegotiationError::Closed);
            }
            Ok(())
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn closes(&self) -> usize {
            self.calls().iter().filter(|c| **c == Call::Close).count()
        }
    }

    #[async_trait]
    impl TransportHandle for FakeTransport {
        async fn attach_media(&self, _media: &LocalMedia) -> Result<(), NegotiationError> {
            self.record(Call::AttachMedia)?;
            self.sink.emit(TransportEvent::NegotiationNeeded);
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            self.calls.lock().unwrap().push(Call::CreateOffer);
            if let Some(gate) = &self.behaviour.gate_offer {
                gate.notified().await;
            }
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            self.record(Call::CreateAnswer)?;
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.record(Call::SetLocal(desc.kind))
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.record(Call::SetRemote(desc.kind))?;
            if self.behaviour.fail_set_remote {
                return Err(NegotiationError::SetRemoteDescription("malformed".into()));
            }
            Ok(())
        }

        async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            self.record(Call::AddCandidate(candidate.candidate))
        }

        async fn close(&self) -> Result<(), NegotiationError> {
            self.calls.lock().unwrap().push(Call::Close);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        behaviour: Behaviour,
        created: Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn transport(&self, i: usize) -> Arc<FakeTransport> {
            Arc::clone(&self.created.lock().unwrap()[i])
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            events: TransportEventSink,
        ) -> Result<Arc<dyn TransportHandle>, NegotiationError> {
            let t = Arc::new(FakeTransport {
                calls: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                behaviour: self.behaviour.clone(),
                sink: events,
            });
            self.created.lock().unwrap().push(Arc::clone(&t));
            Ok(t)
        }
    }

    struct FakeCapture {
        fail: bool,
    }

    #[async_trait]
    impl MediaCapture for FakeCapture {
        async fn open(&self) -> Result<Arc<LocalMedia>, CaptureError> {
            if self.fail {
                return Err(CaptureError::PermissionDenied("NotAllowedError".into()));
            }
            Ok(Arc::new(LocalMedia::new("fake-stream", Vec::new())))
        }
    }

    struct FakeSignaling {
        tx: mpsc::UnboundedSender<SignalingMessage>,
    }

    impl SignalingChannel for FakeSignaling {
        fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
            self.tx.send(message).map_err(|_| SignalingError::Closed)
        }
    }

    #[derive(Default)]
    struct FakeTrack {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl RemoteTrack for FakeTrack {
        fn id(&self) -> String {
            "remote-video".into()
        }

        fn kind(&self) -> String {
            "video".into()
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        handle: EngineHandle,
        factory: Arc<FakeFactory>,
        sent: mpsc::UnboundedReceiver<SignalingMessage>,
        notes: mpsc::UnboundedReceiver<Notification>,
    }

    fn harness_with(behaviour: Behaviour, capture_fails: bool) -> Harness {
        harness_with_config(behaviour, capture_fails, EngineConfig::default())
    }

    fn harness_with_config(
        behaviour: Behaviour,
        capture_fails: bool,
        config: EngineConfig,
    ) -> Harness {
        let factory = Arc::new(FakeFactory {
            behaviour,
            ..Default::default()
        });
        let (notifier, notes) = Notifier::channel();
        let (sig_tx, sent) = mpsc::unbounded_channel();
        let (engine, handle) = Engine::new(
            IdentityTracker::new("alice", 7),
            factory.clone(),
            Arc::new(FakeCapture {
                fail: capture_fails,
            }),
            Arc::new(FakeSignaling { tx: sig_tx }),
            notifier,
            config,
        );
        tokio::spawn(engine.run());
        Harness {
            handle,
            factory,
            sent,
            notes,
        }
    }

    fn harness() -> Harness {
        harness_with(Behaviour::default(), false)
    }

    fn offer_from(name: &str) -> SignalingMessage {
        SignalingMessage::VideoOffer {
            name: Some(name.into()),
            target: Some("alice".into()),
            sdp: SessionDescription::offer("v=0 remote offer"),
        }
    }

    fn answer_from(name: &str) -> SignalingMessage {
        SignalingMessage::VideoAnswer {
            name: Some(name.into()),
            target: Some("alice".into()),
            sdp: SessionDescription::answer("v=0 remote answer"),
        }
    }

    fn candidate(i: usize) -> SignalingMessage {
        SignalingMessage::NewIceCandidate {
            name: None,
            target: Some("alice".into()),
            candidate: IceCandidate::new(format!("candidate:{i} 1 udp 1 10.0.0.{i} 9 typ host")),
        }
    }

    fn hang_up_from(name: &str) -> SignalingMessage {
        SignalingMessage::HangUp {
            name: Some(name.into()),
            target: Some("alice".into()),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    impl Harness {
        async fn next_sent(&mut self) -> SignalingMessage {
            timeout(WAIT, self.sent.recv())
                .await
                .expect("nothing sent")
                .expect("signaling closed")
        }

        async fn wait_note(&mut self, want: impl Fn(&Notification) -> bool) -> Notification {
            loop {
                let n = timeout(WAIT, self.notes.recv())
                    .await
                    .expect("notification not emitted")
                    .expect("notifier closed");
                if want(&n) {
                    return n;
                }
            }
        }

        /// Barrier: every event posted before this has been handled.
        async fn settle(&self) -> Snapshot {
            self.handle.snapshot().await.unwrap()
        }

        fn nothing_sent(&mut self) -> bool {
            self.sent.try_recv().is_err()
        }

        fn drain_notes(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.notes.try_recv() {
                out.push(n);
            }
            out
        }

        async fn capture(&mut self) {
            self.handle.start_media_capture().unwrap();
            self.wait_note(|n| *n == Notification::CaptureReady).await;
        }

        /// Bob calls us and we answer.
        async fn answered_call(&mut self) -> Arc<FakeTransport> {
            self.capture().await;
            self.handle.deliver(offer_from("bob")).unwrap();
            self.next_sent().await;
            self.wait_note(|n| matches!(n, Notification::SessionActive { .. }))
                .await;
            self.factory.transport(0)
        }

        /// We call bob and the offer has gone out.
        async fn placed_call(&mut self) -> Arc<FakeTransport> {
            self.capture().await;
            self.handle.place_call("bob").await.unwrap();
            match self.next_sent().await {
                SignalingMessage::VideoOffer { target, .. } => {
                    assert_eq!(target.as_deref(), Some("bob"))
                }
                other => panic!("expected offer, got {other:?}"),
            }
            self.factory.transport(0)
        }
    }

    fn ended(n: &Notification) -> bool {
        matches!(n, Notification::SessionEnded(_))
    }

    #[tokio::test]
    async fn offer_while_idle_is_answered_to_its_sender() {
        let mut h = harness();
        h.capture().await;
        h.handle.deliver(offer_from("bob")).unwrap();

        match h.next_sent().await {
            SignalingMessage::VideoAnswer { name, target, sdp } => {
                assert_eq!(name.as_deref(), Some("alice"));
                assert_eq!(target.as_deref(), Some("bob"));
                assert_eq!(sdp.kind, SdpKind::Answer);
            }
            other => panic!("expected answer, got {other:?}"),
        }
        h.wait_note(|n| *n == Notification::SessionActive { remote: "bob".into() })
            .await;

        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Active);
        assert_eq!(snap.remote.as_deref(), Some("bob"));
        assert!(h.nothing_sent());
        assert_eq!(
            h.factory.transport(0).calls(),
            vec![
                Call::AttachMedia,
                Call::SetRemote(SdpKind::Offer),
                Call::CreateAnswer,
                Call::SetLocal(SdpKind::Answer),
            ]
        );
    }

    #[tokio::test]
    async fn early_candidates_are_flushed_in_order_after_the_answer() {
        let mut h = harness();
        let t = h.placed_call().await;
        for i in 0..3 {
            h.handle.deliver(candidate(i)).unwrap();
        }
        h.settle().await;
        assert!(!t.calls().iter().any(|c| matches!(c, Call::AddCandidate(_))));

        h.handle.deliver(answer_from("bob")).unwrap();
        h.wait_note(|n| matches!(n, Notification::SessionActive { .. }))
            .await;

        let calls = t.calls();
        let at = calls
            .iter()
            .position(|c| *c == Call::SetRemote(SdpKind::Answer))
            .unwrap();
        let added: Vec<_> = calls[at + 1..]
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(line) => Some(line.split(' ').next().unwrap().to_owned()),
                _ => None,
            })
            .collect();
        assert_eq!(added, ["candidate:0", "candidate:1", "candidate:2"]);

        h.handle.deliver(candidate(3)).unwrap();
        wait_until(|| {
            t.calls()
                .iter()
                .filter(|c| matches!(c, Call::AddCandidate(_)))
                .count()
                == 4
        })
        .await;
    }

    #[tokio::test]
    async fn remote_hang_up_stops_tracks_without_replying() {
        let mut h = harness();
        let t = h.answered_call().await;
        let track = Arc::new(FakeTrack::default());
        t.sink
            .emit(TransportEvent::RemoteTrackAdded(track.clone()));
        h.wait_note(|n| matches!(n, Notification::RemoteTrack { .. }))
            .await;

        h.handle.deliver(hang_up_from("bob")).unwrap();
        assert_eq!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::RemoteHangUp)
        );

        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Idle);
        assert!(!snap.has_transport);
        assert_eq!(track.stops.load(Ordering::SeqCst), 1);
        assert_eq!(t.closes(), 1);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn local_hang_up_announces_termination() {
        let mut h = harness();
        let t = h.placed_call().await;
        h.handle.hang_up().unwrap();

        match h.next_sent().await {
            SignalingMessage::HangUp { name, target } => {
                assert_eq!(name.as_deref(), Some("alice"));
                assert_eq!(target.as_deref(), Some("bob"));
            }
            other => panic!("expected hang-up, got {other:?}"),
        }
        assert_eq!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::LocalHangUp)
        );
        assert_eq!(t.closes(), 1);
    }

    #[tokio::test]
    async fn teardown_runs_once_when_triggers_race() {
        let mut h = harness();
        let t = h.answered_call().await;
        h.drain_notes();

        h.handle.hang_up().unwrap();
        t.sink.emit(TransportEvent::ConnectivityChanged(
            ConnectivityState::Failed,
        ));
        h.handle.deliver(hang_up_from("bob")).unwrap();
        h.handle.hang_up().unwrap();
        h.settle().await;

        assert_eq!(t.closes(), 1);
        let ended: Vec<_> = h.drain_notes().into_iter().filter(ended).collect();
        assert_eq!(ended, vec![Notification::SessionEnded(EndReason::LocalHangUp)]);
        // one hang-up for the first local request only
        assert!(matches!(h.next_sent().await, SignalingMessage::HangUp { .. }));
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn candidate_without_transport_is_discarded() {
        let mut h = harness();
        let before = h.settle().await;
        h.handle.deliver(candidate(0)).unwrap();
        h.handle.deliver(answer_from("bob")).unwrap();
        let after = h.settle().await;

        assert_eq!(before, after);
        assert_eq!(h.factory.count(), 0);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn rename_announces_but_forced_name_does_not() {
        let mut h = harness();
        h.handle.rename("alicia").unwrap();
        match h.next_sent().await {
            SignalingMessage::Username { name, id, .. } => {
                assert_eq!(name, "alicia");
                assert_eq!(id, 7);
            }
            other => panic!("expected name claim, got {other:?}"),
        }
        h.wait_note(|n| *n == Notification::IdentityChanged("alicia".into()))
            .await;

        h.handle
            .deliver(SignalingMessage::NameRejected {
                name: "alicia2".into(),
            })
            .unwrap();
        h.wait_note(|n| *n == Notification::IdentityChanged("alicia2".into()))
            .await;
        let snap = h.settle().await;
        assert_eq!(snap.identity.name, "alicia2");
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn assigned_id_triggers_name_claim() {
        let mut h = harness();
        h.handle
            .deliver(SignalingMessage::IdAssigned { id: 31 })
            .unwrap();
        match h.next_sent().await {
            SignalingMessage::Username { name, id, .. } => {
                assert_eq!(name, "alice");
                assert_eq!(id, 31);
            }
            other => panic!("expected name claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roster_updates_replace_the_list() {
        let mut h = harness();
        h.handle
            .deliver(SignalingMessage::UserList {
                users: vec!["alice".into(), "bob".into()],
            })
            .unwrap();
        h.handle
            .deliver(SignalingMessage::UserList {
                users: vec!["carol".into()],
            })
            .unwrap();
        h.wait_note(|n| *n == Notification::RosterChanged(vec!["carol".into()]))
            .await;
        assert_eq!(h.settle().await.roster, vec!["carol".to_owned()]);
    }

    #[tokio::test]
    async fn placing_a_call_without_media_is_rejected() {
        let mut h = harness();
        assert_eq!(
            h.handle.place_call("bob").await,
            Err(CallError::NoLocalMedia)
        );
        h.settle().await;
        assert_eq!(h.factory.count(), 0);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn second_call_is_busy_and_self_call_is_invalid() {
        let mut h = harness();
        h.placed_call().await;
        assert_eq!(
            h.handle.place_call("carol").await,
            Err(CallError::Busy("bob".into()))
        );
        assert_eq!(
            h.handle.place_call("alice").await,
            Err(CallError::InvalidTarget("alice".into()))
        );
        assert_eq!(h.factory.count(), 1);
    }

    #[tokio::test]
    async fn capture_failure_is_surfaced() {
        let mut h = harness_with(Behaviour::default(), true);
        h.handle.start_media_capture().unwrap();
        h.wait_note(|n| matches!(n, Notification::CaptureFailed(_)))
            .await;
        assert!(!h.settle().await.capture_ready);
        assert_eq!(
            h.handle.place_call("bob").await,
            Err(CallError::NoLocalMedia)
        );
    }

    #[tokio::test]
    async fn offer_before_capture_is_ignored() {
        let mut h = harness();
        h.handle.deliver(offer_from("bob")).unwrap();
        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Idle);
        assert_eq!(h.factory.count(), 0);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn hang_up_during_pending_offer_stops_queued_steps() {
        let gate = Arc::new(Notify::new());
        let mut h = harness_with(
            Behaviour {
                gate_offer: Some(gate.clone()),
                ..Default::default()
            },
            false,
        );
        h.capture().await;
        h.handle.place_call("bob").await.unwrap();
        let t = h.factory.transport(0);
        wait_until(|| t.calls().contains(&Call::CreateOffer)).await;

        // queued behind the blocked offer
        h.handle.deliver(answer_from("bob")).unwrap();
        h.handle.deliver(candidate(0)).unwrap();
        h.handle.hang_up().unwrap();
        assert!(matches!(h.next_sent().await, SignalingMessage::HangUp { .. }));
        h.wait_note(ended).await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snap = h.settle().await;

        assert_eq!(snap.state, CallState::Idle);
        assert_eq!(
            t.calls(),
            vec![Call::AttachMedia, Call::CreateOffer, Call::Close]
        );
        assert!(h.nothing_sent());
        assert!(!h
            .drain_notes()
            .iter()
            .any(|n| matches!(n, Notification::CallFailed(_))));
    }

    #[tokio::test]
    async fn stalled_step_times_out_and_tears_down() {
        let gate = Arc::new(Notify::new());
        let mut h = harness_with_config(
            Behaviour {
                gate_offer: Some(gate),
                ..Default::default()
            },
            false,
            EngineConfig {
                negotiation_timeout: Some(Duration::from_millis(50)),
            },
        );
        h.capture().await;
        h.handle.place_call("bob").await.unwrap();

        match h
            .wait_note(|n| matches!(n, Notification::CallFailed(_)))
            .await
        {
            Notification::CallFailed(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::Failed(_))
        ));
        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Idle);
        assert_eq!(h.factory.transport(0).closes(), 1);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn third_party_hang_up_leaves_the_call_alone() {
        let mut h = harness();
        let t = h.answered_call().await;
        h.handle.deliver(offer_from("carol")).unwrap();
        h.handle.deliver(hang_up_from("carol")).unwrap();

        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Active);
        assert_eq!(snap.remote.as_deref(), Some("bob"));
        assert_eq!(t.closes(), 0);
        assert!(!h.drain_notes().iter().any(ended));
    }

    #[tokio::test]
    async fn third_party_answer_and_candidate_are_discarded() {
        let mut h = harness();
        let t = h.answered_call().await;
        let before = t.calls();

        h.handle.deliver(answer_from("carol")).unwrap();
        h.handle
            .deliver(SignalingMessage::NewIceCandidate {
                name: Some("carol".into()),
                target: Some("alice".into()),
                candidate: IceCandidate::new("candidate:7 1 udp 1 10.0.0.7 9 typ host"),
            })
            .unwrap();
        // unnamed candidates are still accepted
        h.handle.deliver(candidate(1)).unwrap();
        wait_until(|| t.calls().len() == before.len() + 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.settle().await;

        let after = t.calls();
        assert_eq!(&after[..before.len()], &before[..]);
        assert!(matches!(&after[before.len()..], [Call::AddCandidate(line)] if line.starts_with("candidate:1 ")));
        assert_eq!(h.settle().await.state, CallState::Active);
    }

    #[tokio::test]
    async fn connectivity_loss_ends_the_session() {
        let mut h = harness();
        let t = h.answered_call().await;
        t.sink.emit(TransportEvent::ConnectivityChanged(
            ConnectivityState::Checking,
        ));
        assert_eq!(h.settle().await.state, CallState::Active);

        t.sink.emit(TransportEvent::ConnectivityChanged(
            ConnectivityState::Disconnected,
        ));
        assert_eq!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::ConnectivityLost("Disconnected".into()))
        );
        assert_eq!(t.closes(), 1);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn closed_signaling_state_ends_the_session() {
        let mut h = harness();
        let t = h.placed_call().await;
        t.sink
            .emit(TransportEvent::SignalingStateChanged(SignalingState::Closed));
        assert_eq!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::SignalingClosed)
        );
    }

    #[tokio::test]
    async fn failed_negotiation_tears_down_and_reports() {
        let mut h = harness_with(
            Behaviour {
                fail_set_remote: true,
                ..Default::default()
            },
            false,
        );
        h.capture().await;
        h.handle.deliver(offer_from("bob")).unwrap();

        h.wait_note(|n| matches!(n, Notification::CallFailed(_)))
            .await;
        assert!(matches!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::Failed(_))
        ));
        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Idle);
        assert_eq!(h.factory.transport(0).closes(), 1);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn local_candidates_are_sent_to_the_remote() {
        let mut h = harness();
        let t = h.placed_call().await;
        t.sink.emit(TransportEvent::CandidateDiscovered(IceCandidate::new(
            "candidate:9 1 udp 1 192.168.0.9 9 typ host",
        )));
        match h.next_sent().await {
            SignalingMessage::NewIceCandidate { target, candidate, .. } => {
                assert_eq!(target.as_deref(), Some("bob"));
                assert!(candidate.candidate.starts_with("candidate:9"));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_from_an_old_transport_are_ignored() {
        let mut h = harness();
        let old = h.placed_call().await;
        h.handle.hang_up().unwrap();
        h.next_sent().await;
        h.wait_note(ended).await;

        h.handle.place_call("bob").await.unwrap();
        h.next_sent().await;
        let stale_track = Arc::new(FakeTrack::default());
        old.sink.emit(TransportEvent::ConnectivityChanged(
            ConnectivityState::Failed,
        ));
        old.sink
            .emit(TransportEvent::RemoteTrackAdded(stale_track.clone()));

        let snap = h.settle().await;
        assert_eq!(snap.state, CallState::Offering);
        assert!(snap.has_transport);
        assert_eq!(stale_track.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.transport(1).closes(), 0);
    }

    #[tokio::test]
    async fn renegotiating_offer_from_current_peer_reuses_the_transport() {
        let mut h = harness();
        h.answered_call().await;
        h.handle.deliver(offer_from("bob")).unwrap();
        assert!(matches!(
            h.next_sent().await,
            SignalingMessage::VideoAnswer { .. }
        ));
        assert_eq!(h.factory.count(), 1);

        h.handle.deliver(offer_from("carol")).unwrap();
        h.settle().await;
        assert_eq!(h.factory.count(), 1);
        assert!(h.nothing_sent());
    }

    #[tokio::test]
    async fn shutdown_tears_down_and_stops_the_loop() {
        let mut h = harness();
        let t = h.placed_call().await;
        h.handle.shutdown().unwrap();
        assert_eq!(
            h.wait_note(ended).await,
            Notification::SessionEnded(EndReason::Shutdown)
        );
        assert_eq!(t.closes(), 1);
        wait_until(|| h.handle.rename("x").is_err()).await;
    }
}
