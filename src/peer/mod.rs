//! Peer sessions: one [`RtcPeerConnection`] per remote participant together
//! with its negotiation state machine.

mod negotiation;
pub mod repo;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use derive_more::Display;
use futures::{channel::mpsc, task::LocalSpawn, StreamExt as _};
use huddle_signalling_proto::{
    IceCandidate, ParticipantId, SessionDescription,
};
use tracerr::Traced;

use crate::{
    log::prelude::*,
    media::MediaKind,
    platform::{
        self, AudioAnalyser, MediaStreamTrack, RtcEvent, RtcPeerConnection,
        RtpSender,
    },
    utils::{spawn_abortable, TaskHandle},
};

use self::negotiation::Negotiator;

#[doc(inline)]
pub use self::{
    negotiation::NegotiationStep,
    repo::{CreateSessionError, DuplicateSessionError, PeerRepository},
};

/// Sequence number of a [`PeerConnection`] within its [`PeerRepository`].
///
/// Distinguishes sessions created for the same participant over time, so
/// events of an already removed session never reach its successor.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub struct SessionSeq(pub u32);

/// Side of a session negotiation.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NegotiationRole {
    /// Local side creates the offer.
    Offerer,

    /// Local side answers the remote offer.
    Answerer,
}

/// State of a [`PeerConnection`].
///
/// ```text
/// Idle -> Offering -> AwaitingAnswer -> Negotiating -> Connected
///    \--> Answering -----------------/
/// ```
///
/// Every state may transit into [`NegotiationState::Closed`].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NegotiationState {
    /// Session is created, but no role is taken yet.
    Idle,

    /// Local offer is being created.
    Offering,

    /// Local offer is sent, remote answer is awaited.
    AwaitingAnswer,

    /// Remote offer is received, local answer is being created.
    Answering,

    /// Descriptions are exchanged, connectivity is being established.
    Negotiating,

    /// Media flows between the participants.
    Connected,

    /// Session is torn down.
    Closed,
}

/// Signalling message which cannot be applied in the current
/// [`NegotiationState`] of its session.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "Cannot apply {} in `{}` state", message, state)]
pub struct StaleSignallingError {
    /// State of the session when the message arrived.
    pub state: NegotiationState,

    /// Kind of the stale message.
    pub message: &'static str,
}

/// Failure of a negotiation step. Never retried.
#[derive(Clone, Debug, Display)]
pub enum NegotiationFailure {
    /// Local offer couldn't be created.
    #[display(fmt = "Failed to create local offer: {}", _0)]
    CreateOffer(platform::Error),

    /// Local answer couldn't be created.
    #[display(fmt = "Failed to create local answer: {}", _0)]
    CreateAnswer(platform::Error),

    /// Remote description couldn't be applied.
    #[display(fmt = "Failed to set remote description: {}", _0)]
    SetRemoteDescription(platform::Error),

    /// Remote candidate couldn't be applied.
    #[display(fmt = "Failed to add ICE candidate: {}", _0)]
    AddIceCandidate(platform::Error),

    /// Transport reported connectivity failure.
    #[display(fmt = "Transport connectivity failed")]
    TransportFailed,
}

/// Events emitted by [`PeerConnection`]s into their [`PeerRepository`]
/// owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// Transport gathered a local [`IceCandidate`].
    IceCandidateDiscovered {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,

        /// Gathered candidate.
        candidate: IceCandidate,
    },

    /// Transport received a remote track.
    NewRemoteTrack {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,

        /// Received track.
        track: Rc<dyn MediaStreamTrack>,
    },

    /// Transport established connectivity.
    Connected {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,
    },

    /// Local offer has been created and set as local description.
    OfferCreated {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,

        /// SDP of the offer.
        sdp: String,
    },

    /// Local answer has been created and set as local description.
    AnswerCreated {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,

        /// SDP of the answer.
        sdp: String,
    },

    /// Negotiation step failed.
    NegotiationFailed {
        /// Remote participant of the session.
        peer_id: ParticipantId,

        /// Sequence number of the session.
        seq: SessionSeq,

        /// Failure details.
        error: Traced<NegotiationFailure>,
    },
}

impl PeerEvent {
    /// Returns remote participant and sequence number of the session this
    /// event is emitted by.
    #[must_use]
    pub fn session(&self) -> (&ParticipantId, SessionSeq) {
        match self {
            Self::IceCandidateDiscovered { peer_id, seq, .. }
            | Self::NewRemoteTrack { peer_id, seq, .. }
            | Self::Connected { peer_id, seq }
            | Self::OfferCreated { peer_id, seq, .. }
            | Self::AnswerCreated { peer_id, seq, .. }
            | Self::NegotiationFailed { peer_id, seq, .. } => (peer_id, *seq),
        }
    }
}

/// Session with a single remote participant.
#[derive(Debug)]
pub struct PeerConnection {
    /// Remote participant of this session.
    id: ParticipantId,

    /// Sequence number of this session.
    seq: SessionSeq,

    /// Side of the negotiation taken by the local participant.
    role: NegotiationRole,

    /// Display name of the remote participant.
    display_name: RefCell<Option<String>>,

    /// Current [`NegotiationState`].
    state: Cell<NegotiationState>,

    /// Transport reported connectivity before descriptions exchange has
    /// been finished locally.
    connected_early: Cell<bool>,

    /// Negotiated local description.
    local_description: RefCell<Option<SessionDescription>>,

    /// Negotiated remote description.
    remote_description: RefCell<Option<SessionDescription>>,

    /// Local candidates gathered before the local description is sent.
    pending_candidates: RefCell<Vec<IceCandidate>>,

    /// Underlying transport.
    transport: Rc<dyn RtcPeerConnection>,

    /// Senders of the local tracks.
    senders: RefCell<Vec<Rc<dyn RtpSender>>>,

    /// Tracks received from the remote participant.
    remote_tracks: RefCell<Vec<Rc<dyn MediaStreamTrack>>>,

    /// Analyser of the remote audio.
    analyser: RefCell<Option<Rc<dyn AudioAnalyser>>>,

    /// Serial queue of negotiation steps.
    negotiator: RefCell<Option<Negotiator>>,

    /// Task forwarding [`RtcEvent`]s as [`PeerEvent`]s.
    events_task: RefCell<Option<TaskHandle>>,
}

impl PeerConnection {
    /// Creates a new [`PeerConnection`] in [`NegotiationState::Idle`] over the
    /// provided `transport`.
    ///
    /// [`RtcEvent`]s of the `transport` and results of negotiation steps are
    /// emitted into the provided `peer_events` as [`PeerEvent`]s.
    pub fn new(
        id: ParticipantId,
        seq: SessionSeq,
        role: NegotiationRole,
        transport: Rc<dyn RtcPeerConnection>,
        peer_events: &mpsc::UnboundedSender<PeerEvent>,
        spawner: &dyn LocalSpawn,
    ) -> Self {
        let events_task = {
            let mut rtc_events = transport.on_event();
            let peer_events = peer_events.clone();
            let peer_id = id.clone();
            spawn_abortable(spawner, async move {
                while let Some(event) = rtc_events.next().await {
                    let peer_id = peer_id.clone();
                    let event = match event {
                        RtcEvent::IceCandidate(candidate) => {
                            PeerEvent::IceCandidateDiscovered {
                                peer_id,
                                seq,
                                candidate,
                            }
                        }
                        RtcEvent::Track(track) => PeerEvent::NewRemoteTrack {
                            peer_id,
                            seq,
                            track,
                        },
                        RtcEvent::Connected => {
                            PeerEvent::Connected { peer_id, seq }
                        }
                        RtcEvent::Failed => PeerEvent::NegotiationFailed {
                            peer_id,
                            seq,
                            error: tracerr::new!(
                                NegotiationFailure::TransportFailed
                            ),
                        },
                    };
                    if peer_events.unbounded_send(event).is_err() {
                        break;
                    }
                }
            })
        };
        let negotiator = Negotiator::spawn(
            id.clone(),
            seq,
            Rc::clone(&transport),
            peer_events.clone(),
            spawner,
        );

        Self {
            id,
            seq,
            role,
            display_name: RefCell::new(None),
            state: Cell::new(NegotiationState::Idle),
            connected_early: Cell::new(false),
            local_description: RefCell::new(None),
            remote_description: RefCell::new(None),
            pending_candidates: RefCell::new(Vec::new()),
            transport,
            senders: RefCell::new(Vec::new()),
            remote_tracks: RefCell::new(Vec::new()),
            analyser: RefCell::new(None),
            negotiator: RefCell::new(Some(negotiator)),
            events_task: RefCell::new(Some(events_task)),
        }
    }

    /// Returns ID of the remote participant of this session.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Returns [`SessionSeq`] of this session.
    #[inline]
    #[must_use]
    pub fn seq(&self) -> SessionSeq {
        self.seq
    }

    /// Returns [`NegotiationRole`] taken by the local participant.
    #[inline]
    #[must_use]
    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Returns current [`NegotiationState`].
    #[inline]
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state.get()
    }

    /// Returns display name of the remote participant, if known.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.display_name.borrow().clone()
    }

    /// Remembers display name of the remote participant. `None` never
    /// overrides an already known name.
    pub fn set_display_name(&self, name: Option<String>) {
        if name.is_some() {
            *self.display_name.borrow_mut() = name;
        }
    }

    /// Returns negotiated local description.
    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.borrow().clone()
    }

    /// Returns negotiated remote description.
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.borrow().clone()
    }

    /// Attaches the provided local `track` to the transport.
    ///
    /// # Errors
    ///
    /// If the transport refuses the track.
    pub fn add_local_track(
        &self,
        track: Rc<dyn MediaStreamTrack>,
    ) -> Result<(), platform::Error> {
        let sender = self.transport.add_track(track)?;
        self.senders.borrow_mut().push(sender);
        Ok(())
    }

    /// Returns the [`RtpSender`] sending local video, if any.
    #[must_use]
    pub fn video_sender(&self) -> Option<Rc<dyn RtpSender>> {
        self.senders
            .borrow()
            .iter()
            .find(|s| s.kind() == MediaKind::Video)
            .cloned()
    }

    /// Returns all the [`RtpSender`]s of this session.
    #[must_use]
    pub fn senders(&self) -> Vec<Rc<dyn RtpSender>> {
        self.senders.borrow().clone()
    }

    /// Takes the role of this session: transits [`NegotiationState::Idle`]
    /// into [`NegotiationState::Offering`] (scheduling offer creation) or
    /// into [`NegotiationState::Answering`].
    pub fn start(&self) {
        if self.state() != NegotiationState::Idle {
            return;
        }
        match self.role {
            NegotiationRole::Offerer => {
                self.state.set(NegotiationState::Offering);
                self.push(NegotiationStep::CreateOffer);
            }
            NegotiationRole::Answerer => {
                self.state.set(NegotiationState::Answering);
            }
        }
    }

    /// Applies remote offer. Valid only once, in
    /// [`NegotiationState::Answering`].
    ///
    /// # Errors
    ///
    /// With [`StaleSignallingError`] if the state doesn't allow it.
    pub fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<(), Traced<StaleSignallingError>> {
        if self.state() != NegotiationState::Answering
            || self.remote_description.borrow().is_some()
        {
            return Err(tracerr::new!(self.stale("offer")));
        }
        *self.remote_description.borrow_mut() = Some(offer.clone());
        self.push(NegotiationStep::ApplyOffer(offer));
        Ok(())
    }

    /// Records the created local offer, transiting
    /// [`NegotiationState::Offering`] into
    /// [`NegotiationState::AwaitingAnswer`].
    ///
    /// # Errors
    ///
    /// With [`StaleSignallingError`] if the state doesn't allow it.
    pub fn offer_created(
        &self,
        sdp: String,
    ) -> Result<SessionDescription, Traced<StaleSignallingError>> {
        if self.state() != NegotiationState::Offering {
            return Err(tracerr::new!(self.stale("local offer")));
        }
        let offer = SessionDescription::offer(sdp);
        *self.local_description.borrow_mut() = Some(offer.clone());
        self.state.set(NegotiationState::AwaitingAnswer);
        Ok(offer)
    }

    /// Applies remote answer, transiting
    /// [`NegotiationState::AwaitingAnswer`] into
    /// [`NegotiationState::Negotiating`].
    ///
    /// # Errors
    ///
    /// With [`StaleSignallingError`] if the state doesn't allow it. Such an
    /// answer is a no-op.
    pub fn accept_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<(), Traced<StaleSignallingError>> {
        if self.state() != NegotiationState::AwaitingAnswer {
            return Err(tracerr::new!(self.stale("answer")));
        }
        *self.remote_description.borrow_mut() = Some(answer.clone());
        self.push(NegotiationStep::ApplyAnswer(answer));
        self.enter_negotiating();
        Ok(())
    }

    /// Records the created local answer, transiting
    /// [`NegotiationState::Answering`] into
    /// [`NegotiationState::Negotiating`].
    ///
    /// # Errors
    ///
    /// With [`StaleSignallingError`] if the state doesn't allow it.
    pub fn answer_created(
        &self,
        sdp: String,
    ) -> Result<SessionDescription, Traced<StaleSignallingError>> {
        if self.state() != NegotiationState::Answering {
            return Err(tracerr::new!(self.stale("local answer")));
        }
        let answer = SessionDescription::answer(sdp);
        *self.local_description.borrow_mut() = Some(answer.clone());
        self.enter_negotiating();
        Ok(answer)
    }

    /// Schedules the provided remote [`IceCandidate`] to be applied after all
    /// the previously scheduled negotiation steps.
    ///
    /// # Errors
    ///
    /// With [`StaleSignallingError`] if no remote description is accepted
    /// yet. Such a candidate belongs to a session discarded by the remote
    /// side and is dropped.
    pub fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), Traced<StaleSignallingError>> {
        if self.remote_description.borrow().is_none() {
            return Err(tracerr::new!(self.stale("ICE candidate")));
        }
        self.push(NegotiationStep::AddCandidate(candidate));
        Ok(())
    }

    /// Returns the provided local `candidate` back if it may be sent right
    /// away, or holds it until the local description is created.
    pub fn local_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Option<IceCandidate> {
        if self.local_description.borrow().is_some() {
            Some(candidate)
        } else {
            self.pending_candidates.borrow_mut().push(candidate);
            None
        }
    }

    /// Takes local candidates held by [`PeerConnection::local_candidate()`].
    pub fn take_pending_candidates(&self) -> Vec<IceCandidate> {
        self.pending_candidates.borrow_mut().drain(..).collect()
    }

    /// Handles transport connectivity, transiting
    /// [`NegotiationState::Negotiating`] into
    /// [`NegotiationState::Connected`].
    ///
    /// Connectivity reported before the descriptions exchange is finished
    /// locally is remembered and applied once it is.
    ///
    /// Returns `true` if the session has become connected by this call.
    pub fn set_connected(&self) -> bool {
        match self.state() {
            NegotiationState::Negotiating => {
                self.state.set(NegotiationState::Connected);
                true
            }
            NegotiationState::Offering
            | NegotiationState::AwaitingAnswer
            | NegotiationState::Answering => {
                self.connected_early.set(true);
                false
            }
            NegotiationState::Idle
            | NegotiationState::Connected
            | NegotiationState::Closed => false,
        }
    }

    /// Stores the provided remote track. Tracks with an already known ID
    /// are ignored.
    ///
    /// Returns `true` if the track is new.
    pub fn add_remote_track(&self, track: Rc<dyn MediaStreamTrack>) -> bool {
        let mut tracks = self.remote_tracks.borrow_mut();
        let id = track.id();
        if tracks.iter().any(|t| t.id() == id) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Returns tracks received from the remote participant.
    #[must_use]
    pub fn remote_tracks(&self) -> Vec<Rc<dyn MediaStreamTrack>> {
        self.remote_tracks.borrow().clone()
    }

    /// Sets [`AudioAnalyser`] of the remote audio.
    pub fn set_analyser(&self, analyser: Rc<dyn AudioAnalyser>) {
        *self.analyser.borrow_mut() = Some(analyser);
    }

    /// Returns [`AudioAnalyser`] of the remote audio, if any.
    #[must_use]
    pub fn analyser(&self) -> Option<Rc<dyn AudioAnalyser>> {
        self.analyser.borrow().clone()
    }

    /// Tears down this session: aborts in-flight negotiation, closes the
    /// transport and releases senders, remote tracks and the analyser.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.state.replace(NegotiationState::Closed)
            == NegotiationState::Closed
        {
            return;
        }
        drop(self.negotiator.borrow_mut().take());
        drop(self.events_task.borrow_mut().take());
        self.transport.close();
        self.senders.borrow_mut().clear();
        self.remote_tracks.borrow_mut().clear();
        self.pending_candidates.borrow_mut().clear();
        drop(self.analyser.borrow_mut().take());
        debug!("Session with `{}` #{} is closed", self.id, self.seq);
    }

    /// Transits into [`NegotiationState::Negotiating`], or right into
    /// [`NegotiationState::Connected`] if connectivity has been reported
    /// already.
    fn enter_negotiating(&self) {
        self.state.set(NegotiationState::Negotiating);
        if self.connected_early.replace(false) {
            self.state.set(NegotiationState::Connected);
        }
    }

    /// Schedules the provided [`NegotiationStep`].
    fn push(&self, step: NegotiationStep) {
        if let Some(negotiator) = self.negotiator.borrow().as_ref() {
            negotiator.push(step);
        }
    }

    /// Builds [`StaleSignallingError`] for the provided message kind.
    fn stale(&self, message: &'static str) -> StaleSignallingError {
        StaleSignallingError {
            state: self.state(),
            message,
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}
