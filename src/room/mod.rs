//! Full-mesh room: presence driven creation of [`PeerConnection`]s,
//! signalling exchange over the room channel, screen sharing and active
//! speaker estimation.

mod event_handler;
pub mod presence;
pub mod snapshot;

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use derive_more::Display;
use futures::{
    channel::mpsc, future, stream::LocalBoxStream, StreamExt as _,
};
use huddle_signalling_proto::{
    Broadcast, HandAction, Participant, ParticipantId, RaiseHand, RoomCode,
};
use tracerr::Traced;

use crate::{
    conf::Conf,
    log::prelude::*,
    media::{
        share::replace_all, LocalTracks, MediaAcquisitionError, MediaKind,
        ScreenShare, TrackId,
    },
    peer::{NegotiationState, PeerConnection, PeerEvent, PeerRepository},
    platform::{self, ChannelEvent, Platform, RtpSender},
    speaker::ActiveSpeakerEstimator,
    utils::{spawn_abortable, TaskHandle},
};

#[doc(inline)]
pub use self::{
    presence::PresenceSet,
    snapshot::{RemoteStream, RoomSnapshot},
};

/// Event handled by a [`Room`].
///
/// Every change of a [`Room`] state caused by its environment goes through
/// a single queue of these events.
#[derive(Debug)]
pub enum RoomEvent {
    /// Presence or broadcast event of the room channel.
    Channel(ChannelEvent),

    /// Transport event or negotiation step result of a [`PeerConnection`].
    Peer(PeerEvent),

    /// Source of the local track with the provided ID is gone.
    CaptureEnded(TrackId),

    /// Active speaker estimation is due.
    Tick,
}

/// Errors occurring in [`Room::join()`] method.
#[derive(Clone, Debug, Display)]
pub enum RoomJoinError {
    /// [`Room`] is joined or being joined already.
    #[display(fmt = "Room is joined already")]
    AlreadyJoined,

    /// [`Room`] is hung up.
    #[display(fmt = "Room is closed")]
    Closed,

    /// Room channel subscription failed.
    #[display(fmt = "Failed to subscribe to room channel: {}", _0)]
    Subscribe(platform::Error),

    /// Presence announcement failed.
    #[display(fmt = "Failed to announce presence: {}", _0)]
    AnnouncePresence(platform::Error),
}

/// Errors occurring in [`Room`] actions requiring the room channel.
#[derive(Clone, Debug, Display)]
pub enum RoomError {
    /// [`Room`] isn't joined yet.
    #[display(fmt = "Room is not joined")]
    NotJoined,

    /// [`Room`] is hung up.
    #[display(fmt = "Room is closed")]
    Closed,

    /// Outgoing message couldn't be encoded.
    #[display(fmt = "Failed to encode broadcast payload: {}", _0)]
    Encode(String),

    /// Room channel refused an outgoing message.
    #[display(fmt = "Failed to send broadcast: {}", _0)]
    Send(platform::Error),
}

/// Lifecycle state of a [`Room`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RoomState {
    New,
    Joining,
    Joined,
    Closed,
}

/// Sources of [`RoomEvent`]s, consumed by the event loop once the room is
/// joined.
struct EventSources {
    channel: LocalBoxStream<'static, ChannelEvent>,
    peers: mpsc::UnboundedReceiver<PeerEvent>,
    capture_ended: mpsc::UnboundedReceiver<TrackId>,
}

/// Full-mesh conferencing room as seen by the local participant.
pub struct Room(Rc<InnerRoom>);

/// Actual data of a [`Room`].
struct InnerRoom {
    /// Local participant.
    me: Participant,

    /// Settings this [`Room`] was created with.
    conf: Conf,

    /// Collaborators this [`Room`] is driven by.
    platform: Platform,

    /// Current [`RoomState`].
    state: Cell<RoomState>,

    /// Event sources, until the event loop takes them.
    sources: RefCell<Option<EventSources>>,

    /// Running event loop.
    event_loop: RefCell<Option<TaskHandle>>,

    /// Sessions with the remote participants.
    peers: RefCell<PeerRepository>,

    /// Mirrored presence state of the room channel.
    presence: RefCell<PresenceSet>,

    /// Local media.
    local_tracks: Rc<LocalTracks>,

    /// Screen sharing controller.
    share: ScreenShare,

    /// Active speaker estimator.
    estimator: ActiveSpeakerEstimator,

    /// Participants with renderable streams, in order of connection.
    remote_order: RefCell<Vec<ParticipantId>>,

    /// Currently loudest remote participant.
    active_speaker: RefCell<Option<ParticipantId>>,

    /// Room channel is subscribed.
    signalling_connected: Cell<bool>,

    /// Local audio is muted.
    muted: Cell<bool>,

    /// Local camera is turned off.
    video_off: Cell<bool>,

    /// Local participant has a raised hand.
    hand_raised: Cell<bool>,

    /// Remote participants with raised hands, in order of raising.
    raised_hands: RefCell<Vec<Participant>>,
}

impl Room {
    /// Creates new [`Room`] of the provided local participant.
    ///
    /// Nothing is sent until [`Room::join()`] is called.
    #[must_use]
    pub fn new(me: Participant, conf: &Conf, platform: Platform) -> Self {
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded();
        let (capture_ended_tx, capture_ended_rx) = mpsc::unbounded();
        let local_tracks = Rc::new(LocalTracks::default());

        let peers = PeerRepository::new(
            me.user_id.clone(),
            Rc::clone(&platform.peer_connections),
            conf.ice.servers.clone(),
            Rc::clone(&local_tracks),
            peer_events_tx,
            Rc::clone(&platform.spawner),
        );
        let share = ScreenShare::new(
            Rc::clone(&local_tracks),
            Rc::clone(&platform.media_devices),
            Rc::clone(&platform.spawner),
            capture_ended_tx,
        );
        let sources = EventSources {
            channel: platform.channel.on_event(),
            peers: peer_events_rx,
            capture_ended: capture_ended_rx,
        };

        Self(Rc::new(InnerRoom {
            presence: RefCell::new(PresenceSet::new(me.user_id.clone())),
            me,
            conf: conf.clone(),
            platform,
            state: Cell::new(RoomState::New),
            sources: RefCell::new(Some(sources)),
            event_loop: RefCell::new(None),
            peers: RefCell::new(peers),
            local_tracks,
            share,
            estimator: ActiveSpeakerEstimator::from(&conf.speaker),
            remote_order: RefCell::new(Vec::new()),
            active_speaker: RefCell::new(None),
            signalling_connected: Cell::new(false),
            muted: Cell::new(false),
            video_off: Cell::new(false),
            hand_raised: Cell::new(false),
            raised_hands: RefCell::new(Vec::new()),
        }))
    }

    /// Returns the local participant.
    #[inline]
    #[must_use]
    pub fn me(&self) -> &Participant {
        &self.0.me
    }

    /// Captures local camera and microphone. Sessions created afterwards
    /// send them.
    ///
    /// Recapturing replaces and stops previously captured tracks, and
    /// switches existing sessions to the new ones. The camera isn't switched
    /// while the screen is shared. Current mute and camera states are applied
    /// to the new tracks.
    ///
    /// # Errors
    ///
    /// With [`MediaAcquisitionError::LocalAv`] if capture fails. The room
    /// stays usable without local media then.
    pub async fn init_local_media(
        &self,
    ) -> Result<(), Traced<MediaAcquisitionError>> {
        let tracks = self
            .0
            .platform
            .media_devices
            .capture_local_av()
            .await
            .map_err(MediaAcquisitionError::LocalAv)
            .map_err(tracerr::wrap!())?;
        let inner = &self.0;
        inner.local_tracks.set_captured(tracks);

        let mut replaced = Vec::new();
        if let Some(audio) = inner.local_tracks.audio() {
            audio.set_enabled(!inner.muted.get());
            replaced.push(replace_all(inner.senders(MediaKind::Audio), audio));
        }
        if let Some(camera) = inner.local_tracks.camera() {
            camera.set_enabled(!inner.video_off.get());
            if !inner.share.is_sharing() {
                replaced
                    .push(replace_all(inner.senders(MediaKind::Video), camera));
            }
        }
        future::join_all(replaced).await;
        Ok(())
    }

    /// Subscribes to the channel of the room with the provided `code`,
    /// announces presence of the local participant and starts handling room
    /// events.
    ///
    /// # Errors
    ///
    /// With [`RoomJoinError::AlreadyJoined`] if joined or being joined
    /// already.
    ///
    /// With [`RoomJoinError::Closed`] if hung up.
    ///
    /// With [`RoomJoinError::Subscribe`] or
    /// [`RoomJoinError::AnnouncePresence`] if the channel fails. Joining may
    /// be retried then.
    pub async fn join(
        &self,
        code: &RoomCode,
    ) -> Result<(), Traced<RoomJoinError>> {
        let inner = &self.0;
        match inner.state.get() {
            RoomState::New => (),
            RoomState::Joining | RoomState::Joined => {
                return Err(tracerr::new!(RoomJoinError::AlreadyJoined));
            }
            RoomState::Closed => {
                return Err(tracerr::new!(RoomJoinError::Closed));
            }
        }
        inner.state.set(RoomState::Joining);

        let key = code.channel_key(&inner.conf.signalling.channel_prefix);
        if let Err(e) = inner.connect(&key).await {
            if inner.state.get() == RoomState::Joining {
                inner.state.set(RoomState::New);
            }
            return Err(e);
        }
        if inner.state.get() == RoomState::Closed {
            inner.platform.channel.unsubscribe();
            return Err(tracerr::new!(RoomJoinError::Closed));
        }
        let sources = inner
            .sources
            .borrow_mut()
            .take()
            .ok_or_else(|| tracerr::new!(RoomJoinError::AlreadyJoined))?;

        inner.state.set(RoomState::Joined);
        inner.signalling_connected.set(true);
        let ticks = inner
            .platform
            .ticker
            .interval(inner.conf.speaker.sample_interval);
        let event_loop = spawn_abortable(
            inner.platform.spawner.as_ref(),
            run_event_loop(Rc::downgrade(inner), sources, ticks),
        );
        *inner.event_loop.borrow_mut() = Some(event_loop);

        info!("Joined room `{}` as `{}`", key, inner.me.user_id);
        Ok(())
    }

    /// Handles the provided [`RoomEvent`] right away, bypassing the event
    /// queue.
    pub fn dispatch(&self, event: RoomEvent) {
        self.0.handle(event);
    }

    /// Returns current [`RoomSnapshot`].
    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        let inner = &self.0;
        let peers = inner.peers.borrow();
        let presence = inner.presence.borrow();
        let remote_streams = inner
            .remote_order
            .borrow()
            .iter()
            .filter_map(|id| peers.get(id))
            .map(|peer| RemoteStream {
                id: peer.id().clone(),
                display_name: peer
                    .display_name()
                    .or_else(|| presence.display_name(peer.id())),
                tracks: peer.remote_tracks(),
            })
            .collect();

        RoomSnapshot {
            local_tracks: inner.local_tracks.all(),
            remote_streams,
            active_speaker: inner.active_speaker.borrow().clone(),
            signalling_connected: inner.signalling_connected.get(),
            muted: inner.muted.get(),
            video_off: inner.video_off.get(),
            sharing: inner.share.is_sharing(),
            hand_raised: inner.hand_raised.get(),
            raised_hands: inner.raised_hands.borrow().clone(),
        }
    }

    /// Returns [`NegotiationState`] of the session with the provided remote
    /// participant, if any.
    #[must_use]
    pub fn peer_state(&self, id: &ParticipantId) -> Option<NegotiationState> {
        self.0.peers.borrow().get(id).map(|p| p.state())
    }

    /// Returns count of the sessions with the remote participants.
    #[must_use]
    pub fn peers_count(&self) -> usize {
        self.0.peers.borrow().len()
    }

    /// Mutes or unmutes local audio without renegotiating any sessions.
    ///
    /// Returns whether audio is muted now.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.0.muted.get();
        self.0.muted.set(muted);
        if let Some(audio) = self.0.local_tracks.audio() {
            audio.set_enabled(!muted);
        }
        muted
    }

    /// Turns local camera off or on without renegotiating any sessions.
    ///
    /// Returns whether camera is off now.
    pub fn toggle_video(&self) -> bool {
        let video_off = !self.0.video_off.get();
        self.0.video_off.set(video_off);
        if let Some(camera) = self.0.local_tracks.camera() {
            camera.set_enabled(!video_off);
        }
        video_off
    }

    /// Starts sharing the screen to all the sessions.
    ///
    /// # Errors
    ///
    /// With [`MediaAcquisitionError::Screen`] if the screen couldn't be
    /// captured.
    pub async fn start_share(
        &self,
    ) -> Result<(), Traced<MediaAcquisitionError>> {
        if self.0.state.get() == RoomState::Closed {
            debug!("Screen sharing is not started in closed room");
            return Ok(());
        }
        self.0
            .share
            .start(|| self.0.senders(MediaKind::Video))
            .await
    }

    /// Stops sharing the screen, restoring the camera in all the sessions.
    pub async fn stop_share(&self) {
        self.0.share.stop(self.0.senders(MediaKind::Video)).await;
    }

    /// Starts or stops screen sharing, depending on whether it's active.
    ///
    /// # Errors
    ///
    /// With [`MediaAcquisitionError::Screen`] if the screen couldn't be
    /// captured.
    pub async fn toggle_share(
        &self,
    ) -> Result<(), Traced<MediaAcquisitionError>> {
        if self.0.share.is_sharing() {
            self.stop_share().await;
            Ok(())
        } else {
            self.start_share().await
        }
    }

    /// Raises or lowers the hand of the local participant, notifying the
    /// whole room.
    ///
    /// Returns whether the hand is raised now.
    ///
    /// # Errors
    ///
    /// With [`RoomError::NotJoined`] or [`RoomError::Closed`] if the room
    /// channel isn't available, and with [`RoomError::Encode`] or
    /// [`RoomError::Send`] if the notification couldn't be sent. The hand
    /// state is left unchanged then.
    pub fn toggle_raise_hand(&self) -> Result<bool, Traced<RoomError>> {
        let inner = &self.0;
        match inner.state.get() {
            RoomState::Joined => (),
            RoomState::New | RoomState::Joining => {
                return Err(tracerr::new!(RoomError::NotJoined));
            }
            RoomState::Closed => return Err(tracerr::new!(RoomError::Closed)),
        }
        let raised = !inner.hand_raised.get();
        let action = if raised {
            HandAction::Raise
        } else {
            HandAction::Lower
        };
        inner
            .send(&Broadcast::RaiseHand(RaiseHand {
                user_id: inner.me.user_id.clone(),
                username: inner.me.username.clone(),
                action,
            }))
            .map_err(tracerr::wrap!())?;
        inner.hand_raised.set(raised);
        Ok(raised)
    }

    /// Leaves the room: stops all the local tracks, closes all the sessions,
    /// unsubscribes from the room channel and stops handling room events.
    ///
    /// Idempotent.
    pub fn hangup(&self) {
        let inner = &self.0;
        let previous = inner.state.replace(RoomState::Closed);
        if previous == RoomState::Closed {
            return;
        }
        drop(inner.event_loop.borrow_mut().take());
        inner.share.release();
        inner.local_tracks.stop_all();
        inner.peers.borrow_mut().clear();
        inner.remote_order.borrow_mut().clear();
        *inner.active_speaker.borrow_mut() = None;
        inner.raised_hands.borrow_mut().clear();
        inner.hand_raised.set(false);
        inner.signalling_connected.set(false);
        if previous == RoomState::Joined {
            inner.platform.channel.unsubscribe();
        }
        info!("Left room as `{}`", inner.me.user_id);
    }
}

impl InnerRoom {
    /// Subscribes to the room channel with the provided `key` and announces
    /// presence of the local participant.
    async fn connect(&self, key: &str) -> Result<(), Traced<RoomJoinError>> {
        self.platform
            .channel
            .subscribe(key)
            .await
            .map_err(RoomJoinError::Subscribe)
            .map_err(tracerr::wrap!())?;
        self.platform
            .channel
            .track(self.me.clone())
            .await
            .map_err(RoomJoinError::AnnouncePresence)
            .map_err(tracerr::wrap!())
    }

    /// Broadcasts the provided message to the room channel.
    fn send(&self, msg: &Broadcast) -> Result<(), Traced<RoomError>> {
        let payload = msg
            .to_payload()
            .map_err(|e| RoomError::Encode(e.to_string()))
            .map_err(tracerr::wrap!())?;
        self.platform
            .channel
            .send(msg.event(), payload)
            .map_err(RoomError::Send)
            .map_err(tracerr::wrap!())
    }

    /// Returns outgoing senders of the provided `kind` of all the sessions.
    fn senders(&self, kind: MediaKind) -> Vec<Rc<dyn RtpSender>> {
        self.peers
            .borrow()
            .iter()
            .flat_map(|peer| peer.senders())
            .filter(|sender| sender.kind() == kind)
            .collect()
    }

    /// Returns the session with the provided remote participant.
    fn peer(&self, id: &ParticipantId) -> Option<Rc<PeerConnection>> {
        self.peers.borrow().get(id).cloned()
    }
}

impl Drop for InnerRoom {
    /// Leaves the room channel if it is still joined.
    fn drop(&mut self) {
        if self.state.get() == RoomState::Joined {
            self.platform.channel.unsubscribe();
        }
    }
}

/// Consumes [`RoomEvent`]s from all the provided sources one by one, until
/// the [`Room`] is dropped.
async fn run_event_loop(
    room: Weak<InnerRoom>,
    sources: EventSources,
    ticks: LocalBoxStream<'static, ()>,
) {
    let mut channel = sources.channel.map(RoomEvent::Channel).fuse();
    let mut peers = sources.peers.map(RoomEvent::Peer).fuse();
    let mut capture_ended =
        sources.capture_ended.map(RoomEvent::CaptureEnded).fuse();
    let mut ticks = ticks.map(|_| RoomEvent::Tick).fuse();

    loop {
        let event: RoomEvent = futures::select! {
            event = channel.select_next_some() => event,
            event = peers.select_next_some() => event,
            event = capture_ended.select_next_some() => event,
            event = ticks.select_next_some() => event,
            complete => break,
        };

        if let Some(room) = room.upgrade() {
            room.handle(event);
        } else {
            error!("Room dropped while handling its events");
            break;
        }
    }
}
