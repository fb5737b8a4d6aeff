//! State transitions of a [`Room`] on [`RoomEvent`]s.
//!
//! [`Room`]: super::Room

use std::rc::Rc;

use futures::task::LocalSpawnExt as _;
use huddle_signalling_proto::{
    Answer, Broadcast, Candidate, HandAction, IceCandidate, Offer,
    Participant, ParticipantId, RaiseHand, SignallingMessage,
};
use serde_json::Value;

use crate::{
    log::prelude::*,
    media::{MediaKind, TrackId},
    peer::{
        CreateSessionError, NegotiationRole, NegotiationState, PeerConnection,
        PeerEvent,
    },
    platform::{ChannelEvent, MediaStreamTrack},
};

use super::{InnerRoom, RoomEvent};

impl InnerRoom {
    /// Applies the provided [`RoomEvent`] to this room.
    pub(super) fn handle(self: &Rc<Self>, event: RoomEvent) {
        match event {
            RoomEvent::Channel(event) => self.on_channel_event(event),
            RoomEvent::Peer(event) => self.on_peer_event(event),
            RoomEvent::CaptureEnded(id) => self.on_capture_ended(id),
            RoomEvent::Tick => self.on_tick(),
        }
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::PresenceSync(members) => {
                self.on_presence_sync(members);
            }
            ChannelEvent::PresenceJoin(members) => {
                for member in members {
                    self.on_presence_join(member);
                }
            }
            ChannelEvent::PresenceLeave(id) => self.on_presence_leave(&id),
            ChannelEvent::Broadcast { event, payload } => {
                self.on_broadcast(&event, payload);
            }
        }
    }

    /// Mirrors the full presence state and offers sessions to the present
    /// participants having none. Sessions are never removed here: leaves do
    /// that.
    fn on_presence_sync(&self, members: Vec<Participant>) {
        let missing = {
            let mut presence = self.presence.borrow_mut();
            presence.sync(members);
            let peers = self.peers.borrow();
            let mut missing = Vec::new();
            for member in presence.members() {
                match peers.get(&member.user_id) {
                    Some(peer) => {
                        peer.set_display_name(member.username.clone());
                    }
                    None => missing.push(member.clone()),
                }
            }
            missing
        };
        self.signalling_connected.set(true);

        for member in missing {
            info!("Participant `{}` discovered", member.user_id);
            self.create_session(
                member.user_id,
                NegotiationRole::Offerer,
                member.username,
            );
        }
    }

    /// Offers a session to the newly present participant.
    fn on_presence_join(&self, member: Participant) {
        if member.user_id == self.me.user_id {
            return;
        }
        self.presence.borrow_mut().join(member.clone());
        if let Some(peer) = self.peer(&member.user_id) {
            peer.set_display_name(member.username);
            debug!(
                "Participant `{}` is present already in `{}` state",
                peer.id(),
                peer.state()
            );
            return;
        }
        info!("Participant `{}` joined", member.user_id);
        self.create_session(
            member.user_id,
            NegotiationRole::Offerer,
            member.username,
        );
    }

    /// Tears down everything related to the gone participant.
    fn on_presence_leave(&self, id: &ParticipantId) {
        self.presence.borrow_mut().leave(id);
        let removed = self.peers.borrow_mut().remove(id);
        self.remote_order.borrow_mut().retain(|p| p != id);
        self.raised_hands.borrow_mut().retain(|p| &p.user_id != id);
        {
            let mut speaker = self.active_speaker.borrow_mut();
            if speaker.as_ref() == Some(id) {
                *speaker = None;
            }
        }
        if removed.is_some() {
            info!("Participant `{}` left", id);
        }
    }

    /// Validates the raw broadcast and routes it.
    fn on_broadcast(&self, event: &str, payload: Value) {
        match Broadcast::parse(event, payload) {
            Ok(Broadcast::Signalling(msg)) => {
                if msg.is_addressed_to(&self.me.user_id) {
                    self.on_signalling(msg);
                } else {
                    trace!(
                        "Ignoring `{}` addressed to `{}`",
                        msg.event(),
                        msg.addressee()
                    );
                }
            }
            Ok(Broadcast::RaiseHand(raise)) => self.on_raise_hand(raise),
            Err(e) => debug!("Dropping `{}` broadcast: {}", event, e),
        }
    }

    fn on_signalling(&self, msg: SignallingMessage) {
        match msg {
            SignallingMessage::Offer(offer) => self.on_offer(offer),
            SignallingMessage::Answer(answer) => self.on_answer(answer),
            SignallingMessage::IceCandidate(candidate) => {
                self.on_remote_candidate(candidate);
            }
        }
    }

    /// Answers the remote offer, creating an answering session if needed.
    ///
    /// If both sides have offered to each other, the offer of the
    /// participant with the greater ID wins: the other side drops its own
    /// session and answers.
    fn on_offer(&self, offer: Offer) {
        let Offer {
            from,
            description,
            username,
            ..
        } = offer;

        let mut existing = self.peer(&from);
        if let Some(peer) = &existing {
            if matches!(
                peer.state(),
                NegotiationState::Offering | NegotiationState::AwaitingAnswer
            ) {
                if self.me.user_id > from {
                    debug!("Offers collided with `{}`, keeping own one", from);
                    return;
                }
                debug!("Offers collided with `{}`, answering its one", from);
                self.peers.borrow_mut().remove(&from);
                existing = None;
            }
        }

        let peer = match existing {
            Some(peer) => {
                peer.set_display_name(username);
                peer
            }
            None => match self.create_session(
                from,
                NegotiationRole::Answerer,
                username,
            ) {
                Some(peer) => peer,
                None => return,
            },
        };
        if let Err(e) = peer.accept_offer(description) {
            debug!("Dropping offer from `{}`: {}", peer.id(), e);
        }
    }

    fn on_answer(&self, answer: Answer) {
        let peer = match self.peer(&answer.from) {
            Some(peer) => peer,
            None => {
                debug!("Dropping answer from unknown `{}`", answer.from);
                return;
            }
        };
        match peer.accept_answer(answer.description) {
            Ok(()) => self.on_negotiated(&peer),
            Err(e) => debug!("Dropping answer from `{}`: {}", peer.id(), e),
        }
    }

    fn on_remote_candidate(&self, candidate: Candidate) {
        match self.peer(&candidate.from) {
            Some(peer) => {
                if let Err(e) = peer.add_ice_candidate(candidate.candidate) {
                    debug!(
                        "Dropping ICE candidate from `{}`: {}",
                        peer.id(),
                        e
                    );
                }
            }
            None => trace!(
                "Dropping ICE candidate from unknown `{}`",
                candidate.from
            ),
        }
    }

    fn on_raise_hand(&self, raise: RaiseHand) {
        if raise.user_id == self.me.user_id {
            return;
        }
        let mut hands = self.raised_hands.borrow_mut();
        match raise.action {
            HandAction::Raise => {
                if !hands.iter().any(|p| p.user_id == raise.user_id) {
                    hands.push(Participant::new(raise.user_id, raise.username));
                }
            }
            HandAction::Lower => {
                hands.retain(|p| p.user_id != raise.user_id);
            }
        }
    }

    /// Handles the [`PeerEvent`] of a current session. Events of removed
    /// sessions are dropped.
    fn on_peer_event(&self, event: PeerEvent) {
        let peer = {
            let (id, seq) = event.session();
            match self.peers.borrow().get(id) {
                Some(peer) if peer.seq() == seq => Rc::clone(peer),
                _ => {
                    trace!("Dropping event of removed session #{}", seq);
                    return;
                }
            }
        };

        match event {
            PeerEvent::IceCandidateDiscovered { candidate, .. } => {
                if let Some(candidate) = peer.local_candidate(candidate) {
                    self.send_candidate(&peer, candidate);
                }
            }
            PeerEvent::NewRemoteTrack { track, .. } => {
                self.on_remote_track(&peer, track);
            }
            PeerEvent::Connected { .. } => {
                if peer.set_connected() {
                    self.on_connected(&peer);
                }
            }
            PeerEvent::OfferCreated { sdp, .. } => {
                match peer.offer_created(sdp) {
                    Ok(description) => {
                        self.send_signalling(
                            Offer {
                                from: self.me.user_id.clone(),
                                to: peer.id().clone(),
                                description,
                                username: self.me.username.clone(),
                            }
                            .into(),
                        );
                        self.flush_candidates(&peer);
                    }
                    Err(e) => debug!("{}", e),
                }
            }
            PeerEvent::AnswerCreated { sdp, .. } => {
                match peer.answer_created(sdp) {
                    Ok(description) => {
                        self.send_signalling(
                            Answer {
                                from: self.me.user_id.clone(),
                                to: peer.id().clone(),
                                description,
                            }
                            .into(),
                        );
                        self.flush_candidates(&peer);
                        self.on_negotiated(&peer);
                    }
                    Err(e) => debug!("{}", e),
                }
            }
            PeerEvent::NegotiationFailed { error, .. } => {
                warn!("Negotiation with `{}` failed: {}", peer.id(), error);
            }
        }
    }

    /// Stores the remote track and starts analysing the remote audio.
    fn on_remote_track(
        &self,
        peer: &PeerConnection,
        track: Rc<dyn MediaStreamTrack>,
    ) {
        if !peer.add_remote_track(Rc::clone(&track)) {
            return;
        }
        if track.kind() != MediaKind::Audio || peer.analyser().is_some() {
            return;
        }
        match self
            .platform
            .media_devices
            .create_analyser(&track, self.conf.speaker.fft_size)
        {
            Ok(analyser) => peer.set_analyser(analyser),
            Err(e) => warn!(
                "Failed to analyse audio of `{}`: {}",
                peer.id(),
                e
            ),
        }
    }

    /// Makes the session renderable if it has become connected while
    /// finishing the descriptions exchange.
    fn on_negotiated(&self, peer: &PeerConnection) {
        if peer.state() == NegotiationState::Connected {
            self.on_connected(peer);
        }
    }

    /// Makes the remote stream of the connected session renderable.
    fn on_connected(&self, peer: &PeerConnection) {
        let mut order = self.remote_order.borrow_mut();
        if !order.contains(peer.id()) {
            order.push(peer.id().clone());
            info!("Connected to `{}`", peer.id());
        }
    }

    /// Stops screen sharing if its capture has ended on its own.
    fn on_capture_ended(self: &Rc<Self>, id: TrackId) {
        if !self.share.is_current_screen(&id) {
            return;
        }
        info!("Screen capture `{}` ended", id);
        let this = Rc::clone(self);
        let stop = async move {
            let senders = this.senders(MediaKind::Video);
            this.share.stop(senders).await;
        };
        if let Err(e) = self.platform.spawner.spawn_local(stop) {
            error!("Failed to stop screen sharing: {}", e);
        }
    }

    /// Re-estimates the active speaker among the connected sessions.
    fn on_tick(&self) {
        let speaker = {
            let peers = self.peers.borrow();
            let order = self.remote_order.borrow();
            self.estimator
                .sample(order.iter().filter_map(|id| peers.get(id)))
        };
        let mut current = self.active_speaker.borrow_mut();
        if *current != speaker {
            trace!("Active speaker changed to {:?}", speaker);
            *current = speaker;
        }
    }

    /// Creates a session with the provided remote participant. Failures are
    /// logged.
    fn create_session(
        &self,
        id: ParticipantId,
        role: NegotiationRole,
        display_name: Option<String>,
    ) -> Option<Rc<PeerConnection>> {
        let display_name =
            display_name.or_else(|| self.presence.borrow().display_name(&id));
        let created = self.peers.borrow_mut().create(id, role, display_name);
        match created {
            Ok(peer) => Some(peer),
            Err(e) => {
                match e.as_ref() {
                    CreateSessionError::Duplicate(_)
                    | CreateSessionError::SelfSession => debug!("{}", e),
                    CreateSessionError::Transport(_) => warn!("{}", e),
                }
                None
            }
        }
    }

    /// Sends local candidates held until the local description is sent.
    fn flush_candidates(&self, peer: &PeerConnection) {
        for candidate in peer.take_pending_candidates() {
            self.send_candidate(peer, candidate);
        }
    }

    fn send_candidate(&self, peer: &PeerConnection, candidate: IceCandidate) {
        self.send_signalling(
            Candidate {
                from: self.me.user_id.clone(),
                to: peer.id().clone(),
                candidate,
            }
            .into(),
        );
    }

    /// Broadcasts the provided [`SignallingMessage`]. Failures are logged.
    fn send_signalling(&self, msg: SignallingMessage) {
        if let Err(e) = self.send(&Broadcast::Signalling(msg)) {
            warn!("{}", e);
        }
    }
}
