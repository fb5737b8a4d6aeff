use std::{collections::HashMap, rc::Rc};

use derive_more::Display;
use futures::{channel::mpsc, task::LocalSpawn};
use huddle_signalling_proto::{IceServer, ParticipantId};
use tracerr::Traced;

use crate::{
    log::prelude::*,
    media::LocalTracks,
    platform::{self, RtcPeerConnectionFactory},
    utils::Counter,
};

use super::{NegotiationRole, PeerConnection, PeerEvent, SessionSeq};

/// Session with the participant already exists.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "Session with `{}` already exists", _0)]
pub struct DuplicateSessionError(pub ParticipantId);

/// Errors of [`PeerRepository::create`].
#[derive(Clone, Debug, Display)]
pub enum CreateSessionError {
    /// Session with the participant already exists.
    Duplicate(DuplicateSessionError),

    /// Session with the local participant was requested.
    #[display(fmt = "Cannot create session with the local participant")]
    SelfSession,

    /// Transport couldn't be created or refused local tracks.
    #[display(fmt = "Failed to create transport: {}", _0)]
    Transport(platform::Error),
}

/// [`PeerConnection`] factory and repository.
///
/// Holds at most one [`PeerConnection`] per remote participant, and never one
/// for the local participant.
pub struct PeerRepository {
    /// ID of the local participant.
    local_id: ParticipantId,

    /// Remote participant ID to its [`PeerConnection`].
    peers: HashMap<ParticipantId, Rc<PeerConnection>>,

    /// Source of [`SessionSeq`]s.
    seq: Counter,

    /// Factory of the transports of created [`PeerConnection`]s.
    factory: Rc<dyn RtcPeerConnectionFactory>,

    /// [`IceServer`]s injected into created transports.
    ice_servers: Vec<IceServer>,

    /// Local tracks attached to all created [`PeerConnection`]s.
    local_tracks: Rc<LocalTracks>,

    /// Sender that will be injected into all [`PeerConnection`]s
    /// created by this repository.
    peer_events_sender: mpsc::UnboundedSender<PeerEvent>,

    /// Executor of [`PeerConnection`]s tasks.
    spawner: Rc<dyn LocalSpawn>,
}

impl PeerRepository {
    /// Creates new empty [`PeerRepository`].
    pub fn new(
        local_id: ParticipantId,
        factory: Rc<dyn RtcPeerConnectionFactory>,
        ice_servers: Vec<IceServer>,
        local_tracks: Rc<LocalTracks>,
        peer_events_sender: mpsc::UnboundedSender<PeerEvent>,
        spawner: Rc<dyn LocalSpawn>,
    ) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            seq: Counter::default(),
            factory,
            ice_servers,
            local_tracks,
            peer_events_sender,
            spawner,
        }
    }

    /// Creates new [`PeerConnection`] with the provided remote participant,
    /// attaches current outgoing local tracks to it and starts it in the
    /// provided [`NegotiationRole`].
    ///
    /// # Errors
    ///
    /// With [`CreateSessionError::Duplicate`] if a session with this
    /// participant exists already. Existing session is left untouched.
    ///
    /// With [`CreateSessionError::SelfSession`] if `id` is the local
    /// participant.
    ///
    /// With [`CreateSessionError::Transport`] if transport fails. Nothing is
    /// registered then.
    pub fn create(
        &mut self,
        id: ParticipantId,
        role: NegotiationRole,
        display_name: Option<String>,
    ) -> Result<Rc<PeerConnection>, Traced<CreateSessionError>> {
        if id == self.local_id {
            return Err(tracerr::new!(CreateSessionError::SelfSession));
        }
        if self.peers.contains_key(&id) {
            return Err(tracerr::new!(CreateSessionError::Duplicate(
                DuplicateSessionError(id)
            )));
        }

        let transport = self
            .factory
            .create(&self.ice_servers)
            .map_err(CreateSessionError::Transport)
            .map_err(tracerr::wrap!())?;
        let peer = Rc::new(PeerConnection::new(
            id.clone(),
            SessionSeq(self.seq.next_id()),
            role,
            transport,
            &self.peer_events_sender,
            self.spawner.as_ref(),
        ));
        peer.set_display_name(display_name);
        for track in self.local_tracks.outgoing() {
            peer.add_local_track(track)
                .map_err(CreateSessionError::Transport)
                .map_err(tracerr::wrap!())?;
        }
        peer.start();

        debug!("Created session #{} with `{}` as {}", peer.seq(), id, role);
        self.peers.insert(id, Rc::clone(&peer));
        Ok(peer)
    }

    /// Returns [`PeerConnection`] with the provided remote participant.
    #[inline]
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Rc<PeerConnection>> {
        self.peers.get(id)
    }

    /// Removes and closes [`PeerConnection`] with the provided remote
    /// participant. No-op if there is none.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<Rc<PeerConnection>> {
        let peer = self.peers.remove(id)?;
        peer.close();
        Some(peer)
    }

    /// Returns all the stored [`PeerConnection`]s.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<PeerConnection>> {
        self.peers.values()
    }

    /// Returns count of the stored [`PeerConnection`]s.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Indicates whether there are no stored [`PeerConnection`]s.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Removes and closes all the stored [`PeerConnection`]s.
    pub fn clear(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.close();
        }
    }
}
