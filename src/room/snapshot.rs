//! Read-only view of a [`Room`] state.
//!
//! [`Room`]: super::Room

use std::rc::Rc;

use huddle_signalling_proto::{Participant, ParticipantId};

use crate::platform::MediaStreamTrack;

/// Media received from a connected remote participant.
#[derive(Clone, Debug)]
pub struct RemoteStream {
    /// ID of the remote participant.
    pub id: ParticipantId,

    /// Display name of the remote participant, if known.
    pub display_name: Option<String>,

    /// Received tracks.
    pub tracks: Vec<Rc<dyn MediaStreamTrack>>,
}

/// Snapshot of a [`Room`] state exposed to the view layer.
///
/// [`Room`]: super::Room
#[derive(Clone, Debug)]
pub struct RoomSnapshot {
    /// Local tracks: microphone, camera and screen capture, if any.
    pub local_tracks: Vec<Rc<dyn MediaStreamTrack>>,

    /// Streams of the connected remote participants, in order of their
    /// connection.
    pub remote_streams: Vec<RemoteStream>,

    /// Currently loudest remote participant.
    pub active_speaker: Option<ParticipantId>,

    /// Room channel is subscribed.
    pub signalling_connected: bool,

    /// Local audio is muted.
    pub muted: bool,

    /// Local camera is turned off.
    pub video_off: bool,

    /// Local screen is being shared.
    pub sharing: bool,

    /// Local participant has a raised hand.
    pub hand_raised: bool,

    /// Remote participants with raised hands, in order of raising.
    pub raised_hands: Vec<Participant>,
}

impl RoomSnapshot {
    /// Returns count of the participants seen by the local one, including
    /// itself.
    #[inline]
    #[must_use]
    pub fn participants_count(&self) -> usize {
        1 + self.remote_streams.len()
    }

    /// Returns [`RemoteStream`] of the provided participant.
    #[must_use]
    pub fn remote_stream(&self, id: &ParticipantId) -> Option<&RemoteStream> {
        self.remote_streams.iter().find(|s| &s.id == id)
    }
}
