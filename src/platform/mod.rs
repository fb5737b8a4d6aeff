//! Contracts of the external collaborators this crate is driven by: the
//! signalling channel, local capture devices and the peer-to-peer transport.
//!
//! Implementations are provided by the embedding host (browser bindings,
//! native WebRTC stacks, in-memory fakes for tests).

use std::{fmt, rc::Rc, time::Duration};

use async_trait::async_trait;
use derive_more::{Display, From};
use futures::{
    future::LocalBoxFuture,
    stream::LocalBoxStream,
    task::LocalSpawn,
};
use huddle_signalling_proto::{
    IceCandidate, IceServer, Participant, ParticipantId, SessionDescription,
};
use serde_json::Value;

use crate::media::{MediaKind, TrackId};

/// Failure reported by a platform collaborator.
#[derive(Clone, Debug, Display, Eq, From, PartialEq)]
#[from(forward)]
pub struct Error(pub String);

/// Media track, either captured locally or received from a remote
/// participant.
pub trait MediaStreamTrack: fmt::Debug {
    /// Returns unique ID of this track.
    fn id(&self) -> TrackId;

    /// Returns [`MediaKind`] of this track.
    fn kind(&self) -> MediaKind;

    /// Indicates whether this track produces media.
    fn enabled(&self) -> bool;

    /// Enables or disables this track without renegotiating any sessions it
    /// is attached to.
    fn set_enabled(&self, enabled: bool);

    /// Returns [`Future`] resolving once the source of this track is gone
    /// (device unplugged, capture revoked by the user, etc).
    ///
    /// [`Future`]: std::future::Future
    fn on_ended(&self) -> LocalBoxFuture<'static, ()>;

    /// Stops this track, releasing the underlying source.
    fn stop(&self);
}

/// Frequency-domain analyser of an audio track.
pub trait AudioAnalyser: fmt::Debug {
    /// Returns current frequency-domain energy snapshot, one byte per bin.
    fn frequency_data(&self) -> Vec<u8>;
}

/// Local capture devices.
#[async_trait(?Send)]
pub trait MediaDevices {
    /// Captures local camera and microphone.
    async fn capture_local_av(
        &self,
    ) -> Result<Vec<Rc<dyn MediaStreamTrack>>, Error>;

    /// Captures screen (or window) video.
    async fn capture_screen(&self) -> Result<Rc<dyn MediaStreamTrack>, Error>;

    /// Creates an [`AudioAnalyser`] for the provided audio `track` with the
    /// provided [FFT] window size.
    ///
    /// [FFT]: https://en.wikipedia.org/wiki/Fast_Fourier_transform
    fn create_analyser(
        &self,
        track: &Rc<dyn MediaStreamTrack>,
        fft_size: u32,
    ) -> Result<Rc<dyn AudioAnalyser>, Error>;
}

/// Sending side of a media track attached to an [`RtcPeerConnection`].
#[async_trait(?Send)]
pub trait RtpSender: fmt::Debug {
    /// Returns [`MediaKind`] this sender is negotiated for.
    fn kind(&self) -> MediaKind;

    /// Returns ID of the track currently sent, if any.
    fn track_id(&self) -> Option<TrackId>;

    /// Replaces the sent track with the provided one, without renegotiating
    /// the session.
    async fn replace_track(
        &self,
        track: Rc<dyn MediaStreamTrack>,
    ) -> Result<(), Error>;
}

/// Events emitted by an [`RtcPeerConnection`].
#[derive(Debug)]
pub enum RtcEvent {
    /// New local [`IceCandidate`] has been gathered.
    IceCandidate(IceCandidate),

    /// New track has been received from the remote side.
    Track(Rc<dyn MediaStreamTrack>),

    /// Connectivity with the remote side has been established.
    Connected,

    /// Connectivity with the remote side has failed.
    Failed,
}

/// Peer-to-peer media transport with a single remote participant.
#[async_trait(?Send)]
pub trait RtcPeerConnection: fmt::Debug {
    /// Attaches the provided local `track`, returning its [`RtpSender`].
    fn add_track(
        &self,
        track: Rc<dyn MediaStreamTrack>,
    ) -> Result<Rc<dyn RtpSender>, Error>;

    /// Creates an SDP offer and sets it as local description.
    async fn create_and_set_offer(&self) -> Result<String, Error>;

    /// Creates an SDP answer and sets it as local description. Requires a
    /// remote offer being set.
    async fn create_and_set_answer(&self) -> Result<String, Error>;

    /// Sets the provided remote description.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), Error>;

    /// Adds the provided remote [`IceCandidate`].
    async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), Error>;

    /// Returns a stream of [`RtcEvent`]s of this connection.
    ///
    /// Expected to be called once, right after creation.
    fn on_event(&self) -> LocalBoxStream<'static, RtcEvent>;

    /// Closes this connection, stopping all its senders and receivers.
    fn close(&self);
}

/// Factory of [`RtcPeerConnection`]s.
pub trait RtcPeerConnectionFactory {
    /// Creates a new [`RtcPeerConnection`] using the provided [`IceServer`]s.
    fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Rc<dyn RtcPeerConnection>, Error>;
}

/// Events delivered by a [`SignallingChannel`].
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Full presence state of the channel.
    PresenceSync(Vec<Participant>),

    /// New participants became present.
    PresenceJoin(Vec<Participant>),

    /// Participant is not present anymore.
    PresenceLeave(ParticipantId),

    /// Raw broadcast message sent by another channel member.
    Broadcast {
        /// Event name the message is sent with.
        event: String,

        /// Raw message payload.
        payload: Value,
    },
}

/// Named broadcast and presence channel, shared by all participants of a
/// room.
///
/// Delivery is expected to be at-least-once and ordered per sender.
#[async_trait(?Send)]
pub trait SignallingChannel {
    /// Subscribes to the channel with the provided `key`.
    async fn subscribe(&self, key: &str) -> Result<(), Error>;

    /// Announces presence of the local participant.
    async fn track(&self, presence: Participant) -> Result<(), Error>;

    /// Broadcasts the provided `payload` with the provided `event` name to
    /// all other channel members.
    fn send(&self, event: &str, payload: Value) -> Result<(), Error>;

    /// Returns a stream of [`ChannelEvent`]s.
    ///
    /// Expected to be called once, before subscribing.
    fn on_event(&self) -> LocalBoxStream<'static, ChannelEvent>;

    /// Leaves the channel.
    fn unsubscribe(&self);
}

/// Source of periodic ticks (animation frames, interval timers).
pub trait Ticker {
    /// Returns a stream yielding once per provided `period`.
    fn interval(&self, period: Duration) -> LocalBoxStream<'static, ()>;
}

/// Set of platform collaborators a [`Room`] is driven by.
///
/// [`Room`]: crate::room::Room
#[derive(Clone)]
pub struct Platform {
    /// Signalling channel of the room.
    pub channel: Rc<dyn SignallingChannel>,

    /// Local capture devices.
    pub media_devices: Rc<dyn MediaDevices>,

    /// Factory of peer-to-peer transports.
    pub peer_connections: Rc<dyn RtcPeerConnectionFactory>,

    /// Ticks of the active speaker estimation loop.
    pub ticker: Rc<dyn Ticker>,

    /// Executor of the room tasks.
    pub spawner: Rc<dyn LocalSpawn>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish()
    }
}
