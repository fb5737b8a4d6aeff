//! Signalling protocol of [Huddle] rooms.
//!
//! Every participant of a room is subscribed to the same broadcast channel,
//! so each message sent by one participant is delivered to all the others.
//! Point-to-point semantics are layered on top of it: every
//! [`SignallingMessage`] carries its sender and its addressee, and receivers
//! drop everything not addressed to them.
//!
//! Payloads are validated at the boundary by [`Broadcast::parse()`], so
//! malformed or self-addressed messages never reach a participant's state
//! machine.
//!
//! [Huddle]: https://github.com/huddle-dev/huddle

#![forbid(unsafe_code)]

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast event name of [`SignallingMessage::Offer`].
pub const OFFER_EVENT: &str = "offer";

/// Broadcast event name of [`SignallingMessage::Answer`].
pub const ANSWER_EVENT: &str = "answer";

/// Broadcast event name of [`SignallingMessage::IceCandidate`].
pub const ICE_CANDIDATE_EVENT: &str = "ice";

/// Broadcast event name of [`RaiseHand`].
pub const RAISE_HAND_EVENT: &str = "raise-hand";

/// ID of a room participant.
///
/// Assigned by the identity provider and never changes while the
/// participant stays in a room.
#[derive(
    Clone,
    Debug,
    Deserialize,
    Display,
    Eq,
    From,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[from(forward)]
pub struct ParticipantId(pub String);

/// Code of a room, shared by participants out of band.
#[derive(
    Clone, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize,
)]
#[from(forward)]
pub struct RoomCode(pub String);

impl RoomCode {
    /// Returns key of the broadcast channel serving this room, using the
    /// provided `prefix`.
    #[must_use]
    pub fn channel_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

/// Presence metadata announced by every participant once subscribed to a
/// room channel.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Participant {
    /// ID of the participant.
    pub user_id: ParticipantId,

    /// Human-readable name of the participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Participant {
    /// Creates a new [`Participant`] with the provided ID and display name.
    pub fn new<I, N>(user_id: I, username: N) -> Self
    where
        I: Into<ParticipantId>,
        N: Into<Option<String>>,
    {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Type of a [`SessionDescription`].
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// [SDP] offer.
    ///
    /// [SDP]: https://tools.ietf.org/html/rfc4566
    #[display(fmt = "offer")]
    Offer,

    /// [SDP] answer.
    ///
    /// [SDP]: https://tools.ietf.org/html/rfc4566
    #[display(fmt = "answer")]
    Answer,
}

/// Session description negotiated between two participants.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionDescription {
    /// Type of this description.
    #[serde(rename = "type")]
    pub kind: SdpType,

    /// Raw [SDP] body.
    ///
    /// [SDP]: https://tools.ietf.org/html/rfc4566
    pub sdp: String,
}

impl SessionDescription {
    /// Creates a new [`SdpType::Offer`] description.
    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates a new [`SdpType::Answer`] description.
    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate discovered by one side of a peer connection.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line.
    pub candidate: String,

    /// Media stream identification tag of the candidate.
    #[serde(default)]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to.
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// [STUN]/[TURN] server used by peer connections.
///
/// [STUN]: https://webrtcglossary.com/stun
/// [TURN]: https://webrtcglossary.com/turn
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IceServer {
    /// URLs of the server.
    pub urls: Vec<String>,

    /// Username to authorize with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential to authorize with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates an unauthenticated [`IceServer`] with a single URL.
    pub fn stun<U: Into<String>>(url: U) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// SDP offer sent by the initiating side.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Offer {
    /// Sender of this offer.
    pub from: ParticipantId,

    /// Addressee of this offer.
    pub to: ParticipantId,

    /// Offered session description.
    #[serde(rename = "offer")]
    pub description: SessionDescription,

    /// Display name of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// SDP answer sent back by the answering side.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Answer {
    /// Sender of this answer.
    pub from: ParticipantId,

    /// Addressee of this answer.
    pub to: ParticipantId,

    /// Answered session description.
    #[serde(rename = "answer")]
    pub description: SessionDescription,
}

/// Locally discovered [`IceCandidate`] sent to the remote side.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Candidate {
    /// Sender of this candidate.
    pub from: ParticipantId,

    /// Addressee of this candidate.
    pub to: ParticipantId,

    /// Discovered candidate.
    pub candidate: IceCandidate,
}

/// Point-to-point message negotiating a peer connection between two
/// participants.
#[derive(Clone, Debug, Eq, From, PartialEq)]
pub enum SignallingMessage {
    /// Initiating side offers a session.
    Offer(Offer),

    /// Answering side accepts an offered session.
    Answer(Answer),

    /// Either side shares a connectivity candidate.
    IceCandidate(Candidate),
}

impl SignallingMessage {
    /// Returns sender of this message.
    #[must_use]
    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Offer(m) => &m.from,
            Self::Answer(m) => &m.from,
            Self::IceCandidate(m) => &m.from,
        }
    }

    /// Returns addressee of this message.
    #[must_use]
    pub fn addressee(&self) -> &ParticipantId {
        match self {
            Self::Offer(m) => &m.to,
            Self::Answer(m) => &m.to,
            Self::IceCandidate(m) => &m.to,
        }
    }

    /// Indicates whether this message is addressed to the provided
    /// participant.
    #[inline]
    #[must_use]
    pub fn is_addressed_to(&self, id: &ParticipantId) -> bool {
        self.addressee() == id
    }

    /// Returns broadcast event name this message is sent with.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Offer(_) => OFFER_EVENT,
            Self::Answer(_) => ANSWER_EVENT,
            Self::IceCandidate(_) => ICE_CANDIDATE_EVENT,
        }
    }

    /// Checks invariants that cannot be expressed by the payload shape.
    fn validate(&self) -> Result<(), ParseError> {
        if self.sender().0.is_empty() || self.addressee().0.is_empty() {
            return Err(ParseError::EmptyParticipantId);
        }
        if self.sender() == self.addressee() {
            return Err(ParseError::SelfAddressed(self.sender().clone()));
        }
        let (expected, actual) = match self {
            Self::Offer(m) => (SdpType::Offer, m.description.kind),
            Self::Answer(m) => (SdpType::Answer, m.description.kind),
            Self::IceCandidate(_) => return Ok(()),
        };
        if expected == actual {
            Ok(())
        } else {
            Err(ParseError::DescriptionMismatch { expected, actual })
        }
    }
}

/// Action of a [`RaiseHand`] message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandAction {
    /// Participant raised a hand.
    Raise,

    /// Participant lowered a hand.
    Lower,
}

/// Room-wide notification about a participant raising or lowering a hand.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseHand {
    /// Participant whose hand has changed.
    pub user_id: ParticipantId,

    /// Display name of the participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// What happened to the hand.
    pub action: HandAction,
}

/// Validated message received from (or sent to) a room broadcast channel.
#[derive(Clone, Debug, Eq, From, PartialEq)]
pub enum Broadcast {
    /// Point-to-point [`SignallingMessage`].
    Signalling(SignallingMessage),

    /// Room-wide [`RaiseHand`] notification.
    RaiseHand(RaiseHand),
}

impl Broadcast {
    /// Parses and validates a raw broadcast `payload` received with the
    /// provided `event` name.
    ///
    /// # Errors
    ///
    /// - [`ParseError::UnknownEvent`] if `event` is not a known event name.
    /// - [`ParseError::Malformed`] if `payload` doesn't match the event
    ///   shape.
    /// - [`ParseError::EmptyParticipantId`], [`ParseError::SelfAddressed`]
    ///   or [`ParseError::DescriptionMismatch`] if the payload is well-formed
    ///   but violates protocol invariants.
    pub fn parse(event: &str, payload: Value) -> Result<Self, ParseError> {
        let msg: SignallingMessage = match event {
            OFFER_EVENT => {
                SignallingMessage::Offer(serde_json::from_value(payload)?)
            }
            ANSWER_EVENT => {
                SignallingMessage::Answer(serde_json::from_value(payload)?)
            }
            ICE_CANDIDATE_EVENT => SignallingMessage::IceCandidate(
                serde_json::from_value(payload)?,
            ),
            RAISE_HAND_EVENT => {
                let raise: RaiseHand = serde_json::from_value(payload)?;
                if raise.user_id.0.is_empty() {
                    return Err(ParseError::EmptyParticipantId);
                }
                return Ok(Self::RaiseHand(raise));
            }
            _ => return Err(ParseError::UnknownEvent(event.to_owned())),
        };
        msg.validate()?;
        Ok(Self::Signalling(msg))
    }

    /// Returns broadcast event name of this message.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Signalling(msg) => msg.event(),
            Self::RaiseHand(_) => RAISE_HAND_EVENT,
        }
    }

    /// Encodes this message into a broadcast payload.
    ///
    /// # Errors
    ///
    /// If serialization fails.
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Signalling(SignallingMessage::Offer(m)) => {
                serde_json::to_value(m)
            }
            Self::Signalling(SignallingMessage::Answer(m)) => {
                serde_json::to_value(m)
            }
            Self::Signalling(SignallingMessage::IceCandidate(m)) => {
                serde_json::to_value(m)
            }
            Self::RaiseHand(m) => serde_json::to_value(m),
        }
    }
}

/// Errors of parsing a raw broadcast payload into a [`Broadcast`].
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ParseError {
    /// Event name is not a part of the protocol.
    #[display(fmt = "Unknown broadcast event `{}`", _0)]
    UnknownEvent(String),

    /// Payload doesn't match the event shape.
    #[display(fmt = "Malformed broadcast payload: {}", _0)]
    Malformed(String),

    /// Sender or addressee ID is empty.
    #[display(fmt = "Participant ID cannot be empty")]
    EmptyParticipantId,

    /// Message is addressed to its own sender.
    #[display(fmt = "Message of `{}` is addressed to itself", _0)]
    SelfAddressed(ParticipantId),

    /// Description type doesn't match the event it is sent with.
    #[display(
        fmt = "Expected `{}` description, but got `{}`",
        expected,
        actual
    )]
    DescriptionMismatch {
        /// Description type required by the event.
        expected: SdpType,

        /// Description type actually received.
        actual: SdpType,
    },
}

impl From<serde_json::Error> for ParseError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
