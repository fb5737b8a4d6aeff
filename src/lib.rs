//! Huddle: full-mesh conferencing core.
//!
//! Every participant of a room keeps a direct peer-to-peer session with every
//! other participant, negotiated over a shared broadcast and presence
//! channel.

#![allow(clippy::module_name_repetitions)]
#![forbid(non_ascii_idents, unsafe_code)]

pub mod conf;
pub mod log;
pub mod media;
pub mod peer;
pub mod platform;
pub mod room;
pub mod speaker;
pub mod utils;

#[doc(inline)]
pub use self::{
    conf::Conf,
    room::{Room, RoomEvent, RoomSnapshot},
};

pub use huddle_signalling_proto as proto;
