//! [ICE] servers settings.
//!
//! [ICE]: https://webrtcglossary.com/ice

use huddle_signalling_proto::IceServer;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// [ICE] servers settings.
///
/// [ICE]: https://webrtcglossary.com/ice
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct Ice {
    /// [STUN]/[TURN] servers passed to every created peer connection.
    ///
    /// Defaults to public Google [STUN] servers.
    ///
    /// [STUN]: https://webrtcglossary.com/stun
    /// [TURN]: https://webrtcglossary.com/turn
    #[default(_code = "default_servers()")]
    pub servers: Vec<IceServer>,
}

/// Returns public [STUN] servers used when nothing else is configured.
///
/// [STUN]: https://webrtcglossary.com/stun
fn default_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}
