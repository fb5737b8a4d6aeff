//! Signalling channel settings.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Signalling channel settings.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct Signalling {
    /// Prefix prepended to a room code to get the key of the broadcast
    /// channel serving that room. Defaults to `meeting:`.
    #[default("meeting:")]
    pub channel_prefix: Cow<'static, str>,
}
