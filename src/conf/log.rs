//! Logging settings.

use std::{borrow::Cow, str::FromStr as _};

use serde::{Deserialize, Serialize};
use slog::Level;
use smart_default::SmartDefault;

/// Logging settings of a [`Room`](crate::Room) host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault)]
#[serde(default)]
pub struct Log {
    /// Most verbose level of records to write: `CRITICAL`, `ERROR`, `WARN`,
    /// `INFO`, `DEBUG` or `TRACE`, in any case.
    ///
    /// `OFF` disables logging, as does any unknown value.
    #[default("INFO")]
    pub level: Cow<'static, str>,
}

impl Log {
    /// Returns the level to log at, or `None` if logging is disabled.
    #[must_use]
    pub fn level(&self) -> Option<Level> {
        Level::from_str(self.level.trim()).ok()
    }
}
