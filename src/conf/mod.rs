//! Provides application configuration options.
//!
//! Configuration options can be parsed from config files in TOML format.

pub mod ice;
pub mod log;
pub mod signalling;
pub mod speaker;

use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[doc(inline)]
pub use self::{
    ice::Ice, log::Log, signalling::Signalling, speaker::Speaker,
};

/// CLI argument that is responsible for holding application configuration
/// file path.
static APP_CONF_PATH_CMD_ARG_NAME: &str = "--conf";

/// Environment variable that is responsible for holding application
/// configuration file path.
static APP_CONF_PATH_ENV_VAR_NAME: &str = "HUDDLE_CONF";

/// Holds application config.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Conf {
    /// [ICE] servers settings.
    ///
    /// [ICE]: https://webrtcglossary.com/ice
    pub ice: Ice,

    /// Active speaker detection settings.
    pub speaker: Speaker,

    /// Signalling channel settings.
    pub signalling: Signalling,

    /// Logging settings.
    pub log: Log,
}

impl Conf {
    /// Creates new [`Conf`] and applies values from such sources
    /// and in that order:
    /// - default values;
    /// - configuration file, the name of which is given as a command line
    ///   parameter or environment variable;
    /// - environment variables.
    ///
    /// # Errors
    ///
    /// Errors if parsing fails.
    pub fn parse() -> Result<Self, ConfigError> {
        let mut cfg = Config::new();

        if let Some(path) = get_conf_file_name(
            env::var(APP_CONF_PATH_ENV_VAR_NAME),
            env::args(),
        ) {
            cfg.merge(File::with_name(&path))?;
        }

        cfg.merge(Environment::with_prefix("HUDDLE").separator("__"))?;

        cfg.try_into()
    }
}

/// Returns the path to a configuration file, if it's set via CLI `args`
/// or environment variable. Environment variable takes precedence.
fn get_conf_file_name<T>(
    env_var: Result<String, env::VarError>,
    cmd_args: T,
) -> Option<String>
where
    T: Iterator<Item = String>,
{
    if let Ok(path) = env_var {
        return Some(path);
    }
    let mut args = cmd_args.skip_while(|x| x != APP_CONF_PATH_CMD_ARG_NAME);
    if args.next().is_some() {
        args.next().filter(|v| !v.is_empty())
    } else {
        None
    }
}

/// Parses [`Conf`] with the provided environment variables set, and unsets
/// them afterwards.
#[cfg(test)]
#[macro_export]
macro_rules! overrided_by_env_conf {
    ($($env:expr => $value:expr),+ $(,)?) => {{
        $(std::env::set_var($env, $value);)+
        let conf = $crate::conf::Conf::parse().unwrap();
        $(std::env::remove_var($env);)+
        conf
    }};
}
