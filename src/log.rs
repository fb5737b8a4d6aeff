//! Provides logging utilities, used by application.

use std::{env, io};

use chrono::Local;
use slog::{
    o, Discard, Drain, Duplicate, FilterLevel, FnValue, Fuse, Level,
    LevelFilter, Logger, PushFnValue, Record,
};
use slog_async::Async;
use slog_envlogger::{EnvLogger, LogBuilder};
use slog_json::Json;
use slog_scope::GlobalLoggerGuard;

use crate::conf;

/// Re-exports common definitions for logging.
///
/// Use this module as following:
/// ```rust
/// use huddle::log::prelude::*;
/// ```
pub mod prelude {
    pub use slog::{slog_debug, slog_error, slog_info, slog_trace, slog_warn};
    pub use slog_scope::{debug, error, info, trace, warn};
}

/// Installs a [`new_dual_logger`] writing to `stdout`/`stderr` as the global
/// [`slog_scope`] logger, according to the provided [`conf::Log`] settings.
///
/// Logging stays enabled as long as the returned [`GlobalLoggerGuard`] is
/// alive.
pub fn init(conf: &conf::Log) -> GlobalLoggerGuard {
    let logger = match conf.level() {
        Some(level) => new_dual_logger(io::stdout(), io::stderr(), level),
        None => Logger::root(Discard, o!()),
    };
    slog_scope::set_global_logger(logger)
}

/// Builds JSON [`Logger`] which prints all its log records to `w_out` writer,
/// but WARN level (and higher) to `w_err` writer. Records less severe than
/// the provided `level` are dropped. `RUST_LOG` directives may narrow it down
/// per module. Logger will use [`Async`] drain with channel size of 2048
/// entries.
///
/// Created [`Logger`] produces log records with `fqn`, `lvl`, `time` and `msg`
/// fields by default.
pub fn new_dual_logger<W1, W2>(w_out: W1, w_err: W2, level: Level) -> Logger
where
    W1: io::Write + Send + 'static,
    W2: io::Write + Send + 'static,
{
    let drain_out = Json::new(w_out).build();
    let drain_err = Json::new(w_err).build();
    let drain = Duplicate(
        drain_out.filter(|r| !r.level().is_at_least(Level::Warning)),
        drain_err.filter_level(Level::Warning),
    )
    .map(Fuse);
    let drain = env_filter(drain, level).fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    let drain = Async::new(drain).chan_size(2048).build().fuse();
    add_default_keys(&Logger::root(drain, o!()))
}

/// Wraps the provided `drain` into [`EnvLogger`] passing records up to the
/// provided `level` unless `RUST_LOG` says otherwise.
fn env_filter<D: Drain>(drain: D, level: Level) -> EnvLogger<D> {
    let default =
        FilterLevel::from_usize(level.as_usize()).unwrap_or(FilterLevel::Info);
    let builder = LogBuilder::new(drain).filter(None, default);
    match env::var("RUST_LOG") {
        Ok(directives) => builder.parse(&directives),
        Err(_) => builder,
    }
    .build()
}

/// Adds default log record data (key-value pairs) to specified [`Logger`]:
/// - `msg`: log record message.
/// - `fqn`: path to code line that called log function.
/// - `time`: creation date and time of log record in [RFC 3339] format.
/// - `lvl`: logging level of log record.
///
/// [RFC 3339]: https://www.ietf.org/rfc/rfc3339.txt
fn add_default_keys(logger: &Logger) -> Logger {
    logger.new(o!(
        "msg" => PushFnValue(move |record : &Record, ser| {
            ser.emit(record.msg())
        }),
        "fqn" => PushFnValue(move |record : &Record, ser| {
             ser.emit(format_args!("{}:{}", record.module(), record.line()))
        }),
        "time" => PushFnValue(move |_ : &Record, ser| {
            ser.emit(Local::now().to_rfc3339())
        }),
        "lvl" => FnValue(move |rinfo : &Record| {
            rinfo.level().as_str()
        }),
    ))
}
