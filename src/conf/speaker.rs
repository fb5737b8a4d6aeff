//! Active speaker detection settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Active speaker detection settings.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct Speaker {
    /// Volume a participant must exceed to be considered speaking.
    ///
    /// Volume is a sum of all frequency bins of an audio snapshot, so this
    /// value depends on [`Speaker::fft_size`]. Defaults to `2000`.
    #[default(2000)]
    pub threshold: u32,

    /// [FFT] window size of remote audio analysers. Resulting snapshots
    /// contain half as many frequency bins. Defaults to `256`.
    ///
    /// [FFT]: https://en.wikipedia.org/wiki/Fast_Fourier_transform
    #[default(256)]
    pub fft_size: u32,

    /// Interval between two consecutive active speaker estimations.
    /// Defaults to `16ms`, which is roughly one animation frame.
    #[default(Duration::from_millis(16))]
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
}
