//! Active speaker estimation based on remote audio energy.

use std::rc::Rc;

use huddle_signalling_proto::ParticipantId;

use crate::{conf, peer::PeerConnection};

/// Reduces a frequency-domain energy snapshot to a scalar volume.
#[inline]
#[must_use]
pub fn volume(frequency_data: &[u8]) -> u32 {
    frequency_data.iter().map(|&bin| u32::from(bin)).sum()
}

/// Estimator of the currently loudest remote participant.
#[derive(Clone, Copy, Debug)]
pub struct ActiveSpeakerEstimator {
    /// Volume which must be exceeded to consider a participant speaking.
    threshold: u32,
}

impl ActiveSpeakerEstimator {
    /// Creates new [`ActiveSpeakerEstimator`] with the provided silence
    /// `threshold`.
    #[inline]
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Returns the participant with the strictly greatest volume, if it
    /// exceeds the silence threshold. The first one wins on ties.
    pub fn select<I>(&self, volumes: I) -> Option<ParticipantId>
    where
        I: IntoIterator<Item = (ParticipantId, u32)>,
    {
        let mut loudest: Option<(ParticipantId, u32)> = None;
        for (id, volume) in volumes {
            if loudest.as_ref().map_or(true, |(_, max)| volume > *max) {
                loudest = Some((id, volume));
            }
        }
        loudest
            .filter(|(_, max)| *max > self.threshold)
            .map(|(id, _)| id)
    }

    /// Samples audio of the provided sessions and selects the active speaker
    /// among them. Sessions without an audio analyser are skipped.
    pub fn sample<'a, I>(&self, peers: I) -> Option<ParticipantId>
    where
        I: IntoIterator<Item = &'a Rc<PeerConnection>>,
    {
        self.select(peers.into_iter().filter_map(|peer| {
            let analyser = peer.analyser()?;
            Some((peer.id().clone(), volume(&analyser.frequency_data())))
        }))
    }
}

impl From<&conf::Speaker> for ActiveSpeakerEstimator {
    #[inline]
    fn from(conf: &conf::Speaker) -> Self {
        Self::new(conf.threshold)
    }
}
