//! Serial queue of negotiation steps of a single [`PeerConnection`].
//!
//! [`PeerConnection`]: super::PeerConnection

use std::rc::Rc;

use futures::{channel::mpsc, task::LocalSpawn, StreamExt as _};
use huddle_signalling_proto::{
    IceCandidate, ParticipantId, SessionDescription,
};
use tracerr::Traced;

use crate::{
    log::prelude::*,
    platform::RtcPeerConnection,
    utils::{spawn_abortable, TaskHandle},
};

use super::{NegotiationFailure, PeerEvent, SessionSeq};

/// Asynchronous operation over an [`RtcPeerConnection`].
#[derive(Clone, Debug)]
pub enum NegotiationStep {
    /// Create a local offer and set it as local description.
    CreateOffer,

    /// Set a remote offer, then create a local answer and set it as local
    /// description.
    ApplyOffer(SessionDescription),

    /// Set a remote answer.
    ApplyAnswer(SessionDescription),

    /// Add a remote [`IceCandidate`].
    AddCandidate(IceCandidate),
}

/// Result of a successfully applied [`NegotiationStep`].
enum Completed {
    OfferCreated(String),
    AnswerCreated(String),
    Nothing,
}

/// Worker applying [`NegotiationStep`]s to an [`RtcPeerConnection`] one by
/// one, in the order they are pushed.
///
/// The next step is never started before the previous one completes, so a
/// candidate is never added before the description it belongs to is set.
/// Pending steps are discarded once this [`Negotiator`] is dropped.
#[derive(Debug)]
pub struct Negotiator {
    /// Sender of the steps to the worker.
    steps: mpsc::UnboundedSender<NegotiationStep>,

    /// Handle of the worker task.
    _worker: TaskHandle,
}

impl Negotiator {
    /// Spawns a new [`Negotiator`] worker, reporting step results as
    /// [`PeerEvent`]s into the provided `events` sender.
    pub fn spawn(
        peer_id: ParticipantId,
        seq: SessionSeq,
        transport: Rc<dyn RtcPeerConnection>,
        events: mpsc::UnboundedSender<PeerEvent>,
        spawner: &dyn LocalSpawn,
    ) -> Self {
        let (steps, mut steps_rx) = mpsc::unbounded();
        let worker = spawn_abortable(spawner, async move {
            while let Some(step) = steps_rx.next().await {
                trace!("Applying {:?} to session with `{}`", step, peer_id);
                let peer_id = peer_id.clone();
                let event = match apply(transport.as_ref(), step).await {
                    Ok(Completed::OfferCreated(sdp)) => {
                        PeerEvent::OfferCreated { peer_id, seq, sdp }
                    }
                    Ok(Completed::AnswerCreated(sdp)) => {
                        PeerEvent::AnswerCreated { peer_id, seq, sdp }
                    }
                    Ok(Completed::Nothing) => continue,
                    Err(error) => PeerEvent::NegotiationFailed {
                        peer_id,
                        seq,
                        error,
                    },
                };
                if events.unbounded_send(event).is_err() {
                    break;
                }
            }
        });

        Self {
            steps,
            _worker: worker,
        }
    }

    /// Schedules the provided [`NegotiationStep`].
    pub fn push(&self, step: NegotiationStep) {
        if let Err(e) = self.steps.unbounded_send(step) {
            debug!("Negotiation step is discarded: {:?}", e.into_inner());
        }
    }
}

/// Applies the provided [`NegotiationStep`] to the provided `transport`.
async fn apply(
    transport: &dyn RtcPeerConnection,
    step: NegotiationStep,
) -> Result<Completed, Traced<NegotiationFailure>> {
    use NegotiationFailure as F;

    Ok(match step {
        NegotiationStep::CreateOffer => Completed::OfferCreated(
            transport
                .create_and_set_offer()
                .await
                .map_err(F::CreateOffer)
                .map_err(tracerr::wrap!())?,
        ),
        NegotiationStep::ApplyOffer(offer) => {
            transport
                .set_remote_description(offer)
                .await
                .map_err(F::SetRemoteDescription)
                .map_err(tracerr::wrap!())?;
            Completed::AnswerCreated(
                transport
                    .create_and_set_answer()
                    .await
                    .map_err(F::CreateAnswer)
                    .map_err(tracerr::wrap!())?,
            )
        }
        NegotiationStep::ApplyAnswer(answer) => {
            transport
                .set_remote_description(answer)
                .await
                .map_err(F::SetRemoteDescription)
                .map_err(tracerr::wrap!())?;
            Completed::Nothing
        }
        NegotiationStep::AddCandidate(candidate) => {
            transport
                .add_ice_candidate(candidate)
                .await
                .map_err(F::AddIceCandidate)
                .map_err(tracerr::wrap!())?;
            Completed::Nothing
        }
    })
}
