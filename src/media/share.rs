//! Screen sharing via in-place replacement of the outgoing video track.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{channel::mpsc, future, task::LocalSpawn};
use tracerr::Traced;

use crate::{
    log::prelude::*,
    platform::{MediaDevices, MediaStreamTrack, RtpSender},
    utils::{spawn_abortable, TaskHandle},
};

use super::{LocalTracks, MediaAcquisitionError, TrackId};

/// Controller switching the outgoing video of all the sessions between the
/// camera and a screen capture, without renegotiating them.
pub struct ScreenShare {
    /// Local tracks the screen capture is stored into.
    tracks: Rc<LocalTracks>,

    /// Devices the screen is captured from.
    media_devices: Rc<dyn MediaDevices>,

    /// Executor of the capture end watcher.
    spawner: Rc<dyn LocalSpawn>,

    /// Receives ID of the screen capture once its source is gone.
    capture_ended: mpsc::UnboundedSender<TrackId>,

    /// Watcher of the current screen capture end.
    ended_watcher: RefCell<Option<TaskHandle>>,

    /// Screen capture is in progress.
    capturing: Cell<bool>,

    /// Bumped on every stop, so a capture started before it is dropped.
    generation: Cell<u32>,
}

impl ScreenShare {
    /// Creates new [`ScreenShare`] controller.
    ///
    /// IDs of screen captures ended by their source are sent into the
    /// provided `capture_ended` sender.
    pub fn new(
        tracks: Rc<LocalTracks>,
        media_devices: Rc<dyn MediaDevices>,
        spawner: Rc<dyn LocalSpawn>,
        capture_ended: mpsc::UnboundedSender<TrackId>,
    ) -> Self {
        Self {
            tracks,
            media_devices,
            spawner,
            capture_ended,
            ended_watcher: RefCell::new(None),
            capturing: Cell::new(false),
            generation: Cell::new(0),
        }
    }

    /// Indicates whether screen is being shared.
    #[inline]
    #[must_use]
    pub fn is_sharing(&self) -> bool {
        self.tracks.screen().is_some()
    }

    /// Indicates whether the provided track is the current screen capture.
    #[must_use]
    pub fn is_current_screen(&self, id: &TrackId) -> bool {
        self.tracks.screen().map_or(false, |s| &s.id() == id)
    }

    /// Captures the screen and replaces the outgoing video of all the
    /// senders returned by `senders` with it.
    ///
    /// `senders` is called once the screen is captured, so sessions created
    /// while capturing are covered too. No-op if sharing is active or being
    /// started already. Sessions created afterwards send the screen right
    /// away.
    ///
    /// Capture finished after [`ScreenShare::stop()`] or
    /// [`ScreenShare::release()`] is stopped and dropped.
    ///
    /// # Errors
    ///
    /// With [`MediaAcquisitionError::Screen`] if the screen couldn't be
    /// captured. Outgoing video stays untouched then.
    pub async fn start<S>(
        &self,
        senders: S,
    ) -> Result<(), Traced<MediaAcquisitionError>>
    where
        S: Fn() -> Vec<Rc<dyn RtpSender>>,
    {
        if self.is_sharing() || self.capturing.replace(true) {
            return Ok(());
        }
        let generation = self.generation.get();
        let captured = self.media_devices.capture_screen().await;
        if self.generation.get() != generation {
            if let Ok(screen) = captured {
                debug!("Screen capture `{}` is cancelled", screen.id());
                screen.stop();
            }
            return Ok(());
        }
        self.capturing.set(false);
        let screen = captured
            .map_err(MediaAcquisitionError::Screen)
            .map_err(tracerr::wrap!())?;

        let previous = self.tracks.replace_screen(Some(Rc::clone(&screen)));
        if let Some(previous) = previous {
            previous.stop();
        }
        self.watch_ended(&screen);
        info!("Screen sharing started with track `{}`", screen.id());

        replace_all(senders(), screen).await;
        Ok(())
    }

    /// Restores the camera as the outgoing video of the provided `senders`
    /// and releases the screen capture. Cancels a pending capture.
    ///
    /// No-op if sharing is not active.
    pub async fn stop(&self, senders: Vec<Rc<dyn RtpSender>>) {
        self.cancel_capture();
        let screen = match self.tracks.replace_screen(None) {
            Some(screen) => screen,
            None => return,
        };
        drop(self.ended_watcher.borrow_mut().take());

        if let Some(camera) = self.tracks.camera() {
            replace_all(senders, camera).await;
        } else {
            debug!("No camera to restore after screen sharing");
        }
        screen.stop();
        info!("Screen sharing with track `{}` stopped", screen.id());
    }

    /// Stops the screen capture, if any, without touching any senders.
    /// Cancels a pending capture.
    pub fn release(&self) {
        self.cancel_capture();
        drop(self.ended_watcher.borrow_mut().take());
        if let Some(screen) = self.tracks.replace_screen(None) {
            screen.stop();
        }
    }

    /// Makes a capture in progress drop its result once finished.
    fn cancel_capture(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
        self.capturing.set(false);
    }

    /// Spawns a watcher notifying about the provided `screen` capture end.
    fn watch_ended(&self, screen: &Rc<dyn MediaStreamTrack>) {
        let ended = screen.on_ended();
        let id = screen.id();
        let tx = self.capture_ended.clone();
        let watcher = spawn_abortable(self.spawner.as_ref(), async move {
            ended.await;
            let _ = tx.unbounded_send(id);
        });
        *self.ended_watcher.borrow_mut() = Some(watcher);
    }
}

/// Replaces the sent track of all the provided `senders` with the provided
/// `track` concurrently. Failures are logged and don't affect other senders.
pub(crate) async fn replace_all(
    senders: Vec<Rc<dyn RtpSender>>,
    track: Rc<dyn MediaStreamTrack>,
) {
    let results = future::join_all(senders.iter().map(|sender| {
        let track = Rc::clone(&track);
        async move { sender.replace_track(track).await }
    }))
    .await;
    for err in results.into_iter().filter_map(Result::err) {
        warn!(
            "Failed to replace outgoing track with `{}`: {}",
            track.id(),
            err
        );
    }
}
