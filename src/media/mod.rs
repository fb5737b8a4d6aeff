//! Local media tracks management.

pub mod share;

use std::{cell::RefCell, rc::Rc};

use derive_more::{Display, From};

use crate::platform::{self, MediaStreamTrack};

#[doc(inline)]
pub use self::share::ScreenShare;

/// ID of a [`MediaStreamTrack`].
#[derive(Clone, Debug, Display, Eq, From, Hash, PartialEq)]
#[from(forward)]
pub struct TrackId(pub String);

/// Kind of a [`MediaStreamTrack`].
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum MediaKind {
    /// Audio track.
    #[display(fmt = "audio")]
    Audio,

    /// Video track.
    #[display(fmt = "video")]
    Video,
}

/// Errors of acquiring local media.
#[derive(Clone, Debug, Display)]
pub enum MediaAcquisitionError {
    /// Camera or microphone couldn't be captured.
    #[display(fmt = "Failed to capture local camera/microphone: {}", _0)]
    LocalAv(platform::Error),

    /// Screen couldn't be captured.
    #[display(fmt = "Failed to capture screen: {}", _0)]
    Screen(platform::Error),
}

/// Local [`MediaStreamTrack`]s shared by all the sessions of a room.
///
/// At most one video source is sent at any time: the screen capture while
/// sharing, or the camera otherwise.
#[derive(Debug, Default)]
pub struct LocalTracks {
    /// Captured microphone.
    audio: RefCell<Option<Rc<dyn MediaStreamTrack>>>,

    /// Captured camera.
    camera: RefCell<Option<Rc<dyn MediaStreamTrack>>>,

    /// Captured screen, if sharing is active.
    screen: RefCell<Option<Rc<dyn MediaStreamTrack>>>,
}

impl LocalTracks {
    /// Stores the first audio and the first video track of the provided
    /// captured ones as the microphone and the camera. Superfluous tracks are
    /// stopped.
    ///
    /// Previously stored microphone and camera are stopped and replaced.
    pub fn set_captured(&self, tracks: Vec<Rc<dyn MediaStreamTrack>>) {
        let mut audio = None;
        let mut camera = None;
        for track in tracks {
            let slot = match track.kind() {
                MediaKind::Audio => &mut audio,
                MediaKind::Video => &mut camera,
            };
            if slot.is_none() {
                *slot = Some(track);
            } else {
                track.stop();
            }
        }
        if let Some(old) = self.audio.replace(audio) {
            old.stop();
        }
        if let Some(old) = self.camera.replace(camera) {
            old.stop();
        }
    }

    /// Returns the captured microphone track.
    #[inline]
    #[must_use]
    pub fn audio(&self) -> Option<Rc<dyn MediaStreamTrack>> {
        self.audio.borrow().clone()
    }

    /// Returns the captured camera track.
    #[inline]
    #[must_use]
    pub fn camera(&self) -> Option<Rc<dyn MediaStreamTrack>> {
        self.camera.borrow().clone()
    }

    /// Returns the captured screen track.
    #[inline]
    #[must_use]
    pub fn screen(&self) -> Option<Rc<dyn MediaStreamTrack>> {
        self.screen.borrow().clone()
    }

    /// Replaces the screen track with the provided one, returning the
    /// previous one.
    pub(crate) fn replace_screen(
        &self,
        screen: Option<Rc<dyn MediaStreamTrack>>,
    ) -> Option<Rc<dyn MediaStreamTrack>> {
        self.screen.replace(screen)
    }

    /// Returns the video track currently fed to all the sessions.
    #[must_use]
    pub fn outgoing_video(&self) -> Option<Rc<dyn MediaStreamTrack>> {
        self.screen().or_else(|| self.camera())
    }

    /// Returns all the tracks a newly created session must send.
    #[must_use]
    pub fn outgoing(&self) -> Vec<Rc<dyn MediaStreamTrack>> {
        self.audio().into_iter().chain(self.outgoing_video()).collect()
    }

    /// Returns all the stored tracks.
    #[must_use]
    pub fn all(&self) -> Vec<Rc<dyn MediaStreamTrack>> {
        self.audio()
            .into_iter()
            .chain(self.camera())
            .chain(self.screen())
            .collect()
    }

    /// Stops and forgets all the stored tracks.
    pub fn stop_all(&self) {
        for slot in &[&self.audio, &self.camera, &self.screen] {
            if let Some(track) = slot.borrow_mut().take() {
                track.stop();
            }
        }
    }
}
