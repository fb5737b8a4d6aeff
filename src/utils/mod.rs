//! Helper utils used in project.


use std::future::Future;

use derive_more::From;
use futures::{
    future::{self, AbortHandle},
    task::{LocalSpawn, LocalSpawnExt as _},
    FutureExt as _,
};

use crate::log::prelude::*;

/// Wrapper around [`AbortHandle`] which aborts [`Future`] on [`Drop`].
#[derive(Debug, From)]
pub struct TaskHandle(AbortHandle);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns the provided [`Future`] on the provided [`LocalSpawn`]er, returning
/// a [`TaskHandle`] which aborts it once dropped.
///
/// Spawning failure is logged and results in an already aborted
/// [`TaskHandle`].
pub fn spawn_abortable<F>(spawner: &dyn LocalSpawn, fut: F) -> TaskHandle
where
    F: Future<Output = ()> + 'static,
{
    let (fut, handle) = future::abortable(fut);
    if let Err(e) = spawner.spawn_local(fut.map(drop)) {
        error!("Failed to spawn local task: {}", e);
        handle.abort();
    }
    TaskHandle(handle)
}

/// Simple ID counter.
#[derive(Clone, Copy, Default, Debug)]
pub struct Counter {
    count: u32,
}

impl Counter {
    /// Returns id and increase counter.
    pub fn next_id(&mut self) -> u32 {
        let id = self.count;
        self.count += 1;

        id
    }
}
