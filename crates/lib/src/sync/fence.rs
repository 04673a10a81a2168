//! Generation gate around mirror writes.
//!
//! The session observer advances the gate while the session store is still
//! inside the transition, so the mirrors are empty by the time `logout` or
//! `login` returns. The engine task writes through [`MirrorFence::run`], which
//! refuses writes stamped with an older generation.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::mirror::Mirrors;

#[derive(Debug)]
pub(super) struct MirrorFence {
    mirrors: Arc<Mirrors>,
    generation: Mutex<u64>,
}

impl MirrorFence {
    pub(super) fn new(mirrors: Arc<Mirrors>) -> Self {
        Self {
            mirrors,
            generation: Mutex::new(0),
        }
    }

    /// Move to `generation` and clear every mirror.
    ///
    /// Returns false, leaving the mirrors alone, if `generation` is not newer.
    pub(super) fn advance(&self, generation: u64) -> bool {
        let mut current = self.generation.lock().unwrap();
        if generation <= *current {
            return false;
        }
        debug!(from = *current, to = generation, "Clearing mirrors for new session");
        *current = generation;
        self.mirrors.clear_all();
        true
    }

    /// Run `write` if `generation` is still current.
    pub(super) fn run<R>(&self, generation: u64, write: impl FnOnce() -> R) -> Option<R> {
        let current = self.generation.lock().unwrap();
        (*current == generation).then(write)
    }
}
