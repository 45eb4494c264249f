//! Single-writer registry for input fifos.
//!
//! Any number of HTTP requests may attach to a handle's input fifo, but only
//! one write descriptor may ever exist for it: the transform sees EOF when
//! that descriptor closes, so a stray second fd would keep the pipeline alive
//! forever. The registry resolves the attach race with compare-and-insert;
//! the losing opener drops (and thereby closes) its own descriptor.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::fs::File;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// The one write descriptor for a handle's input fifo.
///
/// Concurrent writers serialize whole-body copies through [`WriterSlot::lock`];
/// interleaving chunks of two request bodies mid-stream would corrupt the
/// transform input.
#[derive(Debug)]
pub struct WriterSlot {
    file: Mutex<File>,
}

impl WriterSlot {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Mutex::new(File::from_std(file)),
        }
    }

    /// Exclusive access to the descriptor for the duration of one body copy.
    pub async fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().await
    }
}

/// Process-wide handle → writer map with single-writer discipline.
#[derive(Debug, Default)]
pub struct WriterRegistry {
    slots: DashMap<String, Arc<WriterSlot>>,
}

impl WriterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle's writer, opening `write_dir/handle` on first attach.
    ///
    /// Returns `None` when the fifo does not exist (unknown or finished
    /// handle) or has no reader. The open is non-blocking so a session whose
    /// supervisor died without cleanup cannot wedge the caller; the flag is
    /// cleared before the descriptor is used for real writes.
    pub fn acquire(&self, write_dir: &Path, handle: &str) -> Option<Arc<WriterSlot>> {
        if let Some(slot) = self.slots.get(handle) {
            return Some(slot.value().clone());
        }

        let path = write_dir.join(handle);
        let file = match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) => {
                debug!(handle, path = %path.display(), %err, "could not open writer");
                return None;
            }
        };
        if let Err(err) = pinch_fifo::clear_nonblocking(&file) {
            warn!(handle, %err, "could not clear O_NONBLOCK on writer");
            return None;
        }

        match self.slots.entry(handle.to_string()) {
            // Lost the race; our freshly opened fd closes on drop.
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(WriterSlot::new(file));
                vacant.insert(slot.clone());
                debug!(handle, "installed writer");
                Some(slot)
            }
        }
    }

    /// Remove the handle's writer if present; idempotent.
    ///
    /// The descriptor closes once the last in-flight body copy drops its
    /// reference, which is when the transform sees EOF.
    pub fn maybe_release(&self, handle: &str) -> bool {
        match self.slots.remove(handle) {
            Some(_) => {
                debug!(handle, "released writer");
                true
            }
            None => false,
        }
    }

    /// Whether a writer is currently installed for the handle.
    pub fn contains(&self, handle: &str) -> bool {
        self.slots.contains_key(handle)
    }
}
