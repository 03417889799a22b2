//! State carried from the acquire phase of a task to its later phases.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::DeviceId;
use crate::error::{ContextError, Result};
use crate::pool::SharedStream;

struct Slot {
    device: DeviceId,
    stream: SharedStream,
}

/// Device and stream handed from an acquire phase to the phases after it.
///
/// [`ScopedContextAcquire`] fills the state when it finishes; only an
/// acquire created with a state may push continuation tasks.
/// [`ScopedContextProduce`] moves the stream out, after which the state is
/// empty and may be filled again by the next acquire. Moving the stream out
/// twice is an error.
///
/// Clones refer to the same state.
///
/// [`ScopedContextAcquire`]: crate::context::ScopedContextAcquire
/// [`ScopedContextProduce`]: crate::context::ScopedContextProduce
#[derive(Clone, Default)]
pub struct ContextState {
    slot: Arc<Mutex<Option<Slot>>>,
}

impl ContextState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while the state holds a stream.
    pub fn is_valid(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Device of the held stream.
    pub fn device(&self) -> Result<DeviceId> {
        self.slot
            .lock()
            .as_ref()
            .map(|slot| slot.device)
            .ok_or(ContextError::StreamAlreadyReleased)
    }

    /// Borrows the held stream; the state keeps owning it.
    pub fn stream(&self) -> Result<SharedStream> {
        self.slot
            .lock()
            .as_ref()
            .map(|slot| slot.stream.clone())
            .ok_or(ContextError::StreamAlreadyReleased)
    }

    /// Moves the device and stream out of the state.
    pub fn release_stream(&self) -> Result<(DeviceId, SharedStream)> {
        self.slot
            .lock()
            .take()
            .map(|slot| (slot.device, slot.stream))
            .ok_or(ContextError::StreamAlreadyReleased)
    }

    pub(crate) fn set(&self, device: DeviceId, stream: SharedStream) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(ContextError::ContextStateAlreadySet);
        }
        *slot = Some(Slot { device, stream });
        Ok(())
    }
}

impl fmt::Debug for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(slot) => f
                .debug_struct("ContextState")
                .field("device", &slot.device)
                .field("stream", &slot.stream)
                .finish(),
            None => f.write_str("ContextState(empty)"),
        }
    }
}
