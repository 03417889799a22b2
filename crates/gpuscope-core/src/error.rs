//! Error types for scoped GPU contexts.

use std::any::Any;
use std::fmt;

use crate::driver::{DeviceId, DriverOp};

/// Errors raised by the scoped contexts, pools and drivers.
///
/// Three kinds exist: usage errors (the calling code broke an API
/// contract), resource errors (a driver call failed) and consistency
/// errors (provenance bookkeeping is broken). None of them is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// A driver call failed.
    #[error("Driver call {op} failed: {message}")]
    Driver {
        /// Failed operation.
        op: DriverOp,
        /// Backend error description.
        message: String,
    },

    /// The driver reports no usable device.
    #[error("No GPU devices available")]
    NoDevices,

    /// The requested backend is not compiled in or not present.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// A device id outside the driver's range was used.
    #[error("Invalid device {device}: {count} device(s) present")]
    InvalidDevice {
        /// Offending device.
        device: DeviceId,
        /// Number of devices known to the runtime.
        count: usize,
    },

    /// `push_next_task` was called on a context created without a state.
    #[error("push_next_task requires a ContextState, but the context was created without one")]
    NoContextState,

    /// The stream of a `ContextState` was requested but is not there.
    #[error("ContextState has no stream: it was never set or was already released")]
    StreamAlreadyReleased,

    /// A `ContextState` that still holds a stream was handed to a new acquire.
    #[error("ContextState already holds a stream; it must be released before it is set again")]
    ContextStateAlreadySet,

    /// No product is stored under the key.
    #[error("Product '{0}' not found")]
    ProductNotFound(String),

    /// A product exists under the key but with another value type.
    #[error("Product '{key}' holds a different type than requested")]
    ProductTypeMismatch {
        /// Product key label.
        key: String,
    },

    /// A product was already stored under the key.
    #[error("Product '{0}' was already stored")]
    ProductAlreadyStored(String),

    /// A product that is not yet available carries no event to wait for.
    #[error("Product on {device} is not available and carries no event")]
    MissingEvent {
        /// Device of the product.
        device: DeviceId,
    },

    /// A continuation task panicked before it could finish.
    #[error("Continuation task on {device} panicked: {message}")]
    TaskPanicked {
        /// Device of the task.
        device: DeviceId,
        /// Panic message.
        message: String,
    },
}

impl ContextError {
    /// Builds a driver error from a backend error.
    pub fn driver(op: DriverOp, message: impl fmt::Display) -> Self {
        ContextError::Driver {
            op,
            message: message.to_string(),
        }
    }

    /// Builds the error reported for a panicking continuation from the
    /// panic payload.
    pub fn task_panicked(device: DeviceId, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        ContextError::TaskPanicked { device, message }
    }

    /// Returns `true` for API contract violations by the calling code.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ContextError::InvalidDevice { .. }
                | ContextError::NoContextState
                | ContextError::StreamAlreadyReleased
                | ContextError::ContextStateAlreadySet
                | ContextError::ProductNotFound(_)
                | ContextError::ProductTypeMismatch { .. }
                | ContextError::ProductAlreadyStored(_)
        )
    }

    /// Returns `true` for driver and resource failures.
    #[must_use]
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            ContextError::Driver { .. } | ContextError::NoDevices | ContextError::BackendUnavailable(_)
        )
    }

    /// Returns `true` when an event presence invariant was violated.
    #[must_use]
    pub fn is_consistency_error(&self) -> bool {
        matches!(self, ContextError::MissingEvent { .. })
    }
}

/// Result type for scoped context operations.
pub type Result<T> = std::result::Result<T, ContextError>;
