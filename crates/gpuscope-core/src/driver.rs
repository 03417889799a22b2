//! Driver boundary.
//!
//! The scoped contexts never talk to a GPU API directly. Every device,
//! stream and event operation goes through the [`Driver`] trait, which is
//! implemented by the backend crates (`gpuscope-cpu` for the simulated
//! driver, `gpuscope-cuda` for the CUDA driver API).
//!
//! Drivers follow the "current device" model: a context selects its device
//! when it is constructed and never restores the previous one. Every call
//! site that depends on the current device is expected to set it itself.

use std::fmt;

use crate::error::Result;

/// Identifier of a GPU (device ordinal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub usize);

impl DeviceId {
    /// Creates a device id from an ordinal.
    #[must_use]
    pub const fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    /// Returns the device ordinal.
    #[must_use]
    pub const fn ordinal(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu:{}", self.0)
    }
}

/// Identifier of a pipeline task slot.
///
/// Used only to pick a deterministic default device when a context is not
/// created from an existing product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Creates a slot id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the default device for this slot (round-robin over devices).
    #[must_use]
    pub fn device(self, device_count: usize) -> DeviceId {
        DeviceId(self.0 as usize % device_count.max(1))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// Opaque driver stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStream(u64);

impl RawStream {
    /// Wraps a backend handle value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the backend handle value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Opaque driver event handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent(u64);

impl RawEvent {
    /// Wraps a backend handle value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the backend handle value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Driver backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Pick the best available backend.
    #[default]
    Auto,
    /// Simulated host-thread driver.
    Cpu,
    /// NVIDIA CUDA driver API.
    Cuda,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Auto => write!(f, "auto"),
            Backend::Cpu => write!(f, "cpu"),
            Backend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Driver operations, used for error reporting and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// Query the number of devices.
    DeviceCount,
    /// Select the current device.
    SetDevice,
    /// Create a stream.
    StreamCreate,
    /// Destroy a stream.
    StreamDestroy,
    /// Create an event.
    EventCreate,
    /// Destroy an event.
    EventDestroy,
    /// Record an event on a stream.
    EventRecord,
    /// Query whether an event's captured work has completed.
    EventQuery,
    /// Make a stream wait for an event.
    StreamWaitEvent,
    /// Enqueue a host callback on a stream.
    StreamAddCallback,
}

impl DriverOp {
    /// Number of distinct operations.
    pub const COUNT: usize = 10;

    /// All operations, in declaration order.
    pub const ALL: [DriverOp; Self::COUNT] = [
        DriverOp::DeviceCount,
        DriverOp::SetDevice,
        DriverOp::StreamCreate,
        DriverOp::StreamDestroy,
        DriverOp::EventCreate,
        DriverOp::EventDestroy,
        DriverOp::EventRecord,
        DriverOp::EventQuery,
        DriverOp::StreamWaitEvent,
        DriverOp::StreamAddCallback,
    ];

    /// Dense index of this operation, suitable for counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Short name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DriverOp::DeviceCount => "device_count",
            DriverOp::SetDevice => "set_current_device",
            DriverOp::StreamCreate => "stream_create",
            DriverOp::StreamDestroy => "stream_destroy",
            DriverOp::EventCreate => "event_create",
            DriverOp::EventDestroy => "event_destroy",
            DriverOp::EventRecord => "event_record",
            DriverOp::EventQuery => "event_query",
            DriverOp::StreamWaitEvent => "stream_wait_event",
            DriverOp::StreamAddCallback => "stream_add_callback",
        }
    }
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host function enqueued on a stream.
///
/// Invoked exactly once, on a driver-owned thread, after all work queued on
/// the stream before it has completed. The argument carries the stream
/// status at that point.
pub type HostCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Low-level device/stream/event driver.
///
/// Implementations must be callable concurrently from any host thread.
/// Enqueuing operations never blocks the caller until the device work
/// completes.
pub trait Driver: Send + Sync + 'static {
    /// Returns the backend kind.
    fn backend(&self) -> Backend;

    /// Returns the number of devices.
    fn device_count(&self) -> Result<usize>;

    /// Sets the current device of the calling thread.
    fn set_current_device(&self, device: DeviceId) -> Result<()>;

    /// Creates a stream on `device`.
    fn stream_create(&self, device: DeviceId) -> Result<RawStream>;

    /// Destroys a stream. Pending work is allowed to finish.
    fn stream_destroy(&self, stream: RawStream) -> Result<()>;

    /// Creates an event on `device`. A fresh event reports as completed.
    fn event_create(&self, device: DeviceId) -> Result<RawEvent>;

    /// Destroys an event.
    fn event_destroy(&self, event: RawEvent) -> Result<()>;

    /// Records `event` at the current tail of `stream`.
    fn event_record(&self, event: RawEvent, stream: RawStream) -> Result<()>;

    /// Returns `true` if the work captured by the last record of `event`
    /// has completed (or the event was never recorded).
    fn event_query(&self, event: RawEvent) -> Result<bool>;

    /// Makes all work enqueued on `stream` after this call wait for the
    /// last record of `event`. Never blocks the host.
    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> Result<()>;

    /// Enqueues `callback` on `stream`.
    ///
    /// Callbacks on the same stream fire in enqueue order. On error the
    /// callback is dropped without being called.
    fn stream_add_callback(&self, stream: RawStream, callback: HostCallback) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_device_round_robin() {
        assert_eq!(SlotId(0).device(2), DeviceId(0));
        assert_eq!(SlotId(1).device(2), DeviceId(1));
        assert_eq!(SlotId(5).device(2), DeviceId(1));
        assert_eq!(SlotId(7).device(1), DeviceId(0));
        // A zero count never divides by zero.
        assert_eq!(SlotId(3).device(0), DeviceId(0));
    }

    #[test]
    fn test_driver_op_index() {
        for (i, op) in DriverOp::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
        }
        assert_eq!(DriverOp::StreamWaitEvent.to_string(), "stream_wait_event");
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId(3).to_string(), "gpu:3");
        assert_eq!(SlotId(2).to_string(), "slot:2");
        assert_eq!(Backend::Cuda.to_string(), "cuda");
    }
}
