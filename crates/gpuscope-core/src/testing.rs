//! In-process driver double for unit tests.
//!
//! `MockDriver` never runs anything asynchronously: recorded events stay
//! "in flight" until [`MockDriver::complete_all`] is called, and stream
//! callbacks are queued until [`MockDriver::run_callbacks`] fires them.
//! Every driver call is counted so tests can assert on exactly which calls
//! a context issued.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::driver::{
    Backend, DeviceId, Driver, DriverOp, HostCallback, RawEvent, RawStream,
};
use crate::error::{ContextError, Result};

/// Counting, manually-driven [`Driver`] implementation.
pub struct MockDriver {
    device_count: usize,
    next_handle: AtomicU64,
    calls: [AtomicU64; DriverOp::COUNT],
    in_flight: Mutex<HashSet<RawEvent>>,
    callbacks: Mutex<Vec<(RawStream, HostCallback)>>,
    waits: Mutex<Vec<(RawStream, RawEvent)>>,
    failures: Mutex<Vec<DriverOp>>,
    current_device: Mutex<Option<DeviceId>>,
}

impl MockDriver {
    /// Creates a driver reporting `device_count` devices.
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            next_handle: AtomicU64::new(1),
            calls: Default::default(),
            in_flight: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
            waits: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            current_device: Mutex::new(None),
        }
    }

    /// Number of times `op` was called.
    pub fn calls(&self, op: DriverOp) -> u64 {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: DriverOp) {
        self.failures.lock().push(op);
    }

    /// `(stream, event)` pairs of every issued stream wait.
    pub fn waits(&self) -> Vec<(RawStream, RawEvent)> {
        self.waits.lock().clone()
    }

    /// Last device selected through `set_current_device`.
    pub fn current_device(&self) -> Option<DeviceId> {
        *self.current_device.lock()
    }

    /// Number of callbacks waiting to fire.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Marks all recorded work as completed.
    pub fn complete_all(&self) {
        self.in_flight.lock().clear();
    }

    /// Completes all work, then fires queued callbacks in enqueue order,
    /// including callbacks enqueued by the callbacks themselves.
    ///
    /// Returns the number of callbacks fired.
    pub fn run_callbacks(&self) -> usize {
        let mut fired = 0;
        loop {
            self.complete_all();
            let batch: Vec<_> = self.callbacks.lock().drain(..).collect();
            if batch.is_empty() {
                return fired;
            }
            for (_, callback) in batch {
                callback(Ok(()));
                fired += 1;
            }
        }
    }

    fn enter(&self, op: DriverOp) -> Result<()> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|f| *f == op) {
            failures.remove(pos);
            return Err(ContextError::driver(op, "injected failure"));
        }
        Ok(())
    }

    fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.ordinal() >= self.device_count {
            return Err(ContextError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl Driver for MockDriver {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn device_count(&self) -> Result<usize> {
        self.enter(DriverOp::DeviceCount)?;
        Ok(self.device_count)
    }

    fn set_current_device(&self, device: DeviceId) -> Result<()> {
        self.enter(DriverOp::SetDevice)?;
        self.check_device(device)?;
        *self.current_device.lock() = Some(device);
        Ok(())
    }

    fn stream_create(&self, device: DeviceId) -> Result<RawStream> {
        self.enter(DriverOp::StreamCreate)?;
        self.check_device(device)?;
        Ok(RawStream::from_raw(self.next()))
    }

    fn stream_destroy(&self, _stream: RawStream) -> Result<()> {
        self.enter(DriverOp::StreamDestroy)
    }

    fn event_create(&self, device: DeviceId) -> Result<RawEvent> {
        self.enter(DriverOp::EventCreate)?;
        self.check_device(device)?;
        Ok(RawEvent::from_raw(self.next()))
    }

    fn event_destroy(&self, event: RawEvent) -> Result<()> {
        self.enter(DriverOp::EventDestroy)?;
        self.in_flight.lock().remove(&event);
        Ok(())
    }

    fn event_record(&self, event: RawEvent, _stream: RawStream) -> Result<()> {
        self.enter(DriverOp::EventRecord)?;
        self.in_flight.lock().insert(event);
        Ok(())
    }

    fn event_query(&self, event: RawEvent) -> Result<bool> {
        self.enter(DriverOp::EventQuery)?;
        Ok(!self.in_flight.lock().contains(&event))
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> Result<()> {
        self.enter(DriverOp::StreamWaitEvent)?;
        self.waits.lock().push((stream, event));
        Ok(())
    }

    fn stream_add_callback(&self, stream: RawStream, callback: HostCallback) -> Result<()> {
        self.enter(DriverOp::StreamAddCallback)?;
        self.callbacks.lock().push((stream, callback));
        Ok(())
    }
}
