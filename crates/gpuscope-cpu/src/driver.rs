//! Simulated driver implementation.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use gpuscope_core::driver::{
    Backend, DeviceId, Driver, DriverOp, HostCallback, RawEvent, RawStream,
};
use gpuscope_core::error::{ContextError, Result};

use crate::stream::{SimEvent, SimStream, StreamOp};

thread_local! {
    static CURRENT_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

/// CPU-based implementation of [`Driver`].
///
/// Simulates a number of devices whose streams are host worker threads.
/// Work submitted with [`launch`](Self::launch) runs in stream order, events
/// complete when their stream reaches them and stream waits block the
/// waiting worker, never the host. Used for testing and as a fallback when
/// no GPU is available.
pub struct SimDriver {
    device_count: usize,
    next_handle: AtomicU64,
    streams: RwLock<HashMap<RawStream, SimStream>>,
    events: RwLock<HashMap<RawEvent, Arc<SimEvent>>>,
    calls: [AtomicU64; DriverOp::COUNT],
    failures: Mutex<Vec<DriverOp>>,
    waits: Mutex<Vec<(RawStream, RawEvent)>>,
}

impl SimDriver {
    /// Create a driver simulating `device_count` devices.
    pub fn new(device_count: usize) -> Self {
        info!("Initializing simulated driver ({} devices)", device_count);

        Self {
            device_count,
            next_handle: AtomicU64::new(1),
            streams: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            calls: Default::default(),
            failures: Mutex::new(Vec::new()),
            waits: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue `kernel` on `stream`.
    ///
    /// The closure runs on the stream's worker thread after all previously
    /// enqueued work. A panicking kernel faults the stream: later kernels
    /// are skipped and later callbacks receive an error.
    pub fn launch<F>(&self, stream: RawStream, kernel: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let streams = self.streams.read();
        let target = streams
            .get(&stream)
            .ok_or_else(|| ContextError::driver(DriverOp::StreamAddCallback, "unknown stream"))?;
        target.submit(StreamOp::Launch(Box::new(kernel)), DriverOp::StreamAddCallback)
    }

    /// Block the calling thread until everything enqueued on `stream` so
    /// far has run.
    pub fn synchronize(&self, stream: RawStream) -> Result<()> {
        let (done, finished) = mpsc::channel();
        {
            let streams = self.streams.read();
            let target = streams.get(&stream).ok_or_else(|| {
                ContextError::driver(DriverOp::StreamAddCallback, "unknown stream")
            })?;
            target.submit(StreamOp::Drain(done), DriverOp::StreamAddCallback)?;
        }
        finished
            .recv()
            .map_err(|_| ContextError::driver(DriverOp::StreamAddCallback, "stream worker exited"))
    }

    /// Number of times `op` was called.
    pub fn calls(&self, op: DriverOp) -> u64 {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: DriverOp) {
        self.failures.lock().push(op);
    }

    /// `(stream, event)` pairs of every issued stream wait.
    pub fn waits(&self) -> Vec<(RawStream, RawEvent)> {
        self.waits.lock().clone()
    }

    /// Number of live streams.
    pub fn live_streams(&self) -> usize {
        self.streams.read().len()
    }

    /// Number of live events.
    pub fn live_events(&self) -> usize {
        self.events.read().len()
    }

    /// Device last selected on the calling thread.
    pub fn current_device(&self) -> Option<DeviceId> {
        CURRENT_DEVICE.with(Cell::get)
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

    fn event(&self, event: RawEvent, op: DriverOp) -> Result<Arc<SimEvent>> {
        self.events
            .read()
            .get(&event)
            .cloned()
            .ok_or_else(|| ContextError::driver(op, "unknown event"))
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Driver for SimDriver {
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
        CURRENT_DEVICE.with(|current| current.set(Some(device)));
        Ok(())
    }

    fn stream_create(&self, device: DeviceId) -> Result<RawStream> {
        self.enter(DriverOp::StreamCreate)?;
        self.check_device(device)?;

        let raw = RawStream::from_raw(self.next_handle());
        let stream = SimStream::spawn(device, raw)?;
        self.streams.write().insert(raw, stream);
        debug!("Created simulated stream {} on {}", raw.as_raw(), device);
        Ok(raw)
    }

    fn stream_destroy(&self, stream: RawStream) -> Result<()> {
        self.enter(DriverOp::StreamDestroy)?;
        self.streams
            .write()
            .remove(&stream)
            .map(|_| ())
            .ok_or_else(|| ContextError::driver(DriverOp::StreamDestroy, "unknown stream"))
    }

    fn event_create(&self, device: DeviceId) -> Result<RawEvent> {
        self.enter(DriverOp::EventCreate)?;
        self.check_device(device)?;

        let raw = RawEvent::from_raw(self.next_handle());
        self.events.write().insert(raw, Arc::new(SimEvent::new(device)));
        Ok(raw)
    }

    fn event_destroy(&self, event: RawEvent) -> Result<()> {
        self.enter(DriverOp::EventDestroy)?;
        // Queued records and waits keep their own reference.
        self.events
            .write()
            .remove(&event)
            .map(|_| ())
            .ok_or_else(|| ContextError::driver(DriverOp::EventDestroy, "unknown event"))
    }

    fn event_record(&self, event: RawEvent, stream: RawStream) -> Result<()> {
        self.enter(DriverOp::EventRecord)?;
        let sim_event = self.event(event, DriverOp::EventRecord)?;

        let streams = self.streams.read();
        let target = streams
            .get(&stream)
            .ok_or_else(|| ContextError::driver(DriverOp::EventRecord, "unknown stream"))?;
        if target.device != sim_event.device {
            return Err(ContextError::driver(
                DriverOp::EventRecord,
                format!(
                    "event on {} recorded on stream of {}",
                    sim_event.device, target.device
                ),
            ));
        }
        let generation = sim_event.begin_record();
        target.submit(StreamOp::Record(sim_event, generation), DriverOp::EventRecord)
    }

    fn event_query(&self, event: RawEvent) -> Result<bool> {
        self.enter(DriverOp::EventQuery)?;
        Ok(self.event(event, DriverOp::EventQuery)?.is_complete())
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> Result<()> {
        self.enter(DriverOp::StreamWaitEvent)?;
        let sim_event = self.event(event, DriverOp::StreamWaitEvent)?;
        let generation = sim_event.last_recorded();

        let streams = self.streams.read();
        let target = streams
            .get(&stream)
            .ok_or_else(|| ContextError::driver(DriverOp::StreamWaitEvent, "unknown stream"))?;
        target.submit(
            StreamOp::Wait(sim_event, generation),
            DriverOp::StreamWaitEvent,
        )?;
        self.waits.lock().push((stream, event));
        Ok(())
    }

    fn stream_add_callback(&self, stream: RawStream, callback: HostCallback) -> Result<()> {
        self.enter(DriverOp::StreamAddCallback)?;
        let streams = self.streams.read();
        let target = streams
            .get(&stream)
            .ok_or_else(|| ContextError::driver(DriverOp::StreamAddCallback, "unknown stream"))?;
        target.submit(StreamOp::Callback(callback), DriverOp::StreamAddCallback)
    }
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("device_count", &self.device_count)
            .field("streams", &self.live_streams())
            .field("events", &self.live_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_driver_creation() {
        let driver = SimDriver::new(2);
        assert_eq!(driver.backend(), Backend::Cpu);
        assert_eq!(driver.device_count().unwrap(), 2);
        assert_eq!(driver.calls(DriverOp::DeviceCount), 1);
    }

    #[test]
    fn test_invalid_device_rejected() {
        let driver = SimDriver::new(1);
        assert!(matches!(
            driver.stream_create(DeviceId(1)).unwrap_err(),
            ContextError::InvalidDevice { .. }
        ));
        assert!(driver.set_current_device(DeviceId(3)).is_err());
    }

    #[test]
    fn test_current_device_is_per_thread() {
        let driver = Arc::new(SimDriver::new(2));
        driver.set_current_device(DeviceId(1)).unwrap();
        assert_eq!(driver.current_device(), Some(DeviceId(1)));

        let other = Arc::clone(&driver);
        let seen = std::thread::spawn(move || other.current_device())
            .join()
            .unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn test_work_runs_in_stream_order() {
        let driver = SimDriver::new(1);
        let stream = driver.stream_create(DeviceId(0)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            driver.launch(stream, move || order.lock().push(i)).unwrap();
        }
        driver.synchronize(stream).unwrap();

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_event_completes_when_stream_reaches_it() {
        let driver = SimDriver::new(1);
        let stream = driver.stream_create(DeviceId(0)).unwrap();
        let event = driver.event_create(DeviceId(0)).unwrap();
        assert!(driver.event_query(event).unwrap());

        let (release, gate) = mpsc::channel::<()>();
        driver
            .launch(stream, move || {
                let _ = gate.recv();
            })
            .unwrap();
        driver.event_record(event, stream).unwrap();
        assert!(!driver.event_query(event).unwrap());

        release.send(()).unwrap();
        driver.synchronize(stream).unwrap();
        assert!(driver.event_query(event).unwrap());
    }

    #[test]
    fn test_stream_wait_orders_across_streams() {
        let driver = SimDriver::new(1);
        let producer = driver.stream_create(DeviceId(0)).unwrap();
        let consumer = driver.stream_create(DeviceId(0)).unwrap();
        let event = driver.event_create(DeviceId(0)).unwrap();
        let value = Arc::new(AtomicUsize::new(0));

        {
            let value = Arc::clone(&value);
            driver
                .launch(producer, move || {
                    std::thread::sleep(Duration::from_millis(20));
                    value.store(42, Ordering::SeqCst);
                })
                .unwrap();
        }
        driver.event_record(event, producer).unwrap();
        driver.stream_wait_event(consumer, event).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let value = Arc::clone(&value);
            let seen = Arc::clone(&seen);
            driver
                .launch(consumer, move || {
                    seen.store(value.load(Ordering::SeqCst), Ordering::SeqCst)
                })
                .unwrap();
        }
        driver.synchronize(consumer).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(driver.waits(), vec![(consumer, event)]);
    }

    #[test]
    fn test_callback_receives_stream_fault() {
        let driver = SimDriver::new(1);
        let stream = driver.stream_create(DeviceId(0)).unwrap();
        let (tx, rx) = mpsc::channel();

        driver.launch(stream, || panic!("bad kernel")).unwrap();
        driver
            .stream_add_callback(
                stream,
                Box::new(move |status| {
                    let _ = tx.send(status);
                }),
            )
            .unwrap();

        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = status.unwrap_err();
        assert!(err.to_string().contains("bad kernel"));
    }

    #[test]
    fn test_destroyed_stream_finishes_queued_work() {
        let driver = SimDriver::new(1);
        let stream = driver.stream_create(DeviceId(0)).unwrap();
        let (tx, rx) = mpsc::channel();

        driver
            .stream_add_callback(
                stream,
                Box::new(move |status| {
                    let _ = tx.send(status.is_ok());
                }),
            )
            .unwrap();
        driver.stream_destroy(stream).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(driver.live_streams(), 0);
        assert!(driver.launch(stream, || {}).is_err());
    }

    #[test]
    fn test_injected_failure() {
        let driver = SimDriver::new(1);
        driver.fail_next(DriverOp::EventCreate);
        let err = driver.event_create(DeviceId(0)).unwrap_err();
        assert_eq!(err, ContextError::driver(DriverOp::EventCreate, "injected failure"));
        assert!(driver.event_create(DeviceId(0)).is_ok());
        assert_eq!(driver.calls(DriverOp::EventCreate), 2);
    }
}
