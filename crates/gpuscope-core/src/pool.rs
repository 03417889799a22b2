//! Per-device stream and event pools.
//!
//! Streams and events are expensive driver objects, so released handles
//! are cached per device and handed out again. A handle is shared through
//! an `Arc`; when the last clone is dropped the raw handle goes back to the
//! free list of its device instead of being destroyed.
//!
//! Pools are the only structures mutated concurrently by many host
//! threads. The free lists sit behind one mutex per pool; individual
//! handles are never locked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::driver::{DeviceId, Driver, HostCallback, RawEvent, RawStream};
use crate::error::Result;

/// A driver resource that can be cached in a [`ResourcePool`].
pub trait PooledResource: Copy + fmt::Debug + Send + Sync + 'static {
    /// Resource name used in logs.
    const KIND: &'static str;

    /// Creates a resource on `device`.
    fn create(driver: &dyn Driver, device: DeviceId) -> Result<Self>;

    /// Destroys a resource.
    fn destroy(driver: &dyn Driver, raw: Self) -> Result<()>;
}

impl PooledResource for RawStream {
    const KIND: &'static str = "stream";

    fn create(driver: &dyn Driver, device: DeviceId) -> Result<Self> {
        driver.stream_create(device)
    }

    fn destroy(driver: &dyn Driver, raw: Self) -> Result<()> {
        driver.stream_destroy(raw)
    }
}

impl PooledResource for RawEvent {
    const KIND: &'static str = "event";

    fn create(driver: &dyn Driver, device: DeviceId) -> Result<Self> {
        driver.event_create(device)
    }

    fn destroy(driver: &dyn Driver, raw: Self) -> Result<()> {
        driver.event_destroy(raw)
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    /// Resources created through the driver.
    pub created: u64,
    /// Requests served from the cache.
    pub reused: u64,
    /// Resources destroyed (cache full or cleared).
    pub destroyed: u64,
    /// Idle resources currently cached, over all devices.
    pub cached: usize,
}

impl PoolStats {
    /// Fraction of requests served from the cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} reused ({:.1}% hits), {} destroyed, {} cached",
            self.created,
            self.reused,
            self.hit_rate() * 100.0,
            self.destroyed,
            self.cached
        )
    }
}

struct PoolInner<R> {
    driver: Arc<dyn Driver>,
    max_cached: usize,
    free: Mutex<HashMap<DeviceId, Vec<R>>>,
    created: AtomicU64,
    reused: AtomicU64,
    destroyed: AtomicU64,
}

impl<R: PooledResource> PoolInner<R> {
    fn release(&self, device: DeviceId, raw: R) {
        {
            let mut free = self.free.lock();
            let list = free.entry(device).or_default();
            if list.len() < self.max_cached {
                list.push(raw);
                trace!(kind = R::KIND, %device, ?raw, "Returned to pool");
                return;
            }
        }
        self.destroy(raw);
    }

    fn destroy(&self, raw: R) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = R::destroy(self.driver.as_ref(), raw) {
            warn!(kind = R::KIND, ?raw, %err, "Failed to destroy pooled resource");
        }
    }
}

/// A pooled raw handle; goes back to its pool when dropped.
struct Pooled<R: PooledResource> {
    raw: R,
    device: DeviceId,
    pool: Arc<PoolInner<R>>,
}

impl<R: PooledResource> Drop for Pooled<R> {
    fn drop(&mut self) {
        self.pool.release(self.device, self.raw);
    }
}

/// Thread-safe per-device cache of driver resources.
pub struct ResourcePool<R: PooledResource> {
    inner: Arc<PoolInner<R>>,
}

/// Pool of streams.
pub type StreamPool = ResourcePool<RawStream>;

/// Pool of events.
pub type EventPool = ResourcePool<RawEvent>;

impl<R: PooledResource> ResourcePool<R> {
    /// Creates an empty pool that keeps at most `max_cached` idle
    /// resources per device.
    pub fn new(driver: Arc<dyn Driver>, max_cached: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                max_cached,
                free: Mutex::new(HashMap::new()),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    fn acquire(&self, device: DeviceId) -> Result<Pooled<R>> {
        let cached = self.inner.free.lock().get_mut(&device).and_then(Vec::pop);

        let raw = match cached {
            Some(raw) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                trace!(kind = R::KIND, %device, ?raw, "Reusing pooled resource");
                raw
            }
            None => {
                let raw = R::create(self.inner.driver.as_ref(), device)?;
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                debug!(kind = R::KIND, %device, ?raw, "Created pooled resource");
                raw
            }
        };

        Ok(Pooled {
            raw,
            device,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Creates resources until `device` has `count` idle ones cached
    /// (bounded by the cache cap).
    pub fn preallocate(&self, device: DeviceId, count: usize) -> Result<()> {
        let target = count.min(self.inner.max_cached);
        let missing = target.saturating_sub(self.cached(device));

        let mut created = Vec::with_capacity(missing);
        for _ in 0..missing {
            created.push(R::create(self.inner.driver.as_ref(), device)?);
            self.inner.created.fetch_add(1, Ordering::Relaxed);
        }

        for raw in created {
            self.inner.release(device, raw);
        }
        Ok(())
    }

    /// Number of idle resources cached for `device`.
    #[must_use]
    pub fn cached(&self, device: DeviceId) -> usize {
        self.inner.free.lock().get(&device).map_or(0, Vec::len)
    }

    /// Returns pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let cached = self.inner.free.lock().values().map(Vec::len).sum();
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            cached,
        }
    }

    /// Destroys every idle resource, keeping the per-device slots.
    ///
    /// Handles still in use are unaffected and return to the (now empty)
    /// cache when released.
    pub fn clear(&self) {
        let drained: Vec<R> = {
            let mut free = self.inner.free.lock();
            free.values_mut().flat_map(|list| list.drain(..)).collect()
        };

        let count = drained.len();
        for raw in drained {
            self.inner.destroy(raw);
        }
        info!(kind = R::KIND, count, "Cleared pool");
    }
}

impl StreamPool {
    /// Returns an idle stream of `device`, creating one if none is cached.
    pub fn get(&self, device: DeviceId) -> Result<SharedStream> {
        self.acquire(device).map(|pooled| SharedStream(Arc::new(pooled)))
    }
}

impl EventPool {
    /// Returns an event of `device` whose captured work has completed.
    ///
    /// Cached events still in flight are held aside (not handed out) until
    /// a completed or freshly created event is found, so the same in-flight
    /// event is not fetched over and over. The held events go back to the
    /// cache afterwards.
    pub fn get(&self, device: DeviceId) -> Result<SharedEvent> {
        let event = self.acquire(device)?;
        if self.inner.driver.event_query(event.raw)? {
            return Ok(SharedEvent::new(event));
        }

        let mut in_flight = vec![event];
        loop {
            let event = self.acquire(device)?;
            if self.inner.driver.event_query(event.raw)? {
                trace!(%device, skipped = in_flight.len(), "Skipped in-flight events");
                return Ok(SharedEvent::new(event));
            }
            in_flight.push(event);
        }
    }
}

/// Shared-owned stream handle.
///
/// Clones refer to the same driver stream. The stream returns to its
/// [`StreamPool`] when the last clone is dropped.
#[derive(Clone)]
pub struct SharedStream(Arc<Pooled<RawStream>>);

impl SharedStream {
    /// Raw driver handle.
    #[must_use]
    pub fn raw(&self) -> RawStream {
        self.0.raw
    }

    /// Device the stream belongs to.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.0.device
    }

    /// Returns `true` if both handles refer to the same driver queue.
    #[must_use]
    pub fn same_queue(&self, other: &SharedStream) -> bool {
        self.raw() == other.raw()
    }

    /// Number of live owners of this stream.
    #[must_use]
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Makes subsequent work on this stream wait for `event`.
    pub fn wait_event(&self, event: &SharedEvent) -> Result<()> {
        self.0.pool.driver.stream_wait_event(self.raw(), event.raw())
    }

    /// Enqueues a host callback on this stream.
    pub fn add_callback(&self, callback: HostCallback) -> Result<()> {
        self.0.pool.driver.stream_add_callback(self.raw(), callback)
    }
}

impl PartialEq for SharedStream {
    fn eq(&self, other: &Self) -> bool {
        self.same_queue(other)
    }
}

impl Eq for SharedStream {}

impl fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStream")
            .field("raw", &self.raw())
            .field("device", &self.device())
            .finish()
    }
}

struct EventEntry {
    pooled: Pooled<RawEvent>,
    // Set once recorded in the current use cycle.
    recorded: AtomicBool,
}

/// Shared-owned event handle.
///
/// The event returns to its [`EventPool`] when the last clone is dropped.
/// Each handout starts unrecorded, whatever the pooled driver event went
/// through before.
#[derive(Clone)]
pub struct SharedEvent(Arc<EventEntry>);

impl SharedEvent {
    fn new(pooled: Pooled<RawEvent>) -> Self {
        SharedEvent(Arc::new(EventEntry {
            pooled,
            recorded: AtomicBool::new(false),
        }))
    }

    /// Raw driver handle.
    #[must_use]
    pub fn raw(&self) -> RawEvent {
        self.0.pooled.raw
    }

    /// Device the event belongs to.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.0.pooled.device
    }

    /// Records the event at the current tail of `stream`.
    pub fn record(&self, stream: &SharedStream) -> Result<()> {
        self.0.pooled.pool.driver.event_record(self.raw(), stream.raw())?;
        self.0.recorded.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns `true` once [`record`](Self::record) has succeeded on this
    /// handle.
    ///
    /// Drivers report a never-recorded event as complete, so a query alone
    /// cannot tell whether there is work to wait for.
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.0.recorded.load(Ordering::Acquire)
    }

    /// Returns `true` once the recorded work has completed.
    pub fn has_completed(&self) -> Result<bool> {
        self.0.pooled.pool.driver.event_query(self.raw())
    }
}

impl PartialEq for SharedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for SharedEvent {}

impl fmt::Debug for SharedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEvent")
            .field("raw", &self.raw())
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverOp;
    use crate::testing::MockDriver;

    fn pools(driver: &Arc<MockDriver>) -> (StreamPool, EventPool) {
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        (
            StreamPool::new(Arc::clone(&dyn_driver), 8),
            EventPool::new(dyn_driver, 8),
        )
    }

    #[test]
    fn test_stream_pool_reuse() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, _) = pools(&driver);

        let first = streams.get(DeviceId(0)).unwrap();
        let raw = first.raw();
        drop(first);
        assert_eq!(streams.cached(DeviceId(0)), 1);

        let second = streams.get(DeviceId(0)).unwrap();
        assert_eq!(second.raw(), raw);
        assert_eq!(driver.calls(DriverOp::StreamCreate), 1);
        assert_eq!(streams.stats().reused, 1);
    }

    #[test]
    fn test_stream_returns_on_last_owner() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, _) = pools(&driver);

        let stream = streams.get(DeviceId(0)).unwrap();
        let clone = stream.clone();
        assert_eq!(stream.owners(), 2);

        drop(stream);
        assert_eq!(streams.cached(DeviceId(0)), 0);
        drop(clone);
        assert_eq!(streams.cached(DeviceId(0)), 1);
    }

    #[test]
    fn test_pool_is_per_device() {
        let driver = Arc::new(MockDriver::new(2));
        let (streams, _) = pools(&driver);

        drop(streams.get(DeviceId(0)).unwrap());
        let other = streams.get(DeviceId(1)).unwrap();
        assert_eq!(other.device(), DeviceId(1));
        assert_eq!(driver.calls(DriverOp::StreamCreate), 2);
    }

    #[test]
    fn test_pool_round_trip_does_not_grow() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, _) = pools(&driver);

        for _ in 0..1000 {
            let stream = streams.get(DeviceId(0)).unwrap();
            drop(stream);
        }
        let stats = streams.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.reused, 999);
    }

    #[test]
    fn test_pool_cap_destroys_overflow() {
        let driver = Arc::new(MockDriver::new(1));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let streams = StreamPool::new(dyn_driver, 1);

        let a = streams.get(DeviceId(0)).unwrap();
        let b = streams.get(DeviceId(0)).unwrap();
        drop(a);
        drop(b);

        assert_eq!(streams.cached(DeviceId(0)), 1);
        assert_eq!(driver.calls(DriverOp::StreamDestroy), 1);
    }

    #[test]
    fn test_pool_preallocate_and_clear() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, _) = pools(&driver);

        streams.preallocate(DeviceId(0), 5).unwrap();
        assert_eq!(streams.cached(DeviceId(0)), 5);

        let held = streams.get(DeviceId(0)).unwrap();
        assert_eq!(driver.calls(DriverOp::StreamCreate), 5);

        streams.clear();
        assert_eq!(streams.cached(DeviceId(0)), 0);
        assert_eq!(driver.calls(DriverOp::StreamDestroy), 4);

        drop(held);
        assert_eq!(streams.cached(DeviceId(0)), 1);
    }

    #[test]
    fn test_creation_failure_is_reported() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, _) = pools(&driver);

        driver.fail_next(DriverOp::StreamCreate);
        let err = streams.get(DeviceId(0)).unwrap_err();
        assert!(err.is_resource_error());
        assert_eq!(streams.stats().created, 0);
    }

    #[test]
    fn test_event_pool_skips_in_flight() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, events) = pools(&driver);
        let stream = streams.get(DeviceId(0)).unwrap();

        let busy = events.get(DeviceId(0)).unwrap();
        let busy_raw = busy.raw();
        busy.record(&stream).unwrap();
        drop(busy);
        assert_eq!(events.cached(DeviceId(0)), 1);

        // The only cached event is still in flight: a new one is created.
        let fresh = events.get(DeviceId(0)).unwrap();
        assert_ne!(fresh.raw(), busy_raw);
        // The in-flight event was put back.
        assert_eq!(events.cached(DeviceId(0)), 1);

        driver.complete_all();
        drop(fresh);
        let reused = events.get(DeviceId(0)).unwrap();
        assert!(reused.has_completed().unwrap());
        assert_eq!(driver.calls(DriverOp::EventCreate), 2);
    }

    #[test]
    fn test_event_recorded_flag_per_handout() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, events) = pools(&driver);
        let stream = streams.get(DeviceId(0)).unwrap();

        let event = events.get(DeviceId(0)).unwrap();
        let raw = event.raw();
        assert!(!event.is_recorded());
        assert!(event.has_completed().unwrap());

        event.record(&stream).unwrap();
        let clone = event.clone();
        assert!(clone.is_recorded());
        drop(event);
        drop(clone);

        driver.complete_all();
        let again = events.get(DeviceId(0)).unwrap();
        assert_eq!(again.raw(), raw);
        assert!(!again.is_recorded());
    }

    #[test]
    fn test_failed_record_leaves_event_unrecorded() {
        let driver = Arc::new(MockDriver::new(1));
        let (streams, events) = pools(&driver);
        let stream = streams.get(DeviceId(0)).unwrap();
        let event = events.get(DeviceId(0)).unwrap();

        driver.fail_next(DriverOp::EventRecord);
        assert!(event.record(&stream).is_err());
        assert!(!event.is_recorded());
    }

    #[test]
    fn test_pool_concurrent_get_release() {
        let driver = Arc::new(MockDriver::new(2));
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        let streams = Arc::new(StreamPool::new(dyn_driver, 64));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let streams = Arc::clone(&streams);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let stream = streams.get(DeviceId(i % 2)).unwrap();
                        assert_eq!(stream.device(), DeviceId(i % 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = streams.stats();
        assert!(stats.created <= 8);
        assert_eq!(stats.created as usize, stats.cached);
        assert_eq!(stats.created + stats.reused, 1600);
    }
}
