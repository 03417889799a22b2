//! Device runtime: the driver plus its stream and event pools.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::ContextConfig;
use crate::driver::{Backend, DeviceId, Driver, SlotId};
use crate::error::{ContextError, Result};
use crate::pool::{EventPool, StreamPool};

/// Process-wide state shared by every scoped context.
///
/// Built once at startup and shared as `Arc<DeviceRuntime>`. Outstanding
/// stream and event handles keep their pools alive, so no teardown order
/// has to be observed at shutdown.
pub struct DeviceRuntime {
    driver: Arc<dyn Driver>,
    device_count: usize,
    streams: StreamPool,
    events: EventPool,
    config: ContextConfig,
}

impl DeviceRuntime {
    /// Creates a runtime on top of `driver`.
    pub fn new(driver: Arc<dyn Driver>, config: ContextConfig) -> Result<Arc<Self>> {
        let mut device_count = driver.device_count()?;
        if let Some(limit) = config.device_limit {
            device_count = device_count.min(limit);
        }
        if device_count == 0 {
            return Err(ContextError::NoDevices);
        }

        let streams = StreamPool::new(Arc::clone(&driver), config.max_cached_streams);
        let events = EventPool::new(Arc::clone(&driver), config.max_cached_events);

        for ordinal in 0..device_count {
            let device = DeviceId(ordinal);
            if config.preallocate_streams > 0 || config.preallocate_events > 0 {
                driver.set_current_device(device)?;
            }
            streams.preallocate(device, config.preallocate_streams)?;
            events.preallocate(device, config.preallocate_events)?;
        }

        info!(
            backend = %driver.backend(),
            device_count,
            preallocated_streams = config.preallocate_streams,
            preallocated_events = config.preallocate_events,
            "Created device runtime"
        );

        Ok(Arc::new(Self {
            driver,
            device_count,
            streams,
            events,
            config,
        }))
    }

    /// Creates a runtime with default configuration.
    pub fn with_defaults(driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        Self::new(driver, ContextConfig::default())
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Returns the driver backend kind.
    pub fn backend(&self) -> Backend {
        self.driver.backend()
    }

    /// Number of devices in use.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Returns the stream pool.
    pub fn stream_pool(&self) -> &StreamPool {
        &self.streams
    }

    /// Returns the event pool.
    pub fn event_pool(&self) -> &EventPool {
        &self.events
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Default device of a task slot.
    pub fn device_for_slot(&self, slot: SlotId) -> DeviceId {
        slot.device(self.device_count)
    }

    /// Fails with [`ContextError::InvalidDevice`] if `device` is not in use.
    pub fn check_device(&self, device: DeviceId) -> Result<()> {
        if device.ordinal() >= self.device_count {
            return Err(ContextError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    /// Destroys every idle stream and event.
    pub fn clear_caches(&self) {
        self.streams.clear();
        self.events.clear();
    }
}

impl fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("backend", &self.backend())
            .field("device_count", &self.device_count)
            .field("streams", &self.streams.stats())
            .field("events", &self.events.stats())
            .finish()
    }
}
