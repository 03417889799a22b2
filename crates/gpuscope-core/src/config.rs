//! Runtime configuration.

/// Configuration for a [`DeviceRuntime`](crate::DeviceRuntime) and its pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum number of idle streams cached per device.
    pub max_cached_streams: usize,
    /// Maximum number of idle events cached per device.
    pub max_cached_events: usize,
    /// Streams created per device when the runtime starts.
    pub preallocate_streams: usize,
    /// Events created per device when the runtime starts.
    pub preallocate_events: usize,
    /// Upper bound on the number of devices used (`None` = all).
    pub device_limit: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_cached_streams: 64,
            max_cached_events: 256,
            preallocate_streams: 0,
            preallocate_events: 0,
            device_limit: None,
        }
    }
}

impl ContextConfig {
    /// Creates a minimal configuration (single device, small caches).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_cached_streams: 4,
            max_cached_events: 16,
            preallocate_streams: 0,
            preallocate_events: 0,
            device_limit: Some(1),
        }
    }

    /// Creates a configuration for many concurrent task slots.
    ///
    /// Warms the caches so the first tasks do not pay for creation.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self {
            max_cached_streams: 256,
            max_cached_events: 1024,
            preallocate_streams: 8,
            preallocate_events: 32,
            device_limit: None,
        }
    }
}

/// Builder for ContextConfig.
#[derive(Debug, Default)]
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a minimal configuration builder.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: ContextConfig::minimal(),
        }
    }

    /// Creates a high-throughput configuration builder.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self {
            config: ContextConfig::high_throughput(),
        }
    }

    /// Sets the per-device idle stream cap.
    #[must_use]
    pub fn with_max_cached_streams(mut self, count: usize) -> Self {
        self.config.max_cached_streams = count;
        self
    }

    /// Sets the per-device idle event cap.
    #[must_use]
    pub fn with_max_cached_events(mut self, count: usize) -> Self {
        self.config.max_cached_events = count;
        self
    }

    /// Sets the number of streams created per device at startup.
    #[must_use]
    pub fn with_preallocated_streams(mut self, count: usize) -> Self {
        self.config.preallocate_streams = count;
        self
    }

    /// Sets the number of events created per device at startup.
    #[must_use]
    pub fn with_preallocated_events(mut self, count: usize) -> Self {
        self.config.preallocate_events = count;
        self
    }

    /// Limits the number of devices used.
    #[must_use]
    pub fn with_device_limit(mut self, limit: usize) -> Self {
        self.config.device_limit = Some(limit);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ContextConfig {
        self.config
    }
}
