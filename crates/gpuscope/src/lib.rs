//! # GpuScope
//!
//! Scoped GPU stream contexts for task-based pipelines.
//!
//! GpuScope ties GPU streams and events to the phases of a pipeline task
//! and orders producer and consumer work across streams without blocking
//! host threads.
//!
//! ## Features
//!
//! - **Stream and event pools** per device, returned on last drop
//! - **Products** tagged with the device, stream and event that made them
//! - **Cross-stream synchronization** by stream waits, never host waits
//! - **Continuations** that run once enqueued GPU work has completed
//! - **Multiple backends**: CUDA, or a simulated CPU driver
//!
//! ## Quick Start
//!
//! ```ignore
//! use gpuscope::prelude::*;
//!
//! fn main() -> Result<()> {
//!     // Create runtime with auto-detected backend
//!     let runtime = GpuScope::builder().backend(Backend::Auto).build()?;
//!
//!     let state = ContextState::new();
//!     {
//!         let mut ctx = ScopedContextAcquire::with_state(
//!             &runtime,
//!             SlotId(0),
//!             WaitingTaskHolder::noop(),
//!             &state,
//!         )?;
//!         // ... enqueue work on ctx.stream() ...
//!         ctx.push_next_task(|task| {
//!             // runs after the work above
//!         })?;
//!     }
//!
//!     let ctx = ScopedContextProduce::from_state(&runtime, &state)?;
//!     let product = ctx.wrap(vec![0u32; 16]);
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - **CPU** (`Backend::Cpu`): simulated devices, always available
//! - **CUDA** (`Backend::Cuda`): requires the `cuda` feature

#![warn(missing_docs)]

use std::sync::Arc;

pub use gpuscope_core::*;
pub use gpuscope_cpu::SimDriver;
pub use gpuscope_cuda::CudaDriver;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{availability, GpuScope, GpuScopeBuilder};
    pub use gpuscope_core::prelude::*;
    pub use gpuscope_cpu::SimDriver;
    pub use gpuscope_cuda::CudaDriver;
}

/// Number of devices the simulated driver exposes unless configured.
pub const DEFAULT_SIM_DEVICES: usize = 1;

/// Entry point for building a [`DeviceRuntime`].
pub struct GpuScope;

impl GpuScope {
    /// Create a new builder.
    pub fn builder() -> GpuScopeBuilder {
        GpuScopeBuilder::new()
    }

    /// Create a runtime on the best available backend with default settings.
    pub fn new() -> Result<Arc<DeviceRuntime>> {
        Self::builder().build()
    }

    /// Create a runtime on a specific backend.
    pub fn with_backend(backend: Backend) -> Result<Arc<DeviceRuntime>> {
        Self::builder().backend(backend).build()
    }
}

/// Builder for a [`DeviceRuntime`].
#[derive(Debug, Clone)]
pub struct GpuScopeBuilder {
    backend: Backend,
    config: ContextConfig,
    sim_devices: usize,
}

impl GpuScopeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: Backend::Auto,
            config: ContextConfig::default(),
            sim_devices: DEFAULT_SIM_DEVICES,
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the pool configuration.
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of devices the CPU backend simulates.
    pub fn sim_devices(mut self, count: usize) -> Self {
        self.sim_devices = count;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<Arc<DeviceRuntime>> {
        let driver: Arc<dyn Driver> = match self.backend {
            Backend::Auto => self.auto_driver()?,
            Backend::Cpu => Arc::new(SimDriver::new(self.sim_devices)),
            #[cfg(feature = "cuda")]
            Backend::Cuda => Arc::new(CudaDriver::new()?),
            #[cfg(not(feature = "cuda"))]
            Backend::Cuda => {
                return Err(ContextError::BackendUnavailable(
                    "CUDA feature not enabled".to_string(),
                ))
            }
        };

        DeviceRuntime::new(driver, self.config)
    }

    /// Auto-select the best available backend.
    fn auto_driver(&self) -> Result<Arc<dyn Driver>> {
        // Try CUDA first
        #[cfg(feature = "cuda")]
        if gpuscope_cuda::is_cuda_available() {
            tracing::info!("Auto-selected CUDA backend");
            return Ok(Arc::new(CudaDriver::new()?));
        }

        // Fall back to CPU
        tracing::info!("Auto-selected CPU backend (no GPU available)");
        Ok(Arc::new(SimDriver::new(self.sim_devices)))
    }
}

impl Default for GpuScopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check availability of backends at runtime.
pub mod availability {
    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        gpuscope_cuda::is_cuda_available()
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<super::Backend> {
        let mut backends = vec![super::Backend::Cpu];

        if cuda() {
            backends.push(super::Backend::Cuda);
        }

        backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_creation() {
        let runtime = GpuScope::new().unwrap();
        // Auto selects CUDA when present, the simulated driver otherwise.
        let backend = runtime.backend();
        assert!(
            backend == Backend::Cuda || backend == Backend::Cpu,
            "Expected Cuda or Cpu backend, got {:?}",
            backend
        );
    }

    #[test]
    fn test_builder() {
        let runtime = GpuScope::builder()
            .backend(Backend::Cpu)
            .sim_devices(3)
            .config(ContextConfig::minimal())
            .build()
            .unwrap();

        assert_eq!(runtime.backend(), Backend::Cpu);
        // minimal() limits the runtime to one device.
        assert_eq!(runtime.device_count(), 1);
    }

    #[test]
    fn test_no_simulated_devices() {
        let err = GpuScope::builder()
            .backend(Backend::Cpu)
            .sim_devices(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ContextError::NoDevices);
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_cuda_unavailable() {
        let err = GpuScope::with_backend(Backend::Cuda).unwrap_err();
        assert!(matches!(err, ContextError::BackendUnavailable(_)));
    }

    #[test]
    fn test_availability() {
        // CPU should always be available
        let backends = availability::available_backends();
        assert!(backends.contains(&Backend::Cpu));
    }
}
