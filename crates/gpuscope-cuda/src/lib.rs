//! CUDA Backend for GpuScope
//!
//! This crate provides an NVIDIA CUDA [`Driver`](gpuscope_core::Driver)
//! using the driver API through cudarc.
//!
//! # Requirements
//!
//! - NVIDIA GPU and driver
//! - The `cuda` feature; without it [`CudaDriver::new`] fails with
//!   `BackendUnavailable`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use gpuscope_core::DeviceRuntime;
//! use gpuscope_cuda::CudaDriver;
//!
//! let runtime = DeviceRuntime::with_defaults(Arc::new(CudaDriver::new()?))?;
//! ```

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod driver;

#[cfg(feature = "cuda")]
pub use driver::CudaDriver;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use gpuscope_core::driver::Backend;

    gpuscope_core::unavailable_driver!(CudaDriver, Backend::Cuda, "CUDA");
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDriver;

/// Check if CUDA is available at runtime.
///
/// This function returns false if:
/// - CUDA feature is not enabled
/// - CUDA libraries are not installed on the system
/// - No CUDA devices are present
///
/// It safely catches panics from cudarc when CUDA is not installed.
pub fn is_cuda_available() -> bool {
    #[cfg(feature = "cuda")]
    {
        // cudarc panics if CUDA libraries are not found, so we catch that
        std::panic::catch_unwind(|| {
            cudarc::driver::result::init().is_ok()
                && cudarc::driver::result::device::get_count()
                    .map(|c| c > 0)
                    .unwrap_or(false)
        })
        .unwrap_or(false)
    }
    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}
