//! CPU Backend for GpuScope
//!
//! This crate provides a simulated driver that runs every stream as a host
//! worker thread. It's useful for:
//! - Testing pipelines without a GPU
//! - Development on machines without a GPU
//! - Falling back when no GPU driver is installed
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use gpuscope_core::prelude::*;
//! use gpuscope_cpu::SimDriver;
//!
//! let runtime = DeviceRuntime::with_defaults(Arc::new(SimDriver::new(2))).unwrap();
//! assert_eq!(runtime.device_count(), 2);
//! ```

#![warn(missing_docs)]

mod driver;
mod stream;

pub use driver::SimDriver;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::SimDriver;
}
