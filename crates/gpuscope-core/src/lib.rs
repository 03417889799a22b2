//! # GpuScope Core
//!
//! Scoped GPU execution contexts for task-based pipelines.
//!
//! A pipeline task runs in phases. Each phase opens a scoped context that
//! picks a device, binds a stream and finalizes the phase when it goes out
//! of scope. Products carry the device, stream and event that produced
//! them, so a consumer on another stream only has to make its stream wait
//! for the product's event instead of blocking the host.
//!
//! ## Core Abstractions
//!
//! - [`Driver`] - Device/stream/event operations of a backend
//! - [`DeviceRuntime`] - Driver plus per-device stream and event pools
//! - [`Product`] - Value tagged with its production provenance
//! - [`ContextState`] - Stream handed from the acquire phase to later phases
//! - [`ScopedContextAcquire`], [`ScopedContextProduce`],
//!   [`ScopedContextTask`], [`ScopedContextAnalyze`] - Phase contexts
//! - [`WaitingTaskHolder`] - Host scheduler task signalled by contexts
//!
//! ## Example
//!
//! ```ignore
//! use gpuscope_core::prelude::*;
//!
//! let runtime = DeviceRuntime::with_defaults(driver)?;
//! let ctx = ScopedContextProduce::new(&runtime, SlotId(0))?;
//! let product = ctx.wrap(vec![0.0f32; 1024]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend_stub;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod pool;
pub mod product;
pub mod runtime;
pub mod state;
pub mod sync;
pub mod task;

/// Driver doubles for tests (requires the `testing` feature outside this crate).
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ContextConfig, ContextConfigBuilder};
    pub use crate::context::{
        ScopedContextAcquire, ScopedContextAnalyze, ScopedContextProduce, ScopedContextTask,
    };
    pub use crate::driver::{
        Backend, DeviceId, Driver, DriverOp, HostCallback, RawEvent, RawStream, SlotId,
    };
    pub use crate::error::*;
    pub use crate::pool::{EventPool, PoolStats, SharedEvent, SharedStream, StreamPool};
    pub use crate::product::{
        Product, ProductBase, ProductKey, ProductLookup, ProductSink, ProductStore,
    };
    pub use crate::runtime::DeviceRuntime;
    pub use crate::state::ContextState;
    pub use crate::sync::synchronize_streams;
    pub use crate::task::{WaitingTask, WaitingTaskHolder};
}

// Re-exports for convenience
pub use config::{ContextConfig, ContextConfigBuilder};
pub use context::{ScopedContextAcquire, ScopedContextAnalyze, ScopedContextProduce, ScopedContextTask};
pub use driver::{Backend, DeviceId, Driver, DriverOp, HostCallback, RawEvent, RawStream, SlotId};
pub use error::{ContextError, Result};
pub use pool::{EventPool, PoolStats, SharedEvent, SharedStream, StreamPool};
pub use product::{Product, ProductBase, ProductKey, ProductLookup, ProductSink, ProductStore};
pub use runtime::DeviceRuntime;
pub use state::ContextState;
pub use task::{WaitingTask, WaitingTaskHolder};
