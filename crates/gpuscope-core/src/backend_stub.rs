//! Macro for generating unavailable driver stubs.
//!
//! When a backend feature (e.g. `cuda`) is disabled, the backend crate
//! still exposes its driver type so downstream code compiles unchanged.
//! The stub cannot be constructed: `new` fails with
//! [`ContextError::BackendUnavailable`](crate::error::ContextError::BackendUnavailable).

/// Generate a stub driver for an unavailable backend.
///
/// # Example
///
/// ```ignore
/// gpuscope_core::unavailable_driver!(CudaDriver, Backend::Cuda, "CUDA");
/// ```
#[macro_export]
macro_rules! unavailable_driver {
    ($driver:ident, $backend:expr, $name:expr) => {
        /// Stub driver when the backend feature is disabled.
        pub struct $driver {
            _private: (),
        }

        impl $driver {
            /// Create fails when the backend is not compiled in.
            pub fn new() -> $crate::error::Result<Self> {
                Err($crate::error::ContextError::BackendUnavailable(
                    concat!($name, " feature not enabled").to_string(),
                ))
            }
        }

        impl $crate::driver::Driver for $driver {
            fn backend(&self) -> $crate::driver::Backend {
                $backend
            }

            fn device_count(&self) -> $crate::error::Result<usize> {
                Ok(0)
            }

            fn set_current_device(
                &self,
                _device: $crate::driver::DeviceId,
            ) -> $crate::error::Result<()> {
                Err($crate::__unavailable!($name))
            }

            fn stream_create(
                &self,
                _device: $crate::driver::DeviceId,
            ) -> $crate::error::Result<$crate::driver::RawStream> {
                Err($crate::__unavailable!($name))
            }

            fn stream_destroy(
                &self,
                _stream: $crate::driver::RawStream,
            ) -> $crate::error::Result<()> {
                Ok(())
            }

            fn event_create(
                &self,
                _device: $crate::driver::DeviceId,
            ) -> $crate::error::Result<$crate::driver::RawEvent> {
                Err($crate::__unavailable!($name))
            }

            fn event_destroy(&self, _event: $crate::driver::RawEvent) -> $crate::error::Result<()> {
                Ok(())
            }

            fn event_record(
                &self,
                _event: $crate::driver::RawEvent,
                _stream: $crate::driver::RawStream,
            ) -> $crate::error::Result<()> {
                Err($crate::__unavailable!($name))
            }

            fn event_query(&self, _event: $crate::driver::RawEvent) -> $crate::error::Result<bool> {
                Err($crate::__unavailable!($name))
            }

            fn stream_wait_event(
                &self,
                _stream: $crate::driver::RawStream,
                _event: $crate::driver::RawEvent,
            ) -> $crate::error::Result<()> {
                Err($crate::__unavailable!($name))
            }

            fn stream_add_callback(
                &self,
                _stream: $crate::driver::RawStream,
                _callback: $crate::driver::HostCallback,
            ) -> $crate::error::Result<()> {
                Err($crate::__unavailable!($name))
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __unavailable {
    ($name:expr) => {
        $crate::error::ContextError::BackendUnavailable($name.to_string())
    };
}
