//! CUDA driver API implementation of [`Driver`].
//!
//! Streams are created non-blocking and events without timing. Each device
//! is driven through its retained primary context.
//!
//! Stream callbacks run on a driver thread that must not call back into
//! CUDA, while a fired callback typically signals a continuation that
//! enqueues more work. The driver therefore only forwards callbacks from
//! the CUDA thread to a dispatcher thread, which runs them in firing order.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use cudarc::driver::result as cuda_result;
use cudarc::driver::sys as cuda_sys;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use gpuscope_core::driver::{
    Backend, DeviceId, Driver, DriverOp, HostCallback, RawEvent, RawStream,
};
use gpuscope_core::error::{ContextError, Result};

type Dispatch = (HostCallback, Result<()>);

struct DeviceContext {
    device: cuda_sys::CUdevice,
    // CUcontext stored as an address so the driver stays Send + Sync.
    context: usize,
}

struct PendingCallback {
    callback: HostCallback,
    dispatch: Sender<Dispatch>,
}

/// [`Driver`] backed by the CUDA driver API.
pub struct CudaDriver {
    devices: Vec<DeviceContext>,
    dispatch: Mutex<Sender<Dispatch>>,
}

impl CudaDriver {
    /// Initialize CUDA and retain the primary context of every device.
    pub fn new() -> Result<Self> {
        cuda_result::init().map_err(|e| ContextError::driver(DriverOp::DeviceCount, format!("{:?}", e)))?;

        let count = cuda_result::device::get_count()
            .map_err(|e| ContextError::driver(DriverOp::DeviceCount, format!("{:?}", e)))?;

        let mut devices = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let device = cuda_result::device::get(ordinal)
                .map_err(|e| ContextError::driver(DriverOp::SetDevice, format!("{:?}", e)))?;
            // Safety: `device` was just returned by the driver.
            let context = unsafe { cuda_result::primary_ctx::retain(device) }
                .map_err(|e| ContextError::driver(DriverOp::SetDevice, format!("{:?}", e)))?;
            devices.push(DeviceContext {
                device,
                context: context as usize,
            });
        }

        let (dispatch, callbacks) = mpsc::channel();
        thread::Builder::new()
            .name("gpuscope-cuda-callbacks".to_string())
            .spawn(move || run_dispatcher(callbacks))
            .map_err(|e| ContextError::driver(DriverOp::StreamAddCallback, e))?;

        info!("Initialized CUDA driver ({} devices)", devices.len());

        Ok(Self {
            devices,
            dispatch: Mutex::new(dispatch),
        })
    }

    fn context(&self, device: DeviceId, op: DriverOp) -> Result<&DeviceContext> {
        self.devices.get(device.ordinal()).ok_or_else(|| {
            ContextError::driver(op, format!("no CUDA context for {}", device))
        })
    }

    fn make_current(&self, device: DeviceId, op: DriverOp) -> Result<()> {
        let ctx = self.context(device, op)?;
        // Safety: the context is retained for the lifetime of the driver.
        unsafe { cuda_result::ctx::set_current(ctx.context as cuda_sys::CUcontext) }
            .map_err(|e| ContextError::driver(op, format!("{:?}", e)))
    }
}

fn stream_ptr(stream: RawStream) -> cuda_sys::CUstream {
    stream.as_raw() as usize as cuda_sys::CUstream
}

fn event_ptr(event: RawEvent) -> cuda_sys::CUevent {
    event.as_raw() as usize as cuda_sys::CUevent
}

fn check(result: cuda_sys::CUresult, op: DriverOp) -> Result<()> {
    if result != cuda_sys::CUresult::CUDA_SUCCESS {
        return Err(ContextError::driver(op, format!("{:?}", result)));
    }
    Ok(())
}

fn run_dispatcher(callbacks: Receiver<Dispatch>) {
    for (callback, status) in callbacks {
        if panic::catch_unwind(AssertUnwindSafe(move || callback(status))).is_err() {
            error!("Stream callback panicked");
        }
    }
    debug!("CUDA callback dispatcher exited");
}

unsafe extern "C" fn forward_callback(
    _stream: cuda_sys::CUstream,
    status: cuda_sys::CUresult,
    user_data: *mut c_void,
) {
    // Safety: `user_data` is the box leaked by `stream_add_callback`, and
    // CUDA invokes each callback exactly once.
    let pending = unsafe { Box::from_raw(user_data as *mut PendingCallback) };
    let status = check(status, DriverOp::StreamAddCallback);
    let PendingCallback { callback, dispatch } = *pending;
    if dispatch.send((callback, status)).is_err() {
        warn!("CUDA callback dropped: dispatcher has exited");
    }
}

impl Driver for CudaDriver {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.devices.len())
    }

    fn set_current_device(&self, device: DeviceId) -> Result<()> {
        self.make_current(device, DriverOp::SetDevice)
    }

    fn stream_create(&self, device: DeviceId) -> Result<RawStream> {
        self.make_current(device, DriverOp::StreamCreate)?;
        let stream = cuda_result::stream::create(cuda_result::stream::StreamKind::NonBlocking)
            .map_err(|e| ContextError::driver(DriverOp::StreamCreate, format!("{:?}", e)))?;
        Ok(RawStream::from_raw(stream as usize as u64))
    }

    fn stream_destroy(&self, stream: RawStream) -> Result<()> {
        // Safety: the handle came from `stream_create` and is destroyed once.
        unsafe { cuda_result::stream::destroy(stream_ptr(stream)) }
            .map_err(|e| ContextError::driver(DriverOp::StreamDestroy, format!("{:?}", e)))
    }

    fn event_create(&self, device: DeviceId) -> Result<RawEvent> {
        self.make_current(device, DriverOp::EventCreate)?;
        let event = cuda_result::event::create(cuda_sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| ContextError::driver(DriverOp::EventCreate, format!("{:?}", e)))?;
        Ok(RawEvent::from_raw(event as usize as u64))
    }

    fn event_destroy(&self, event: RawEvent) -> Result<()> {
        // Safety: the handle came from `event_create` and is destroyed once.
        unsafe { cuda_result::event::destroy(event_ptr(event)) }
            .map_err(|e| ContextError::driver(DriverOp::EventDestroy, format!("{:?}", e)))
    }

    fn event_record(&self, event: RawEvent, stream: RawStream) -> Result<()> {
        // Safety: both handles are live pool resources of this driver.
        unsafe { cuda_result::event::record(event_ptr(event), stream_ptr(stream)) }
            .map_err(|e| ContextError::driver(DriverOp::EventRecord, format!("{:?}", e)))
    }

    fn event_query(&self, event: RawEvent) -> Result<bool> {
        // Safety: the handle is a live pool resource of this driver.
        match unsafe { cuda_result::event::query(event_ptr(event)) } {
            Ok(()) => Ok(true),
            Err(e) if e.0 == cuda_sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            Err(e) => Err(ContextError::driver(DriverOp::EventQuery, format!("{:?}", e))),
        }
    }

    fn stream_wait_event(&self, stream: RawStream, event: RawEvent) -> Result<()> {
        // Safety: both handles are live pool resources of this driver.
        unsafe {
            cuda_result::stream::wait_event(
                stream_ptr(stream),
                event_ptr(event),
                cuda_sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| ContextError::driver(DriverOp::StreamWaitEvent, format!("{:?}", e)))
    }

    fn stream_add_callback(&self, stream: RawStream, callback: HostCallback) -> Result<()> {
        let pending = Box::new(PendingCallback {
            callback,
            dispatch: self.dispatch.lock().clone(),
        });
        let user_data = Box::into_raw(pending) as *mut c_void;

        // Safety: `forward_callback` takes back ownership of `user_data`
        // exactly once when CUDA fires it.
        let result = unsafe {
            cuda_sys::cuStreamAddCallback(stream_ptr(stream), Some(forward_callback), user_data, 0)
        };
        if let Err(err) = check(result, DriverOp::StreamAddCallback) {
            // Safety: CUDA rejected the callback, so ownership never left us.
            drop(unsafe { Box::from_raw(user_data as *mut PendingCallback) });
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for ctx in &self.devices {
            // Safety: retained once in `new`, released once here.
            if let Err(e) = unsafe { cuda_result::primary_ctx::release(ctx.device) } {
                warn!("Failed to release CUDA primary context: {:?}", e);
            }
        }
    }
}

impl std::fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDriver")
            .field("device_count", &self.devices.len())
            .finish()
    }
}
