//! Simulated streams and events.
//!
//! Every stream is a worker thread draining an in-order operation queue.
//! Events carry two generation counters: `recorded` is bumped when a record
//! is enqueued, `completed` when a worker reaches it. An event is complete
//! once `completed` has caught up with `recorded`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use gpuscope_core::driver::{DeviceId, DriverOp, HostCallback, RawStream};
use gpuscope_core::error::{ContextError, Result};

/// Host closure standing in for a kernel.
pub(crate) type Kernel = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Generations {
    recorded: u64,
    completed: u64,
}

/// Simulated event.
#[derive(Debug)]
pub(crate) struct SimEvent {
    pub(crate) device: DeviceId,
    generations: Mutex<Generations>,
    reached: Condvar,
}

impl SimEvent {
    pub(crate) fn new(device: DeviceId) -> Self {
        Self {
            device,
            generations: Mutex::new(Generations::default()),
            reached: Condvar::new(),
        }
    }

    /// Starts a new record and returns its generation.
    pub(crate) fn begin_record(&self) -> u64 {
        let mut generations = self.generations.lock();
        generations.recorded += 1;
        generations.recorded
    }

    /// Generation a wait issued now has to reach.
    pub(crate) fn last_recorded(&self) -> u64 {
        self.generations.lock().recorded
    }

    pub(crate) fn is_complete(&self) -> bool {
        let generations = self.generations.lock();
        generations.completed >= generations.recorded
    }

    fn complete(&self, generation: u64) {
        let mut generations = self.generations.lock();
        generations.completed = generations.completed.max(generation);
        self.reached.notify_all();
    }

    fn wait_for(&self, generation: u64) {
        let mut generations = self.generations.lock();
        while generations.completed < generation {
            self.reached.wait(&mut generations);
        }
    }
}

pub(crate) enum StreamOp {
    Launch(Kernel),
    Record(Arc<SimEvent>, u64),
    Wait(Arc<SimEvent>, u64),
    Callback(HostCallback),
    Drain(Sender<()>),
}

/// Simulated stream: the sending half of a worker queue.
///
/// Dropping it closes the queue; the worker finishes the queued operations
/// and exits on its own.
pub(crate) struct SimStream {
    pub(crate) device: DeviceId,
    queue: Sender<StreamOp>,
}

impl SimStream {
    pub(crate) fn spawn(device: DeviceId, raw: RawStream) -> Result<Self> {
        let (queue, ops) = mpsc::channel();
        thread::Builder::new()
            .name(format!("gpuscope-sim-{}-{}", device.ordinal(), raw.as_raw()))
            .spawn(move || run_worker(raw, ops))
            .map_err(|e| ContextError::driver(DriverOp::StreamCreate, e))?;
        Ok(Self { device, queue })
    }

    pub(crate) fn submit(&self, op: StreamOp, kind: DriverOp) -> Result<()> {
        self.queue
            .send(op)
            .map_err(|_| ContextError::driver(kind, "stream worker exited"))
    }
}

fn run_worker(raw: RawStream, ops: Receiver<StreamOp>) {
    let mut fault: Option<ContextError> = None;

    for op in ops {
        match op {
            StreamOp::Launch(kernel) => {
                if fault.is_some() {
                    continue;
                }
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(kernel)) {
                    let message = panic_message(payload.as_ref());
                    error!(stream = raw.as_raw(), %message, "Simulated kernel panicked");
                    fault = Some(ContextError::driver(
                        DriverOp::StreamAddCallback,
                        format!("stream faulted: kernel panicked: {}", message),
                    ));
                }
            }
            StreamOp::Record(event, generation) => event.complete(generation),
            StreamOp::Wait(event, generation) => event.wait_for(generation),
            StreamOp::Callback(callback) => {
                let status = match &fault {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
                if panic::catch_unwind(AssertUnwindSafe(move || callback(status))).is_err() {
                    error!(stream = raw.as_raw(), "Stream callback panicked");
                }
            }
            StreamOp::Drain(done) => {
                let _ = done.send(());
            }
        }
    }

    trace!(stream = raw.as_raw(), "Simulated stream worker exited");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
