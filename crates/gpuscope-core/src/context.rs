//! Scoped contexts bound to the phases of a task.
//!
//! Each context selects a device, binds a stream and, when it goes out of
//! scope, performs the finalization of its phase:
//!
//! | context | stream | on drop |
//! |---|---|---|
//! | [`ScopedContextAcquire`] | pool or reused from a product | fill the [`ContextState`], enqueue a callback signalling the holder |
//! | [`ScopedContextProduce`] | pool, product or moved out of a state | record the completion event |
//! | [`ScopedContextTask`] | borrowed from the pushing context | enqueue a callback signalling the holder |
//! | [`ScopedContextAnalyze`] | pool or reused from a product | nothing |
//!
//! Constructors set the current device and never set it back: every call
//! site that relies on the current device sets it itself.
//!
//! A continuation that panics does not signal success: the panic is caught
//! and its waiting task is signalled with [`ContextError::TaskPanicked`].
//!
//! # Example
//!
//! ```ignore
//! let state = ContextState::new();
//!
//! // acquire phase
//! {
//!     let mut ctx = ScopedContextAcquire::with_state(&runtime, slot, holder, &state)?;
//!     let input = ctx.get(&product)?;
//!     // ... enqueue work on ctx.stream() ...
//!     ctx.push_next_task(|task| {
//!         // runs once the work above has completed
//!     })?;
//! }
//!
//! // produce phase, same stream
//! let ctx = ScopedContextProduce::from_state(&runtime, &state)?;
//! store.put(&key, ctx.wrap(output))?;
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::driver::{DeviceId, SlotId};
use crate::error::{ContextError, Result};
use crate::pool::{SharedEvent, SharedStream};
use crate::product::{Product, ProductBase, ProductKey, ProductLookup, ProductSink};
use crate::runtime::DeviceRuntime;
use crate::state::ContextState;
use crate::sync::synchronize_streams;
use crate::task::WaitingTaskHolder;

struct ScopedContextBase {
    runtime: Arc<DeviceRuntime>,
    device: DeviceId,
    stream: SharedStream,
}

impl ScopedContextBase {
    fn from_slot(runtime: &Arc<DeviceRuntime>, slot: SlotId) -> Result<Self> {
        let device = runtime.device_for_slot(slot);
        runtime.driver().set_current_device(device)?;
        let stream = runtime.stream_pool().get(device)?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            device,
            stream,
        })
    }

    fn from_product(runtime: &Arc<DeviceRuntime>, data: &ProductBase) -> Result<Self> {
        let device = data.device();
        runtime.check_device(device)?;
        runtime.driver().set_current_device(device)?;
        let stream = if data.may_reuse_stream() {
            trace!(%device, "Reusing the stream of the product");
            data.stream().clone()
        } else {
            runtime.stream_pool().get(device)?
        };
        Ok(Self {
            runtime: Arc::clone(runtime),
            device,
            stream,
        })
    }

    fn from_parts(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        stream: SharedStream,
    ) -> Result<Self> {
        runtime.check_device(device)?;
        runtime.driver().set_current_device(device)?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            device,
            stream,
        })
    }

    fn get<'d, T>(&self, data: &'d Product<T>) -> Result<&'d T> {
        let available = data.is_available()?;
        synchronize_streams(
            &self.stream,
            data.device(),
            data.stream(),
            available,
            data.event(),
        )?;
        Ok(data.data())
    }

    fn get_by_key<'d, T, L>(&self, lookup: &'d L, key: &ProductKey<T>) -> Result<&'d T>
    where
        T: Send + Sync + 'static,
        L: ProductLookup,
    {
        self.get(lookup.product(key)?)
    }
}

/// Holds the waiting task a context signals and threads continuations
/// through it.
struct HolderHelper {
    runtime: Arc<DeviceRuntime>,
    holder: Option<WaitingTaskHolder>,
}

impl HolderHelper {
    fn new(runtime: &Arc<DeviceRuntime>, holder: WaitingTaskHolder) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            holder: Some(holder),
        }
    }

    /// The task runs on a snapshot of `base`, taken now, so it does not
    /// depend on the state still holding the stream when it fires.
    fn push_next_task<F>(&mut self, f: F, base: &ScopedContextBase)
    where
        F: FnOnce(ScopedContextTask) + Send + 'static,
    {
        let Some(previous) = self.holder.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let device = base.device;
        let stream = base.stream.clone();

        debug!(%device, "Pushing continuation task");
        self.holder = Some(WaitingTaskHolder::from_fn(move |error| {
            if let Some(err) = error {
                previous.done_waiting(Some(err));
                return;
            }
            let task = match ScopedContextTask::new(&runtime, device, stream, previous) {
                Ok(task) => task,
                Err(err) => {
                    error!(%err, "Failed to create continuation context");
                    return;
                }
            };
            let unwound = Arc::clone(&task.unwound);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || f(task))) {
                let err = ContextError::task_panicked(device, payload.as_ref());
                error!(%device, %err, "Continuation task panicked");
                if let Some(holder) = unwound.lock().take() {
                    holder.done_waiting(Some(err));
                }
            }
        }));
    }

    fn replace(&mut self, holder: WaitingTaskHolder) {
        self.holder = Some(holder);
    }

    fn take(&mut self) -> Option<WaitingTaskHolder> {
        self.holder.take()
    }

    /// Enqueues a callback on `stream` that signals the holder once all
    /// work queued so far has completed.
    ///
    /// If the enqueue fails the holder is signalled with the error right
    /// away, so no continuation is left hanging.
    fn enqueue_callback(&mut self, stream: &SharedStream) -> Result<()> {
        let Some(holder) = self.holder.take() else {
            return Ok(());
        };

        let slot = Arc::new(Mutex::new(Some(holder)));
        let pending = Arc::clone(&slot);
        let device = stream.device();
        let result = stream.add_callback(Box::new(move |status| {
            let holder = pending.lock().take();
            if let Some(holder) = holder {
                trace!(%device, "Stream callback fired");
                holder.done_waiting(status.err());
            }
        }));

        if let Err(err) = &result {
            let holder = slot.lock().take();
            if let Some(holder) = holder {
                holder.done_waiting(Some(err.clone()));
            }
        }
        result
    }
}

/// Context of the acquire phase of a task.
///
/// Reads inputs, enqueues asynchronous work and, when dropped, makes the
/// waiting task run once that work has completed. With a [`ContextState`]
/// it can also push continuation tasks and hand its stream to the later
/// phases.
pub struct ScopedContextAcquire {
    base: ScopedContextBase,
    holder: HolderHelper,
    state: Option<ContextState>,
    finished: bool,
}

impl ScopedContextAcquire {
    /// Creates a context on a new stream of the slot's default device.
    ///
    /// If creation fails the holder is signalled with the error.
    pub fn new(
        runtime: &Arc<DeviceRuntime>,
        slot: SlotId,
        holder: WaitingTaskHolder,
    ) -> Result<Self> {
        Self::build(runtime, ScopedContextBase::from_slot(runtime, slot), holder, None)
    }

    /// Like [`new`](Self::new), keeping the stream in `state` for later phases.
    pub fn with_state(
        runtime: &Arc<DeviceRuntime>,
        slot: SlotId,
        holder: WaitingTaskHolder,
        state: &ContextState,
    ) -> Result<Self> {
        if state.is_valid() {
            holder.done_waiting(Some(ContextError::ContextStateAlreadySet));
            return Err(ContextError::ContextStateAlreadySet);
        }
        Self::build(
            runtime,
            ScopedContextBase::from_slot(runtime, slot),
            holder,
            Some(state.clone()),
        )
    }

    /// Creates a context on the device of `data`, reusing its stream if no
    /// other consumer has taken it yet.
    pub fn from_product(
        runtime: &Arc<DeviceRuntime>,
        data: &ProductBase,
        holder: WaitingTaskHolder,
    ) -> Result<Self> {
        Self::build(runtime, ScopedContextBase::from_product(runtime, data), holder, None)
    }

    /// Like [`from_product`](Self::from_product), keeping the stream in `state`.
    pub fn from_product_with_state(
        runtime: &Arc<DeviceRuntime>,
        data: &ProductBase,
        holder: WaitingTaskHolder,
        state: &ContextState,
    ) -> Result<Self> {
        if state.is_valid() {
            holder.done_waiting(Some(ContextError::ContextStateAlreadySet));
            return Err(ContextError::ContextStateAlreadySet);
        }
        Self::build(
            runtime,
            ScopedContextBase::from_product(runtime, data),
            holder,
            Some(state.clone()),
        )
    }

    fn build(
        runtime: &Arc<DeviceRuntime>,
        base: Result<ScopedContextBase>,
        holder: WaitingTaskHolder,
        state: Option<ContextState>,
    ) -> Result<Self> {
        match base {
            Ok(base) => Ok(Self {
                base,
                holder: HolderHelper::new(runtime, holder),
                state,
                finished: false,
            }),
            Err(err) => {
                holder.done_waiting(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Current device.
    pub fn device(&self) -> DeviceId {
        self.base.device
    }

    /// Stream of this context.
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Returns the value of `data`, ordering this stream after its
    /// production first if needed.
    pub fn get<'d, T>(&self, data: &'d Product<T>) -> Result<&'d T> {
        self.base.get(data)
    }

    /// Looks up a product by key and returns its value like [`get`](Self::get).
    pub fn get_by_key<'d, T, L>(&self, lookup: &'d L, key: &ProductKey<T>) -> Result<&'d T>
    where
        T: Send + Sync + 'static,
        L: ProductLookup,
    {
        self.base.get_by_key(lookup, key)
    }

    /// Runs `f` in a [`ScopedContextTask`] once the work enqueued on this
    /// stream has completed.
    ///
    /// Requires the context to have been created with a [`ContextState`].
    pub fn push_next_task<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(ScopedContextTask) + Send + 'static,
    {
        if self.state.is_none() {
            return Err(ContextError::NoContextState);
        }
        self.holder.push_next_task(f, &self.base);
        Ok(())
    }

    /// Replaces the waiting task signalled by this context.
    pub fn replace_waiting_task_holder(&mut self, holder: WaitingTaskHolder) {
        self.holder.replace(holder);
    }

    /// Finalizes the phase and reports errors instead of logging them.
    pub fn finish(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // The state must be filled before the callback can fire.
        let stored = match &self.state {
            Some(state) => state.set(self.base.device, self.base.stream.clone()),
            None => Ok(()),
        };
        let enqueued = self.holder.enqueue_callback(&self.base.stream);
        stored.and(enqueued)
    }
}

impl Drop for ScopedContextAcquire {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            error!(device = %self.base.device, %err, "Failed to finalize acquire context");
        }
    }
}

/// Context of the produce phase of a task.
///
/// Products created through it carry its completion event, which is
/// recorded on the stream when the context is dropped. All asynchronous
/// work of the phase must be enqueued before that.
pub struct ScopedContextProduce {
    base: ScopedContextBase,
    event: SharedEvent,
    recorded: bool,
}

impl ScopedContextProduce {
    /// Creates a context on a new stream of the slot's default device.
    pub fn new(runtime: &Arc<DeviceRuntime>, slot: SlotId) -> Result<Self> {
        Self::build(ScopedContextBase::from_slot(runtime, slot)?)
    }

    /// Creates a context on the device of `data`, reusing its stream if no
    /// other consumer has taken it yet.
    pub fn from_product(runtime: &Arc<DeviceRuntime>, data: &ProductBase) -> Result<Self> {
        Self::build(ScopedContextBase::from_product(runtime, data)?)
    }

    /// Creates a context on the stream of the acquire phase, moving it out
    /// of `state`.
    pub fn from_state(runtime: &Arc<DeviceRuntime>, state: &ContextState) -> Result<Self> {
        let (device, stream) = state.release_stream()?;
        Self::build(ScopedContextBase::from_parts(runtime, device, stream)?)
    }

    /// Creates a context from explicit parts.
    #[cfg(any(test, feature = "testing"))]
    pub fn from_parts(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        stream: SharedStream,
        event: SharedEvent,
    ) -> Result<Self> {
        Ok(Self {
            base: ScopedContextBase::from_parts(runtime, device, stream)?,
            event,
            recorded: false,
        })
    }

    fn build(base: ScopedContextBase) -> Result<Self> {
        // Allocated up front so a failure surfaces before any work is queued.
        let event = base.runtime.event_pool().get(base.device)?;
        Ok(Self {
            base,
            event,
            recorded: false,
        })
    }

    /// Current device.
    pub fn device(&self) -> DeviceId {
        self.base.device
    }

    /// Stream of this context.
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Completion event stamped on every product of this context.
    pub fn event(&self) -> &SharedEvent {
        &self.event
    }

    /// Returns the value of `data`, ordering this stream after its
    /// production first if needed.
    pub fn get<'d, T>(&self, data: &'d Product<T>) -> Result<&'d T> {
        self.base.get(data)
    }

    /// Looks up a product by key and returns its value like [`get`](Self::get).
    pub fn get_by_key<'d, T, L>(&self, lookup: &'d L, key: &ProductKey<T>) -> Result<&'d T>
    where
        T: Send + Sync + 'static,
        L: ProductLookup,
    {
        self.base.get_by_key(lookup, key)
    }

    /// Wraps `data` into a product of this context.
    pub fn wrap<T>(&self, data: T) -> Product<T> {
        self.stamp(data, false)
    }

    /// Wraps `data` whose work has already completed as seen from the host,
    /// e.g. after a synchronous copy. Consumers never wait for it.
    pub fn wrap_available<T>(&self, data: T) -> Product<T> {
        self.stamp(data, true)
    }

    fn stamp<T>(&self, data: T, available: bool) -> Product<T> {
        Product::new(
            ProductBase::new(
                self.base.device,
                self.base.stream.clone(),
                Some(self.event.clone()),
                available,
            ),
            data,
        )
    }

    /// Wraps `data` and stores it in `sink` under `key`.
    pub fn emplace<T, S>(&self, sink: &mut S, key: &ProductKey<T>, data: T) -> Result<()>
    where
        T: Send + Sync + 'static,
        S: ProductSink,
    {
        sink.put(key, self.wrap(data))
    }

    /// Records the completion event and reports a failure instead of
    /// logging it.
    pub fn finish(mut self) -> Result<()> {
        self.record()
    }

    fn record(&mut self) -> Result<()> {
        if self.recorded {
            return Ok(());
        }
        self.recorded = true;
        self.event.record(&self.base.stream)
    }
}

impl Drop for ScopedContextProduce {
    fn drop(&mut self) {
        if let Err(err) = self.record() {
            error!(device = %self.base.device, %err, "Failed to record completion event");
        }
    }
}

/// Context of a continuation task pushed from an acquire phase.
///
/// Runs on the thread that signalled the waiting task, after the stream
/// work queued before the push has completed. It borrows the stream the
/// acquire phase handed to its [`ContextState`] and signals its waiting
/// task when dropped, once the work it enqueued has completed as well.
pub struct ScopedContextTask {
    base: ScopedContextBase,
    holder: HolderHelper,
    finished: bool,
    // Receives the holder when the task is dropped by a panic.
    unwound: Arc<Mutex<Option<WaitingTaskHolder>>>,
}

impl ScopedContextTask {
    pub(crate) fn new(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        stream: SharedStream,
        holder: WaitingTaskHolder,
    ) -> Result<Self> {
        match ScopedContextBase::from_parts(runtime, device, stream) {
            Ok(base) => Ok(Self {
                base,
                holder: HolderHelper::new(runtime, holder),
                finished: false,
                unwound: Arc::new(Mutex::new(None)),
            }),
            Err(err) => {
                holder.done_waiting(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Current device.
    pub fn device(&self) -> DeviceId {
        self.base.device
    }

    /// Stream of this context.
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Runs `f` in another task context once the work enqueued on this
    /// stream has completed.
    pub fn push_next_task<F>(&mut self, f: F)
    where
        F: FnOnce(ScopedContextTask) + Send + 'static,
    {
        self.holder.push_next_task(f, &self.base);
    }

    /// Replaces the waiting task signalled by this context.
    pub fn replace_waiting_task_holder(&mut self, holder: WaitingTaskHolder) {
        self.holder.replace(holder);
    }

    /// Finalizes the task and reports errors instead of logging them.
    pub fn finish(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.holder.enqueue_callback(&self.base.stream)
    }
}

impl Drop for ScopedContextTask {
    fn drop(&mut self) {
        if thread::panicking() {
            // Signalled with the panic by the continuation wrapper.
            self.finished = true;
            *self.unwound.lock() = self.holder.take();
            return;
        }
        if let Err(err) = self.finalize() {
            error!(device = %self.base.device, %err, "Failed to finalize continuation context");
        }
    }
}

/// Read-only context for consuming products.
pub struct ScopedContextAnalyze {
    base: ScopedContextBase,
}

impl ScopedContextAnalyze {
    /// Creates a context on the device of `data`, reusing its stream if no
    /// other consumer has taken it yet.
    pub fn from_product(runtime: &Arc<DeviceRuntime>, data: &ProductBase) -> Result<Self> {
        Ok(Self {
            base: ScopedContextBase::from_product(runtime, data)?,
        })
    }

    /// Current device.
    pub fn device(&self) -> DeviceId {
        self.base.device
    }

    /// Stream of this context.
    pub fn stream(&self) -> &SharedStream {
        &self.base.stream
    }

    /// Returns the value of `data`, ordering this stream after its
    /// production first if needed.
    pub fn get<'d, T>(&self, data: &'d Product<T>) -> Result<&'d T> {
        self.base.get(data)
    }

    /// Looks up a product by key and returns its value like [`get`](Self::get).
    pub fn get_by_key<'d, T, L>(&self, lookup: &'d L, key: &ProductKey<T>) -> Result<&'d T>
    where
        T: Send + Sync + 'static,
        L: ProductLookup,
    {
        self.base.get_by_key(lookup, key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::driver::DriverOp;
    use crate::product::ProductStore;
    use crate::testing::MockDriver;

    fn runtime(devices: usize) -> (Arc<MockDriver>, Arc<DeviceRuntime>) {
        let driver = Arc::new(MockDriver::new(devices));
        let runtime = DeviceRuntime::with_defaults(driver.clone()).unwrap();
        (driver, runtime)
    }

    fn counting_holder() -> (WaitingTaskHolder, Arc<Mutex<Vec<Option<ContextError>>>>) {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        let holder = WaitingTaskHolder::from_fn(move |error| sink.lock().push(error));
        (holder, signals)
    }

    #[test]
    fn test_acquire_sets_device_and_signals_after_callback() {
        let (driver, runtime) = runtime(2);
        let (holder, signals) = counting_holder();

        let ctx = ScopedContextAcquire::new(&runtime, SlotId(1), holder).unwrap();
        assert_eq!(ctx.device(), DeviceId(1));
        assert_eq!(driver.current_device(), Some(DeviceId(1)));
        drop(ctx);

        assert!(signals.lock().is_empty());
        assert_eq!(driver.pending_callbacks(), 1);
        assert_eq!(driver.run_callbacks(), 1);
        assert_eq!(*signals.lock(), vec![None]);
        // Current device is not restored.
        assert_eq!(driver.current_device(), Some(DeviceId(1)));
    }

    #[test]
    fn test_push_without_state_is_usage_error() {
        let (_driver, runtime) = runtime(1);
        let mut ctx =
            ScopedContextAcquire::new(&runtime, SlotId(0), WaitingTaskHolder::noop()).unwrap();
        let err = ctx.push_next_task(|_task| {}).unwrap_err();
        assert_eq!(err, ContextError::NoContextState);
    }

    #[test]
    fn test_acquire_fills_state_and_continuation_runs() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();
        let (holder, signals) = counting_holder();
        let ran = Arc::new(AtomicUsize::new(0));

        let stream = {
            let mut ctx =
                ScopedContextAcquire::with_state(&runtime, SlotId(0), holder, &state).unwrap();
            let ran = Arc::clone(&ran);
            ctx.push_next_task(move |task| {
                assert_eq!(task.device(), DeviceId(0));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            ctx.stream().clone()
        };

        assert!(state.is_valid());
        assert!(state.stream().unwrap().same_queue(&stream));

        // acquire callback -> continuation -> task callback -> original holder
        assert_eq!(driver.run_callbacks(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(*signals.lock(), vec![None]);

        let produce = ScopedContextProduce::from_state(&runtime, &state).unwrap();
        assert!(produce.stream().same_queue(&stream));
        assert!(!state.is_valid());
    }

    #[test]
    fn test_nested_continuations() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();
        let (holder, signals) = counting_holder();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let mut ctx =
                ScopedContextAcquire::with_state(&runtime, SlotId(0), holder, &state).unwrap();
            let order = Arc::clone(&order);
            ctx.push_next_task(move |mut task| {
                order.lock().push(1);
                let order = Arc::clone(&order);
                task.push_next_task(move |_task| order.lock().push(2));
            })
            .unwrap();
        }

        assert_eq!(driver.run_callbacks(), 3);
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(*signals.lock(), vec![None]);
    }

    #[test]
    fn test_continuation_after_state_released() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();
        let (holder, signals) = counting_holder();
        let task_stream = Arc::new(Mutex::new(None));

        let acquired = {
            let mut ctx =
                ScopedContextAcquire::with_state(&runtime, SlotId(0), holder, &state).unwrap();
            let task_stream = Arc::clone(&task_stream);
            ctx.push_next_task(move |task| {
                *task_stream.lock() = Some(task.stream().raw());
            })
            .unwrap();
            ctx.stream().raw()
        };

        // The produce phase takes the stream before the continuation fires.
        let produce = ScopedContextProduce::from_state(&runtime, &state).unwrap();
        drop(produce);
        assert!(!state.is_valid());

        assert_eq!(driver.run_callbacks(), 2);
        assert_eq!(*task_stream.lock(), Some(acquired));
        assert_eq!(*signals.lock(), vec![None]);
    }

    #[test]
    fn test_panicking_continuation_signals_error() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();
        let (holder, signals) = counting_holder();

        {
            let mut ctx =
                ScopedContextAcquire::with_state(&runtime, SlotId(0), holder, &state).unwrap();
            ctx.push_next_task(|_task| panic!("continuation failed"))
                .unwrap();
        }

        // Only the acquire callback: the panicking task enqueues nothing.
        assert_eq!(driver.run_callbacks(), 1);
        assert_eq!(
            *signals.lock(),
            vec![Some(ContextError::TaskPanicked {
                device: DeviceId(0),
                message: "continuation failed".to_string(),
            })]
        );
    }

    #[test]
    fn test_panic_after_nested_push_reaches_holder() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();
        let (holder, signals) = counting_holder();
        let nested_ran = Arc::new(AtomicUsize::new(0));

        {
            let mut ctx =
                ScopedContextAcquire::with_state(&runtime, SlotId(0), holder, &state).unwrap();
            let nested_ran = Arc::clone(&nested_ran);
            ctx.push_next_task(move |mut task| {
                task.push_next_task(move |_task| {
                    nested_ran.fetch_add(1, Ordering::SeqCst);
                });
                panic!("after push");
            })
            .unwrap();
        }

        driver.run_callbacks();
        assert_eq!(nested_ran.load(Ordering::SeqCst), 0);
        let signals = signals.lock();
        assert_eq!(signals.len(), 1);
        assert!(matches!(
            &signals[0],
            Some(ContextError::TaskPanicked { message, .. }) if message == "after push"
        ));
    }

    #[test]
    fn test_get_while_producer_open_does_not_latch() {
        let (driver, runtime) = runtime(1);
        let producer = ScopedContextProduce::new(&runtime, SlotId(0)).unwrap();
        let product = producer.wrap(7u32);

        let early = ScopedContextAcquire::new(&runtime, SlotId(1), WaitingTaskHolder::noop())
            .unwrap();
        assert!(!early.stream().same_queue(product.stream()));
        assert_eq!(*early.get(&product).unwrap(), 7);
        assert!(!product.is_available().unwrap());
        assert_eq!(driver.calls(DriverOp::StreamWaitEvent), 1);

        drop(producer);
        assert!(!product.is_available().unwrap());

        let late = ScopedContextAcquire::new(&runtime, SlotId(2), WaitingTaskHolder::noop())
            .unwrap();
        late.get(&product).unwrap();
        assert_eq!(driver.calls(DriverOp::StreamWaitEvent), 2);

        driver.complete_all();
        assert!(product.is_available().unwrap());
        late.get(&product).unwrap();
        assert_eq!(driver.calls(DriverOp::StreamWaitEvent), 2);
    }

    #[test]
    fn test_wrap_available_skips_wait() {
        let (driver, runtime) = runtime(1);
        let producer = ScopedContextProduce::new(&runtime, SlotId(0)).unwrap();
        let product = producer.wrap_available(3u8);
        assert_eq!(product.event(), Some(producer.event()));
        drop(producer);

        let consumer =
            ScopedContextAcquire::new(&runtime, SlotId(1), WaitingTaskHolder::noop()).unwrap();
        assert!(!consumer.stream().same_queue(product.stream()));
        assert_eq!(*consumer.get(&product).unwrap(), 3);
        assert!(driver.waits().is_empty());
        assert_eq!(driver.calls(DriverOp::EventQuery), 1);
    }

    #[test]
    fn test_replace_waiting_task_holder() {
        let (driver, runtime) = runtime(1);
        let (first, first_signals) = counting_holder();
        let (second, second_signals) = counting_holder();

        let mut ctx = ScopedContextAcquire::new(&runtime, SlotId(0), first).unwrap();
        ctx.replace_waiting_task_holder(second);
        // The replaced holder is released when replaced.
        assert_eq!(*first_signals.lock(), vec![None]);
        drop(ctx);

        driver.run_callbacks();
        assert_eq!(*second_signals.lock(), vec![None]);
    }

    #[test]
    fn test_callback_enqueue_failure_signals_error() {
        let (driver, runtime) = runtime(1);
        let (holder, signals) = counting_holder();

        let ctx = ScopedContextAcquire::new(&runtime, SlotId(0), holder).unwrap();
        driver.fail_next(DriverOp::StreamAddCallback);
        let err = ctx.finish().unwrap_err();

        assert!(err.is_resource_error());
        assert_eq!(*signals.lock(), vec![Some(err)]);
        assert_eq!(driver.pending_callbacks(), 0);
    }

    #[test]
    fn test_acquire_creation_failure_signals_holder() {
        let (driver, runtime) = runtime(1);
        let (holder, signals) = counting_holder();

        driver.fail_next(DriverOp::StreamCreate);
        let err = ScopedContextAcquire::new(&runtime, SlotId(0), holder)
            .err()
            .unwrap();
        assert_eq!(*signals.lock(), vec![Some(err)]);
    }

    #[test]
    fn test_state_reuse_requires_release() {
        let (driver, runtime) = runtime(1);
        let state = ContextState::new();

        drop(
            ScopedContextAcquire::with_state(&runtime, SlotId(0), WaitingTaskHolder::noop(), &state)
                .unwrap(),
        );
        driver.run_callbacks();

        let err = ScopedContextAcquire::with_state(
            &runtime,
            SlotId(0),
            WaitingTaskHolder::noop(),
            &state,
        )
        .err()
        .unwrap();
        assert_eq!(err, ContextError::ContextStateAlreadySet);

        drop(ScopedContextProduce::from_state(&runtime, &state).unwrap());
        let err = ScopedContextProduce::from_state(&runtime, &state)
            .err()
            .unwrap();
        assert_eq!(err, ContextError::StreamAlreadyReleased);
    }

    #[test]
    fn test_produce_records_one_event_stamped_on_products() {
        let (driver, runtime) = runtime(1);
        let mut store = ProductStore::new();
        let key = ProductKey::<u32>::new("b");

        let ctx = ScopedContextProduce::new(&runtime, SlotId(0)).unwrap();
        let event = ctx.event().clone();
        let a = ctx.wrap(1u32);
        ctx.emplace(&mut store, &key, 2u32).unwrap();
        assert_eq!(driver.calls(DriverOp::EventRecord), 0);
        drop(ctx);

        assert_eq!(driver.calls(DriverOp::EventRecord), 1);
        assert_eq!(a.event(), Some(&event));
        assert_eq!(store.product(&key).unwrap().event(), Some(&event));
        assert!(!a.is_available().unwrap());
    }

    #[test]
    fn test_produce_event_failure_surfaces_at_construction() {
        let (driver, runtime) = runtime(1);
        driver.fail_next(DriverOp::EventCreate);

        let err = ScopedContextProduce::new(&runtime, SlotId(0)).err().unwrap();
        assert!(err.is_resource_error());
        assert_eq!(driver.calls(DriverOp::EventRecord), 0);
        // The stream taken before the failure is back in the pool.
        assert_eq!(runtime.stream_pool().cached(DeviceId(0)), 1);
    }

    #[test]
    fn test_get_waits_on_foreign_stream() {
        let (driver, runtime) = runtime(1);
        let produce = ScopedContextProduce::new(&runtime, SlotId(0)).unwrap();
        let product = produce.wrap(vec![1, 2, 3]);
        drop(produce);

        // Take the stream of the product so the consumer gets its own.
        let first = ScopedContextAnalyze::from_product(&runtime, &product).unwrap();
        assert!(first.stream().same_queue(product.stream()));
        assert_eq!(first.get(&product).unwrap(), &vec![1, 2, 3]);
        assert_eq!(driver.calls(DriverOp::StreamWaitEvent), 0);

        let second = ScopedContextAnalyze::from_product(&runtime, &product).unwrap();
        assert!(!second.stream().same_queue(product.stream()));
        second.get(&product).unwrap();
        assert_eq!(
            driver.waits(),
            vec![(second.stream().raw(), product.event().unwrap().raw())]
        );
    }

    #[test]
    fn test_get_by_key() {
        let (driver, runtime) = runtime(1);
        let mut store = ProductStore::new();
        let key = ProductKey::<String>::new("name");

        let produce = ScopedContextProduce::new(&runtime, SlotId(0)).unwrap();
        produce.emplace(&mut store, &key, "pixel".to_string()).unwrap();
        drop(produce);
        driver.complete_all();

        let ctx =
            ScopedContextAcquire::new(&runtime, SlotId(1), WaitingTaskHolder::noop()).unwrap();
        assert_eq!(ctx.get_by_key(&store, &key).unwrap(), "pixel");
        assert_eq!(driver.calls(DriverOp::StreamWaitEvent), 0);

        let missing = ProductKey::<String>::new("missing");
        assert!(ctx.get_by_key(&store, &missing).unwrap_err().is_usage_error());
    }

    #[test]
    fn test_product_on_unknown_device_rejected() {
        let (_driver, two) = runtime(2);
        let (_other, one) = runtime(1);

        let produce = ScopedContextProduce::new(&two, SlotId(1)).unwrap();
        let product = produce.wrap(0u8);
        drop(produce);

        let err = ScopedContextAnalyze::from_product(&one, &product).err().unwrap();
        assert!(matches!(err, ContextError::InvalidDevice { .. }));
    }
}
