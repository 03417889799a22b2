//! Products: values tagged with the device, stream and event that
//! produced them.
//!
//! A [`Product`] is created by a [`ScopedContextProduce`] and is read-only
//! afterwards. Its value can only be reached through a context `get`, which
//! first makes the reading stream wait for the producing stream when
//! needed.
//!
//! [`ScopedContextProduce`]: crate::context::ScopedContextProduce

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::DeviceId;
use crate::error::{ContextError, Result};
use crate::pool::{SharedEvent, SharedStream};

/// Provenance part of a [`Product`].
pub struct ProductBase {
    device: DeviceId,
    stream: SharedStream,
    event: Option<SharedEvent>,
    available: AtomicBool,
    may_reuse_stream: AtomicBool,
}

impl ProductBase {
    pub(crate) fn new(
        device: DeviceId,
        stream: SharedStream,
        event: Option<SharedEvent>,
        available: bool,
    ) -> Self {
        Self {
            device,
            stream,
            event,
            available: AtomicBool::new(available),
            may_reuse_stream: AtomicBool::new(true),
        }
    }

    /// Device the product lives on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Stream the product was produced on.
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    /// Event marking the end of the producing work, if any.
    pub fn event(&self) -> Option<&SharedEvent> {
        self.event.as_ref()
    }

    /// Returns `true` if the producing work has completed.
    ///
    /// Queries the event while it is still in flight; once completion has
    /// been observed the answer is latched and no further queries are made.
    /// A product without an event is only available if it was created so.
    /// While the producing context is open its event is not recorded yet,
    /// and the product is not available.
    pub fn is_available(&self) -> Result<bool> {
        if self.available.load(Ordering::Acquire) {
            return Ok(true);
        }
        let Some(event) = &self.event else {
            return Ok(false);
        };
        if !event.is_recorded() {
            return Ok(false);
        }
        let completed = event.has_completed()?;
        if completed {
            self.available.store(true, Ordering::Release);
        }
        Ok(completed)
    }

    /// Returns `true` for exactly one caller: the first consumer may take
    /// over the producing stream, every later one needs its own.
    pub(crate) fn may_reuse_stream(&self) -> bool {
        self.may_reuse_stream
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for ProductBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductBase")
            .field("device", &self.device)
            .field("stream", &self.stream)
            .field("event", &self.event)
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish()
    }
}

/// A value together with its production provenance.
pub struct Product<T> {
    base: ProductBase,
    data: T,
}

impl<T> Product<T> {
    pub(crate) fn new(base: ProductBase, data: T) -> Self {
        Self { base, data }
    }

    /// Provenance of the product.
    pub fn base(&self) -> &ProductBase {
        &self.base
    }

    pub(crate) fn data(&self) -> &T {
        &self.data
    }
}

impl<T> Deref for Product<T> {
    type Target = ProductBase;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<T> fmt::Debug for Product<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Product")
            .field("base", &self.base)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Typed key of a product in a [`ProductLookup`].
pub struct ProductKey<T> {
    label: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ProductKey<T> {
    /// Creates a key.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            _marker: PhantomData,
        }
    }

    /// Key label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Clone for ProductKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.label.clone())
    }
}

impl<T> fmt::Debug for ProductKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProductKey").field(&self.label).finish()
    }
}

/// Keyed read access to already produced products.
pub trait ProductLookup {
    /// Returns the product stored under `key`.
    fn product<T: Send + Sync + 'static>(&self, key: &ProductKey<T>) -> Result<&Product<T>>;
}

/// Keyed write access for newly produced products.
pub trait ProductSink {
    /// Stores `product` under `key`.
    fn put<T: Send + Sync + 'static>(&mut self, key: &ProductKey<T>, product: Product<T>)
        -> Result<()>;
}

/// In-memory product container, one product per key.
#[derive(Default)]
pub struct ProductStore {
    products: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ProductStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored products.
    pub fn len(&self) -> usize {
        self.products.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Returns `true` if a product is stored under `label`.
    pub fn contains(&self, label: &str) -> bool {
        self.products.contains_key(label)
    }
}

impl ProductLookup for ProductStore {
    fn product<T: Send + Sync + 'static>(&self, key: &ProductKey<T>) -> Result<&Product<T>> {
        let boxed = self
            .products
            .get(key.label())
            .ok_or_else(|| ContextError::ProductNotFound(key.label().to_string()))?;
        boxed
            .downcast_ref::<Product<T>>()
            .ok_or_else(|| ContextError::ProductTypeMismatch {
                key: key.label().to_string(),
            })
    }
}

impl ProductSink for ProductStore {
    fn put<T: Send + Sync + 'static>(
        &mut self,
        key: &ProductKey<T>,
        product: Product<T>,
    ) -> Result<()> {
        if self.products.contains_key(key.label()) {
            return Err(ContextError::ProductAlreadyStored(key.label().to_string()));
        }
        self.products
            .insert(key.label().to_string(), Box::new(product));
        Ok(())
    }
}

impl fmt::Debug for ProductStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductStore")
            .field("keys", &self.products.keys().collect::<Vec<_>>())
            .finish()
    }
}
