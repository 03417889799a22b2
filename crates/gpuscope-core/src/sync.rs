//! Cross-stream synchronization.
//!
//! A consumer that reads a product produced on another stream must not let
//! its own GPU work start before the producing work is done. Instead of
//! blocking the host until the producer finishes, the consumer stream is
//! told to wait for the product's event. Host threads never block here.

use tracing::{debug, trace};

use crate::driver::DeviceId;
use crate::error::{ContextError, Result};
use crate::pool::{SharedEvent, SharedStream};

/// Orders `consumer` after the producing work of a product.
///
/// Rules, in order:
/// 1. `available`: nothing to do.
/// 2. Same stream: work is already ordered.
/// 3. Otherwise `consumer` waits for `producer_event`.
///
/// A product that is neither available nor on the same stream must carry
/// an event; [`ContextError::MissingEvent`] is returned otherwise.
pub fn synchronize_streams(
    consumer: &SharedStream,
    producer_device: DeviceId,
    producer_stream: &SharedStream,
    available: bool,
    producer_event: Option<&SharedEvent>,
) -> Result<()> {
    if available {
        trace!(device = %producer_device, "Product available, no synchronization");
        return Ok(());
    }

    if producer_stream.same_queue(consumer) {
        trace!(device = %producer_device, "Product on the same stream, no synchronization");
        return Ok(());
    }

    let event = producer_event.ok_or(ContextError::MissingEvent {
        device: producer_device,
    })?;

    if producer_device != consumer.device() {
        debug!(
            producer = %producer_device,
            consumer = %consumer.device(),
            "Consuming product from another device"
        );
    }

    debug!(
        consumer = ?consumer.raw(),
        producer = ?producer_stream.raw(),
        event = ?event.raw(),
        "Inserting cross-stream wait"
    );
    consumer.wait_event(event)
}
