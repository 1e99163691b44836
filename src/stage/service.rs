//! Service stage
//!
//! Invokes the user handler exactly once per record, in arrival order, from
//! the terminal input ring of the pipeline. A handler error is logged and
//! processing continues with the next record; the stage never retries a
//! handler call.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::constants::STAGE_BATCH_LIMIT;
use crate::error::Result;
use crate::ring::RingBuffer;
use crate::worker::StagePoller;

/// User-supplied message handler
///
/// Handlers receive administrative records (snapshot markers) alongside
/// application records and discriminate on the message-type id. Responses
/// and events go out through the ring pools the handler was built with.
/// A blocking handler stalls the whole pipeline.
pub trait ServiceHandler: Send + 'static {
    /// Process one record
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) -> Result<()>;
}

impl<F> ServiceHandler for F where F: FnMut(i32, &[u8]) -> Result<()> + Send + 'static {
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) -> Result<()> {
        self(msg_type_id, payload)
    }
}

/// Drives the user handler from the terminal input ring
pub struct ServiceStage<H: ServiceHandler> {
    ring: Arc<RingBuffer>,
    handler: H,
}

impl<H: ServiceHandler> ServiceStage<H> {
    /// Pair the terminal ring with the handler
    pub fn new(ring: Arc<RingBuffer>, handler: H) -> Self {
        Self { ring, handler }
    }

    /// Access the handler before the stage is started
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: ServiceHandler> StagePoller for ServiceStage<H> {
    fn poll(&mut self, _running: &AtomicBool) -> usize {
        let handler = &mut self.handler;

        let mut records = 0;
        self.ring.read(
            |msg_type_id, payload| {
                if let Err(err) = handler.on_message(msg_type_id, payload) {
                    tracing::error!(msg_type_id, %err, "service handler failed");
                }
                records += 1;
            },
            STAGE_BATCH_LIMIT
        );
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    #[test]
    fn test_handler_sees_records_in_order() {
        let ring = Arc::new(RingBuffer::new(16 * 1024).unwrap());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handler = {
            let seen = Arc::clone(&seen);
            move |msg_type_id: i32, payload: &[u8]| -> Result<()> {
                seen.lock().push((msg_type_id, payload.to_vec()));
                Ok(())
            }
        };
        let mut stage = ServiceStage::new(Arc::clone(&ring), handler);

        for i in 0..5u64 {
            ring.write(3, &i.to_le_bytes()).unwrap();
        }

        let running = AtomicBool::new(true);
        let work = stage.poll(&running);
        assert_eq!(work, 5);

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        for (i, (msg_type_id, payload)) in seen.iter().enumerate() {
            assert_eq!(*msg_type_id, 3);
            assert_eq!(u64::from_le_bytes(payload.as_slice().try_into().unwrap()), i as u64);
        }
    }

    #[test]
    fn test_handler_error_does_not_stop_the_stage() {
        let ring = Arc::new(RingBuffer::new(16 * 1024).unwrap());
        let processed = Arc::new(parking_lot::Mutex::new(0usize));
        let handler = {
            let processed = Arc::clone(&processed);
            move |_msg_type_id: i32, payload: &[u8]| -> Result<()> {
                *processed.lock() += 1;
                if payload[0] == 1 {
                    Err(RelayError::invalid_message("poisoned record"))
                } else {
                    Ok(())
                }
            }
        };
        let mut stage = ServiceStage::new(Arc::clone(&ring), handler);

        ring.write(1, &[0u8; 4]).unwrap();
        ring.write(1, &[1u8; 4]).unwrap();
        ring.write(1, &[0u8; 4]).unwrap();

        let running = AtomicBool::new(true);
        assert_eq!(stage.poll(&running), 3);
        assert_eq!(*processed.lock(), 3);
    }
}
