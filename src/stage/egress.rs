//! Egress producer stage
//!
//! Drains one output ring and publishes each record onto the transport
//! stream the ring was bound to at construction.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::constants::EGRESS_BATCH_LIMIT;
use crate::idle::IdleStrategy;
use crate::ring::RingBuffer;
use crate::stage::offer_until_success;
use crate::transport::Publication;
use crate::worker::StagePoller;

/// Publishes records from one output ring onto one transport stream
pub struct EgressProducer {
    ring: Arc<RingBuffer>,
    publication: Box<dyn Publication>,
    retry_idle: IdleStrategy,
}

impl EgressProducer {
    /// Bind an output ring to a publication
    pub fn new(
        ring: Arc<RingBuffer>,
        publication: Box<dyn Publication>,
        retry_idle: IdleStrategy
    ) -> Self {
        Self { ring, publication, retry_idle }
    }
}

impl StagePoller for EgressProducer {
    fn poll(&mut self, running: &AtomicBool) -> usize {
        let publication = &mut self.publication;
        let retry_idle = &mut self.retry_idle;

        let mut records = 0;
        self.ring.read(
            |_msg_type_id, payload| {
                offer_until_success(publication.as_mut(), payload, retry_idle, running);
                records += 1;
            },
            EGRESS_BATCH_LIMIT
        );
        records
    }

    fn on_close(&mut self) {
        self.publication.close();
    }
}
