//! Replica stage
//!
//! When replication is enabled, every record leaving the ingress ring is
//! published onto the replica stream and then forwarded to the next ring,
//! synchronously and in input order. The forward happens only after the
//! publish succeeds, which is what gives the journal-after-replica ordering
//! guarantee downstream.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::constants::STAGE_BATCH_LIMIT;
use crate::idle::IdleStrategy;
use crate::ring::RingBuffer;
use crate::stage::{ forward_until_accepted, offer_until_success };
use crate::transport::Publication;
use crate::worker::StagePoller;

/// Copies records to a replica stream and forwards them locally
pub struct ReplicaStage {
    input: Arc<RingBuffer>,
    publication: Box<dyn Publication>,
    output: Arc<RingBuffer>,
    retry_idle: IdleStrategy,
}

impl ReplicaStage {
    /// Wire the stage between its input ring, replica publication and
    /// output ring
    pub fn new(
        input: Arc<RingBuffer>,
        publication: Box<dyn Publication>,
        output: Arc<RingBuffer>,
        retry_idle: IdleStrategy
    ) -> Self {
        Self { input, publication, output, retry_idle }
    }
}

impl StagePoller for ReplicaStage {
    fn poll(&mut self, running: &AtomicBool) -> usize {
        let publication = &mut self.publication;
        let output = &self.output;
        let retry_idle = &mut self.retry_idle;

        let mut records = 0;
        self.input.read(
            |msg_type_id, payload| {
                if offer_until_success(publication.as_mut(), payload, retry_idle, running) {
                    forward_until_accepted(output, msg_type_id, payload, retry_idle, running);
                }
                records += 1;
            },
            STAGE_BATCH_LIMIT
        );
        records
    }

    fn on_close(&mut self) {
        self.publication.close();
    }
}
