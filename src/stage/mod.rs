//! Pipeline stages
//!
//! Each stage pairs an input (subscription or ring) with a handler and runs
//! on its own worker thread. The retry helpers here implement the shared
//! backpressure discipline: transient refusals spin on the stage's idle
//! strategy, the running flag is re-checked inside every retry loop, and a
//! fatal publication loss stops the owning stage.

use std::sync::atomic::{ AtomicBool, Ordering };

use crate::idle::IdleStrategy;
use crate::ring::RingBuffer;
use crate::transport::{ Publication, PUBLICATION_CLOSED };

pub mod egress;
pub mod ingress;
pub mod journal;
pub mod replica;
pub mod service;

pub use egress::EgressProducer;
pub use ingress::IngressConsumer;
pub use journal::{ FileJournal, Journal, JournalStage, JournalStrategy };
pub use replica::ReplicaStage;
pub use service::{ ServiceHandler, ServiceStage };

/// Offer a record until the transport accepts it
///
/// Transient result codes retry under the idle strategy. A closed
/// publication clears the running flag so the stage shuts itself down.
/// Returns false when the record was abandoned.
pub(crate) fn offer_until_success(
    publication: &mut dyn Publication,
    payload: &[u8],
    idle: &mut IdleStrategy,
    running: &AtomicBool
) -> bool {
    loop {
        let position = publication.offer(payload);
        if position >= 0 {
            return true;
        }
        if position == PUBLICATION_CLOSED {
            tracing::error!("publication closed, stopping stage");
            running.store(false, Ordering::SeqCst);
            return false;
        }
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        idle.idle(0);
    }
}

/// Write a record to the next ring until it is accepted
///
/// A full ring retries under the idle strategy; shutdown abandons the
/// record. Rejections (reserved type id, oversize) are defects upstream and
/// are logged, not retried.
pub(crate) fn forward_until_accepted(
    ring: &RingBuffer,
    msg_type_id: i32,
    payload: &[u8],
    idle: &mut IdleStrategy,
    running: &AtomicBool
) -> bool {
    loop {
        match ring.write(msg_type_id, payload) {
            Ok(true) => {
                return true;
            }
            Ok(false) => {
                if !running.load(Ordering::SeqCst) {
                    return false;
                }
                idle.idle(0);
            }
            Err(err) => {
                tracing::warn!(%err, "record rejected by ring");
                return false;
            }
        }
    }
}
