//! Ingress consumer stage
//!
//! Drains one or more transport subscriptions into the ingress ring.
//! Multiple subscriptions multiplex into the same ring: order within a
//! single stream is preserved, order across streams is not. Reassembly
//! state is owned here, one assembler per subscription.
//!
//! This worker is the ingress ring's only producer: pending administrative
//! markers are drained from the marker queue into the ring at the top of
//! every poll, ahead of the subscription fragments.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::constants::{ ADMINISTRATIVE_MSG_TYPE_ID, APPLICATION_MSG_TYPE_ID };
use crate::idle::IdleStrategy;
use crate::message::MarkerQueue;
use crate::ring::RingBuffer;
use crate::stage::forward_until_accepted;
use crate::transport::{ FragmentAssembler, Subscription };
use crate::worker::StagePoller;

struct SubscriptionSlot {
    subscription: Box<dyn Subscription>,
    assembler: FragmentAssembler,
}

/// Polls transport subscriptions and writes reassembled records to the
/// ingress ring
pub struct IngressConsumer {
    subscriptions: Vec<SubscriptionSlot>,
    ring: Arc<RingBuffer>,
    markers: Arc<MarkerQueue>,
    write_idle: IdleStrategy,
    frame_count_limit: usize,
}

impl IngressConsumer {
    /// Create a consumer with no subscriptions yet
    pub fn new(
        ring: Arc<RingBuffer>,
        markers: Arc<MarkerQueue>,
        write_idle: IdleStrategy,
        frame_count_limit: usize
    ) -> Self {
        Self {
            subscriptions: Vec::new(),
            ring,
            markers,
            write_idle,
            frame_count_limit,
        }
    }

    /// Register an additional input stream; returns its subscription id
    pub fn add_subscription(&mut self, subscription: Box<dyn Subscription>) -> usize {
        self.subscriptions.push(SubscriptionSlot {
            subscription,
            assembler: FragmentAssembler::new(),
        });
        self.subscriptions.len() - 1
    }

    /// Number of registered subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl StagePoller for IngressConsumer {
    fn poll(&mut self, running: &AtomicBool) -> usize {
        let ring = &self.ring;
        let write_idle = &mut self.write_idle;
        let frame_count_limit = self.frame_count_limit;

        let mut work = 0;
        while let Some(marker) = self.markers.pop() {
            forward_until_accepted(ring, ADMINISTRATIVE_MSG_TYPE_ID, &marker, write_idle, running);
            work += 1;
        }

        for slot in self.subscriptions.iter_mut() {
            let SubscriptionSlot { subscription, assembler } = slot;
            work += subscription.poll(
                &mut |fragment| {
                    assembler.on_fragment(fragment, &mut |message| {
                        forward_until_accepted(
                            ring,
                            APPLICATION_MSG_TYPE_ID,
                            message,
                            write_idle,
                            running
                        );
                    });
                },
                frame_count_limit
            );
        }
        work
    }

    fn on_close(&mut self) {
        for slot in self.subscriptions.iter_mut() {
            slot.subscription.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::IdleKind;
    use crate::transport::{ LoopbackTransport, Publication, StreamDef, Transport };
    use std::sync::atomic::Ordering;

    fn consumer_with_stream(
        transport: &LoopbackTransport,
        stream: &StreamDef,
        ring: Arc<RingBuffer>
    ) -> IngressConsumer {
        let mut consumer = IngressConsumer::new(
            ring,
            Arc::new(MarkerQueue::new()),
            IdleStrategy::from_kind(IdleKind::BusySpin),
            10
        );
        consumer.add_subscription(transport.add_subscription(stream, None, None).unwrap());
        consumer
    }

    #[test]
    fn test_fragments_land_in_ring() {
        let transport = LoopbackTransport::new();
        let stream = StreamDef::new("loopback:ingress", 10);
        let ring = Arc::new(RingBuffer::new(16 * 1024).unwrap());
        let mut consumer = consumer_with_stream(&transport, &stream, Arc::clone(&ring));
        let mut publication = transport.add_publication(&stream).unwrap();

        for i in 0..5u64 {
            assert!(publication.offer(&i.to_le_bytes()) >= 0);
        }

        let running = AtomicBool::new(true);
        let work = consumer.poll(&running);
        assert_eq!(work, 5);

        let mut seen = Vec::new();
        ring.read(
            |msg_type_id, payload| {
                assert_eq!(msg_type_id, APPLICATION_MSG_TYPE_ID);
                seen.push(u64::from_le_bytes(payload.try_into().unwrap()));
            },
            100
        );
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fragmented_message_is_reassembled() {
        let transport = LoopbackTransport::with_settings(8, 1024);
        let stream = StreamDef::new("loopback:ingress", 11);
        let ring = Arc::new(RingBuffer::new(16 * 1024).unwrap());
        let mut consumer = consumer_with_stream(&transport, &stream, Arc::clone(&ring));
        let mut publication = transport.add_publication(&stream).unwrap();

        let message: Vec<u8> = (0..30u8).collect();
        assert!(publication.offer(&message) >= 0);

        let running = AtomicBool::new(true);
        consumer.poll(&running);

        let mut seen = Vec::new();
        ring.read(|_, payload| seen.push(payload.to_vec()), 10);
        assert_eq!(seen, vec![message]);
    }

    #[test]
    fn test_pending_markers_drain_before_fragments() {
        use crate::message::{ decode_snapshot, LOAD_SNAPSHOT_TEMPLATE_ID };

        let transport = LoopbackTransport::new();
        let stream = StreamDef::new("loopback:ingress", 13);
        let ring = Arc::new(RingBuffer::new(16 * 1024).unwrap());
        let markers = Arc::new(MarkerQueue::new());
        let mut consumer = IngressConsumer::new(
            Arc::clone(&ring),
            Arc::clone(&markers),
            IdleStrategy::from_kind(IdleKind::BusySpin),
            10
        );
        consumer.add_subscription(transport.add_subscription(&stream, None, None).unwrap());
        let mut publication = transport.add_publication(&stream).unwrap();

        assert!(publication.offer(b"application record") >= 0);
        markers.enqueue(LOAD_SNAPSHOT_TEMPLATE_ID, 2);

        let running = AtomicBool::new(true);
        consumer.poll(&running);

        let mut seen = Vec::new();
        ring.read(|msg_type_id, payload| seen.push((msg_type_id, payload.to_vec())), 10);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, ADMINISTRATIVE_MSG_TYPE_ID);
        let (header, body) = decode_snapshot(&seen[0].1).unwrap();
        assert_eq!(header.template_id, LOAD_SNAPSHOT_TEMPLATE_ID);
        assert_eq!(body.node_id, 2);
        assert_eq!(seen[1].0, APPLICATION_MSG_TYPE_ID);
    }

    #[test]
    fn test_shutdown_abandons_record_on_full_ring() {
        let transport = LoopbackTransport::new();
        let stream = StreamDef::new("loopback:ingress", 12);
        // Ring too small for a second record of this size
        let ring = Arc::new(RingBuffer::new(512).unwrap());
        let mut consumer = consumer_with_stream(&transport, &stream, Arc::clone(&ring));
        let mut publication = transport.add_publication(&stream).unwrap();

        let payload = [7u8; 48];
        assert!(publication.offer(&payload) >= 0);
        assert!(publication.offer(&payload) >= 0);

        let running = AtomicBool::new(true);
        consumer.poll(&running);
        // First record fits; fill the rest of the ring so the retry loop
        // would spin forever if it ignored the flag.
        while ring.write(1, &payload).unwrap() {}

        assert!(publication.offer(&payload) >= 0);
        running.store(false, Ordering::SeqCst);
        consumer.poll(&running);
    }
}
