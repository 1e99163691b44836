//! In-process loopback transport
//!
//! Streams are lock-free queues shared between publications and the single
//! subscriber of each stream. Payloads larger than the configured MTU are
//! delivered as begin/middle/end fragments, which exercises the same
//! reassembly path a networked transport would. Used by the demo binary and
//! the end-to-end tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicI32, AtomicU64, Ordering };

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::error::{ RelayError, Result };
use crate::transport::{
    Fragment,
    Image,
    ImageHandler,
    Publication,
    StreamDef,
    Subscription,
    Transport,
    BACK_PRESSURED,
    BEGIN_FRAGMENT,
    END_FRAGMENT,
    NOT_CONNECTED,
    PUBLICATION_CLOSED,
    UNFRAGMENTED,
};

/// Default fragmentation threshold in bytes
pub const DEFAULT_LOOPBACK_MTU: usize = 1024;

/// Default per-stream queue depth before offers are back-pressured
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct StreamQueue {
    messages: SegQueue<Vec<u8>>,
    position: AtomicU64,
    subscribed: AtomicBool,
}

impl StreamQueue {
    fn new() -> Self {
        Self {
            messages: SegQueue::new(),
            position: AtomicU64::new(0),
            subscribed: AtomicBool::new(false),
        }
    }
}

struct Inner {
    streams: Mutex<HashMap<StreamDef, Arc<StreamQueue>>>,
    mtu: usize,
    queue_capacity: usize,
    next_session_id: AtomicI32,
}

/// In-process transport over shared per-stream queues
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    /// Create a transport with default MTU and queue depth
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_LOOPBACK_MTU, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a transport with explicit MTU and queue depth
    pub fn with_settings(mtu: usize, queue_capacity: usize) -> Self {
        assert!(mtu > 0, "loopback MTU must be positive");
        assert!(queue_capacity > 0, "loopback queue capacity must be positive");
        Self {
            inner: Arc::new(Inner {
                streams: Mutex::new(HashMap::new()),
                mtu,
                queue_capacity,
                next_session_id: AtomicI32::new(1),
            }),
        }
    }

    fn stream_queue(&self, stream: &StreamDef) -> Arc<StreamQueue> {
        let mut streams = self.inner.streams.lock();
        Arc::clone(streams.entry(stream.clone()).or_insert_with(|| Arc::new(StreamQueue::new())))
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn add_subscription(
        &self,
        stream: &StreamDef,
        on_available: Option<ImageHandler>,
        on_unavailable: Option<ImageHandler>
    ) -> Result<Box<dyn Subscription>> {
        let queue = self.stream_queue(stream);
        if queue.subscribed.swap(true, Ordering::SeqCst) {
            return Err(
                RelayError::transport(
                    format!("stream {}:{} already has a subscriber", stream.channel, stream.stream_id)
                )
            );
        }

        let image = Image {
            session_id: self.inner.next_session_id.fetch_add(1, Ordering::Relaxed),
            channel: stream.channel.clone(),
            stream_id: stream.stream_id,
        };
        if let Some(handler) = &on_available {
            handler(&image);
        }

        Ok(
            Box::new(LoopbackSubscription {
                queue,
                mtu: self.inner.mtu,
                image,
                on_unavailable,
                closed: false,
            })
        )
    }

    fn add_publication(&self, stream: &StreamDef) -> Result<Box<dyn Publication>> {
        Ok(
            Box::new(LoopbackPublication {
                queue: self.stream_queue(stream),
                queue_capacity: self.inner.queue_capacity,
                closed: false,
            })
        )
    }
}

/// Receiving end of one loopback stream
pub struct LoopbackSubscription {
    queue: Arc<StreamQueue>,
    mtu: usize,
    image: Image,
    on_unavailable: Option<ImageHandler>,
    closed: bool,
}

impl Subscription for LoopbackSubscription {
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment<'_>), fragment_limit: usize) -> usize {
        if self.closed {
            return 0;
        }

        let mut fragments = 0;
        while fragments < fragment_limit {
            let Some(message) = self.queue.messages.pop() else {
                break;
            };

            if message.len() <= self.mtu {
                handler(Fragment {
                    session_id: self.image.session_id,
                    flags: UNFRAGMENTED,
                    payload: &message,
                });
                fragments += 1;
                continue;
            }

            // Once a message is popped, all of its fragments are delivered
            // even if that overruns the limit for this poll.
            let chunks: Vec<&[u8]> = message.chunks(self.mtu).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let flags = if i == 0 {
                    BEGIN_FRAGMENT
                } else if i == last {
                    END_FRAGMENT
                } else {
                    0
                };
                handler(Fragment {
                    session_id: self.image.session_id,
                    flags,
                    payload: chunk,
                });
                fragments += 1;
            }
        }

        fragments
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.queue.subscribed.store(false, Ordering::SeqCst);
        if let Some(handler) = &self.on_unavailable {
            handler(&self.image);
        }
    }
}

/// Sending end of one loopback stream
pub struct LoopbackPublication {
    queue: Arc<StreamQueue>,
    queue_capacity: usize,
    closed: bool,
}

impl Publication for LoopbackPublication {
    fn offer(&mut self, payload: &[u8]) -> i64 {
        if self.closed {
            return PUBLICATION_CLOSED;
        }
        if !self.queue.subscribed.load(Ordering::SeqCst) {
            return NOT_CONNECTED;
        }
        if self.queue.messages.len() >= self.queue_capacity {
            return BACK_PRESSURED;
        }

        self.queue.messages.push(payload.to_vec());
        self.queue.position.fetch_add(1, Ordering::Relaxed) as i64
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stream() -> StreamDef {
        StreamDef::new("loopback:local", 100)
    }

    #[test]
    fn test_offer_requires_subscriber() {
        let transport = LoopbackTransport::new();
        let mut publication = transport.add_publication(&stream()).unwrap();
        assert_eq!(publication.offer(b"nobody home"), NOT_CONNECTED);

        let _subscription = transport
            .add_subscription(&stream(), None, None)
            .unwrap();
        assert!(publication.offer(b"hello") >= 0);
    }

    #[test]
    fn test_round_trip_small_message() {
        let transport = LoopbackTransport::new();
        let mut subscription = transport.add_subscription(&stream(), None, None).unwrap();
        let mut publication = transport.add_publication(&stream()).unwrap();

        assert!(publication.offer(b"ping") >= 0);

        let mut seen = Vec::new();
        let delivered = subscription.poll(
            &mut |fragment| {
                assert_eq!(fragment.flags, UNFRAGMENTED);
                seen.push(fragment.payload.to_vec());
            },
            10
        );
        assert_eq!(delivered, 1);
        assert_eq!(seen, vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_large_message_is_fragmented() {
        let transport = LoopbackTransport::with_settings(8, DEFAULT_QUEUE_CAPACITY);
        let mut subscription = transport.add_subscription(&stream(), None, None).unwrap();
        let mut publication = transport.add_publication(&stream()).unwrap();

        let payload: Vec<u8> = (0..20u8).collect();
        assert!(publication.offer(&payload) >= 0);

        let mut flags_seen = Vec::new();
        let mut rebuilt = Vec::new();
        subscription.poll(
            &mut |fragment| {
                flags_seen.push(fragment.flags);
                rebuilt.extend_from_slice(fragment.payload);
            },
            10
        );
        assert_eq!(flags_seen, vec![BEGIN_FRAGMENT, 0, END_FRAGMENT]);
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_back_pressure_at_capacity() {
        let transport = LoopbackTransport::with_settings(DEFAULT_LOOPBACK_MTU, 2);
        let _subscription = transport.add_subscription(&stream(), None, None).unwrap();
        let mut publication = transport.add_publication(&stream()).unwrap();

        assert!(publication.offer(b"one") >= 0);
        assert!(publication.offer(b"two") >= 0);
        assert_eq!(publication.offer(b"three"), BACK_PRESSURED);
    }

    #[test]
    fn test_closed_publication() {
        let transport = LoopbackTransport::new();
        let _subscription = transport.add_subscription(&stream(), None, None).unwrap();
        let mut publication = transport.add_publication(&stream()).unwrap();
        publication.close();
        assert!(publication.is_closed());
        assert_eq!(publication.offer(b"late"), PUBLICATION_CLOSED);
    }

    #[test]
    fn test_single_subscriber_per_stream() {
        let transport = LoopbackTransport::new();
        let _first = transport.add_subscription(&stream(), None, None).unwrap();
        assert!(transport.add_subscription(&stream(), None, None).is_err());
    }

    #[test]
    fn test_image_notifications() {
        let transport = LoopbackTransport::new();
        let available = Arc::new(AtomicUsize::new(0));
        let unavailable = Arc::new(AtomicUsize::new(0));

        let on_available: ImageHandler = {
            let available = Arc::clone(&available);
            Arc::new(move |_image| {
                available.fetch_add(1, Ordering::SeqCst);
            })
        };
        let on_unavailable: ImageHandler = {
            let unavailable = Arc::clone(&unavailable);
            Arc::new(move |_image| {
                unavailable.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut subscription = transport
            .add_subscription(&stream(), Some(on_available), Some(on_unavailable))
            .unwrap();
        assert_eq!(available.load(Ordering::SeqCst), 1);
        assert_eq!(unavailable.load(Ordering::SeqCst), 0);

        subscription.close();
        subscription.close();
        assert_eq!(unavailable.load(Ordering::SeqCst), 1);
    }
}
