//! Transport contract consumed by the pipeline
//!
//! The underlying transport is an external collaborator: a reliable,
//! ordered, fragmented pub/sub channel addressed by (channel URI, stream
//! id). The pipeline only depends on the traits in this module. The
//! in-process [`loopback`] implementation backs the demo binary and the
//! end-to-end tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

pub mod loopback;

pub use loopback::LoopbackTransport;

/// Offer result: publication has no connected subscriber yet
pub const NOT_CONNECTED: i64 = -1;

/// Offer result: flow control window is full, retry later
pub const BACK_PRESSURED: i64 = -2;

/// Offer result: transport is performing internal housekeeping, retry later
pub const ADMIN_ACTION: i64 = -3;

/// Offer result: publication was closed, no retry will succeed
pub const PUBLICATION_CLOSED: i64 = -4;

/// Fragment flag: first fragment of a message
pub const BEGIN_FRAGMENT: u8 = 0b01;

/// Fragment flag: last fragment of a message
pub const END_FRAGMENT: u8 = 0b10;

/// Fragment flags of a message that was not split
pub const UNFRAGMENTED: u8 = BEGIN_FRAGMENT | END_FRAGMENT;

/// One direction of a unicast message path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamDef {
    /// Channel URI
    pub channel: String,
    /// Stream id within the channel
    pub stream_id: i32,
}

impl StreamDef {
    /// Create a stream definition
    pub fn new(channel: impl Into<String>, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            stream_id,
        }
    }
}

/// A live association with one remote producer
#[derive(Debug, Clone)]
pub struct Image {
    /// Session id of the remote producer
    pub session_id: i32,
    /// Channel the association arrived on
    pub channel: String,
    /// Stream id the association arrived on
    pub stream_id: i32,
}

/// Callback invoked when an association comes up or goes down
pub type ImageHandler = Arc<dyn Fn(&Image) + Send + Sync>;

/// One transport fragment; a message may span several
#[derive(Debug)]
pub struct Fragment<'a> {
    /// Session id of the producing endpoint
    pub session_id: i32,
    /// Begin/end flags
    pub flags: u8,
    /// Fragment bytes
    pub payload: &'a [u8],
}

/// Receiving side of one stream
pub trait Subscription: Send {
    /// Deliver up to `fragment_limit` fragments to the handler; returns the
    /// number of fragments delivered
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment<'_>), fragment_limit: usize) -> usize;

    /// Release the subscription
    fn close(&mut self);
}

/// Sending side of one stream
pub trait Publication: Send {
    /// Offer one message; non-negative is the publication position, negative
    /// is one of the result codes above
    fn offer(&mut self, payload: &[u8]) -> i64;

    /// True once the publication cannot accept further offers
    fn is_closed(&self) -> bool;

    /// Release the publication
    fn close(&mut self);
}

/// Factory for subscriptions and publications
pub trait Transport: Send + Sync {
    /// Add a subscription with optional association notifications
    fn add_subscription(
        &self,
        stream: &StreamDef,
        on_available: Option<ImageHandler>,
        on_unavailable: Option<ImageHandler>
    ) -> Result<Box<dyn Subscription>>;

    /// Add a publication
    fn add_publication(&self, stream: &StreamDef) -> Result<Box<dyn Publication>>;
}

/// Reassembles fragmented messages, keyed by session id
///
/// Each subscription owns its own assembler; fragment state is never shared
/// across subscriptions, so interleaved sessions on one stream cannot
/// corrupt each other's boundaries.
pub struct FragmentAssembler {
    builders: HashMap<i32, Vec<u8>>,
}

impl FragmentAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Feed one fragment; invokes the sink for every completed message
    pub fn on_fragment(&mut self, fragment: Fragment<'_>, sink: &mut dyn FnMut(&[u8])) {
        if fragment.flags & UNFRAGMENTED == UNFRAGMENTED {
            sink(fragment.payload);
            return;
        }

        if fragment.flags & BEGIN_FRAGMENT != 0 {
            let builder = self.builders.entry(fragment.session_id).or_default();
            builder.clear();
            builder.extend_from_slice(fragment.payload);
            return;
        }

        if fragment.flags & END_FRAGMENT != 0 {
            if let Some(mut builder) = self.builders.remove(&fragment.session_id) {
                builder.extend_from_slice(fragment.payload);
                sink(&builder);
            }
            return;
        }

        if let Some(builder) = self.builders.get_mut(&fragment.session_id) {
            builder.extend_from_slice(fragment.payload);
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}
