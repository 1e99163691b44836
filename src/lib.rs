//! Relay - low-latency in-process message pipeline runtime
//!
//! Relay sits between a reliable, fragmented pub/sub transport and
//! user-defined service handlers. Records flow through a fixed chain of
//! lock-free SPSC ring buffers — ingress, optional replica, optional
//! journal, service, egress — with one dedicated busy-spinning worker
//! thread crossing each ring boundary. Backpressure is bounded rings plus
//! retrying writes; ordering is preserved per ingress stream end to end. A
//! hashed timing wheel injects periodic snapshot markers into the ingress
//! stream.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay::{
//!     LoopbackTransport, PipelineConfig, ServiceContext, ServicePipeline, StreamDef,
//! };
//!
//! let transport: Arc<dyn relay::Transport> = Arc::new(LoopbackTransport::new());
//! let mut pipeline = ServicePipeline::new(
//!     transport,
//!     PipelineConfig::default(),
//!     None,
//!     |context: &ServiceContext| {
//!         let responses = Arc::clone(&context.output_rings);
//!         move |msg_type_id: i32, payload: &[u8]| -> relay::Result<()> {
//!             if !relay::constants::is_administrative(msg_type_id) {
//!                 if let Some(ring) = responses.get(2001) {
//!                     while !ring.write(msg_type_id, payload)? {
//!                         std::hint::spin_loop();
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         }
//!     },
//! )?;
//!
//! pipeline.add_end_point(
//!     &StreamDef::new("loopback:requests", 1001),
//!     &StreamDef::new("loopback:responses", 2001),
//! )?;
//! pipeline.start()?;
//! # pipeline.close()?;
//! # Ok::<(), relay::RelayError>(())
//! ```

pub mod constants;
pub mod error;
pub mod idle;
pub mod message;
pub mod monitoring;
pub mod pipeline;
pub mod report;
pub mod ring;
pub mod stage;
pub mod timer;
pub mod transport;
pub mod worker;

// Re-export main components
pub use error::{ RelayError, Result };
pub use idle::{ IdleKind, IdleStrategy };
pub use monitoring::LatencyRecorder;
pub use pipeline::{ PipelineConfig, ServiceContext, ServicePipeline };
pub use report::{ RateReport, ReportSnapshot, ServiceReport };
pub use ring::{ RingBuffer, RingBufferPool };
pub use stage::{ FileJournal, Journal, JournalStrategy, ServiceHandler };
pub use timer::{ SnapshotTimer, TimerExecutor, TimingWheel };
pub use transport::{
    Fragment,
    FragmentAssembler,
    Image,
    ImageHandler,
    LoopbackTransport,
    Publication,
    StreamDef,
    Subscription,
    Transport,
};
pub use worker::{ StagePoller, Worker, WorkerCounters };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
