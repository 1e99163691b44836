//! Pipeline assembly and lifecycle
//!
//! Wires the fixed stage chain — ingress, optional replica, optional
//! journal, service, egress — out of SPSC rings and worker threads, plus
//! the timer executor that drives the snapshot wheel. The pipeline owns
//! every ring, subscription, publication, worker and the wheel; each
//! resource is acquired during construction or registration and released
//! exactly once in `close`.
//!
//! `start` runs consumer-to-producer so no downstream stage starts after
//! work is admitted. `close` stops the timers first and then walks the
//! stages producer-to-consumer so each stage's drain target is still live
//! when its upstream shuts down. Both transitions happen at most once.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::constants::{
    DEFAULT_FRAME_COUNT_LIMIT,
    DEFAULT_NODE_ID,
    DEFAULT_RING_CAPACITY,
    DEFAULT_SNAPSHOT_INTERVAL,
    DEFAULT_TICKS_PER_WHEEL,
    DEFAULT_TICK_DURATION,
};
use crate::error::{ RelayError, Result };
use crate::idle::{ IdleKind, IdleStrategy };
use crate::message::{ MarkerQueue, LOAD_SNAPSHOT_TEMPLATE_ID };
use crate::report::{ RateReport, ServiceReport };
use crate::ring::{ RingBuffer, RingBufferPool };
use crate::stage::{
    EgressProducer,
    IngressConsumer,
    Journal,
    JournalStage,
    JournalStrategy,
    ReplicaStage,
    ServiceHandler,
    ServiceStage,
};
use crate::timer::{ SnapshotTimer, TimerExecutor, TimingWheel };
use crate::transport::{ Image, ImageHandler, StreamDef, Transport };
use crate::worker::{ Worker, WorkerCounters };

/// Pipeline configuration
///
/// The two booleans select which stages exist; everything else tunes the
/// rings, idle strategies and the snapshot timer.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Copy records to a replica stream before local processing
    pub replica_enabled: bool,
    /// Persist records through the journal writer before local processing
    pub journal_enabled: bool,
    /// Flush the journal once per consumed batch
    pub journal_flushing_enabled: bool,
    /// Write positioning used by a file journal built for this pipeline
    pub journal_strategy: JournalStrategy,
    /// Idle strategy of the ingress and service workers
    pub subscriber_idle: IdleKind,
    /// Idle strategy of the writing workers and of every write retry loop
    pub write_idle: IdleKind,
    /// Transport fragments consumed per ingress poll
    pub frame_count_limit: usize,
    /// Timing wheel tick duration
    pub tick_duration: Duration,
    /// Timing wheel spoke count (power of 2)
    pub ticks_per_wheel: usize,
    /// Capacity of the ingress and intermediate rings
    pub ring_capacity: usize,
    /// Capacity of response and event rings
    pub output_ring_capacity: usize,
    /// Interval between injected save-snapshot markers
    pub snapshot_interval: Duration,
    /// Node id stamped into administrative records
    pub node_id: u16,
    /// Replica stream, required when replication is enabled
    pub replica_stream: Option<StreamDef>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            replica_enabled: false,
            journal_enabled: false,
            journal_flushing_enabled: false,
            journal_strategy: JournalStrategy::Positional,
            subscriber_idle: IdleKind::BusySpin,
            write_idle: IdleKind::BusySpin,
            frame_count_limit: DEFAULT_FRAME_COUNT_LIMIT,
            tick_duration: DEFAULT_TICK_DURATION,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            ring_capacity: DEFAULT_RING_CAPACITY,
            output_ring_capacity: DEFAULT_RING_CAPACITY,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            node_id: DEFAULT_NODE_ID,
            replica_stream: None,
        }
    }
}

impl PipelineConfig {
    /// Enable replication onto the given stream
    pub fn with_replica(mut self, stream: StreamDef) -> Self {
        self.replica_enabled = true;
        self.replica_stream = Some(stream);
        self
    }

    /// Enable journaling
    pub fn with_journal(mut self, flushing_enabled: bool, strategy: JournalStrategy) -> Self {
        self.journal_enabled = true;
        self.journal_flushing_enabled = flushing_enabled;
        self.journal_strategy = strategy;
        self
    }

    /// Select the idle strategies
    pub fn with_idle_strategies(mut self, subscriber: IdleKind, write: IdleKind) -> Self {
        self.subscriber_idle = subscriber;
        self.write_idle = write;
        self
    }

    /// Set the ingress fragment limit
    pub fn with_frame_count_limit(mut self, limit: usize) -> Self {
        self.frame_count_limit = limit;
        self
    }

    /// Set the capacity of the ingress and intermediate rings
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    /// Set the capacity of response and event rings
    pub fn with_output_ring_capacity(mut self, capacity: usize) -> Self {
        self.output_ring_capacity = capacity;
        self
    }

    /// Set the timing wheel geometry
    pub fn with_timer(mut self, tick_duration: Duration, ticks_per_wheel: usize) -> Self {
        self.tick_duration = tick_duration;
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Set the snapshot interval
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Set the node id stamped into administrative records
    pub fn with_node_id(mut self, node_id: u16) -> Self {
        self.node_id = node_id;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.frame_count_limit == 0 {
            return Err(RelayError::config("frame count limit must be positive"));
        }
        if self.tick_duration.is_zero() {
            return Err(RelayError::config("tick duration must be positive"));
        }
        if !self.ticks_per_wheel.is_power_of_two() {
            return Err(RelayError::config("ticks per wheel must be a power of 2"));
        }
        if self.snapshot_interval.is_zero() {
            return Err(RelayError::config("snapshot interval must be positive"));
        }
        if self.replica_enabled && self.replica_stream.is_none() {
            return Err(RelayError::config("replica stream required when replication is enabled"));
        }
        Ok(())
    }
}

/// Ring pools handed to the handler factory before any endpoint exists
///
/// The pools are populated afterwards through `add_end_point` and
/// `add_event_channel`; handlers look rings up at call time, so the pool
/// stays the single source of truth.
pub struct ServiceContext {
    /// Response rings keyed by response stream id
    pub output_rings: Arc<RingBufferPool>,
    /// Event rings keyed by event stream id
    pub event_rings: Arc<RingBufferPool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Constructed,
    Started,
    Closed,
}

impl<H: ServiceHandler> std::fmt::Debug for ServicePipeline<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePipeline").finish()
    }
}

/// The composed stage graph for one service instance
pub struct ServicePipeline<H: ServiceHandler> {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,

    markers: Arc<MarkerQueue>,
    output_rings: Arc<RingBufferPool>,
    event_rings: Arc<RingBufferPool>,

    // Stages wired at construction and registration, consumed by start()
    ingress: Option<IngressConsumer>,
    replica: Option<ReplicaStage>,
    journal: Option<JournalStage>,
    service: Option<ServiceStage<H>>,
    output_producers: Vec<(String, EgressProducer, Arc<WorkerCounters>)>,
    event_producers: Vec<(String, EgressProducer, Arc<WorkerCounters>)>,

    ingress_counters: Arc<WorkerCounters>,

    ingress_worker: Option<Worker>,
    replica_worker: Option<Worker>,
    journal_worker: Option<Worker>,
    service_worker: Option<Worker>,
    output_workers: Vec<Worker>,
    event_workers: Vec<Worker>,

    timer: TimerExecutor,
    snapshot: SnapshotTimer,

    reports: Vec<Arc<ServiceReport>>,
    available_assoc: Arc<OnceCell<ImageHandler>>,
    unavailable_assoc: Arc<OnceCell<ImageHandler>>,

    state: PipelineState,
}

fn forwarding_handler(cell: &Arc<OnceCell<ImageHandler>>) -> ImageHandler {
    let cell = Arc::clone(cell);
    Arc::new(move |image: &Image| {
        if let Some(handler) = cell.get() {
            handler(image);
        }
    })
}

fn close_worker(slot: &mut Option<Worker>) {
    if let Some(worker) = slot {
        if let Err(err) = worker.close() {
            tracing::warn!(%err, "worker close failed");
        }
    }
}

impl<H: ServiceHandler> ServicePipeline<H> {
    /// Construct the pipeline
    ///
    /// The handler factory runs against the freshly created ring pools; the
    /// journal collaborator is required exactly when journaling is enabled.
    pub fn new<F>(
        transport: Arc<dyn Transport>,
        config: PipelineConfig,
        journal: Option<Box<dyn Journal>>,
        handler_factory: F
    ) -> Result<Self>
        where F: FnOnce(&ServiceContext) -> H
    {
        config.validate()?;

        let ingress_ring = Arc::new(RingBuffer::new(config.ring_capacity)?);
        let output_rings = Arc::new(RingBufferPool::new(config.output_ring_capacity));
        let event_rings = Arc::new(RingBufferPool::new(config.output_ring_capacity));

        let mut terminal = Arc::clone(&ingress_ring);

        let replica = if config.replica_enabled {
            let stream = config.replica_stream.as_ref().expect("validated above");
            let publication = transport.add_publication(stream)?;
            let out = Arc::new(RingBuffer::new(config.ring_capacity)?);
            let stage = ReplicaStage::new(
                Arc::clone(&terminal),
                publication,
                Arc::clone(&out),
                IdleStrategy::from_kind(config.write_idle)
            );
            terminal = out;
            Some(stage)
        } else {
            None
        };

        let journal_stage = if config.journal_enabled {
            let journal = journal.ok_or_else(||
                RelayError::usage("journal collaborator required when journaling is enabled")
            )?;
            let out = Arc::new(RingBuffer::new(config.ring_capacity)?);
            let stage = JournalStage::new(
                Arc::clone(&terminal),
                journal,
                Arc::clone(&out),
                IdleStrategy::from_kind(config.write_idle),
                config.journal_flushing_enabled
            );
            terminal = out;
            Some(stage)
        } else {
            if journal.is_some() {
                return Err(
                    RelayError::usage("journal collaborator supplied but journaling is disabled")
                );
            }
            None
        };

        let context = ServiceContext {
            output_rings: Arc::clone(&output_rings),
            event_rings: Arc::clone(&event_rings),
        };
        let service = ServiceStage::new(terminal, handler_factory(&context));

        let markers = Arc::new(MarkerQueue::new());
        let ingress = IngressConsumer::new(
            Arc::clone(&ingress_ring),
            Arc::clone(&markers),
            IdleStrategy::from_kind(config.write_idle),
            config.frame_count_limit
        );

        let wheel = Arc::new(
            Mutex::new(TimingWheel::new(config.tick_duration, config.ticks_per_wheel)?)
        );
        let timer = TimerExecutor::new(Arc::clone(&wheel));
        let snapshot = SnapshotTimer::new(
            wheel,
            Arc::clone(&markers),
            config.snapshot_interval,
            config.node_id
        );

        Ok(Self {
            config,
            transport,
            markers,
            output_rings,
            event_rings,
            ingress: Some(ingress),
            replica,
            journal: journal_stage,
            service: Some(service),
            output_producers: Vec::new(),
            event_producers: Vec::new(),
            ingress_counters: Arc::new(WorkerCounters::new()),
            ingress_worker: None,
            replica_worker: None,
            journal_worker: None,
            service_worker: None,
            output_workers: Vec::new(),
            event_workers: Vec::new(),
            timer,
            snapshot,
            reports: Vec::new(),
            available_assoc: Arc::new(OnceCell::new()),
            unavailable_assoc: Arc::new(OnceCell::new()),
            state: PipelineState::Constructed,
        })
    }

    /// Register a request/response endpoint
    ///
    /// Subscribes the ingress consumer to the request stream, binds a new
    /// output ring to a publication on the response stream, and records a
    /// `ServiceReport` pairing the ingress counters with the new egress
    /// counters.
    pub fn add_end_point(&mut self, request: &StreamDef, response: &StreamDef) -> Result<&mut Self> {
        self.ensure_constructed("add_end_point")?;

        let subscription = self.transport.add_subscription(
            request,
            Some(forwarding_handler(&self.available_assoc)),
            Some(forwarding_handler(&self.unavailable_assoc))
        )?;
        self.ingress
            .as_mut()
            .expect("ingress consumer present before start")
            .add_subscription(subscription);

        let ring = self.output_rings.register(response.stream_id)?;
        let publication = self.transport.add_publication(response)?;
        let counters = Arc::new(WorkerCounters::new());
        let producer = EgressProducer::new(
            ring,
            publication,
            IdleStrategy::from_kind(self.config.write_idle)
        );

        let report = ServiceReport::new(
            format!("{}:{}", response.channel, response.stream_id),
            Arc::clone(&self.ingress_counters),
            Arc::clone(&counters)
        )?;
        self.reports.push(Arc::new(report));
        self.output_producers.push((
            format!("relay-egress-{}", response.stream_id),
            producer,
            counters,
        ));
        Ok(self)
    }

    /// Register an event channel
    pub fn add_event_channel(&mut self, event: &StreamDef) -> Result<&mut Self> {
        self.ensure_constructed("add_event_channel")?;

        let ring = self.event_rings.register(event.stream_id)?;
        let publication = self.transport.add_publication(event)?;
        let counters = Arc::new(WorkerCounters::new());
        let producer = EgressProducer::new(
            ring,
            publication,
            IdleStrategy::from_kind(self.config.write_idle)
        );
        self.event_producers.push((
            format!("relay-events-{}", event.stream_id),
            producer,
            counters,
        ));
        Ok(self)
    }

    /// Set the handler notified when an association comes up; set once
    pub fn available_association_handler(&mut self, handler: ImageHandler) -> Result<&mut Self> {
        self.ensure_constructed("available_association_handler")?;
        self.available_assoc
            .set(handler)
            .map_err(|_| RelayError::usage("available association handler already set"))?;
        Ok(self)
    }

    /// Set the handler notified when an association goes down; set once
    pub fn unavailable_association_handler(&mut self, handler: ImageHandler) -> Result<&mut Self> {
        self.ensure_constructed("unavailable_association_handler")?;
        self.unavailable_assoc
            .set(handler)
            .map_err(|_| RelayError::usage("unavailable association handler already set"))?;
        Ok(self)
    }

    /// The user handler, accessible until the pipeline is started
    pub fn handler(&self) -> Option<&H> {
        self.service.as_ref().map(ServiceStage::handler)
    }

    /// Reports recorded by endpoint registration
    pub fn report_list(&self) -> Vec<Arc<dyn RateReport>> {
        self.reports
            .iter()
            .map(|report| Arc::clone(report) as Arc<dyn RateReport>)
            .collect()
    }

    /// Start every stage, the timer thread and the snapshot timer
    pub fn start(&mut self) -> Result<()> {
        self.ensure_constructed("start")?;

        let subscriber_idle = self.config.subscriber_idle;
        let write_idle = self.config.write_idle;

        let service = self.service.take().expect("service stage present before start");
        let mut worker = Worker::new(
            "relay-service",
            Box::new(service),
            IdleStrategy::from_kind(subscriber_idle),
            Arc::new(WorkerCounters::new())
        );
        worker.start()?;
        self.service_worker = Some(worker);

        if let Some(journal) = self.journal.take() {
            let mut worker = Worker::new(
                "relay-journal",
                Box::new(journal),
                IdleStrategy::from_kind(write_idle),
                Arc::new(WorkerCounters::new())
            );
            worker.start()?;
            self.journal_worker = Some(worker);
        }

        if let Some(replica) = self.replica.take() {
            let mut worker = Worker::new(
                "relay-replica",
                Box::new(replica),
                IdleStrategy::from_kind(write_idle),
                Arc::new(WorkerCounters::new())
            );
            worker.start()?;
            self.replica_worker = Some(worker);
        }

        for (name, producer, counters) in self.output_producers.drain(..) {
            let mut worker = Worker::new(
                name,
                Box::new(producer),
                IdleStrategy::from_kind(write_idle),
                counters
            );
            worker.start()?;
            self.output_workers.push(worker);
        }

        for (name, producer, counters) in self.event_producers.drain(..) {
            let mut worker = Worker::new(
                name,
                Box::new(producer),
                IdleStrategy::from_kind(write_idle),
                counters
            );
            worker.start()?;
            self.event_workers.push(worker);
        }

        // Queued before the ingress worker launches, so the load marker is
        // the first record admitted to the pipeline.
        self.markers.enqueue(LOAD_SNAPSHOT_TEMPLATE_ID, self.config.node_id);

        let ingress = self.ingress.take().expect("ingress consumer present before start");
        let mut worker = Worker::new(
            "relay-ingress",
            Box::new(ingress),
            IdleStrategy::from_kind(subscriber_idle),
            Arc::clone(&self.ingress_counters)
        );
        worker.start()?;
        self.ingress_worker = Some(worker);

        self.timer.start()?;
        self.snapshot.start()?;

        self.state = PipelineState::Started;
        Ok(())
    }

    /// Stop the timers, close every stage and join every worker
    ///
    /// Quiet on shutdown-time failures; a second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Constructed => {
                return Err(RelayError::usage("pipeline closed before start"));
            }
            PipelineState::Closed => {
                return Ok(());
            }
            PipelineState::Started => {}
        }

        self.snapshot.stop();
        self.timer.stop();

        close_worker(&mut self.ingress_worker);
        close_worker(&mut self.replica_worker);
        close_worker(&mut self.journal_worker);
        close_worker(&mut self.service_worker);
        for worker in self.output_workers.iter_mut() {
            if let Err(err) = worker.close() {
                tracing::warn!(%err, "egress worker close failed");
            }
        }
        for worker in self.event_workers.iter_mut() {
            if let Err(err) = worker.close() {
                tracing::warn!(%err, "event worker close failed");
            }
        }

        self.state = PipelineState::Closed;
        Ok(())
    }

    fn ensure_constructed(&self, operation: &str) -> Result<()> {
        if self.state == PipelineState::Constructed {
            Ok(())
        } else {
            Err(RelayError::usage(format!("{} requires an unstarted pipeline", operation)))
        }
    }
}

impl<H: ServiceHandler> Drop for ServicePipeline<H> {
    fn drop(&mut self) {
        if self.state == PipelineState::Started {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn echo_noop(_context: &ServiceContext) -> impl ServiceHandler {
        |_msg_type_id: i32, _payload: &[u8]| -> Result<()> { Ok(()) }
    }

    fn pipeline() -> ServicePipeline<impl ServiceHandler> {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        ServicePipeline::new(transport, PipelineConfig::default(), None, echo_noop).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut pipeline = pipeline();
        pipeline
            .add_end_point(
                &StreamDef::new("loopback:req", 1),
                &StreamDef::new("loopback:rsp", 2)
            )
            .unwrap();
        assert_eq!(pipeline.report_list().len(), 1);

        pipeline.start().unwrap();
        pipeline.close().unwrap();
        pipeline.close().unwrap();
    }

    #[test]
    fn test_close_before_start_is_usage_error() {
        let mut pipeline = pipeline();
        assert!(pipeline.close().unwrap_err().is_usage());
    }

    #[test]
    fn test_double_start_is_usage_error() {
        let mut pipeline = pipeline();
        pipeline.start().unwrap();
        assert!(pipeline.start().unwrap_err().is_usage());
        pipeline.close().unwrap();
    }

    #[test]
    fn test_registration_after_start_is_usage_error() {
        let mut pipeline = pipeline();
        pipeline.start().unwrap();
        let err = pipeline
            .add_end_point(
                &StreamDef::new("loopback:req", 1),
                &StreamDef::new("loopback:rsp", 2)
            )
            .unwrap_err();
        assert!(err.is_usage());
        assert!(pipeline.add_event_channel(&StreamDef::new("loopback:evt", 3)).is_err());
        pipeline.close().unwrap();
    }

    #[test]
    fn test_association_handler_set_once() {
        let mut pipeline = pipeline();
        let handler: ImageHandler = Arc::new(|_image: &Image| {});
        pipeline.available_association_handler(Arc::clone(&handler)).unwrap();
        assert!(pipeline.available_association_handler(handler).unwrap_err().is_usage());
    }

    #[test]
    fn test_journal_collaborator_must_match_configuration() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let config = PipelineConfig::default().with_journal(false, JournalStrategy::Seek);
        assert!(
            ServicePipeline::new(Arc::clone(&transport), config, None, echo_noop)
                .err()
                .map(|err| err.is_usage())
                .unwrap_or(false)
        );
    }

    #[test]
    fn test_replica_requires_stream() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let mut config = PipelineConfig::default();
        config.replica_enabled = true;
        assert!(ServicePipeline::new(transport, config, None, echo_noop).is_err());
    }

    #[test]
    fn test_handler_accessible_until_start() {
        let mut pipeline = pipeline();
        assert!(pipeline.handler().is_some());
        pipeline.start().unwrap();
        assert!(pipeline.handler().is_none());
        pipeline.close().unwrap();
    }
}
