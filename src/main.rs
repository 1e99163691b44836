//! Echo pipeline demo
//!
//! Wires a complete service pipeline over the in-process loopback
//! transport, pumps timestamped records through it, and reports throughput
//! and end-to-end latency percentiles.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use relay::constants::is_administrative;
use relay::{
    LatencyRecorder,
    LoopbackTransport,
    PipelineConfig,
    ServiceContext,
    ServicePipeline,
    StreamDef,
    Subscription,
    Transport,
};

const REQUEST_STREAM_ID: i32 = 1001;
const RESPONSE_STREAM_ID: i32 = 2001;
const MESSAGE_COUNT: usize = 1_000_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Relay - in-process message pipeline demo");
    println!("========================================");

    let transport = Arc::new(LoopbackTransport::new());
    let request_stream = StreamDef::new("loopback:requests", REQUEST_STREAM_ID);
    let response_stream = StreamDef::new("loopback:responses", RESPONSE_STREAM_ID);

    // The demo drains responses itself, so subscribe before the pipeline
    // publishes anything.
    let mut responses = transport.add_subscription(&response_stream, None, None)?;

    let handler_factory = |context: &ServiceContext| {
        let output_rings = Arc::clone(&context.output_rings);
        move |msg_type_id: i32, payload: &[u8]| -> relay::Result<()> {
            if is_administrative(msg_type_id) {
                return Ok(());
            }
            let ring = output_rings
                .get(RESPONSE_STREAM_ID)
                .expect("response ring registered before start");
            while !ring.write(msg_type_id, payload)? {
                std::hint::spin_loop();
            }
            Ok(())
        }
    };

    let pipeline_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
    let mut pipeline = ServicePipeline::new(
        pipeline_transport,
        PipelineConfig::default(),
        None,
        handler_factory
    )?;
    pipeline.add_end_point(&request_stream, &response_stream)?;
    pipeline.start()?;

    let mut requests = transport.add_publication(&request_stream)?;
    let mut latency = LatencyRecorder::new();
    let epoch = Instant::now();

    println!("Pumping {} records through the echo pipeline...", MESSAGE_COUNT);
    let mut sent = 0usize;
    let mut received = 0usize;
    while received < MESSAGE_COUNT {
        if sent < MESSAGE_COUNT {
            let timestamp = epoch.elapsed().as_nanos() as u64;
            if requests.offer(&timestamp.to_le_bytes()) >= 0 {
                sent += 1;
            }
        }

        responses.poll(
            &mut |fragment| {
                let then = u64::from_le_bytes(
                    fragment.payload.try_into().expect("8-byte echo payload")
                );
                let now = epoch.elapsed().as_nanos() as u64;
                latency.record(now.saturating_sub(then));
                received += 1;
            },
            64
        );
    }

    let elapsed = epoch.elapsed();
    let throughput = (received as f64) / elapsed.as_secs_f64();

    println!("Results");
    println!("  records:    {}", received);
    println!("  elapsed:    {:.3} s", elapsed.as_secs_f64());
    println!("  throughput: {:.2} M records/s", throughput / 1_000_000.0);
    println!("  {}", latency.summary("latency"));

    for report in pipeline.report_list() {
        let snapshot = report.snapshot();
        println!(
            "  report {}: ingress {}/{} egress {}/{} (successful/failed reads)",
            report.label(),
            snapshot.ingress_successful,
            snapshot.ingress_failed,
            snapshot.egress_successful,
            snapshot.egress_failed
        );
    }

    pipeline.close()?;
    Ok(())
}
