//! Paced producer feeding a relay that fans out to two sinks.
//!
//! A producer thread acquires pooled buffers, stamps them, and pushes them
//! through an `ExternalSource` at a fixed frame rate. Pacing happens on the
//! producer's own thread, so sleeping between frames never stalls the worker
//! context. The relay forwards each frame to a "preview" and a "recording"
//! stand-in, which just log what they see and release.

use std::time::{Duration, Instant};

use framewire::prelude::*;

const FRAME_COUNT: u32 = 30;
const FRAME_PERIOD: Duration = Duration::from_millis(33);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,framewire=debug")),
        )
        .init();

    let ctx = ProcessingContext::new()?;

    let source = ctx.add_node(ExternalSource::with_replay())?;
    let relay = ctx.add_node(RelayNode::new())?;
    let preview = ctx.add_node(RelayNode::with_observer(|frame| {
        tracing::info!(
            buffer = ?frame.id(),
            timestamp_ns = frame.timestamp_ns(),
            "preview frame"
        );
    }))?;
    let recording = ctx.add_node(RelayNode::with_observer(|frame| {
        tracing::info!(buffer = ?frame.id(), "recording frame");
    }))?;

    let relay = ctx.chain(source, relay)?;
    ctx.chain(relay, preview)?;
    ctx.chain(relay, recording)?;

    // Producer thread: fixed-period pacing, skew-corrected against the
    // start instant so a slow frame doesn't shift the whole schedule.
    let producer_ctx = ctx.clone();
    let producer = std::thread::spawn(move || -> Result<()> {
        let descriptor = BufferDescriptor::new(640, 360);
        let start = Instant::now();
        for n in 0..FRAME_COUNT {
            let buffer = producer_ctx.acquire_buffer(&descriptor)?;
            buffer.set_timestamp_ns(start.elapsed().as_nanos() as i64);
            let _ = buffer.map_write(|px| px.fill((n % 0xff) as u8));
            producer_ctx.submit_frame(source, buffer)?;

            let next_deadline = start + FRAME_PERIOD * (n + 1);
            if let Some(wait) = next_deadline.checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }
        Ok(())
    });

    producer.join().expect("producer thread panicked")?;

    // Let the queue drain, then show what was built.
    let topology = ctx.topology()?;
    println!("{topology}");
    let stats = ctx.run_sync(|graph| graph.pool().stats())?;
    println!(
        "pool: {} bucket(s), {} idle, {} allocated over the run",
        stats.buckets, stats.idle_buffers, stats.total_allocated
    );

    ctx.shutdown();
    Ok(())
}
