//! Fan-out / fan-in: square a stream of readings across sharded worker pools.
//!
//! Negative readings are rejected, and roughly one reading in twenty hangs
//! long enough to trip the per-item timeout. The run is bounded by a
//! supervisor budget, so a stuck reading can never stall the whole pipeline.

use std::time::Duration;

use fanweld::prelude::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const READINGS: u64 = 60;

/// Cheap deterministic mixing so the demo is reproducible without a RNG.
fn mix(id: u64) -> u64 {
    id.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) % 1000
}

fn reading(id: u64) -> i64 {
    (mix(id) % 100) as i64 - 10
}

async fn square(value: i64, ctx: ItemContext) -> StageResult<i64> {
    if value < 0 {
        return Err(StageError::rejected(format!("negative reading {}", value)));
    }

    let hangs = mix(ctx.item_id().0) % 20 == 0;
    let delay = if hangs {
        Duration::from_secs(5)
    } else {
        Duration::from_millis(100 + mix(ctx.item_id().0) % 500)
    };
    tokio::time::sleep(delay).await;

    Ok(value * value)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let results = CountSink::new();
    let mut pipeline = PipelineBuilder::new()
        .name("fan-in")
        .shards(2)
        .workers(4)
        .queue_capacity(8)
        .per_item_timeout(Duration::from_secs(1))
        .monitor_interval(Duration::from_secs(1))
        .stage("square", stage_fn(square))
        .stage_with(
            "report",
            MapStage::new(|squared: i64| Ok(format!("squared={}", squared))),
            StageOptions::new().workers(1),
        )
        .sink(results.clone())?;

    let errors = pipeline.errors();
    let items = (1..=READINGS).map(|id| WorkItem::new(id, reading(id)));

    let outcome = Supervisor::new(Duration::from_secs(20))
        .run(pipeline, items)
        .await;

    let records = errors.map(|mut stream| stream.drain()).unwrap_or_default();
    let stuck = records
        .iter()
        .filter(|record| record.kind == ErrorKind::Stuck)
        .count();
    for record in &records {
        tracing::debug!(%record, "pipeline error");
    }

    tracing::info!(
        succeeded = results.succeeded(),
        failed = results.failed(),
        stuck,
        "readings collected"
    );

    match outcome {
        Ok(stats) | Err(Error::PartialFailure { stats }) => {
            tracing::info!(%stats, "run complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "run did not complete");
            Err(e)
        }
    }
}
