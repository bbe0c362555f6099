//! Order processing: validate, process and ship orders through three stages.
//!
//! Orders without lines are rejected by the validator and show up as failed
//! results; everything else is shipped.
//!
//! Run with `RUST_LOG=debug cargo run --example orders` for per-worker logs.

use std::time::Duration;

use fanweld::prelude::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone)]
struct Order {
    lines: Vec<String>,
}

#[derive(Debug)]
struct ProcessedOrder {
    lines: usize,
    processed_by: String,
}

fn generate_orders(count: u64) -> Vec<WorkItem<Order>> {
    (1..=count)
        .map(|id| {
            // Deterministic spread: every fifth order has no lines.
            let lines = (0..(id * 7) % 5).map(|j| format!("item-{}", j + 1)).collect();
            let priority = ((id * 3) % 5 + 1) as i32;
            WorkItem::new(id, Order { lines }).with_priority(priority)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = PipelineConfig {
        stage_count: Some(3),
        workers_per_stage: vec![1, 2, 1],
        queue_capacity: vec![4, 4, 4, 16],
        per_item_timeout: Some(Duration::from_secs(2)),
        global_timeout: Some(Duration::from_secs(30)),
        monitor_interval: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let shipped = CollectSink::new();
    let mut pipeline = PipelineBuilder::with_config(config)
        .name("orders")
        .stage(
            "validate",
            stage_fn(|order: Order, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if order.lines.is_empty() {
                    return Err(StageError::rejected("no items"));
                }
                Ok(order)
            }),
        )
        .stage(
            "process",
            stage_fn(|order: Order, ctx: ItemContext| async move {
                let priority = u64::try_from(ctx.priority().unwrap_or(1)).unwrap_or(1);
                tokio::time::sleep(Duration::from_millis(500 - priority * 80)).await;
                Ok(ProcessedOrder {
                    lines: order.lines.len(),
                    processed_by: ctx.worker().to_string(),
                })
            }),
        )
        .stage(
            "ship",
            stage_fn(|order: ProcessedOrder, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(format!(
                    "{} lines (processed by {})",
                    order.lines, order.processed_by
                ))
            }),
        )
        .sink(shipped.clone())?;

    let errors = pipeline.errors();

    let supervisor = Supervisor::new(Duration::from_secs(30));
    let outcome = supervisor.run(pipeline, generate_orders(15)).await;

    for record in errors.map(|mut stream| stream.drain()).unwrap_or_default() {
        tracing::warn!(%record, "pipeline error");
    }

    for result in shipped.into_items().await {
        match result.into_outcome() {
            Ok(summary) => tracing::info!("shipped: {}", summary),
            Err(failure) => tracing::info!("not shipped: {}", failure),
        }
    }

    match outcome {
        Ok(stats) => tracing::info!(%stats, "all orders shipped"),
        Err(Error::PartialFailure { stats }) => {
            tracing::info!(%stats, "some orders were rejected")
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
