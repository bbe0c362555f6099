//! Terminal collector: turns the last queue into results.

use std::sync::Arc;

use crate::core::{Envelope, ItemResult, ResultSink};
use crate::diagnostics::{ErrorKind, ErrorRecord};
use crate::pipeline::RunContext;
use crate::queue::QueueReceiver;

/// Drain `input` into `sink` until the queue closes or the run is cancelled.
///
/// Every envelope counts as processed before it is handed to the sink, so a
/// failing sink never makes an item disappear from the statistics.
pub(crate) async fn collect<T, K>(input: QueueReceiver<Envelope<T>>, mut sink: K, run: RunContext)
where
    T: Send + 'static,
    K: ResultSink<T>,
{
    let cancel = run.cancel.clone();
    let sink_label: Arc<str> = Arc::from("sink");
    let mut drained = false;

    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = input.recv() => match next {
                Some(envelope) => envelope,
                None => {
                    drained = true;
                    break;
                }
            },
        };

        let result = ItemResult::from(envelope);
        let item_id = result.item_id();
        run.stats.record_result(result.succeeded());

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = sink.write(result) => written,
        };
        if let Err(e) = written {
            tracing::warn!(%item_id, error = %e, "result sink rejected a result");
            run.errors.report(ErrorRecord {
                item_id,
                stage: sink_label.clone(),
                kind: ErrorKind::Sink,
                detail: e.to_string(),
            });
        }
    }

    if !drained || cancel.is_cancelled() {
        run.stats.finish(false);
        tracing::debug!("collector stopped by cancellation");
        return;
    }

    if let Err(e) = sink.finish().await {
        tracing::warn!(error = %e, "result sink failed to finish");
    }

    let stats = run.stats.snapshot();
    run.stats.finish(stats.processed == stats.accepted);
    run.finished.cancel();
    tracing::debug!(processed = stats.processed, "collector drained");
}
