//! Helpers that drive runs and check committed state

use futures::StreamExt;
use stream_harvest::{
    CollectOptions, CollectedItem, Collector, Event, RunManifest, TargetId,
};

/// Collect one target in its own run, returning the yielded ids and the manifest
///
/// Panics if the stream ends with an error.
pub async fn collect_ids(
    collector: &Collector,
    target: &str,
    options: CollectOptions,
) -> (Vec<i64>, RunManifest) {
    let target = TargetId::from(target);
    let run = collector
        .begin_run(std::slice::from_ref(&target), options)
        .await
        .expect("Failed to begin run");

    let items: Vec<CollectedItem> = collector
        .collect(&run, target, options)
        .map(|result| result.expect("collection failed"))
        .collect()
        .await;

    let manifest = collector.finish_run(run).await.expect("Failed to finish run");
    (items.iter().map(|i| i.item_id).collect(), manifest)
}

/// Drain events already sitting in a subscription
pub fn drain_events(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

/// Assert the stored checkpoint of `target`
pub async fn assert_checkpoint(collector: &Collector, target: &str, expected: i64) {
    let checkpoint = collector
        .checkpoint(&TargetId::from(target))
        .await
        .expect("Failed to read checkpoint")
        .unwrap_or_else(|| panic!("no checkpoint for {}", target));
    assert_eq!(
        checkpoint.last_item_id, expected,
        "checkpoint of {} should be {}",
        target, expected
    );
}
