//! Publishing against an in-memory relay network.

mod common;

use async_trait::async_trait;
use common::{event, init_tracing, set, urls};
use nostr::{Event, EventTemplate};
use nostr_sync::{
    AckPolicy, DerivedState, MemoryNetwork, MemoryRelay, Outbox, ProjectionPipeline, PublishConfig,
    PublishOptions, PublishProgress, Publisher, Signer, StaticRelayHints, SyncError,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn pipeline() -> Arc<ProjectionPipeline> {
    Arc::new(ProjectionPipeline::new(Arc::new(DerivedState::default()), 500))
}

fn assert_consistent(progress: &PublishProgress) {
    let completed: BTreeSet<String> = progress
        .succeeded
        .iter()
        .chain(&progress.failed)
        .chain(&progress.timeouts)
        .cloned()
        .collect();
    assert_eq!(progress.completed, completed);
    let pending: BTreeSet<String> = progress
        .attempted
        .difference(&progress.completed)
        .cloned()
        .collect();
    assert_eq!(progress.pending, pending);
}

fn three_relays() -> MemoryNetwork {
    MemoryNetwork::new()
        .with_relay(
            "wss://a",
            MemoryRelay::new().with_ack(AckPolicy::Accept {
                delay: Duration::from_millis(100),
            }),
        )
        .with_relay(
            "wss://b",
            MemoryRelay::new().with_ack(AckPolicy::Reject {
                delay: Duration::from_millis(200),
                message: "blocked: spam".to_string(),
            }),
        )
        .with_relay("wss://c", MemoryRelay::new().with_ack(AckPolicy::Silent))
}

#[tokio::test(start_paused = true)]
async fn silent_relay_times_out() -> nostr_sync::Result<()> {
    init_tracing();
    let network = three_relays();
    let pipeline = pipeline();
    let publisher = Publisher::new(
        event("ev", "me", 1, 1, &[]),
        Arc::new(network.clone()),
        Arc::clone(&pipeline),
    )?;

    let started = Instant::now();
    let handle = publisher.publish(
        &urls(&["wss://a", "wss://b", "wss://c"]),
        PublishOptions::with_timeout(Duration::from_millis(1_000)),
    );
    let mut updates = handle.subscribe();

    let initial = handle.progress();
    assert_eq!(initial.pending, set(&["wss://a", "wss://b", "wss://c"]));
    assert!(initial.completed.is_empty());
    assert_eq!(pipeline.queue().len(), 1);

    let result = handle.result().await?;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(1_000));
    assert!(waited < Duration::from_millis(1_100));

    assert_eq!(result.succeeded, set(&["wss://a"]));
    assert_eq!(result.failed, set(&["wss://b"]));
    assert_eq!(result.timeouts, set(&["wss://c"]));
    assert!(result.pending.is_empty());
    assert!(result.event.seen_on.contains("wss://a"));
    assert_consistent(&result);

    let mut snapshots = Vec::new();
    while let Ok(snapshot) = updates.try_recv() {
        assert_consistent(&snapshot);
        snapshots.push(snapshot);
    }
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots.last(), Some(&result));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn resolves_once_and_ignores_late_acks() -> nostr_sync::Result<()> {
    init_tracing();
    let network = MemoryNetwork::new().with_relay(
        "wss://slow",
        MemoryRelay::new().with_ack(AckPolicy::Accept {
            delay: Duration::from_secs(2),
        }),
    );
    let publisher = Publisher::new(event("ev", "me", 1, 1, &[]), Arc::new(network), pipeline())?;
    let handle = publisher.publish(
        &urls(&["wss://slow"]),
        PublishOptions::with_timeout(Duration::from_secs(1)),
    );

    let result = handle.result().await?;
    assert_eq!(result.timeouts, set(&["wss://slow"]));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(handle.progress(), result);
    assert_eq!(handle.result().await?, result);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_relays_fail_without_waiting() -> nostr_sync::Result<()> {
    let network = MemoryNetwork::new().with_relay(
        "wss://down",
        MemoryRelay::new().with_ack(AckPolicy::Fail {
            delay: Duration::from_millis(5),
        }),
    );
    let publisher = Publisher::new(event("ev", "me", 1, 1, &[]), Arc::new(network), pipeline())?;

    let started = Instant::now();
    let result = publisher
        .publish(&urls(&["wss://down", "wss://unknown"]), PublishOptions::default())
        .result()
        .await?;

    assert_eq!(result.failed, set(&["wss://down", "wss://unknown"]));
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_relays_resolves_immediately() -> nostr_sync::Result<()> {
    let publisher = Publisher::new(
        event("ev", "me", 1, 1, &[]),
        Arc::new(MemoryNetwork::new()),
        pipeline(),
    )?;
    let handle = publisher.publish(&[], PublishOptions::default());

    assert!(handle.is_resolved());
    assert!(handle.result().await?.attempted.is_empty());
    Ok(())
}

#[test]
fn wrapped_events_are_unpublishable() {
    let mut rumor = event("rumor", "me", 14, 1, &[]);
    rumor.wrapper = Some("wrap".to_string());

    let result = Publisher::new(rumor, Arc::new(MemoryNetwork::new()), pipeline());
    assert!(matches!(result, Err(SyncError::Unpublishable(id)) if id == "rumor"));
}

struct CountingSigner {
    signed: AtomicUsize,
}

#[async_trait]
impl Signer for CountingSigner {
    async fn sign(&self, template: EventTemplate) -> nostr_sync::Result<Event> {
        let n = self.signed.fetch_add(1, Ordering::SeqCst);
        let id = format!("signed-{n}");
        let mut signed = event(&id, "me", template.kind, template.created_at, &[]);
        signed.tags = template.tags;
        signed.content = template.content;
        Ok(signed)
    }
}

#[tokio::test(start_paused = true)]
async fn create_and_publish_signs_and_uses_hints() -> nostr_sync::Result<()> {
    init_tracing();
    let network = MemoryNetwork::new().with_relay("wss://outbox", MemoryRelay::new());
    let signer = Arc::new(CountingSigner {
        signed: AtomicUsize::new(0),
    });
    let outbox = Outbox::new(
        Arc::new(network.clone()),
        pipeline(),
        Arc::new(StaticRelayHints::new(urls(&["wss://outbox"]))),
        PublishConfig::default(),
    )
    .with_signer(signer.clone());

    let handle = outbox
        .create_and_publish(
            1,
            "hello #Nostr and #nostr",
            vec![vec!["t".to_string(), "nostr".to_string()]],
            None,
        )
        .await?;
    let result = handle.result().await?;

    assert_eq!(result.succeeded, set(&["wss://outbox"]));
    assert_eq!(signer.signed.load(Ordering::SeqCst), 1);

    let published = network.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.tags, vec![vec!["t".to_string(), "nostr".to_string()]]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn templates_need_a_signer() {
    let outbox = Outbox::new(
        Arc::new(MemoryNetwork::new()),
        pipeline(),
        Arc::new(StaticRelayHints::default()),
        PublishConfig::default(),
    );

    let result = outbox.publish_template(EventTemplate::new(1, 1, "hi"), None).await;
    assert!(matches!(result, Err(SyncError::Signer(_))));
}
