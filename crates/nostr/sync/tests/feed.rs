//! Feed loading against an in-memory relay network.

mod common;

use common::{event, init_tracing, note, now, reply, urls};
use nostr::Filter;
use nostr_sync::{
    DerivedState, FeedConfig, FeedLoader, FeedOptions, MemoryNetwork, MemoryRelay, MuteList,
    ProjectionPipeline,
};
use std::sync::Arc;
use std::time::Duration;

const DAY: u64 = 24 * 60 * 60;

fn start(network: &MemoryNetwork, derived: &Arc<DerivedState>, options: FeedOptions) -> FeedLoader {
    FeedLoader::new(
        options,
        Arc::new(network.clone()),
        Arc::new(ProjectionPipeline::new(Arc::clone(derived), 500)),
        FeedConfig::default(),
    )
}

fn ids(feed: &FeedLoader) -> Vec<String> {
    feed.notes().into_iter().map(|note| note.event.id).collect()
}

#[tokio::test(start_paused = true)]
async fn pages_merge_relays_newest_first() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new()
        .with_relay(
            "wss://a",
            MemoryRelay::new().with_events([note("a1", now - 10), note("shared", now - 30)]),
        )
        .with_relay(
            "wss://b",
            MemoryRelay::new().with_events([note("b1", now - 20), note("shared", now - 30)]),
        );
    let derived = Arc::new(DerivedState::default());
    let feed = start(
        &network,
        &derived,
        FeedOptions::new(urls(&["wss://a", "wss://b"]), vec![Filter::new().kinds([1])]),
    );

    feed.ready().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    feed.load(10).await;
    assert_eq!(ids(&feed), vec!["a1", "b1", "shared"]);

    let shared = feed
        .notes()
        .into_iter()
        .find(|note| note.event.id == "shared")
        .map(|note| note.event.seen_on);
    assert_eq!(shared.map(|seen| seen.len()), Some(2));

    feed.load(10).await;
    assert_eq!(ids(&feed).len(), 3);
    feed.stop();
}

#[tokio::test(start_paused = true)]
async fn tombstoned_and_muted_events_are_discarded() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new().with_relay(
        "wss://a",
        MemoryRelay::new().with_events([
            note("deleted", now - 10),
            note("kept", now - 20),
            event("muted", "troll", 1, now - 30, &[]),
            note("other", now - 40),
        ]),
    );
    let derived = Arc::new(DerivedState::default());
    derived.add_tombstones(["deleted".to_string()]);
    derived.set_mutes(MuteList::new().mute_pubkey("troll"));

    let feed = start(
        &network,
        &derived,
        FeedOptions::new(urls(&["wss://a"]), vec![Filter::new().kinds([1])]),
    );
    feed.load(10).await;

    assert_eq!(ids(&feed), vec!["kept", "other"]);
    feed.stop();
}

#[tokio::test(start_paused = true)]
async fn newest_address_version_wins_across_relays() {
    init_tracing();
    let now = now();
    let article =
        |id: &str, created_at: u64| event(id, "alice", 30_023, created_at, &[&["d", "post"]]);
    let network = MemoryNetwork::new()
        .with_relay("wss://stale", MemoryRelay::new().with_events([article("v1", now - 50)]))
        .with_relay("wss://fresh", MemoryRelay::new().with_events([article("v2", now - 10)]));
    let derived = Arc::new(DerivedState::default());
    let feed = start(
        &network,
        &derived,
        FeedOptions::new(
            urls(&["wss://stale", "wss://fresh"]),
            vec![Filter::new().kinds([30_023])],
        ),
    );

    feed.load(10).await;
    assert_eq!(ids(&feed), vec!["v2"]);

    feed.add_to_feed(vec![article("v0", now - 100)], true);
    assert_eq!(ids(&feed), vec!["v2"]);
    feed.stop();
}

#[tokio::test(start_paused = true)]
async fn orphans_wait_for_their_parent() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new().with_relay(
        "wss://a",
        MemoryRelay::new()
            .with_events([note("parent", now - 2 * DAY), reply("child", "parent", now - 10)]),
    );
    let derived = Arc::new(DerivedState::default());
    let mut options = FeedOptions::new(urls(&["wss://a"]), vec![Filter::new().kinds([1])]);
    options.should_load_parents = true;
    let feed = start(&network, &derived, options);

    feed.load(10).await;
    assert!(feed.notes().is_empty());
    assert_eq!(feed.deferred_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let notes = feed.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].event.id, "parent");
    assert_eq!(notes[0].thread_ids(), vec!["parent".to_string(), "child".to_string()]);
    assert_eq!(feed.deferred_count(), 0);
    feed.stop();
}

#[tokio::test(start_paused = true)]
async fn ancient_events_are_held_back() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new().with_relay(
        "wss://sloppy",
        MemoryRelay::new()
            .with_events([note("recent", now - 60), note("ancient", now - 30 * DAY)])
            .ignoring_time_bounds(),
    );
    let derived = Arc::new(DerivedState::default());
    let feed = start(
        &network,
        &derived,
        FeedOptions::new(
            urls(&["wss://sloppy"]),
            vec![Filter::new().kinds([1]).since(now - 7 * DAY)],
        ),
    );

    feed.load(10).await;
    assert_eq!(ids(&feed), vec!["recent"]);
    assert_eq!(feed.deferred_count(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ids(&feed), vec!["recent", "ancient"]);
}

#[tokio::test(start_paused = true)]
async fn live_events_are_prepended_or_buffered() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new().with_relay(
        "wss://a",
        MemoryRelay::new().with_events([note("old", now - 100)]),
    );
    let derived = Arc::new(DerivedState::default());

    let mut options = FeedOptions::new(urls(&["wss://a"]), vec![Filter::new().kinds([1])]);
    options.should_listen = true;
    let live = start(&network, &derived, options.clone());

    options.should_buffer = true;
    let buffered = start(&network, &derived, options);

    live.load(10).await;
    buffered.load(10).await;

    network.inject("wss://a", note("fresh", now + 1));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(ids(&live), vec!["fresh", "old"]);
    assert_eq!(ids(&buffered), vec!["old"]);
    assert_eq!(buffered.buffered().len(), 1);

    buffered.load_buffer();
    assert_eq!(ids(&buffered), vec!["fresh", "old"]);
    assert!(buffered.buffered().is_empty());

    live.stop();
    buffered.stop();
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_freezes_the_feed() {
    init_tracing();
    let now = now();
    let network = MemoryNetwork::new().with_relay("wss://a", MemoryRelay::new());
    let derived = Arc::new(DerivedState::default());
    let mut options = FeedOptions::new(urls(&["wss://a"]), vec![Filter::new().kinds([1])]);
    options.should_listen = true;
    let feed = start(&network, &derived, options);
    let mut updates = feed.subscribe();

    feed.load(10).await;
    network.inject("wss://a", note("before", now + 1));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ids(&feed), vec!["before"]);
    assert!(updates.has_changed().unwrap_or(false));
    updates.mark_unchanged();

    feed.stop();
    feed.stop();
    assert!(feed.is_stopped());
    assert_eq!(network.open_live_subscriptions(), 0);

    network.inject("wss://a", note("after", now + 2));
    tokio::time::sleep(Duration::from_millis(500)).await;
    feed.load(10).await;
    feed.add_to_feed(vec![note("manual", now + 3)], true);

    assert_eq!(ids(&feed), vec!["before"]);
    assert!(!updates.has_changed().unwrap_or(true));
}

#[tokio::test(start_paused = true)]
async fn community_feeds_mute_mentions_strictly() {
    init_tracing();
    let now = now();
    let community = "34550:owner:rust";
    let network = MemoryNetwork::new().with_relay(
        "wss://a",
        MemoryRelay::new().with_events([
            event("mentions-troll", "carol", 1, now - 10, &[&["a", community], &["p", "troll"]]),
            event("plain", "dave", 1, now - 20, &[&["a", community]]),
        ]),
    );
    let derived = Arc::new(DerivedState::default());
    derived.set_mutes(MuteList::new().mute_pubkey("troll"));

    let feed = start(
        &network,
        &derived,
        FeedOptions::new(
            urls(&["wss://a"]),
            vec![Filter::new().kinds([1]).tag("a", [community])],
        ),
    );
    feed.load(10).await;

    assert_eq!(ids(&feed), vec!["plain"]);
    feed.stop();
}
