/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use common::*;
use std::{collections::BTreeSet, time::Duration};
use vine_protocol::KIND_SHORT_VIDEO;
use vine_sync::{FeedState, Filter, SubscriptionItem, SubscriptionType, SyncCoordinator};

const WAIT: Duration = Duration::from_secs(5);

fn videos() -> Filter {
    Filter::new().kinds([KIND_SHORT_VIDEO])
}

fn ids(events: &[vine_sync::Event]) -> BTreeSet<String> {
    events.iter().map(|e| e.id.clone()).collect()
}

#[tokio::test]
async fn relay_backlog_then_live_delivery() {
    let relay = MockRelay::spawn(
        vec![video("a", "alice", 100), video("b", "bob", 200)],
        RelayOptions::default(),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    let expected: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    assert_eq!(ids(&events), expected);
    assert_eq!(feed.state(), FeedState::LiveStreaming);

    relay.publish(video("c", "carol", 300));
    let ev = next_event(&mut feed, WAIT).await.unwrap();
    assert_eq!(ev.id, "c");

    let stored = coord.query_local(vec![videos()]).await.unwrap();
    assert_eq!(
        stored.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        vec!["c", "b", "a"]
    );
    coord.shutdown();
}

#[tokio::test]
async fn backlog_completes_without_eose() {
    let relay = MockRelay::spawn(
        vec![video("a", "alice", 100)],
        RelayOptions {
            no_eose: true,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let started = std::time::Instant::now();
    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(events.len(), 1);
    coord.shutdown();
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let relay = MockRelay::spawn(
        vec![video("a", "alice", 100)],
        RelayOptions {
            garbage_before_events: true,
            ..Default::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    assert_eq!(events.len(), 1);

    let status = coord.relay_status();
    assert_eq!(status.len(), 1);
    assert!(status[0].metrics.frames_malformed >= 1);
    assert!(status[0].state.is_open());
    assert_eq!(relay.connections(), 1);
    coord.shutdown();
}

#[tokio::test]
async fn overlapping_relays_converge_to_local_query() {
    let r1 = MockRelay::spawn(
        vec![video("a", "alice", 100), video("b", "bob", 200)],
        RelayOptions::default(),
    )
    .await;
    let r2 = MockRelay::spawn(
        vec![video("b", "bob", 200), video("c", "carol", 300)],
        RelayOptions::default(),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&r1.url, &r2.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&r1.url, WAIT).await);
    assert!(coord.wait_relay_connected(&r2.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    assert_eq!(events.len(), 3, "each id is delivered once");

    let local = coord.query_local(vec![videos()]).await.unwrap();
    assert_eq!(ids(&events), ids(&local));

    // A later subscription with the same filter sees the same set.
    let mut again = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events2, _) = collect_backlog(&mut again, WAIT).await;
    assert_eq!(ids(&events2), ids(&local));
    assert_eq!(events2.len(), 3);
    coord.shutdown();
}

#[tokio::test]
async fn close_stops_delivery_and_sends_close() {
    let relay = MockRelay::spawn(vec![video("a", "alice", 100)], RelayOptions::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (_, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    let id = feed.id().to_string();

    feed.close();
    assert_eq!(feed.state(), FeedState::Closed);
    assert!(eventually(WAIT, || relay.closes().contains(&id)).await);

    relay.publish(video("late", "bob", 500));
    assert!(next_event(&mut feed, Duration::from_millis(300)).await.is_none());

    // Dropping the handle closes it too.
    let dropped = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let dropped_id = dropped.id().to_string();
    assert!(eventually(WAIT, || relay.reqs().iter().any(|(_, s)| *s == dropped_id)).await);
    drop(dropped);
    assert!(eventually(WAIT, || relay.closes().contains(&dropped_id)).await);
    coord.shutdown();
}

#[tokio::test]
async fn reconnect_reforwards_once_per_connection() {
    let relay = MockRelay::spawn(vec![video("a", "alice", 100)], RelayOptions::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, _) = collect_backlog(&mut feed, WAIT).await;
    assert_eq!(events.len(), 1);
    let id = feed.id().to_string();

    relay.kick();
    assert!(eventually(WAIT, || relay.reqs().iter().any(|(c, s)| *c == 2 && *s == id)).await);

    let reqs = relay.reqs();
    let unique: BTreeSet<_> = reqs.iter().cloned().collect();
    assert_eq!(unique.len(), reqs.len(), "no duplicate REQ on one connection");

    // The replayed backlog is not delivered twice.
    assert!(next_event(&mut feed, Duration::from_millis(300)).await.is_none());
    relay.publish(video("b", "bob", 200));
    assert_eq!(next_event(&mut feed, WAIT).await.unwrap().id, "b");

    let status = coord.relay_status();
    assert!(status[0].metrics.connects >= 2);
    coord.shutdown();
}

#[tokio::test]
async fn import_events_dedups_and_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[]), None)
        .await
        .unwrap();
    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();

    let a = video("a", "alice", 100);
    assert_eq!(coord.import_events(vec![a.clone(), a.clone()]).await, 1);
    assert_eq!(coord.import_events(vec![a.clone()]).await, 0);

    assert_eq!(next_event(&mut feed, WAIT).await.unwrap().id, "a");
    assert!(next_event(&mut feed, Duration::from_millis(700)).await.is_none());

    let m = coord.metrics_snapshot().await;
    assert_eq!(m.stored_total, Some(1));
    assert_eq!(m.events_imported, 1);
    coord.shutdown();
}

#[tokio::test]
async fn unusable_store_degrades_but_keeps_delivering() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let relay = MockRelay::spawn(vec![video("a", "alice", 100)], RelayOptions::default()).await;
    let coord = SyncCoordinator::start(test_config(&blocker, &[&relay.url]), None)
        .await
        .unwrap();
    assert!(coord.is_degraded());
    assert!(coord.wait_relay_connected(&relay.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, complete) = collect_backlog(&mut feed, WAIT).await;
    assert!(complete);
    assert_eq!(events.len(), 1);
    assert!(coord.query_local(vec![videos()]).await.is_err());
    coord.shutdown();
}

#[tokio::test]
async fn degraded_import_reports_nothing_stored() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let coord = SyncCoordinator::start(test_config(&blocker, &[]), None)
        .await
        .unwrap();
    assert!(coord.is_degraded());
    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();

    assert_eq!(coord.import_events(vec![video("a", "alice", 100)]).await, 0);
    assert_eq!(coord.import_events(vec![video("a", "alice", 100)]).await, 0);
    assert_eq!(next_event(&mut feed, WAIT).await.unwrap().id, "a");
    assert!(next_event(&mut feed, Duration::from_millis(300)).await.is_none());

    let metrics = coord.metrics_snapshot().await;
    assert_eq!(metrics.events_imported, 0);
    assert_eq!(metrics.events_stored, 0);
    coord.shutdown();
}

#[tokio::test]
async fn stalled_reader_keeps_newest_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &[]);
    cfg.registry.eose_timeout_ms = 50;
    cfg.registry.feed_buffer = 16;
    let coord = SyncCoordinator::start(cfg, None).await.unwrap();
    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    // No relays: the backlog marker arrives on the deadline.
    assert!(eventually(WAIT, || feed.buffered() == 1).await);

    let batch: Vec<_> = (0..40u64)
        .map(|i| video(&format!("v{i:02}"), "alice", 100 + i))
        .collect();
    assert_eq!(coord.import_events(batch).await, 40);
    assert_eq!(feed.buffered(), 16);

    let mut items = Vec::new();
    while let Some(item) = feed.try_recv() {
        items.push(item);
    }
    assert_eq!(items[0], SubscriptionItem::BacklogComplete);
    let kept: Vec<String> = items[1..]
        .iter()
        .map(|i| match i {
            SubscriptionItem::Event(ev) => ev.id.clone(),
            SubscriptionItem::BacklogComplete => "marker".to_string(),
        })
        .collect();
    let expected: Vec<String> = (25..40).map(|i| format!("v{i:02}")).collect();
    assert_eq!(kept, expected);
    assert_eq!(coord.metrics_snapshot().await.feed_events_dropped, 25);

    // Still live after the overflow.
    coord.import_events(vec![video("late", "bob", 500)]).await;
    assert_eq!(next_event(&mut feed, WAIT).await.unwrap().id, "late");
    coord.shutdown();
}

#[tokio::test]
async fn relay_removed_during_handshake_gets_no_req() {
    let relay = MockRelay::spawn(
        vec![video("a", "alice", 100)],
        RelayOptions {
            handshake_delay: Some(Duration::from_millis(400)),
            ..RelayOptions::default()
        },
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let coord = SyncCoordinator::start(test_config(dir.path(), &[]), None)
        .await
        .unwrap();
    let _feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();

    assert!(coord.add_relay(&relay.url).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(coord.remove_relay(&relay.url).await);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(relay.reqs().is_empty());
    assert!(coord.relay_urls().is_empty());
    coord.shutdown();
}

#[tokio::test]
async fn deprecated_relay_is_migrated_once() {
    let old = MockRelay::spawn(vec![], RelayOptions::default()).await;
    let new = MockRelay::spawn(vec![video("a", "alice", 100)], RelayOptions::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &[&old.url]);
    cfg.default_relay = new.url.clone();
    cfg.deprecated_relays = vec![old.url.clone()];

    let coord = SyncCoordinator::start(cfg.clone(), None).await.unwrap();
    assert_eq!(coord.relay_urls(), vec![new.url.clone()]);
    assert!(coord.wait_relay_connected(&new.url, WAIT).await);

    let mut feed = coord
        .subscribe(vec![videos()], SubscriptionType::HomeFeed)
        .await
        .unwrap();
    let (events, _) = collect_backlog(&mut feed, WAIT).await;
    assert_eq!(events.len(), 1);
    let id = feed.id().to_string();
    assert_eq!(new.reqs().iter().filter(|(_, s)| *s == id).count(), 1);
    assert_eq!(old.connections(), 0);

    // The user opts back into the old relay; the migration must not undo it.
    assert!(coord.add_relay(&old.url).await.unwrap());
    drop(feed);
    coord.shutdown();
    drop(coord);

    let coord = SyncCoordinator::start(cfg, None).await.unwrap();
    let urls: BTreeSet<String> = coord.relay_urls().into_iter().collect();
    let expected: BTreeSet<String> = [old.url.clone(), new.url.clone()].into_iter().collect();
    assert_eq!(urls, expected);
    coord.shutdown();
}
