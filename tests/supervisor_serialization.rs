//! Supervisor serialization properties.
//!
//! The supervisor's contract is less about what one call does and more
//! about what many overlapping calls cannot do: overlap engine work,
//! leak a failed transition's lock, or show a later caller anything but
//! the state its predecessors left behind. These tests hammer one
//! supervisor from many tasks and assert those properties via the stub
//! instrumentation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use gateward::testing::{StubFetch, StubHost, StubProcess, TestHarness};

// ── Mutual exclusion ───────────────────────────────────────────────────────

/// Many concurrent ensures against a healthy gateway collapse into one
/// probing pass; every later caller is served from the cache the first
/// one filled.
#[tokio::test]
async fn concurrent_ensures_probe_once() {
    let host = StubHost::new();
    host.push_find(Some(Arc::new(StubProcess::new("live-1"))));
    let harness = TestHarness::builder()
        .host(host)
        .fetch(StubFetch::healthy().with_delay(Duration::from_millis(20)))
        .build();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = Arc::clone(&harness.supervisor);
            tokio::spawn(async move { supervisor.ensure().await })
        })
        .collect();

    for joined in join_all(tasks).await {
        let snapshot = joined
            .expect("task must not panic")
            .expect("every ensure must succeed");
        assert!(snapshot.ready);
        assert_eq!(snapshot.process_id.as_deref(), Some("live-1"));
    }

    assert_eq!(
        harness.fetch.calls(),
        1,
        "one caller probes; the rest hit the cache it fills"
    );
    assert_eq!(harness.host.find_calls(), 1);
    assert_eq!(harness.host.start_calls(), 0);
}

/// Probes from different transitions never overlap in time, even when
/// ensure and restart race each other from separate tasks.
#[tokio::test]
async fn transitions_never_overlap() {
    let harness = TestHarness::builder()
        .fetch(StubFetch::refusing().with_delay(Duration::from_millis(10)))
        .build();

    let ensure_task = {
        let supervisor = Arc::clone(&harness.supervisor);
        tokio::spawn(async move { supervisor.ensure().await })
    };
    let restart_task = {
        let supervisor = Arc::clone(&harness.supervisor);
        tokio::spawn(async move { supervisor.restart().await })
    };

    ensure_task
        .await
        .expect("no panic")
        .expect("ensure should succeed");
    restart_task
        .await
        .expect("no panic")
        .expect("restart should succeed");

    assert_eq!(
        harness.fetch.max_concurrent(),
        1,
        "engine work from two transitions must never interleave"
    );
    assert!(harness.supervisor.state().await.ready);
}

// ── Ordering ───────────────────────────────────────────────────────────────

/// Sequential callers observe their predecessors' work: after a restart,
/// the next ensure is a pure cache hit on the restarted process.
#[tokio::test]
async fn ensure_after_restart_sees_the_restarted_gateway() {
    let harness = TestHarness::builder().build();

    harness.supervisor.ensure().await.expect("cold start");
    let restarted = harness.supervisor.restart().await.expect("restart");
    let starts_after_restart = harness.host.start_calls();

    let ensured = harness.supervisor.ensure().await.expect("cache hit");

    assert_eq!(ensured.process_id, restarted.process_id);
    assert_eq!(
        harness.host.start_calls(),
        starts_after_restart,
        "the post-restart ensure must not start anything"
    );
}

// ── Lock hygiene ───────────────────────────────────────────────────────────

/// A failed transition releases the gate: the next caller gets in
/// instead of deadlocking behind a poisoned lock.
#[tokio::test]
async fn failed_transition_releases_the_gate() {
    let host = StubHost::new();
    host.fail_starts();
    let harness = TestHarness::builder().host(host).build();

    harness
        .supervisor
        .ensure()
        .await
        .expect_err("spawn failures are fatal");

    let second = tokio::time::timeout(Duration::from_secs(2), harness.supervisor.ensure()).await;
    let second = second.expect("the gate must be free after a failed transition");
    second.expect_err("spawns still fail; the point is the call was admitted");
}

/// State reads bypass the transition gate entirely: a slow in-flight
/// ensure must not delay them.
#[tokio::test]
async fn state_reads_do_not_wait_for_transitions() {
    let harness = TestHarness::builder()
        .fetch(StubFetch::refusing().with_delay(Duration::from_millis(200)))
        .build();

    let ensure_task = {
        let supervisor = Arc::clone(&harness.supervisor);
        tokio::spawn(async move { supervisor.ensure().await })
    };
    // Let the ensure reach its first slow probe.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = tokio::time::timeout(Duration::from_millis(50), harness.supervisor.state())
        .await
        .expect("state must answer while a transition is in flight");
    assert!(!snapshot.ready, "mid-transition state is still the old cache");

    ensure_task
        .await
        .expect("no panic")
        .expect("the slow ensure still completes");
}
