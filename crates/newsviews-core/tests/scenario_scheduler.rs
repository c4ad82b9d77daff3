mod common;

use std::time::Duration;

use common::{eventually, form_row, FakeSheet, Harness, DESCRIPTION};
use newsviews_core::{PassOutcome, Scheduler, StopOutcome, SyncConfig, SyncError};
use tokio_util::sync::CancellationToken;

fn first_row() -> Vec<String> {
    form_row("9/1/2024 09:00:00", "Market flooded", DESCRIPTION, "+234 805 000 0001")
}

#[tokio::test]
async fn start_runs_a_pass_and_stop_joins() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    let scheduler = Scheduler::new(h.engine.clone());

    assert!(scheduler.start(Duration::from_secs(3600)).await);
    assert!(!scheduler.start(Duration::from_secs(3600)).await);

    let storage = h.storage.clone();
    assert!(eventually(Duration::from_secs(2), || storage.len() == 1).await);

    let status = scheduler.status().await;
    assert!(status.running);
    assert_eq!(status.interval_secs, Some(3600));

    assert_eq!(scheduler.stop().await, StopOutcome::Joined);
    assert_eq!(scheduler.stop().await, StopOutcome::NotRunning);

    let status = scheduler.status().await;
    assert!(!status.running);
    assert!(status.last_run_at.is_some());
    assert_eq!(status.last_summary.unwrap().added(), 1);
    assert_eq!(status.cursor.last_processed_row, 2);
}

#[tokio::test]
async fn run_once_records_status_without_the_loop() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    let scheduler = Scheduler::new(h.engine.clone());

    let outcome = scheduler.run_once().await.unwrap();
    assert_eq!(outcome.summary().unwrap().added(), 1);

    let status = scheduler.status().await;
    assert!(!status.running);
    assert!(!status.pass_in_flight);
    assert!(status.last_error.is_none());
    assert_eq!(status.last_summary.unwrap().added(), 1);
}

#[tokio::test]
async fn run_once_during_scheduled_pass_is_coalesced() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    h.sheet.set_block_fetch(true);
    let scheduler = Scheduler::new(h.engine.clone());
    scheduler.start(Duration::from_secs(3600)).await;

    h.sheet.fetch_entered.notified().await;
    let outcome = scheduler.run_once().await.unwrap();
    assert!(matches!(outcome, PassOutcome::AlreadyRunning));
    assert!(scheduler.status().await.pass_in_flight);

    h.sheet.fetch_release.notify_one();
    let storage = h.storage.clone();
    assert!(eventually(Duration::from_secs(2), || storage.len() == 1).await);
    assert_eq!(scheduler.stop().await, StopOutcome::Joined);
}

#[tokio::test]
async fn failed_pass_is_reported_in_status() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    h.sheet.set_fail_fetch(true);
    let scheduler = Scheduler::new(h.engine.clone());

    assert!(scheduler.run_once().await.is_err());
    let status = scheduler.status().await;
    assert!(status.last_error.unwrap().contains("failed to fetch"));
    assert!(status.last_summary.is_none());
    assert!(status.last_run_at.is_some());
}

#[tokio::test]
async fn additions_shorten_the_next_interval() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    let scheduler = Scheduler::new(h.engine.clone());

    // Base 6s; after the first pass adds a row the next pass is due in 2s.
    scheduler.start(Duration::from_secs(6)).await;
    let storage = h.storage.clone();
    assert!(eventually(Duration::from_secs(2), || storage.len() == 1).await);

    h.sheet.push(form_row(
        "9/1/2024 10:00:00",
        "Power restored",
        "Electricity was restored to the eastern districts after a two-day outage.",
        "+234 805 000 0002",
    ));
    assert!(eventually(Duration::from_secs(4), || storage.len() == 2).await);

    scheduler.stop().await;
}

#[tokio::test]
async fn stop_abandons_a_pass_that_outlives_the_join_timeout() {
    let config = SyncConfig {
        join_timeout_secs: 1,
        external_timeout_secs: 30,
        ..common::test_config()
    };
    let h = Harness::with_config(FakeSheet::with_header(vec![first_row()]), config);
    h.sheet.set_block_fetch(true);
    let scheduler = Scheduler::new(h.engine.clone());
    scheduler.start(Duration::from_secs(3600)).await;
    h.sheet.fetch_entered.notified().await;

    assert_eq!(scheduler.stop().await, StopOutcome::Abandoned);
    assert_eq!(h.storage.len(), 0);
    assert!(!scheduler.status().await.running);

    // The aborted pass released the lock; a fresh pass can run.
    h.sheet.set_block_fetch(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let outcome = h.engine.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.summary().unwrap().added(), 1);
}

#[tokio::test]
async fn run_once_after_stop_starts_no_pass() {
    let h = Harness::new(FakeSheet::with_header(vec![first_row()]));
    let scheduler = Scheduler::new(h.engine.clone());
    scheduler.start(Duration::from_secs(3600)).await;
    let storage = h.storage.clone();
    assert!(eventually(Duration::from_secs(2), || storage.len() == 1).await);
    assert_eq!(scheduler.stop().await, StopOutcome::Joined);
    let fetches = h.sheet.fetch_calls();

    h.sheet.push(form_row(
        "9/1/2024 10:00:00",
        "Power restored",
        "Electricity was restored to the eastern districts after a two-day outage.",
        "+234 805 000 0002",
    ));
    let result = scheduler.run_once().await;

    assert!(matches!(result, Err(SyncError::Stopped)));
    assert_eq!(h.sheet.fetch_calls(), fetches);
    assert_eq!(h.storage.len(), 1);
    assert!(scheduler.status().await.last_error.is_none());

    // A restart lifts the stop.
    scheduler.start(Duration::from_secs(3600)).await;
    assert!(eventually(Duration::from_secs(2), || storage.len() == 2).await);
    assert_eq!(scheduler.stop().await, StopOutcome::Joined);
}
