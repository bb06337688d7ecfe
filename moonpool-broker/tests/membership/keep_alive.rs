//! Keep-alive heartbeat under paused time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use moonpool_broker::broker::InMemoryBroker;
use moonpool_broker::membership::{MemberStatus, MembershipDirectory};
use moonpool_broker::time::ManualClock;
use moonpool_broker::{MembershipError, MembershipOptions};

use crate::common::{broker_options, entry, epoch, init_tracing, member};

async fn clocked_directory(broker: &InMemoryBroker, clock: &ManualClock) -> MembershipDirectory {
    let dir = MembershipDirectory::with_clock(
        Arc::new(broker.clone()),
        &broker_options(),
        MembershipOptions::default(),
        Arc::new(clock.clone()),
    )
    .expect("directory");
    dir.initialize().await.expect("initialize");
    dir
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_recovers_after_conflicts() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let start = epoch() + ChronoDuration::hours(1);
    let clock = ManualClock::new(start, ChronoDuration::seconds(1));
    let dir = clocked_directory(&broker, &clock).await;

    let me = member(1, 1);
    dir.insert_or_update(entry(me, MemberStatus::Active, 0))
        .await
        .expect("insert");

    // Ticks at 15s, 30s and 45s lose the race; the one at 60s lands.
    broker.inject_update_conflicts(3);
    dir.start_keep_alive(me).expect("start keep-alive");
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(dir.is_keep_alive_running(), "conflicts never stop the loop");
    let record = dir.read_one(&me).expect("read").expect("present");
    assert_eq!(record.entry.i_am_alive_time, start + ChronoDuration::seconds(3));
    assert_eq!(record.entry.status, MemberStatus::Active);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    assert!(!dir.is_keep_alive_running());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_survives_broker_outage() {
    let broker = InMemoryBroker::new();
    let start = epoch() + ChronoDuration::hours(1);
    let clock = ManualClock::new(start, ChronoDuration::seconds(1));
    let dir = clocked_directory(&broker, &clock).await;

    let me = member(2, 5);
    dir.insert_or_update(entry(me, MemberStatus::Active, 0))
        .await
        .expect("insert");
    dir.start_keep_alive(me).expect("start keep-alive");

    broker.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(31)).await;
    let record = dir.read_one(&me).expect("read").expect("present");
    assert_eq!(record.entry.i_am_alive_time, epoch(), "no heartbeat during the outage");
    assert!(dir.is_keep_alive_running());

    broker.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(15)).await;
    let record = dir.read_one(&me).expect("read").expect("present");
    assert_eq!(record.entry.i_am_alive_time, start + ChronoDuration::seconds(2));

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_only_one_keep_alive_per_directory() {
    let broker = InMemoryBroker::new();
    let clock = ManualClock::new(epoch(), ChronoDuration::seconds(1));
    let dir = clocked_directory(&broker, &clock).await;
    let me = member(3, 1);
    dir.insert_or_update(entry(me, MemberStatus::Active, 0))
        .await
        .expect("insert");

    dir.start_keep_alive(me).expect("first start");
    assert!(matches!(
        dir.start_keep_alive(me),
        Err(MembershipError::KeepAliveAlreadyRunning)
    ));

    dir.stop_keep_alive(Duration::from_secs(1)).await.expect("stop");
    assert!(!dir.is_keep_alive_running());
    dir.start_keep_alive(me).expect("restart after stop");

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    dir.stop_keep_alive(Duration::from_secs(1))
        .await
        .expect("stop after shutdown is a no-op");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_are_visible_to_other_directories() {
    let broker = InMemoryBroker::new();
    let start = epoch() + ChronoDuration::hours(1);
    let clock = ManualClock::new(start, ChronoDuration::zero());
    let writer = clocked_directory(&broker, &clock).await;
    let observer = crate::common::directory(&broker, MembershipOptions::default()).await;

    let me = member(4, 1);
    writer
        .insert_or_update(entry(me, MemberStatus::Active, 0))
        .await
        .expect("insert");
    writer.start_keep_alive(me).expect("start keep-alive");
    tokio::time::sleep(Duration::from_secs(16)).await;

    let record = observer.read_one(&me).expect("read").expect("present");
    assert_eq!(record.entry.i_am_alive_time, start);

    writer.shutdown(Duration::from_secs(1)).await.expect("shutdown writer");
    observer
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown observer");
}

#[tokio::test]
async fn test_close_is_bounded_by_configured_shutdown_timeout() {
    let broker = InMemoryBroker::new();
    let options = MembershipOptions {
        shutdown_timeout: Duration::ZERO,
        ..MembershipOptions::default()
    };
    let dir = crate::common::directory(&broker, options).await;
    dir.start_keep_alive(member(1, 1)).expect("start");

    // The cancelled task has not been polled again, so a zero budget expires.
    let err = dir.close().await.expect_err("no time to join");
    assert!(matches!(err, MembershipError::ShutdownTimeout(t) if t == Duration::ZERO));
    assert!(!dir.is_keep_alive_running());

    let dir = crate::common::directory(&broker, MembershipOptions::default()).await;
    dir.start_keep_alive(member(2, 1)).expect("start");
    dir.close().await.expect("default budget is enough");
    dir.close().await.expect("close is idempotent");
}
