//! Membership directory behavior: writes, reads, watch propagation, reset.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use moonpool_broker::broker::{BucketConfig, InMemoryBroker, KeyValueBroker};
use moonpool_broker::membership::{MemberEntry, MemberStatus};
use moonpool_broker::naming::encode_member_key;
use moonpool_broker::store::KvStore;
use moonpool_broker::{MembershipError, MembershipOptions};

use crate::common::{directory, entry, epoch, eventually, init_tracing, member};

const BUCKET: &str = "membership-test-svc";

#[tokio::test]
async fn test_read_your_write() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;

    let written = entry(member(1, 1), MemberStatus::Joining, 0);
    dir.insert_or_update(written.clone()).await.expect("insert");
    let read = dir.read_one(&written.address).expect("read").expect("present");
    assert_eq!(read.entry, written);

    let active = written.clone().with_status(MemberStatus::Active).with_proxy_port(30000);
    let revision = dir.insert_or_update(active.clone()).await.expect("update");
    let read = dir.read_one(&written.address).expect("read").expect("present");
    assert_eq!(read.entry, active);
    assert_eq!(read.revision, revision);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_write_lands_in_bucket_under_encoded_key() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let written = entry(member(3, 77), MemberStatus::Active, 0);
    dir.insert_or_update(written.clone()).await.expect("insert");

    let key = encode_member_key(&written.address);
    assert_eq!(key, "10.0.0.3_11111=77");
    let raw = broker.get(BUCKET, &key).await.expect("get").expect("stored");
    let value: serde_json::Value = serde_json::from_slice(&raw.value).expect("json");
    assert_eq!(value["$type"], "moonpool.membership.MemberEntry");
    assert_eq!(value["payload"]["status"], "Active");

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_cache_not_updated_when_write_fails() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let written = entry(member(1, 1), MemberStatus::Joining, 0);
    dir.insert_or_update(written.clone()).await.expect("insert");

    broker.set_unavailable(true);
    let err = dir
        .insert_or_update(written.clone().with_status(MemberStatus::Active))
        .await
        .expect_err("broker down");
    assert!(matches!(err, MembershipError::Broker(ref e) if e.is_transient()));
    broker.set_unavailable(false);

    let read = dir.read_one(&written.address).expect("read").expect("present");
    assert_eq!(read.entry.status, MemberStatus::Joining);
    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_stale_revision_surfaces_conflict() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let written = entry(member(1, 1), MemberStatus::Active, 0);
    dir.insert_or_update(written.clone()).await.expect("insert");

    broker.inject_update_conflicts(1);
    let err = dir
        .insert_or_update(written.clone().with_status(MemberStatus::ShuttingDown))
        .await
        .expect_err("conflict");
    assert!(err.is_conflict());
    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_conditional_updates_exactly_one_wins() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(KvStore::new(
        Arc::new(broker.clone()),
        BucketConfig {
            name: BUCKET.into(),
            history: 1,
            max_age: Duration::from_secs(300),
        },
    ));
    let address = member(1, 1);
    let key = encode_member_key(&address);
    let first = store
        .put(&key, &entry(address, MemberStatus::Active, 0))
        .await
        .expect("put");

    for round in 0..20 {
        let expected = store
            .get::<MemberEntry>(&key)
            .await
            .expect("get")
            .expect("present")
            .revision;
        if round == 0 {
            assert_eq!(expected, first);
        }

        let writers: Vec<_> = (0..2)
            .map(|writer| {
                let store = store.clone();
                let key = key.clone();
                let value = entry(address, MemberStatus::Active, writer);
                tokio::spawn(async move { store.update_if_revision(&key, &value, expected).await })
            })
            .collect();

        let mut wins = 0;
        let mut conflicts = 0;
        for writer in writers {
            match writer.await.expect("writer task") {
                Ok(_) => wins += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((wins, conflicts), (1, 1), "round {round}");
    }
}

#[tokio::test]
async fn test_watch_propagates_between_directories() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let a = directory(&broker, MembershipOptions::default()).await;
    let b = directory(&broker, MembershipOptions::default()).await;

    let written = entry(member(1, 1), MemberStatus::Active, 30000);
    a.insert_or_update(written.clone()).await.expect("insert");

    let (observer, expected) = (&b, &written);
    let seen = eventually(Duration::from_secs(2), move || async move {
        matches!(observer.read_one(&expected.address), Ok(Some(record)) if record.entry == *expected)
    })
    .await;
    assert!(seen, "second directory observes the write");

    a.delete_all().await.expect("delete all");
    let gone = eventually(Duration::from_secs(2), move || async move {
        matches!(observer.read_all(), Ok(records) if records.is_empty())
    })
    .await;
    assert!(gone, "second directory observes the delete");

    a.shutdown(Duration::from_secs(1)).await.expect("shutdown a");
    b.shutdown(Duration::from_secs(1)).await.expect("shutdown b");
}

#[tokio::test]
async fn test_initialize_warms_cache_from_existing_bucket() {
    let broker = InMemoryBroker::new();
    let first = directory(&broker, MembershipOptions::default()).await;
    for last in 1..=3 {
        first
            .insert_or_update(entry(member(last, 1), MemberStatus::Active, 0))
            .await
            .expect("insert");
    }
    first.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    let second = directory(&broker, MembershipOptions::default()).await;
    let records = second.read_all().expect("read all");
    let addresses: Vec<_> = records.iter().map(|r| r.entry.address).collect();
    assert_eq!(addresses, vec![member(1, 1), member(2, 1), member(3, 1)]);
    let highest = records.iter().map(|r| r.revision.0).max().unwrap_or(0);
    assert_eq!(second.table_version().version, highest);
    second.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_initialize_rejects_undecodable_entries() {
    let broker = InMemoryBroker::new();
    broker
        .create_bucket(&BucketConfig {
            name: BUCKET.into(),
            history: 1,
            max_age: Duration::ZERO,
        })
        .await
        .expect("bucket");
    broker
        .put(
            BUCKET,
            &encode_member_key(&member(1, 1)),
            bytes::Bytes::from_static(br#"{"$type":"other","payload":{}}"#),
        )
        .await
        .expect("put");

    let dir = moonpool_broker::membership::MembershipDirectory::new(
        Arc::new(broker.clone()),
        &crate::common::broker_options(),
        MembershipOptions::default(),
    )
    .expect("directory");
    let err = dir.initialize().await.expect_err("undecodable entry");
    assert!(matches!(err, MembershipError::Codec(_)));
}

#[tokio::test]
async fn test_refresh_drops_keys_removed_behind_the_cache() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let written = entry(member(1, 1), MemberStatus::Active, 0);
    dir.insert_or_update(written.clone()).await.expect("insert");

    // Purged directly on the broker, behind the directory's back.
    broker
        .purge(BUCKET, &encode_member_key(&written.address))
        .await
        .expect("purge");
    assert_eq!(dir.refresh().await.expect("refresh"), 0);
    assert!(dir.read_one(&written.address).expect("read").is_none());
    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_cleanup_defunct_removes_only_old_dead_members() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;

    let mut old_dead = entry(member(1, 1), MemberStatus::Dead, 0);
    old_dead.i_am_alive_time = epoch();
    let mut recent_dead = entry(member(2, 1), MemberStatus::Dead, 0);
    recent_dead.i_am_alive_time = epoch() + ChronoDuration::hours(2);
    let mut old_active = entry(member(3, 1), MemberStatus::Active, 0);
    old_active.i_am_alive_time = epoch();

    for e in [&old_dead, &recent_dead, &old_active] {
        dir.insert_or_update(e.clone()).await.expect("insert");
    }

    let removed = dir
        .cleanup_defunct(epoch() + ChronoDuration::hours(1))
        .await
        .expect("cleanup");
    assert_eq!(removed, 1);
    assert!(dir.read_one(&old_dead.address).expect("read").is_none());
    assert!(dir.read_one(&recent_dead.address).expect("read").is_some());
    assert!(dir.read_one(&old_active.address).expect("read").is_some());
    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    dir.shutdown(Duration::from_secs(1)).await.expect("first shutdown");
    dir.shutdown(Duration::from_secs(1)).await.expect("second shutdown");
}
