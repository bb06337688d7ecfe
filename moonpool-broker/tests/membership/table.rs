//! The table-shaped contract over the directory.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use moonpool_broker::broker::InMemoryBroker;
use moonpool_broker::membership::{MemberStatus, MembershipTable, TableVersion};
use moonpool_broker::MembershipOptions;

use crate::common::{directory, entry, epoch, member};

#[tokio::test]
async fn test_insert_row_is_create_only() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let row = entry(member(1, 1), MemberStatus::Joining, 0);

    let version = MembershipTable::read_all(&dir).await.expect("read").version;
    assert_eq!(version.version, 0);

    assert!(dir.insert_row(row.clone(), version.next()).await.expect("insert"));
    assert!(!dir
        .insert_row(row.clone().with_status(MemberStatus::Active), version.next())
        .await
        .expect("second insert"));

    let data = dir.read_row(&row.address).await.expect("read row");
    assert_eq!(data.entries.len(), 1);
    assert_eq!(data.entries[0].0.status, MemberStatus::Joining);
    assert!(data.version.version > 0);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_update_row_checks_etag() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let row = entry(member(1, 1), MemberStatus::Joining, 0);
    assert!(dir
        .insert_row(row.clone(), TableVersion::default())
        .await
        .expect("insert"));

    let data = dir.read_row(&row.address).await.expect("read row");
    let (_, etag) = data.get(&row.address).expect("row present").clone();

    let active = row.clone().with_status(MemberStatus::Active);
    assert!(dir
        .update_row(active.clone(), &etag, data.version.next())
        .await
        .expect("fresh etag"));
    assert!(!dir
        .update_row(active.clone().with_proxy_port(30000), &etag, data.version.next())
        .await
        .expect("stale etag"));
    assert!(!dir
        .update_row(active.clone(), "not-a-revision", data.version.next())
        .await
        .expect("bad etag"));

    let data = dir.read_row(&row.address).await.expect("read row");
    assert_eq!(data.entries[0].0, active);
    assert_ne!(data.entries[0].1, etag);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_read_row_of_unknown_member_is_empty() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let data = dir.read_row(&member(9, 9)).await.expect("read row");
    assert!(data.entries.is_empty());
    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_read_all_reports_etags_and_version() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    for last in [3, 1, 2] {
        dir.insert_row(entry(member(last, 1), MemberStatus::Active, 0), TableVersion::default())
            .await
            .expect("insert");
    }

    let data = MembershipTable::read_all(&dir).await.expect("read all");
    let addresses: Vec<_> = data.entries.iter().map(|(e, _)| e.address).collect();
    assert_eq!(addresses, vec![member(1, 1), member(2, 1), member(3, 1)]);
    let highest = data
        .entries
        .iter()
        .map(|(_, etag)| etag.parse::<u64>().expect("numeric etag"))
        .max()
        .expect("rows");
    assert_eq!(data.version.version, highest);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_update_i_am_alive_writes_only_the_timestamp() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    let row = entry(member(1, 1), MemberStatus::Active, 30000);
    dir.insert_row(row.clone(), TableVersion::default())
        .await
        .expect("insert");

    let mut heartbeat = row.clone().with_status(MemberStatus::Dead);
    heartbeat.i_am_alive_time = epoch() + ChronoDuration::minutes(5);
    MembershipTable::update_i_am_alive(&dir, &heartbeat)
        .await
        .expect("heartbeat");

    let data = dir.read_row(&row.address).await.expect("read row");
    let stored = &data.entries[0].0;
    assert_eq!(stored.i_am_alive_time, heartbeat.i_am_alive_time);
    assert_eq!(stored.status, MemberStatus::Active, "status untouched");

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_delete_entries_only_for_own_cluster() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    dir.insert_row(entry(member(1, 1), MemberStatus::Active, 0), TableVersion::default())
        .await
        .expect("insert");

    dir.delete_membership_table_entries("someone-else")
        .await
        .expect("foreign cluster");
    assert_eq!(MembershipTable::read_all(&dir).await.expect("read").entries.len(), 1);

    dir.delete_membership_table_entries("test")
        .await
        .expect("own cluster");
    assert!(MembershipTable::read_all(&dir).await.expect("read").entries.is_empty());

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_cleanup_defunct_silo_entries() {
    let broker = InMemoryBroker::new();
    let dir = directory(&broker, MembershipOptions::default()).await;
    dir.insert_row(entry(member(1, 1), MemberStatus::Dead, 0), TableVersion::default())
        .await
        .expect("insert dead");
    dir.insert_row(entry(member(1, 2), MemberStatus::Active, 0), TableVersion::default())
        .await
        .expect("insert active");

    let removed = dir
        .cleanup_defunct_silo_entries(epoch() + ChronoDuration::seconds(1))
        .await
        .expect("cleanup");
    assert_eq!(removed, 1);
    let remaining = MembershipTable::read_all(&dir).await.expect("read");
    assert_eq!(remaining.entries.len(), 1);
    assert_eq!(remaining.entries[0].0.address, member(1, 2));

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}
