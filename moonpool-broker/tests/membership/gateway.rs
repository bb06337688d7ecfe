//! Gateway list derived from membership.

use std::sync::Arc;
use std::time::Duration;

use moonpool_broker::broker::InMemoryBroker;
use moonpool_broker::membership::{GatewayListProvider, GatewayView, MemberStatus};
use moonpool_broker::MembershipOptions;

use crate::common::{directory, entry, member};

#[tokio::test]
async fn test_only_active_members_with_proxy_port_are_gateways() {
    let broker = InMemoryBroker::new();
    let dir = Arc::new(directory(&broker, MembershipOptions::default()).await);

    dir.insert_or_update(entry(member(1, 7), MemberStatus::Active, 30001))
        .await
        .expect("active gateway");
    dir.insert_or_update(entry(member(2, 7), MemberStatus::Dead, 30002))
        .await
        .expect("dead member");
    dir.insert_or_update(entry(member(3, 7), MemberStatus::Active, 0))
        .await
        .expect("active without proxy");
    dir.insert_or_update(entry(member(4, 7), MemberStatus::Joining, 30004))
        .await
        .expect("joining member");

    let view = GatewayView::new(dir.clone());
    let gateways = view.get_gateways().await.expect("gateways");
    assert_eq!(gateways, vec!["gwy.tcp://10.0.0.1:30001/0".to_string()]);

    let addresses = view.active_gateways().expect("addresses");
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].port, 30001);
    assert_eq!(addresses[0].generation, 0);

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_gateway_list_follows_status_changes() {
    let broker = InMemoryBroker::new();
    let dir = Arc::new(directory(&broker, MembershipOptions::default()).await);
    let view = GatewayView::new(dir.clone());

    let silo = entry(member(1, 1), MemberStatus::Active, 30000);
    dir.insert_or_update(silo.clone()).await.expect("insert");
    assert_eq!(view.get_gateways().await.expect("gateways").len(), 1);

    dir.insert_or_update(silo.with_status(MemberStatus::ShuttingDown))
        .await
        .expect("shutting down");
    assert!(view.get_gateways().await.expect("gateways").is_empty());

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_provider_settings() {
    let broker = InMemoryBroker::new();
    let options = MembershipOptions {
        max_staleness: Duration::from_secs(90),
        ..MembershipOptions::default()
    };
    let dir = Arc::new(
        moonpool_broker::membership::MembershipDirectory::new(
            Arc::new(broker.clone()),
            &crate::common::broker_options(),
            options,
        )
        .expect("directory"),
    );
    let view = GatewayView::new(dir.clone());

    assert_eq!(view.max_staleness(), Duration::from_secs(90));
    assert!(view.is_updatable());

    view.init().await.expect("init initializes the directory");
    assert!(dir.is_initialized());
    assert!(view.get_gateways().await.expect("gateways").is_empty());

    dir.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}
