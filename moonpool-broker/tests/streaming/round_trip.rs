//! Publish then receive: ordering and batch grouping.

use std::time::Duration;

use moonpool_broker::streaming::{BatchKey, QueueAdapter, QueueAdapterReceiver, QueueId};

use crate::common::{adapter, init_tracing, streaming_options, Event};

#[tokio::test]
async fn test_single_channel_round_trip_preserves_order() {
    init_tracing();
    let broker = moonpool_broker::broker::InMemoryBroker::new();
    let adapter = adapter(&broker, streaming_options());
    let receiver = adapter.receiver(QueueId(0)).expect("receiver");
    receiver.initialize(Duration::from_secs(1)).await.expect("init");

    let sent = vec![Event::new("a", 1), Event::new("b", 2), Event::new("c", 3)];
    adapter
        .queue_events("orders", "billing", &sent)
        .await
        .expect("publish");

    let batches = receiver.get_queue_messages(10).await.expect("fetch");
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.key, BatchKey::new("orders", "billing"));
    assert_eq!(batch.events::<Event>().cloned().collect::<Vec<_>>(), sent);

    let sequences: Vec<u64> = batch.sequence_numbers().collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{sequences:?}");
    assert_eq!(batch.token.sequence_number, sequences[2]);
    assert_eq!(batch.token.event_index, 2);
    assert!(batch
        .entries
        .iter()
        .all(|entry| entry.payload_type == "test.Event"));

    receiver.messages_delivered(&batches).await.expect("ack");
    receiver.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_interleaved_channels_grouped_in_first_appearance_order() {
    let broker = moonpool_broker::broker::InMemoryBroker::new();
    let adapter = adapter(&broker, streaming_options());
    let receiver = adapter.receiver(QueueId(1)).expect("receiver");
    receiver.initialize(Duration::from_secs(1)).await.expect("init");

    adapter
        .queue_events("s2", "n", &[Event::new("x", 1)])
        .await
        .expect("publish s2");
    adapter
        .queue_events("s1", "n", &[Event::new("y", 1)])
        .await
        .expect("publish s1");
    adapter
        .queue_events("s2", "n", &[Event::new("x", 2)])
        .await
        .expect("publish s2 again");
    adapter
        .queue_events("s2", "other", &[Event::new("z", 1)])
        .await
        .expect("publish other namespace");

    let batches = receiver.get_queue_messages(10).await.expect("fetch");
    let keys: Vec<BatchKey> = batches.iter().map(|b| b.key.clone()).collect();
    assert_eq!(
        keys,
        vec![
            BatchKey::new("s2", "n"),
            BatchKey::new("s1", "n"),
            BatchKey::new("s2", "other"),
        ]
    );
    let first: Vec<u32> = batches[0].events::<Event>().map(|e| e.n).collect();
    assert_eq!(first, vec![1, 2]);
    assert_eq!(batches[0].token.event_index, 1);
    assert!(batches[0].token.sequence_number > batches[1].token.sequence_number);

    receiver.messages_delivered(&batches).await.expect("ack");
    receiver.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_fetch_respects_max_count() {
    let broker = moonpool_broker::broker::InMemoryBroker::new();
    let adapter = adapter(&broker, streaming_options());
    let receiver = adapter.receiver(QueueId(0)).expect("receiver");
    receiver.initialize(Duration::from_secs(1)).await.expect("init");

    let events: Vec<Event> = (0..5).map(|n| Event::new("e", n)).collect();
    adapter
        .queue_events("s", "n", &events)
        .await
        .expect("publish");

    let first = receiver.get_queue_messages(2).await.expect("fetch");
    assert_eq!(first.iter().map(|b| b.len()).sum::<usize>(), 2);
    let rest = receiver.get_queue_messages(10).await.expect("fetch");
    let ns: Vec<u32> = rest[0].events::<Event>().map(|e| e.n).collect();
    assert_eq!(ns, vec![2, 3, 4]);

    assert!(receiver.get_queue_messages(0).await.expect("zero").is_empty());
    assert_eq!(receiver.in_flight_count(), 5);
    receiver.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_empty_queue_returns_no_batches() {
    let broker = moonpool_broker::broker::InMemoryBroker::new();
    let adapter = adapter(&broker, streaming_options());
    let receiver = adapter.create_receiver(QueueId(3)).expect("receiver");
    receiver.initialize(Duration::from_secs(1)).await.expect("init");
    assert!(receiver.get_queue_messages(10).await.expect("fetch").is_empty());
    receiver.shutdown(Duration::from_secs(1)).await.expect("shutdown");
}

#[tokio::test]
async fn test_mapper_spreads_stream_ids_over_queues() {
    let broker = moonpool_broker::broker::InMemoryBroker::new();
    let adapter = adapter(&broker, streaming_options());
    let mapper = adapter.mapper();
    let queues: std::collections::BTreeSet<QueueId> = (0..200)
        .map(|i| mapper.queue_for(&format!("stream-{i}")))
        .collect();
    assert!(queues.len() > 1);
    assert!(queues.iter().all(|q| q.0 < mapper.partition_count()));
}
