//! End-to-end scenarios run against `testing::FakeKafkaCluster` instead of a
//! live broker.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kafka_consumer_core::{stream, ConsumerSettings, Error, Offset, StringDeserializer, TopicPartition};
use kafka_consumer_core::consumer::KafkaConsumer;
use kafka_consumer_core::testing::FakeKafkaCluster;

fn settings(cluster: &FakeKafkaCluster) -> ConsumerSettings {
    ConsumerSettings::new("localhost:9092", "test-group")
        .with_consumer_factory(cluster.factory())
        .with_poll_interval(Duration::from_millis(10))
}

fn new_consumer(
    settings: ConsumerSettings,
) -> (
    KafkaConsumer<String, String>,
    kafka_consumer_core::ConsumerFiber,
) {
    KafkaConsumer::new(
        settings,
        Arc::new(StringDeserializer),
        Arc::new(StringDeserializer),
    )
    .expect("consumer construction should not fail against a fake client")
}

#[tokio::test]
async fn subscribe_and_consume_three_records() {
    let cluster = FakeKafkaCluster::new();
    let tp = TopicPartition::new("orders", 0);
    cluster.set_assignment([tp.clone()]);
    for i in 0..3 {
        cluster.push_message(tp.clone(), i, Some(format!("k{i}").into_bytes()), Some(format!("v{i}").into_bytes()));
    }

    let (consumer, fiber) = new_consumer(settings(&cluster));
    consumer.subscribe(["orders"]).await.expect("subscribe");

    let mut records = stream::stream(consumer).boxed();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(1), records.next())
            .await
            .expect("should receive a record before the timeout")
            .expect("stream should not end early")
            .expect("record should deserialize");
        seen.push(message.record.value);
    }
    seen.sort();
    assert_eq!(seen, vec!["v0", "v1", "v2"]);

    fiber.cancel();
}

#[tokio::test]
async fn partitioned_stream_keeps_partitions_independent() {
    let cluster = FakeKafkaCluster::new();
    let tp0 = TopicPartition::new("orders", 0);
    let tp1 = TopicPartition::new("orders", 1);
    cluster.set_assignment([tp0.clone(), tp1.clone()]);
    cluster.push_message(tp0.clone(), 0, Some(b"k".to_vec()), Some(b"from-zero".to_vec()));
    cluster.push_message(tp1.clone(), 0, Some(b"k".to_vec()), Some(b"from-one".to_vec()));

    let (consumer, fiber) = new_consumer(settings(&cluster));
    consumer.subscribe(["orders"]).await.expect("subscribe");

    let mut partitions = stream::partitioned_stream(consumer).boxed();
    let mut by_partition = std::collections::HashMap::new();
    for _ in 0..2 {
        let (tp, mut sub) = tokio::time::timeout(Duration::from_secs(1), partitions.next())
            .await
            .expect("should see a partition before the timeout")
            .expect("partitioned stream should not end early")
            .expect("partition assignment should not error");
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("should receive a record before the timeout")
            .expect("sub-stream should not end early")
            .expect("record should deserialize");
        by_partition.insert(tp, message.record.value);
    }

    assert_eq!(by_partition.get(&tp0), Some(&"from-zero".to_string()));
    assert_eq!(by_partition.get(&tp1), Some(&"from-one".to_string()));

    fiber.cancel();
}

#[tokio::test]
async fn seek_and_reread() {
    let cluster = FakeKafkaCluster::new();
    let tp = TopicPartition::new("orders", 0);
    cluster.set_assignment([tp.clone()]);

    let (consumer, fiber) = new_consumer(settings(&cluster));
    consumer.subscribe(["orders"]).await.expect("subscribe");
    consumer.seek(tp.clone(), Offset(42)).await.expect("seek");

    assert_eq!(cluster.seeks(), vec![(tp, 42)]);
    fiber.cancel();
}

#[tokio::test]
async fn stream_before_subscribe_fails_with_not_subscribed() {
    let cluster = FakeKafkaCluster::new();
    let (consumer, fiber) = new_consumer(settings(&cluster));

    let mut records = stream::stream(consumer).boxed();
    let first = records.next().await.expect("stream should yield one error item");
    assert!(matches!(first, Err(Error::NotSubscribed)));
    assert!(records.next().await.is_none(), "stream should end after NotSubscribed");

    fiber.cancel();
}

#[tokio::test]
async fn shutdown_mid_stream_ends_the_stream() {
    let cluster = FakeKafkaCluster::new();
    let tp = TopicPartition::new("orders", 0);
    cluster.set_assignment([tp.clone()]);

    let (consumer, fiber) = new_consumer(settings(&cluster));
    consumer.subscribe(["orders"]).await.expect("subscribe");

    let mut records = stream::stream(consumer.clone()).boxed();
    fiber.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(1), records.next()).await;
    assert!(
        matches!(outcome, Ok(None)) || outcome.is_err(),
        "stream should either end or keep waiting harmlessly once torn down"
    );
    assert!(consumer.subscribe(["orders"]).await.is_err(), "requests after shutdown should fail");
}

#[tokio::test]
async fn rebalance_ends_the_revoked_partitions_sub_stream() {
    let cluster = FakeKafkaCluster::new();
    let tp0 = TopicPartition::new("orders", 0);
    let tp1 = TopicPartition::new("orders", 1);
    cluster.set_assignment([tp0.clone()]);

    let (consumer, fiber) = new_consumer(settings(&cluster));
    consumer.subscribe(["orders"]).await.expect("subscribe");

    let mut partitions = stream::partitioned_stream(consumer).boxed();
    let (first_tp, mut first_sub) = tokio::time::timeout(Duration::from_secs(1), partitions.next())
        .await
        .expect("should see the initial partition before the timeout")
        .expect("partitioned stream should not end early")
        .expect("partition assignment should not error");
    assert_eq!(first_tp, tp0);

    // Revoke tp0 by handing the assignment to tp1 instead: the first
    // sub-stream should end on its own.
    cluster.set_assignment([tp1.clone()]);
    let ended = tokio::time::timeout(Duration::from_secs(1), first_sub.next())
        .await
        .expect("revocation should close the sub-stream before the timeout");
    assert!(ended.is_none(), "sub-stream should end once its partition is revoked");

    let (second_tp, _second_sub) = tokio::time::timeout(Duration::from_secs(1), partitions.next())
        .await
        .expect("should see the new partition before the timeout")
        .expect("partitioned stream should not end early")
        .expect("partition assignment should not error");
    assert_eq!(second_tp, tp1);

    fiber.cancel();
}
