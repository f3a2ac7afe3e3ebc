//! End-to-end producer behaviour against a scripted in-memory broker
//!
//! The tokio clock is paused, so linger and backoff delays elapse instantly
//! once every task is idle.
//!
//! Run with: cargo test -p herald-client --test producer -- --nocapture

mod common;

use anyhow::Result;
use bytes::Bytes;
use common::{init_tracing, ReportLog, ScriptedBroker};
use herald_client::hash::murmur2_partition;
use herald_client::{
    DeliveryError, Error, JsonSerializer, Producer, ProducerConfig, TransportError,
};
use std::time::Duration;

fn config() -> ProducerConfig {
    ProducerConfig::builder()
        .bootstrap_servers(vec!["broker-1:9092".to_string()])
        .linger_ms(5)
        .retry_backoff_ms(100)
        .retry_jitter(0.0)
        .build()
}

async fn producer(config: ProducerConfig, broker: &ScriptedBroker) -> Result<Producer> {
    Ok(Producer::with_connection_factory(config, broker.factory()).await?)
}

fn key(k: &str) -> Option<Bytes> {
    Some(Bytes::from(k.to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_retried_batch_reports_in_order() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(1);
    broker.fail_next([TransportError::retryable("NOT_LEADER: leader moved")]);
    let config = ProducerConfig {
        max_batch_count: 3,
        linger_ms: 50,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    for value in ["1", "2", "3"] {
        producer.publish("orders", key("A"), value, log.callback()).await?;
    }
    producer.flush().await?;

    let reports = log.reports();
    assert_eq!(reports.len(), 3);
    for (i, report) in reports.iter().enumerate() {
        assert!(report.is_delivered(), "report {} failed: {:?}", i, report.error());
        assert_eq!(report.sequence, i as u64);
        assert_eq!(report.offset(), Some(i as u64));
    }
    assert_eq!(log.values_for("A"), vec!["1", "2", "3"]);

    // Same batch transmitted twice, the second time as a retry
    let sent = broker.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].values, vec!["1", "2", "3"]);
    assert_eq!(sent[0].retry_counts, vec![0, 0, 0]);
    assert_eq!(sent[1].values, vec!["1", "2", "3"]);
    assert_eq!(sent[1].retry_counts, vec![1, 1, 1]);

    let stats = producer.stats();
    assert_eq!(stats.records_delivered, 3);
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.batches_sent, 2);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_is_bounded() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(1);
    broker.fail_next((0..3).map(|_| TransportError::retryable("UNAVAILABLE")));
    let config = ProducerConfig {
        max_retries: 2,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    producer.flush().await?;

    let reports = log.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].error(),
        Some(&DeliveryError::RetriesExhausted {
            attempts: 3,
            last_error: "UNAVAILABLE".to_string(),
        })
    );
    // max_retries = 2 allows three transmissions in total
    assert_eq!(broker.sent().len(), 3);
    assert_eq!(producer.stats().records_failed, 1);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_keys_keep_their_order() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(4);
    broker.fail_next([
        TransportError::retryable("connection reset"),
        TransportError::retryable("THROTTLED"),
    ]);
    let config = ProducerConfig {
        max_batch_count: 2,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    let mut handles = Vec::new();
    for k in ["A", "B"] {
        let producer = producer.clone();
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..5 {
                producer
                    .publish("orders", key(k), format!("{}-{}", k, i), log.callback())
                    .await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    producer.flush().await?;

    assert_eq!(log.reports().len(), 10);
    assert!(log.reports().iter().all(|r| r.is_delivered()));
    for k in ["A", "B"] {
        let expected: Vec<String> = (0..5).map(|i| format!("{}-{}", k, i)).collect();
        assert_eq!(log.values_for(k), expected);
    }

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_rejects_without_retry() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(1);
    broker.fail_next([TransportError::fatal("MESSAGE_TOO_LARGE: batch exceeds 1 MiB")]);
    let config = ProducerConfig {
        max_batch_count: 2,
        linger_ms: 100,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    producer.publish("orders", key("A"), "2", log.callback()).await?;
    producer.flush().await?;

    let reports = log.reports();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(
            report.error(),
            Some(&DeliveryError::Rejected(
                "MESSAGE_TOO_LARGE: batch exceeds 1 MiB".to_string()
            ))
        );
    }
    assert_eq!(broker.sent().len(), 1);
    assert_eq!(producer.stats().retries, 0);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_leaves_state_untouched() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(1);
    let config = ProducerConfig {
        queue_capacity: 2,
        linger_ms: 10_000,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    assert_eq!(producer.publish("orders", key("A"), "1", log.callback()).await?, 0);
    assert_eq!(producer.publish("orders", key("A"), "2", log.callback()).await?, 1);

    let err = producer
        .publish("orders", key("A"), "3", log.callback())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::QueueFull {
            partition: 0,
            capacity: 2,
            ..
        }
    ));
    assert_eq!(producer.stats().records_sent, 2);
    assert_eq!(producer.stats().queued, 2);

    producer.flush().await?;
    assert_eq!(log.reports().len(), 2);

    // The rejected record did not consume a sequence number
    assert_eq!(producer.publish("orders", key("A"), "3", log.callback()).await?, 2);
    producer.flush().await?;
    assert_eq!(log.values_for("A"), vec!["1", "2", "3"]);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_and_is_idempotent() -> Result<()> {
    init_tracing();

    // The broker never becomes reachable
    let broker = ScriptedBroker::new(1);
    broker.refuse_opens(u32::MAX);
    let config = ProducerConfig {
        max_retries: 100,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    producer.publish("orders", None, "2", log.callback()).await?;

    producer.close(Duration::from_millis(500)).await;
    assert!(producer.is_closed());

    let reports = log.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| r.error() == Some(&DeliveryError::Cancelled)));
    assert_eq!(producer.stats().records_failed, 2);

    // Second close is a no-op, publishing is refused
    producer.close(Duration::from_millis(500)).await;
    assert_eq!(log.reports().len(), 2);
    assert!(matches!(
        producer.publish("orders", key("A"), "3", log.callback()).await,
        Err(Error::Cancelled)
    ));
    assert_eq!(producer.stats().records_sent, 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_drains_queued_records() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(1);
    let config = ProducerConfig {
        linger_ms: 60_000,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    producer.publish("orders", key("A"), "2", log.callback()).await?;

    // Draining skips the linger time
    producer.close(Duration::from_secs(5)).await;

    let reports = log.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_delivered()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_broker_unreachable_at_startup_recovers() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(3);
    // Metadata lookup and first send both fail to connect
    broker.refuse_opens(2);
    let producer = producer(config(), &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    producer.flush().await?;

    let reports = log.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_delivered());
    // No metadata was available, so the record went to partition 0
    assert_eq!(reports[0].partition(), Some(0));
    assert_eq!(broker.opens(), 3);
    assert_eq!(producer.stats().retries, 1);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keyed_records_stick_to_one_partition() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(6);
    let producer = producer(config(), &broker).await?;
    let log = ReportLog::default();

    for i in 0..3 {
        producer
            .publish("orders", key("user02"), i.to_string(), log.callback())
            .await?;
    }
    producer.flush().await?;

    let expected = murmur2_partition(b"user02", 6);
    assert!(log
        .reports()
        .iter()
        .all(|r| r.partition() == Some(expected)));
    assert_eq!(producer.partition_count("orders").await, 6);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_send_awaits_outcome() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(2);
    let producer = producer(config(), &broker).await?;

    let first = producer.send("orders", None, "a").await?;
    let second = producer.send("orders", None, "b").await?;
    assert_eq!(first.topic, "orders");
    // Keyless records share one lane and rotate over partitions
    assert_eq!((first.sequence, second.sequence), (0, 1));
    assert_ne!(first.partition, second.partition);

    broker.fail_next([TransportError::fatal("INVALID_REQUEST: bad record")]);
    let err = producer.send("orders", key("A"), "c").await.unwrap_err();
    assert!(matches!(err, Error::Delivery(DeliveryError::Rejected(_))));

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_explicit_partition() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(3);
    let producer = producer(config(), &broker).await?;
    let log = ReportLog::default();

    producer
        .publish_to_partition("orders", 2, None, "x", log.callback())
        .await?;
    let err = producer
        .publish_to_partition("orders", 3, None, "y", log.callback())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPartition {
            partition: 3,
            partitions: 3,
            ..
        }
    ));

    producer.flush().await?;
    assert_eq!(log.reports().len(), 1);
    assert_eq!(log.reports()[0].partition(), Some(2));

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_publish_serialized() -> Result<()> {
    init_tracing();

    #[derive(serde::Serialize)]
    struct Order {
        user: String,
        item: String,
        quantity: u32,
    }

    let broker = ScriptedBroker::new(1);
    let producer = producer(config(), &broker).await?;
    let log = ReportLog::default();
    let serializer = JsonSerializer::new().with_key(|o: &Order| Some(Bytes::from(o.user.clone())));

    let order = Order {
        user: "user02".into(),
        item: "chicken bowl".into(),
        quantity: 1,
    };
    producer
        .publish_serialized("orders", &order, &serializer, log.callback())
        .await?;
    producer.flush().await?;

    let reports = log.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].key, Some(Bytes::from("user02")));
    let decoded: serde_json::Value = serde_json::from_slice(&reports[0].value)?;
    assert_eq!(decoded["item"], "chicken bowl");

    // A serialization failure is reported synchronously and enqueues nothing
    let mut bad = std::collections::HashMap::new();
    bad.insert(vec![1u8], 1u32);
    let err = producer
        .publish_serialized("orders", &bad, &JsonSerializer::new(), log.callback())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
    assert_eq!(producer.stats().records_sent, 1);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keyed_lane_keeps_partition_when_metadata_arrives() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(6);
    // Only the first metadata lookup fails
    broker.refuse_opens(1);
    let config = ProducerConfig {
        linger_ms: 1_000,
        retry_backoff_ms: 10,
        retry_backoff_max_ms: 50,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", key("A"), "1", log.callback()).await?;
    // Past the lookup backoff, still inside linger: the real count is fetched
    tokio::time::advance(Duration::from_millis(60)).await;
    producer.publish("orders", key("A"), "2", log.callback()).await?;
    assert_eq!(producer.partition_count("orders").await, 6);
    producer.flush().await?;

    // Once the lane is idle the hash decides again
    producer.publish("orders", key("A"), "3", log.callback()).await?;
    producer.flush().await?;

    let hashed = murmur2_partition(b"A", 6);
    assert_ne!(hashed, 0);
    let partitions: Vec<Option<u32>> = log.reports().iter().map(|r| r.partition()).collect();
    assert_eq!(partitions, vec![Some(0), Some(0), Some(hashed)]);
    assert_eq!(log.values_for("A"), vec!["1", "2", "3"]);

    let sent = broker.sent();
    assert_eq!(sent[0].partition, 0);
    assert_eq!(sent[0].values, vec!["1", "2"]);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_metadata_lookup_is_not_repeated_per_record() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(3);
    broker.refuse_opens(1);
    let config = ProducerConfig {
        linger_ms: 1_000,
        retry_backoff_max_ms: 5_000,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    let log = ReportLog::default();

    producer.publish("orders", None, "a", log.callback()).await?;
    producer.publish("orders", key("B"), "b", log.callback()).await?;
    producer.publish("orders", key("C"), "c", log.callback()).await?;
    assert_eq!(broker.opens(), 1);

    producer.flush().await?;
    let reports = log.reports();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.partition() == Some(0)));
    // The pipeline connected once to send
    assert_eq!(broker.opens(), 2);

    // Still inside the backoff window, so the fallback is served locally
    assert_eq!(producer.partition_count("orders").await, 1);
    assert_eq!(producer.refresh_metadata("orders").await?, 3);
    assert_eq!(producer.partition_count("orders").await, 3);

    producer.close(Duration::from_secs(5)).await;
    Ok(())
}

fn assert_send<T: Send>(_: T) {}

#[tokio::test(start_paused = true)]
async fn test_metadata_cleanup_stops_on_close() -> Result<()> {
    init_tracing();

    let broker = ScriptedBroker::new(2);
    assert_send(Producer::with_connection_factory(config(), broker.factory()));

    let config = ProducerConfig {
        metadata_max_age_ms: 30_000,
        ..config()
    };
    let producer = producer(config, &broker).await?;
    assert_eq!(producer.partition_count("orders").await, 2);

    // Let the cleanup interval fire a few times
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(producer.partition_count("orders").await, 2);

    tokio::time::timeout(Duration::from_secs(1), producer.close(Duration::from_secs(1)))
        .await?;
    assert!(producer.is_closed());
    Ok(())
}
