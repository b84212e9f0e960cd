// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end pipeline tests against an in-process broker.

mod common;

use common::{
    eventually, int_value, test_config, within, FakeBroker, MemoryDeadLetter, ScriptedStore,
};
use std::time::Duration;
use telemetry_bridge::config::{ExtractorConfig, MeasurementConfig, TopicRuleConfig};
use telemetry_bridge::{
    BridgeError, FatalCondition, FieldValue, Pipeline, StoreWriteError, SubscriptionState,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_energy_reading_is_written_and_acked() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::new();
    let mut handle = Pipeline::start(
        &test_config(),
        broker.connector(),
        store.clone(),
        MemoryDeadLetter::new(),
    )
    .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);
    assert_eq!(broker.subscriptions(), vec![vec!["/energy", "/vazao", "/price"]]);

    let id = broker.publish("/energy", "42");
    eventually(WAIT, || store.points().len() == 1).await;
    eventually(WAIT, || broker.acks() == vec![id]).await;

    let points = store.points();
    assert_eq!(points[0].measurement(), "energy");
    assert_eq!(points[0].field("value"), Some(&FieldValue::Integer(42)));

    let report = handle.shutdown(WAIT).await.expect("shutdown");
    assert_eq!(report.stats.messages_received, 1);
    assert_eq!(report.stats.points_written, 1);
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_intake() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::new();
    let mut handle = Pipeline::start(
        &test_config(),
        broker.connector(),
        store.clone(),
        MemoryDeadLetter::new(),
    )
    .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);

    let bad = broker.publish("/energy", "abc");
    broker.publish_qos0("/unknown", "1");
    let good = broker.publish("/energy", "43");
    eventually(WAIT, || store.points().len() == 1).await;

    assert_eq!(int_value(&store.points()[0]), 43);
    // Dropped messages are still acknowledged.
    eventually(WAIT, || broker.acks() == vec![bad, good]).await;

    let stats = handle.stats();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.no_rule, 1);
    assert_eq!(stats.messages_received, 3);
    handle.shutdown(WAIT).await.expect("shutdown");
}

#[tokio::test]
async fn test_untrusted_tag_values_do_not_poison_batch() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::new();
    let dead = MemoryDeadLetter::new();
    let mut config = test_config();
    config.topics.push(TopicRuleConfig {
        topic: "sensors/+".into(),
        measurements: vec![MeasurementConfig::named("m")],
        extractor: ExtractorConfig::Json {
            fields: vec!["v".into()],
            tags: vec!["id".into()],
        },
        topic_tag: None,
    });
    config.batch.max_batch_size = 2;
    config.batch.max_batch_interval_ms = 60_000;
    let mut handle = Pipeline::start(&config, broker.connector(), store.clone(), dead.clone())
        .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);

    broker.publish("sensors/a", r#"{"id":"a\nb","v":1}"#);
    broker.publish("sensors/b", r#"{"id":"a\\","v":2}"#);
    broker.publish("sensors/c", r#"{"id":"ok","v":3}"#);
    eventually(WAIT, || store.batches().len() == 1).await;

    let batch = &store.batches()[0];
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].tag("id"), Some("a\\"));
    assert_eq!(batch[1].tag("id"), Some("ok"));
    assert!(dead.records().is_empty());
    assert_eq!(handle.stats().malformed, 1);
    handle.shutdown(WAIT).await.expect("shutdown");
}

#[tokio::test]
async fn test_order_preserved_per_topic() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::new();
    let mut config = test_config();
    config.batch.max_batch_size = 8;
    config.batch.max_batch_interval_ms = 20;
    let mut handle = Pipeline::start(&config, broker.connector(), store.clone(), MemoryDeadLetter::new())
        .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);

    for v in 0..100 {
        broker.publish("/energy", &v.to_string());
        broker.publish("/price", &(1000 + v).to_string());
    }
    eventually(WAIT, || handle.stats().messages_received == 200).await;

    let report = handle.shutdown(WAIT).await.expect("shutdown");
    assert_eq!(report.stats.points_written, 200);

    let points = store.points();
    let energy: Vec<i64> = points
        .iter()
        .filter(|p| p.measurement() == "energy")
        .map(int_value)
        .collect();
    let price: Vec<i64> = points
        .iter()
        .filter(|p| p.measurement() == "price")
        .map(int_value)
        .collect();
    assert_eq!(energy, (0..100).collect::<Vec<_>>());
    assert_eq!(price, (1000..1100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_point() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::new().with_delay(Duration::from_secs(1));
    let mut config = test_config();
    config.batch.max_batch_size = 1000;
    config.batch.max_batch_interval_ms = 60_000;
    let mut handle = Pipeline::start(&config, broker.connector(), store.clone(), MemoryDeadLetter::new())
        .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);

    broker.publish("/energy", "42");
    eventually(WAIT, || handle.stats().points_queued == 1).await;
    assert!(store.attempts().is_empty());

    let report = handle.shutdown(Duration::from_secs(5)).await.expect("shutdown");
    assert_eq!(store.points().len(), 1);
    assert_eq!(report.stats.points_in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_timeout_dead_letters_pending_window() {
    let broker = FakeBroker::new();
    let store = ScriptedStore::failing(100, StoreWriteError::retryable("503").with_status(503));
    let dead = MemoryDeadLetter::new();
    let mut config = test_config();
    config.retry.base_backoff_ms = 30_000;
    config.retry.max_backoff_ms = 30_000;
    let mut handle = Pipeline::start(&config, broker.connector(), store.clone(), dead.clone())
        .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);

    broker.publish("/energy", "42");
    eventually(WAIT, || store.attempts().len() == 1).await;

    let err = handle.shutdown(Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, BridgeError::ShutdownTimeout { points_in_flight: 0 }));
    assert_eq!(dead.points(), 1);
    assert!(store.points().is_empty());
}

#[tokio::test]
async fn test_reconnect_resubscribes() {
    let broker = FakeBroker::new();
    broker.refuse_connections(2);
    let store = ScriptedStore::new();
    let mut handle = Pipeline::start(
        &test_config(),
        broker.connector(),
        store.clone(),
        MemoryDeadLetter::new(),
    )
    .expect("start");
    assert!(within(WAIT, handle.wait_for_state(SubscriptionState::Active)).await);
    assert_eq!(broker.connects(), 3);
    assert_eq!(broker.subscriptions().len(), 1);

    broker.publish("/vazao", "5");
    eventually(WAIT, || store.points().len() == 1).await;
    assert_eq!(store.points()[0].measurement(), "vazao");

    let stats = handle.stats();
    assert_eq!(stats.connection_errors, 2);
    assert_eq!(stats.connections, 1);
    handle.shutdown(WAIT).await.expect("shutdown");
}

#[tokio::test]
async fn test_connection_exhaustion_is_fatal() {
    let broker = FakeBroker::new();
    broker.refuse_connections(u32::MAX);
    let mut config = test_config();
    config.reconnect.max_attempts = 3;
    let mut handle = Pipeline::start(
        &config,
        broker.connector(),
        ScriptedStore::new(),
        MemoryDeadLetter::new(),
    )
    .expect("start");

    let fatal = within(WAIT, handle.fatal()).await;
    assert!(matches!(fatal, Some(FatalCondition::ConnectionExhausted(_))));
    assert_eq!(handle.subscription_state(), SubscriptionState::Stopped);
    assert_eq!(broker.connects(), 3);
    handle.shutdown(WAIT).await.expect("shutdown");
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = test_config();
    config.topics[0].topic = "/energy/#/bad".into();
    let err = Pipeline::start(
        &config,
        FakeBroker::new().connector(),
        ScriptedStore::new(),
        MemoryDeadLetter::new(),
    )
    .err()
    .expect("invalid topic filter");
    assert!(matches!(err, BridgeError::Config(_)));
}
