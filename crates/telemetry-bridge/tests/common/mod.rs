// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures: scripted stores, in-memory dead letters and a fake broker.

#![allow(dead_code)]

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::dead_letter::DeadLetterError;
use telemetry_bridge::mqtt::Incoming;
use telemetry_bridge::{
    BoxFuture, BridgeConfig, BrokerConnector, BrokerError, BrokerSession, DeadLetterRecord,
    DeadLetterSink, Point, PointStore, RawMessage, StoreWriteError, TopicFilter,
};
use tokio::sync::mpsc;

pub fn point(measurement: &str, value: i64) -> Point {
    Point::builder(measurement, Utc::now())
        .field("value", value)
        .build()
        .expect("point")
}

pub fn int_value(point: &Point) -> i64 {
    match point.field("value") {
        Some(telemetry_bridge::FieldValue::Integer(v)) => *v,
        other => panic!("expected integer value, got {:?}", other),
    }
}

/// Poll `cond` until it holds, failing after `limit`.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Store answering from a script; once the script runs out every write
/// succeeds.
#[derive(Default)]
pub struct ScriptedStore {
    script: Mutex<VecDeque<Result<(), StoreWriteError>>>,
    delay: Mutex<Option<Duration>>,
    /// Every attempt, successful or not.
    attempts: Mutex<Vec<Vec<Point>>>,
    /// Only successful writes.
    written: Mutex<Vec<Vec<Point>>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: usize, err: StoreWriteError) -> Arc<Self> {
        let store = Self::default();
        store.script.lock().extend((0..times).map(|_| Err(err.clone())));
        Arc::new(store)
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn attempts(&self) -> Vec<Vec<Point>> {
        self.attempts.lock().clone()
    }

    pub fn batches(&self) -> Vec<Vec<Point>> {
        self.written.lock().clone()
    }

    pub fn points(&self) -> Vec<Point> {
        self.written.lock().iter().flatten().cloned().collect()
    }
}

impl PointStore for ScriptedStore {
    fn write_batch<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), StoreWriteError>> {
        Box::pin(async move {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.attempts.lock().push(points.to_vec());
            let outcome = self.script.lock().pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.written.lock().push(points.to_vec());
            }
            outcome
        })
    }
}

/// Dead letters kept in memory.
#[derive(Default)]
pub struct MemoryDeadLetter {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }

    pub fn points(&self) -> usize {
        self.records.lock().iter().map(|r| r.points.len()).sum()
    }
}

impl DeadLetterSink for MemoryDeadLetter {
    fn record<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), DeadLetterError>> {
        self.records.lock().push(record.clone());
        Box::pin(async { Ok(()) })
    }
}

/// In-process broker: the test publishes, the pipeline receives.
#[derive(Clone)]
pub struct FakeBroker {
    tx: mpsc::UnboundedSender<Incoming>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>>,
    acks: Arc<Mutex<Vec<u16>>>,
    subscriptions: Arc<Mutex<Vec<Vec<String>>>>,
    refuse: Arc<AtomicU32>,
    connects: Arc<AtomicUsize>,
    next_id: Arc<AtomicU32>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            acks: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            refuse: Arc::new(AtomicU32::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Refuse the next `n` connection attempts (`u32::MAX` for always).
    pub fn refuse_connections(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Publish at QoS 1; returns the packet id.
    pub fn publish(&self, topic: &str, payload: &str) -> u16 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u16;
        self.send(topic, payload, Some(id));
        id
    }

    pub fn publish_qos0(&self, topic: &str, payload: &str) {
        self.send(topic, payload, None);
    }

    fn send(&self, topic: &str, payload: &str, packet_id: Option<u16>) {
        let incoming = Incoming {
            message: RawMessage::new(topic, payload.to_string()),
            packet_id,
        };
        self.tx.send(incoming).expect("fake broker receiver alive");
    }

    pub fn acks(&self) -> Vec<u16> {
        self.acks.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }
}

impl BrokerConnector for FakeBroker {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn BrokerSession>, BrokerError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        let session = FakeSession {
            broker: self.clone(),
        };
        Box::pin(async move {
            if refused {
                return Err(BrokerError::Refused {
                    code: 3,
                    reason: "server unavailable",
                });
            }
            Ok(Box::new(session) as Box<dyn BrokerSession>)
        })
    }
}

struct FakeSession {
    broker: FakeBroker,
}

impl BrokerSession for FakeSession {
    fn subscribe<'a>(
        &'a mut self,
        filters: &'a [TopicFilter],
        _qos: u8,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.broker
            .subscriptions
            .lock()
            .push(filters.iter().map(|f| f.as_str().to_string()).collect());
        Box::pin(async { Ok(()) })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Incoming, BrokerError>> {
        let rx = self.broker.rx.clone();
        Box::pin(async move {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(incoming) => Ok(incoming),
                None => Err(BrokerError::Closed),
            }
        })
    }

    fn ack(&mut self, packet_id: u16) -> BoxFuture<'_, Result<(), BrokerError>> {
        self.broker.acks.lock().push(packet_id);
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Example configuration tuned for tests.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::example();
    config.influxdb.token = "test".into();
    config.reconnect.initial_backoff_ms = 10;
    config.reconnect.max_backoff_ms = 50;
    config.batch.max_batch_size = 1;
    config.batch.max_batch_interval_ms = 50;
    config.retry.base_backoff_ms = 10;
    config.retry.max_backoff_ms = 50;
    config.shutdown_timeout_ms = 5_000;
    config
}

/// Run `fut` with a generous wall-clock limit.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, fut).await.expect("timed out")
}
