// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB writer against a minimal HTTP stub.

use chrono::{TimeZone, Utc};
use telemetry_bridge::config::InfluxDbConfig;
use telemetry_bridge::{InfluxStore, Point, PointStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct CapturedRequest {
    head: String,
    body: String,
}

/// Serve one request with `status`, handing back what was received.
async fn serve_once(status: u16, reply: &'static str) -> (String, oneshot::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        let (head, body_start, content_length) = loop {
            let n = stream.read(&mut chunk).await.expect("read");
            assert!(n > 0, "client closed early");
            data.extend_from_slice(&chunk[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..pos]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                break (head, pos + 4, length);
            }
        };
        while data.len() < body_start + content_length {
            let n = stream.read(&mut chunk).await.expect("read body");
            assert!(n > 0, "client closed early");
            data.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&data[body_start..body_start + content_length]).to_string();

        let response = format!(
            "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            reply.len(),
            reply
        );
        stream.write_all(response.as_bytes()).await.expect("write");
        let _ = tx.send(CapturedRequest { head, body });
    });

    (url, rx)
}

fn config(url: String) -> InfluxDbConfig {
    InfluxDbConfig {
        url,
        org: "globalsolution".into(),
        bucket: "iot".into(),
        token: "secret-token".into(),
        timeout_ms: 5_000,
    }
}

fn points() -> Vec<Point> {
    let ts = Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp");
    vec![
        Point::builder("energy", ts).field("value", 42i64).build().expect("point"),
        Point::builder("price", ts)
            .field("value", 7i64)
            .tag("site", "main plant")
            .build()
            .expect("point"),
    ]
}

#[tokio::test]
async fn test_write_request_format() {
    let (url, captured) = serve_once(204, "").await;
    let store = InfluxStore::new(&config(url)).expect("store");

    store.write_batch(&points()).await.expect("write");

    let request = captured.await.expect("captured");
    let request_line = request.head.lines().next().expect("request line");
    assert_eq!(
        request_line,
        "POST /api/v2/write?org=globalsolution&bucket=iot&precision=ns HTTP/1.1"
    );
    assert!(request
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("authorization: Token secret-token")));
    assert_eq!(
        request.body,
        "energy value=42i 1700000000000000000\nprice,site=main\\ plant value=7i 1700000000000000000"
    );
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (url, _captured) = serve_once(503, r#"{"code":"unavailable"}"#).await;
    let store = InfluxStore::new(&config(url)).expect("store");

    let err = store.write_batch(&points()).await.unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.status, Some(503));
    assert!(err.message.contains("unavailable"));
}

#[tokio::test]
async fn test_bad_request_is_fatal() {
    let (url, _captured) = serve_once(400, r#"{"code":"invalid","message":"unable to parse"}"#).await;
    let store = InfluxStore::new(&config(url)).expect("store");

    let err = store.write_batch(&points()).await.unwrap_err();
    assert!(!err.retryable);
    assert_eq!(err.status, Some(400));
}

#[tokio::test]
async fn test_throttling_is_retryable() {
    let (url, _captured) = serve_once(429, "").await;
    let store = InfluxStore::new(&config(url)).expect("store");

    let err = store.write_batch(&points()).await.unwrap_err();
    assert!(err.retryable);
    assert_eq!(err.status, Some(429));
}
