// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dead-letter sink.
//!
//! Batches that could not be persisted are appended here as JSON lines, one
//! record per batch, and synced to disk before the batcher moves on.

use crate::line_protocol;
use crate::point::Point;
use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Dead-letter errors.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One undeliverable batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    /// Store write attempts made before giving up.
    pub attempts: u32,
    pub points: Vec<Point>,
    /// The same points as Line Protocol, ready for manual replay.
    pub lines: Vec<String>,
}

impl DeadLetterRecord {
    pub fn new(points: Vec<Point>, reason: impl Into<String>, attempts: u32) -> Self {
        let lines = points.iter().map(line_protocol::encode_point).collect();
        Self {
            timestamp: Utc::now(),
            reason: reason.into(),
            attempts,
            points,
            lines,
        }
    }
}

/// Durable destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    fn record<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), DeadLetterError>>;
}

/// Append-only JSON lines file.
pub struct FileDeadLetterSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileDeadLetterSink {
    /// The file is created on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> DeadLetterError {
        DeadLetterError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn append(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_err(e))?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.io_err(e))?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            let result = async {
                file.write_all(&line).await?;
                file.flush().await?;
                file.sync_data().await
            }
            .await;
            if let Err(e) = result {
                // Reopen on the next record.
                *guard = None;
                return Err(self.io_err(e));
            }
        }
        Ok(())
    }
}

impl DeadLetterSink for FileDeadLetterSink {
    fn record<'a>(&'a self, record: &'a DeadLetterRecord) -> BoxFuture<'a, Result<(), DeadLetterError>> {
        Box::pin(self.append(record))
    }
}

/// Read every record from a dead-letter file.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| DeadLetterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(DeadLetterError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(v: i64) -> Point {
        Point::builder("energy", Utc::now())
            .field("value", v)
            .build()
            .expect("point")
    }

    #[tokio::test]
    async fn test_records_are_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("dead.jsonl");
        let sink = FileDeadLetterSink::new(&path);

        sink.record(&DeadLetterRecord::new(vec![point(1), point(2)], "HTTP 400", 1))
            .await
            .expect("first");
        sink.record(&DeadLetterRecord::new(vec![point(3)], "retries exhausted", 5))
            .await
            .expect("second");

        let records = read_records(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].points.len(), 2);
        assert_eq!(records[0].reason, "HTTP 400");
        assert_eq!(records[1].attempts, 5);
        assert!(records[1].lines[0].starts_with("energy value=3i "));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dead.jsonl");

        FileDeadLetterSink::new(&path)
            .record(&DeadLetterRecord::new(vec![point(1)], "a", 1))
            .await
            .expect("write");
        FileDeadLetterSink::new(&path)
            .record(&DeadLetterRecord::new(vec![point(2)], "b", 1))
            .await
            .expect("write");

        assert_eq!(read_records(&path).expect("read").len(), 2);
    }

    #[test]
    fn test_read_missing_file() {
        let err = read_records("/nonexistent/dead.jsonl").unwrap_err();
        assert!(matches!(err, DeadLetterError::Io { .. }));
    }
}
