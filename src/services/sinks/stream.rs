//! 追加写入的原始流量流（JSONL）
//!
//! 每条记录写入两行：request 与 response，按时间顺序追加，供 `tail` 命令读取。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ConnectionState, ConnectionTracker, Sink};
use crate::error::AppResult;
use crate::models::record::TrafficRecord;

/// 流中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEntry {
    Request {
        timestamp: DateTime<Utc>,
        flow_id: String,
        model: String,
        message_count: usize,
        size: usize,
        body: String,
    },
    Response {
        timestamp: DateTime<Utc>,
        flow_id: String,
        status_code: u16,
        #[serde(default)]
        content_type: Option<String>,
        size: usize,
        body: String,
    },
}

impl StreamEntry {
    /// 由一条记录生成 request / response 两行
    pub fn pair_from_record(record: &TrafficRecord) -> [StreamEntry; 2] {
        [
            StreamEntry::Request {
                timestamp: record.request.created_at,
                flow_id: record.flow_id.clone(),
                model: record.model.clone(),
                message_count: record.request.message_count,
                size: record.request.size,
                body: record.request.body.clone(),
            },
            StreamEntry::Response {
                timestamp: record.timestamp,
                flow_id: record.flow_id.clone(),
                status_code: record.status_code,
                content_type: record.content_type.clone(),
                size: record.response_body.len(),
                body: record.response_body.clone(),
            },
        ]
    }

    /// 解析一行；空行或无法解析的行返回 None
    pub fn parse_line(line: &str) -> Option<StreamEntry> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    pub fn flow_id(&self) -> &str {
        match self {
            StreamEntry::Request { flow_id, .. } | StreamEntry::Response { flow_id, .. } => flow_id,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            StreamEntry::Request { body, .. } | StreamEntry::Response { body, .. } => body,
        }
    }
}

pub struct StreamSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
    tracker: ConnectionTracker,
}

impl StreamSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
            tracker: ConnectionTracker::new("stream"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    async fn open(&self) -> AppResult<File> {
        self.tracker.transition(ConnectionState::Connecting);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.tracker.transition(ConnectionState::Connected);
        tracing::debug!(path = %self.path.display(), "流量流文件已打开");
        Ok(file)
    }
}

#[async_trait]
impl Sink for StreamSink {
    fn name(&self) -> &str {
        "stream"
    }

    async fn write(&self, record: &TrafficRecord) -> AppResult<()> {
        let mut buf = Vec::new();
        for entry in StreamEntry::pair_from_record(record) {
            serde_json::to_writer(&mut buf, &entry)?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            match self.open().await {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    self.tracker.transition(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }

        let result = match guard.as_mut() {
            Some(file) => match file.write_all(&buf).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            },
            None => Ok(()),
        };

        if let Err(e) = result {
            // 丢弃句柄，下次写入时重新打开
            *guard = None;
            self.tracker.transition(ConnectionState::Disconnected);
            return Err(e.into());
        }

        tracing::debug!(
            flow_id = %record.flow_id,
            bytes = buf.len(),
            "已追加到流量流"
        );
        Ok(())
    }
}
