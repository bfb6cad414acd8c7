//! 配额记录（CSV）
//!
//! 响应中带有统一限流头时追加一行，文件新建时先写表头。
//! 未采集路由（如 count_tokens）的响应也通过 `record_headers` 记录。

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Sink;
use crate::error::{AppError, AppResult};
use crate::models::record::TrafficRecord;
use crate::services::capture::{RATE_LIMIT_HEADERS, REQUEST_ID_HEADER};

struct QuotaFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl QuotaFile {
    fn append(&self, row: &[String]) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let is_new = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);

        if is_new {
            let mut header = vec!["timestamp", "request_id"];
            header.extend_from_slice(RATE_LIMIT_HEADERS);
            writer.write_record(&header)?;
        }
        writer.write_record(row)?;
        writer.flush()?;
        Ok(())
    }
}

pub struct QuotaSink {
    file: Arc<QuotaFile>,
}

impl QuotaSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: Arc::new(QuotaFile {
                path,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// 没有任何配额头时返回 None
    pub fn row_for(record: &TrafficRecord) -> Option<Vec<String>> {
        Self::row_from(record.timestamp, &record.rate_limits)
    }

    fn row_from(timestamp: DateTime<Utc>, headers: &BTreeMap<String, String>) -> Option<Vec<String>> {
        if !has_rate_limits(headers) {
            return None;
        }

        let mut row = Vec::with_capacity(RATE_LIMIT_HEADERS.len() + 2);
        row.push(timestamp.to_rfc3339());
        row.push(headers.get(REQUEST_ID_HEADER).cloned().unwrap_or_default());
        for header in RATE_LIMIT_HEADERS {
            row.push(headers.get(*header).cloned().unwrap_or_default());
        }
        Some(row)
    }

    /// 按响应头追加一行；没有配额头时返回 false
    pub async fn record_headers(&self, flow_id: &str, headers: &BTreeMap<String, String>) -> AppResult<bool> {
        let Some(row) = Self::row_from(Utc::now(), headers) else {
            return Ok(false);
        };

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.append(&row))
            .await
            .map_err(|e| AppError::sink("quota", e))??;

        tracing::info!(
            flow_id = %flow_id,
            util_5h = %utilization(headers, "anthropic-ratelimit-unified-5h-utilization"),
            util_7d = %utilization(headers, "anthropic-ratelimit-unified-7d-utilization"),
            "配额已记录"
        );
        Ok(true)
    }
}

/// 是否带有任一统一限流头
pub fn has_rate_limits(headers: &BTreeMap<String, String>) -> bool {
    RATE_LIMIT_HEADERS.iter().any(|h| headers.contains_key(*h))
}

/// 以百分比显示利用率（无法解析时为 "?"）
fn utilization(headers: &BTreeMap<String, String>, header: &str) -> String {
    headers
        .get(header)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "?".to_string())
}

#[async_trait]
impl Sink for QuotaSink {
    fn name(&self) -> &str {
        "quota"
    }

    async fn write(&self, record: &TrafficRecord) -> AppResult<()> {
        let Some(row) = Self::row_for(record) else {
            return Ok(());
        };

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.append(&row))
            .await
            .map_err(|e| AppError::sink("quota", e))??;

        tracing::info!(
            flow_id = %record.flow_id,
            util_5h = %utilization(&record.rate_limits, "anthropic-ratelimit-unified-5h-utilization"),
            util_7d = %utilization(&record.rate_limits, "anthropic-ratelimit-unified-7d-utilization"),
            "配额已记录"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sinks::dispatcher::tests::sample_record;

    fn record_with_quota(flow_id: &str) -> TrafficRecord {
        let mut record = sample_record(flow_id);
        record.rate_limits.insert(
            "anthropic-ratelimit-unified-5h-utilization".to_string(),
            "0.42".to_string(),
        );
        record.rate_limits.insert(
            "anthropic-ratelimit-unified-7d-status".to_string(),
            "allowed".to_string(),
        );
        record
            .rate_limits
            .insert("request-id".to_string(), format!("req_{}", flow_id));
        record
    }

    #[tokio::test]
    async fn test_writes_header_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = QuotaSink::new(dir.path().join("quota.csv"));

        sink.write(&record_with_quota("a")).await.unwrap();
        sink.write(&record_with_quota("b")).await.unwrap();

        let mut reader = csv::Reader::from_path(sink.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 11);
        assert_eq!(&headers[0], "timestamp");
        assert_eq!(&headers[1], "request_id");
        assert_eq!(&headers[2], "anthropic-ratelimit-unified-5h-utilization");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "req_a");
        assert_eq!(&rows[0][2], "0.42");
        assert_eq!(&rows[0][3], "");
        assert_eq!(&rows[1][1], "req_b");
    }

    #[tokio::test]
    async fn test_skips_records_without_quota_headers() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = QuotaSink::new(dir.path().join("quota.csv"));

        let mut record = sample_record("a");
        record
            .rate_limits
            .insert("request-id".to_string(), "req_a".to_string());
        sink.write(&record).await.unwrap();

        assert!(!sink.path().exists());
    }

    #[test]
    fn test_utilization_format() {
        let record = record_with_quota("a");
        assert_eq!(
            utilization(&record.rate_limits, "anthropic-ratelimit-unified-5h-utilization"),
            "42.0%"
        );
        assert_eq!(
            utilization(&record.rate_limits, "anthropic-ratelimit-unified-7d-utilization"),
            "?"
        );
    }

    #[tokio::test]
    async fn test_record_headers_without_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = QuotaSink::new(dir.path().join("quota.csv"));

        let mut headers = BTreeMap::new();
        headers.insert("request-id".to_string(), "req_count".to_string());
        assert!(!sink.record_headers("f1", &headers).await.unwrap());
        assert!(!sink.path().exists());

        headers.insert(
            "anthropic-ratelimit-unified-7d-utilization".to_string(),
            "0.9".to_string(),
        );
        assert!(sink.record_headers("f1", &headers).await.unwrap());

        let mut reader = csv::Reader::from_path(sink.path()).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "req_count");
        assert_eq!(&rows[0][5], "0.9");
    }
}
