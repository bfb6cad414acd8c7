//! Langfuse 可观测性输出
//!
//! 每条记录作为一个 trace + 一个 generation 提交到 ingestion 接口，
//! 完整请求体作为 input，便于事后排查单次调用。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::Sink;
use crate::error::{AppError, AppResult};
use crate::models::config::LangfuseSinkSection;
use crate::models::message::{MessageContent, RequestEnvelope, Role};
use crate::models::record::TrafficRecord;
use crate::services::capture::record_builder::preview;

const INGESTION_PATH: &str = "/api/public/ingestion";
const PREVIEW_CHARS: usize = 60;
const TRACE_SOURCE: &str = "flowscribe";

#[derive(Debug, Default, Deserialize)]
struct IngestionResponse {
    #[serde(default)]
    errors: Vec<Value>,
}

pub struct LangfuseSink {
    client: Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
}

impl LangfuseSink {
    pub fn new(base_url: &str, public_key: String, secret_key: String) -> AppResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), INGESTION_PATH),
            public_key,
            secret_key,
        })
    }

    pub fn from_config(section: &LangfuseSinkSection) -> AppResult<Self> {
        let public_key = section
            .public_key
            .clone()
            .ok_or_else(|| AppError::config("Langfuse public_key 未配置"))?;
        let secret_key = section
            .secret_key
            .clone()
            .ok_or_else(|| AppError::config("Langfuse secret_key 未配置"))?;
        Self::new(&section.base_url, public_key, secret_key)
    }
}

/// 缩短模型名：去掉 `claude-` 前缀，日期段 `-20xxxxxx` 变为 `-xxxxxx`
pub fn short_model(model: &str) -> String {
    model.replace("claude-", "").replace("-20", "-")
}

/// trace 名称：`<短模型名>: <预览>...`
///
/// 优先使用 system prompt，其次是最后一条用户消息的文本。
pub fn trace_name(envelope: &RequestEnvelope) -> String {
    let model = short_model(&envelope.model);

    match &envelope.system {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            return format!("{}: {}...", model, preview(text, PREVIEW_CHARS));
        }
        Some(MessageContent::Blocks(blocks)) if !blocks.is_empty() => {
            let snippet = blocks
                .iter()
                .find_map(|b| b.as_text())
                .map(|text| preview(text, PREVIEW_CHARS))
                .unwrap_or_else(|| "system-blocks".to_string());
            return format!("{}: {}...", model, snippet);
        }
        _ => {}
    }

    for message in envelope.messages.iter().rev().filter(|m| m.role == Role::User) {
        let text = match &message.content {
            MessageContent::Text(text) => Some(text.as_str()),
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| b.as_text()),
        };
        if let Some(text) = text {
            return format!("{}: {}...", model, preview(text, PREVIEW_CHARS));
        }
    }

    format!("{}: (no preview)", model)
}

/// 组装一次 ingestion 请求体（trace-create + generation-create）
pub fn ingestion_batch(record: &TrafficRecord) -> Value {
    let envelope = RequestEnvelope::parse(record.request.body.as_bytes());
    let name = trace_name(&envelope);
    let input = envelope
        .raw
        .clone()
        .unwrap_or_else(|| Value::String(record.request.body.clone()));

    let trace_id = Uuid::new_v4().to_string();
    let now = record.timestamp.to_rfc3339();
    let metadata = json!({
        "source": TRACE_SOURCE,
        "flow_id": record.flow_id,
        "conversation_id": record.conversation_id,
        "status_code": record.status_code,
        "streaming": record.is_streaming_response(),
    });

    json!({
        "batch": [
            {
                "id": Uuid::new_v4().to_string(),
                "timestamp": now,
                "type": "trace-create",
                "body": {
                    "id": trace_id,
                    "name": name,
                    "timestamp": record.request.created_at.to_rfc3339(),
                    "input": input,
                    "output": record.output_text,
                    "metadata": metadata,
                }
            },
            {
                "id": Uuid::new_v4().to_string(),
                "timestamp": now,
                "type": "generation-create",
                "body": {
                    "id": Uuid::new_v4().to_string(),
                    "traceId": trace_id,
                    "name": name,
                    "startTime": record.request.created_at.to_rfc3339(),
                    "endTime": now,
                    "model": record.model,
                    "modelParameters": {
                        "max_tokens": record.request.max_tokens,
                        "temperature": record.request.temperature,
                        "stream": record.request.stream,
                    },
                    "input": input,
                    "output": record.output_text,
                    "usageDetails": {
                        "input": record.usage.input_tokens,
                        "output": record.usage.output_tokens,
                        "cache_creation_input_tokens": record.usage.cache_creation_tokens,
                        "cache_read_input_tokens": record.usage.cache_read_tokens,
                        "total": record.usage.total(),
                    },
                    "metadata": metadata,
                }
            }
        ]
    })
}

#[async_trait]
impl Sink for LangfuseSink {
    fn name(&self) -> &str {
        "langfuse"
    }

    async fn write(&self, record: &TrafficRecord) -> AppResult<()> {
        let payload = ingestion_batch(record);

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::sink(
                "langfuse",
                format!("HTTP {}: {}", status, error_text),
            ));
        }

        // 207 时逐条返回结果，只要有一条失败就视为写入失败
        let body: IngestionResponse = response.json().await.unwrap_or_default();
        if !body.errors.is_empty() {
            let rejected = body.errors.len();
            return Err(AppError::sink(
                "langfuse",
                format!("{} 个事件被拒绝: {}", rejected, Value::Array(body.errors)),
            ));
        }

        tracing::debug!(flow_id = %record.flow_id, "已提交到 Langfuse");
        Ok(())
    }
}
