//! 采集流水线的数据模型
//!
//! FlowRequest / FlowResponse 是代理钩子的输入，PendingRequest 在请求与响应之间
//! 由关联表独占持有，TrafficRecord 是最终交给各 Sink 的不可变记录。

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::message::Message;
use super::usage::UsageStats;

/// 代理请求钩子的输入
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub flow_id: String,
    pub path: String,
    /// 调用方通过请求头提供的会话 ID
    pub conversation_header: Option<String>,
    pub body: Bytes,
}

/// 代理响应钩子的输入
#[derive(Debug, Clone)]
pub struct FlowResponse {
    pub flow_id: String,
    pub path: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// 已捕获的配额相关响应头（小写名称）
    pub rate_limits: BTreeMap<String, String>,
    pub body: Bytes,
}

/// 等待响应的请求上下文
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub flow_id: String,
    pub conversation_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub system_preview: Option<String>,
    pub raw_body: Bytes,
    pub created_at: DateTime<Utc>,
}

/// 响应元数据（不含正文）
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub content_type: Option<String>,
    pub rate_limits: BTreeMap<String, String>,
    pub message_id: Option<String>,
    pub stop_reason: Option<String>,
    /// 解压后的响应正文（有损 UTF-8）
    pub body: String,
}

/// 原始请求快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub model: String,
    pub message_count: usize,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_preview: Option<String>,
    /// 最后一条包含文本的用户消息（已去噪）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user_text: Option<String>,
    pub size: usize,
    #[serde(skip)]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// 一次完整请求/响应的标准化记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficRecord {
    pub conversation_id: String,
    pub flow_id: String,
    pub model: String,
    pub request: RequestSnapshot,
    pub output_text: String,
    pub usage: UsageStats,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rate_limits: BTreeMap<String, String>,
    #[serde(skip)]
    pub response_body: String,
    pub timestamp: DateTime<Utc>,
}

impl TrafficRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_streaming_response(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("event-stream"))
            .unwrap_or(false)
    }
}
