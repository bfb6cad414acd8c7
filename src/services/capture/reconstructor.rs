//! 响应重建
//!
//! 从 SSE 事件序列或单个 JSON 响应中还原助手输出文本和 Token 用量。
//! 单行解析失败只跳过该行，不影响其余行。

use serde::Deserialize;
use serde_json::Value;

use super::extractor::ContentExtractor;
use crate::models::message::ContentBlock;
use crate::models::sse::{Delta, SseEvent};
use crate::models::usage::{UsageStats, WireUsage};

/// 重建结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub text: String,
    pub usage: UsageStats,
    pub message_id: Option<String>,
    pub stop_reason: Option<String>,
    /// 被跳过的无法解析的 data 行数
    pub skipped_lines: usize,
}

/// 非流式响应体
#[derive(Debug, Default, Deserialize)]
struct JsonMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamReconstructor {
    extractor: ContentExtractor,
}

impl StreamReconstructor {
    pub fn new(extractor: ContentExtractor) -> Self {
        Self { extractor }
    }

    /// 根据请求是否为流式选择解析路径
    pub fn reconstruct(&self, body: &[u8], is_streaming: bool) -> Reconstruction {
        if is_streaming {
            self.reconstruct_sse(body)
        } else {
            self.reconstruct_json(body)
        }
    }

    /// 解析 SSE 流：按行顺序拼接 text_delta，合并各事件中的 usage
    fn reconstruct_sse(&self, body: &[u8]) -> Reconstruction {
        let body_str = String::from_utf8_lossy(body);
        let mut result = Reconstruction::default();

        for line in body_str.lines() {
            let event = match SseEvent::parse_line(line.trim_end_matches('\r')) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "SSE 行解析失败，已跳过");
                    result.skipped_lines += 1;
                    continue;
                }
            };

            match event {
                SseEvent::MessageStart { message } => {
                    if message.id.is_some() {
                        result.message_id = message.id;
                    }
                    if let Some(usage) = message.usage {
                        // message_start 只提供输入侧统计
                        let wire = UsageStats::from_wire(&usage);
                        result.usage.merge(&UsageStats {
                            output_tokens: None,
                            ..wire
                        });
                    }
                }
                SseEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text },
                    ..
                } => {
                    result.text.push_str(&text);
                }
                SseEvent::MessageDelta { delta, usage } => {
                    if let Some(stop_reason) = delta.and_then(|d| d.stop_reason) {
                        result.stop_reason = Some(stop_reason);
                    }
                    if let Some(usage) = usage {
                        result.usage.merge(&UsageStats::from_wire(&usage));
                    }
                }
                SseEvent::ContentBlockDelta { .. } | SseEvent::MessageStop | SseEvent::Other => {}
            }
        }

        tracing::debug!(
            chars = result.text.len(),
            skipped = result.skipped_lines,
            usage = ?result.usage,
            "SSE 响应重建完成"
        );
        result
    }

    /// 解析 JSON 响应：content 数组交给内容提取器，usage 直接读取顶层字段
    fn reconstruct_json(&self, body: &[u8]) -> Reconstruction {
        let message = match serde_json::from_slice::<JsonMessage>(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, size = body.len(), "JSON 响应解析失败，使用空结果");
                return Reconstruction::default();
            }
        };

        let blocks: Vec<ContentBlock> = message.content.iter().map(ContentBlock::from_value).collect();

        Reconstruction {
            text: self.extractor.extract_blocks(&blocks),
            usage: message
                .usage
                .as_ref()
                .map(UsageStats::from_wire)
                .unwrap_or_default(),
            message_id: message.id,
            stop_reason: message.stop_reason,
            skipped_lines: 0,
        }
    }
}
