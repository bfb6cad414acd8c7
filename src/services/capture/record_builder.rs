//! 记录组装
//!
//! 纯组合逻辑，无 I/O；缺失的可选字段直接省略。

use chrono::Utc;

use super::extractor::ContentExtractor;
use super::noise::NoiseSuppressor;
use crate::models::message::{user_turns_with_text, UNKNOWN_MODEL};
use crate::models::record::{PendingRequest, RequestSnapshot, ResponseMeta, TrafficRecord};
use crate::models::usage::UsageStats;

#[derive(Debug, Clone)]
pub struct RecordBuilder {
    extractor: ContentExtractor,
    suppressor: Option<NoiseSuppressor>,
}

impl RecordBuilder {
    pub fn new(extractor: ContentExtractor) -> Self {
        Self {
            extractor,
            suppressor: None,
        }
    }

    /// 查找最后一条用户输入时跳过整体属于噪声的消息
    pub fn with_suppressor(mut self, suppressor: NoiseSuppressor) -> Self {
        self.suppressor = Some(suppressor);
        self
    }

    /// 最近一条去噪后仍有内容的用户输入
    ///
    /// 工具循环中最后一条用户消息常常只有 tool_result 加注入的提醒块，
    /// 此时继续向前找真正的提问。
    fn last_user_text(&self, pending: &PendingRequest) -> Option<String> {
        user_turns_with_text(&pending.messages)
            .map(|m| self.extractor.extract(&m.content).trim().to_string())
            .find(|text| {
                !text.is_empty()
                    && !self
                        .suppressor
                        .as_ref()
                        .is_some_and(|suppressor| suppressor.is_noise(text))
            })
    }

    pub fn build(
        &self,
        pending: PendingRequest,
        response: ResponseMeta,
        text: String,
        usage: UsageStats,
    ) -> TrafficRecord {
        let last_user_text = self.last_user_text(&pending);

        let request = RequestSnapshot {
            model: pending.model.clone(),
            message_count: pending.messages.len(),
            stream: pending.stream,
            max_tokens: pending.max_tokens,
            temperature: pending.temperature,
            system_preview: pending.system_preview,
            last_user_text,
            size: pending.raw_body.len(),
            body: String::from_utf8_lossy(&pending.raw_body).into_owned(),
            created_at: pending.created_at,
        };

        let model = if pending.model.is_empty() {
            UNKNOWN_MODEL.to_string()
        } else {
            pending.model
        };

        TrafficRecord {
            conversation_id: pending.conversation_id,
            flow_id: pending.flow_id,
            model,
            request,
            output_text: text,
            usage,
            status_code: response.status_code,
            content_type: response.content_type,
            message_id: response.message_id,
            stop_reason: response.stop_reason,
            rate_limits: response.rate_limits,
            response_body: response.body,
            timestamp: Utc::now(),
        }
    }
}

/// 截取前 `max_chars` 个字符并把换行替换为空格
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}
