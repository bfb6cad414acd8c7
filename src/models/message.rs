//! Messages API 请求体模型
//!
//! 请求体按字段逐个解码：单条消息或单个内容块格式异常时只丢弃该项，
//! 不影响整体解析。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 内容块
///
/// 只有 `Text` 参与文本重建，其余类型保留基本信息后被跳过
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String },
    ToolResult { tool_use_id: String },
    Image,
    Other { kind: String },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
    },
    Image,
}

impl ContentBlock {
    /// 从 JSON 值解码，永不失败：无法识别的块归为 `Other`
    pub fn from_value(value: &Value) -> Self {
        if let Value::String(text) = value {
            return ContentBlock::Text { text: text.clone() };
        }

        match WireBlock::deserialize(value) {
            Ok(WireBlock::Text { text }) => ContentBlock::Text { text },
            Ok(WireBlock::ToolUse { id, name }) => ContentBlock::ToolUse { id, name },
            Ok(WireBlock::ToolResult { tool_use_id }) => ContentBlock::ToolResult { tool_use_id },
            Ok(WireBlock::Image) => ContentBlock::Image,
            Err(_) => ContentBlock::Other {
                kind: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// 消息内容：纯文本或有序内容块
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => MessageContent::Text(text.clone()),
            Value::Array(items) => {
                MessageContent::Blocks(items.iter().map(ContentBlock::from_value).collect())
            }
            _ => MessageContent::Blocks(Vec::new()),
        }
    }

    /// 是否包含至少一个文本块（纯文本内容视为包含）
    pub fn has_text(&self) -> bool {
        match self {
            MessageContent::Text(_) => true,
            MessageContent::Blocks(blocks) => blocks.iter().any(|b| b.as_text().is_some()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// 解码单条消息；角色缺失或无法识别时返回 None
    pub fn from_value(value: &Value) -> Option<Self> {
        let role = value
            .get("role")
            .cloned()
            .and_then(|r| serde_json::from_value::<Role>(r).ok())?;
        let content = value
            .get("content")
            .map(MessageContent::from_value)
            .unwrap_or_default();
        Some(Self { role, content })
    }
}

/// 请求体中与采集相关的字段
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<MessageContent>,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    /// 原始 JSON（解析失败时为 None）
    pub raw: Option<Value>,
}

pub const UNKNOWN_MODEL: &str = "unknown";

impl RequestEnvelope {
    /// 解析请求体，失败时返回默认值（model = "unknown"，无消息，非流式）
    pub fn parse(body: &[u8]) -> Self {
        let json = match serde_json::from_slice::<Value>(body) {
            Ok(json @ Value::Object(_)) => json,
            Ok(_) | Err(_) => {
                tracing::debug!(size = body.len(), "请求体不是 JSON 对象，使用默认值");
                return Self {
                    model: UNKNOWN_MODEL.to_string(),
                    ..Default::default()
                };
            }
        };

        let messages = json
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let message = Message::from_value(item);
                        if message.is_none() {
                            tracing::debug!("跳过无法解析的消息");
                        }
                        message
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            model: json
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(UNKNOWN_MODEL)
                .to_string(),
            messages,
            system: json
                .get("system")
                .filter(|v| !v.is_null())
                .map(MessageContent::from_value),
            stream: json.get("stream").and_then(Value::as_bool).unwrap_or(false),
            max_tokens: json.get("max_tokens").and_then(Value::as_u64),
            temperature: json.get("temperature").and_then(Value::as_f64),
            raw: Some(json),
        }
    }
}

/// 从新到旧遍历包含文本块的用户消息（纯 tool_result 的消息被跳过）
pub fn user_turns_with_text(messages: &[Message]) -> impl Iterator<Item = &Message> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User && m.content.has_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_decoding_never_fails() {
        assert_eq!(
            ContentBlock::from_value(&json!({"type": "text", "text": "hi"})),
            ContentBlock::Text {
                text: "hi".to_string()
            }
        );
        assert_eq!(
            ContentBlock::from_value(&json!({"type": "image", "source": {"type": "base64"}})),
            ContentBlock::Image
        );
        assert_eq!(
            ContentBlock::from_value(&json!({"type": "thinking", "thinking": "..."})),
            ContentBlock::Other {
                kind: "thinking".to_string()
            }
        );
        assert_eq!(
            ContentBlock::from_value(&json!(42)),
            ContentBlock::Other {
                kind: "unknown".to_string()
            }
        );
        assert_eq!(
            ContentBlock::from_value(&json!("bare")),
            ContentBlock::Text {
                text: "bare".to_string()
            }
        );
    }

    #[test]
    fn test_parse_request_envelope() {
        let body = json!({
            "model": "claude-sonnet-4-5-20250929",
            "stream": true,
            "max_tokens": 1024,
            "temperature": 0.5,
            "system": "You are helpful",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": [{"type": "text", "text": "ok"}]},
                {"role": "tool", "content": "ignored"},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1"}]}
            ]
        });
        let envelope = RequestEnvelope::parse(body.to_string().as_bytes());

        assert_eq!(envelope.model, "claude-sonnet-4-5-20250929");
        assert!(envelope.stream);
        assert_eq!(envelope.max_tokens, Some(1024));
        assert_eq!(envelope.temperature, Some(0.5));
        assert_eq!(envelope.messages.len(), 3);
        assert_eq!(
            envelope.system,
            Some(MessageContent::Text("You are helpful".to_string()))
        );

        let last = user_turns_with_text(&envelope.messages).next().unwrap();
        assert_eq!(last.content, MessageContent::Text("first".to_string()));
    }

    #[test]
    fn test_parse_invalid_body_uses_defaults() {
        let envelope = RequestEnvelope::parse(b"not json");
        assert_eq!(envelope.model, UNKNOWN_MODEL);
        assert!(envelope.messages.is_empty());
        assert!(!envelope.stream);
        assert!(envelope.raw.is_none());
    }
}
