//! SSE 事件模型
//!
//! SSE 格式示例：
//! ```text
//! data: {"type":"message_start","message":{...}}
//!
//! data: {"type":"content_block_delta",...}
//!
//! data: {"type":"message_delta","delta":{...},"usage":{...}}
//! ```

use serde::Deserialize;

use super::usage::WireUsage;

pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE: &str = "[DONE]";

/// 单行 `data:` 解析出的事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    MessageStart {
        #[serde(default)]
        message: StartMessage,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: u32,
        delta: Delta,
    },
    MessageDelta {
        #[serde(default)]
        delta: Option<MessageDeltaBody>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

impl SseEvent {
    /// 解析一行 SSE 文本
    ///
    /// 非 `data:` 行、`[DONE]` 标记返回 `Ok(None)`；JSON 解析失败返回 `Err`，
    /// 由调用方决定跳过该行
    pub fn parse_line(line: &str) -> Result<Option<SseEvent>, serde_json::Error> {
        let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == SSE_DONE {
            return Ok(None);
        }
        serde_json::from_str(payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_delta() {
        let event = SseEvent::parse_line(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        )
        .unwrap()
        .unwrap();

        match event {
            SseEvent::ContentBlockDelta {
                delta: Delta::TextDelta { text },
                ..
            } => assert_eq!(text, "Hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_and_done() {
        assert!(matches!(
            SseEvent::parse_line(r#"data: {"type":"ping"}"#).unwrap(),
            Some(SseEvent::Other)
        ));
        assert!(SseEvent::parse_line("data: [DONE]").unwrap().is_none());
        assert!(SseEvent::parse_line("event: message_start").unwrap().is_none());
        assert!(SseEvent::parse_line("data: {oops").is_err());
    }

    #[test]
    fn test_input_json_delta_is_other() {
        let event = SseEvent::parse_line(
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(
            event,
            SseEvent::ContentBlockDelta {
                delta: Delta::Other,
                ..
            }
        ));
    }
}
