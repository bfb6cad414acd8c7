//! Token 用量统计
//!
//! 各事件分别携带一部分字段，按"后到的非空值覆盖，缺失字段保留原值"的规则合并

use serde::{Deserialize, Serialize};

/// 一次响应的 Token 用量（所有字段可选，逐步填充）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
}

/// API 原始 usage 对象
///
/// 缓存创建 token 优先读取扁平字段，回退到嵌套的 `cache_creation` 对象
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation: Option<WireCacheCreation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireCacheCreation {
    #[serde(default)]
    pub ephemeral_5m_input_tokens: Option<u64>,
    #[serde(default)]
    pub ephemeral_1h_input_tokens: Option<u64>,
}

impl UsageStats {
    pub fn from_wire(wire: &WireUsage) -> Self {
        let cache_creation_tokens = wire.cache_creation_input_tokens.or_else(|| {
            wire.cache_creation.as_ref().and_then(|nested| {
                match (
                    nested.ephemeral_5m_input_tokens,
                    nested.ephemeral_1h_input_tokens,
                ) {
                    (None, None) => None,
                    (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
                }
            })
        });

        Self {
            input_tokens: wire.input_tokens,
            output_tokens: wire.output_tokens,
            cache_creation_tokens,
            cache_read_tokens: wire.cache_read_input_tokens,
        }
    }

    /// 合并另一份用量：`other` 中的非空字段覆盖当前值，空字段不影响
    pub fn merge(&mut self, other: &UsageStats) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_creation_tokens.is_some() {
            self.cache_creation_tokens = other.cache_creation_tokens;
        }
        if other.cache_read_tokens.is_some() {
            self.cache_read_tokens = other.cache_read_tokens;
        }
    }

    /// 计算总 Token 数量（缺失字段按 0 计）
    pub fn total(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
            + self.output_tokens.unwrap_or(0)
            + self.cache_creation_tokens.unwrap_or(0)
            + self.cache_read_tokens.unwrap_or(0)
    }
}
