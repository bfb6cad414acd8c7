//! 消息内容提取
//!
//! 只拼接 text 块；tool_use / tool_result / image 等被跳过。
//! 去噪在拼接后的整段文本上进行一次，噪声块跨块也能被正确剥离。

use super::noise::NoiseFilter;
use crate::models::message::{ContentBlock, MessageContent};

#[derive(Debug, Clone)]
pub struct ContentExtractor {
    filter: NoiseFilter,
}

impl ContentExtractor {
    pub fn new(filter: NoiseFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &NoiseFilter {
        &self.filter
    }

    /// 提取可读文本（已去噪）
    pub fn extract(&self, content: &MessageContent) -> String {
        match content {
            MessageContent::Text(text) => self.filter.clean(text),
            MessageContent::Blocks(blocks) => self.extract_blocks(blocks),
        }
    }

    pub fn extract_blocks(&self, blocks: &[ContentBlock]) -> String {
        self.filter.clean(&join_text(blocks))
    }
}

/// 按顺序拼接所有 text 块（不去噪）
pub fn join_text(blocks: &[ContentBlock]) -> String {
    blocks.iter().filter_map(ContentBlock::as_text).collect()
}
