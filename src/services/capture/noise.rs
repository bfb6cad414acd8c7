//! 噪声过滤
//!
//! 调用方框架会在消息中注入 `<tag>...</tag>` 形式的标注块（system-reminder、
//! IDE 状态等）。这里用边界扫描而不是正则去除它们，畸形或嵌套的标签不会误删内容。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::config::NoiseSection;

static EXCESS_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex is valid"));

/// 剥离一类噪声标签块
///
/// 从第一个开标签删到最后一个闭标签的末尾，保留两侧内容；
/// 任一标签缺失或闭标签出现在开标签之前时原样返回。
pub fn strip(text: &str, tag: &str) -> String {
    let open_tag = format!("<{}>", tag);
    let close_tag = format!("</{}>", tag);

    let Some(first_open) = text.find(&open_tag) else {
        return text.to_string();
    };
    let Some(last_close) = text.rfind(&close_tag) else {
        return text.to_string();
    };
    if last_close < first_open {
        return text.to_string();
    }

    let end_of_last_close = last_close + close_tag.len();
    let before = text[..first_open].trim();
    let after = remove_complete_spans(text[end_of_last_close..].trim(), &open_tag, &close_tag);
    let after = after.trim();

    match (before.is_empty(), after.is_empty()) {
        (false, false) => format!("{}\n\n{}", before, after),
        (false, true) => before.to_string(),
        (true, false) => after.to_string(),
        (true, true) => String::new(),
    }
}

/// 删除剩余文本中所有完整的 `<tag>...</tag>` 块（非贪婪）
fn remove_complete_spans(text: &str, open_tag: &str, close_tag: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find(open_tag) {
        let search_from = open + open_tag.len();
        match rest[search_from..].find(close_tag) {
            Some(close) => {
                result.push_str(&rest[..open]);
                rest = &rest[search_from + close + close_tag.len()..];
            }
            None => break,
        }
    }
    result.push_str(rest);
    result
}

/// 按配置顺序剥离全部噪声标签
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    tags: Vec<String>,
}

impl NoiseFilter {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    /// 依次剥离每个标签，最后把三个以上连续换行压缩为两个
    pub fn clean(&self, text: &str) -> String {
        let stripped = self
            .tags
            .iter()
            .fold(text.to_string(), |acc, tag| strip(&acc, tag));

        EXCESS_NEWLINES
            .replace_all(&stripped, "\n\n")
            .trim()
            .to_string()
    }
}

impl From<&NoiseSection> for NoiseFilter {
    fn from(section: &NoiseSection) -> Self {
        Self::new(section.tags.clone())
    }
}

/// 整条消息级别的噪声判定（各 Sink 按需使用）
#[derive(Debug, Clone)]
pub struct NoiseSuppressor {
    exact: Vec<String>,
    prefixes: Vec<String>,
    min_length: usize,
    sentence_marks: Vec<char>,
}

impl NoiseSuppressor {
    pub fn new(
        exact: Vec<String>,
        prefixes: Vec<String>,
        min_length: usize,
        sentence_marks: &str,
    ) -> Self {
        Self {
            exact,
            prefixes,
            min_length,
            sentence_marks: sentence_marks.chars().collect(),
        }
    }

    /// 文本（应先去除标签并 trim）是否整体属于噪声
    pub fn is_noise(&self, text: &str) -> bool {
        if self.exact.iter().any(|e| e == text) {
            return true;
        }
        if self.prefixes.iter().any(|p| text.starts_with(p.as_str())) {
            return true;
        }
        // 很短且没有句末标点，多半是命令回显
        text.chars().count() < self.min_length
            && !text.chars().any(|c| self.sentence_marks.contains(&c))
    }
}

impl From<&NoiseSection> for NoiseSuppressor {
    fn from(section: &NoiseSection) -> Self {
        Self::new(
            section.exact.clone(),
            section.prefixes.clone(),
            section.min_length,
            &section.sentence_marks,
        )
    }
}
