//! 流量流查看（tail）
//!
//! 读取 StreamSink 追加的 JSONL 文件：先显示最近 N 条，再轮询新追加的行。

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::error::AppResult;
use crate::models::sse::{SSE_DATA_PREFIX, SSE_DONE};
use crate::services::sinks::stream::StreamEntry;

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// 先显示的历史条数（0 表示只跟随）
    pub count: usize,
    pub follow: bool,
    /// 展开显示请求/响应正文
    pub expand: bool,
    pub color: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            count: 10,
            follow: true,
            expand: false,
            color: true,
        }
    }
}

struct Palette {
    color: bool,
}

impl Palette {
    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("{}{}{}", code, text, RESET)
        } else {
            text.to_string()
        }
    }
}

/// 按模型族着色的简称
fn model_family(model: &str) -> (&'static str, String) {
    if model.contains("haiku") {
        (YELLOW, "haiku".to_string())
    } else if model.contains("opus") {
        (CYAN, "opus".to_string())
    } else if model.contains("sonnet") {
        (GREEN, "sonnet".to_string())
    } else {
        (DIM, model.chars().take(20).collect())
    }
}

/// 单行摘要
pub fn format_entry(entry: &StreamEntry, color: bool) -> String {
    let palette = Palette { color };
    let flow_short: String = entry.flow_id().chars().take(8).collect();

    match entry {
        StreamEntry::Request {
            timestamp,
            model,
            message_count,
            size,
            ..
        } => {
            let ts = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
            let (code, family) = model_family(model);
            format!(
                "{} {} {} {:>8} bytes  msgs={}",
                palette.paint(DIM, &flow_short),
                palette.paint(DIM, &ts),
                palette.paint(code, &format!("REQ {:8}", family)),
                size,
                message_count
            )
        }
        StreamEntry::Response {
            timestamp,
            status_code,
            content_type,
            size,
            ..
        } => {
            let ts = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
            let code = if *status_code == 200 { GREEN } else { RED };
            let kind = if content_type
                .as_deref()
                .map(|ct| ct.contains("event-stream"))
                .unwrap_or(false)
            {
                "stream"
            } else {
                "json"
            };
            format!(
                "{} {} {} {:>8} bytes  {}",
                palette.paint(DIM, &flow_short),
                palette.paint(DIM, &ts),
                palette.paint(code, &format!("RES {:<8}", status_code)),
                size,
                kind
            )
        }
    }
}

/// 展开正文：JSON 美化输出；SSE 逐个 data 事件美化输出
pub fn expand_body(body: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return serde_json::to_string_pretty(&value)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default();
    }

    let mut lines = Vec::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        match line.strip_prefix(SSE_DATA_PREFIX).map(str::trim) {
            Some("") | Some(SSE_DONE) => {}
            Some(data) => match serde_json::from_str::<Value>(data) {
                Ok(event) => {
                    lines.push("  data:".to_string());
                    if let Ok(pretty) = serde_json::to_string_pretty(&event) {
                        lines.extend(pretty.lines().map(|l| format!("    {}", l)));
                    }
                }
                Err(_) => lines.push(format!("  {}", line)),
            },
            None if !line.trim().is_empty() => lines.push(format!("  {}", line)),
            None => {}
        }
    }
    lines
}

/// 增量读取追加的行
pub struct Tailer {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl Tailer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部已有条目并返回最后 `count` 条，之后从文件末尾开始跟随
    pub async fn history(&mut self, count: usize) -> AppResult<Vec<StreamEntry>> {
        let mut entries = self.poll().await?;
        if entries.len() > count {
            entries.drain(..entries.len() - count);
        }
        Ok(entries)
    }

    /// 读取上次位置之后新增的完整行；文件不存在时返回空
    pub async fn poll(&mut self) -> AppResult<Vec<StreamEntry>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::info!(path = %self.path.display(), "文件被截断，从头读取");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buf));
        let complete = match self.partial.rfind('\n') {
            Some(pos) => {
                let rest = self.partial.split_off(pos + 1);
                std::mem::replace(&mut self.partial, rest)
            }
            None => return Ok(Vec::new()),
        };

        Ok(complete.lines().filter_map(StreamEntry::parse_line).collect())
    }
}

fn print_entry(entry: &StreamEntry, options: &TailOptions) {
    println!("{}", format_entry(entry, options.color));
    if options.expand {
        for line in expand_body(entry.body()) {
            println!("{}", line);
        }
        println!();
    }
}

/// 显示历史并（可选）跟随新条目，直到取消
pub async fn run_tail(path: PathBuf, options: TailOptions, cancel: CancellationToken) -> AppResult<()> {
    let mut tailer = Tailer::new(path);

    let history = tailer.history(options.count).await?;
    for entry in &history {
        print_entry(entry, &options);
    }

    if !options.follow {
        return Ok(());
    }

    let palette = Palette { color: options.color };
    println!("\n{}\n", palette.paint(DIM, "--- Following (Ctrl+C to stop) ---"));

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                println!("\n{}", palette.paint(DIM, "Stopped."));
                break;
            }
            _ = ticker.tick() => {
                for entry in tailer.poll().await? {
                    print_entry(&entry, &options);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sinks::dispatcher::tests::sample_record;
    use tokio::io::AsyncWriteExt;

    fn lines_for(flow_id: &str) -> String {
        StreamEntry::pair_from_record(&sample_record(flow_id))
            .iter()
            .map(|e| format!("{}\n", serde_json::to_string(e).unwrap()))
            .collect()
    }

    #[test]
    fn test_format_entry_without_color() {
        let [request, response] = StreamEntry::pair_from_record(&sample_record("abcdef123456"));

        let line = format_entry(&request, false);
        assert!(line.starts_with("abcdef12 "));
        assert!(line.contains("REQ sonnet"));
        assert!(line.contains("msgs=1"));

        let line = format_entry(&response, false);
        assert!(line.contains("RES 200"));
        assert!(line.ends_with("json"));
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_format_entry_colors_errors() {
        let mut record = sample_record("f1");
        record.status_code = 529;
        record.content_type = Some("text/event-stream".to_string());
        let [_, response] = StreamEntry::pair_from_record(&record);

        let line = format_entry(&response, true);
        assert!(line.contains(RED));
        assert!(line.ends_with("stream"));
    }

    #[test]
    fn test_expand_body() {
        let json = expand_body(r#"{"id":"msg_1","content":[]}"#);
        assert_eq!(json[0], "{");
        assert!(json.iter().any(|l| l.contains("\"id\": \"msg_1\"")));

        let sse = expand_body("event: message_stop\ndata: {\"type\":\"message_stop\"}\ndata: [DONE]\n");
        assert_eq!(sse[0], "  event: message_stop");
        assert_eq!(sse[1], "  data:");
        assert_eq!(sse[2], "    {");
        assert!(sse[3].contains("\"type\": \"message_stop\""));
        assert_eq!(sse.len(), 5);
    }

    #[tokio::test]
    async fn test_history_then_follow() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("api_traffic.jsonl");
        tokio::fs::write(&path, format!("{}{}", lines_for("f1"), lines_for("f2")))
            .await
            .unwrap();

        let mut tailer = Tailer::new(path.clone());
        let history = tailer.history(3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].flow_id(), "f1");
        assert!(matches!(history[0], StreamEntry::Response { .. }));
        assert!(tailer.poll().await.unwrap().is_empty());

        // 半行不会被返回，补齐后才解析
        let next = lines_for("f3");
        let (head, tail) = next.split_at(10);
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(head.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
        assert!(tailer.poll().await.unwrap().is_empty());

        file.write_all(tail.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
        let appended = tailer.poll().await.unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[1].flow_id(), "f3");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tailer = Tailer::new(dir.path().join("absent.jsonl"));
        assert!(tailer.history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_tail_without_follow() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("api_traffic.jsonl");
        tokio::fs::write(&path, lines_for("f1")).await.unwrap();

        let options = TailOptions {
            follow: false,
            expand: true,
            color: false,
            ..Default::default()
        };
        run_tail(path, options, CancellationToken::new()).await.unwrap();
    }
}
