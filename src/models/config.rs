//! 采集服务配置
//!
//! 配置来源优先级：环境变量 > TOML 配置文件 > 默认值

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::utils::config::data_dir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// 数据目录（为空时使用 ~/.flowscribe）
    pub data_dir: Option<PathBuf>,
    pub proxy: ProxySection,
    pub correlation: CorrelationSection,
    pub noise: NoiseSection,
    pub dispatch: DispatchSection,
    pub sinks: SinksSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub listen: String,
    pub upstream: String,
    /// 路径包含任一路由即采集
    pub routes: Vec<String>,
    /// 路径包含任一排除路由则不采集
    pub exclude_routes: Vec<String>,
    pub conversation_header: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8877".to_string(),
            upstream: "https://api.anthropic.com".to_string(),
            routes: vec!["/v1/messages".to_string()],
            exclude_routes: vec!["/v1/messages/count_tokens".to_string()],
            conversation_header: "x-conversation-id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationSection {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CorrelationSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 4096,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSection {
    /// 按声明顺序依次剥离的标签名
    pub tags: Vec<String>,
    pub exact: Vec<String>,
    pub prefixes: Vec<String>,
    pub min_length: usize,
    pub sentence_marks: String,
}

impl Default for NoiseSection {
    fn default() -> Self {
        Self {
            tags: [
                "system-reminder",
                "ide_opened_file",
                "ide_selection",
                "command-name",
                "command-message",
                "command-args",
                "local-command-stdout",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exact: vec!["Stop hook feedback:".to_string()],
            prefixes: vec![
                "Command: ".to_string(),
                "<policy_spec>".to_string(),
                "<is_displaying_contents>".to_string(),
            ],
            min_length: 10,
            sentence_marks: "?!.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksSection {
    pub stream: StreamSinkSection,
    pub relational: RelationalSinkSection,
    pub langfuse: LangfuseSinkSection,
    pub quota: QuotaSinkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSinkSection {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl Default for StreamSinkSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalSinkSection {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    /// 会话来源标识
    pub source: String,
}

impl Default for RelationalSinkSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            source: "claude-code".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LangfuseSinkSection {
    pub enabled: bool,
    pub base_url: String,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for LangfuseSinkSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://cloud.langfuse.com".to_string(),
            public_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSinkSection {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

impl Default for QuotaSinkSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
    /// 日志文件目录（为空时只输出到终端）
    pub dir: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl CaptureConfig {
    /// 加载配置：读取 TOML 文件（不存在则使用默认值），再应用环境变量覆盖
    ///
    /// 不做校验，调用方应用完命令行覆盖后再调用 `validate()`
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                return Err(AppError::config(format!(
                    "配置文件不存在: {}",
                    path.display()
                )))
            }
            None => {
                let default_path = crate::utils::config::default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 应用环境变量覆盖（通过闭包读取，便于测试）
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("FLOWSCRIBE_LISTEN") {
            self.proxy.listen = listen;
        }
        if let Some(upstream) = lookup("FLOWSCRIBE_UPSTREAM") {
            self.proxy.upstream = upstream;
        }
        if let Some(dir) = lookup("FLOWSCRIBE_DATA_DIR").or_else(|| lookup("MITM_DATA_DIR")) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(base_url) = lookup("LANGFUSE_BASE_URL") {
            self.sinks.langfuse.base_url = base_url;
        }
        if let Some(key) = lookup("LANGFUSE_PUBLIC_KEY") {
            self.sinks.langfuse.public_key = Some(key);
        }
        if let Some(key) = lookup("LANGFUSE_SECRET_KEY") {
            self.sinks.langfuse.secret_key = Some(key);
        }
        if self.sinks.langfuse.public_key.is_some() && self.sinks.langfuse.secret_key.is_some() {
            self.sinks.langfuse.enabled = true;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        self.listen_addr()?;

        let upstream = url::Url::parse(&self.proxy.upstream)
            .map_err(|e| AppError::config(format!("上游地址无效 {}: {}", self.proxy.upstream, e)))?;
        if upstream.scheme() != "http" && upstream.scheme() != "https" {
            return Err(AppError::config(format!(
                "上游地址只支持 http/https: {}",
                self.proxy.upstream
            )));
        }

        if self.correlation.capacity == 0 {
            return Err(AppError::config("correlation.capacity 必须大于 0"));
        }
        if self.correlation.ttl_secs == 0 {
            return Err(AppError::config("correlation.ttl_secs 必须大于 0"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(AppError::config("dispatch.queue_capacity 必须大于 0"));
        }

        let langfuse = &self.sinks.langfuse;
        if langfuse.enabled && (langfuse.public_key.is_none() || langfuse.secret_key.is_none()) {
            return Err(AppError::config(
                "启用 Langfuse 需要同时配置 public_key 和 secret_key",
            ));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> AppResult<SocketAddr> {
        self.proxy
            .listen
            .parse()
            .map_err(|e| AppError::config(format!("监听地址无效 {}: {}", self.proxy.listen, e)))
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(data_dir)
    }

    pub fn stream_path(&self) -> PathBuf {
        self.sinks
            .stream
            .path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("api_traffic.jsonl"))
    }

    pub fn relational_path(&self) -> PathBuf {
        self.sinks
            .relational
            .path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("scribe.db"))
    }

    pub fn quota_path(&self) -> PathBuf {
        self.sinks
            .quota
            .path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("quota.csv"))
    }
}
