//! 记录输出（Sink）
//!
//! 每条 TrafficRecord 会被分发到所有已注册的 Sink；单个 Sink 的失败只记录日志，
//! 不影响其他 Sink，也不影响代理本身。

pub(crate) mod dispatcher;
pub mod langfuse;
pub mod quota;
pub mod relational;
pub mod stream;

pub use dispatcher::{DispatchHandle, DispatchReport, DispatchStats, SinkDispatcher};
pub use langfuse::LangfuseSink;
pub use quota::QuotaSink;
pub use relational::RelationalSink;
pub use stream::StreamSink;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AppResult;
use crate::models::config::CaptureConfig;
use crate::models::record::TrafficRecord;
use crate::services::capture::noise::NoiseSuppressor;

/// 记录输出目标
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink 名称（用于日志）
    fn name(&self) -> &str;

    /// 写入一条记录
    async fn write(&self, record: &TrafficRecord) -> AppResult<()>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// 可观测的连接状态机：断开后在下一次写入时重连
#[derive(Debug)]
pub struct ConnectionTracker {
    sink: String,
    state: AtomicU8,
}

impl ConnectionTracker {
    pub fn new(sink: &str) -> Self {
        Self {
            sink: sink.to_string(),
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn transition(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.swap(next.to_u8(), Ordering::AcqRel));
        if prev != next {
            match next {
                ConnectionState::Disconnected => tracing::warn!(
                    sink = %self.sink,
                    from = prev.as_str(),
                    "Sink 连接已断开，下次写入时重连"
                ),
                _ => tracing::debug!(
                    sink = %self.sink,
                    from = prev.as_str(),
                    to = next.as_str(),
                    "Sink 连接状态变更"
                ),
            }
        }
    }
}

/// 已启用的 Sink
///
/// `quota` 同时出现在 `sinks` 中；单独保留一份供未采集路由的响应直接写入。
pub struct SinkSet {
    pub sinks: Vec<Arc<dyn Sink>>,
    pub quota: Option<Arc<QuotaSink>>,
}

/// 根据配置创建启用的 Sink
pub fn build_sinks(config: &CaptureConfig) -> AppResult<SinkSet> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    let mut quota = None;

    if config.sinks.stream.enabled {
        sinks.push(Arc::new(StreamSink::new(config.stream_path())));
    }
    if config.sinks.relational.enabled {
        sinks.push(Arc::new(RelationalSink::new(
            config.relational_path(),
            config.sinks.relational.source.clone(),
            NoiseSuppressor::from(&config.noise),
        )));
    }
    if config.sinks.langfuse.enabled {
        sinks.push(Arc::new(LangfuseSink::from_config(&config.sinks.langfuse)?));
    }
    if config.sinks.quota.enabled {
        let sink = Arc::new(QuotaSink::new(config.quota_path()));
        sinks.push(Arc::clone(&sink) as Arc<dyn Sink>);
        quota = Some(sink);
    }

    tracing::info!(
        sinks = ?sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
        "已启用 Sink"
    );
    Ok(SinkSet { sinks, quota })
}
