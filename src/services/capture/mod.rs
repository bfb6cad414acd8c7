//! 采集流水线
//!
//! 请求钩子：路由过滤 → 解析请求体 → 登记 PendingRequest。
//! 响应钩子：取出 PendingRequest → 解压 → 重建文本与用量 → 去噪 → 组装记录 → 投递到分发队列。
//! 两个钩子都不会返回错误，解析失败时使用默认值继续。

pub mod correlation;
pub mod extractor;
pub mod noise;
pub mod reconstructor;
pub mod record_builder;

pub use correlation::{CorrelationStats, CorrelationStore};
pub use extractor::ContentExtractor;
pub use noise::{NoiseFilter, NoiseSuppressor};
pub use reconstructor::{Reconstruction, StreamReconstructor};
pub use record_builder::RecordBuilder;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::config::{CaptureConfig, ProxySection};
use crate::models::message::RequestEnvelope;
use crate::models::record::{FlowRequest, FlowResponse, PendingRequest, ResponseMeta, TrafficRecord};
use crate::services::sinks::quota::has_rate_limits;
use crate::services::sinks::{DispatchHandle, DispatchStats, QuotaSink};

/// 统一限流相关的响应头
pub const RATE_LIMIT_HEADERS: &[&str] = &[
    "anthropic-ratelimit-unified-5h-utilization",
    "anthropic-ratelimit-unified-5h-reset",
    "anthropic-ratelimit-unified-5h-status",
    "anthropic-ratelimit-unified-7d-utilization",
    "anthropic-ratelimit-unified-7d-reset",
    "anthropic-ratelimit-unified-7d-status",
    "anthropic-ratelimit-unified-fallback",
    "anthropic-ratelimit-unified-fallback-percentage",
    "anthropic-ratelimit-unified-overage-status",
];

pub const REQUEST_ID_HEADER: &str = "request-id";

const SYSTEM_PREVIEW_CHARS: usize = 200;

/// 需要随记录保存的响应头（名称需为小写）
pub fn is_captured_header(name: &str) -> bool {
    name == REQUEST_ID_HEADER || RATE_LIMIT_HEADERS.contains(&name)
}

/// 路径过滤：包含任一路由且不包含任一排除路由
#[derive(Debug, Clone)]
pub struct RouteFilter {
    routes: Vec<String>,
    exclude: Vec<String>,
}

impl RouteFilter {
    pub fn new(routes: Vec<String>, exclude: Vec<String>) -> Self {
        Self { routes, exclude }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.routes.iter().any(|r| path.contains(r.as_str()))
            && !self.exclude.iter().any(|r| path.contains(r.as_str()))
    }
}

impl From<&ProxySection> for RouteFilter {
    fn from(section: &ProxySection) -> Self {
        Self::new(section.routes.clone(), section.exclude_routes.clone())
    }
}

/// 按 content-encoding 解压响应体；未压缩或解压失败时原样返回
pub fn decode_body<'a>(body: &'a [u8], content_encoding: Option<&str>) -> Cow<'a, [u8]> {
    let encoding = match content_encoding {
        Some(encoding) => encoding.trim().to_ascii_lowercase(),
        None => return Cow::Borrowed(body),
    };

    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" => read_all(GzDecoder::new(body)),
        // HTTP 的 deflate 通常带 zlib 头，少数实现发送裸 deflate 流
        "deflate" => read_all(ZlibDecoder::new(body)).or_else(|| read_all(DeflateDecoder::new(body))),
        "" | "identity" => return Cow::Borrowed(body),
        other => {
            tracing::debug!(encoding = %other, "不支持的响应编码，按原样处理");
            return Cow::Borrowed(body);
        }
    };

    match decoded {
        Some(bytes) => Cow::Owned(bytes),
        None => {
            tracing::warn!(encoding = %encoding, size = body.len(), "响应解压失败，按原样处理");
            Cow::Borrowed(body)
        }
    }
}

fn read_all<R: Read>(mut reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// 流水线计数器快照
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PipelineStats {
    pub correlation: CorrelationStats,
    pub dispatch: DispatchStats,
}

pub struct CapturePipeline {
    routes: RouteFilter,
    conversation_header: String,
    store: CorrelationStore,
    extractor: ContentExtractor,
    reconstructor: StreamReconstructor,
    builder: RecordBuilder,
    dispatcher: Arc<DispatchHandle>,
    quota: Option<Arc<QuotaSink>>,
}

impl CapturePipeline {
    pub fn new(config: &CaptureConfig, dispatcher: Arc<DispatchHandle>) -> Self {
        let extractor = ContentExtractor::new(NoiseFilter::from(&config.noise));
        Self {
            routes: RouteFilter::from(&config.proxy),
            conversation_header: config.proxy.conversation_header.to_ascii_lowercase(),
            store: CorrelationStore::new(
                config.correlation.capacity,
                Duration::from_secs(config.correlation.ttl_secs),
            ),
            reconstructor: StreamReconstructor::new(extractor.clone()),
            builder: RecordBuilder::new(extractor.clone())
                .with_suppressor(NoiseSuppressor::from(&config.noise)),
            extractor,
            dispatcher,
            quota: None,
        }
    }

    /// 未采集路由的响应头直接写入配额记录
    pub fn with_quota(mut self, quota: Arc<QuotaSink>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn conversation_header(&self) -> &str {
        &self.conversation_header
    }

    /// 请求钩子；返回该请求是否被登记
    pub fn on_request(&self, request: FlowRequest) -> bool {
        if !self.routes.matches(&request.path) {
            return false;
        }

        let conversation_id = request
            .conversation_header
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let envelope = RequestEnvelope::parse(&request.body);
        let system_preview = envelope
            .system
            .as_ref()
            .map(|system| self.extractor.extract(system))
            .filter(|text| !text.is_empty())
            .map(|text| record_builder::preview(&text, SYSTEM_PREVIEW_CHARS));

        tracing::debug!(
            flow_id = %request.flow_id,
            conversation_id = %conversation_id,
            model = %envelope.model,
            messages = envelope.messages.len(),
            stream = envelope.stream,
            "登记请求"
        );

        let pending = PendingRequest {
            flow_id: request.flow_id.clone(),
            conversation_id,
            model: envelope.model,
            messages: envelope.messages,
            stream: envelope.stream,
            max_tokens: envelope.max_tokens,
            temperature: envelope.temperature,
            system_preview,
            raw_body: request.body,
            created_at: Utc::now(),
        };
        self.store.put(&request.flow_id, pending);
        true
    }

    /// 响应钩子；匹配成功时组装记录并投递，返回该记录
    pub fn on_response(&self, response: FlowResponse) -> Option<TrafficRecord> {
        if !self.routes.matches(&response.path) {
            return None;
        }

        let Some(pending) = self.store.take(&response.flow_id) else {
            tracing::warn!(
                flow_id = %response.flow_id,
                status_code = response.status_code,
                "响应没有对应的请求（可能已过期），跳过"
            );
            return None;
        };

        let body = decode_body(&response.body, response.content_encoding.as_deref());
        let reconstruction = self.reconstructor.reconstruct(&body, pending.stream);
        let text = self.extractor.filter().clean(&reconstruction.text);

        let meta = ResponseMeta {
            status_code: response.status_code,
            content_type: response.content_type,
            rate_limits: response.rate_limits,
            message_id: reconstruction.message_id,
            stop_reason: reconstruction.stop_reason,
            body: String::from_utf8_lossy(&body).into_owned(),
        };
        let record = self.builder.build(pending, meta, text, reconstruction.usage);

        tracing::info!(
            flow_id = %record.flow_id,
            conversation_id = %record.conversation_id,
            model = %record.model,
            status_code = record.status_code,
            output_chars = record.output_text.chars().count(),
            streaming = record.is_streaming_response(),
            input_tokens = ?record.usage.input_tokens,
            output_tokens = ?record.usage.output_tokens,
            total_tokens = record.usage.total(),
            "记录已生成"
        );

        self.dispatcher.submit(record.clone());
        Some(record)
    }

    /// 未采集路由的响应钩子：只记录配额头，返回写入任务
    pub fn on_passthrough(&self, flow_id: &str, rate_limits: BTreeMap<String, String>) -> Option<JoinHandle<()>> {
        let quota = Arc::clone(self.quota.as_ref()?);
        if !has_rate_limits(&rate_limits) {
            return None;
        }

        let flow_id = flow_id.to_string();
        Some(tokio::spawn(async move {
            if let Err(e) = quota.record_headers(&flow_id, &rate_limits).await {
                tracing::error!(flow_id = %flow_id, sink = "quota", error = ?e, "配额记录失败");
            }
        }))
    }

    /// 上游失败或客户端中断时丢弃请求
    pub fn discard(&self, flow_id: &str) -> bool {
        let removed = self.store.discard(flow_id);
        if removed {
            tracing::debug!(flow_id = %flow_id, "请求未完成，已丢弃");
        }
        removed
    }

    /// 定期淘汰超时的 PendingRequest
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("关联表清理任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = pipeline.store.evict_expired();
                        if evicted > 0 {
                            tracing::warn!(
                                evicted = evicted,
                                pending = pipeline.store.len(),
                                "淘汰超时未匹配的请求"
                            );
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            correlation: self.store.stats(),
            dispatch: self.dispatcher.stats(),
        }
    }
}
