// 转发代理实例
//
// ProxyInstance 负责：
// - HTTP 服务器的启动和停止
// - 请求的接收和转发
// - 在请求/响应两端调用采集流水线

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use super::utils::body::{box_body, BoxBody, BoxError};
use super::utils::error_responses;
use crate::models::config::CaptureConfig;
use crate::models::record::{FlowRequest, FlowResponse};
use crate::services::capture::{is_captured_header, CapturePipeline};

/// 转发时不复制的请求头
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];
/// 转发时不复制的响应头
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "connection", "transfer-encoding"];

/// 每个连接共享的转发上下文
struct ForwardContext {
    upstream: String,
    client: reqwest::Client,
    pipeline: Arc<CapturePipeline>,
}

pub struct ProxyInstance {
    listen: SocketAddr,
    context: Arc<ForwardContext>,
    local_addr: RwLock<Option<SocketAddr>>,
    server_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyInstance {
    pub fn new(listen: SocketAddr, upstream: &str, pipeline: Arc<CapturePipeline>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("创建上游 HTTP 客户端失败")?;

        Ok(Self {
            listen,
            context: Arc::new(ForwardContext {
                upstream: upstream.trim_end_matches('/').to_string(),
                client,
                pipeline,
            }),
            local_addr: RwLock::new(None),
            server_handle: RwLock::new(None),
        })
    }

    pub fn from_config(config: &CaptureConfig, pipeline: Arc<CapturePipeline>) -> Result<Self> {
        let listen = config.listen_addr()?;
        Self::new(listen, &config.proxy.upstream, pipeline)
    }

    /// 启动代理服务
    pub async fn start(&self) -> Result<()> {
        {
            let handle = self.server_handle.read().await;
            if handle.is_some() {
                anyhow::bail!("代理实例已在运行");
            }
        }

        let listener = TcpListener::bind(self.listen)
            .await
            .context(format!("绑定地址 {} 失败", self.listen))?;
        let local_addr = listener.local_addr().context("读取监听地址失败")?;

        tracing::info!(
            addr = %local_addr,
            upstream = %self.context.upstream,
            "转发代理启动成功"
        );

        let context = Arc::clone(&self.context);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&context);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let context = Arc::clone(&context);
                                async move { handle_request(req, context).await }
                            });

                            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                tracing::debug!(peer = %peer, error = ?err, "连接处理结束");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "接受连接失败");
                    }
                }
            }
        });

        *self.local_addr.write().await = Some(local_addr);
        *self.server_handle.write().await = Some(handle);
        Ok(())
    }

    /// 停止代理服务
    pub async fn stop(&self) -> Result<()> {
        let handle = self.server_handle.write().await.take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("转发代理已停止");
        }
        *self.local_addr.write().await = None;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.server_handle.read().await.is_some()
    }

    /// 实际监听地址（端口为 0 时由系统分配）
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }
}

/// 处理单个请求
async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ForwardContext>,
) -> Result<Response<BoxBody>, Infallible> {
    match handle_request_inner(req, context).await {
        Ok(res) => Ok(res),
        Err(e) => {
            tracing::error!(error = ?e, "请求处理失败");
            Ok(error_responses::internal_error(&e.to_string()))
        }
    }
}

async fn handle_request_inner(req: Request<Incoming>, context: Arc<ForwardContext>) -> Result<Response<BoxBody>> {
    let flow_id = Uuid::new_v4().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|s| s.to_string());
    let method = req.method().clone();
    let headers = req.headers().clone();

    let body_bytes = if method != Method::GET && method != Method::HEAD {
        req.collect().await.context("读取请求体失败")?.to_bytes()
    } else {
        Bytes::new()
    };

    let pipeline = Arc::clone(&context.pipeline);
    let captured = pipeline.on_request(FlowRequest {
        flow_id: flow_id.clone(),
        path: path.clone(),
        conversation_header: header_str(&headers, pipeline.conversation_header()),
        body: body_bytes.clone(),
    });

    let target_url = match &query {
        Some(query) => format!("{}{}?{}", context.upstream, path, query),
        None => format!("{}{}", context.upstream, path),
    };

    tracing::debug!(
        flow_id = %flow_id,
        method = %method,
        url = %target_url,
        captured = captured,
        "代理请求"
    );

    let mut upstream_req = context.client.request(method, &target_url);
    for (name, value) in headers.iter() {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        upstream_req = upstream_req.header(name, value);
    }
    if !body_bytes.is_empty() {
        upstream_req = upstream_req.body(body_bytes);
    }

    let upstream_res = match upstream_req.send().await {
        Ok(res) => res,
        Err(e) => {
            tracing::warn!(flow_id = %flow_id, error = %e, "上游请求失败");
            if captured {
                pipeline.discard(&flow_id);
            }
            return Ok(error_responses::bad_gateway(&format!("上游请求失败: {}", e)));
        }
    };

    let status = StatusCode::from_u16(upstream_res.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let upstream_headers = upstream_res.headers().clone();
    let content_type = header_str(&upstream_headers, "content-type");
    let is_sse = content_type
        .as_deref()
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let mut response = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }

    if !captured {
        pipeline.on_passthrough(&flow_id, captured_headers(&upstream_headers));
        let stream = upstream_res
            .bytes_stream()
            .map(|result| result.map(Frame::data).map_err(|e| Box::new(e) as BoxError));
        return response
            .body(box_body(StreamBody::new(stream)))
            .context("构建响应失败");
    }

    let flow_response = FlowResponse {
        flow_id: flow_id.clone(),
        path,
        status_code: status.as_u16(),
        content_type,
        content_encoding: header_str(&upstream_headers, "content-encoding"),
        rate_limits: captured_headers(&upstream_headers),
        body: Bytes::new(),
    };

    if is_sse {
        tracing::debug!(flow_id = %flow_id, "SSE 流式响应");

        // 边转发边收集，流正常结束时触发响应钩子
        let collected = Arc::new(Mutex::new(Vec::new()));
        let collected_clone = Arc::clone(&collected);
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let relay = upstream_res.bytes_stream().map(move |result| {
            if let Ok(chunk) = &result {
                if let Ok(mut buf) = collected_clone.lock() {
                    buf.extend_from_slice(chunk);
                }
            }
            result.map(Frame::data).map_err(|e| Box::new(e) as BoxError)
        });
        let on_end = futures_util::stream::once(async move {
            let _ = done_tx.send(());
        })
        .filter_map(|_| futures_util::future::ready(None::<Result<Frame<Bytes>, BoxError>>));

        tokio::spawn(async move {
            match done_rx.await {
                Ok(()) => {
                    let body = match collected.lock() {
                        Ok(mut buf) => std::mem::take(&mut *buf),
                        Err(e) => {
                            tracing::error!(error = ?e, "获取 SSE 缓冲区锁失败");
                            pipeline.discard(&flow_response.flow_id);
                            return;
                        }
                    };
                    pipeline.on_response(FlowResponse {
                        body: Bytes::from(body),
                        ..flow_response
                    });
                }
                Err(_) => {
                    tracing::warn!(flow_id = %flow_response.flow_id, "SSE 流未完整结束，丢弃该请求");
                    pipeline.discard(&flow_response.flow_id);
                }
            }
        });

        response
            .body(box_body(StreamBody::new(relay.chain(on_end))))
            .context("构建响应失败")
    } else {
        let body_bytes = match upstream_res.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                pipeline.discard(&flow_id);
                return Ok(error_responses::bad_gateway(&format!("读取上游响应失败: {}", e)));
            }
        };

        let response_body = body_bytes.clone();
        tokio::spawn(async move {
            pipeline.on_response(FlowResponse {
                body: response_body,
                ..flow_response
            });
        });

        response
            .body(box_body(Full::new(body_bytes)))
            .context("构建响应失败")
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn captured_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| is_captured_header(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sinks::dispatcher::tests::RecordingSink;
    use crate::services::sinks::{DispatchHandle, QuotaSink, Sink, SinkDispatcher};
    use std::time::Duration;

    const SSE_BODY: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_up\",\"usage\":{\"input_tokens\":4}}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi from \"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"upstream\"}}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    /// 模拟上游：/v1/messages 返回 SSE，其余路径返回 JSON
    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let (content_type, body) = if req.uri().path() == "/v1/messages" {
                            ("text/event-stream", SSE_BODY.to_string())
                        } else {
                            ("application/json", r#"{"data":[]}"#.to_string())
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", content_type)
                                .header("anthropic-ratelimit-unified-5h-utilization", "0.25")
                                .header("request-id", "req_up")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    async fn start_proxy(upstream: &str, sink: Arc<RecordingSink>) -> (ProxyInstance, Arc<CapturePipeline>, Arc<DispatchHandle>) {
        let handle = Arc::new(
            SinkDispatcher::new(vec![sink as Arc<dyn Sink>], Duration::from_secs(1)).spawn(16),
        );
        let pipeline = Arc::new(CapturePipeline::new(&CaptureConfig::default(), Arc::clone(&handle)));
        let proxy = ProxyInstance::new("127.0.0.1:0".parse().unwrap(), upstream, Arc::clone(&pipeline)).unwrap();
        proxy.start().await.unwrap();
        (proxy, pipeline, handle)
    }

    #[tokio::test]
    async fn test_sse_relay_and_capture() {
        let upstream = spawn_upstream().await;
        let sink = RecordingSink::named("recording");
        let (proxy, pipeline, handle) = start_proxy(&format!("http://{}", upstream), sink.clone()).await;
        let addr = proxy.local_addr().await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{}/v1/messages", addr))
            .header("x-conversation-id", "conv-proxy")
            .body(r#"{"model":"claude-haiku-4-5","stream":true,"messages":[{"role":"user","content":"Hello there!"}]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), SSE_BODY);

        for _ in 0..100 {
            if pipeline.stats().correlation.matched == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        assert_eq!(sink.received().len(), 1);
        let stats = pipeline.stats();
        assert_eq!(stats.correlation.matched, 1);
        assert_eq!(stats.correlation.pending, 0);
        proxy.stop().await.unwrap();
        assert!(!proxy.is_running().await);
    }

    #[tokio::test]
    async fn test_uncaptured_route_is_relayed() {
        let upstream = spawn_upstream().await;
        let sink = RecordingSink::named("recording");
        let (proxy, pipeline, handle) = start_proxy(&format!("http://{}", upstream), sink.clone()).await;
        let addr = proxy.local_addr().await.unwrap();

        let body = reqwest::get(format!("http://{}/v1/models?limit=5", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, r#"{"data":[]}"#);

        handle.shutdown().await;
        assert!(sink.received().is_empty());
        assert_eq!(pipeline.stats().correlation.registered, 0);
    }

    #[tokio::test]
    async fn test_uncaptured_route_records_quota() {
        let upstream = spawn_upstream().await;
        let dir = tempfile::TempDir::new().unwrap();
        let quota = Arc::new(QuotaSink::new(dir.path().join("quota.csv")));
        let handle = Arc::new(SinkDispatcher::new(Vec::new(), Duration::from_secs(1)).spawn(4));
        let pipeline = Arc::new(
            CapturePipeline::new(&CaptureConfig::default(), Arc::clone(&handle)).with_quota(Arc::clone(&quota)),
        );
        let proxy = ProxyInstance::new(
            "127.0.0.1:0".parse().unwrap(),
            &format!("http://{}", upstream),
            Arc::clone(&pipeline),
        )
        .unwrap();
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{}/v1/messages/count_tokens", addr))
            .body(r#"{"model":"claude-haiku-4-5","messages":[]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let mut content = String::new();
        for _ in 0..100 {
            content = std::fs::read_to_string(quota.path()).unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(content.contains("req_up,0.25"));
        assert_eq!(pipeline.stats().correlation.registered, 0);

        proxy.stop().await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_returns_bad_gateway() {
        // 绑定后立即释放，得到一个没有服务监听的端口
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let sink = RecordingSink::named("recording");
        let (proxy, pipeline, handle) = start_proxy(&format!("http://{}", closed), sink).await;
        let addr = proxy.local_addr().await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("http://{}/v1/messages", addr))
            .body(r#"{"model":"claude-haiku-4-5","messages":[]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);

        handle.shutdown().await;
        let stats = pipeline.stats();
        assert_eq!(stats.correlation.discarded, 1);
        assert_eq!(stats.correlation.pending, 0);
    }

    #[test]
    fn test_captured_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("request-id", "req_1".parse().unwrap());
        headers.insert("anthropic-ratelimit-unified-7d-status", "allowed".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        let captured = captured_headers(&headers);
        assert_eq!(captured.len(), 2);
        assert_eq!(captured["request-id"], "req_1");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let sink = RecordingSink::named("recording");
        let (proxy, _pipeline, _handle) = start_proxy("http://127.0.0.1:9", sink).await;
        assert!(proxy.is_running().await);
        assert!(proxy.start().await.is_err());
        proxy.stop().await.unwrap();
    }
}
