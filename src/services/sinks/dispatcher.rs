//! Sink 分发器
//!
//! 分发在后台任务中进行：响应钩子只把记录放入有界队列，
//! 队列满时丢弃记录而不是阻塞代理。每个 Sink 调用都有超时。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Sink;
use crate::error::AppError;
use crate::models::record::TrafficRecord;

/// 单条记录的分发结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    /// (sink 名称, 错误信息)
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 分发计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    /// 队列已满或已关闭而被丢弃
    pub dropped: u64,
    pub dispatched: u64,
    pub sink_failures: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    sink_failures: AtomicU64,
}

pub struct SinkDispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl SinkDispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, timeout: Duration) -> Self {
        Self {
            sinks,
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// 并发写入所有 Sink，互不影响；部分成功是正常结果
    pub async fn dispatch(&self, record: &TrafficRecord) -> DispatchReport {
        let timeout = self.timeout;
        let writes = self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(timeout, sink.write(record)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(timeout.as_millis() as u64)),
            };
            (sink.name().to_string(), result)
        });

        let mut report = DispatchReport::default();
        for (name, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    tracing::error!(
                        sink = %name,
                        flow_id = %record.flow_id,
                        error = %e,
                        "Sink 写入失败"
                    );
                    self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            flow_id = %record.flow_id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "记录分发完成"
        );
        report
    }

    /// 启动后台分发任务
    pub fn spawn(self, queue_capacity: usize) -> DispatchHandle {
        let (sender, mut receiver) = mpsc::channel::<TrafficRecord>(queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let counters = Arc::clone(&self.counters);
        let worker_cancel = cancel.clone();
        tracing::info!(
            sinks = ?self.sink_names(),
            queue_capacity = queue_capacity,
            "Sink 分发任务已启动"
        );

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => {
                        // 关闭前处理完队列中剩余的记录
                        receiver.close();
                        let mut drained = 0usize;
                        while let Some(record) = receiver.recv().await {
                            self.dispatch(&record).await;
                            drained += 1;
                        }
                        tracing::info!(drained = drained, "Sink 分发任务已停止");
                        break;
                    }
                    maybe_record = receiver.recv() => {
                        match maybe_record {
                            Some(record) => {
                                self.dispatch(&record).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        DispatchHandle {
            sender,
            cancel,
            counters,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }
}

/// 后台分发任务的句柄
pub struct DispatchHandle {
    sender: mpsc::Sender<TrafficRecord>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DispatchHandle {
    /// 提交记录（不阻塞）；返回是否成功入队
    pub fn submit(&self, record: TrafficRecord) -> bool {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(flow_id = %record.flow_id, "分发队列已满，记录被丢弃");
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(flow_id = %record.flow_id, "分发任务已关闭，记录被丢弃");
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            sink_failures: self.counters.sink_failures.load(Ordering::Relaxed),
        }
    }

    /// 停止后台任务，等待队列中剩余记录写完
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = ?e, "Sink 分发任务异常退出");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppResult;
    use crate::models::record::RequestSnapshot;
    use crate::models::usage::UsageStats;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// 记录收到的 flow_id
    #[derive(Default)]
    pub struct RecordingSink {
        pub name: String,
        pub received: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&self, record: &TrafficRecord) -> AppResult<()> {
            self.received.lock().unwrap().push(record.flow_id.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn write(&self, _record: &TrafficRecord) -> AppResult<()> {
            Err(AppError::sink("failing", "connection refused"))
        }
    }

    struct SlowSink;

    #[async_trait]
    impl Sink for SlowSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn write(&self, _record: &TrafficRecord) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    pub fn sample_record(flow_id: &str) -> TrafficRecord {
        let now = Utc::now();
        TrafficRecord {
            conversation_id: "conv-1".to_string(),
            flow_id: flow_id.to_string(),
            model: "claude-sonnet-4-5".to_string(),
            request: RequestSnapshot {
                model: "claude-sonnet-4-5".to_string(),
                message_count: 1,
                stream: false,
                max_tokens: Some(1024),
                temperature: None,
                system_preview: None,
                last_user_text: Some("How do lifetimes work?".to_string()),
                size: 64,
                body: r#"{"model":"claude-sonnet-4-5","messages":[]}"#.to_string(),
                created_at: now,
            },
            output_text: "They describe how long references are valid.".to_string(),
            usage: UsageStats {
                input_tokens: Some(12),
                output_tokens: Some(9),
                ..Default::default()
            },
            status_code: 200,
            content_type: Some("application/json".to_string()),
            message_id: Some(format!("msg_{}", flow_id)),
            stop_reason: Some("end_turn".to_string()),
            rate_limits: Default::default(),
            response_body: "{}".to_string(),
            timestamp: now,
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let first = RecordingSink::named("first");
        let second = RecordingSink::named("second");
        let sinks: Vec<Arc<dyn Sink>> = vec![
            first.clone(),
            Arc::new(FailingSink),
            second.clone(),
        ];
        let dispatcher = SinkDispatcher::new(sinks, Duration::from_secs(1));

        let report = dispatcher.dispatch(&sample_record("f1")).await;

        assert_eq!(report.delivered, vec!["first", "second"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "failing");
        assert!(!report.is_complete());
        assert_eq!(first.received(), vec!["f1"]);
        assert_eq!(second.received(), vec!["f1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_times_out() {
        let fast = RecordingSink::named("fast");
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(SlowSink), fast.clone()];
        let dispatcher = SinkDispatcher::new(sinks, Duration::from_millis(100));

        let report = dispatcher.dispatch(&sample_record("f1")).await;

        assert_eq!(report.delivered, vec!["fast"]);
        assert_eq!(report.failed[0].0, "slow");
        assert!(report.failed[0].1.contains("100"));
    }

    #[tokio::test]
    async fn test_background_worker_drains_on_shutdown() {
        let sink = RecordingSink::named("recording");
        let handle = SinkDispatcher::new(vec![sink.clone() as Arc<dyn Sink>], Duration::from_secs(1))
            .spawn(16);

        for i in 0..5 {
            assert!(handle.submit(sample_record(&format!("f{}", i))));
        }
        handle.shutdown().await;

        assert_eq!(sink.received(), vec!["f0", "f1", "f2", "f3", "f4"]);
        let stats = handle.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.dropped, 0);

        assert!(!handle.submit(sample_record("late")));
        assert_eq!(handle.stats().dropped, 1);
    }
}
