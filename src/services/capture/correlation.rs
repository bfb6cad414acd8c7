//! 请求/响应关联表
//!
//! 请求钩子登记 PendingRequest，响应钩子按 flow_id 原子取出。
//! 表按插入顺序保存条目，超过 TTL 或容量上限时从最旧的一端淘汰，
//! 避免响应丢失时无限增长。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use serde::Serialize;

use crate::models::record::PendingRequest;

struct Entry {
    pending: PendingRequest,
    inserted_at: Instant,
}

/// 关联表计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
    pub pending: usize,
    pub registered: u64,
    pub matched: u64,
    /// 响应到达时没有找到对应请求
    pub unmatched: u64,
    /// 同一 flow_id 重复登记时覆盖的旧条目
    pub replaced: u64,
    pub evicted_expired: u64,
    pub evicted_capacity: u64,
    /// 代理主动丢弃（上游失败、客户端断开）
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    replaced: AtomicU64,
    evicted_expired: AtomicU64,
    evicted_capacity: AtomicU64,
    discarded: AtomicU64,
}

pub struct CorrelationStore {
    entries: Mutex<LinkedHashMap<String, Entry>>,
    capacity: usize,
    ttl: Duration,
    counters: Counters,
}

impl CorrelationStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LinkedHashMap::new()),
            capacity: capacity.max(1),
            ttl,
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkedHashMap<String, Entry>> {
        // 持锁期间不会 panic，中毒时直接沿用内部数据
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记请求，覆盖同一 flow_id 的旧条目（返回被覆盖的条目）
    pub fn put(&self, flow_id: &str, pending: PendingRequest) -> Option<PendingRequest> {
        let now = Instant::now();
        let mut entries = self.lock();

        self.evict_expired_locked(&mut entries, now);

        let replaced = entries.remove(flow_id).map(|e| e.pending);
        if replaced.is_some() {
            self.counters.replaced.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(flow_id = %flow_id, "flow_id 重复登记，已覆盖旧请求");
        }

        while entries.len() >= self.capacity {
            match entries.pop_front() {
                Some((evicted_id, _)) => {
                    self.counters.evicted_capacity.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(flow_id = %evicted_id, capacity = self.capacity, "关联表已满，淘汰最旧请求");
                }
                None => break,
            }
        }

        entries.insert(
            flow_id.to_string(),
            Entry {
                pending,
                inserted_at: now,
            },
        );
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        replaced
    }

    /// 原子取出请求；不存在时返回 None（不是错误）
    pub fn take(&self, flow_id: &str) -> Option<PendingRequest> {
        let taken = self.lock().remove(flow_id).map(|e| e.pending);
        if taken.is_some() {
            self.counters.matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    /// 丢弃一个不会再有响应的请求
    pub fn discard(&self, flow_id: &str) -> bool {
        let removed = self.lock().remove(flow_id).is_some();
        if removed {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// 淘汰所有超过 TTL 的条目，返回淘汰数量
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        self.evict_expired_locked(&mut entries, now)
    }

    fn evict_expired_locked(&self, entries: &mut LinkedHashMap<String, Entry>, now: Instant) -> usize {
        let mut evicted = 0;
        // 插入有序，遇到第一个未过期的条目即可停止
        while let Some((_, entry)) = entries.front() {
            if now.saturating_duration_since(entry.inserted_at) < self.ttl {
                break;
            }
            if let Some((flow_id, _)) = entries.pop_front() {
                tracing::debug!(flow_id = %flow_id, "请求超过 TTL 未匹配，已淘汰");
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.counters
                .evicted_expired
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            pending: self.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            evicted_expired: self.counters.evicted_expired.load(Ordering::Relaxed),
            evicted_capacity: self.counters.evicted_capacity.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}
