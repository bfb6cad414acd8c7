//! 会话库（SQLite）
//!
//! 按外部会话 ID 归档对话：每条记录写入一条用户消息和一条助手消息，
//! 消息 uuid 唯一，重复写入被忽略。rusqlite 是同步接口，写入放在
//! `spawn_blocking` 中执行，便于分发器施加超时。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{ConnectionState, ConnectionTracker, Sink};
use crate::error::{AppError, AppResult};
use crate::models::record::TrafficRecord;
use crate::services::capture::noise::NoiseSuppressor;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        name TEXT,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id),
        uuid TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
";

pub const ROLE_HUMAN: &str = "human";
pub const ROLE_ASSISTANT: &str = "assistant";

/// 待写入的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessageRow {
    uuid: String,
    role: &'static str,
    content: String,
}

struct Store {
    path: PathBuf,
    source: String,
    conn: Mutex<Option<Connection>>,
    tracker: ConnectionTracker,
}

impl Store {
    fn open(&self) -> AppResult<Connection> {
        self.tracker.transition(ConnectionState::Connecting);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        self.tracker.transition(ConnectionState::Connected);
        tracing::info!(path = %self.path.display(), "会话库已连接");
        Ok(conn)
    }

    fn write_rows(&self, conversation_uuid: &str, rows: &[MessageRow]) -> AppResult<usize> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            match self.open() {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    self.tracker.transition(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }

        let result = match guard.as_ref() {
            Some(conn) => insert_rows(conn, &self.source, conversation_uuid, rows),
            None => Ok(0),
        };

        if let Err(AppError::Sqlite(e)) = &result {
            tracing::warn!(error = %e, "会话库写入失败，下次写入时重连");
            *guard = None;
            self.tracker.transition(ConnectionState::Disconnected);
        }
        result
    }
}

/// 在一个事务内建会话并写入消息，返回实际插入的条数
fn insert_rows(
    conn: &Connection,
    source: &str,
    conversation_uuid: &str,
    rows: &[MessageRow],
) -> AppResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO conversations (uuid, name, source, created_at)
         VALUES (?1, NULL, ?2, ?3)
         ON CONFLICT(uuid) DO NOTHING",
        params![conversation_uuid, source, now],
    )?;
    let conversation_id: i64 = tx.query_row(
        "SELECT id FROM conversations WHERE uuid = ?1",
        params![conversation_uuid],
        |row| row.get(0),
    )?;

    let mut inserted = 0;
    for row in rows {
        inserted += tx.execute(
            "INSERT INTO messages (conversation_id, uuid, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO NOTHING",
            params![conversation_id, row.uuid, row.role, row.content, now],
        )?;
    }
    tx.commit()?;
    Ok(inserted)
}

pub struct RelationalSink {
    store: Arc<Store>,
    suppressor: NoiseSuppressor,
}

impl RelationalSink {
    pub fn new(path: PathBuf, source: String, suppressor: NoiseSuppressor) -> Self {
        Self {
            store: Arc::new(Store {
                path,
                source,
                conn: Mutex::new(None),
                tracker: ConnectionTracker::new("relational"),
            }),
            suppressor,
        }
    }

    pub fn path(&self) -> &Path {
        &self.store.path
    }

    pub fn state(&self) -> ConnectionState {
        self.store.tracker.state()
    }

    /// 同一会话中重复出现的用户输入得到同一个 uuid
    pub fn human_turn_uuid(conversation_id: &str, text: &str) -> Uuid {
        let name = format!("{}\n{}", conversation_id, text);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    fn rows_for(&self, record: &TrafficRecord) -> Vec<MessageRow> {
        let mut rows = Vec::with_capacity(2);

        if let Some(text) = record.request.last_user_text.as_deref().map(str::trim) {
            if !text.is_empty() && !self.suppressor.is_noise(text) {
                rows.push(MessageRow {
                    uuid: Self::human_turn_uuid(&record.conversation_id, text).to_string(),
                    role: ROLE_HUMAN,
                    content: text.to_string(),
                });
            }
        }

        let output = record.output_text.trim();
        if !output.is_empty() && !self.suppressor.is_noise(output) {
            let uuid = record
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            rows.push(MessageRow {
                uuid,
                role: ROLE_ASSISTANT,
                content: output.to_string(),
            });
        }

        rows
    }
}

#[async_trait]
impl Sink for RelationalSink {
    fn name(&self) -> &str {
        "relational"
    }

    async fn write(&self, record: &TrafficRecord) -> AppResult<()> {
        let rows = self.rows_for(record);
        if rows.is_empty() {
            tracing::debug!(flow_id = %record.flow_id, "没有可归档的消息");
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let conversation_id = record.conversation_id.clone();
        let inserted = tokio::task::spawn_blocking(move || store.write_rows(&conversation_id, &rows))
            .await
            .map_err(|e| AppError::sink("relational", e))??;

        tracing::debug!(
            flow_id = %record.flow_id,
            conversation_id = %record.conversation_id,
            inserted = inserted,
            "会话消息已归档"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::NoiseSection;
    use crate::services::sinks::dispatcher::tests::sample_record;
    use rusqlite::OptionalExtension;

    fn sink(dir: &tempfile::TempDir) -> RelationalSink {
        RelationalSink::new(
            dir.path().join("scribe.db"),
            "claude-code".to_string(),
            NoiseSuppressor::from(&NoiseSection::default()),
        )
    }

    fn messages(path: &Path) -> Vec<(String, String, String)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.uuid, m.role, m.content FROM messages m
                 JOIN conversations c ON c.id = m.conversation_id ORDER BY m.id",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    #[tokio::test]
    async fn test_writes_human_and_assistant_turns() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = sink(&dir);

        sink.write(&sample_record("f1")).await.unwrap();
        assert_eq!(sink.state(), ConnectionState::Connected);

        let rows = messages(sink.path());
        assert_eq!(
            rows,
            vec![
                (
                    "conv-1".to_string(),
                    "human".to_string(),
                    "How do lifetimes work?".to_string()
                ),
                (
                    "conv-1".to_string(),
                    "assistant".to_string(),
                    "They describe how long references are valid.".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_turns_are_deduplicated() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = sink(&dir);

        let record = sample_record("f1");
        sink.write(&record).await.unwrap();
        sink.write(&record).await.unwrap();

        // 工具循环中的下一轮请求：同样的用户输入，不同的助手消息
        let mut next = sample_record("f2");
        next.output_text = "Follow-up answer after the tool call.".to_string();
        sink.write(&next).await.unwrap();

        let rows = messages(sink.path());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.1 == "human").count(), 1);

        let conn = Connection::open(sink.path()).unwrap();
        let conversations: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(conversations, 1);
    }

    #[tokio::test]
    async fn test_noise_turns_are_suppressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = sink(&dir);

        let mut record = sample_record("f1");
        record.request.last_user_text = Some("Stop hook feedback:".to_string());
        record.output_text = "ok".to_string();
        sink.write(&record).await.unwrap();

        // 没有消息需要写入时不会创建数据库
        assert!(!sink.path().exists());
        assert_eq!(sink.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_human_turn_uuid_is_stable() {
        let a = RelationalSink::human_turn_uuid("conv", "hello there");
        let b = RelationalSink::human_turn_uuid("conv", "hello there");
        let c = RelationalSink::human_turn_uuid("other", "hello there");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_existing_conversation_is_reused() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("scribe.db")).unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let row = |uuid: &str| MessageRow {
            uuid: uuid.to_string(),
            role: ROLE_ASSISTANT,
            content: "Some assistant output.".to_string(),
        };
        assert_eq!(insert_rows(&conn, "test", "c1", &[row("m1")]).unwrap(), 1);
        assert_eq!(insert_rows(&conn, "test", "c1", &[row("m1"), row("m2")]).unwrap(), 1);

        let id: Option<i64> = conn
            .query_row("SELECT id FROM conversations WHERE uuid = 'c1'", [], |r| r.get(0))
            .optional()
            .unwrap();
        assert_eq!(id, Some(1));
    }
}
