//! Agent 状态持久化
//!
//! 只追加的版本化存储：每次 save 插入一行新版本，并在同一事务内裁剪超出 max_history 的旧版本。
//! SQLite 以 WAL 模式打开；每个操作独立建连接并在 spawn_blocking 中执行，
//! 不同 Agent 的读写不会排在同一把进程级锁后面。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::state::AgentState;

pub const DEFAULT_MAX_HISTORY: usize = 100;

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// 存储统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_states: u64,
    pub unique_agents: u64,
    pub unique_workflows: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub successful_executions: u64,
    /// 成功行占比（百分比）
    pub success_rate: f64,
    pub oldest_state: Option<DateTime<Utc>>,
    pub newest_state: Option<DateTime<Utc>>,
}

/// 版本化 Agent 状态存储
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 刷新 updated_at 并追加一个新版本，返回行 ID；失败时调用方的状态保持不变
    async fn save(&self, state: &mut AgentState) -> Result<i64, StoreError>;

    /// 最近更新的版本
    async fn load(&self, agent_id: &str) -> Result<Option<AgentState>, StoreError>;

    /// 某次运行中每个 Agent 的最新版本
    async fn load_by_workflow(&self, workflow_id: &str) -> Result<Vec<AgentState>, StoreError>;

    /// 历史版本，新的在前
    async fn get_history(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AgentState>, StoreError>;

    /// 成功结束的版本；role 过滤为不区分大小写的包含匹配
    async fn get_successful(
        &self,
        agent_id: Option<&str>,
        role: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AgentState>, StoreError>;

    /// 删除某 Agent 的全部版本，返回删除行数
    async fn delete(&self, agent_id: &str) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// SQLite 实现
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    path: PathBuf,
    max_history: usize,
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// 解码失败的行记 warn 并跳过
fn decode(row_id: i64, json: &str) -> Option<AgentState> {
    match AgentState::from_json(json) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(row_id, error = %e, "Skipping undecodable agent state row");
            None
        }
    }
}

fn query_states(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<AgentState>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut states = Vec::new();
    for row in rows {
        let (id, json) = row?;
        if let Some(state) = decode(id, &json) {
            states.push(state);
        }
    }
    Ok(states)
}

impl SqliteStateStore {
    /// 打开（必要时创建）数据库并建表
    pub fn open(path: impl AsRef<Path>, max_history: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = connect(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                state_hash TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                success INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0
            );
            CREATE INDEX IF NOT EXISTS idx_agent_states_agent_id ON agent_states(agent_id);
            CREATE INDEX IF NOT EXISTS idx_agent_states_workflow_id ON agent_states(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_agent_states_updated_at ON agent_states(updated_at);",
        )?;
        info!(path = %path.display(), max_history, "State database initialized");
        Ok(Self {
            path,
            max_history: max_history.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// 在阻塞线程池中以独立连接执行
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(&self, state: &mut AgentState) -> Result<i64, StoreError> {
        let mut snapshot = state.clone();
        snapshot.touch();
        let json = serde_json::to_string(&snapshot)?;
        let hash = snapshot.state_hash();
        let agent_id = snapshot.agent_id.clone();
        let workflow_id = snapshot.workflow_id.clone();
        let created_at = format_ts(&snapshot.created_at);
        let updated_at = format_ts(&snapshot.updated_at);
        let success = snapshot.success;
        let tokens = i64::try_from(snapshot.total_tokens_used).unwrap_or(i64::MAX);
        let cost = snapshot.total_cost_usd;
        let keep = i64::try_from(self.max_history).unwrap_or(i64::MAX);

        let (row_id, pruned) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO agent_states (
                        agent_id, workflow_id, state_hash, state_json,
                        created_at, updated_at, success, tokens_used, cost_usd
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        agent_id,
                        workflow_id,
                        hash,
                        json,
                        created_at,
                        updated_at,
                        success,
                        tokens,
                        cost
                    ],
                )?;
                let row_id = tx.last_insert_rowid();
                let pruned = tx.execute(
                    "DELETE FROM agent_states
                     WHERE agent_id = ?1
                     AND id NOT IN (
                        SELECT id FROM agent_states
                        WHERE agent_id = ?1
                        ORDER BY updated_at DESC, id DESC
                        LIMIT ?2
                     )",
                    params![agent_id, keep],
                )?;
                tx.commit()?;
                Ok((row_id, pruned))
            })
            .await?;

        if pruned > 0 {
            debug!(agent_id = %snapshot.agent_id, pruned, "Pruned old agent state versions");
        }
        state.updated_at = snapshot.updated_at;
        Ok(row_id)
    }

    async fn load(&self, agent_id: &str) -> Result<Option<AgentState>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, state_json FROM agent_states
                     WHERE agent_id = ?1
                     ORDER BY updated_at DESC, id DESC
                     LIMIT 1",
                    params![agent_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(id, json)| decode(id, &json)))
        })
        .await
    }

    async fn load_by_workflow(&self, workflow_id: &str) -> Result<Vec<AgentState>, StoreError> {
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            query_states(
                conn,
                "SELECT id, state_json FROM agent_states
                 WHERE id IN (
                    SELECT MAX(id) FROM agent_states
                    WHERE workflow_id = ?1
                    GROUP BY agent_id
                 )
                 ORDER BY updated_at DESC, id DESC",
                params![workflow_id],
            )
        })
        .await
    }

    async fn get_history(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AgentState>, StoreError> {
        let agent_id = agent_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            query_states(
                conn,
                "SELECT id, state_json FROM agent_states
                 WHERE agent_id = ?1
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
                params![agent_id, limit, offset],
            )
        })
        .await
    }

    async fn get_successful(
        &self,
        agent_id: Option<&str>,
        role: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AgentState>, StoreError> {
        let agent_id = agent_id.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let states = self
            .with_conn(move |conn| {
                query_states(
                    conn,
                    "SELECT id, state_json FROM agent_states
                     WHERE success = 1
                     AND (?1 IS NULL OR agent_id = ?1)
                     ORDER BY updated_at DESC, id DESC
                     LIMIT ?2",
                    params![agent_id, limit],
                )
            })
            .await?;

        Ok(match role.map(str::to_lowercase) {
            Some(role) => states
                .into_iter()
                .filter(|s| s.role.to_lowercase().contains(&role))
                .collect(),
            None => states,
        })
    }

    async fn delete(&self, agent_id: &str) -> Result<usize, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM agent_states WHERE agent_id = ?1",
                params![agent_id],
            )?)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            let stats = conn.query_row(
                "SELECT
                    COUNT(*),
                    COUNT(DISTINCT agent_id),
                    COUNT(DISTINCT workflow_id),
                    COALESCE(SUM(tokens_used), 0),
                    COALESCE(SUM(cost_usd), 0.0),
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0),
                    MIN(created_at),
                    MAX(updated_at)
                 FROM agent_states",
                [],
                |row| {
                    let total: i64 = row.get(0)?;
                    let successful: i64 = row.get(5)?;
                    Ok(StoreStats {
                        total_states: total as u64,
                        unique_agents: row.get::<_, i64>(1)? as u64,
                        unique_workflows: row.get::<_, i64>(2)? as u64,
                        total_tokens: row.get::<_, i64>(3)? as u64,
                        total_cost_usd: row.get(4)?,
                        successful_executions: successful as u64,
                        success_rate: if total > 0 {
                            successful as f64 / total as f64 * 100.0
                        } else {
                            0.0
                        },
                        oldest_state: parse_ts(row.get(6)?),
                        newest_state: parse_ts(row.get(7)?),
                    })
                },
            )?;
            Ok(stats)
        })
        .await
    }
}
