//! SQLite 存储：每行保存完整 JSON 文档，查询用到的列单独建索引

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::model::{
    AgentProfile, ChatMessage, ChatSession, Run, RunOutput, RunStatus, RunStep, StepCompletion,
    TokenUsage, ToolDefinition, ToolServer,
};
use super::traits::{apply_completion, StoreError, StoreResult, TraceStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tool_servers (
    id TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL REFERENCES tool_servers(id),
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tools_name ON tools(name);
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    parent_run_id TEXT,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id, started_at);
CREATE TABLE IF NOT EXISTS run_steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    started_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_steps_run ON run_steps(run_id, started_at);
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES chat_sessions(id),
    run_id TEXT,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_run ON chat_messages(run_id, created_at);
";

/// 固定宽度的时间戳，字典序即时间序
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_one<T: DeserializeOwned, P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> StoreResult<Option<T>> {
        let body: Option<String> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    fn query_all<T: DeserializeOwned, P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    fn conflict_or(kind: &'static str, id: &str, err: rusqlite::Error) -> StoreError {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict {
                    kind,
                    id: id.to_string(),
                }
            }
            other => StoreError::Sqlite(other),
        }
    }

    fn json<T: Serialize>(value: &T) -> StoreResult<String> {
        Ok(serde_json::to_string(value)?)
    }
}

impl TraceStore for SqliteStore {
    fn create_agent(&self, agent: &AgentProfile) -> StoreResult<()> {
        let body = Self::json(agent)?;
        self.conn()?
            .execute(
                "INSERT INTO agents (id, created_at, body) VALUES (?1, ?2, ?3)",
                params![agent.id, ts(&agent.created_at), body],
            )
            .map_err(|e| Self::conflict_or("agent", &agent.id, e))?;
        Ok(())
    }

    fn get_agent(&self, id: &str) -> StoreResult<AgentProfile> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT body FROM agents WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    fn list_agents(&self) -> StoreResult<Vec<AgentProfile>> {
        let conn = self.conn()?;
        Self::query_all(&conn, "SELECT body FROM agents ORDER BY created_at, rowid", [])
    }

    fn create_session(&self, session: &ChatSession) -> StoreResult<()> {
        let body = Self::json(session)?;
        self.conn()?
            .execute(
                "INSERT INTO chat_sessions (id, body) VALUES (?1, ?2)",
                params![session.id, body],
            )
            .map_err(|e| Self::conflict_or("session", &session.id, e))?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<ChatSession> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT body FROM chat_sessions WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    fn create_tool_server(&self, server: &ToolServer) -> StoreResult<()> {
        let body = Self::json(server)?;
        self.conn()?
            .execute(
                "INSERT INTO tool_servers (id, body) VALUES (?1, ?2)",
                params![server.id, body],
            )
            .map_err(|e| Self::conflict_or("tool server", &server.id, e))?;
        Ok(())
    }

    fn get_tool_server(&self, id: &str) -> StoreResult<ToolServer> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT body FROM tool_servers WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("tool server", id))
    }

    fn create_tool(&self, tool: &ToolDefinition) -> StoreResult<()> {
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tool_servers WHERE id = ?1",
                [&tool.server_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::not_found("tool server", &tool.server_id));
        }
        conn.execute(
            "INSERT INTO tools (id, server_id, name, created_at, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tool.id,
                tool.server_id,
                tool.name,
                ts(&tool.created_at),
                Self::json(tool)?
            ],
        )
        .map_err(|e| Self::conflict_or("tool", &tool.id, e))?;
        Ok(())
    }

    fn list_tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<ToolDefinition>> {
        let agent = self.get_agent(agent_id)?;
        let conn = self.conn()?;
        let mut tools = Vec::new();
        for server_id in &agent.tool_server_ids {
            tools.extend(Self::query_all::<ToolDefinition, _>(
                &conn,
                "SELECT body FROM tools WHERE server_id = ?1 ORDER BY created_at, rowid",
                [server_id],
            )?);
        }
        tools.sort_by_key(|t| t.created_at);
        Ok(tools)
    }

    fn find_tool_server(&self, agent_id: &str, tool_name: &str) -> StoreResult<Option<ToolServer>> {
        let bound = match self.get_agent(agent_id) {
            Ok(agent) => agent.tool_server_ids,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT server_id FROM tools WHERE name = ?1 ORDER BY created_at, rowid")?;
        let server_ids = stmt
            .query_map([tool_name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        match server_ids.iter().find(|id| bound.contains(id)) {
            Some(id) => Self::query_one(&conn, "SELECT body FROM tool_servers WHERE id = ?1", [id]),
            None => Ok(None),
        }
    }

    fn create_run(&self, run: &Run) -> StoreResult<()> {
        let body = Self::json(run)?;
        self.conn()?
            .execute(
                "INSERT INTO runs (id, parent_run_id, status, started_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id,
                    run.parent_run_id,
                    run.status.as_str(),
                    ts(&run.started_at),
                    body
                ],
            )
            .map_err(|e| Self::conflict_or("run", &run.id, e))?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT body FROM runs WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        output: RunOutput,
        usage: TokenUsage,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut run: Run = Self::query_one(&tx, "SELECT body FROM runs WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("run", id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.output = output;
        run.usage = usage;
        run.finished_at = Some(Utc::now());
        tx.execute(
            "UPDATE runs SET status = ?2, body = ?3 WHERE id = ?1",
            params![id, status.as_str(), Self::json(&run)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn list_child_runs(&self, parent_run_id: &str) -> StoreResult<Vec<Run>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT body FROM runs WHERE parent_run_id = ?1 ORDER BY started_at, rowid",
            [parent_run_id],
        )
    }

    fn create_run_step(&self, step: &RunStep) -> StoreResult<()> {
        let body = Self::json(step)?;
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM runs WHERE id = ?1", [&step.run_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::not_found("run", &step.run_id));
        }
        conn.execute(
            "INSERT INTO run_steps (id, run_id, started_at, body) VALUES (?1, ?2, ?3, ?4)",
            params![step.id, step.run_id, ts(&step.started_at), body],
        )
        .map_err(|e| Self::conflict_or("run step", &step.id, e))?;
        Ok(())
    }

    fn get_run_step(&self, id: &str) -> StoreResult<RunStep> {
        let conn = self.conn()?;
        Self::query_one(&conn, "SELECT body FROM run_steps WHERE id = ?1", [id])?
            .ok_or_else(|| StoreError::not_found("run step", id))
    }

    fn finish_run_step(&self, id: &str, completion: StepCompletion) -> StoreResult<RunStep> {
        let conn = self.conn()?;
        let mut step: RunStep =
            Self::query_one(&conn, "SELECT body FROM run_steps WHERE id = ?1", [id])?
                .ok_or_else(|| StoreError::not_found("run step", id))?;
        apply_completion(&mut step, completion)?;
        conn.execute(
            "UPDATE run_steps SET body = ?2 WHERE id = ?1",
            params![id, Self::json(&step)?],
        )?;
        Ok(step)
    }

    fn list_run_steps(&self, run_id: &str) -> StoreResult<Vec<RunStep>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT body FROM run_steps WHERE run_id = ?1 ORDER BY started_at, rowid",
            [run_id],
        )
    }

    fn create_chat_message(&self, message: &ChatMessage) -> StoreResult<()> {
        let body = Self::json(message)?;
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chat_sessions WHERE id = ?1",
                [&message.session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::not_found("session", &message.session_id));
        }
        conn.execute(
            "INSERT INTO chat_messages (id, session_id, run_id, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.session_id,
                message.run_id,
                ts(&message.created_at),
                body
            ],
        )
        .map_err(|e| Self::conflict_or("message", &message.id, e))?;
        Ok(())
    }

    fn list_session_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT body FROM chat_messages WHERE session_id = ?1 ORDER BY created_at, rowid",
            [session_id],
        )
    }

    fn list_run_messages(&self, run_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let conn = self.conn()?;
        Self::query_all(
            &conn,
            "SELECT body FROM chat_messages WHERE run_id = ?1 ORDER BY created_at, rowid",
            [run_id],
        )
    }
}
