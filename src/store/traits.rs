//! 存储契约：引擎只依赖该 trait，内存 / SQLite 两种实现

use thiserror::Error;

use super::model::{
    AgentProfile, ChatMessage, ChatSession, Run, RunOutput, RunStatus, RunStep, StepCompletion,
    TokenUsage, ToolDefinition, ToolServer,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("duplicate {kind}: {id}")]
    Conflict { kind: &'static str, id: String },

    /// 结束步骤时输出类型与步骤类型不一致
    #[error("step {step_id} expects {expected} output")]
    PayloadMismatch {
        step_id: String,
        expected: &'static str,
    },

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Run / Step / Message 持久化契约
///
/// 所有写入同步完成；列表按创建时间升序返回。
pub trait TraceStore: Send + Sync {
    // --- agents ---
    fn create_agent(&self, agent: &AgentProfile) -> StoreResult<()>;
    fn get_agent(&self, id: &str) -> StoreResult<AgentProfile>;
    fn list_agents(&self) -> StoreResult<Vec<AgentProfile>>;

    // --- sessions ---
    fn create_session(&self, session: &ChatSession) -> StoreResult<()>;
    fn get_session(&self, id: &str) -> StoreResult<ChatSession>;

    // --- tool catalogue ---
    fn create_tool_server(&self, server: &ToolServer) -> StoreResult<()>;
    fn get_tool_server(&self, id: &str) -> StoreResult<ToolServer>;
    fn create_tool(&self, tool: &ToolDefinition) -> StoreResult<()>;
    /// Agent 已绑定服务器上的全部工具
    fn list_tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<ToolDefinition>>;
    /// 工具名 → 所属服务器：只在 Agent 已绑定的服务器中查找，未绑定返回 None
    fn find_tool_server(&self, agent_id: &str, tool_name: &str) -> StoreResult<Option<ToolServer>>;

    // --- runs ---
    fn create_run(&self, run: &Run) -> StoreResult<()>;
    fn get_run(&self, id: &str) -> StoreResult<Run>;
    /// 仅当 Run 仍为 running 时写入终态；返回是否发生了转换
    fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        output: RunOutput,
        usage: TokenUsage,
    ) -> StoreResult<bool>;
    fn list_child_runs(&self, parent_run_id: &str) -> StoreResult<Vec<Run>>;

    // --- steps ---
    fn create_run_step(&self, step: &RunStep) -> StoreResult<()>;
    fn get_run_step(&self, id: &str) -> StoreResult<RunStep>;
    fn finish_run_step(&self, id: &str, completion: StepCompletion) -> StoreResult<RunStep>;
    fn list_run_steps(&self, run_id: &str) -> StoreResult<Vec<RunStep>>;

    // --- messages ---
    fn create_chat_message(&self, message: &ChatMessage) -> StoreResult<()>;
    fn list_session_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>>;
    fn list_run_messages(&self, run_id: &str) -> StoreResult<Vec<ChatMessage>>;
}

/// 将完成信息写入步骤；两种后端共用
pub(crate) fn apply_completion(step: &mut RunStep, completion: StepCompletion) -> StoreResult<()> {
    let expected = step.step_type().as_str();
    step.payload
        .set_output(completion.output)
        .map_err(|_| StoreError::PayloadMismatch {
            step_id: step.id.clone(),
            expected,
        })?;
    step.status = completion.status;
    step.latency_ms = completion.latency_ms;
    step.error_message = completion.error;
    step.finished_at = Some(chrono::Utc::now());
    Ok(())
}
