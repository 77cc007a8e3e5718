//! 引擎错误分类与 Run 终态映射
//!
//! NotFound / InvalidArgs / Provider 终止当前 Run 并标记 failed；工具命令失败不是错误（折叠进工具输出文本）；
//! Cancelled 映射为 cancelled。

use thiserror::Error;

use crate::llm::ProviderError;
use crate::store::{RunStatus, StoreError};
use crate::tools::ToolError;

/// Run 执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid tool arguments: {0}")]
    InvalidArgs(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("max steps reached ({0})")]
    StepLimitExceeded(usize),

    #[error("handoff target not found: {0}")]
    HandoffTargetMissing(String),

    /// 交接链深度超过 engine.max_handoff_depth
    #[error("handoff chain depth exceeded (max {0})")]
    HandoffDepthExceeded(usize),

    #[error("run cancelled")]
    Cancelled,

    /// 子 Run 被单独取消；父 Run 记为 failed
    #[error("handoff child run cancelled: {0}")]
    ChildCancelled(String),

    /// CancelRun 时 run 不在注册表中；调用方视为无害
    #[error("run not running or not found: {0}")]
    NotRunning(String),

    /// execute 时 run 已在注册表中；第二次执行被拒绝，正在执行的那次不受影响
    #[error("run already executing: {0}")]
    AlreadyRunning(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// 该错误终止 Run 时写入的终态
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// 存储层的 NotFound 保留为引擎 NotFound，其余归入 Store
impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            other => Self::Store(other),
        }
    }
}

impl From<ToolError> for EngineError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArgs(msg) => Self::InvalidArgs(msg),
            ToolError::ServerNotFound(name) => Self::not_found("tool server", name),
            ToolError::UnknownTool { family, tool } => {
                Self::not_found("tool", format!("{family}/{tool}"))
            }
        }
    }
}
