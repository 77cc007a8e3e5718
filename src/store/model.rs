//! 数据模型：Agent 档案、会话、工具服务器、Run / RunStep / ChatMessage
//!
//! 载荷均为强类型：RunStep 按 step_type 区分（thought / tool_call / handoff），
//! ChatMessage 按 role + 内容类型区分；序列化后的线上结构与 input_payload / output_payload / content 保持一致。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run 状态：running 只会向终态转换一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::InvalidData(format!("run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidData(format!("step status: {other}"))),
        }
    }
}

/// Token 用量（prompt / completion / total）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

// ---------------------------------------------------------------------------
// Agent / Session / Tool catalogue
// ---------------------------------------------------------------------------

/// Agent 档案：system prompt + 模型 + 工具服务器绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    /// None 表示系统预置 Agent
    pub owner_user_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    /// 已绑定的工具服务器 id
    #[serde(default)]
    pub tool_server_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            owner_user_id: None,
            name: name.into(),
            description: String::new(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature: 0.5,
            tool_server_ids: Vec::new(),
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tool_servers(mut self, server_ids: &[&str]) -> Self {
        self.tool_server_ids = server_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            title: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// 工具服务器：名称决定由哪个内置工具族处理（git / filesystem）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub transport_type: String,
    #[serde(default)]
    pub connection_config: Value,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ToolServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport_type: "builtin".to_string(),
            connection_config: Value::Null,
            is_global: false,
            status: "active".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }
}

/// 工具定义：名称 + 描述 + JSON Schema 参数（原样透传给模型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    pub created_at: DateTime<Utc>,
}

impl ToolDefinition {
    pub fn new(
        server_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            id: new_id(),
            server_id: server_id.into(),
            name: name.into(),
            description: description.into(),
            input_schema,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run 输入载荷：用户轮次携带 content，交接子 Run 携带 from_handoff + reason
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_handoff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Run 输出载荷
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutput {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    /// 仅交接子 Run 设置
    #[serde(default)]
    pub parent_run_id: Option<String>,
    /// 整条交接链共享
    pub trace_id: String,
    pub status: RunStatus,
    #[serde(rename = "input_payload")]
    pub input: RunInput,
    #[serde(rename = "output_payload", default)]
    pub output: RunOutput,
    #[serde(rename = "usage_metadata", default)]
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// 用户轮次的根 Run：新的 trace id
    pub fn new_root(session: &ChatSession, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            agent_id: session.agent_id.clone(),
            parent_run_id: None,
            trace_id: new_id(),
            status: RunStatus::Running,
            input: RunInput {
                content: Some(content.into()),
                ..RunInput::default()
            },
            output: RunOutput::default(),
            usage: TokenUsage::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 交接子 Run：同会话、同 trace、parent_run_id 指向父 Run
    pub fn child_of(parent: &Run, agent_id: impl Into<String>, reason: &str) -> Self {
        Self {
            id: new_id(),
            session_id: parent.session_id.clone(),
            user_id: parent.user_id.clone(),
            agent_id: agent_id.into(),
            parent_run_id: Some(parent.id.clone()),
            trace_id: parent.trace_id.clone(),
            status: RunStatus::Running,
            input: RunInput {
                content: None,
                from_handoff: true,
                reason: Some(reason.to_string()),
            },
            output: RunOutput::default(),
            usage: TokenUsage::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// RunStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thought,
    ToolCall,
    Handoff,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::ToolCall => "tool_call",
            Self::Handoff => "handoff",
        }
    }
}

/// 模型一次推理的决策类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Final,
    ToolCalls,
    Handoff,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThoughtInput {
    pub iteration: usize,
    pub history_len: usize,
    pub tool_count: usize,
    pub candidate_count: usize,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtOutput {
    /// 推理失败时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub text_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutput {
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffInput {
    pub target_agent_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub preferred_server: String,
    pub parent_agent_id: String,
    #[serde(default)]
    pub parent_agent_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffOutput {
    /// 子 Run 未能创建时为空
    #[serde(default)]
    pub child_run_id: Option<String>,
    pub child_agent_id: String,
    #[serde(default)]
    pub response: String,
}

/// 按步骤类型区分的载荷；flatten 进 RunStep 后线上结构为
/// `{"step_type": "...", "input_payload": {...}, "output_payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepPayload {
    Thought {
        input_payload: ThoughtInput,
        #[serde(default)]
        output_payload: Option<ThoughtOutput>,
    },
    ToolCall {
        /// 模型给出的参数（解析后的 JSON）
        input_payload: Value,
        #[serde(default)]
        output_payload: Option<ToolCallOutput>,
    },
    Handoff {
        input_payload: HandoffInput,
        #[serde(default)]
        output_payload: Option<HandoffOutput>,
    },
}

/// 结束步骤时写入的输出，必须与 StepPayload 的类型匹配
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Thought(ThoughtOutput),
    ToolCall(ToolCallOutput),
    Handoff(HandoffOutput),
}

impl StepPayload {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Thought { .. } => StepType::Thought,
            Self::ToolCall { .. } => StepType::ToolCall,
            Self::Handoff { .. } => StepType::Handoff,
        }
    }

    pub fn set_output(&mut self, output: StepOutput) -> Result<(), StepOutput> {
        match (self, output) {
            (Self::Thought { output_payload, .. }, StepOutput::Thought(out)) => {
                *output_payload = Some(out);
            }
            (Self::ToolCall { output_payload, .. }, StepOutput::ToolCall(out)) => {
                *output_payload = Some(out);
            }
            (Self::Handoff { output_payload, .. }, StepOutput::Handoff(out)) => {
                *output_payload = Some(out);
            }
            (_, other) => return Err(other),
        }
        Ok(())
    }

    pub fn input_value(&self) -> Value {
        match self {
            Self::Thought { input_payload, .. } => to_value(input_payload),
            Self::ToolCall { input_payload, .. } => input_payload.clone(),
            Self::Handoff { input_payload, .. } => to_value(input_payload),
        }
    }

    pub fn output_value(&self) -> Value {
        match self {
            Self::Thought { output_payload, .. } => to_value(output_payload),
            Self::ToolCall { output_payload, .. } => to_value(output_payload),
            Self::Handoff { output_payload, .. } => to_value(output_payload),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub name: String,
    #[serde(flatten)]
    pub payload: StepPayload,
    pub status: StepStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub latency_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStep {
    fn open(run_id: &str, name: impl Into<String>, payload: StepPayload) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.to_string(),
            name: name.into(),
            payload,
            status: StepStatus::Running,
            error_message: None,
            latency_ms: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn thought(run_id: &str, input: ThoughtInput) -> Self {
        Self::open(
            run_id,
            "inference",
            StepPayload::Thought {
                input_payload: input,
                output_payload: None,
            },
        )
    }

    pub fn tool_call(run_id: &str, tool_name: &str, args: Value) -> Self {
        Self::open(
            run_id,
            tool_name,
            StepPayload::ToolCall {
                input_payload: args,
                output_payload: None,
            },
        )
    }

    pub fn handoff(run_id: &str, input: HandoffInput) -> Self {
        Self::open(
            run_id,
            "agent_handoff",
            StepPayload::Handoff {
                input_payload: input,
                output_payload: None,
            },
        )
    }

    pub fn step_type(&self) -> StepType {
        self.payload.step_type()
    }

    /// 输出载荷中引用的子 Run（目前只有 handoff 步骤会有）
    pub fn child_run_id(&self) -> Option<&str> {
        match &self.payload {
            StepPayload::Handoff {
                output_payload: Some(out),
                ..
            } => out.child_run_id.as_deref().filter(|id| !id.is_empty()),
            _ => None,
        }
    }
}

/// finish_run_step 的参数
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub output: StepOutput,
    pub status: StepStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// 模型发起的一次工具调用；arguments 为 JSON 字符串
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// 模型给出的交接决策；target_agent_id 为空表示不交接
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffDecision {
    #[serde(default)]
    pub target_agent_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub preferred_server: String,
}

impl HandoffDecision {
    pub fn to(target_agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target_agent_id: target_agent_id.into(),
            reason: reason.into(),
            preferred_server: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.target_agent_id.trim().is_empty()
    }
}

/// 消息内容：显式的内容类型标签（text / tool_calls / handoff）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    ToolCalls {
        #[serde(default)]
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    Handoff {
        #[serde(default)]
        text: String,
        handoff: HandoffDecision,
    },
}

impl MessageContent {
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } | Self::ToolCalls { text, .. } | Self::Handoff { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// 按 role 区分的消息体；tool_call_id 只存在于 tool 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum MessageBody {
    User {
        content: MessageContent,
    },
    Assistant {
        content: MessageContent,
    },
    Tool {
        tool_call_id: String,
        content: MessageContent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    /// 产生该消息的 Run；用户消息在 Run 创建前写入，可为空
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn build(session_id: &str, run_id: Option<&str>, body: MessageBody, is_hidden: bool) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.to_string(),
            run_id: run_id.map(String::from),
            body,
            is_hidden,
            created_at: Utc::now(),
        }
    }

    pub fn user(session_id: &str, text: impl Into<String>) -> Self {
        Self::build(
            session_id,
            None,
            MessageBody::User {
                content: MessageContent::Text { text: text.into() },
            },
            false,
        )
    }

    /// 最终回复（对用户可见）
    pub fn assistant_text(run: &Run, text: impl Into<String>) -> Self {
        Self::build(
            &run.session_id,
            Some(&run.id),
            MessageBody::Assistant {
                content: MessageContent::Text { text: text.into() },
            },
            false,
        )
    }

    /// 工具调用批次：原样保存，供后续推理回放
    pub fn assistant_tool_calls(run: &Run, text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::build(
            &run.session_id,
            Some(&run.id),
            MessageBody::Assistant {
                content: MessageContent::ToolCalls {
                    text: text.into(),
                    tool_calls,
                },
            },
            true,
        )
    }

    pub fn assistant_handoff(run: &Run, text: impl Into<String>, handoff: HandoffDecision) -> Self {
        Self::build(
            &run.session_id,
            Some(&run.id),
            MessageBody::Assistant {
                content: MessageContent::Handoff {
                    text: text.into(),
                    handoff,
                },
            },
            false,
        )
    }

    /// 工具输出：按约定对用户隐藏
    pub fn tool_output(run: &Run, tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::build(
            &run.session_id,
            Some(&run.id),
            MessageBody::Tool {
                tool_call_id: tool_call_id.into(),
                content: MessageContent::Text {
                    text: output.into(),
                },
            },
            true,
        )
    }

    pub fn role(&self) -> Role {
        match self.body {
            MessageBody::User { .. } => Role::User,
            MessageBody::Assistant { .. } => Role::Assistant,
            MessageBody::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> &MessageContent {
        match &self.body {
            MessageBody::User { content }
            | MessageBody::Assistant { content }
            | MessageBody::Tool { content, .. } => content,
        }
    }

    pub fn text(&self) -> &str {
        self.content().text()
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self.content() {
            MessageContent::ToolCalls { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}
