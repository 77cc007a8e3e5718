//! 推理请求 / 响应 / 流式事件

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{ChatMessage, HandoffDecision, TokenUsage, ToolCall, ToolDefinition};

/// 可供交接的 Agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffCandidate {
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// 一次推理的输入
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Agent 配置的模型；是否采用由 provider 配置决定
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: String,
    /// 可选；history 已含最新用户消息时为空
    pub user_prompt: Option<String>,
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub handoff_candidates: Vec<HandoffCandidate>,
    /// 追加交接说明的 system 消息，要求模型回复 JSON 信封
    pub force_handoff: bool,
}

/// 一次阻塞推理的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub handoff: Option<HandoffDecision>,
    /// 内容为 JSON 信封时的原始对象
    pub raw_payload: Option<Value>,
    pub usage: TokenUsage,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn with_handoff(content: impl Into<String>, handoff: HandoffDecision) -> Self {
        Self {
            content: content.into(),
            handoff: Some(handoff),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// 非空的交接目标
    pub fn handoff_target(&self) -> Option<&HandoffDecision> {
        self.handoff.as_ref().filter(|h| h.is_active())
    }
}

/// 流式事件；provider 与引擎对外的流共用同一结构
///
/// 一条流以且仅以一个终止事件结束：tool_call（provider 层）、done 或 error。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content {
        content: String,
    },
    ToolCall {
        tool_calls: Vec<ToolCall>,
    },
    Handoff {
        handoff: HandoffDecision,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            error: message.to_string(),
        }
    }

    /// provider 流的终止事件
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Content { .. })
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;
