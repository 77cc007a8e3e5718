//! 脚本化推理后端（用于测试，无需 API）
//!
//! 按顺序弹出预设回复；脚本耗尽后交给 responder（若有），否则返回错误。
//! 记录每次收到的请求，便于断言 history / tools / 交接候选。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream;

use super::traits::{InferenceProvider, ProviderError};
use super::types::{ChatRequest, ChatResponse, EventStream, StreamEvent};
use crate::store::{HandoffDecision, ToolCall};

/// 一次调用的预设结果
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(ChatResponse),
    Fail(String),
    /// 永不返回，用于取消测试
    Hang,
}

type Responder = Arc<dyn Fn(&ChatRequest) -> Scripted + Send + Sync>;

#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽后按请求动态生成回复
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChatRequest) -> Scripted + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn push(&self, item: Scripted) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(Scripted::Respond(ChatResponse::text(text)))
    }

    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) -> &Self {
        self.push(Scripted::Respond(ChatResponse::with_tool_calls(calls)))
    }

    pub fn push_handoff(&self, target_agent_id: &str, reason: &str) -> &Self {
        self.push(Scripted::Respond(ChatResponse::with_handoff(
            format!("handing off to {target_agent_id}"),
            HandoffDecision::to(target_agent_id, reason),
        )))
    }

    pub fn push_fail(&self, message: &str) -> &Self {
        self.push(Scripted::Fail(message.to_string()))
    }

    pub fn push_hang(&self) -> &Self {
        self.push(Scripted::Hang)
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next(&self, request: &ChatRequest) -> Scripted {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (scripted, &self.responder) {
            (Some(item), _) => item,
            (None, Some(responder)) => responder(request),
            (None, None) => Scripted::Fail("script exhausted".to_string()),
        }
    }
}

/// 把阻塞回复切成内容增量 + 终止事件
fn response_events(response: ChatResponse) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = Vec::new();
    let chars: Vec<char> = response.content.chars().collect();
    for piece in chars.chunks(8) {
        events.push(StreamEvent::content(piece.iter().collect::<String>()));
    }
    let terminal = if !response.tool_calls.is_empty() {
        StreamEvent::ToolCall {
            tool_calls: response.tool_calls,
        }
    } else if let Some(handoff) = response.handoff.filter(HandoffDecision::is_active) {
        StreamEvent::Handoff { handoff }
    } else {
        StreamEvent::Done {
            content: Some(response.content),
        }
    };
    events.push(terminal);
    events
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.next(request) {
            Scripted::Respond(response) => Ok(response),
            Scripted::Fail(message) => Err(ProviderError::Transport(message)),
            Scripted::Hang => std::future::pending().await,
        }
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        match self.next(request) {
            Scripted::Respond(response) => Ok(Box::pin(stream::iter(response_events(response)))),
            Scripted::Fail(message) => Ok(Box::pin(stream::iter(vec![StreamEvent::error(message)]))),
            Scripted::Hang => Ok(Box::pin(stream::pending())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
