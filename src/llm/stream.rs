//! 流式 chunk 拼接
//!
//! 工具调用按 index 分片到达：id / name 非空时覆盖，arguments 追加。
//! finish_reason 为 tool_calls 时一次性发出完整批次；其他结束原因或流结束视为正常结束，
//! 解析交接信封后发出 handoff 或 done。

use std::collections::BTreeMap;
use std::time::Duration;

use async_openai::error::OpenAIError;
use async_openai::types::chat::{CreateChatCompletionStreamResponse, FinishReason};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::handoff::parse_content_and_handoff;
use super::types::StreamEvent;
use crate::store::ToolCall;

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// 单次流式响应的累积状态
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已累积的完整文本
    pub fn content(&self) -> &str {
        &self.content
    }

    /// 文本增量；空串不产生事件
    pub fn push_content(&mut self, text: &str) -> Option<StreamEvent> {
        if text.is_empty() {
            return None;
        }
        self.content.push_str(text);
        Some(StreamEvent::content(text))
    }

    pub fn push_tool_delta(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let acc = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            acc.id = id.to_string();
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            acc.name = name.to_string();
        }
        if let Some(args) = arguments {
            acc.arguments.push_str(args);
        }
    }

    /// 处理一个 chunk；返回需要发出的事件，最后一个为终止事件时流应结束
    pub fn push_chunk(&mut self, chunk: CreateChatCompletionStreamResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(event) = choice.delta.content.as_deref().and_then(|t| self.push_content(t)) {
            events.push(event);
        }
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match &delta.function {
                Some(f) => (f.name.as_deref(), f.arguments.as_deref()),
                None => (None, None),
            };
            self.push_tool_delta(delta.index, delta.id.as_deref(), name, arguments);
        }

        match choice.finish_reason {
            Some(FinishReason::ToolCalls) => events.push(self.take_tool_calls()),
            Some(reason) => {
                debug!(finish_reason = ?reason, "stream finished");
                events.push(self.finish());
            }
            None => {}
        }
        events
    }

    /// 按 index 顺序发出完整的工具调用批次
    pub fn take_tool_calls(&mut self) -> StreamEvent {
        let calls = std::mem::take(&mut self.calls);
        StreamEvent::ToolCall {
            tool_calls: calls
                .into_values()
                .map(|acc| ToolCall {
                    id: acc.id,
                    name: acc.name,
                    arguments: acc.arguments,
                })
                .collect(),
        }
    }

    /// 正常结束：未完成的工具调用丢弃，解析交接信封
    pub fn finish(&mut self) -> StreamEvent {
        if !self.calls.is_empty() {
            warn!(
                pending = self.calls.len(),
                "stream ended without tool_calls finish; discarding partial tool calls"
            );
            self.calls.clear();
        }
        let parsed = parse_content_and_handoff(&self.content);
        match parsed.handoff {
            Some(handoff) => StreamEvent::Handoff { handoff },
            None => StreamEvent::Done {
                content: Some(parsed.text),
            },
        }
    }
}

/// 消费 chunk 流并推送事件，直到终止事件或接收端关闭
///
/// 只有首个 chunk 受 first_chunk_timeout 限制，之后的流不设总时长。
/// 恰好发送一个终止事件（接收端提前关闭时除外）。
pub async fn pump_chunks<S>(mut chunks: S, tx: &mpsc::Sender<StreamEvent>, first_chunk_timeout: Duration)
where
    S: Stream<Item = Result<CreateChatCompletionStreamResponse, OpenAIError>> + Unpin,
{
    let mut assembler = StreamAssembler::new();

    let mut next = match timeout(first_chunk_timeout, chunks.next()).await {
        Ok(next) => next,
        Err(_) => {
            let secs = first_chunk_timeout.as_secs();
            let _ = tx.send(StreamEvent::error(format!("no response within {secs}s"))).await;
            return;
        }
    };

    while let Some(item) = next {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(StreamEvent::error(format!("stream error: {e}"))).await;
                return;
            }
        };
        for event in assembler.push_chunk(chunk) {
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
        next = chunks.next().await;
    }

    let _ = tx.send(assembler.finish()).await;
}
