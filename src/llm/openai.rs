//! OpenAI 兼容推理端点
//!
//! 通过 async_openai 调用可配置 base_url 的 chat/completions；阻塞调用解析首个 choice，
//! 流式调用在后台任务中拼接 chunk 并经有界通道推送事件。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::handoff::{build_handoff_instruction, parse_content_and_handoff};
use super::stream::pump_chunks;
use super::traits::{InferenceProvider, ProviderError};
use super::types::{ChatRequest, ChatResponse, EventStream, StreamEvent};
use crate::config::LlmSection;
use crate::store::{ChatMessage, MessageBody, MessageContent, TokenUsage, ToolCall, ToolDefinition};

/// 流式事件通道容量
pub const STREAM_BUFFER: usize = 10;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct UsageMeter {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
    total_tokens: Arc<AtomicU64>,
}

impl UsageMeter {
    pub fn add(&self, usage: &TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    /// 为 true 时优先使用 Agent 档案中的 model / temperature
    use_agent_model: bool,
    stream_buffer: usize,
    /// 阻塞调用的总时长上限；流式调用只限制首个 chunk
    request_timeout: Duration,
    pub usage: UsageMeter,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_base(base_url.trim_end_matches('/'));
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            config = config.with_api_key(key);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: 0.5,
            use_agent_model: false,
            stream_buffer: STREAM_BUFFER,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            usage: UsageMeter::default(),
        }
    }

    pub fn from_config(cfg: &LlmSection, stream_buffer: usize) -> Self {
        info!(base_url = %cfg.base_url, model = %cfg.model, "LLM provider configured");
        let mut provider = Self::new(&cfg.base_url, &cfg.model, cfg.api_key.as_deref());
        provider.temperature = cfg.temperature;
        provider.use_agent_model = cfg.use_agent_model;
        provider.stream_buffer = stream_buffer.max(1);
        provider.request_timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
        provider
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn model_for<'a>(&'a self, req: &'a ChatRequest) -> &'a str {
        match req.model.as_deref() {
            Some(m) if self.use_agent_model && !m.is_empty() => m,
            _ => &self.model,
        }
    }

    fn temperature_for(&self, req: &ChatRequest) -> f32 {
        match req.temperature {
            Some(t) if self.use_agent_model => t,
            _ => self.temperature,
        }
    }

    fn build_request(&self, req: &ChatRequest, stream: bool) -> Result<CreateChatCompletionRequest, ProviderError> {
        let messages = build_messages(req)?;
        debug!(
            model = self.model_for(req),
            messages = messages.len(),
            tools = req.tools.len(),
            stream,
            "chat completion request"
        );

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(self.model_for(req))
            .messages(messages)
            .temperature(self.temperature_for(req));
        if stream {
            builder.stream(true);
        }
        let mut request = builder.build()?;
        if !req.tools.is_empty() {
            request.tools = Some(serde_json::from_value(build_tools(&req.tools)?)?);
        }
        Ok(request)
    }

    fn timeout_secs(&self) -> u64 {
        self.request_timeout.as_secs()
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request(request, false)?;
        let response = timeout(self.request_timeout, self.client.chat().create(body))
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout_secs()))??;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();
        self.usage.add(&usage);

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyChoices)?;
        let tool_calls = match &choice.message.tool_calls {
            Some(calls) => tool_calls_from_value(serde_json::to_value(calls)?),
            None => Vec::new(),
        };
        let parsed = parse_content_and_handoff(choice.message.content.as_deref().unwrap_or_default());

        Ok(ChatResponse {
            content: parsed.text,
            tool_calls,
            handoff: parsed.handoff,
            raw_payload: parsed.raw,
            usage,
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let body = self.build_request(request, true)?;
        let chunks = self.client.chat().create_stream(body).await?;
        let (tx, rx) = mpsc::channel::<StreamEvent>(self.stream_buffer);
        let first_chunk_timeout = self.request_timeout;

        tokio::spawn(async move {
            pump_chunks(chunks, &tx, first_chunk_timeout).await;
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

fn system_message(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, ProviderError> {
    Ok(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(text.into())
            .build()?,
    ))
}

fn user_message(text: impl Into<String>) -> Result<ChatCompletionRequestMessage, ProviderError> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(text.into())
            .build()?,
    ))
}

/// 历史消息 → 请求消息：assistant 的工具调用批次原样回放，tool 消息携带 tool_call_id
fn history_message(msg: &ChatMessage) -> Result<ChatCompletionRequestMessage, ProviderError> {
    let message = match &msg.body {
        MessageBody::User { content } => user_message(content.text())?,
        MessageBody::Assistant {
            content: MessageContent::ToolCalls { text, tool_calls },
        } => {
            let mut args = ChatCompletionRequestAssistantMessageArgs::default();
            if !text.is_empty() {
                args.content(text.clone());
            }
            let mut assistant = args.build()?;
            assistant.tool_calls = Some(serde_json::from_value(tool_calls_to_value(tool_calls))?);
            ChatCompletionRequestMessage::Assistant(assistant)
        }
        MessageBody::Assistant { content } => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(content.text().to_string())
                .build()?,
        ),
        MessageBody::Tool {
            tool_call_id,
            content,
        } => ChatCompletionRequestMessage::Tool(
            ChatCompletionRequestToolMessageArgs::default()
                .content(content.text().to_string())
                .tool_call_id(tool_call_id.clone())
                .build()?,
        ),
    };
    Ok(message)
}

/// system → 交接说明（可选）→ 历史 → 本轮用户输入（可选）
pub fn build_messages(req: &ChatRequest) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
    let mut msgs = Vec::with_capacity(req.history.len() + 3);
    if !req.system_prompt.is_empty() {
        msgs.push(system_message(req.system_prompt.clone())?);
    }
    if req.force_handoff {
        msgs.push(system_message(build_handoff_instruction(&req.handoff_candidates))?);
    }
    for msg in &req.history {
        msgs.push(history_message(msg)?);
    }
    if let Some(prompt) = req.user_prompt.as_deref().filter(|p| !p.is_empty()) {
        msgs.push(user_message(prompt)?);
    }
    Ok(msgs)
}

/// 工具定义 → function 工具列表；JSON Schema 原样透传
fn build_tools(tools: &[ToolDefinition]) -> Result<Value, ProviderError> {
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        let function = FunctionObjectArgs::default()
            .name(tool.name.clone())
            .description(tool.description.clone())
            .parameters(tool.input_schema.clone())
            .build()?;
        out.push(json!({"type": "function", "function": function}));
    }
    Ok(Value::Array(out))
}

fn tool_calls_to_value(calls: &[ToolCall]) -> Value {
    calls
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments},
            })
        })
        .collect()
}

fn tool_calls_from_value(value: Value) -> Vec<ToolCall> {
    let Value::Array(calls) = value else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|c| {
            let function = c.get("function")?;
            Some(ToolCall::new(
                c.get("id").and_then(Value::as_str).unwrap_or_default(),
                function.get("name").and_then(Value::as_str)?,
                function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            ))
        })
        .collect()
}
