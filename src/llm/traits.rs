//! 推理后端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted）实现 InferenceProvider：complete（阻塞）、complete_stream（事件流）。

use async_openai::error::OpenAIError;
use async_trait::async_trait;
use thiserror::Error;

use super::types::{ChatRequest, ChatResponse, EventStream};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("api error: {0}")]
    Api(#[from] OpenAIError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no choices in response")]
    EmptyChoices,

    /// 阻塞调用整体超时，或流式调用在首个 chunk 前超时
    #[error("no response within {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Transport(String),
}

/// 推理后端：阻塞调用与流式调用
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// 流式调用；建立连接失败返回 Err，之后的错误以 error 事件出现在流中
    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError>;

    fn name(&self) -> &str;
}
