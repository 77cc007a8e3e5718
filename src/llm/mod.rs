//! 推理层：请求/响应类型、后端抽象、OpenAI 兼容实现、交接信封、流式拼接、脚本化后端

pub mod handoff;
pub mod mock;
pub mod openai;
pub mod stream;
pub mod traits;
pub mod types;

pub use handoff::{build_handoff_instruction, parse_content_and_handoff, ParsedContent};
pub use mock::{Scripted, ScriptedProvider};
pub use openai::{OpenAiProvider, UsageMeter};
pub use stream::{pump_chunks, StreamAssembler};
pub use traits::{InferenceProvider, ProviderError};
pub use types::{ChatRequest, ChatResponse, EventStream, HandoffCandidate, StreamEvent};
