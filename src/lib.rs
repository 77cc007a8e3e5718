//! Baton - 多智能体任务执行引擎
//!
//! 模块划分：
//! - **bootstrap**: 默认 Agent 团队与工具服务器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 引擎错误分类、取消注册表
//! - **engine**: ReAct 循环、Agent 交接、流式事件、执行链路树
//! - **llm**: 推理 provider 抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **observability**: tracing 订阅器
//! - **store**: 数据模型与存储契约（内存 / SQLite）
//! - **tools**: git 与文件系统工具族、执行器

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod observability;
pub mod store;
pub mod tools;

pub use crate::core::{CancelRegistry, EngineError};
pub use engine::{EngineSettings, RunEngine, RunStreamEvent, TraceNode, TraceTreeBuilder};
