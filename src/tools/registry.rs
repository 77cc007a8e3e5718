//! 工具族注册表
//!
//! 工具服务器按名称路由到编译期内置的工具族（git / filesystem）；
//! 每个工具族提供工具清单（名称、描述、参数 schema）与异步调用。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// 结构性错误：参数非法、服务器无实现、工具不存在。命令失败不在此列，折叠进输出文本
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid json args: {0}")]
    InvalidArgs(String),

    #[error("server implementation not found for: {0}")]
    ServerNotFound(String),

    #[error("unknown {family} tool: {tool}")]
    UnknownTool { family: &'static str, tool: String },
}

/// 工具清单条目
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// 参数 JSON Schema
    pub parameters: Value,
}

/// 工具族：一组共享路由规则的内置工具
#[async_trait]
pub trait ToolFamily: Send + Sync {
    /// 工具族名（用于日志与错误信息）
    fn family(&self) -> &'static str;

    /// 服务器名（已转小写）是否由本族处理
    fn matches(&self, server_name: &str) -> bool;

    fn specs(&self) -> Vec<ToolSpec>;

    async fn call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// 按注册顺序匹配；先注册者优先
#[derive(Default, Clone)]
pub struct FamilyRegistry {
    families: Vec<Arc<dyn ToolFamily>>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: impl ToolFamily + 'static) {
        self.families.push(Arc::new(family));
    }

    pub fn resolve(&self, server_name: &str) -> Option<Arc<dyn ToolFamily>> {
        let name = server_name.to_lowercase();
        self.families.iter().find(|f| f.matches(&name)).cloned()
    }

    pub fn family_names(&self) -> Vec<&'static str> {
        self.families.iter().map(|f| f.family()).collect()
    }
}

/// 把参数对象反序列化为工具的参数结构
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    args: &Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args.clone()))
        .map_err(|e| ToolError::InvalidArgs(e.to_string()))
}
