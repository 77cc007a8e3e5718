//! 工具执行器
//!
//! execute(server, tool, args_json)：解析参数 → 按服务器名路由到工具族 → 在超时内调用。
//! 结构性错误（参数、路由、未知工具）返回 ToolError；超时与命令失败折叠进输出文本。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use super::command::failure_text;
use super::filesystem::FilesystemFamily;
use super::git::GitFamily;
use super::registry::{FamilyRegistry, ToolError, ToolFamily, ToolSpec};
use crate::config::ToolsSection;
use crate::store::ToolServer;

pub struct ToolExecutor {
    registry: FamilyRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: FamilyRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 内置 git + filesystem 工具族，git 优先匹配
    pub fn with_defaults(workspace_root: impl AsRef<Path>, timeout_secs: u64) -> Self {
        let root = workspace_root.as_ref();
        let mut registry = FamilyRegistry::new();
        registry.register(GitFamily::new(root));
        registry.register(FilesystemFamily::new(root));
        Self::new(registry, timeout_secs)
    }

    pub fn from_config(cfg: &ToolsSection) -> Self {
        let mut registry = FamilyRegistry::new();
        registry.register(GitFamily::new(&cfg.workspace_root));
        registry.register(
            FilesystemFamily::new(&cfg.workspace_root).with_max_results(cfg.max_search_results),
        );
        Self::new(registry, cfg.tool_timeout_secs)
    }

    /// 服务器对应工具族的工具清单
    pub fn specs_for(&self, server_name: &str) -> Option<Vec<ToolSpec>> {
        self.registry.resolve(server_name).map(|f| f.specs())
    }

    pub async fn execute(
        &self,
        server: &ToolServer,
        tool: &str,
        args_json: &str,
    ) -> Result<String, ToolError> {
        let args = parse_args_json(args_json)?;
        let family = self
            .registry
            .resolve(&server.name)
            .ok_or_else(|| ToolError::ServerNotFound(server.name.to_lowercase()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, family.call(tool, &args)).await;

        let (ok, outcome) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "server": server.name,
            "family": family.family(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args_json),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Ok(failure_text(
                format!("{tool} timed out after {}s", self.timeout.as_secs()),
                "",
            )),
        }
    }
}

/// 空串或 "{}" 视为空参数
fn parse_args_json(args_json: &str) -> Result<Map<String, Value>, ToolError> {
    let trimmed = args_json.trim();
    if trimmed.is_empty() || trimmed == "{}" {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ToolError::InvalidArgs(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(ToolError::InvalidArgs(e.to_string())),
    }
}

fn args_preview(args: &str) -> String {
    if args.chars().count() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}
