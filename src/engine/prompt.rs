//! 追加在 Agent system prompt 之后的工具说明

use std::fmt::Write;

use crate::store::ToolDefinition;

pub fn build_tool_instruction(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return "You have no available tools. Answer directly.".to_string();
    }
    let mut sb = String::from(
        "You have the ability to call tools to complete tasks. Prefer using tools when they can provide accurate or fresh information.\nAvailable tools:\n",
    );
    for (i, t) in tools.iter().enumerate() {
        let _ = writeln!(sb, "{}. {} - {}", i + 1, t.name, t.description);
    }
    sb.push_str("When a tool is relevant, call it with correct arguments; otherwise answer directly.");
    sb
}

/// 完整的 system prompt：Agent prompt + 空行 + 工具说明
pub fn system_prompt(agent_prompt: &str, tools: &[ToolDefinition]) -> String {
    format!("{}\n\n{}", agent_prompt, build_tool_instruction(tools))
}
