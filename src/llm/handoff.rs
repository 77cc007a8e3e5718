//! 交接信封：模型回复 `{"text": "...", "handoff": {...}}` 的解析与说明提示

use std::fmt::Write;

use serde_json::Value;

use super::types::HandoffCandidate;
use crate::store::HandoffDecision;

/// 模型回复解析结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedContent {
    pub text: String,
    /// 仅在 target_agent_id 非空时存在
    pub handoff: Option<HandoffDecision>,
    pub raw: Option<Value>,
}

/// 去掉 ```json 代码块包裹
fn strip_fence(trimmed: &str) -> &str {
    let Some(rest) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return trimmed;
    };
    rest.rfind("```")
        .map(|end| rest[..end].trim())
        .unwrap_or(rest.trim())
}

/// 解析回复文本：JSON 对象时取 text（其次 message）与 handoff，否则原样返回
pub fn parse_content_and_handoff(content: &str) -> ParsedContent {
    let body = strip_fence(content.trim());
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return ParsedContent {
            text: content.to_string(),
            ..ParsedContent::default()
        };
    };

    let handoff = map
        .get("handoff")
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value::<HandoffDecision>(v.clone()).ok())
        .filter(HandoffDecision::is_active);

    let pick = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    let text = pick("text")
        .or_else(|| pick("message"))
        .unwrap_or_else(|| content.to_string());

    ParsedContent {
        text,
        handoff,
        raw: Some(Value::Object(map)),
    }
}

fn safe_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "Unnamed Agent"
    } else {
        name
    }
}

fn safe_desc(desc: &str) -> &str {
    if desc.trim().is_empty() {
        "No description"
    } else {
        desc
    }
}

/// 交接说明：列出候选 Agent，要求仅以 JSON 信封回复
pub fn build_handoff_instruction(candidates: &[HandoffCandidate]) -> String {
    let mut sb = String::new();
    sb.push_str("You have the ability to transfer conversations to other agents.\n");
    sb.push_str("Available transfers:\n\n");

    if candidates.is_empty() {
        sb.push_str("  (no available agents; keep target_agent_id empty)\n\n");
    } else {
        for (i, c) in candidates.iter().enumerate() {
            let _ = writeln!(
                sb,
                "{}. {} - {} ({})",
                i + 1,
                safe_name(&c.name),
                safe_desc(&c.description),
                c.agent_id
            );
        }
        sb.push('\n');
    }

    sb.push_str("Each agent has specific expertise. Choose to transfer when:\n");
    sb.push_str("- The user's question is outside your scope\n");
    sb.push_str("- Another agent is better suited for the task\n");
    sb.push_str("- You cannot complete the user's request\n\n");
    sb.push_str("To transfer, ALWAYS reply with JSON only:\n");
    sb.push_str(
        "{\"text\": \"...\", \"handoff\": {\"target_agent_id\": \"\", \"reason\": \"\", \"preferred_server\": \"\"}}\n",
    );
    sb.push_str("Rules:\n");
    sb.push_str("- target_agent_id empty string => do not transfer.\n");
    sb.push_str("- preferred_server optional; leave empty if not sure.\n");
    sb.push_str("- Respond with JSON only, no extra text.");
    sb
}
