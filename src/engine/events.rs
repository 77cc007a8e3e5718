//! 引擎对外的流式事件
//!
//! 与 provider 流共用 StreamEvent 结构：content 增量原样转发，每个工具批次一个 tool_call，
//! 每次交接一个 handoff，整条流以一个 done（携带最终文本）或 error 结束。

use tokio::sync::mpsc;
use tracing::debug;

pub use crate::llm::StreamEvent as RunStreamEvent;

pub type EventSink = mpsc::Sender<RunStreamEvent>;

/// 推送事件；接收端已关闭时只记录日志，Run 继续执行
pub(crate) async fn emit(sink: Option<&EventSink>, event: RunStreamEvent) {
    if let Some(tx) = sink {
        if tx.send(event).await.is_err() {
            debug!("stream receiver dropped");
        }
    }
}

/// 单行 JSON（JSON Lines 输出）
pub fn to_json_line(event: &RunStreamEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        format!(r#"{{"type":"error","error":"encode event: {e}"}}"#)
    })
}
