//! Run 引擎：ReAct 循环、交接递归、流式事件与执行链路树

pub mod events;
pub mod prompt;
pub mod runner;
pub mod trace;

pub use events::{to_json_line, EventSink, RunStreamEvent};
pub use runner::{EngineSettings, RunEngine};
pub use trace::{TraceNode, TraceTreeBuilder};
