//! 核心：错误分类与取消注册表

pub mod cancel;
pub mod error;

pub use cancel::{CancelRegistry, RunRegistration};
pub use error::EngineError;
