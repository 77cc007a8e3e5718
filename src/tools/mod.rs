//! 工具层：工具族注册、执行器（超时 + 审计）、git / filesystem 内置实现

pub mod command;
pub mod executor;
pub mod filesystem;
pub mod git;
pub mod registry;
pub mod schema;

pub use executor::ToolExecutor;
pub use filesystem::FilesystemFamily;
pub use git::GitFamily;
pub use registry::{FamilyRegistry, ToolError, ToolFamily, ToolSpec};
