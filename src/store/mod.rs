//! 持久化层：数据模型、存储契约、内存与 SQLite 实现

pub mod memory;
pub mod model;
pub mod sqlite;
pub mod traits;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use model::*;
pub use sqlite::SqliteStore;
pub use traits::{StoreError, StoreResult, TraceStore};

use crate::config::{StoreBackend, StoreSection};

/// 按配置打开存储后端
pub fn open_store(section: &StoreSection) -> StoreResult<Arc<dyn TraceStore>> {
    match section.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            if let Some(parent) = section.sqlite_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::InvalidData(format!("create store dir: {e}")))?;
                }
            }
            Ok(Arc::new(SqliteStore::open(&section.sqlite_path)?))
        }
    }
}
