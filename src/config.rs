//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BATON__*` 覆盖（双下划线表示嵌套，如 `BATON__ENGINE__MAX_STEPS=8`），
//! 最后兼容旧的 `LLM_API_KEY` / `LLM_BASE_URL` / `LLM_MODEL` / `LLM_TEMPERATURE`。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub store: StoreSection,
}

/// [engine] 段：ReAct 步数上限、交接深度上限、流式通道容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_steps: usize,
    pub max_handoff_depth: usize,
    pub stream_buffer: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_handoff_depth: 8,
            stream_buffer: 10,
        }
    }
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    /// 为 true 时使用 Agent 档案里的 model / temperature
    pub use_agent_model: bool,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.com/v1".to_string(),
            model: "Qwen/QwQ-32B".to_string(),
            api_key: None,
            temperature: 0.5,
            use_agent_model: false,
            request_timeout_secs: 120,
        }
    }
}

/// [tools] 段：工作区根目录、单次工具超时、搜索结果上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub workspace_root: PathBuf,
    pub tool_timeout_secs: u64,
    pub max_search_results: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            tool_timeout_secs: 30,
            max_search_results: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [store] 段：存储后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("data/baton.db"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BATON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 BATON__*（双下划线表示嵌套键）
/// 4. 旧环境变量 LLM_* 覆盖 [llm]
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BATON")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_legacy_env(&mut cfg.llm, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// LLM_API_KEY / LLM_BASE_URL / LLM_MODEL / LLM_TEMPERATURE；空值与无法解析的温度忽略
fn apply_legacy_env(llm: &mut LlmSection, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(key) = get("LLM_API_KEY") {
        llm.api_key = Some(key);
    }
    if let Some(url) = get("LLM_BASE_URL") {
        llm.base_url = url;
    }
    if let Some(model) = get("LLM_MODEL") {
        llm.model = model;
    }
    if let Some(t) = get("LLM_TEMPERATURE").and_then(|t| t.trim().parse::<f32>().ok()) {
        llm.temperature = t;
    }
}
