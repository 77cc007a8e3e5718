//! 文件系统工具族：list_directory / read_file / write_file / search_files
//!
//! 所有路径相对工作区根目录解析，不允许越出根目录。I/O 失败折叠进输出文本。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use super::command::failure_text;
use super::registry::{parse_args, ToolError, ToolFamily, ToolSpec};
use super::schema::parameters_schema;

/// search_files 跳过的目录
const SKIP_DIRS: &[&str] = &["target", "node_modules"];
/// search_files 跳过超过该大小的文件
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ListArgs {
    /// 目录路径，默认 "."
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadArgs {
    /// 文件路径
    path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteArgs {
    path: String,
    /// 写入的完整内容（覆盖）
    content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchArgs {
    /// 正则表达式
    pattern: String,
    /// 仅搜索匹配该 glob 的文件，如 "*.rs"
    #[serde(default)]
    include: Option<String>,
}

pub struct FilesystemFamily {
    workspace_root: PathBuf,
    max_results: usize,
}

impl FilesystemFamily {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            max_results: 200,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// 相对路径 → 工作区内绝对路径；绝对路径与 `..` 拒绝
    fn resolve(&self, rel: &str) -> Result<PathBuf, String> {
        let rel = Path::new(rel);
        let escapes = rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(format!("path escapes workspace: {}", rel.display()));
        }
        Ok(self.workspace_root.join(rel))
    }

    async fn list_directory(&self, a: ListArgs) -> String {
        let rel = a.path.filter(|p| !p.is_empty()).unwrap_or_else(|| ".".into());
        let dir = match self.resolve(&rel) {
            Ok(dir) => dir,
            Err(e) => return failure_text(format!("ls error: {e}"), ""),
        };
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => return failure_text(format!("ls error: {e}"), ""),
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        name.push('/');
                    }
                    names.push(name);
                }
                Ok(None) => break,
                Err(e) => return failure_text(format!("ls error: {e}"), &names.join("\n")),
            }
        }
        names.sort();
        names.join("\n")
    }

    async fn read_file(&self, a: ReadArgs) -> String {
        let path = match self.resolve(&a.path) {
            Ok(p) => p,
            Err(e) => return failure_text(format!("read error: {e}"), ""),
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => failure_text(format!("read error: {e}"), ""),
        }
    }

    async fn write_file(&self, a: WriteArgs) -> String {
        let path = match self.resolve(&a.path) {
            Ok(p) => p,
            Err(e) => return failure_text(format!("write error: {e}"), ""),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return failure_text(format!("write error: {e}"), "");
            }
        }
        match tokio::fs::write(&path, a.content.as_bytes()).await {
            Ok(()) => format!("Successfully wrote to {}", a.path),
            Err(e) => failure_text(format!("write error: {e}"), ""),
        }
    }

    async fn search_files(&self, a: SearchArgs) -> Result<String, ToolError> {
        let re = Regex::new(&a.pattern)
            .map_err(|e| ToolError::InvalidArgs(format!("invalid pattern: {e}")))?;
        let include = a
            .include
            .filter(|g| !g.is_empty())
            .map(|g| glob::Pattern::new(&g))
            .transpose()
            .map_err(|e| ToolError::InvalidArgs(format!("invalid include glob: {e}")))?;

        let root = self.workspace_root.clone();
        let max = self.max_results;
        let result =
            tokio::task::spawn_blocking(move || search_tree(&root, &re, include.as_ref(), max))
                .await;
        Ok(match result {
            Ok(text) => text,
            Err(e) => failure_text(format!("search error: {e}"), ""),
        })
    }
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIP_DIRS.contains(&&*name))
}

/// 输出 `path:line:text`，最多 max 行
fn search_tree(root: &Path, re: &Regex, include: Option<&glob::Pattern>, max: usize) -> String {
    let mut hits = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e));

    'files: for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .metadata()
            .map(|m| m.len() > MAX_SEARCH_FILE_BYTES)
            .unwrap_or(true)
        {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if let Some(pattern) = include {
            let name_match = entry
                .file_name()
                .to_str()
                .map(|n| pattern.matches(n))
                .unwrap_or(false);
            if !name_match && !pattern.matches_path(rel) {
                continue;
            }
        }
        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (i, line) in text.lines().enumerate() {
            if re.is_match(line) {
                hits.push(format!("{}:{}:{}", rel.display(), i + 1, line.trim_end()));
                if hits.len() >= max {
                    break 'files;
                }
            }
        }
    }

    if hits.is_empty() {
        "No matches found.".to_string()
    } else {
        hits.join("\n")
    }
}

#[async_trait]
impl ToolFamily for FilesystemFamily {
    fn family(&self) -> &'static str {
        "filesystem"
    }

    fn matches(&self, server_name: &str) -> bool {
        server_name.contains("filesystem") || server_name.contains("fs")
    }

    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "list_directory",
                description: "List entries of a directory in the workspace; directories end with '/'.",
                parameters: parameters_schema::<ListArgs>(),
            },
            ToolSpec {
                name: "read_file",
                description: "Read a text file from the workspace.",
                parameters: parameters_schema::<ReadArgs>(),
            },
            ToolSpec {
                name: "write_file",
                description: "Write content to a file in the workspace, replacing it if it exists.",
                parameters: parameters_schema::<WriteArgs>(),
            },
            ToolSpec {
                name: "search_files",
                description: "Search workspace files line by line with a regular expression.",
                parameters: parameters_schema::<SearchArgs>(),
            },
        ]
    }

    async fn call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        match tool {
            "list_directory" => Ok(self.list_directory(parse_args(args)?).await),
            "read_file" => {
                let a: ReadArgs =
                    parse_args(args).map_err(|_| ToolError::InvalidArgs("missing path".into()))?;
                Ok(self.read_file(a).await)
            }
            "write_file" => {
                let a: WriteArgs = parse_args(args)
                    .map_err(|_| ToolError::InvalidArgs("missing path or content".into()))?;
                Ok(self.write_file(a).await)
            }
            "search_files" => {
                let a: SearchArgs = parse_args(args)
                    .map_err(|_| ToolError::InvalidArgs("missing pattern".into()))?;
                self.search_files(a).await
            }
            other => Err(ToolError::UnknownTool {
                family: "filesystem",
                tool: other.to_string(),
            }),
        }
    }
}
