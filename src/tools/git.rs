//! git 工具族：git_status / git_diff / git_log / git_commit

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::command::run_command;
use super::registry::{parse_args, ToolError, ToolFamily, ToolSpec};
use super::schema::parameters_schema;

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct StatusArgs {
    /// 仓库路径（相对工作区根目录，默认根目录）
    #[serde(default)]
    repo_path: Option<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct DiffArgs {
    /// 比较目标，默认 HEAD
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    repo_path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CommitArgs {
    /// 提交信息
    message: String,
    /// 提交前执行 `git add .`
    #[serde(default)]
    add_all: bool,
    #[serde(default)]
    repo_path: Option<String>,
}

pub struct GitFamily {
    workspace_root: PathBuf,
}

impl GitFamily {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    fn repo_dir(&self, repo_path: Option<&str>) -> PathBuf {
        match repo_path.filter(|p| !p.trim().is_empty()) {
            Some(p) => self.workspace_root.join(p),
            None => self.workspace_root.clone(),
        }
    }
}

#[async_trait]
impl ToolFamily for GitFamily {
    fn family(&self) -> &'static str {
        "git"
    }

    fn matches(&self, server_name: &str) -> bool {
        server_name.contains("git")
    }

    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "git_status",
                description: "Show the working tree status of the repository.",
                parameters: parameters_schema::<StatusArgs>(),
            },
            ToolSpec {
                name: "git_diff",
                description: "Show changes between the working tree and a target revision (default HEAD).",
                parameters: parameters_schema::<DiffArgs>(),
            },
            ToolSpec {
                name: "git_log",
                description: "Show the last 10 commits, one line each.",
                parameters: parameters_schema::<StatusArgs>(),
            },
            ToolSpec {
                name: "git_commit",
                description: "Record changes to the repository with a commit message; set add_all to stage everything first.",
                parameters: parameters_schema::<CommitArgs>(),
            },
        ]
    }

    async fn call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        match tool {
            "git_status" => {
                let a: StatusArgs = parse_args(args)?;
                let dir = self.repo_dir(a.repo_path.as_deref());
                Ok(run_command("git", &["status"], &dir).await)
            }
            "git_diff" => {
                let a: DiffArgs = parse_args(args)?;
                let target = a
                    .target
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| "HEAD".to_string());
                let dir = self.repo_dir(a.repo_path.as_deref());
                Ok(run_command("git", &["diff", &target], &dir).await)
            }
            "git_log" => {
                let a: StatusArgs = parse_args(args)?;
                let dir = self.repo_dir(a.repo_path.as_deref());
                Ok(run_command("git", &["log", "-n", "10", "--oneline"], &dir).await)
            }
            "git_commit" => {
                let a: CommitArgs = parse_args(args)
                    .map_err(|_| ToolError::InvalidArgs("git_commit requires 'message'".into()))?;
                if a.message.trim().is_empty() {
                    return Err(ToolError::InvalidArgs("git_commit requires 'message'".into()));
                }
                let dir = self.repo_dir(a.repo_path.as_deref());
                let mut out = String::new();
                if a.add_all {
                    out.push_str(&run_command("git", &["add", "."], &dir).await);
                }
                out.push_str(&run_command("git", &["commit", "-m", &a.message], &dir).await);
                Ok(out)
            }
            other => Err(ToolError::UnknownTool {
                family: "git",
                tool: other.to_string(),
            }),
        }
    }
}
