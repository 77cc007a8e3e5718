//! 子进程执行：失败不报错，折叠进输出文本供模型自我修正

use std::path::Path;

use tokio::process::Command;
use tracing::debug;

/// 命令失败标记
pub const FAILURE_MARKER: &str = "Command failed:";

/// 失败文本：`Command failed: <reason>\nOutput:\n<output>`
pub fn failure_text(reason: impl std::fmt::Display, output: &str) -> String {
    format!("{FAILURE_MARKER} {reason}\nOutput:\n{output}")
}

/// 在 cwd 中运行命令，返回合并后的 stdout + stderr
///
/// 子进程随 future 一起被丢弃时会被终止（取消 / 超时）。
pub async fn run_command(program: &str, args: &[&str], cwd: &Path) -> String {
    debug!(program, ?args, cwd = %cwd.display(), "run command");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) => {
            let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&out.stderr));
            if out.status.success() {
                combined
            } else {
                failure_text(out.status, &combined)
            }
        }
        Err(e) => failure_text(e, ""),
    }
}
