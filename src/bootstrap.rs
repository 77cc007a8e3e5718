//! 默认数据：DevOps 五人团队 + git / filesystem 两个全局工具服务器及其工具清单
//!
//! 可重复调用；已存在的 Agent / 服务器跳过，工具只在服务器首次创建时写入。

use tracing::{debug, info};

use crate::store::{AgentProfile, StoreError, ToolDefinition, ToolServer, TraceStore};
use crate::tools::ToolExecutor;

pub const GIT_SERVER_ID: &str = "srv-git";
pub const FS_SERVER_ID: &str = "srv-filesystem";

pub const MANAGER_ID: &str = "agent-manager";
pub const ARCHITECT_ID: &str = "agent-architect";
pub const CODER_ID: &str = "agent-coder";
pub const QA_ID: &str = "agent-qa";
pub const REVIEWER_ID: &str = "agent-reviewer";

const MANAGER_PROMPT: &str = "你是资深的 DevOps 项目经理，不直接写代码。\n\
理解用户需求后拆解为子任务，交给最合适的成员：\n\
- 需求模糊时先交给 Architect 设计方案\n\
- 功能点明确时交给 Coder 实现\n\
- 代码完成后交给 QA 补充测试\n\
- 最后交给 Reviewer 审查";

const ARCHITECT_PROMPT: &str = "你是首席架构师。\n\
1. 分析业务需求，给出架构图（Mermaid）或目录结构\n\
2. 决定技术栈\n\
3. 定义核心接口与数据库 Schema\n\
4. 保持高内聚、低耦合";

const CODER_PROMPT: &str = "你是经验丰富的全栈工程师。\n\
1. 按架构设计或经理要求编写代码，可使用 git 与文件系统工具\n\
2. 代码附带清晰注释\n\
3. 出错时自行修正\n\
只输出代码和必要说明。";

const QA_PROMPT: &str = "你是质量保证专家。\n\
1. 为 Coder 的代码编写单元测试，覆盖边界条件与异常路径\n\
2. 测试不依赖未 Mock 的外部服务\n\
3. 使用语言自带的标准测试框架";

const REVIEWER_PROMPT: &str = "你是以严格著称的代码审查员。\n\
检查安全漏洞（注入、XSS、并发安全）、命名规范、性能瓶颈以及测试是否有效。\n\
代码没有问题时回复 \"LGTM (Looks Good To Me)\"，否则列出具体位置与修改建议。";

fn default_team() -> Vec<AgentProfile> {
    let both: &[&str] = &[GIT_SERVER_ID, FS_SERVER_ID];
    vec![
        AgentProfile::new("DevOps Manager", "gpt-4o", MANAGER_PROMPT)
            .with_id(MANAGER_ID)
            .with_description("需求分析、任务拆解与分派")
            .with_temperature(0.2)
            .with_tags(&["manager", "orchestrator"]),
        AgentProfile::new("Software Architect", "gpt-4o", ARCHITECT_PROMPT)
            .with_id(ARCHITECT_ID)
            .with_description("高层设计与技术决策")
            .with_temperature(0.7)
            .with_tags(&["design", "structure"]),
        AgentProfile::new("Senior Coder", "claude-3-5-sonnet", CODER_PROMPT)
            .with_id(CODER_ID)
            .with_description("高质量代码实现")
            .with_temperature(0.1)
            .with_tool_servers(both)
            .with_tags(&["coding", "implementation"]),
        AgentProfile::new("QA Engineer", "gpt-4o", QA_PROMPT)
            .with_id(QA_ID)
            .with_description("编写测试用例，保证覆盖率")
            .with_temperature(0.1)
            .with_tags(&["testing", "coverage"]),
        AgentProfile::new("Code Reviewer", "gpt-4o", REVIEWER_PROMPT)
            .with_id(REVIEWER_ID)
            .with_description("代码审查与安全检查")
            .with_temperature(0.1)
            .with_tool_servers(both)
            .with_tags(&["audit", "security"]),
    ]
}

/// 写入默认团队与工具服务器
pub fn seed_defaults(store: &dyn TraceStore, executor: &ToolExecutor) -> Result<(), StoreError> {
    seed_tool_servers(store, executor)?;
    seed_team(store)
}

fn seed_tool_servers(store: &dyn TraceStore, executor: &ToolExecutor) -> Result<(), StoreError> {
    let servers = [
        ToolServer::new(GIT_SERVER_ID, "git-server").global(),
        ToolServer::new(FS_SERVER_ID, "filesystem-server").global(),
    ];
    for server in servers {
        if exists(store.get_tool_server(&server.id))? {
            debug!(server = %server.name, "tool server already seeded");
            continue;
        }
        store.create_tool_server(&server)?;

        let specs = executor.specs_for(&server.name).unwrap_or_default();
        for spec in &specs {
            store.create_tool(&ToolDefinition::new(
                &server.id,
                spec.name,
                spec.description,
                spec.parameters.clone(),
            ))?;
        }
        info!(server = %server.name, tools = specs.len(), "seeded tool server");
    }
    Ok(())
}

fn seed_team(store: &dyn TraceStore) -> Result<(), StoreError> {
    for agent in default_team() {
        if exists(store.get_agent(&agent.id))? {
            continue;
        }
        store.create_agent(&agent)?;
        info!(agent = %agent.name, "seeded agent");
    }
    Ok(())
}

fn exists<T>(lookup: Result<T, StoreError>) -> Result<bool, StoreError> {
    match lookup {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_seed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let executor = ToolExecutor::with_defaults(dir.path(), 5);

        seed_defaults(&store, &executor).unwrap();
        seed_defaults(&store, &executor).unwrap();

        assert_eq!(store.list_agents().unwrap().len(), 5);
        let coder_tools = store.list_tools_for_agent(CODER_ID).unwrap();
        assert_eq!(coder_tools.len(), 8);
        assert!(coder_tools.iter().any(|t| t.name == "git_commit"));
        assert!(coder_tools.iter().any(|t| t.name == "search_files"));
        assert!(store.list_tools_for_agent(MANAGER_ID).unwrap().is_empty());
    }

    #[test]
    fn test_seeded_tool_resolves_to_server() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        seed_defaults(&store, &ToolExecutor::with_defaults(dir.path(), 5)).unwrap();

        let server = store.find_tool_server(REVIEWER_ID, "read_file").unwrap().unwrap();
        assert_eq!(server.id, FS_SERVER_ID);
        let server = store.find_tool_server(REVIEWER_ID, "git_log").unwrap().unwrap();
        assert_eq!(server.id, GIT_SERVER_ID);
    }
}
