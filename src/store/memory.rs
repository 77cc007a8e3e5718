//! 内存存储：测试与单次 CLI 运行使用

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::model::{
    AgentProfile, ChatMessage, ChatSession, Run, RunOutput, RunStatus, RunStep, StepCompletion,
    TokenUsage, ToolDefinition, ToolServer,
};
use super::traits::{apply_completion, StoreError, StoreResult, TraceStore};

#[derive(Default)]
struct Tables {
    agents: Vec<AgentProfile>,
    sessions: HashMap<String, ChatSession>,
    servers: Vec<ToolServer>,
    tools: Vec<ToolDefinition>,
    runs: Vec<Run>,
    steps: Vec<RunStep>,
    messages: Vec<ChatMessage>,
}

/// 以插入顺序保存各表；列表按时间戳稳定排序
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

impl TraceStore for MemoryStore {
    fn create_agent(&self, agent: &AgentProfile) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.agents.iter().any(|a| a.id == agent.id) {
            return Err(StoreError::Conflict {
                kind: "agent",
                id: agent.id.clone(),
            });
        }
        t.agents.push(agent.clone());
        Ok(())
    }

    fn get_agent(&self, id: &str) -> StoreResult<AgentProfile> {
        self.read()?
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    fn list_agents(&self) -> StoreResult<Vec<AgentProfile>> {
        let mut agents = self.read()?.agents.clone();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    fn create_session(&self, session: &ChatSession) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict {
                kind: "session",
                id: session.id.clone(),
            });
        }
        t.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, id: &str) -> StoreResult<ChatSession> {
        self.read()?
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    fn create_tool_server(&self, server: &ToolServer) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.servers.iter().any(|s| s.id == server.id) {
            return Err(StoreError::Conflict {
                kind: "tool server",
                id: server.id.clone(),
            });
        }
        t.servers.push(server.clone());
        Ok(())
    }

    fn get_tool_server(&self, id: &str) -> StoreResult<ToolServer> {
        self.read()?
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tool server", id))
    }

    fn create_tool(&self, tool: &ToolDefinition) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.servers.iter().any(|s| s.id == tool.server_id) {
            return Err(StoreError::not_found("tool server", &tool.server_id));
        }
        t.tools.push(tool.clone());
        Ok(())
    }

    fn list_tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<ToolDefinition>> {
        let t = self.read()?;
        let agent = t
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| StoreError::not_found("agent", agent_id))?;
        let mut tools: Vec<ToolDefinition> = t
            .tools
            .iter()
            .filter(|tool| agent.tool_server_ids.contains(&tool.server_id))
            .cloned()
            .collect();
        tools.sort_by_key(|tool| tool.created_at);
        Ok(tools)
    }

    fn find_tool_server(&self, agent_id: &str, tool_name: &str) -> StoreResult<Option<ToolServer>> {
        let t = self.read()?;
        let bound: &[String] = t
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .map(|a| a.tool_server_ids.as_slice())
            .unwrap_or(&[]);

        let chosen = t
            .tools
            .iter()
            .find(|tool| tool.name == tool_name && bound.contains(&tool.server_id));

        Ok(chosen.and_then(|tool| t.servers.iter().find(|s| s.id == tool.server_id).cloned()))
    }

    fn create_run(&self, run: &Run) -> StoreResult<()> {
        let mut t = self.write()?;
        if t.runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::Conflict {
                kind: "run",
                id: run.id.clone(),
            });
        }
        t.runs.push(run.clone());
        Ok(())
    }

    fn get_run(&self, id: &str) -> StoreResult<Run> {
        self.read()?
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        output: RunOutput,
        usage: TokenUsage,
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        let run = t
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.output = output;
        run.usage = usage;
        run.finished_at = Some(chrono::Utc::now());
        Ok(true)
    }

    fn list_child_runs(&self, parent_run_id: &str) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .read()?
            .runs
            .iter()
            .filter(|r| r.parent_run_id.as_deref() == Some(parent_run_id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    fn create_run_step(&self, step: &RunStep) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.runs.iter().any(|r| r.id == step.run_id) {
            return Err(StoreError::not_found("run", &step.run_id));
        }
        t.steps.push(step.clone());
        Ok(())
    }

    fn get_run_step(&self, id: &str) -> StoreResult<RunStep> {
        self.read()?
            .steps
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run step", id))
    }

    fn finish_run_step(&self, id: &str, completion: StepCompletion) -> StoreResult<RunStep> {
        let mut t = self.write()?;
        let step = t
            .steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::not_found("run step", id))?;
        apply_completion(step, completion)?;
        Ok(step.clone())
    }

    fn list_run_steps(&self, run_id: &str) -> StoreResult<Vec<RunStep>> {
        let mut steps: Vec<RunStep> = self
            .read()?
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }

    fn create_chat_message(&self, message: &ChatMessage) -> StoreResult<()> {
        let mut t = self.write()?;
        if !t.sessions.contains_key(&message.session_id) {
            return Err(StoreError::not_found("session", &message.session_id));
        }
        t.messages.push(message.clone());
        Ok(())
    }

    fn list_session_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .read()?
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    fn list_run_messages(&self, run_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self
            .read()?
            .messages
            .iter()
            .filter(|m| m.run_id.as_deref() == Some(run_id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{StepOutput, StepStatus, ThoughtInput, ToolCallOutput};
    use serde_json::json;

    fn seeded() -> (MemoryStore, ChatSession) {
        let store = MemoryStore::new();
        store
            .create_tool_server(&ToolServer::new("srv-git", "git-server"))
            .unwrap();
        store
            .create_tool(&ToolDefinition::new("srv-git", "git_status", "status", json!({})))
            .unwrap();
        let agent = AgentProfile::new("Coder", "m", "p")
            .with_id("a1")
            .with_tool_servers(&["srv-git"]);
        store.create_agent(&agent).unwrap();
        let session = ChatSession::new("u1", "a1");
        store.create_session(&session).unwrap();
        (store, session)
    }

    #[test]
    fn test_finish_run_only_once() {
        let (store, session) = seeded();
        let run = Run::new_root(&session, "hi");
        store.create_run(&run).unwrap();

        assert!(store
            .finish_run(&run.id, RunStatus::Succeeded, RunOutput::response("ok"), TokenUsage::default())
            .unwrap());
        assert!(!store
            .finish_run(&run.id, RunStatus::Failed, RunOutput::error("late"), TokenUsage::default())
            .unwrap());

        let stored = store.get_run(&run.id).unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_eq!(stored.output.response.as_deref(), Some("ok"));
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn test_step_completion_and_mismatch() {
        let (store, session) = seeded();
        let run = Run::new_root(&session, "hi");
        store.create_run(&run).unwrap();
        let step = RunStep::thought(&run.id, ThoughtInput::default());
        store.create_run_step(&step).unwrap();

        let err = store
            .finish_run_step(
                &step.id,
                StepCompletion {
                    output: StepOutput::ToolCall(ToolCallOutput::default()),
                    status: StepStatus::Completed,
                    latency_ms: 1,
                    error: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::PayloadMismatch { .. }));
        assert_eq!(store.get_run_step(&step.id).unwrap().status, StepStatus::Running);
    }

    #[test]
    fn test_find_tool_server_only_bound() {
        let (store, _) = seeded();
        store
            .create_tool_server(&ToolServer::new("srv-other", "other-git"))
            .unwrap();
        store
            .create_tool(&ToolDefinition::new("srv-other", "git_status", "status", json!({})))
            .unwrap();

        let server = store.find_tool_server("a1", "git_status").unwrap().unwrap();
        assert_eq!(server.id, "srv-git");

        // 未绑定任何服务器的 Agent 找不到同名工具
        let loner = AgentProfile::new("QA", "m", "p").with_id("a2");
        store.create_agent(&loner).unwrap();
        assert!(store.find_tool_server("a2", "git_status").unwrap().is_none());
        assert!(store.find_tool_server("nobody", "git_status").unwrap().is_none());
        assert!(store.find_tool_server("a1", "missing").unwrap().is_none());
    }

    #[test]
    fn test_tools_for_agent_filters_bindings() {
        let (store, _) = seeded();
        let loner = AgentProfile::new("QA", "m", "p").with_id("a2");
        store.create_agent(&loner).unwrap();
        assert_eq!(store.list_tools_for_agent("a1").unwrap().len(), 1);
        assert!(store.list_tools_for_agent("a2").unwrap().is_empty());
        assert!(store.list_tools_for_agent("ghost").unwrap_err().is_not_found());
    }
}
