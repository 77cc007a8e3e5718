//! 执行链路树：按 Run 展开 RunStep，交接步骤内联子 Run 的步骤
//!
//! 同时把 parent_run_id 指向当前 Run、但未被步骤引用的子 Run 作为 `run` 节点追加。
//! visited 集合 + 深度上限保证每个 Run 至多展开一次且一定终止。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::store::{Run, RunStep, StoreError, TraceStore};

/// 默认最大展开深度
pub const DEFAULT_MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub id: String,
    pub run_id: String,
    /// thought / tool_call / handoff / run
    pub step_type: String,
    pub name: String,
    pub status: String,
    pub input_payload: Value,
    pub output_payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub latency_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn from_step(step: &RunStep) -> Self {
        Self {
            id: step.id.clone(),
            run_id: step.run_id.clone(),
            step_type: step.step_type().as_str().to_string(),
            name: step.name.clone(),
            status: step.status.as_str().to_string(),
            input_payload: step.payload.input_value(),
            output_payload: step.payload.output_value(),
            error_message: step.error_message.clone(),
            latency_ms: step.latency_ms,
            started_at: step.started_at,
            finished_at: step.finished_at,
            children: Vec::new(),
        }
    }

    fn from_run(run: &Run, name: String, children: Vec<TraceNode>) -> Self {
        Self {
            id: run.id.clone(),
            run_id: run.id.clone(),
            step_type: "run".to_string(),
            name,
            status: run.status.as_str().to_string(),
            input_payload: serde_json::to_value(&run.input).unwrap_or(Value::Null),
            output_payload: serde_json::to_value(&run.output).unwrap_or(Value::Null),
            error_message: run.output.error.clone(),
            latency_ms: run.latency_ms(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            children,
        }
    }

    /// 节点总数（含自身）
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TraceNode::count).sum::<usize>()
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

pub struct TraceTreeBuilder<'a> {
    store: &'a dyn TraceStore,
    max_depth: usize,
}

impl<'a> TraceTreeBuilder<'a> {
    pub fn new(store: &'a dyn TraceStore) -> Self {
        Self {
            store,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// 根 Run 的步骤节点列表；根 Run 不存在返回 NotFound
    pub fn build(&self, root_run_id: &str) -> Result<Vec<TraceNode>, StoreError> {
        let root = self.store.get_run(root_run_id)?;
        let mut visited = HashSet::from([root.id.clone()]);
        self.expand(&root.id, 0, &mut visited)
    }

    /// 以根 Run 为根节点的完整树
    pub fn build_run_tree(&self, root_run_id: &str) -> Result<TraceNode, StoreError> {
        let root = self.store.get_run(root_run_id)?;
        let mut visited = HashSet::from([root.id.clone()]);
        let children = self.expand(&root.id, 0, &mut visited)?;
        Ok(TraceNode::from_run(
            &root,
            format!("Agent Run: {}", short_id(&root.agent_id)),
            children,
        ))
    }

    fn expand(
        &self,
        run_id: &str,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<TraceNode>, StoreError> {
        let steps = self.store.list_run_steps(run_id)?;
        let mut nodes = Vec::with_capacity(steps.len());

        for step in &steps {
            let mut node = TraceNode::from_step(step);
            if let Some(child_id) = step.child_run_id() {
                if let Some(child) = self.enter(child_id, depth, visited)? {
                    let grandchildren = self.expand(&child.id, depth + 1, visited)?;
                    node.children.push(TraceNode::from_run(
                        &child,
                        format!("Child Agent Run: {}", short_id(&child.agent_id)),
                        grandchildren,
                    ));
                }
            }
            nodes.push(node);
        }

        if depth < self.max_depth {
            for child in self.store.list_child_runs(run_id)? {
                if !visited.insert(child.id.clone()) {
                    continue;
                }
                let grandchildren = self.expand(&child.id, depth + 1, visited)?;
                nodes.push(TraceNode::from_run(
                    &child,
                    format!("Child Agent: {}", short_id(&child.agent_id)),
                    grandchildren,
                ));
            }
        }
        Ok(nodes)
    }

    /// 子 Run 可展开时返回它并标记已访问；已访问、超深或不存在时返回 None
    fn enter(
        &self,
        child_id: &str,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Option<Run>, StoreError> {
        if depth >= self.max_depth || visited.contains(child_id) {
            return Ok(None);
        }
        match self.store.get_run(child_id) {
            Ok(run) => {
                visited.insert(run.id.clone());
                Ok(Some(run))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
