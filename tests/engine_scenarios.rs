//! RunEngine 场景测试：ScriptedProvider + MemoryStore + 临时目录中的工具执行器

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton::bootstrap::{seed_defaults, CODER_ID, MANAGER_ID, REVIEWER_ID};
use baton::llm::{ChatResponse, Scripted, ScriptedProvider};
use baton::store::{
    AgentProfile, ChatMessage, ChatSession, HandoffDecision, MemoryStore, Role, Run, RunStatus,
    StepStatus, StepType, ToolCall, ToolDefinition, ToolServer, TraceStore,
};
use baton::tools::{FamilyRegistry, ToolError, ToolExecutor, ToolFamily, ToolSpec};
use baton::{EngineError, EngineSettings, RunEngine, RunStreamEvent};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct Fixture {
    store: Arc<MemoryStore>,
    provider: Arc<ScriptedProvider>,
    engine: Arc<RunEngine>,
    dir: TempDir,
}

fn fixture_with(provider: ScriptedProvider, settings: EngineSettings) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ToolExecutor::with_defaults(dir.path(), 5));
    seed_defaults(store.as_ref(), &executor).unwrap();

    let provider = Arc::new(provider);
    let engine = Arc::new(RunEngine::new(
        store.clone(),
        provider.clone(),
        executor,
        settings,
    ));
    Fixture {
        store,
        provider,
        engine,
        dir,
    }
}

fn fixture(provider: ScriptedProvider) -> Fixture {
    fixture_with(provider, EngineSettings::default())
}

/// 轮询直到条件成立（最多约 1 秒）
async fn wait_for(mut ready: impl FnMut() -> bool) {
    for _ in 0..200 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn spawn_execute(engine: &Arc<RunEngine>, run_id: &str) -> JoinHandle<Result<String, EngineError>> {
    let engine = Arc::clone(engine);
    let run_id = run_id.to_string();
    tokio::spawn(async move { engine.execute_run(&run_id).await })
}

async fn join(handle: JoinHandle<Result<String, EngineError>>) -> Result<String, EngineError> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
}

async fn collect_stream(fx: &Fixture, run_id: &str) -> Vec<RunStreamEvent> {
    let (tx, mut rx) = fx.engine.stream_channel();
    let handle = fx.engine.execute_run_stream(run_id, tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    handle.await.unwrap();
    events
}

/// 会话 + 用户消息 + 根 Run
fn start_run(store: &MemoryStore, agent_id: &str, text: &str) -> Run {
    let session = ChatSession::new("user-1", agent_id);
    store.create_session(&session).unwrap();
    store
        .create_chat_message(&ChatMessage::user(&session.id, text))
        .unwrap();
    let run = Run::new_root(&session, text);
    store.create_run(&run).unwrap();
    run
}

#[tokio::test]
async fn test_tool_call_then_final_answer() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![ToolCall::new(
            "call_1",
            "write_file",
            r#"{"path":"notes.txt","content":"hello"}"#,
        )])
        .push_text("done");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "write a note");

    let text = fx.engine.execute_run(&run.id).await.unwrap();
    assert_eq!(text, "done");
    assert_eq!(
        std::fs::read_to_string(fx.dir.path().join("notes.txt")).unwrap(),
        "hello"
    );

    let messages = fx.store.list_session_messages(&run.session_id).unwrap();
    let roles: Vec<Role> = messages.iter().map(ChatMessage::role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(messages[1].tool_calls().len(), 1);
    assert!(messages[1].is_hidden);
    assert_eq!(messages[2].tool_call_id(), Some("call_1"));
    assert_eq!(messages[2].text(), "Successfully wrote to notes.txt");
    assert!(messages[2].is_hidden);
    assert_eq!(messages[3].text(), "done");
    assert!(!messages[3].is_hidden);

    let finished = fx.store.get_run(&run.id).unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(finished.output.response.as_deref(), Some("done"));
    assert!(finished.finished_at.is_some());

    let steps = fx.store.list_run_steps(&run.id).unwrap();
    let kinds: Vec<StepType> = steps.iter().map(|s| s.step_type()).collect();
    assert_eq!(
        kinds,
        vec![StepType::Thought, StepType::ToolCall, StepType::Thought]
    );
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    // 第二次推理能看到工具批次与工具结果
    let requests = fx.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].history.len(), 1);
    assert_eq!(requests[1].history.len(), 3);
    assert_eq!(requests[0].tools.len(), 8);
    assert_eq!(requests[0].handoff_candidates.len(), 4);
    assert!(requests[0]
        .handoff_candidates
        .iter()
        .all(|c| c.agent_id != CODER_ID));
}

#[tokio::test]
async fn test_tool_step_matches_tool_message() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![ToolCall::new(
            "call_ls",
            "list_directory",
            r#"{"path":"."}"#,
        )])
        .push_text("listed");
    let fx = fixture(provider);
    std::fs::write(fx.dir.path().join("a.txt"), "x").unwrap();
    let run = start_run(&fx.store, CODER_ID, "ls");

    fx.engine.execute_run(&run.id).await.unwrap();

    let steps = fx.store.list_run_steps(&run.id).unwrap();
    let tool_step = steps
        .iter()
        .find(|s| s.step_type() == StepType::ToolCall)
        .unwrap();
    assert_eq!(tool_step.name, "list_directory");
    assert_eq!(tool_step.payload.input_value(), json!({"path": "."}));

    let tool_msg = fx
        .store
        .list_run_messages(&run.id)
        .unwrap()
        .into_iter()
        .find(|m| m.role() == Role::Tool)
        .unwrap();
    assert_eq!(
        tool_step.payload.output_value(),
        json!({"output": tool_msg.text()})
    );
    assert!(tool_msg.text().contains("a.txt"));
}

#[tokio::test]
async fn test_structural_tool_error_is_fed_back() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![
            ToolCall::new("c1", "no_such_tool", "{}"),
            ToolCall::new("c2", "read_file", "not json"),
        ])
        .push_text("recovered");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "try tools");

    let text = fx.engine.execute_run(&run.id).await.unwrap();
    assert_eq!(text, "recovered");

    let tool_msgs: Vec<ChatMessage> = fx
        .store
        .list_run_messages(&run.id)
        .unwrap()
        .into_iter()
        .filter(|m| m.role() == Role::Tool)
        .collect();
    assert_eq!(tool_msgs.len(), 2);
    assert_eq!(tool_msgs[0].tool_call_id(), Some("c1"));
    assert_eq!(tool_msgs[1].tool_call_id(), Some("c2"));
    assert!(tool_msgs
        .iter()
        .all(|m| m.text().starts_with("Tool Execution Error:")));

    let failed: Vec<_> = fx
        .store
        .list_run_steps(&run.id)
        .unwrap()
        .into_iter()
        .filter(|s| s.step_type() == StepType::ToolCall)
        .collect();
    assert!(failed.iter().all(|s| s.status == StepStatus::Failed));
    // 非 JSON 参数原样记录
    assert_eq!(failed[1].payload.input_value(), json!("not json"));
    assert_eq!(
        fx.store.get_run(&run.id).unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_empty_handoff_target_is_final_answer() {
    let provider = ScriptedProvider::new();
    provider.push(Scripted::Respond(ChatResponse::with_handoff(
        "I can answer this myself",
        HandoffDecision::to("  ", "no one"),
    )));
    let fx = fixture(provider);
    let run = start_run(&fx.store, MANAGER_ID, "hello");

    let text = fx.engine.execute_run(&run.id).await.unwrap();
    assert_eq!(text, "I can answer this myself");
    assert!(fx.store.list_child_runs(&run.id).unwrap().is_empty());
    assert_eq!(
        fx.store.get_run(&run.id).unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_step_limit() {
    let provider = ScriptedProvider::new().with_responder(|_| {
        Scripted::Respond(ChatResponse::with_tool_calls(vec![ToolCall::new(
            "loop",
            "list_directory",
            "",
        )]))
    });
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "loop forever");

    let err = fx.engine.execute_run(&run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StepLimitExceeded(5)));
    assert_eq!(fx.provider.call_count(), 5);

    let finished = fx.store.get_run(&run.id).unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(
        finished.output.error.as_deref(),
        Some("max steps reached (5)")
    );
    assert!(fx.engine.registry().is_empty());
}

#[tokio::test]
async fn test_handoff_to_child_agent() {
    let provider = ScriptedProvider::new();
    provider
        .push_handoff(CODER_ID, "needs implementation")
        .push_text("implemented");
    let fx = fixture(provider);
    let root = start_run(&fx.store, MANAGER_ID, "build a feature");

    let text = fx.engine.execute_run(&root.id).await.unwrap();
    assert_eq!(text, "implemented");

    let children = fx.store.list_child_runs(&root.id).unwrap();
    assert_eq!(children.len(), 1);
    let child = &children[0];
    assert_eq!(child.agent_id, CODER_ID);
    assert_eq!(child.trace_id, root.trace_id);
    assert_eq!(child.parent_run_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(child.session_id, root.session_id);
    assert!(child.input.from_handoff);
    assert_eq!(child.input.reason.as_deref(), Some("needs implementation"));
    assert_eq!(child.status, RunStatus::Succeeded);

    let parent = fx.store.get_run(&root.id).unwrap();
    assert_eq!(parent.status, RunStatus::Succeeded);
    assert_eq!(parent.output.response, child.output.response);
    assert_eq!(parent.output.child_run_id.as_deref(), Some(child.id.as_str()));

    let handoff_step = fx
        .store
        .list_run_steps(&root.id)
        .unwrap()
        .into_iter()
        .find(|s| s.step_type() == StepType::Handoff)
        .unwrap();
    assert_eq!(handoff_step.child_run_id(), Some(child.id.as_str()));
    assert_eq!(handoff_step.payload.input_value()["parent_agent_id"], MANAGER_ID);
    assert_eq!(handoff_step.status, StepStatus::Completed);

    // 子 Agent 在同一会话中看到交接消息
    let requests = fx.provider.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].history.last().unwrap();
    assert_eq!(last.role(), Role::Assistant);
    assert_eq!(last.text(), format!("handing off to {CODER_ID}"));
    assert!(requests[1]
        .handoff_candidates
        .iter()
        .all(|c| c.agent_id != CODER_ID));
    assert!(fx.engine.registry().is_empty());
}

#[tokio::test]
async fn test_handoff_target_missing() {
    let provider = ScriptedProvider::new();
    provider.push_handoff("agent-ghost", "nobody home");
    let fx = fixture(provider);
    let root = start_run(&fx.store, MANAGER_ID, "delegate");

    let err = fx.engine.execute_run(&root.id).await.unwrap_err();
    assert!(matches!(err, EngineError::HandoffTargetMissing(ref id) if id == "agent-ghost"));

    assert_eq!(fx.store.get_run(&root.id).unwrap().status, RunStatus::Failed);
    assert!(fx.store.list_child_runs(&root.id).unwrap().is_empty());
    let handoff_step = fx
        .store
        .list_run_steps(&root.id)
        .unwrap()
        .into_iter()
        .find(|s| s.step_type() == StepType::Handoff)
        .unwrap();
    assert_eq!(handoff_step.status, StepStatus::Failed);
}

#[tokio::test]
async fn test_handoff_depth_is_bounded() {
    let provider = ScriptedProvider::new().with_responder(|_| {
        Scripted::Respond(ChatResponse::with_handoff(
            "again",
            HandoffDecision::to(REVIEWER_ID, "loop"),
        ))
    });
    let settings = EngineSettings {
        max_handoff_depth: 2,
        ..EngineSettings::default()
    };
    let fx = fixture_with(provider, settings);
    let root = start_run(&fx.store, MANAGER_ID, "ping pong");

    let err = fx.engine.execute_run(&root.id).await.unwrap_err();
    assert!(matches!(err, EngineError::HandoffDepthExceeded(2)));
    assert_eq!(fx.provider.call_count(), 3);

    let first = fx.store.list_child_runs(&root.id).unwrap();
    assert_eq!(first.len(), 1);
    let second = fx.store.list_child_runs(&first[0].id).unwrap();
    assert_eq!(second.len(), 1);
    assert!(fx.store.list_child_runs(&second[0].id).unwrap().is_empty());

    for id in [&root.id, &first[0].id, &second[0].id] {
        assert_eq!(fx.store.get_run(id).unwrap().status, RunStatus::Failed);
    }
}

#[tokio::test]
async fn test_cancel_running_run() {
    let provider = ScriptedProvider::new();
    provider.push_hang();
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "take forever");

    let engine = fx.engine.clone();
    let run_id = run.id.clone();
    let handle = tokio::spawn(async move { engine.execute_run(&run_id).await });

    for _ in 0..200 {
        if fx.engine.is_running(&run.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    fx.engine.cancel_run(&run.id).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));

    let finished = fx.store.get_run(&run.id).unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);
    let steps = fx.store.list_run_steps(&run.id).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(!fx.engine.is_running(&run.id));
}

#[tokio::test]
async fn test_cancel_unknown_run_is_noop() {
    let fx = fixture(ScriptedProvider::new());
    let run = start_run(&fx.store, CODER_ID, "never started");

    let err = fx.engine.cancel_run(&run.id).unwrap_err();
    assert!(matches!(err, EngineError::NotRunning(_)));
    assert!(fx.engine.cancel_run("nope").is_err());
    assert_eq!(fx.store.get_run(&run.id).unwrap().status, RunStatus::Running);
}

#[tokio::test]
async fn test_stream_ends_with_single_done() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![ToolCall::new("c1", "list_directory", "{}")])
        .push_text("all done here!");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "stream it");

    let (tx, mut rx) = fx.engine.stream_channel();
    let handle = fx.engine.execute_run_stream(&run.id, tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    handle.await.unwrap();

    let terminals: Vec<&RunStreamEvent> = events
        .iter()
        .filter(|e| matches!(e, RunStreamEvent::Done { .. } | RunStreamEvent::Error { .. }))
        .collect();
    assert_eq!(terminals.len(), 1);
    assert_eq!(
        events.last(),
        Some(&RunStreamEvent::Done {
            content: Some("all done here!".to_string())
        })
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RunStreamEvent::ToolCall { .. }))
            .count(),
        1
    );
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            RunStreamEvent::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "all done here!");

    assert_eq!(
        fx.store.get_run(&run.id).unwrap().status,
        RunStatus::Succeeded
    );
}

#[tokio::test]
async fn test_stream_provider_error() {
    let provider = ScriptedProvider::new();
    provider.push_fail("upstream exploded");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "fail please");

    let (tx, mut rx) = fx.engine.stream_channel();
    let handle = fx.engine.execute_run_stream(&run.id, tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    handle.await.unwrap();

    assert_eq!(events.len(), 1);
    match &events[0] {
        RunStreamEvent::Error { error } => assert!(error.contains("upstream exploded")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(fx.store.get_run(&run.id).unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_provider_error_fails_run() {
    let provider = ScriptedProvider::new();
    provider.push_fail("boom");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "x");

    let err = fx.engine.execute_run(&run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(_)));

    let finished = fx.store.get_run(&run.id).unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished.output.error.unwrap().contains("boom"));
    let steps = fx.store.list_run_steps(&run.id).unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].error_message.as_deref().unwrap().contains("boom"));
}

#[tokio::test]
async fn test_missing_entities_leave_no_trace() {
    let fx = fixture(ScriptedProvider::new());

    let err = fx.engine.execute_run("no-such-run").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "run", .. }));

    let run = start_run(&fx.store, "agent-ghost", "hi");
    let err = fx.engine.execute_run(&run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "agent", .. }));
    assert_eq!(fx.store.get_run(&run.id).unwrap().status, RunStatus::Running);
    assert!(fx.store.list_run_steps(&run.id).unwrap().is_empty());
    assert_eq!(fx.provider.call_count(), 0);
}

#[tokio::test]
async fn test_terminal_run_is_not_rerun() {
    let provider = ScriptedProvider::new();
    provider.push_text("first");
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "once");

    fx.engine.execute_run(&run.id).await.unwrap();
    let err = fx.engine.execute_run(&run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotRunning(_)));
    assert_eq!(fx.provider.call_count(), 1);
    assert_eq!(
        fx.store.get_run(&run.id).unwrap().output.response.as_deref(),
        Some("first")
    );
}

#[tokio::test]
async fn test_second_execute_of_live_run_is_rejected() {
    let provider = ScriptedProvider::new();
    provider.push_hang();
    let fx = fixture(provider);
    let run = start_run(&fx.store, CODER_ID, "busy");

    let first = spawn_execute(&fx.engine, &run.id);
    wait_for(|| {
        fx.engine.is_running(&run.id) && fx.store.list_run_steps(&run.id).unwrap().len() == 1
    })
    .await;

    let err = fx.engine.execute_run(&run.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(ref id) if id == &run.id));
    // 被拒绝的执行不写步骤，也不影响原执行的取消
    assert_eq!(fx.store.list_run_steps(&run.id).unwrap().len(), 1);
    assert!(fx.engine.is_running(&run.id));

    fx.engine.cancel_run(&run.id).unwrap();
    assert!(matches!(join(first).await, Err(EngineError::Cancelled)));
    assert_eq!(fx.store.get_run(&run.id).unwrap().status, RunStatus::Cancelled);
    assert_eq!(fx.provider.call_count(), 1);
    assert!(fx.engine.registry().is_empty());
}

/// 调用后长时间不返回的工具族
struct SleepyFamily;

#[async_trait]
impl ToolFamily for SleepyFamily {
    fn family(&self) -> &'static str {
        "sleepy"
    }

    fn matches(&self, server_name: &str) -> bool {
        server_name == "sleepy-server"
    }

    fn specs(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "nap",
            description: "sleeps for a while",
            parameters: json!({"type": "object", "properties": {}}),
        }]
    }

    async fn call(&self, _tool: &str, _args: &Map<String, Value>) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("rested".to_string())
    }
}

#[tokio::test]
async fn test_cancel_during_tool_execution() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_tool_server(&ToolServer::new("srv-sleepy", "sleepy-server"))
        .unwrap();
    store
        .create_tool(&ToolDefinition::new("srv-sleepy", "nap", "sleeps", json!({})))
        .unwrap();
    store
        .create_agent(
            &AgentProfile::new("Sleeper", "m", "p")
                .with_id("agent-sleeper")
                .with_tool_servers(&["srv-sleepy"]),
        )
        .unwrap();

    let mut families = FamilyRegistry::new();
    families.register(SleepyFamily);
    let provider = ScriptedProvider::new();
    provider.push_tool_calls(vec![
        ToolCall::new("c1", "nap", "{}"),
        ToolCall::new("c2", "nap", "{}"),
    ]);
    let engine = Arc::new(RunEngine::new(
        store.clone(),
        Arc::new(provider),
        Arc::new(ToolExecutor::new(families, 60)),
        EngineSettings::default(),
    ));
    let run = start_run(&store, "agent-sleeper", "take a nap");

    let handle = spawn_execute(&engine, &run.id);
    wait_for(|| {
        store
            .list_run_steps(&run.id)
            .unwrap()
            .iter()
            .any(|s| s.step_type() == StepType::ToolCall)
    })
    .await;
    engine.cancel_run(&run.id).unwrap();

    assert!(matches!(join(handle).await, Err(EngineError::Cancelled)));
    assert_eq!(store.get_run(&run.id).unwrap().status, RunStatus::Cancelled);

    // 执行中的调用与尚未执行的调用都有失败步骤和对应的 tool 消息
    let tool_steps: Vec<_> = store
        .list_run_steps(&run.id)
        .unwrap()
        .into_iter()
        .filter(|s| s.step_type() == StepType::ToolCall)
        .collect();
    assert_eq!(tool_steps.len(), 2);
    assert!(tool_steps.iter().all(|s| s.status == StepStatus::Failed));

    let tool_msgs: Vec<ChatMessage> = store
        .list_run_messages(&run.id)
        .unwrap()
        .into_iter()
        .filter(|m| m.role() == Role::Tool)
        .collect();
    let ids: Vec<Option<&str>> = tool_msgs.iter().map(ChatMessage::tool_call_id).collect();
    assert_eq!(ids, vec![Some("c1"), Some("c2")]);
    assert!(tool_msgs
        .iter()
        .all(|m| m.text() == "Tool Execution Error: run cancelled"));
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn test_cancelling_parent_cancels_child() {
    let provider = ScriptedProvider::new();
    provider.push_handoff(CODER_ID, "implement").push_hang();
    let fx = fixture(provider);
    let root = start_run(&fx.store, MANAGER_ID, "build it");

    let handle = spawn_execute(&fx.engine, &root.id);
    wait_for(|| {
        fx.store
            .list_child_runs(&root.id)
            .unwrap()
            .first()
            .is_some_and(|c| fx.engine.is_running(&c.id))
    })
    .await;
    fx.engine.cancel_run(&root.id).unwrap();

    assert!(matches!(join(handle).await, Err(EngineError::Cancelled)));
    let child = &fx.store.list_child_runs(&root.id).unwrap()[0];
    assert_eq!(fx.store.get_run(&child.id).unwrap().status, RunStatus::Cancelled);
    assert_eq!(fx.store.get_run(&root.id).unwrap().status, RunStatus::Cancelled);
    assert!(fx.engine.registry().is_empty());
}

#[tokio::test]
async fn test_child_cancelled_alone_fails_parent() {
    let provider = ScriptedProvider::new();
    provider.push_handoff(CODER_ID, "implement").push_hang();
    let fx = fixture(provider);
    let root = start_run(&fx.store, MANAGER_ID, "build it");

    let handle = spawn_execute(&fx.engine, &root.id);
    wait_for(|| {
        fx.store
            .list_child_runs(&root.id)
            .unwrap()
            .first()
            .is_some_and(|c| fx.engine.is_running(&c.id))
    })
    .await;
    let child_id = fx.store.list_child_runs(&root.id).unwrap()[0].id.clone();
    fx.engine.cancel_run(&child_id).unwrap();

    let err = join(handle).await.unwrap_err();
    assert!(matches!(err, EngineError::ChildCancelled(ref id) if id == &child_id));
    assert_eq!(fx.store.get_run(&child_id).unwrap().status, RunStatus::Cancelled);

    let parent = fx.store.get_run(&root.id).unwrap();
    assert_eq!(parent.status, RunStatus::Failed);
    assert!(parent.output.error.unwrap().contains(&child_id));
    let handoff_step = fx
        .store
        .list_run_steps(&root.id)
        .unwrap()
        .into_iter()
        .find(|s| s.step_type() == StepType::Handoff)
        .unwrap();
    assert_eq!(handoff_step.status, StepStatus::Failed);
    assert_eq!(handoff_step.child_run_id(), Some(child_id.as_str()));
}

#[tokio::test]
async fn test_stream_handoff_then_child_answer() {
    let provider = ScriptedProvider::new();
    provider
        .push_handoff(CODER_ID, "needs code")
        .push_text("written by coder");
    let fx = fixture(provider);
    let root = start_run(&fx.store, MANAGER_ID, "stream a handoff");

    let events = collect_stream(&fx, &root.id).await;

    let handoffs: Vec<&RunStreamEvent> = events
        .iter()
        .filter(|e| matches!(e, RunStreamEvent::Handoff { .. }))
        .collect();
    assert!(!handoffs.is_empty());
    match handoffs[0] {
        RunStreamEvent::Handoff { handoff } => assert_eq!(handoff.target_agent_id, CODER_ID),
        other => panic!("unexpected event: {other:?}"),
    }
    let terminals = events
        .iter()
        .filter(|e| matches!(e, RunStreamEvent::Done { .. } | RunStreamEvent::Error { .. }))
        .count();
    assert_eq!(terminals, 1);
    assert_eq!(
        events.last(),
        Some(&RunStreamEvent::Done {
            content: Some("written by coder".to_string())
        })
    );

    let children = fx.store.list_child_runs(&root.id).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, RunStatus::Succeeded);
    assert_eq!(fx.store.get_run(&root.id).unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_git_status_in_fresh_repository() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![ToolCall::new("call_git", "git_status", "{}")])
        .push_text("working tree has one untracked file");
    let fx = fixture(provider);
    let init = Command::new("git").arg("init").current_dir(fx.dir.path()).output();
    if !init.is_ok_and(|o| o.status.success()) {
        eprintln!("git unavailable; skipping");
        return;
    }
    std::fs::write(fx.dir.path().join("untracked.txt"), "x").unwrap();
    let run = start_run(&fx.store, CODER_ID, "check git status");

    let text = fx.engine.execute_run(&run.id).await.unwrap();
    assert_eq!(text, "working tree has one untracked file");

    let messages = fx.store.list_session_messages(&run.session_id).unwrap();
    let roles: Vec<Role> = messages.iter().map(ChatMessage::role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(messages[1].tool_calls()[0].name, "git_status");
    assert_eq!(messages[2].tool_call_id(), Some("call_git"));
    assert!(messages[2].text().contains("untracked.txt"));
    assert!(!messages[2].text().starts_with("Tool Execution Error"));
    assert_eq!(fx.store.get_run(&run.id).unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_unbound_tool_is_not_found() {
    let provider = ScriptedProvider::new();
    provider
        .push_tool_calls(vec![ToolCall::new(
            "c1",
            "write_file",
            r#"{"path":"plan.md","content":"x"}"#,
        )])
        .push_text("cannot write");
    let fx = fixture(provider);
    // Manager 没有绑定任何工具服务器
    let run = start_run(&fx.store, MANAGER_ID, "write a plan");

    let text = fx.engine.execute_run(&run.id).await.unwrap();
    assert_eq!(text, "cannot write");
    assert!(!fx.dir.path().join("plan.md").exists());

    let tool_msg = fx
        .store
        .list_run_messages(&run.id)
        .unwrap()
        .into_iter()
        .find(|m| m.role() == Role::Tool)
        .unwrap();
    assert_eq!(tool_msg.text(), "Tool Execution Error: tool not found: write_file");
    assert!(fx.provider.requests()[0].tools.is_empty());
}
