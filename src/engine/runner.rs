//! RunEngine：ReAct 主循环、工具批次执行、Agent 交接递归与取消
//!
//! 每次迭代：读取会话历史与 Agent 工具 → 推理（记录 thought 步骤）→ 三选一：
//! - 交接：写入交接消息与 handoff 步骤，创建子 Run 并在同一任务中递归执行，父 Run 以子 Run 结果结束
//! - 工具调用：写入工具批次消息，按顺序逐个执行并写入 tool_call 步骤与 tool 消息，进入下一轮
//! - 最终回复：写入可见的 assistant 消息，Run 标记 succeeded
//!
//! 超过 max_steps 记为 failed；取消记为 cancelled；终态只写一次。

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::events::{emit, EventSink, RunStreamEvent};
use super::prompt::system_prompt;
use crate::config::EngineSection;
use crate::core::{CancelRegistry, EngineError};
use crate::llm::{
    parse_content_and_handoff, ChatRequest, ChatResponse, HandoffCandidate, InferenceProvider,
    ProviderError, StreamEvent,
};
use crate::store::{
    AgentProfile, ChatMessage, Decision, HandoffDecision, HandoffInput, HandoffOutput, Run,
    RunOutput, RunStatus, RunStep, StepCompletion, StepOutput, StepStatus, ThoughtInput,
    ThoughtOutput, TokenUsage, ToolCall, ToolCallOutput, TraceStore,
};
use crate::tools::ToolExecutor;

/// thought 步骤输出里保留的文本长度
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// 单个 Run 的推理次数上限
    pub max_steps: usize,
    /// 交接链最大深度（根 Run 深度为 0）
    pub max_handoff_depth: usize,
    pub stream_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_handoff_depth: 8,
            stream_buffer: 10,
        }
    }
}

impl From<&EngineSection> for EngineSettings {
    fn from(s: &EngineSection) -> Self {
        Self {
            max_steps: s.max_steps.max(1),
            max_handoff_depth: s.max_handoff_depth,
            stream_buffer: s.stream_buffer.max(1),
        }
    }
}

/// 一次 Run 的成功结果
struct RunOutcome {
    text: String,
    output: RunOutput,
}

/// 单个 Run 执行期间的上下文
struct Turn<'a> {
    run: &'a Run,
    agent: &'a AgentProfile,
    depth: usize,
    token: &'a CancellationToken,
    sink: Option<&'a EventSink>,
    usage: TokenUsage,
}

pub struct RunEngine {
    store: Arc<dyn TraceStore>,
    provider: Arc<dyn InferenceProvider>,
    executor: Arc<ToolExecutor>,
    registry: Arc<CancelRegistry>,
    settings: EngineSettings,
    /// 所有 Run 令牌的根
    root: CancellationToken,
}

impl RunEngine {
    pub fn new(
        store: Arc<dyn TraceStore>,
        provider: Arc<dyn InferenceProvider>,
        executor: Arc<ToolExecutor>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            provider,
            executor,
            registry: Arc::new(CancelRegistry::new()),
            settings,
            root: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// 阻塞执行，返回最终文本
    pub async fn execute_run(&self, run_id: &str) -> Result<String, EngineError> {
        self.drive(run_id.to_string(), 0, &self.root, None).await
    }

    /// 容量为 stream_buffer 的事件通道
    pub fn stream_channel(&self) -> (EventSink, mpsc::Receiver<RunStreamEvent>) {
        mpsc::channel(self.settings.stream_buffer)
    }

    /// 后台执行并把事件推送到 sink；以一个 done 或 error 事件结束
    pub fn execute_run_stream(self: &Arc<Self>, run_id: &str, sink: EventSink) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let result = engine
                .drive(run_id.clone(), 0, &engine.root, Some(&sink))
                .await;
            let terminal = match result {
                Ok(text) => RunStreamEvent::Done {
                    content: Some(text),
                },
                Err(e) => RunStreamEvent::error(&e),
            };
            emit(Some(&sink), terminal).await;
            debug!(run_id = %run_id, "stream closed");
        })
    }

    /// 请求取消；Run 不在注册表中返回 NotRunning 且不做任何写入
    pub fn cancel_run(&self, run_id: &str) -> Result<(), EngineError> {
        self.registry.cancel(run_id)
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.registry.is_running(run_id)
    }

    /// 加载 → 登记 → 主循环 → 写终态；交接子 Run 递归进入这里
    fn drive<'a>(
        &'a self,
        run_id: String,
        depth: usize,
        parent: &'a CancellationToken,
        sink: Option<&'a EventSink>,
    ) -> BoxFuture<'a, Result<String, EngineError>> {
        async move {
            let run = self.store.get_run(&run_id)?;
            let _session = self.store.get_session(&run.session_id)?;
            let agent = self.store.get_agent(&run.agent_id)?;
            if run.status.is_terminal() {
                return Err(EngineError::NotRunning(run.id));
            }

            // 同一 Run 已在执行时拒绝，不写任何状态
            let registration = self.registry.register(&run.id, parent.child_token())?;
            let span = info_span!(
                "run",
                run_id = %run.id,
                agent_id = %agent.id,
                trace_id = %run.trace_id,
                depth
            );

            let mut turn = Turn {
                run: &run,
                agent: &agent,
                depth,
                token: registration.token(),
                sink,
                usage: TokenUsage::default(),
            };
            let outcome = self.run_loop(&mut turn).instrument(span).await;
            let usage = turn.usage;
            self.settle(&run, &outcome, usage);
            drop(registration);

            outcome.map(|o| o.text)
        }
        .boxed()
    }

    async fn run_loop(&self, turn: &mut Turn<'_>) -> Result<RunOutcome, EngineError> {
        info!(agent = %turn.agent.name, "run started");

        for iteration in 1..=self.settings.max_steps {
            if turn.token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let history = self.store.list_session_messages(&turn.run.session_id)?;
            let tools = self.store.list_tools_for_agent(&turn.agent.id)?;
            let candidates = self.handoff_candidates(&turn.agent.id)?;

            let step = RunStep::thought(
                &turn.run.id,
                ThoughtInput {
                    iteration,
                    history_len: history.len(),
                    tool_count: tools.len(),
                    candidate_count: candidates.len(),
                    streaming: turn.sink.is_some(),
                },
            );
            self.store.create_run_step(&step)?;

            let request = ChatRequest {
                model: Some(turn.agent.model.clone()),
                temperature: Some(turn.agent.temperature),
                system_prompt: system_prompt(&turn.agent.system_prompt, &tools),
                user_prompt: None,
                history,
                tools,
                handoff_candidates: candidates,
                force_handoff: true,
            };

            debug!(step = iteration, "thinking");
            let started = Instant::now();
            let response = match self.infer(&request, turn).await {
                Ok(response) => response,
                Err(e) => {
                    self.close_step(
                        &step,
                        StepOutput::Thought(ThoughtOutput {
                            decision: None,
                            text_preview: String::new(),
                            usage: None,
                        }),
                        started,
                        Some(e.to_string()),
                    )?;
                    return Err(e);
                }
            };
            turn.usage.add(&response.usage);

            let handoff = response.handoff_target().cloned();
            let decision = if handoff.is_some() {
                Decision::Handoff
            } else if !response.tool_calls.is_empty() {
                Decision::ToolCalls
            } else {
                Decision::Final
            };
            self.close_step(
                &step,
                StepOutput::Thought(ThoughtOutput {
                    decision: Some(decision),
                    text_preview: response.content.chars().take(PREVIEW_CHARS).collect(),
                    usage: (!response.usage.is_empty()).then_some(response.usage),
                }),
                started,
                None,
            )?;

            if let Some(handoff) = handoff {
                info!(step = iteration, target = %handoff.target_agent_id, "handoff");
                return self.delegate(turn, &response.content, handoff).await;
            }

            if !response.tool_calls.is_empty() {
                info!(step = iteration, calls = response.tool_calls.len(), "tool calls");
                self.run_tool_batch(turn, &response).await?;
                continue;
            }

            info!(step = iteration, "final response");
            self.store
                .create_chat_message(&ChatMessage::assistant_text(turn.run, &response.content))?;
            return Ok(RunOutcome {
                output: RunOutput::response(&response.content),
                text: response.content,
            });
        }

        warn!(max_steps = self.settings.max_steps, "step ceiling reached");
        Err(EngineError::StepLimitExceeded(self.settings.max_steps))
    }

    /// 推理调用与取消令牌竞争；流式模式下转发 content 增量
    async fn infer(&self, request: &ChatRequest, turn: &Turn<'_>) -> Result<ChatResponse, EngineError> {
        let call = async {
            match turn.sink {
                None => self
                    .provider
                    .complete(request)
                    .await
                    .map_err(EngineError::from),
                Some(sink) => self.infer_streaming(request, sink).await,
            }
        };
        tokio::select! {
            biased;
            _ = turn.token.cancelled() => Err(EngineError::Cancelled),
            result = call => result,
        }
    }

    async fn infer_streaming(
        &self,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> Result<ChatResponse, EngineError> {
        let mut stream = self.provider.complete_stream(request).await?;
        let mut buffered = String::new();

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Content { content } => {
                    buffered.push_str(&content);
                    emit(Some(sink), StreamEvent::Content { content }).await;
                }
                StreamEvent::ToolCall { tool_calls } => {
                    let text = parse_content_and_handoff(&buffered).text;
                    return Ok(ChatResponse {
                        content: text,
                        tool_calls,
                        ..ChatResponse::default()
                    });
                }
                StreamEvent::Handoff { handoff } => {
                    let text = parse_content_and_handoff(&buffered).text;
                    return Ok(ChatResponse::with_handoff(text, handoff));
                }
                StreamEvent::Done { content } => {
                    let text =
                        content.unwrap_or_else(|| parse_content_and_handoff(&buffered).text);
                    return Ok(ChatResponse::text(text));
                }
                StreamEvent::Error { error } => {
                    return Err(ProviderError::Transport(error).into());
                }
            }
        }

        // provider 未给出终止事件：按正常结束处理
        let parsed = parse_content_and_handoff(&buffered);
        Ok(ChatResponse {
            content: parsed.text,
            handoff: parsed.handoff,
            ..ChatResponse::default()
        })
    }

    /// 顺序执行一个工具批次；每个调用都有 tool_call 步骤与对应 id 的 tool 消息
    async fn run_tool_batch(&self, turn: &Turn<'_>, response: &ChatResponse) -> Result<(), EngineError> {
        self.store.create_chat_message(&ChatMessage::assistant_tool_calls(
            turn.run,
            &response.content,
            response.tool_calls.clone(),
        ))?;
        emit(
            turn.sink,
            StreamEvent::ToolCall {
                tool_calls: response.tool_calls.clone(),
            },
        )
        .await;

        for (idx, call) in response.tool_calls.iter().enumerate() {
            if turn.token.is_cancelled() {
                self.abandon_calls(turn.run, &response.tool_calls[idx..])?;
                return Err(EngineError::Cancelled);
            }

            let step = RunStep::tool_call(&turn.run.id, &call.name, trace_args(&call.arguments));
            self.store.create_run_step(&step)?;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = turn.token.cancelled() => None,
                r = self.invoke_tool(turn.agent, call) => Some(r),
            };

            let Some(result) = result else {
                self.record_tool_result(turn.run, &step, call, started, Err(EngineError::Cancelled))?;
                self.abandon_calls(turn.run, &response.tool_calls[idx + 1..])?;
                return Err(EngineError::Cancelled);
            };
            self.record_tool_result(turn.run, &step, call, started, result)?;
        }
        Ok(())
    }

    async fn invoke_tool(&self, agent: &AgentProfile, call: &ToolCall) -> Result<String, EngineError> {
        let server = self
            .store
            .find_tool_server(&agent.id, &call.name)?
            .ok_or_else(|| EngineError::not_found("tool", &call.name))?;
        debug!(tool = %call.name, server = %server.name, "executing tool");
        Ok(self
            .executor
            .execute(&server, &call.name, &call.arguments)
            .await?)
    }

    /// 关闭 tool_call 步骤并写入 tool 消息；结构性错误以 "Tool Execution Error" 文本回给模型
    fn record_tool_result(
        &self,
        run: &Run,
        step: &RunStep,
        call: &ToolCall,
        started: Instant,
        result: Result<String, EngineError>,
    ) -> Result<(), EngineError> {
        let (output, err) = match result {
            Ok(output) => (output, None),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool call failed");
                (format!("Tool Execution Error: {e}"), Some(e.to_string()))
            }
        };
        self.close_step(
            step,
            StepOutput::ToolCall(ToolCallOutput {
                output: output.clone(),
            }),
            started,
            err,
        )?;
        self.store
            .create_chat_message(&ChatMessage::tool_output(run, &call.id, output))?;
        Ok(())
    }

    /// 取消后尚未执行的调用：记为失败步骤并补齐 tool 消息
    fn abandon_calls(&self, run: &Run, calls: &[ToolCall]) -> Result<(), EngineError> {
        for call in calls {
            let step = RunStep::tool_call(&run.id, &call.name, trace_args(&call.arguments));
            self.store.create_run_step(&step)?;
            self.record_tool_result(run, &step, call, Instant::now(), Err(EngineError::Cancelled))?;
        }
        Ok(())
    }

    /// 交接：记录决策，执行子 Run，父 Run 以子 Run 的结果结束
    async fn delegate(
        &self,
        turn: &Turn<'_>,
        text: &str,
        handoff: HandoffDecision,
    ) -> Result<RunOutcome, EngineError> {
        self.store.create_chat_message(&ChatMessage::assistant_handoff(
            turn.run,
            text,
            handoff.clone(),
        ))?;
        emit(
            turn.sink,
            StreamEvent::Handoff {
                handoff: handoff.clone(),
            },
        )
        .await;

        let step = RunStep::handoff(
            &turn.run.id,
            HandoffInput {
                target_agent_id: handoff.target_agent_id.clone(),
                reason: handoff.reason.clone(),
                preferred_server: handoff.preferred_server.clone(),
                parent_agent_id: turn.agent.id.clone(),
                parent_agent_name: turn.agent.name.clone(),
            },
        );
        self.store.create_run_step(&step)?;
        let started = Instant::now();

        let (child_run_id, result) = self.spawn_child(turn, &handoff).await;
        let result = match result {
            Err(EngineError::Cancelled) if !turn.token.is_cancelled() => Err(
                EngineError::ChildCancelled(child_run_id.clone().unwrap_or_default()),
            ),
            other => other,
        };

        self.close_step(
            &step,
            StepOutput::Handoff(HandoffOutput {
                child_run_id: child_run_id.clone(),
                child_agent_id: handoff.target_agent_id.clone(),
                response: result.as_ref().map(String::clone).unwrap_or_default(),
            }),
            started,
            result.as_ref().err().map(ToString::to_string),
        )?;

        let text = result?;
        Ok(RunOutcome {
            output: RunOutput {
                response: Some(text.clone()),
                child_run_id,
                error: None,
            },
            text,
        })
    }

    /// 创建并递归执行子 Run；返回子 Run id（未创建时为 None）与其结果
    async fn spawn_child(
        &self,
        turn: &Turn<'_>,
        handoff: &HandoffDecision,
    ) -> (Option<String>, Result<String, EngineError>) {
        if turn.depth >= self.settings.max_handoff_depth {
            warn!(depth = turn.depth, "handoff chain too deep");
            return (
                None,
                Err(EngineError::HandoffDepthExceeded(self.settings.max_handoff_depth)),
            );
        }
        let target = match self.store.get_agent(&handoff.target_agent_id) {
            Ok(agent) => agent,
            Err(e) if e.is_not_found() => {
                return (
                    None,
                    Err(EngineError::HandoffTargetMissing(handoff.target_agent_id.clone())),
                )
            }
            Err(e) => return (None, Err(e.into())),
        };

        let child = Run::child_of(turn.run, &target.id, &handoff.reason);
        if let Err(e) = self.store.create_run(&child) {
            return (None, Err(e.into()));
        }
        info!(child_run_id = %child.id, child_agent = %target.name, "child run created");

        let result = self
            .drive(child.id.clone(), turn.depth + 1, turn.token, turn.sink)
            .await;
        (Some(child.id), result)
    }

    /// 除当前 Agent 外的所有 Agent
    fn handoff_candidates(&self, current_agent_id: &str) -> Result<Vec<HandoffCandidate>, EngineError> {
        Ok(self
            .store
            .list_agents()?
            .into_iter()
            .filter(|a| a.id != current_agent_id)
            .map(|a| HandoffCandidate {
                agent_id: a.id,
                name: a.name,
                description: a.description,
            })
            .collect())
    }

    fn close_step(
        &self,
        step: &RunStep,
        output: StepOutput,
        started: Instant,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let status = if error.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        self.store.finish_run_step(
            &step.id,
            StepCompletion {
                output,
                status,
                latency_ms: started.elapsed().as_millis() as u64,
                error,
            },
        )?;
        Ok(())
    }

    /// 写终态（仅当 Run 仍为 running）；写入失败只记录日志
    fn settle(&self, run: &Run, outcome: &Result<RunOutcome, EngineError>, usage: TokenUsage) {
        let (status, output) = match outcome {
            Ok(o) => (RunStatus::Succeeded, o.output.clone()),
            Err(e) => (e.run_status(), RunOutput::error(e.to_string())),
        };
        match self.store.finish_run(&run.id, status, output, usage) {
            Ok(true) => match outcome {
                Ok(_) => info!(run_id = %run.id, status = status.as_str(), "run finished"),
                Err(e) => warn!(run_id = %run.id, status = status.as_str(), error = %e, "run finished"),
            },
            Ok(false) => warn!(run_id = %run.id, "run already terminal; status left unchanged"),
            Err(e) => error!(run_id = %run.id, error = %e, "failed to write run status"),
        }
    }
}

/// 记录在 tool_call 步骤中的参数：空串为 {}，非 JSON 原样保存为字符串
fn trace_args(arguments: &str) -> Value {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(arguments.to_string()))
}
