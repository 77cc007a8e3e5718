//! Baton 命令行入口
//!
//! 用法:
//!   baton run --agent <name|id> [--blocking] [--config <path>] "<message>"
//!
//! 默认以流式方式执行，事件逐行输出 JSON 到 stdout；结束后打印执行链路树。
//! Ctrl-C 取消当前 Run。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use baton::bootstrap::seed_defaults;
use baton::config::load_config;
use baton::engine::to_json_line;
use baton::llm::OpenAiProvider;
use baton::store::{open_store, AgentProfile, ChatMessage, ChatSession, Run, TraceStore};
use baton::tools::ToolExecutor;
use baton::{observability, EngineSettings, RunEngine, TraceTreeBuilder};
use tracing::{info, warn};

const USAGE: &str =
    "usage: baton run --agent <name|id> [--blocking] [--config <path>] \"<message>\"";

struct RunArgs {
    agent: String,
    message: String,
    blocking: bool,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<RunArgs> {
    match args.next().as_deref() {
        Some("run") => {}
        _ => bail!(USAGE),
    }

    let mut agent = None;
    let mut config = None;
    let mut blocking = false;
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--agent" | "-a" => agent = args.next(),
            "--config" | "-c" => config = args.next().map(PathBuf::from),
            "--blocking" => blocking = true,
            _ => words.push(arg),
        }
    }

    let agent = agent.ok_or_else(|| anyhow!(USAGE))?;
    let message = words.join(" ");
    if message.trim().is_empty() {
        bail!(USAGE);
    }
    Ok(RunArgs {
        agent,
        message,
        blocking,
        config,
    })
}

/// 按 id 精确匹配，或按名称（忽略大小写）匹配
fn resolve_agent(store: &dyn TraceStore, key: &str) -> anyhow::Result<AgentProfile> {
    let agents = store.list_agents()?;
    agents
        .iter()
        .find(|a| a.id == key)
        .or_else(|| agents.iter().find(|a| a.name.eq_ignore_ascii_case(key)))
        .cloned()
        .ok_or_else(|| anyhow!("agent not found: {key}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    observability::init();

    let store = open_store(&cfg.store).context("Failed to open store")?;
    let executor = Arc::new(ToolExecutor::from_config(&cfg.tools));
    seed_defaults(store.as_ref(), &executor).context("Failed to seed defaults")?;

    let settings = EngineSettings::from(&cfg.engine);
    let provider = OpenAiProvider::from_config(&cfg.llm, settings.stream_buffer);
    let engine = Arc::new(RunEngine::new(
        Arc::clone(&store),
        Arc::new(provider),
        executor,
        settings,
    ));

    let agent = resolve_agent(store.as_ref(), &args.agent)?;
    let session = ChatSession::new("cli", &agent.id).with_title(&args.message);
    store.create_session(&session)?;
    store.create_chat_message(&ChatMessage::user(&session.id, &args.message))?;
    let run = Run::new_root(&session, &args.message);
    store.create_run(&run)?;
    info!(run_id = %run.id, agent = %agent.name, "run created");

    let ctrl_c = {
        let engine = Arc::clone(&engine);
        let run_id = run.id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %run_id, "interrupt received, cancelling");
                if let Err(e) = engine.cancel_run(&run_id) {
                    warn!(error = %e, "cancel failed");
                }
            }
        })
    };

    if args.blocking {
        match engine.execute_run(&run.id).await {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("run failed: {e}"),
        }
    } else {
        let (tx, mut rx) = engine.stream_channel();
        let handle = engine.execute_run_stream(&run.id, tx);
        while let Some(event) = rx.recv().await {
            println!("{}", to_json_line(&event));
        }
        handle.await.context("Run task panicked")?;
    }
    ctrl_c.abort();

    let tree = TraceTreeBuilder::new(store.as_ref())
        .build_run_tree(&run.id)
        .context("Failed to build trace tree")?;
    println!("{}", serde_json::to_string_pretty(&tree)?);

    Ok(())
}
