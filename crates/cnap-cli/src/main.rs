//! CNAP CLI - run agent tasks in a single local process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cnap_controller::{Config, Coordinator, FileContentStore, InMemoryRepository};
use cnap_core::{ChatMessage, ChatRole, TaskId, TaskStatus};
use cnap_runner::{
    AgentInfo, InvokeError, InvokeRequest, ModelInvoker, ProcessBackend, RunnerConfig,
    RunnerRegistry, API_KEY_ENV,
};

/// CNAP CLI - local task runner
#[derive(Parser)]
#[command(name = "cnap")]
#[command(about = "Run CNAP agent tasks locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an agent and task, dispatch it, and print the transcript
    Run {
        /// Model identifier
        #[arg(short, long)]
        model: String,

        /// System prompt for the agent
        #[arg(short, long, default_value = "")]
        system: String,

        /// Agent name
        #[arg(short, long, default_value = "cli")]
        agent: String,

        /// Task ID (generated when omitted)
        #[arg(short, long)]
        task: Option<String>,

        /// Initial prompt
        #[arg(short, long)]
        prompt: String,

        /// Extra conversation messages, as role=content
        #[arg(long = "message", value_parser = parse_message)]
        messages: Vec<(ChatRole, String)>,
    },

    /// One-shot model call through a backend-less runner
    Ask {
        /// Model identifier
        model: String,

        /// Prompt text
        prompt: String,
    },

    /// Drive a process backend: start, send messages, poll, stop
    Exec {
        /// Executable to start
        #[arg(short, long)]
        image: String,

        /// Argument passed to the executable (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Environment variable, as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Working directory
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// User message to send (repeatable)
        #[arg(long = "send")]
        send: Vec<String>,

        /// How long to wait for the process to exit before stopping it (ms)
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },
}

fn parse_message(s: &str) -> Result<(ChatRole, String), String> {
    let (role, content) = s
        .split_once('=')
        .ok_or_else(|| format!("expected role=content, got '{s}'"))?;
    let role = role.trim().parse::<ChatRole>().map_err(|e| e.to_string())?;
    Ok((role, content.to_string()))
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Stand-in invoker for commands that never call a model.
struct NoModelInvoker;

#[async_trait]
impl ModelInvoker for NoModelInvoker {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> Result<String, InvokeError> {
        Err(InvokeError::MissingCredential(API_KEY_ENV))
    }
}

/// Token canceled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cnap_controller::init_tracing().map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run {
            model,
            system,
            agent,
            task,
            prompt,
            messages,
        } => {
            run(&config, model, system, agent, task, prompt, messages).await?;
        }
        Commands::Ask { model, prompt } => {
            ask(&config, model, prompt).await?;
        }
        Commands::Exec {
            image,
            args,
            env,
            workdir,
            send,
            wait_ms,
        } => {
            let mut runner_config = RunnerConfig::new(image);
            runner_config.args = args;
            runner_config.env = env.into_iter().collect();
            runner_config.workdir = workdir;
            exec(runner_config, send, Duration::from_millis(wait_ms)).await?;
        }
    }

    Ok(())
}

async fn run(
    config: &Config,
    model: String,
    system: String,
    agent: String,
    task: Option<String>,
    prompt: String,
    messages: Vec<(ChatRole, String)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let invoker = config.build_invoker()?;
    let coordinator = Coordinator::new(
        InMemoryRepository::new(),
        Arc::new(FileContentStore::new(&config.data_dir)),
        RunnerRegistry::new(Arc::new(invoker)),
    );

    let task_id = task.unwrap_or_else(|| TaskId::generate().into_inner());
    coordinator
        .create_agent(&agent, "created by cnap run", &model, &system)
        .await?;
    coordinator
        .create_task(&agent, &task_id, Some(prompt.clone()))
        .await?;
    for (role, content) in &messages {
        coordinator.add_message(&task_id, *role, content).await?;
    }

    let dispatch = coordinator.send_message(&task_id).await?;
    let cancel = ctrl_c_token();
    let outcome = tokio::select! {
        outcome = dispatch.wait() => outcome,
        _ = cancel.cancelled() => {
            coordinator
                .update_task_status(&task_id, TaskStatus::Canceled)
                .await?;
            return Err("interrupted".into());
        }
    };

    let task = coordinator.get_task(&task_id).await?;
    println!("Task {} ({})", task.task_id, task.status);
    println!("{}", "-".repeat(60));
    println!("[user] {prompt}");
    for message in coordinator.list_messages(&task_id).await? {
        println!("[{}] {}", message.role, message.content);
    }

    outcome?;
    Ok(())
}

async fn ask(config: &Config, model: String, prompt: String) -> Result<(), Box<dyn std::error::Error>> {
    let invoker = config.build_invoker()?;
    let registry = RunnerRegistry::new(Arc::new(invoker));
    let task_id = TaskId::generate();
    let runner = registry
        .create_runner(task_id.clone(), AgentInfo::new("cli", model.clone()), None)
        .await?;

    let cancel = ctrl_c_token();
    let result = runner
        .invoke(InvokeRequest::new(model, vec![ChatMessage::user(prompt)]), &cancel)
        .await?;
    info!(task_id = %task_id, status = %runner.status(), "Ask finished");

    println!("{}", result.output);
    Ok(())
}

async fn exec(
    config: RunnerConfig,
    send: Vec<String>,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = RunnerRegistry::new(Arc::new(NoModelInvoker));
    let cancel = ctrl_c_token();
    let task_id = TaskId::generate();

    let runner = registry
        .create_runner_with_backend(
            task_id.clone(),
            AgentInfo::new("cli", ""),
            Box::new(ProcessBackend::new()),
            &config,
            None,
            &cancel,
        )
        .await?;
    println!("Runner {} started ({})", task_id, runner.status());

    for text in send {
        runner.send_message(&ChatMessage::user(text), &cancel).await?;
    }

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    let mut status = runner.check_status(&cancel).await?;
    while !status.is_terminal() && waited < wait {
        tokio::time::sleep(poll).await;
        waited += poll;
        status = runner.check_status(&cancel).await?;
    }

    if !status.is_terminal() {
        info!(task_id = %task_id, "Process still running, stopping");
        runner.stop().await?;
    }
    println!("Runner {} finished ({})", task_id, runner.status());
    registry.delete_runner(&task_id).await;
    Ok(())
}
