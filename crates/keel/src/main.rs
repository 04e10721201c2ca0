//! Run one engine call against a file-backed session and print the reply.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable (or the
//! variable named by `openrouter.api_key_env` in the config file).
//!
//! # Examples
//!
//! ```sh
//! # One call in session "demo", state kept under ./.keel
//! keel run --session demo "Summarize the README"
//!
//! # Stream the reply, with shell tools and a config file
//! keel run --session demo --stream --tools tools.json --config keel.json \
//!   "Find the failing test and fix it"
//!
//! # Inspect what the session has stored
//! keel show --session demo
//! ```

use clap::{Parser, Subcommand};
use futures::StreamExt;
use keel::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Agent execution engine with bounded context.
#[derive(Parser)]
#[command(name = "keel", version)]
struct Cli {
    /// Directory holding session state.
    #[arg(long, global = true, default_value = ".keel")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt and run the tool loop to completion.
    Run {
        /// Session id; state persists across runs.
        #[arg(long, default_value = "default")]
        session: String,

        /// Print text as it arrives.
        #[arg(long)]
        stream: bool,

        /// JSON config file (see `EngineConfig`).
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON file with shell-backed tool definitions.
        #[arg(long)]
        tools: Option<PathBuf>,

        /// Model override.
        #[arg(long)]
        model: Option<String>,

        /// Approve every tool call that needs approval.
        #[arg(long)]
        yes: bool,

        /// The user message.
        prompt: String,
    },
    /// Print a session's stored summary, metadata and message count.
    Show {
        #[arg(long, default_value = "default")]
        session: String,
    },
}

// ── Tool file types ────────────────────────────────────────────────

/// A tool definition from the tools file, with a shell command template
/// used to execute it.
#[derive(Deserialize)]
struct ToolFileEntry {
    function: keel::FunctionDef,
    /// Shell command template. `{{param}}` is replaced by the argument.
    execute: String,
}

/// A tool that runs a rendered command through `sh -c`.
struct ShellCommandTool {
    def: ToolDef,
    template: String,
}

impl Tool for ShellCommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let name = &self.def.function.name;
            let cmd = render_command(&self.template, &arguments);
            eprintln!("  [tool] {name}: {cmd}");

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .output()
                .await
                .map_err(|e| ToolError::Failed(format!("failed to spawn '{cmd}': {e}")))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() {
                return Ok(ToolOutput::error(format!(
                    "Command exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    output.status
                )));
            }
            if stderr.is_empty() {
                Ok(ToolOutput::text(stdout))
            } else {
                Ok(ToolOutput::text(format!("{stdout}\n\n[stderr]\n{stderr}")))
            }
        })
    }
}

fn load_tools(path: &PathBuf) -> Result<ToolSet, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read tools file '{}': {e}", path.display()))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse tools file '{}': {e}", path.display()))?;

    let mut set = ToolSet::new();
    for entry in entries {
        set.register(ShellCommandTool {
            def: ToolDef::new(
                entry.function.name,
                entry.function.description,
                entry.function.parameters,
            ),
            template: entry.execute,
        });
    }
    Ok(set)
}

/// Substitute `{{param}}` placeholders; unknown placeholders are removed.
fn render_command(template: &str, arguments: &Value) -> String {
    let mut cmd = template.to_string();
    if let Some(obj) = arguments.as_object() {
        for (key, value) in obj {
            let replacement = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            cmd = cmd.replace(&format!("{{{{{key}}}}}"), &replacement);
        }
    }

    let mut cleaned = String::with_capacity(cmd.len());
    let mut rest = cmd.as_str();
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest.get(start + 2..).and_then(|tail| tail.find("}}")) else {
            break;
        };
        cleaned.push_str(rest.get(..start).unwrap_or_default());
        rest = rest.get(start + 2 + len + 2..).unwrap_or_default();
    }
    cleaned.push_str(rest);

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Events ─────────────────────────────────────────────────────────

/// Prints tool activity to stderr and answers approval requests.
struct CliEventHandler {
    auto_approve: bool,
}

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
        match event {
            EngineEvent::ToolExecuting { name, arguments } => {
                eprintln!("  [tool_call] {name}({arguments})");
                None
            }
            EngineEvent::ToolRetry {
                name,
                attempt,
                max_retries,
                ..
            } => {
                eprintln!("  [retry] {name} {attempt}/{max_retries}");
                None
            }
            EngineEvent::ApprovalRequired { name, arguments } => {
                if self.auto_approve {
                    return Some(EventResponse::Approve);
                }
                eprint!("  Allow {name}({arguments})? [y/N] ");
                let _ = io::stderr().flush();
                let mut answer = String::new();
                if io::stdin().lock().read_line(&mut answer).is_err() {
                    return Some(EventResponse::Deny("could not read approval".into()));
                }
                if answer.trim().eq_ignore_ascii_case("y") {
                    Some(EventResponse::Approve)
                } else {
                    Some(EventResponse::Deny("denied by user".into()))
                }
            }
            _ => None,
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────

struct RunArgs {
    session: String,
    stream: bool,
    config: Option<PathBuf>,
    tools: Option<PathBuf>,
    model: Option<String>,
    yes: bool,
    prompt: String,
}

async fn run(store: Arc<FileStateStore>, args: RunArgs) -> Result<(), String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(model) = args.model {
        config.model = model;
    }

    let openrouter = config.openrouter.clone().with_model(config.model.clone());
    let model = OpenRouterModel::from_env(openrouter).map_err(|e| e.to_string())?;

    let mut engine = Engine::new(Arc::new(model), store, args.session.as_str(), config)
        .with_event_handler(
            CompositeEventHandler::new()
                .with(LoggingHandler)
                .with(CliEventHandler {
                    auto_approve: args.yes,
                }),
        );
    if let Some(path) = &args.tools {
        let tools = load_tools(path)?;
        eprintln!("  Loaded {} tool(s) from {}", tools.len(), path.display());
        engine = engine.with_tools(&tools);
    }

    let request = CallRequest::new().with_message(Message::user(args.prompt));

    if !args.stream {
        let result = engine.generate(request).await.map_err(|e| e.to_string())?;
        println!("{}", result.text);
        info!(
            "{} step(s), {} tool error(s)",
            result.steps,
            result.tool_errors.len()
        );
        return Ok(());
    }

    let handle = engine.stream(request).await.map_err(|e| e.to_string())?;
    if let Some(mut parts) = handle.parts {
        let mut stdout = io::stdout();
        while let Some(part) = parts.next().await {
            if let StreamPart::TextDelta { text } = part {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
        }
        println!();
    }
    match handle.completion.await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("streamed call did not complete; see the log".into()),
        Err(e) => Err(format!("completion task failed: {e}")),
    }
}

async fn show(store: Arc<FileStateStore>, session: &str) -> Result<(), String> {
    let state = store.get_state(session).await.map_err(|e| e.to_string())?;
    println!("session:  {session}");
    println!("messages: {}", state.messages.len());
    match &state.summary {
        Some(summary) => println!("summary:\n{summary}"),
        None => println!("summary:  (none)"),
    }
    if !state.metadata.is_empty() {
        let metadata = serde_json::to_string_pretty(&state.metadata).map_err(|e| e.to_string())?;
        println!("metadata:\n{metadata}");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keel=info")))
        .init();

    let store = match FileStateStore::new(&cli.store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let outcome = match cli.command {
        Command::Run {
            session,
            stream,
            config,
            tools,
            model,
            yes,
            prompt,
        } => {
            run(
                store,
                RunArgs {
                    session,
                    stream,
                    config,
                    tools,
                    model,
                    yes,
                    prompt,
                },
            )
            .await
        }
        Command::Show { session } => show(store, &session).await,
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
