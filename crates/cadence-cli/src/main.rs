//! `cadence`: run agents configured in `cadence.toml` from the command line.

mod config;

use anyhow::Context;
use cadence_agent::{ComponentRegistry, Runner};
use cadence_core::{Content, Event, StateMap};
use cadence_session::{FileSessionStore, SessionStore};
use cadence_tools::{Tool, Toolset};
use clap::{Parser, Subcommand};
use config::CadenceConfig;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence: event-sourced agent runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the resulting events
    Run {
        /// The user message
        message: String,
        #[arg(short, long, default_value = "local")]
        user: String,
        #[arg(short, long, default_value = "default")]
        session: String,
        /// JSON object merged into session state with the message
        #[arg(long)]
        state: Option<String>,
    },
    /// Print the recorded events of a session
    History {
        #[arg(short, long, default_value = "local")]
        user: String,
        #[arg(short, long, default_value = "default")]
        session: String,
    },
    /// List built-in tools and tools exposed by configured tool servers
    Tools,
}

fn print_event(event: &Event) {
    let Some(content) = &event.content else {
        if !event.actions.state_delta.is_empty() {
            println!("[{}] state: {:?}", event.author, event.actions.state_delta);
        }
        return;
    };
    if event.partial {
        print!("{}", content.text());
        return;
    }
    for call in content.function_calls() {
        println!("[{}] -> {}({})", event.author, call.name, call.args);
    }
    for response in content.function_responses() {
        println!(
            "[{}] <- {}: {}",
            event.author,
            response.name,
            serde_json::Value::Object(response.response.clone())
        );
    }
    let text = content.text();
    if !text.is_empty() {
        println!("[{}] {}", event.author, text);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config_str = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("Failed to read config file '{}'", cli.config.display()))?;
    let config = CadenceConfig::parse(&config_str)?;
    let registry = ComponentRegistry::with_builtins();

    match cli.command {
        Commands::Run {
            message,
            user,
            session,
            state,
        } => {
            let state_delta: Option<StateMap> = state
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--state must be a JSON object")?;

            let store = Arc::new(FileSessionStore::new(config.sessions_dir()).await?);
            let agents = config.build_agents(&registry)?;
            let runner = Runner::new(&config.app_name, agents, store)
                .with_config(config.runner.clone());

            info!(app = %config.app_name, user = %user, session = %session, "Starting run");
            let mut events = runner.run(
                &user,
                &session,
                Content::user_text(message),
                state_delta,
                config.run.clone(),
            );
            while let Some(item) = events.next().await {
                print_event(&item?);
            }
        }
        Commands::History { user, session } => {
            let store = FileSessionStore::new(config.sessions_dir()).await?;
            let events = store.list_events(&config.app_name, &user, &session).await?;
            if events.is_empty() {
                println!("No events recorded for session '{session}'.");
            }
            for event in &events {
                print_event(event);
            }
        }
        Commands::Tools => {
            println!("Built-in tools:");
            for key in registry.tool_keys() {
                println!("  {key}");
            }
            let agents = config.build_agents(&registry)?;
            let Some(agent) = agents.node(agents.root()).kind.as_llm() else {
                return Ok(());
            };
            for toolset in &agent.toolsets {
                let tools = toolset.tools().await?;
                println!("\nTool server ({} tool(s)):", tools.len());
                for tool in &tools {
                    println!("  {}: {}", tool.name(), tool.declaration().description);
                }
                toolset.close().await?;
            }
        }
    }

    Ok(())
}
