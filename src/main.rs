use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use plait_agent::{build_execution_tree, parse_workflow};
use plait_core::config::AppConfig;
use plait_core::types::TaskId;

#[derive(Parser)]
#[command(name = "plait", version, about = "Task-graph planning and execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "plait.toml", env = "PLAIT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a plan document and print its execution layers
    Check {
        /// Plan file (XML)
        file: PathBuf,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plait=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => check(&file).await,
        Commands::Config => {
            let config = AppConfig::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn check(file: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    debug!(bytes = text.len(), "Plan file read");

    let workflow = parse_workflow(TaskId::new(), &text, true)?;
    let tree = build_execution_tree(&workflow.agents)?;
    info!(agents = workflow.agents.len(), nodes = tree.len(), "Plan is valid");

    if !workflow.name.is_empty() {
        println!("name:    {}", workflow.name);
    }
    if !workflow.thought.is_empty() {
        println!("thought: {}", workflow.thought);
    }
    println!("order:   {tree}");
    println!();
    for (step, ids) in tree.layers().iter().enumerate() {
        let mode = if ids.len() > 1 { "parallel" } else { "serial" };
        println!("step {} ({mode})", step + 1);
        for id in ids {
            if let Some(agent) = workflow.agent(id) {
                let depends = if agent.depends.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", agent.depends.join(", "))
                };
                println!("  [{}] {}{}: {}", agent.id, agent.name, depends, agent.task);
            }
        }
    }
    Ok(())
}
