mod dialog;
mod mcp;

use std::env;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use calldk_engine::adapter::ToolAdapter;
use calldk_engine::config::Settings;
use calldk_engine::optimizer::{GeminiOptimizer, TextOptimizer};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "calldk", version, about = "Operator feedback dialog exposed as an MCP tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the call_dk tool over stdio.
    Serve,
    /// Open the terminal feedback dialog.
    Dialog(DialogArgs),
    /// Run one dialog handoff and print the resulting content blocks.
    Call,
    /// Rewrite a prompt with the configured optimizer.
    Optimize(OptimizeArgs),
}

#[derive(Debug, Parser)]
struct DialogArgs {
    #[arg(long)]
    project_directory: Option<PathBuf>,
    #[arg(long, default_value = dialog::DEFAULT_PROMPT)]
    prompt: String,
    #[arg(long)]
    output_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct OptimizeArgs {
    #[arg(long)]
    text: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("calldk error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries protocol traffic in `serve`.
fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("calldk=info,warn"));
    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(true)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    match cli.command {
        Command::Serve => {
            let adapter = ToolAdapter::new(settings.dialog.launcher()?);
            mcp::serve(adapter)?;
            Ok(0)
        }
        Command::Dialog(args) => {
            let project_directory = match args.project_directory {
                Some(dir) => dir,
                None => env::current_dir().context("cannot read the working directory")?,
            };
            let optimizer_settings = settings.optimizer;
            dialog::run(project_directory, &args.prompt, args.output_file, move || {
                Box::new(GeminiOptimizer::new(optimizer_settings)) as Box<dyn TextOptimizer>
            })?;
            Ok(0)
        }
        Command::Call => {
            let adapter = ToolAdapter::new(settings.dialog.launcher()?);
            let blocks = adapter.invoke()?;
            let rendered: Vec<Value> = blocks.iter().map(mcp::content_json).collect();
            println!("{}", serde_json::to_string_pretty(&rendered)?);
            Ok(0)
        }
        Command::Optimize(args) => {
            let optimizer = GeminiOptimizer::new(settings.optimizer);
            println!("{}", optimizer.status_message());
            if !optimizer.is_available() {
                return Ok(1);
            }
            let rewritten = optimizer.optimize(&args.text)?;
            println!("{rewritten}");
            Ok(0)
        }
    }
}
