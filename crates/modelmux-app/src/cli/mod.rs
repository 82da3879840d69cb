//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "modelmux",
    version,
    about = "Multi-model LLM gateway with file ingestion and routing"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the gateway HTTP server.
    Serve(ServeArgs),
    /// Print the model catalog with availability.
    Models(ModelsArgs),
    /// Score a prompt and preview the route without calling upstream.
    Analyze(AnalyzeArgs),
    /// Run content extraction on a local file (debug aid).
    Extract(ExtractArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct ModelsArgs {
    /// Emit the full catalog as JSON instead of the summary table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Prompt text to score.
    pub prompt: String,
    /// Explicit model id, or `auto`.
    #[arg(long, default_value = "auto")]
    pub model: String,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Path of the file to run through the extractor registry.
    pub path: PathBuf,
}
