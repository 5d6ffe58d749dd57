//! facescan - scan a photo library and browse the face clusters it finds.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{ClustersCommand, HistoryCommand, MergeCommand, RefineCommand, ScanCommand, StatusCommand, UndoCommand};

/// Scan photos for faces and group them by person.
///
/// The library lives in a data directory (default ~/.facegroup/facescan/)
/// holding the clustering store and the anchor index. Settings are read
/// from a YAML config file with `engine` and `scan` sections.
#[derive(Parser)]
#[command(name = "facescan")]
#[command(about = "Face clustering for photo libraries")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.facegroup/facescan/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Data directory, overriding the config file
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    /// Output as JSON instead of YAML
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a directory of photos and cluster the faces found
    Scan(ScanCommand),
    /// Show the last scan checkpoint and queue totals
    Status(StatusCommand),
    /// Run a refinement pass over the library
    Refine(RefineCommand),
    /// List clusters, largest first
    Clusters(ClustersCommand),
    /// Merge one cluster into another
    Merge(MergeCommand),
    /// Show recent edits
    History(HistoryCommand),
    /// Undo an edit by history id
    Undo(UndoCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Scan(cmd) => cmd.run(&cli).await,
        Commands::Status(cmd) => cmd.run(&cli).await,
        Commands::Refine(cmd) => cmd.run(&cli).await,
        Commands::Clusters(cmd) => cmd.run(&cli).await,
        Commands::Merge(cmd) => cmd.run(&cli).await,
        Commands::History(cmd) => cmd.run(&cli).await,
        Commands::Undo(cmd) => cmd.run(&cli).await,
    }
}
