//! Shared helpers for commands.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use facegroup_cluster::Engine;

use crate::Cli;
use crate::config::{AppConfig, open_engine};

/// Loaded config, resolved data directory and the opened engine.
pub struct Library {
    pub config: AppConfig,
    pub data_dir: PathBuf,
    pub engine: Arc<Engine>,
}

pub fn open_library(cli: &Cli) -> anyhow::Result<Library> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let data_dir = config.resolve_data_dir(cli.data_dir.as_deref())?;
    print_verbose(cli, &format!("Library: {}", data_dir.display()));
    let engine = open_engine(&config, &data_dir)?;
    tracing::debug!(data_dir = %data_dir.display(), dim = engine.config().dim, "facescan: library opened");
    Ok(Library {
        config,
        data_dir,
        engine,
    })
}

/// Print a result as YAML, or JSON with `--json`.
pub fn output_result<T: Serialize>(value: &T, json: bool) -> anyhow::Result<()> {
    let out = if json {
        serde_json::to_string_pretty(value)?
    } else {
        serde_yaml::to_string(value)?
    };
    println!("{}", out.trim_end());
    Ok(())
}

pub fn print_verbose(cli: &Cli, message: &str) {
    if cli.verbose {
        eprintln!("[verbose] {}", message);
    }
}

pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}
