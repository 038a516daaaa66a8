// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Modbridge CLI
//!
//! Inspect a module directory or invoke one of its entry points.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modbridge_core::{
    CoreError, MemorySink, Module, ModuleHost, ModuleLoader, RuntimeConfig, ABI_VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "modbridge")]
#[command(about = "Modbridge - sandboxed scraper module runner", long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a module's manifest, format, digest and entry points
    Inspect {
        /// Module directory
        dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a module and call one entry point
    Call {
        /// Module directory
        dir: PathBuf,

        /// Entry point name
        entry: String,

        /// Argument as JSON; repeat for several
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Call deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the instance events after the call
        #[arg(long)]
        events: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Inspect { dir, json } => inspect(config, &dir, json),
        Commands::Call {
            dir,
            entry,
            args,
            timeout_ms,
            events,
        } => call(config, &dir, &entry, &args, timeout_ms, events).await,
    }
}

/// Explicit `--config`, else `<config dir>/modbridge/config.toml` when it
/// exists, else defaults.
fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => dirs::config_dir()
            .map(|dir| dir.join("modbridge").join("config.toml"))
            .filter(|path| path.exists()),
    };

    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading runtime config");
            RuntimeConfig::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn inspect(config: RuntimeConfig, dir: &Path, json_output: bool) -> Result<()> {
    let module = Module::from_directory(dir)
        .with_context(|| format!("Failed to read module from {}", dir.display()))?;

    let loader = ModuleLoader::new(config)
        .context("Failed to create module loader")?
        .without_network();
    let instance = loader
        .load(module)
        .with_context(|| format!("Failed to load module from {}", dir.display()))?;
    let module = instance.module();
    let manifest = module.manifest();

    if json_output {
        let report = serde_json::json!({
            "manifest": manifest,
            "format": module.format(),
            "digest": module.digest(),
            "exports": instance.exports(),
            "abiVersion": ABI_VERSION,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Module: {}", manifest.name);
        println!("{:-<40}", "");
        println!("ID:           {}", manifest.id);
        println!("Version:      {}", manifest.version);
        println!("Entry file:   {}", manifest.entry_file);
        println!("Format:       {}", module.format());
        println!("Digest:       {}", module.digest());
        println!("ABI:          {}", ABI_VERSION);
        if let Some(description) = &manifest.description {
            println!("Description:  {}", description);
        }
        if !manifest.authors.is_empty() {
            println!("Authors:      {}", manifest.authors.join(", "));
        }
        println!("Capabilities: {}", manifest.capabilities.join(", "));
        println!("Exports:");
        for export in instance.exports() {
            println!("  - {}", export);
        }
    }

    instance.unload();
    Ok(())
}

async fn call(
    config: RuntimeConfig,
    dir: &Path,
    entry: &str,
    raw_args: &[String],
    timeout_ms: Option<u64>,
    print_events: bool,
) -> Result<()> {
    let args = raw_args
        .iter()
        .map(|raw| {
            serde_json::from_str(raw).with_context(|| format!("Argument is not valid JSON: {}", raw))
        })
        .collect::<Result<Vec<serde_json::Value>>>()?;

    let events = Arc::new(MemorySink::new());
    let mut loader = ModuleLoader::new(config).context("Failed to create module loader")?;
    if print_events {
        loader = loader.with_sink(events.clone());
    }
    let host = ModuleHost::new(loader);

    let instance = host
        .load_directory(dir)
        .with_context(|| format!("Failed to load module from {}", dir.display()))?;

    let deadline = timeout_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
    let result = host.call(instance.id(), entry, args, deadline).await;
    host.unload_all();

    if print_events {
        for event in events.events() {
            eprintln!("{}", serde_json::to_string(&event)?);
        }
    }

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ {} failed: {}", entry, e);
            println!("{}", serde_json::to_string_pretty(&error_payload(&e))?);
            std::process::exit(1);
        }
    }
}

/// Guest errors print their full payload; host errors print their message.
fn error_payload(error: &CoreError) -> serde_json::Value {
    match error.guest() {
        Some(guest) => serde_json::to_value(guest).unwrap_or_else(|_| error.to_string().into()),
        None => serde_json::json!({
            "name": "HostError",
            "message": error.to_string(),
            "fatal": error.is_fatal(),
            "retryable": error.is_retryable(),
        }),
    }
}
