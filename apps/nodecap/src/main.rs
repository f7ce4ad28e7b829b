// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the nodecap capture orchestrator.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the nodecap capture orchestrator.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, LevelFilter};

use nodecap::{
    load_config, DirectorySink, Dispatcher, KubectlExec, NodecapConfig, Orchestrator, RemoteExec,
    Shell, SimCluster,
};

/// nodecap command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author = "Lukas Bower",
    version,
    about = "Node-scoped packet capture orchestrator",
    long_about = None
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// kubeconfig file overriding the configuration.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// kubeconfig context overriding the configuration.
    #[arg(long)]
    context: Option<String>,

    /// Local directory receiving downloaded captures.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Run against the built-in simulated cluster instead of kubectl.
    #[arg(long, default_value_t = false)]
    mock: bool,

    /// Execute commands from a script file instead of starting a REPL.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Seconds to wait for remote operations in `wait` and list commands.
    #[arg(long, default_value_t = 300)]
    wait_secs: u64,

    /// Render `show` output as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Enable debug logging.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn resolve_config(cli: &Cli) -> Result<NodecapConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => NodecapConfig::default(),
    };
    if let Some(kubeconfig) = &cli.kubeconfig {
        config.kubectl.kubeconfig = Some(kubeconfig.clone());
    }
    if let Some(context) = &cli.context {
        config.kubectl.context = Some(context.clone());
    }
    if let Some(dir) = &cli.download_dir {
        config.download.dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run<E: RemoteExec + 'static>(cli: &Cli, config: &NodecapConfig, exec: E) -> Result<()> {
    let sink = DirectorySink::new(config.download.dir.clone(), config.capture.extension.clone());
    let orchestrator = Orchestrator::new(Dispatcher::new(exec, sink, config));
    let stdout = io::stdout();
    let mut shell = Shell::new(orchestrator, stdout.lock())
        .with_json(cli.json)
        .with_wait(Duration::from_secs(cli.wait_secs));
    match &cli.script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open script {}", path.display()))?;
            shell.run_script(BufReader::new(file))
        }
        None => shell.repl(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = resolve_config(&cli)?;
    if cli.mock {
        info!("nodecap starting transport=mock");
        run(&cli, &config, SimCluster::demo(&config))
    } else {
        info!("nodecap starting transport=kubectl binary={}", config.kubectl.binary);
        run(&cli, &config, KubectlExec::new(&config.kubectl))
    }
}
