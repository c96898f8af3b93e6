// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Benchmesh CLI
//!
//! Command-line controller for the benchmesh benchmark orchestrator.

use clap::{Parser, Subcommand};

mod commands;
mod metrics;

/// Benchmesh - distributed benchmark orchestrator
#[derive(Parser)]
#[command(name = "benchmesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "benchmesh.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Serve Prometheus metrics on this port while running
    #[arg(long)]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one benchmark job and wait for its result
    Run {
        /// Suite to run (mteb, mmlu, human_eval, gsm8k, throughput)
        #[arg(short, long)]
        suite: String,

        /// Model name, e.g. gpt-3.5-turbo
        #[arg(short, long)]
        model: String,

        /// API endpoint serving the model
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Suite parameter as key=value (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// List configured worker templates
    Workers,

    /// Query stored results
    Results {
        #[arg(long)]
        suite: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// succeeded, failed or cancelled
        #[arg(long)]
        status: Option<String>,

        /// Show only the newest N results
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    if let Some(port) = cli.metrics_port {
        metrics::start_metrics_server(port).await?;
    }

    match cli.command {
        Commands::Run {
            suite,
            model,
            endpoint,
            params,
        } => commands::run::execute(&cli.config, &suite, &model, endpoint, &params).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
        Commands::Workers => commands::workers::execute(&cli.config).await,
        Commands::Results {
            suite,
            model,
            status,
            limit,
        } => {
            commands::results::execute(
                &cli.config,
                suite.as_deref(),
                model.as_deref(),
                status.as_deref(),
                limit,
            )
            .await
        }
    }
}
