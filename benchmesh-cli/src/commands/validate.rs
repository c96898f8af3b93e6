// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `benchmesh validate` command - Validate configuration file.

use benchmesh_core::{ConfigLoader, EndpointConfig};

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let o = &config.orchestrator;
            println!("✓ Configuration is valid");
            println!();
            println!("Orchestrator Settings:");
            println!("  Pool Size:          {}", o.pool_size);
            println!("  Backpressure:       {:?}", o.backpressure);
            println!(
                "  Retries:            {} (backoff {:?} .. {:?})",
                o.max_retries, o.retry_backoff, o.max_retry_backoff
            );
            println!(
                "  Health Checks:      every {:?}, timeout {:?}",
                o.health_check_interval, o.ping_timeout
            );
            match o.job_timeout {
                Some(timeout) => println!("  Job Timeout:        {:?}", timeout),
                None => println!("  Job Timeout:        suite default"),
            }
            println!("  Socket Directory:   {}", o.socket_dir.display());
            println!("  Results:            {}", o.results_path.display());
            println!();
            println!("Workers ({}):", config.workers.len());
            for worker in &config.workers {
                let capabilities: Vec<_> =
                    worker.capabilities.iter().map(|c| c.name()).collect();
                let endpoint = match &worker.endpoint {
                    EndpointConfig::Spawn(spawn) => format!("spawn {}", spawn.program),
                    EndpointConfig::Connect { address } => format!("connect {}", address),
                };
                println!(
                    "  - {} ({}; {})",
                    worker.name,
                    endpoint,
                    capabilities.join(", ")
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
