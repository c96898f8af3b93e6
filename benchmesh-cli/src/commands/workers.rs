// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `benchmesh workers` command - List worker templates from configuration.

use benchmesh_core::{ConfigLoader, EndpointConfig};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;

    println!("╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                            WORKER TEMPLATES                                  ║");
    println!("╠═══════════════════╦═════════╦══════════════════════╦═════════════════════════╣");
    println!("║ Name              ║ Mode    ║ Target               ║ Capabilities            ║");
    println!("╠═══════════════════╬═════════╬══════════════════════╬═════════════════════════╣");

    for worker in &config.workers {
        let (mode, target) = match &worker.endpoint {
            EndpointConfig::Spawn(spawn) => ("spawn", spawn.program.clone()),
            EndpointConfig::Connect { address } => ("connect", address.clone()),
        };
        let capabilities: Vec<_> = worker.capabilities.iter().map(|c| c.name()).collect();

        println!(
            "║ {:<17} ║ {:<7} ║ {:<20} ║ {:<23} ║",
            worker.name.as_str(),
            mode,
            truncate(&target, 20),
            truncate(&capabilities.join(","), 23)
        );
    }

    println!("╚═══════════════════╩═════════╩══════════════════════╩═════════════════════════╝");
    println!();
    println!(
        "Total: {} template(s), pool size {}",
        config.workers.len(),
        config.orchestrator.pool_size
    );

    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let head: String = s.chars().take(width - 1).collect();
        format!("{}…", head)
    }
}
