// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `benchmesh results` command - Query the result store.

use benchmesh_core::{BenchmarkSuite, ConfigLoader, JsonlStore, ResultFilter, ResultStore, RunStatus};

pub async fn execute(
    config_path: &str,
    suite: Option<&str>,
    model: Option<&str>,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;

    let mut filter = ResultFilter::new();
    if let Some(suite) = suite {
        filter = filter.suite(suite.parse::<BenchmarkSuite>()?);
    }
    if let Some(model) = model {
        filter = filter.model(model);
    }
    if let Some(status) = status {
        filter = filter.status(status.parse::<RunStatus>()?);
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }

    let store = JsonlStore::open(&config.orchestrator.results_path).await?;
    let results = store.query(&filter).await?;

    if results.is_empty() {
        println!("No results in {}.", store.path().display());
        return Ok(());
    }

    println!("╔════════════════════════════════════════╦════════════╦══════════════════════╦═══════════╦══════════╗");
    println!("║ Job                                    ║ Suite      ║ Model                ║ Status    ║ Attempts ║");
    println!("╠════════════════════════════════════════╬════════════╬══════════════════════╬═══════════╬══════════╣");

    for result in &results {
        println!(
            "║ {:<38} ║ {:<10} ║ {:<20} ║ {:<9} ║ {:>8} ║",
            result.job_id.to_string(),
            result.job.suite.name(),
            result.job.model.name(),
            result.status.name(),
            result.attempts
        );
    }

    println!("╚════════════════════════════════════════╩════════════╩══════════════════════╩═══════════╩══════════╝");
    println!();
    println!("Total: {} result(s)", results.len());

    Ok(())
}
