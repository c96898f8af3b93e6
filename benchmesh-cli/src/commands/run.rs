// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `benchmesh run` command - Run one benchmark job.
//!
//! Brings up the worker pool from configuration, submits the job, streams its
//! progress and prints the stored result. Ctrl-C cancels the job.

use std::sync::Arc;

use benchmesh_core::{
    BenchmarkJob, BenchmarkSuite, ConfigLoader, EndpointLauncher, JsonlStore, ModelTarget,
    RunResult, RunStatus, Scheduler, WorkerRegistry,
};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

pub async fn execute(
    config_path: &str,
    suite: &str,
    model: &str,
    endpoint: Option<String>,
    params: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_file(config_path)?;
    let orchestrator = &config.orchestrator;

    let suite: BenchmarkSuite = suite.parse()?;
    let mut job = BenchmarkJob::new(suite, ModelTarget::new(model, endpoint)?);
    for param in params {
        let (key, value) = parse_param(param)?;
        job = job.with_parameter(key, value);
    }

    tracing::info!(
        workers = config.workers.len(),
        pool_size = orchestrator.pool_size,
        "Configuration validated successfully"
    );

    let launcher = EndpointLauncher::new(orchestrator.launch_options());
    let registry = WorkerRegistry::new(
        config.workers.clone(),
        Arc::new(launcher),
        orchestrator.registry_options(),
    );
    let store = Arc::new(JsonlStore::open(&orchestrator.results_path).await?);
    let scheduler = Scheduler::new(registry.clone(), store, orchestrator.scheduler_options());
    let monitor = registry.spawn_health_monitor();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    BENCHMESH RUN                             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Suite:  {}", job.suite);
    println!("  Model:  {}", job.model.name());
    println!("  Job:    {}", job.id);
    println!();

    let ticket = match scheduler.submit(job) {
        Ok(ticket) => ticket,
        Err(e) => {
            scheduler.shutdown().await;
            return Err(e.into());
        }
    };
    let job_id = ticket.job_id();

    if let Some(mut progress) = scheduler.subscribe_progress(job_id) {
        tokio::spawn(async move {
            loop {
                match progress.recv().await {
                    Ok(event) => {
                        let total = event
                            .total
                            .map(|t| format!("/{}", t))
                            .unwrap_or_default();
                        match event.message {
                            Some(message) => {
                                println!("  [{:>4}] {}{}  {}", event.seq, event.completed, total, message)
                            }
                            None => println!("  [{:>4}] {}{}", event.seq, event.completed, total),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress display lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // The scheduler may drop a finished job, so the ctrl-c path keeps its own ticket
    let fallback = ticket.clone();
    let result = tokio::select! {
        result = ticket.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("Cancelling job {}...", job_id);
            if let Err(e) = scheduler.cancel(job_id) {
                tracing::debug!(error = %e, "Cancel raced with completion");
            }
            fallback.wait().await
        }
    };

    scheduler.shutdown().await;
    let _ = monitor.await;

    let result = result?;
    print_result(&result);

    if result.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Parse `key=value`; the value is read as JSON when it parses, else as a string.
fn parse_param(param: &str) -> Result<(String, Value), String> {
    let (key, raw) = param
        .split_once('=')
        .ok_or_else(|| format!("Parameter '{}' must be KEY=VALUE", param))?;
    if key.is_empty() {
        return Err(format!("Parameter '{}' has an empty key", param));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn print_result(result: &RunResult) {
    let mark = if result.is_success() { "✓" } else { "✗" };
    println!();
    println!("{} Job {} {}", mark, result.job_id, result.status);
    println!("  Attempts:     {}", result.attempts);
    if let Some(worker) = &result.worker_id {
        println!("  Worker:       {}", worker);
    }
    println!(
        "  Duration:     {:.1}s",
        result.duration().num_milliseconds() as f64 / 1000.0
    );
    println!("  Fingerprint:  {}", result.fingerprint);
    if let Some(error) = &result.error {
        println!("  Error:        {}", error);
    }
    if !result.metrics.is_null() {
        let metrics = serde_json::to_string_pretty(&result.metrics)
            .unwrap_or_else(|_| result.metrics.to_string());
        println!("  Metrics:");
        for line in metrics.lines() {
            println!("    {}", line);
        }
    }
}
