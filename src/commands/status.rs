use anyhow::{Context, Result};

use ranksync::config::Config;
use ranksync::models::WorkflowStatus;
use ranksync::storage::{self, CheckpointStore};

/// Print persisted runs, or one run in detail
pub fn status(config: &Config, run_id: Option<&str>, prune: bool) -> Result<()> {
    let (_, checkpoints) = storage::open(&config.storage).context("Failed to open storage")?;

    if let Some(run_id) = run_id {
        return show_run(checkpoints.as_ref(), run_id);
    }

    let states = checkpoints.list_states()?;
    if states.is_empty() {
        println!("No workflow runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<18} {:<13} {:>10}  {}",
        "RUN", "TYPE", "STATUS", "ITEMS", "UPDATED"
    );
    for state in &states {
        println!(
            "{:<38} {:<18} {:<13} {:>10}  {}",
            state.id,
            state.workflow_type.as_str(),
            state.status.as_str(),
            state.items_processed,
            state.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if prune {
        let mut pruned = 0;
        for state in states.iter().filter(|s| s.status == WorkflowStatus::Completed) {
            checkpoints.delete_checkpoint(&state.id)?;
            pruned += 1;
        }
        println!("\nPruned checkpoints of {pruned} completed runs");
    }

    Ok(())
}

fn show_run(checkpoints: &dyn CheckpointStore, run_id: &str) -> Result<()> {
    let state = checkpoints
        .load_state(run_id)?
        .with_context(|| format!("Unknown run: {run_id}"))?;

    println!("Run {}", state.id);
    println!("========================");
    println!("Type: {}", state.workflow_type);
    println!("Status: {}", state.status);
    println!("Items processed: {}", state.items_processed);
    println!("Started: {}", state.started_at);
    println!("Updated: {}", state.updated_at);
    if let Some(completed) = state.completed_at {
        println!("Completed: {completed}");
    }
    if let Some(last) = &state.last_processed_unit_key {
        println!("Last unit: {last}");
    }
    if let Some(message) = &state.error_message {
        println!("Error: {message}");
    }

    if let Some(checkpoint) = checkpoints.load_checkpoint(run_id)? {
        println!("\nCheckpoint");
        println!("----------");
        let completed: Vec<_> = checkpoint.completed_phases.iter().map(|p| p.as_str()).collect();
        println!("Completed phases: {}", completed.join(", "));
        match checkpoint.next_phase() {
            Some(next) => println!("Next phase: {next}"),
            None => println!("Next phase: none"),
        }
        println!("Continuations: {}", checkpoint.continuations);
        println!("Units completed: {}", checkpoint.stats.units_completed);
        println!("Records fetched: {}", checkpoint.stats.records_fetched);
    }

    Ok(())
}
