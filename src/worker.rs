use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::runtime::AppState;
use stockpilot_storage::db::call_blocking;
use stockpilot_storage::models::{EmbeddingJob, JobTarget};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub claimed: usize,
    pub completed: usize,
    pub discarded: usize,
    pub failed: usize,
}

pub fn spawn_embedding_worker(state: Arc<AppState>) {
    let worker_id = format!("embed-{}", uuid::Uuid::new_v4().simple());
    tokio::spawn(async move {
        info!(%worker_id, "Embedding worker started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.embed_interval_secs));
        // If a cycle overruns, skip missed ticks instead of bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let stats = run_embedding_cycle(&state, &worker_id).await;
            if stats.claimed > 0 {
                info!(
                    %worker_id,
                    claimed = stats.claimed,
                    completed = stats.completed,
                    discarded = stats.discarded,
                    failed = stats.failed,
                    "Embedding cycle finished"
                );
            }
        }
    });
}

/// One worker cycle: claim a batch atomically (including stale-locked jobs
/// from crashed workers), then process each job with per-item error
/// handling — one bad row never halts the batch.
pub async fn run_embedding_cycle(state: &Arc<AppState>, worker_id: &str) -> CycleStats {
    let mut stats = CycleStats::default();

    let Some(provider) = state.embedding.clone() else {
        debug!("Embedding worker idle: no embedding provider configured");
        return stats;
    };

    let batch = state.config.embed_batch_size;
    let stale_before = (Utc::now()
        - chrono::Duration::seconds(state.config.embed_stale_secs as i64))
    .to_rfc3339();
    let worker = worker_id.to_string();
    let jobs = match call_blocking(state.db.clone(), move |db| {
        db.claim_embedding_jobs(&worker, batch, &stale_before)
    })
    .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(error = %e, "Embedding worker failed to claim jobs");
            return stats;
        }
    };
    stats.claimed = jobs.len();

    for job in jobs {
        match process_job(state, provider.as_ref(), &job).await {
            Ok(JobOutcome::Embedded) => {
                stats.completed += 1;
            }
            Ok(JobOutcome::TargetGone) => {
                // The source row was deleted concurrently; the job is done,
                // not failed.
                stats.discarded += 1;
            }
            Err(e) => {
                stats.failed += 1;
                let job_id = job.id;
                let message = e.to_string();
                let outcome = call_blocking(state.db.clone(), move |db| {
                    db.fail_embedding_job(job_id, &message)
                })
                .await;
                match outcome {
                    Ok(status) if status == "dead" => {
                        warn!(job_id, error = %e, "Embedding job exhausted retries, now dead");
                    }
                    Ok(_) => {
                        warn!(job_id, error = %e, "Embedding job failed, will retry");
                    }
                    Err(db_err) => {
                        error!(job_id, error = %db_err, "Failed to record job failure");
                    }
                }
            }
        }
    }

    stats
}

enum JobOutcome {
    Embedded,
    TargetGone,
}

async fn process_job(
    state: &Arc<AppState>,
    provider: &dyn crate::embedding::EmbeddingProvider,
    job: &EmbeddingJob,
) -> Result<JobOutcome, crate::error::StockPilotError> {
    let content = match job.target {
        JobTarget::Message(id) => {
            let row = call_blocking(state.db.clone(), move |db| db.get_message(id)).await?;
            match row {
                Some(message) => message.content,
                None => {
                    let job_id = job.id;
                    call_blocking(state.db.clone(), move |db| {
                        db.complete_embedding_job(job_id)
                    })
                    .await?;
                    return Ok(JobOutcome::TargetGone);
                }
            }
        }
        JobTarget::Memory(id) => {
            let row = call_blocking(state.db.clone(), move |db| db.get_memory(id)).await?;
            match row {
                Some(memory) => memory.content,
                None => {
                    let job_id = job.id;
                    call_blocking(state.db.clone(), move |db| {
                        db.complete_embedding_job(job_id)
                    })
                    .await?;
                    return Ok(JobOutcome::TargetGone);
                }
            }
        }
    };

    let vector = provider.embed(&content).await?;
    let model = provider.model().to_string();
    let dimension = provider.dimension();
    let target = job.target;
    let job_id = job.id;
    call_blocking(state.db.clone(), move |db| {
        match target {
            JobTarget::Message(id) => db.set_message_embedding(id, &vector, &model, dimension)?,
            JobTarget::Memory(id) => db.set_memory_embedding(id, &vector, &model, dimension)?,
        }
        db.complete_embedding_job(job_id)
    })
    .await?;
    Ok(JobOutcome::Embedded)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub invalidated: usize,
    pub decayed: usize,
    pub purged: usize,
}

pub fn spawn_memory_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        info!("Memory lifecycle sweeper started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match run_memory_sweep(&state).await {
                Ok(stats) => {
                    if stats != SweepStats::default() {
                        info!(
                            invalidated = stats.invalidated,
                            decayed = stats.decayed,
                            purged = stats.purged,
                            "Memory sweep finished"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Memory sweep failed"),
            }
        }
    });
}

/// The periodic lifecycle pass: invalidate expired memories, decay the
/// confidence of long-unused ones, and hard-delete those invalidated past the
/// retention window. Each step is idempotent and safe alongside normal
/// reads/writes.
pub async fn run_memory_sweep(
    state: &Arc<AppState>,
) -> Result<SweepStats, crate::error::StockPilotError> {
    let now = Utc::now().to_rfc3339();
    let decay_cutoff = (Utc::now()
        - chrono::Duration::days(state.config.memory_decay_window_days))
    .to_rfc3339();
    let retention_cutoff = (Utc::now()
        - chrono::Duration::days(state.config.memory_retention_days))
    .to_rfc3339();
    let decay_factor = state.config.memory_decay_factor;

    let stats = call_blocking(state.db.clone(), move |db| {
        let invalidated = db.invalidate_expired_memories(&now)?;
        let decayed = db.decay_unused_confidence(&decay_cutoff, decay_factor)?;
        let purged = db.purge_invalidated_memories(&retention_cutoff)?;
        Ok(SweepStats {
            invalidated,
            decayed,
            purged,
        })
    })
    .await?;
    Ok(stats)
}

pub fn spawn_ticket_purger(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let purged = state.tickets.purge_expired().await;
            if purged > 0 {
                debug!(purged, "Purged expired stream tickets");
            }
        }
    });
}
