// src/task/review.rs
//
// Human review actions on processed records: confirm a binding (which teaches
// the memory store), reject a suggestion (which weakens it), or clear a
// record back to pending. Every action appends to the record's review history
// and re-derives the owning task's status.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::info;

use crate::catalog::apply_wholesale_price;
use crate::memory::db::{load_memory_store, persist_dirty};
use crate::models::core::{LearnProvenance, LearnSource, ProductId, RecordId, TaskId};
use crate::models::matching::{
    MatchType, MatchingRecord, RecordStatus, ReviewAction, ReviewEntry, SelectedMatch,
};
use crate::models::task::TaskStatus;
use crate::task::db::{
    fetch_record, fetch_task, recompute_progress, update_record, update_task_progress,
    update_task_status,
};
use crate::utils::db_connect::PgPool;

async fn load_record(pool: &PgPool, record_id: &RecordId) -> Result<MatchingRecord> {
    match fetch_record(pool, record_id).await? {
        Some(record) if record.processed => Ok(record),
        Some(_) => bail!("record {} has not been processed yet", record_id.0),
        None => bail!("record {} not found", record_id.0),
    }
}

/// Confirms a binding chosen by a reviewer. The product need not be among the
/// ranked candidates; an off-list choice is recorded as an expert match. The
/// confirmation is learned into memory and the wholesale price propagated.
pub async fn confirm(
    pool: &PgPool,
    record_id: &RecordId,
    product_id: &ProductId,
    actor_id: &str,
    note: Option<String>,
) -> Result<()> {
    let mut record = load_record(pool, record_id).await?;
    let task = fetch_task(pool, &record.task_id)
        .await?
        .with_context(|| format!("task {} not found for record {}", record.task_id.0, record_id.0))?;
    let now = Utc::now();

    let from_candidates = record.candidates.iter().find(|c| c.product_id == *product_id);
    let confidence = from_candidates.map(|c| c.score.total).unwrap_or(100);
    let match_type = if from_candidates.is_some() {
        MatchType::Manual
    } else {
        MatchType::Expert
    };

    record.selected = Some(SelectedMatch {
        product_id: product_id.clone(),
        confidence,
        confirmed_by: Some(actor_id.to_string()),
        match_type,
        is_suggestion: false,
    });
    record.status = RecordStatus::Confirmed;
    record.review_history.push(ReviewEntry {
        action: ReviewAction::Confirm,
        actor_id: actor_id.to_string(),
        product_id: Some(product_id.clone()),
        note,
        at: now,
    });
    record.updated_at = now;
    update_record(pool, &record).await?;

    let mut memory = load_memory_store(pool, Some(&task.template_id)).await?;
    memory.learn(
        &record.original.name,
        product_id,
        f64::from(confidence),
        &task.template_id,
        actor_id,
        LearnProvenance {
            source: LearnSource::Manual,
            task_id: Some(record.task_id.clone()),
            record_id: Some(record.id.clone()),
        },
        now,
    )?;
    persist_dirty(pool, &mut memory).await?;

    apply_wholesale_price(
        pool,
        product_id,
        &record.original.name,
        record.original.price,
        record.original.unit.as_deref(),
        &record.id,
    )
    .await;

    info!(
        "Record {} confirmed to product {} by {}",
        record_id.0, product_id.0, actor_id
    );
    recompute_task_status(pool, &record.task_id).await
}

/// Rejects the suggested binding. If a memory record backed the suggestion it
/// is weakened; repeated rejections eventually dispute it.
pub async fn reject(
    pool: &PgPool,
    record_id: &RecordId,
    actor_id: &str,
    note: Option<String>,
) -> Result<()> {
    let mut record = load_record(pool, record_id).await?;
    let task = fetch_task(pool, &record.task_id)
        .await?
        .with_context(|| format!("task {} not found for record {}", record.task_id.0, record_id.0))?;
    let now = Utc::now();

    let rejected_product = record.selected.as_ref().map(|s| s.product_id.clone());
    if let Some(product_id) = &rejected_product {
        let mut memory = load_memory_store(pool, Some(&task.template_id)).await?;
        if memory
            .reject(&record.original.name, product_id, &task.template_id, actor_id, now)
            .is_some()
        {
            persist_dirty(pool, &mut memory).await?;
        }
    }

    record.selected = None;
    record.status = RecordStatus::Rejected;
    record.review_history.push(ReviewEntry {
        action: ReviewAction::Reject,
        actor_id: actor_id.to_string(),
        product_id: rejected_product,
        note,
        at: now,
    });
    record.updated_at = now;
    update_record(pool, &record).await?;

    info!("Record {} rejected by {}", record_id.0, actor_id);
    recompute_task_status(pool, &record.task_id).await
}

/// Returns a reviewed record to the pending queue, discarding its selection
/// but keeping candidates and history.
pub async fn clear(
    pool: &PgPool,
    record_id: &RecordId,
    actor_id: &str,
    note: Option<String>,
) -> Result<()> {
    let mut record = load_record(pool, record_id).await?;
    let now = Utc::now();

    record.selected = None;
    record.status = RecordStatus::Pending;
    record.review_history.push(ReviewEntry {
        action: ReviewAction::Clear,
        actor_id: actor_id.to_string(),
        product_id: None,
        note,
        at: now,
    });
    record.updated_at = now;
    update_record(pool, &record).await?;

    info!("Record {} cleared back to pending by {}", record_id.0, actor_id);
    recompute_task_status(pool, &record.task_id).await
}

/// Re-derives the review/completed status of a task from its records. A task
/// in review completes when the last pending or exception item is resolved;
/// a completed task reopens if a clear action reintroduces one.
pub async fn recompute_task_status(pool: &PgPool, task_id: &TaskId) -> Result<()> {
    let Some(task) = fetch_task(pool, task_id).await? else {
        bail!("task {} not found", task_id.0);
    };
    let progress = recompute_progress(pool, task_id).await?;
    update_task_progress(pool, task_id, &progress).await?;

    match task.status {
        TaskStatus::Review if !progress.has_open_items() => {
            update_task_status(pool, task_id, TaskStatus::Completed).await?;
            info!("Task {} completed: review queue drained", task_id.0);
        }
        TaskStatus::Completed if progress.has_open_items() => {
            update_task_status(pool, task_id, TaskStatus::Review).await?;
            info!("Task {} reopened for review", task_id.0);
        }
        _ => {}
    }
    Ok(())
}
