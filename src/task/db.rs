// src/task/db.rs
//
// Persistence for matching tasks and their per-line-item records. Embedded
// documents (candidates, exceptions, review history) live in jsonb columns;
// progress is re-derived from record statuses rather than trusted from
// incremental counters.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::models::core::{ProductId, RecordId, TaskId, TemplateId};
use crate::models::matching::{MatchingRecord, RecordStatus};
use crate::models::task::{MatchingTask, TaskProgress, TaskStatistics, TaskStatus};
use crate::utils::db_connect::PgPool;

const TASK_COLUMNS: &str = "id, template_id, status, config, progress, statistics, source_file,
                            error_message, created_by, created_at, started_at, completed_at";

fn task_from_row(row: &Row) -> Result<MatchingTask> {
    let config: serde_json::Value = row.get("config");
    let progress: serde_json::Value = row.get("progress");
    let statistics: Option<serde_json::Value> = row.get("statistics");
    Ok(MatchingTask {
        id: TaskId(row.get("id")),
        template_id: TemplateId(row.get("template_id")),
        status: TaskStatus::from_str(row.get("status")),
        config: serde_json::from_value(config).context("Failed to deserialize task config")?,
        progress: serde_json::from_value(progress)
            .context("Failed to deserialize task progress")?,
        statistics: statistics
            .map(serde_json::from_value)
            .transpose()
            .context("Failed to deserialize task statistics")?,
        source_file: row.get("source_file"),
        error_message: row.get("error_message"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn record_from_row(row: &Row) -> Result<MatchingRecord> {
    let original: serde_json::Value = row.get("original");
    let candidates: serde_json::Value = row.get("candidates");
    let selected: Option<serde_json::Value> = row.get("selected");
    let exceptions: serde_json::Value = row.get("exceptions");
    let review_history: serde_json::Value = row.get("review_history");
    Ok(MatchingRecord {
        id: RecordId(row.get("id")),
        task_id: TaskId(row.get("task_id")),
        original: serde_json::from_value(original)
            .context("Failed to deserialize record line item")?,
        normalized_name: row.get("normalized_name"),
        candidates: serde_json::from_value(candidates)
            .context("Failed to deserialize record candidates")?,
        selected: selected
            .map(serde_json::from_value)
            .transpose()
            .context("Failed to deserialize selected match")?,
        status: RecordStatus::from_str(row.get("status")),
        exceptions: serde_json::from_value(exceptions)
            .context("Failed to deserialize record exceptions")?,
        review_history: serde_json::from_value(review_history)
            .context("Failed to deserialize review history")?,
        processed: row.get("processed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn fetch_task(pool: &PgPool, task_id: &TaskId) -> Result<Option<MatchingTask>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task fetch")?;
    let row = conn
        .query_opt(
            &format!("SELECT {} FROM matching.matching_tasks WHERE id = $1", TASK_COLUMNS),
            &[&task_id.0],
        )
        .await
        .context("Failed to query matching task")?;
    row.as_ref().map(task_from_row).transpose()
}

/// Atomically claims the oldest pending task for a worker, moving it to
/// `processing`. Optimistic across workers: SKIP LOCKED loses gracefully.
pub async fn claim_next_pending_task(pool: &PgPool) -> Result<Option<MatchingTask>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task claim")?;
    let row = conn
        .query_opt(
            &format!(
                "UPDATE matching.matching_tasks
                 SET status = 'processing', started_at = CURRENT_TIMESTAMP
                 WHERE id = (
                     SELECT id FROM matching.matching_tasks
                     WHERE status = 'pending'
                     ORDER BY created_at ASC
                     FOR UPDATE SKIP LOCKED
                     LIMIT 1
                 )
                 RETURNING {}",
                TASK_COLUMNS
            ),
            &[],
        )
        .await
        .context("Failed to claim pending task")?;
    row.as_ref().map(task_from_row).transpose()
}

/// Transitions pending (or failed, for a retry) -> processing.
pub async fn mark_task_processing(pool: &PgPool, task_id: &TaskId) -> Result<bool> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task start")?;
    let updated = conn
        .execute(
            "UPDATE matching.matching_tasks
             SET status = 'processing', started_at = CURRENT_TIMESTAMP, error_message = NULL
             WHERE id = $1 AND status IN ('pending', 'failed')",
            &[&task_id.0],
        )
        .await
        .context("Failed to mark task processing")?;
    Ok(updated == 1)
}

pub async fn mark_task_failed(pool: &PgPool, task_id: &TaskId, message: &str) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task failure")?;
    conn.execute(
        "UPDATE matching.matching_tasks
         SET status = 'failed', error_message = $2, completed_at = CURRENT_TIMESTAMP
         WHERE id = $1",
        &[&task_id.0, &message],
    )
    .await
    .context("Failed to mark task failed")?;
    info!("Task {} marked failed: {}", task_id.0, message);
    Ok(())
}

pub async fn update_task_progress(
    pool: &PgPool,
    task_id: &TaskId,
    progress: &TaskProgress,
) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for progress update")?;
    let progress_json =
        serde_json::to_value(progress).context("Failed to serialize task progress")?;
    conn.execute(
        "UPDATE matching.matching_tasks SET progress = $2 WHERE id = $1",
        &[&task_id.0, &progress_json],
    )
    .await
    .context("Failed to update task progress")?;
    Ok(())
}

/// Persists the terminal state of the automated pass.
pub async fn finalize_task(
    pool: &PgPool,
    task_id: &TaskId,
    status: TaskStatus,
    progress: &TaskProgress,
    statistics: &TaskStatistics,
) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task finalize")?;
    let progress_json =
        serde_json::to_value(progress).context("Failed to serialize task progress")?;
    let statistics_json =
        serde_json::to_value(statistics).context("Failed to serialize task statistics")?;
    conn.execute(
        "UPDATE matching.matching_tasks
         SET status = $2, progress = $3, statistics = $4, completed_at = CURRENT_TIMESTAMP
         WHERE id = $1",
        &[&task_id.0, &status.as_str(), &progress_json, &statistics_json],
    )
    .await
    .context("Failed to finalize task")?;
    Ok(())
}

/// Moves a task between review and completed after manual review actions.
pub async fn update_task_status(pool: &PgPool, task_id: &TaskId, status: TaskStatus) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for status update")?;
    conn.execute(
        "UPDATE matching.matching_tasks SET status = $2 WHERE id = $1",
        &[&task_id.0, &status.as_str()],
    )
    .await
    .context("Failed to update task status")?;
    Ok(())
}

/// Line items awaiting the automated pass, in submission order.
pub async fn load_unprocessed_records(
    pool: &PgPool,
    task_id: &TaskId,
) -> Result<Vec<MatchingRecord>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for record load")?;
    let rows = conn
        .query(
            "SELECT id, task_id, original, normalized_name, candidates, selected, status,
                    exceptions, review_history, processed, created_at, updated_at
             FROM matching.matching_records
             WHERE task_id = $1 AND processed = FALSE
             ORDER BY created_at ASC, id ASC",
            &[&task_id.0],
        )
        .await
        .context("Failed to query unprocessed records")?;
    rows.iter().map(record_from_row).collect()
}

pub async fn fetch_record(pool: &PgPool, record_id: &RecordId) -> Result<Option<MatchingRecord>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for record fetch")?;
    let row = conn
        .query_opt(
            "SELECT id, task_id, original, normalized_name, candidates, selected, status,
                    exceptions, review_history, processed, created_at, updated_at
             FROM matching.matching_records
             WHERE id = $1",
            &[&record_id.0],
        )
        .await
        .context("Failed to query matching record")?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn update_record(pool: &PgPool, record: &MatchingRecord) -> Result<()> {
    batch_update_records(pool, std::slice::from_ref(record)).await
}

/// Writes the outcome of the automated pass (or a review action) for a batch
/// of records in one transaction.
pub async fn batch_update_records(pool: &PgPool, records: &[MatchingRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let mut conn = pool
        .get()
        .await
        .context("Failed to get DB connection for record batch update")?;
    let transaction = conn
        .transaction()
        .await
        .context("Failed to start transaction for record batch update")?;

    let mut values_clause_parts = Vec::new();
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
    let mut param_idx = 1;
    let now = Utc::now();

    for record in records {
        values_clause_parts.push(format!(
            "(${}, ${}, ${}::jsonb, ${}::jsonb, ${}, ${}::jsonb, ${}::jsonb, ${}::boolean, ${}::timestamptz)",
            param_idx,
            param_idx + 1,
            param_idx + 2,
            param_idx + 3,
            param_idx + 4,
            param_idx + 5,
            param_idx + 6,
            param_idx + 7,
            param_idx + 8
        ));
        params.push(Box::new(record.id.0.clone()));
        params.push(Box::new(record.normalized_name.clone()));
        params.push(Box::new(
            serde_json::to_value(&record.candidates)
                .context("Failed to serialize record candidates")?,
        ));
        params.push(Box::new(
            record
                .selected
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .context("Failed to serialize selected match")?,
        ));
        params.push(Box::new(record.status.as_str().to_string()));
        params.push(Box::new(
            serde_json::to_value(&record.exceptions)
                .context("Failed to serialize record exceptions")?,
        ));
        params.push(Box::new(
            serde_json::to_value(&record.review_history)
                .context("Failed to serialize review history")?,
        ));
        params.push(Box::new(record.processed));
        params.push(Box::new(now));
        param_idx += 9;
    }

    let update_sql = format!(
        "UPDATE matching.matching_records AS r
         SET normalized_name = v.normalized_name,
             candidates = v.candidates,
             selected = v.selected,
             status = v.status,
             exceptions = v.exceptions,
             review_history = v.review_history,
             processed = v.processed,
             updated_at = v.updated_at
         FROM (VALUES {}) AS v(id, normalized_name, candidates, selected, status,
                               exceptions, review_history, processed, updated_at)
         WHERE r.id = v.id",
        values_clause_parts.join(", ")
    );

    let params_slice: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();

    debug!(
        "Batch updating {} matching record(s) with {} parameters",
        records.len(),
        params_slice.len()
    );

    let updated = transaction
        .execute(update_sql.as_str(), params_slice.as_slice())
        .await
        .context("Failed to execute record batch update")?;
    transaction
        .commit()
        .await
        .context("Failed to commit record batch update")?;

    if updated as usize != records.len() {
        log::warn!(
            "Record batch update count mismatch: expected {}, updated {}",
            records.len(),
            updated
        );
    }
    Ok(())
}

/// Recomputes progress from record statuses. Bucket counts only consider
/// records the automated pass already handled, so concurrent manual reviews
/// move items between buckets without breaking conservation.
pub async fn recompute_progress(pool: &PgPool, task_id: &TaskId) -> Result<TaskProgress> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for progress recompute")?;
    let row = conn
        .query_one(
            "SELECT
                 COUNT(*) AS total,
                 COUNT(*) FILTER (WHERE processed) AS processed,
                 COUNT(*) FILTER (WHERE processed AND status = 'confirmed') AS confirmed,
                 COUNT(*) FILTER (WHERE processed AND status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE processed AND status = 'rejected') AS rejected,
                 COUNT(*) FILTER (WHERE processed AND status = 'exception') AS exception
             FROM matching.matching_records
             WHERE task_id = $1",
            &[&task_id.0],
        )
        .await
        .context("Failed to recompute task progress")?;
    Ok(TaskProgress {
        total: row.get("total"),
        processed: row.get("processed"),
        confirmed: row.get("confirmed"),
        pending: row.get("pending"),
        rejected: row.get("rejected"),
        exception: row.get("exception"),
    })
}

/// Mean confidence over confirmed records, for task statistics.
pub async fn average_confirmed_confidence(pool: &PgPool, task_id: &TaskId) -> Result<f64> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for confidence average")?;
    let row = conn
        .query_one(
            "SELECT COALESCE(AVG((selected->>'confidence')::float8), 0.0) AS avg_confidence
             FROM matching.matching_records
             WHERE task_id = $1 AND status = 'confirmed' AND selected IS NOT NULL",
            &[&task_id.0],
        )
        .await
        .context("Failed to compute average confirmed confidence")?;
    Ok(row.get("avg_confidence"))
}

/// Bindings already confirmed within one task, for re-seeding the strict
/// task-scoped side of the conflict detector when a failed task is retried.
pub async fn load_task_confirmed_bindings(
    pool: &PgPool,
    task_id: &TaskId,
) -> Result<Vec<(ProductId, String)>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for task binding load")?;
    let rows = conn
        .query(
            "SELECT selected->>'product_id' AS product_id, normalized_name
             FROM matching.matching_records
             WHERE task_id = $1 AND status = 'confirmed' AND selected IS NOT NULL",
            &[&task_id.0],
        )
        .await
        .context("Failed to query confirmed bindings for task")?;
    Ok(rows
        .iter()
        .map(|row| (ProductId(row.get("product_id")), row.get("normalized_name")))
        .collect())
}

/// Most recently confirmed normalized name per product, system-wide. Loaded
/// once per task as the global side of the conflict detector.
pub async fn load_latest_confirmed_bindings(
    pool: &PgPool,
) -> Result<HashMap<ProductId, String>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for binding load")?;
    let rows = conn
        .query(
            "SELECT DISTINCT ON (selected->>'product_id')
                    selected->>'product_id' AS product_id,
                    normalized_name
             FROM matching.matching_records
             WHERE status = 'confirmed' AND selected IS NOT NULL
             ORDER BY selected->>'product_id', updated_at DESC",
            &[],
        )
        .await
        .context("Failed to query latest confirmed bindings")?;
    Ok(rows
        .iter()
        .map(|row| (ProductId(row.get("product_id")), row.get("normalized_name")))
        .collect())
}
