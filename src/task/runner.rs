// src/task/runner.rs
//
// The automated matching pass over one task. Loads the catalog snapshot,
// memory store, and global bindings once, then walks the unprocessed line
// items, classifying each into confirmed / pending / exception and flushing
// results in batches. Per-item failures become exceptions; only an empty
// catalog fails the whole task.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use crate::catalog::{apply_wholesale_price, build_brand_set, load_active_catalog};
use crate::matching::conflict::ConflictDetector;
use crate::matching::normalize::deep_normalize;
use crate::matching::orchestrator::match_line_item;
use crate::matching::scorer::ScoreProfile;
use crate::memory::db::{load_memory_store, persist_dirty};
use crate::memory::store::MemoryStore;
use crate::models::matching::{
    ExceptionEntry, ExceptionKind, MatchCandidate, MatchType, MatchingRecord, RecordStatus,
    SelectedMatch, Severity,
};
use crate::models::task::{MatchingTask, TaskConfig, TaskStatistics, TaskStatus};
use crate::task::db::{
    average_confirmed_confidence, batch_update_records, fetch_task, finalize_task,
    load_latest_confirmed_bindings, load_task_confirmed_bindings, load_unprocessed_records,
    mark_task_failed, mark_task_processing, recompute_progress, update_task_progress,
};
use crate::models::core::TaskId;
use crate::utils::config::MatcherConfig;
use crate::utils::constants::{BATCH_DB_OPS_SIZE, PROGRESS_FLUSH_EVERY};
use crate::utils::db_connect::PgPool;

/// Decision for one line item after ranking.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Confirmed unattended. `conflict_overridden` is set when a high-trust
    /// memory hit overruled a binding conflict.
    AutoConfirm { conflict_overridden: bool },
    /// Routed to human review, with the best candidate attached as a
    /// suggestion. `conflict_detected` adds a duplicate-name exception.
    PendingReview { conflict_detected: bool },
    /// Best candidate below the review threshold.
    LowConfidence,
    NoCandidates,
}

/// Pure classification of a ranked candidate list against the task
/// thresholds. Memory-backed candidates confirm unattended; algorithmic
/// candidates must clear the full auto-confirm threshold, and a binding
/// conflict forces review unless a high-trust memory hit with at least
/// three confirmations overrides it.
pub fn classify(
    candidates: &[MatchCandidate],
    conflict_on_best: bool,
    config: &TaskConfig,
) -> ItemOutcome {
    let Some(best) = candidates.first() else {
        return ItemOutcome::NoCandidates;
    };

    // Overriding a conflict takes more evidence than plain high trust.
    let overrides_conflict = best
        .memory_source
        .as_ref()
        .map(|s| s.is_high_trust && s.confirm_count >= 3)
        .unwrap_or(false);
    if conflict_on_best && overrides_conflict {
        return ItemOutcome::AutoConfirm {
            conflict_overridden: true,
        };
    }
    if !conflict_on_best
        && (best.is_memory_match || best.score.total >= config.auto_confirm_threshold)
    {
        return ItemOutcome::AutoConfirm {
            conflict_overridden: false,
        };
    }
    if best.score.total >= config.review_threshold {
        return ItemOutcome::PendingReview {
            conflict_detected: conflict_on_best,
        };
    }
    ItemOutcome::LowConfidence
}

/// Fetches a task by id, claims it, and runs the automated pass.
pub async fn run_task_by_id(pool: &PgPool, task_id: &TaskId, config: &MatcherConfig) -> Result<()> {
    let Some(task) = fetch_task(pool, task_id)
        .await
        .context("Failed to fetch task")?
    else {
        bail!("task {} not found", task_id.0);
    };
    if !mark_task_processing(pool, task_id)
        .await
        .context("Failed to claim task")?
    {
        bail!(
            "task {} is not claimable (status {})",
            task_id.0,
            task.status.as_str()
        );
    }
    run_claimed_task(pool, task, config).await
}

/// Runs the automated pass over an already-claimed task. Failures are
/// recorded on the task row; the temporary source artifact is removed either
/// way.
pub async fn run_claimed_task(
    pool: &PgPool,
    task: MatchingTask,
    config: &MatcherConfig,
) -> Result<()> {
    info!(
        "🚀 Starting automated pass for task {} (template {})",
        task.id.0, task.template_id.0
    );
    let result = process_items(pool, &task, config).await;

    if let Some(source_file) = &task.source_file {
        if let Err(e) = std::fs::remove_file(source_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove source artifact {} for task {}: {}",
                    source_file, task.id.0, e
                );
            }
        }
    }

    match result {
        Ok(status) => {
            info!(
                "✅ Task {} finished automated pass with status '{}'",
                task.id.0,
                status.as_str()
            );
            Ok(())
        }
        Err(e) => {
            mark_task_failed(pool, &task.id, &format!("{:#}", e)).await?;
            Err(e)
        }
    }
}

async fn process_items(
    pool: &PgPool,
    task: &MatchingTask,
    config: &MatcherConfig,
) -> Result<TaskStatus> {
    let started = std::time::Instant::now();
    let profile = ScoreProfile::default();

    let catalog = load_active_catalog(pool, &task.template_id).await?;
    if catalog.is_empty() {
        bail!(
            "catalog for template {} has no active entries",
            task.template_id.0
        );
    }
    let brand_set = build_brand_set(&catalog);
    let mut memory = load_memory_store(pool, Some(&task.template_id)).await?;
    let mut detector = ConflictDetector::new(load_latest_confirmed_bindings(pool).await?);
    // On retry of a partially processed task, confirmations from the earlier
    // attempt must re-enter the strict task-scoped check.
    for (product_id, normalized_name) in load_task_confirmed_bindings(pool, &task.id).await? {
        detector.record_confirmation(&product_id, &normalized_name);
    }

    let records = load_unprocessed_records(pool, &task.id).await?;
    info!(
        "Task {}: {} line item(s) to process against {} catalog entries and {} memory record(s)",
        task.id.0,
        records.len(),
        catalog.len(),
        memory.len()
    );

    let progress_bar = if config.progress_enabled {
        let pb = ProgressBar::new(records.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut batch: Vec<MatchingRecord> = Vec::with_capacity(BATCH_DB_OPS_SIZE);
    let mut counters = task.progress.clone();
    counters.total = records.len() as i64 + counters.processed;
    let mut since_progress_flush = 0usize;

    for mut record in records {
        let now = Utc::now();
        if let Err(e) = process_one(
            &mut record,
            task,
            &catalog,
            &brand_set,
            &mut memory,
            &mut detector,
            &profile,
            pool,
        )
        .await
        {
            // A per-item failure never aborts the batch.
            warn!("Record {} failed to process: {:#}", record.id.0, e);
            mark_processing_error(&mut record, format!("{:#}", e), now);
        }

        counters.processed += 1;
        match record.status {
            RecordStatus::Confirmed => counters.confirmed += 1,
            RecordStatus::Pending => counters.pending += 1,
            RecordStatus::Rejected => counters.rejected += 1,
            RecordStatus::Exception => counters.exception += 1,
        }
        record.processed = true;
        record.updated_at = now;
        batch.push(record);
        progress_bar.inc(1);

        if batch.len() >= BATCH_DB_OPS_SIZE {
            batch_update_records(pool, &batch).await?;
            batch.clear();
        }
        since_progress_flush += 1;
        if since_progress_flush >= PROGRESS_FLUSH_EVERY {
            update_task_progress(pool, &task.id, &counters).await?;
            since_progress_flush = 0;
        }
    }
    batch_update_records(pool, &batch).await?;
    progress_bar.finish_and_clear();

    if memory.has_dirty() {
        persist_dirty(pool, &mut memory).await?;
    }

    // Re-derive progress from the records rather than trusting the loop
    // counters; concurrent review actions may have moved items already.
    let progress = recompute_progress(pool, &task.id).await?;
    let statistics = TaskStatistics {
        match_rate: if progress.processed > 0 {
            progress.confirmed as f64 / progress.processed as f64
        } else {
            0.0
        },
        avg_confidence: average_confirmed_confidence(pool, &task.id).await?,
        duration_secs: started.elapsed().as_secs_f64(),
    };
    let status = if progress.has_open_items() {
        TaskStatus::Review
    } else {
        TaskStatus::Completed
    };
    finalize_task(pool, &task.id, status, &progress, &statistics).await?;
    info!(
        "Task {}: {}/{} confirmed ({:.1}% match rate) in {:.1}s",
        task.id.0,
        progress.confirmed,
        progress.processed,
        statistics.match_rate * 100.0,
        statistics.duration_secs
    );
    Ok(status)
}

fn mark_processing_error(
    record: &mut MatchingRecord,
    message: String,
    now: chrono::DateTime<Utc>,
) {
    record.status = RecordStatus::Exception;
    record.exceptions.push(ExceptionEntry {
        kind: ExceptionKind::ProcessingError,
        severity: Severity::High,
        message,
        at: now,
    });
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
    record: &mut MatchingRecord,
    task: &MatchingTask,
    catalog: &[crate::models::core::CatalogEntry],
    brand_set: &std::collections::HashSet<String>,
    memory: &mut MemoryStore,
    detector: &mut ConflictDetector,
    profile: &ScoreProfile,
    pool: &PgPool,
) -> Result<()> {
    let now = Utc::now();
    let normalized = deep_normalize(&record.original.name);
    record.normalized_name = normalized.clone();

    if normalized.is_empty() {
        record.status = RecordStatus::Exception;
        record.exceptions.push(ExceptionEntry {
            kind: ExceptionKind::MissingName,
            severity: Severity::High,
            message: format!(
                "line item name '{}' is empty after normalization",
                record.original.name
            ),
            at: now,
        });
        return Ok(());
    }

    record.candidates = match_line_item(
        &record.original,
        catalog,
        brand_set,
        memory,
        &task.template_id,
        profile,
        now,
    );

    let conflict_on_best = record
        .candidates
        .first()
        .map(|best| detector.has_binding_conflict(&best.product_id, &normalized))
        .unwrap_or(false);

    match classify(&record.candidates, conflict_on_best, &task.config) {
        ItemOutcome::AutoConfirm { conflict_overridden } => {
            let best = record
                .candidates
                .first()
                .cloned()
                .context("confirmation classified without a candidate")?;
            record.selected = Some(SelectedMatch {
                product_id: best.product_id.clone(),
                confidence: best.score.total,
                confirmed_by: None,
                match_type: if best.is_memory_match {
                    MatchType::Memory
                } else {
                    MatchType::Auto
                },
                is_suggestion: false,
            });
            record.status = RecordStatus::Confirmed;
            if conflict_overridden {
                warn!(
                    "Record {}: high-trust memory overrode a binding conflict on product {}",
                    record.id.0, best.product_id.0
                );
            }
            detector.record_confirmation(&best.product_id, &normalized);
            if let Some(source) = &best.memory_source {
                memory.record_usage(&source.memory_id, now);
            }
            apply_wholesale_price(
                pool,
                &best.product_id,
                &record.original.name,
                record.original.price,
                record.original.unit.as_deref(),
                &record.id,
            )
            .await;
        }
        ItemOutcome::PendingReview { conflict_detected } => {
            let best = record
                .candidates
                .first()
                .cloned()
                .context("review suggestion classified without a candidate")?;
            record.selected = Some(SelectedMatch {
                product_id: best.product_id.clone(),
                confidence: best.score.total,
                confirmed_by: None,
                match_type: if best.is_memory_match {
                    MatchType::Memory
                } else {
                    MatchType::Auto
                },
                is_suggestion: true,
            });
            record.status = RecordStatus::Pending;
            if conflict_detected {
                record.exceptions.push(ExceptionEntry {
                    kind: ExceptionKind::DuplicateName,
                    severity: Severity::Low,
                    message: format!(
                        "product {} is already bound to a different wholesale name",
                        best.product_id.0
                    ),
                    at: now,
                });
            }
        }
        ItemOutcome::LowConfidence => {
            record.status = RecordStatus::Exception;
            let best_score = record
                .candidates
                .first()
                .map(|c| c.score.total)
                .unwrap_or(0);
            record.exceptions.push(ExceptionEntry {
                kind: ExceptionKind::LowConfidence,
                severity: Severity::Medium,
                message: format!(
                    "best candidate scored {} (review threshold {})",
                    best_score, task.config.review_threshold
                ),
                at: now,
            });
        }
        ItemOutcome::NoCandidates => {
            record.status = RecordStatus::Exception;
            record.exceptions.push(ExceptionEntry {
                kind: ExceptionKind::NoCandidates,
                severity: Severity::High,
                message: "no catalog candidate reached the minimum score".to_string(),
                at: now,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::{ProductId, RecordId, WholesaleLineItem};
    use crate::models::matching::{ConfidenceTier, MatchReason, MemorySource, ScoreBreakdown};

    fn candidate(total: i32, tier: ConfidenceTier) -> MatchCandidate {
        MatchCandidate {
            product_id: ProductId("p1".to_string()),
            score: ScoreBreakdown {
                name: total,
                brand: 0,
                keywords: 0,
                package: 0,
                price: 0,
                total,
            },
            tier,
            reasons: vec![MatchReason::ExactMatch],
            rank: 1,
            is_memory_match: false,
            memory_source: None,
        }
    }

    fn memory_candidate(total: i32, confirm_count: i32, is_high_trust: bool) -> MatchCandidate {
        let mut c = candidate(total, ConfidenceTier::High);
        c.is_memory_match = true;
        c.reasons = vec![MatchReason::MemoryHit { confirm_count }];
        c.memory_source = Some(MemorySource {
            memory_id: "m1".to_string(),
            confirm_count,
            trust_score: total as f64,
            is_high_trust,
        });
        c
    }

    fn config(review: i32, auto: i32) -> TaskConfig {
        TaskConfig {
            review_threshold: review,
            auto_confirm_threshold: auto,
        }
    }

    #[test]
    fn test_high_score_auto_confirms() {
        let outcome = classify(&[candidate(95, ConfidenceTier::High)], false, &config(60, 90));
        assert_eq!(
            outcome,
            ItemOutcome::AutoConfirm {
                conflict_overridden: false
            }
        );
    }

    #[test]
    fn test_score_below_raised_threshold_goes_to_review() {
        // A strict task raises the bar to 95: a high-tier 92 must wait for a
        // human even though it would auto-confirm under the defaults.
        let outcome = classify(&[candidate(92, ConfidenceTier::High)], false, &config(60, 95));
        assert_eq!(
            outcome,
            ItemOutcome::PendingReview {
                conflict_detected: false
            }
        );
    }

    #[test]
    fn test_conflict_forces_review_for_algorithmic_match() {
        let outcome = classify(&[candidate(98, ConfidenceTier::High)], true, &config(60, 90));
        assert_eq!(
            outcome,
            ItemOutcome::PendingReview {
                conflict_detected: true
            }
        );
    }

    #[test]
    fn test_high_trust_memory_overrides_conflict() {
        let outcome = classify(&[memory_candidate(92, 5, true)], true, &config(60, 90));
        assert_eq!(
            outcome,
            ItemOutcome::AutoConfirm {
                conflict_overridden: true
            }
        );
    }

    #[test]
    fn test_override_requires_three_confirmations() {
        // High trust with only two confirmations is enough to auto-confirm,
        // but not enough to overrule a binding conflict.
        let outcome = classify(&[memory_candidate(92, 2, true)], true, &config(60, 90));
        assert_eq!(
            outcome,
            ItemOutcome::PendingReview {
                conflict_detected: true
            }
        );
        let clean = classify(&[memory_candidate(92, 2, true)], false, &config(60, 90));
        assert_eq!(
            clean,
            ItemOutcome::AutoConfirm {
                conflict_overridden: false
            }
        );
    }

    #[test]
    fn test_ordinary_memory_match_confirms_without_conflict_only() {
        let cfg = config(60, 90);
        // Boosted memory score of 82 sits below the auto threshold but still
        // confirms because the association was human-taught.
        assert_eq!(
            classify(&[memory_candidate(82, 1, false)], false, &cfg),
            ItemOutcome::AutoConfirm {
                conflict_overridden: false
            }
        );
        assert_eq!(
            classify(&[memory_candidate(82, 1, false)], true, &cfg),
            ItemOutcome::PendingReview {
                conflict_detected: true
            }
        );
    }

    #[test]
    fn test_low_confidence_and_empty_outcomes() {
        let cfg = config(60, 90);
        assert_eq!(
            classify(&[candidate(45, ConfidenceTier::Low)], false, &cfg),
            ItemOutcome::LowConfidence
        );
        // A brand-conflict candidate scores 15 and lands here too.
        assert_eq!(
            classify(&[candidate(15, ConfidenceTier::Low)], false, &cfg),
            ItemOutcome::LowConfidence
        );
        assert_eq!(classify(&[], false, &cfg), ItemOutcome::NoCandidates);
    }

    #[test]
    fn test_conflict_below_review_threshold_is_low_confidence() {
        let outcome = classify(&[candidate(50, ConfidenceTier::Low)], true, &config(60, 90));
        assert_eq!(outcome, ItemOutcome::LowConfidence);
    }

    #[test]
    fn test_processing_failure_becomes_exception() {
        let now = Utc::now();
        let mut record = MatchingRecord {
            id: RecordId("r1".to_string()),
            task_id: crate::models::core::TaskId("t1".to_string()),
            original: WholesaleLineItem {
                name: "中华(软)".to_string(),
                price: None,
                quantity: 1,
                unit: None,
                supplier: None,
                raw: serde_json::Value::Null,
            },
            normalized_name: String::new(),
            candidates: Vec::new(),
            selected: None,
            status: RecordStatus::Pending,
            exceptions: Vec::new(),
            review_history: Vec::new(),
            processed: false,
            created_at: now,
            updated_at: now,
        };
        mark_processing_error(&mut record, "candidate serialization failed".to_string(), now);
        assert_eq!(record.status, RecordStatus::Exception);
        assert_eq!(record.exceptions.len(), 1);
        assert_eq!(record.exceptions[0].kind, ExceptionKind::ProcessingError);
        assert_eq!(record.exceptions[0].severity, Severity::High);
    }

    #[test]
    fn test_review_band_between_thresholds() {
        let cfg = config(60, 90);
        for score in [60, 75, 89] {
            assert_eq!(
                classify(&[candidate(score, ConfidenceTier::Medium)], false, &cfg),
                ItemOutcome::PendingReview {
                    conflict_detected: false
                }
            );
        }
    }
}
