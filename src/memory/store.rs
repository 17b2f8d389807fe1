// src/memory/store.rs
//
// In-memory working set of learned (wholesale name -> product) associations
// for one catalog template. Loaded from the database per task, mutated by
// learn/reject/cleanup operations, and written back via memory::db. The
// one-active-record-per-(normalized_name, template_id) invariant is preserved
// here by deprecating the previous binding before creating a new one; the
// database backs it with a partial unique index.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashSet;
use uuid::Uuid;

use crate::matching::normalize::deep_normalize;
use crate::models::core::{
    AuditAction, LearnProvenance, MemoryConflict, MemoryRecord, MemoryStatus, ProductId,
    TemplateId, CONFIDENCE_FLOOR_ON_REJECT, WEIGHT_CAP, WEIGHT_FLOOR,
};

/// Rejection conflicts accumulated before a record is marked disputed.
const DISPUTE_CONFLICT_LIMIT: usize = 3;

/// Confidence floor for the loosened third lookup tier.
const LOOSENED_CONFIDENCE_FLOOR: f64 = 40.0;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<MemoryRecord>,
    /// Ids mutated since the last write-back.
    dirty: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<MemoryRecord>) -> Self {
        Self {
            records,
            dirty: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Drains the dirty set, returning clones of every mutated record for
    /// persistence.
    pub fn take_dirty(&mut self) -> Vec<MemoryRecord> {
        let ids = std::mem::take(&mut self.dirty);
        self.records
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Tiered lookup: exact normalized-name match at/above `min_confidence`,
    /// else substring containment at the same floor, else (only when the
    /// caller asked for more than the loosened floor) a pass that trusts
    /// well-confirmed records down to confidence 40.
    pub fn find_matching(
        &self,
        normalized_name: &str,
        template_id: &TemplateId,
        min_confidence: f64,
        limit: usize,
        include_deprecated: bool,
    ) -> Vec<&MemoryRecord> {
        if normalized_name.is_empty() || limit == 0 {
            return Vec::new();
        }
        let eligible = |r: &&MemoryRecord| {
            r.template_id == *template_id
                && (r.status == MemoryStatus::Active
                    || (include_deprecated && r.status == MemoryStatus::Deprecated))
        };

        let mut hits: Vec<&MemoryRecord> = self
            .records
            .iter()
            .filter(eligible)
            .filter(|r| r.normalized_name == normalized_name && r.confidence >= min_confidence)
            .collect();

        if hits.is_empty() {
            hits = self
                .records
                .iter()
                .filter(eligible)
                .filter(|r| {
                    r.confidence >= min_confidence
                        && (r.normalized_name.contains(normalized_name)
                            || normalized_name.contains(r.normalized_name.as_str()))
                })
                .collect();
        }

        if hits.is_empty() && min_confidence > LOOSENED_CONFIDENCE_FLOOR {
            hits = self
                .records
                .iter()
                .filter(eligible)
                .filter(|r| {
                    r.confirm_count >= 3
                        && r.confidence >= LOOSENED_CONFIDENCE_FLOOR
                        && (r.normalized_name == normalized_name
                            || r.normalized_name.contains(normalized_name)
                            || normalized_name.contains(r.normalized_name.as_str()))
                })
                .collect();
        }

        hits.sort_by(|a, b| {
            b.confirm_count
                .cmp(&a.confirm_count)
                .then(
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.last_confirmed_at.cmp(&a.last_confirmed_at))
        });
        hits.truncate(limit);
        hits
    }

    /// Records a confirmed binding. Returns the id of the active record that
    /// now encodes the association.
    pub fn learn(
        &mut self,
        original_name: &str,
        product_id: &ProductId,
        confidence: f64,
        template_id: &TemplateId,
        actor_id: &str,
        provenance: LearnProvenance,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let normalized = deep_normalize(original_name);
        if normalized.is_empty() {
            bail!("cannot learn an association for an empty normalized name");
        }

        let existing_idx = self.records.iter().position(|r| {
            r.status == MemoryStatus::Active
                && r.normalized_name == normalized
                && r.template_id == *template_id
        });

        if let Some(idx) = existing_idx {
            if self.records[idx].confirmed_product_id == *product_id {
                let record = &mut self.records[idx];
                // A repeat learn from the same source task only bumps usage,
                // so one task cannot over-weight itself.
                let same_task = provenance.task_id.is_some()
                    && provenance.task_id == record.source_task_id;
                if same_task {
                    record.usage_count += 1;
                    record.updated_at = now;
                    record.push_audit(
                        AuditAction::UsageBump,
                        actor_id,
                        "repeat learn from originating task".to_string(),
                        now,
                    );
                } else {
                    record.confirm_count += 1;
                    record.last_confirmed_at = now;
                    record.updated_at = now;
                    record.confidence = record.confidence.max(confidence);
                    if let Some(task_id) = provenance.task_id {
                        record.source_task_id = Some(task_id);
                    }
                    if record.confirm_count >= 3 {
                        record.weight = (record.weight + 0.1).min(WEIGHT_CAP);
                        record.is_user_preference = true;
                    }
                    record.push_audit(
                        AuditAction::Confirmed,
                        actor_id,
                        format!("re-confirmed (count {})", record.confirm_count),
                        now,
                    );
                }
                let id = record.id.clone();
                self.dirty.insert(id.clone());
                return Ok(id);
            }

            // Reassignment: deprecate the old binding first to preserve the
            // one-active-record invariant.
            let old_product = self.records[idx].confirmed_product_id.clone();
            {
                let record = &mut self.records[idx];
                record.status = MemoryStatus::Deprecated;
                record.updated_at = now;
                record.push_audit(
                    AuditAction::Deprecated,
                    actor_id,
                    format!(
                        "superseded: '{}' reassigned from product {} to {}",
                        normalized, old_product.0, product_id.0
                    ),
                    now,
                );
            }
            let old_id = self.records[idx].id.clone();
            self.dirty.insert(old_id);
            info!(
                "Memory: deprecated binding of '{}' to {} in favor of {}",
                normalized, old_product.0, product_id.0
            );
        }

        let mut record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            normalized_name: normalized,
            original_name: original_name.to_string(),
            confirmed_product_id: product_id.clone(),
            template_id: template_id.clone(),
            confidence: confidence.clamp(0.0, 100.0),
            confirm_count: 1,
            usage_count: 0,
            weight: provenance.source.initial_weight(),
            status: MemoryStatus::Active,
            is_user_preference: false,
            source: provenance.source,
            source_task_id: provenance.task_id.clone(),
            conflicts: Vec::new(),
            audit_trail: Vec::new(),
            created_at: now,
            last_confirmed_at: now,
            updated_at: now,
        };
        record.push_audit(
            AuditAction::Created,
            actor_id,
            format!("learned binding to product {}", product_id.0),
            now,
        );
        let id = record.id.clone();
        debug!(
            "Memory: learned '{}' -> {} ({})",
            record.normalized_name,
            product_id.0,
            provenance.source.as_str()
        );
        self.records.push(record);
        self.dirty.insert(id.clone());
        Ok(id)
    }

    /// Marks a memory hit consumed during automated matching.
    pub fn record_usage(&mut self, memory_id: &str, now: DateTime<Utc>) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == memory_id) {
            record.usage_count += 1;
            record.updated_at = now;
            self.dirty.insert(record.id.clone());
        }
    }

    /// Weakens the active record binding `original_name` to the rejected
    /// product. After three accumulated rejection conflicts the record is
    /// disputed and leaves the default lookup set.
    pub fn reject(
        &mut self,
        original_name: &str,
        rejected_product_id: &ProductId,
        template_id: &TemplateId,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let normalized = deep_normalize(original_name);
        let record = self.records.iter_mut().find(|r| {
            r.status == MemoryStatus::Active
                && r.normalized_name == normalized
                && r.template_id == *template_id
                && r.confirmed_product_id == *rejected_product_id
        })?;

        record.weight = (record.weight * 0.7).max(WEIGHT_FLOOR);
        record.confidence = (record.confidence * 0.8).max(CONFIDENCE_FLOOR_ON_REJECT);
        record.conflicts.push(MemoryConflict {
            rejected_product_id: rejected_product_id.clone(),
            actor_id: actor_id.to_string(),
            noted_at: now,
        });
        record.updated_at = now;
        record.push_audit(
            AuditAction::Rejected,
            actor_id,
            format!("binding rejected ({} conflict(s))", record.conflicts.len()),
            now,
        );
        if record.conflicts.len() >= DISPUTE_CONFLICT_LIMIT {
            record.status = MemoryStatus::Conflicted;
            record.push_audit(
                AuditAction::Disputed,
                actor_id,
                "disputed after repeated rejections".to_string(),
                now,
            );
        }
        let id = record.id.clone();
        self.dirty.insert(id.clone());
        Some(id)
    }

    /// Data-integrity repair: any (normalized_name, template_id) group with
    /// more than one active record keeps only the highest-priority record
    /// (recency, then confirm count, then confidence) and deprecates the
    /// rest. Returns the number of records deprecated.
    pub fn cleanup_duplicates(
        &mut self,
        template_id: Option<&TemplateId>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> usize {
        use std::collections::HashMap;

        let mut groups: HashMap<(String, TemplateId), Vec<usize>> = HashMap::new();
        for (idx, record) in self.records.iter().enumerate() {
            if record.status != MemoryStatus::Active {
                continue;
            }
            if let Some(t) = template_id {
                if record.template_id != *t {
                    continue;
                }
            }
            groups
                .entry((record.normalized_name.clone(), record.template_id.clone()))
                .or_default()
                .push(idx);
        }

        let mut deprecated = 0;
        for (_, mut indices) in groups {
            if indices.len() < 2 {
                continue;
            }
            indices.sort_by(|&a, &b| {
                let (ra, rb) = (&self.records[a], &self.records[b]);
                rb.last_confirmed_at
                    .cmp(&ra.last_confirmed_at)
                    .then(rb.confirm_count.cmp(&ra.confirm_count))
                    .then(
                        rb.confidence
                            .partial_cmp(&ra.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });
            let keeper = self.records[indices[0]].id.clone();
            for &idx in &indices[1..] {
                let record = &mut self.records[idx];
                record.status = MemoryStatus::Deprecated;
                record.updated_at = now;
                record.push_audit(
                    AuditAction::Deprecated,
                    actor_id,
                    format!("duplicate cleanup: kept record {}", keeper),
                    now,
                );
                self.dirty.insert(record.id.clone());
                deprecated += 1;
            }
        }
        if deprecated > 0 {
            info!("Memory cleanup: deprecated {} duplicate record(s)", deprecated);
        }
        deprecated
    }

    /// Count of active records for a key; the invariant holds when this never
    /// exceeds one.
    pub fn active_count(&self, normalized_name: &str, template_id: &TemplateId) -> usize {
        self.records
            .iter()
            .filter(|r| {
                r.status == MemoryStatus::Active
                    && r.normalized_name == normalized_name
                    && r.template_id == *template_id
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::LearnSource;
    use crate::models::core::TaskId;
    use chrono::Duration;

    fn template() -> TemplateId {
        TemplateId("t1".to_string())
    }

    fn pid(s: &str) -> ProductId {
        ProductId(s.to_string())
    }

    fn manual() -> LearnProvenance {
        LearnProvenance {
            source: LearnSource::Manual,
            task_id: None,
            record_id: None,
        }
    }

    fn manual_from(task: &str) -> LearnProvenance {
        LearnProvenance {
            source: LearnSource::Manual,
            task_id: Some(TaskId(task.to_string())),
            record_id: None,
        }
    }

    #[test]
    fn test_three_learns_then_reassignment() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .learn(
                    "中华(软)",
                    &pid("p1"),
                    90.0,
                    &template(),
                    "reviewer-1",
                    manual(),
                    now + Duration::minutes(i),
                )
                .unwrap();
        }
        assert_eq!(store.active_count("中华软盒", &template()), 1);
        let record = store
            .find_matching("中华软盒", &template(), 60.0, 10, false)
            .pop()
            .unwrap();
        assert_eq!(record.confirm_count, 3);
        assert!((record.weight - 1.1).abs() < 1e-9);
        assert!(record.is_user_preference);

        // Fourth learn against a different product deprecates P1's record and
        // creates a fresh active record for P2.
        let mut store = store;
        store
            .learn(
                "中华(软)",
                &pid("p2"),
                85.0,
                &template(),
                "reviewer-2",
                manual(),
                now + Duration::minutes(10),
            )
            .unwrap();
        assert_eq!(store.active_count("中华软盒", &template()), 1);
        let active = store
            .find_matching("中华软盒", &template(), 60.0, 10, false)
            .pop()
            .unwrap();
        assert_eq!(active.confirmed_product_id, pid("p2"));
        assert_eq!(active.confirm_count, 1);
        let deprecated: Vec<_> = store
            .records()
            .iter()
            .filter(|r| r.status == MemoryStatus::Deprecated)
            .collect();
        assert_eq!(deprecated.len(), 1);
        assert_eq!(deprecated[0].confirmed_product_id, pid("p1"));
    }

    #[test]
    fn test_uniqueness_after_any_learn_sequence() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        let products = ["p1", "p2", "p1", "p3", "p3", "p2"];
        for (i, p) in products.iter().enumerate() {
            store
                .learn(
                    "玉溪硬",
                    &pid(p),
                    80.0,
                    &template(),
                    "reviewer-1",
                    manual(),
                    now + Duration::minutes(i as i64),
                )
                .unwrap();
        }
        assert_eq!(store.active_count("玉溪硬盒", &template()), 1);
    }

    #[test]
    fn test_repeat_learn_from_same_task_only_bumps_usage() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        store
            .learn("中华(软)", &pid("p1"), 90.0, &template(), "a", manual_from("task-1"), now)
            .unwrap();
        store
            .learn(
                "中华(软)",
                &pid("p1"),
                90.0,
                &template(),
                "a",
                manual_from("task-1"),
                now + Duration::minutes(1),
            )
            .unwrap();
        let record = &store.records()[0];
        assert_eq!(record.confirm_count, 1);
        assert_eq!(record.usage_count, 1);

        // A different task counts as a real confirmation.
        let mut store = store;
        store
            .learn(
                "中华(软)",
                &pid("p1"),
                90.0,
                &template(),
                "a",
                manual_from("task-2"),
                now + Duration::minutes(2),
            )
            .unwrap();
        assert_eq!(store.records()[0].confirm_count, 2);
    }

    #[test]
    fn test_weight_never_exceeds_cap() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        for i in 0..200 {
            store
                .learn(
                    "中华(软)",
                    &pid("p1"),
                    90.0,
                    &template(),
                    "a",
                    manual(),
                    now + Duration::minutes(i),
                )
                .unwrap();
        }
        let record = &store.records()[0];
        assert_eq!(record.confirm_count, 200);
        assert!(record.weight <= WEIGHT_CAP);
    }

    #[test]
    fn test_reject_weakens_then_disputes() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        store
            .learn("中华(软)", &pid("p1"), 90.0, &template(), "a", manual(), now)
            .unwrap();

        for i in 0..2 {
            store.reject("中华(软)", &pid("p1"), &template(), "b", now + Duration::minutes(i));
        }
        let record = &store.records()[0];
        assert_eq!(record.status, MemoryStatus::Active);
        assert!(record.weight < 1.0 && record.weight >= WEIGHT_FLOOR);
        assert!(record.confidence >= CONFIDENCE_FLOOR_ON_REJECT);

        let mut store = store;
        store.reject("中华(软)", &pid("p1"), &template(), "b", now + Duration::minutes(3));
        let record = &store.records()[0];
        assert_eq!(record.status, MemoryStatus::Conflicted);
        // Disputed records leave the default lookup set.
        assert!(store
            .find_matching("中华软盒", &template(), 0.0, 10, false)
            .is_empty());
    }

    #[test]
    fn test_find_matching_tiers_and_ordering() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        store
            .learn("中华软盒", &pid("p1"), 90.0, &template(), "a", manual(), now)
            .unwrap();
        store
            .learn("中华软盒细支", &pid("p2"), 90.0, &template(), "a", manual_from("t-a"), now)
            .unwrap();
        store
            .learn(
                "中华软盒细支",
                &pid("p2"),
                90.0,
                &template(),
                "a",
                manual_from("t-b"),
                now + Duration::minutes(1),
            )
            .unwrap();

        // Exact tier wins even though the containment hit has more confirms.
        let exact = store.find_matching("中华软盒", &template(), 60.0, 10, false);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].confirmed_product_id, pid("p1"));

        // No exact record: containment tier, ordered by confirm count.
        let contains = store.find_matching("软盒细支", &template(), 60.0, 10, false);
        assert!(!contains.is_empty());
        assert_eq!(contains[0].confirmed_product_id, pid("p2"));
    }

    #[test]
    fn test_loosened_tier_requires_three_confirmations() {
        let mut store = MemoryStore::new();
        let now = Utc::now();
        for (i, task) in ["t-a", "t-b", "t-c"].iter().enumerate() {
            store
                .learn(
                    "黄鹤楼1916",
                    &pid("p1"),
                    45.0,
                    &template(),
                    "a",
                    manual_from(task),
                    now + Duration::minutes(i as i64),
                )
                .unwrap();
        }
        // Confidence 45 misses a floor of 70 in both strict tiers, but the
        // loosened pass accepts a record with three confirmations.
        let hits = store.find_matching("黄鹤楼1916", &template(), 70.0, 10, false);
        assert_eq!(hits.len(), 1);

        // With a floor at or below 40 the loosened pass never engages.
        let mut weak = MemoryStore::new();
        weak.learn("红塔山", &pid("p2"), 35.0, &template(), "a", manual(), now)
            .unwrap();
        assert!(weak.find_matching("红塔山", &template(), 40.0, 10, false).is_empty());
    }

    #[test]
    fn test_cleanup_duplicates_keeps_highest_priority() {
        let now = Utc::now();
        let mut store = MemoryStore::new();
        store
            .learn("中华软盒", &pid("p1"), 80.0, &template(), "a", manual(), now - Duration::days(2))
            .unwrap();
        store
            .learn("中华软盒", &pid("p2"), 95.0, &template(), "a", manual(), now)
            .unwrap();
        // Force a duplicate active pair, as legacy data or a write race would.
        {
            let records: Vec<MemoryRecord> = store
                .records()
                .iter()
                .cloned()
                .map(|mut r| {
                    r.status = MemoryStatus::Active;
                    r
                })
                .collect();
            store = MemoryStore::from_records(records);
        }
        assert_eq!(store.active_count("中华软盒", &template()), 2);

        let deprecated = store.cleanup_duplicates(Some(&template()), "system", now);
        assert_eq!(deprecated, 1);
        assert_eq!(store.active_count("中华软盒", &template()), 1);
        let survivor = store
            .find_matching("中华软盒", &template(), 0.0, 10, false)
            .pop()
            .unwrap();
        // Most recently confirmed record wins.
        assert_eq!(survivor.confirmed_product_id, pid("p2"));
    }

    #[test]
    fn test_learn_rejects_empty_name() {
        let mut store = MemoryStore::new();
        assert!(store
            .learn("()", &pid("p1"), 90.0, &template(), "a", manual(), Utc::now())
            .is_err());
    }
}
