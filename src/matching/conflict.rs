// src/matching/conflict.rs
//
// Decides whether binding a product to a new wholesale name conflicts with
// bindings already confirmed in the same task or anywhere in the system.

use std::collections::HashMap;

use crate::matching::scorer::combined_similarity;
use crate::models::core::ProductId;

/// Below this combined similarity (with no containment), a global binding to
/// the same product under a very different name is flagged.
const GLOBAL_CONFLICT_SIMILARITY: f64 = 0.30;

/// At or above this similarity the names are treated as spelling variants.
const GLOBAL_SAFE_SIMILARITY: f64 = 0.60;

#[derive(Debug, Default)]
pub struct ConflictDetector {
    /// Normalized names confirmed to each product within the current task.
    task_bindings: HashMap<ProductId, Vec<String>>,
    /// Most recently confirmed normalized name per product, system-wide,
    /// snapshotted at task start.
    global_bindings: HashMap<ProductId, String>,
}

impl ConflictDetector {
    pub fn new(global_bindings: HashMap<ProductId, String>) -> Self {
        Self {
            task_bindings: HashMap::new(),
            global_bindings,
        }
    }

    /// Registers a confirmation made during this task.
    pub fn record_confirmation(&mut self, product_id: &ProductId, normalized_name: &str) {
        self.task_bindings
            .entry(product_id.clone())
            .or_default()
            .push(normalized_name.to_string());
    }

    /// Task-scoped check first (strict: any differing name already bound to
    /// the product in this task is a conflict), then the lenient global check.
    pub fn has_binding_conflict(&self, product_id: &ProductId, candidate_name: &str) -> bool {
        if let Some(names) = self.task_bindings.get(product_id) {
            if names.iter().any(|bound| bound != candidate_name) {
                return true;
            }
            // An identical binding in this task is by definition consistent.
            if names.iter().any(|bound| bound == candidate_name) {
                return false;
            }
        }

        let Some(latest) = self.global_bindings.get(product_id) else {
            return false;
        };
        if latest == candidate_name
            || latest.contains(candidate_name)
            || candidate_name.contains(latest.as_str())
        {
            return false;
        }
        let similarity = combined_similarity(latest, candidate_name);
        if similarity >= GLOBAL_SAFE_SIMILARITY {
            return false;
        }
        // The band between the two thresholds is deliberately treated as
        // non-conflicting to avoid false positives on minor spelling variants.
        similarity < GLOBAL_CONFLICT_SIMILARITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProductId {
        ProductId(s.to_string())
    }

    #[test]
    fn test_task_scoped_conflict_on_differing_name() {
        let mut detector = ConflictDetector::new(HashMap::new());
        detector.record_confirmation(&pid("p1"), "中华软盒");
        assert!(detector.has_binding_conflict(&pid("p1"), "玉溪硬盒"));
        assert!(!detector.has_binding_conflict(&pid("p1"), "中华软盒"));
        assert!(!detector.has_binding_conflict(&pid("p2"), "玉溪硬盒"));
    }

    #[test]
    fn test_global_containment_is_not_a_conflict() {
        let mut global = HashMap::new();
        global.insert(pid("p1"), "中华软盒".to_string());
        let detector = ConflictDetector::new(global);
        assert!(!detector.has_binding_conflict(&pid("p1"), "中华软盒细支"));
        assert!(!detector.has_binding_conflict(&pid("p1"), "软盒"));
    }

    #[test]
    fn test_global_dissimilar_name_is_a_conflict() {
        let mut global = HashMap::new();
        global.insert(pid("p1"), "中华软盒".to_string());
        let detector = ConflictDetector::new(global);
        assert!(detector.has_binding_conflict(&pid("p1"), "abcd1234"));
    }

    #[test]
    fn test_replayed_confirmations_restore_strict_check() {
        // The global snapshot alone treats a same-product spelling variant as
        // safe; replaying the task's earlier confirmations (as a retried task
        // does at startup) brings back the strict task-scoped verdict.
        let mut global = HashMap::new();
        global.insert(pid("p1"), "中华软盒".to_string());

        let fresh = ConflictDetector::new(global.clone());
        assert!(!fresh.has_binding_conflict(&pid("p1"), "中华硬盒"));

        let mut replayed = ConflictDetector::new(global);
        replayed.record_confirmation(&pid("p1"), "中华软盒");
        assert!(replayed.has_binding_conflict(&pid("p1"), "中华硬盒"));
    }

    #[test]
    fn test_global_middle_band_is_lenient() {
        let mut global = HashMap::new();
        global.insert(pid("p1"), "中华软盒".to_string());
        let detector = ConflictDetector::new(global);
        // Shares half its characters: similar enough to pass as a variant.
        assert!(!detector.has_binding_conflict(&pid("p1"), "中华硬盒"));
    }
}
