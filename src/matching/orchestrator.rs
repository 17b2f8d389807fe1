// src/matching/orchestrator.rs
//
// Produces the ranked candidate list for one line item: learned memory
// associations first, then the similarity scorer over the remaining catalog.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::matching::normalize::deep_normalize;
use crate::matching::scorer::{score, ScoreProfile};
use crate::memory::store::MemoryStore;
use crate::models::core::{CatalogEntry, ProductId, TemplateId, WholesaleLineItem};
use crate::models::matching::{
    ConfidenceTier, MatchCandidate, MatchReason, MemorySource, ScoreBreakdown,
};

/// Memory lookups only consider records at or above this confidence.
pub const MEMORY_MIN_CONFIDENCE: f64 = 60.0;
/// Memory hits consulted per line item.
pub const MEMORY_LOOKUP_LIMIT: usize = 5;
/// Ranked candidates kept per line item.
pub const MAX_CANDIDATES: usize = 10;

/// Matches one line item against the catalog snapshot, memory first.
pub fn match_line_item(
    item: &WholesaleLineItem,
    catalog: &[CatalogEntry],
    brand_set: &HashSet<String>,
    memory: &MemoryStore,
    template_id: &TemplateId,
    profile: &ScoreProfile,
    now: DateTime<Utc>,
) -> Vec<MatchCandidate> {
    let normalized = deep_normalize(&item.name);
    if normalized.is_empty() {
        return Vec::new();
    }

    let catalog_ids: HashMap<&ProductId, &CatalogEntry> =
        catalog.iter().map(|e| (&e.id, e)).collect();

    let mut memory_candidates: Vec<MatchCandidate> = Vec::new();
    let mut covered: HashSet<ProductId> = HashSet::new();

    for record in memory.find_matching(
        &normalized,
        template_id,
        MEMORY_MIN_CONFIDENCE,
        MEMORY_LOOKUP_LIMIT,
        false,
    ) {
        // Memory may reference products no longer in the active catalog.
        if !catalog_ids.contains_key(&record.confirmed_product_id) {
            debug!(
                "Memory hit {} references product {} outside the catalog snapshot; skipped",
                record.id, record.confirmed_product_id.0
            );
            continue;
        }
        let trust = record.trust_score(now);
        let boosted = (trust + f64::from((record.confirm_count * 3).min(20)) + 15.0)
            .max(80.0)
            .min(100.0)
            .round() as i32;
        covered.insert(record.confirmed_product_id.clone());
        memory_candidates.push(MatchCandidate {
            product_id: record.confirmed_product_id.clone(),
            score: ScoreBreakdown {
                name: boosted,
                brand: 100,
                keywords: 0,
                package: 0,
                price: 0,
                total: boosted,
            },
            tier: ConfidenceTier::High,
            reasons: vec![MatchReason::MemoryHit {
                confirm_count: record.confirm_count,
            }],
            rank: 0,
            is_memory_match: true,
            memory_source: Some(MemorySource {
                memory_id: record.id.clone(),
                confirm_count: record.confirm_count,
                trust_score: trust,
                is_high_trust: record.is_high_trust(now),
            }),
        });
    }

    let mut scored_candidates: Vec<MatchCandidate> = Vec::new();
    for entry in catalog {
        if covered.contains(&entry.id) {
            continue;
        }
        let scored = score(item, entry, brand_set, profile);
        // Brand-conflict candidates stay below the floor on purpose: a
        // reviewer should see that a similar-looking entry was held back.
        let brand_conflict = scored
            .reasons
            .iter()
            .any(|r| matches!(r, MatchReason::BrandConflict { .. }));
        if scored.breakdown.total < profile.min_candidate_score && !brand_conflict {
            continue;
        }
        scored_candidates.push(MatchCandidate {
            product_id: entry.id.clone(),
            score: scored.breakdown,
            tier: scored.tier,
            reasons: scored.reasons,
            rank: 0,
            is_memory_match: false,
            memory_source: None,
        });
    }

    memory_candidates.sort_by(|a, b| b.score.total.cmp(&a.score.total));
    scored_candidates.sort_by(|a, b| b.score.total.cmp(&a.score.total));

    let mut candidates = memory_candidates;
    candidates.extend(scored_candidates);
    candidates.truncate(MAX_CANDIDATES);
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = (i + 1) as i32;
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::{LearnProvenance, LearnSource};

    fn item(name: &str) -> WholesaleLineItem {
        WholesaleLineItem {
            name: name.to_string(),
            price: None,
            quantity: 1,
            unit: None,
            supplier: None,
            raw: serde_json::Value::Null,
        }
    }

    fn entry(id: &str, name: &str, brand: Option<&str>) -> CatalogEntry {
        CatalogEntry {
            id: ProductId(id.to_string()),
            name: name.to_string(),
            brand: brand.map(|s| s.to_string()),
            template_id: TemplateId("t1".to_string()),
            wholesale_price: None,
            retail_price: None,
            keywords: Vec::new(),
        }
    }

    fn template() -> TemplateId {
        TemplateId("t1".to_string())
    }

    fn learn_times(memory: &mut MemoryStore, name: &str, product: &str, times: usize) {
        let now = Utc::now();
        for i in 0..times {
            memory
                .learn(
                    name,
                    &ProductId(product.to_string()),
                    90.0,
                    &template(),
                    "reviewer",
                    LearnProvenance {
                        source: LearnSource::Manual,
                        task_id: Some(crate::models::core::TaskId(format!("task-{}", i))),
                        record_id: None,
                    },
                    now - chrono::Duration::minutes((times - i) as i64),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_memory_candidates_rank_first() {
        let catalog = vec![
            entry("p1", "中华软盒", Some("中华")),
            entry("p2", "中华硬盒", Some("中华")),
        ];
        let brand_set: HashSet<String> = ["中华".to_string()].into_iter().collect();
        let mut memory = MemoryStore::new();
        // Learn the "wrong-looking" product so ranking proves memory priority.
        learn_times(&mut memory, "中华(软)", "p2", 2);

        let candidates = match_line_item(
            &item("中华(软)"),
            &catalog,
            &brand_set,
            &memory,
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        assert!(!candidates.is_empty());
        assert!(candidates[0].is_memory_match);
        assert_eq!(candidates[0].product_id, ProductId("p2".to_string()));
        assert_eq!(candidates[0].rank, 1);
        // The algorithmic exact match still surfaces below the memory hit.
        assert!(candidates.iter().any(|c| c.product_id == ProductId("p1".to_string())));
    }

    #[test]
    fn test_memory_boost_is_bounded() {
        let catalog = vec![entry("p1", "中华软盒", Some("中华"))];
        let mut memory = MemoryStore::new();
        learn_times(&mut memory, "中华(软)", "p1", 8);

        let candidates = match_line_item(
            &item("中华(软)"),
            &catalog,
            &HashSet::new(),
            &memory,
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        let best = &candidates[0];
        assert!(best.is_memory_match);
        assert!(best.score.total >= 80 && best.score.total <= 100);
    }

    #[test]
    fn test_memory_hit_outside_catalog_snapshot_is_skipped() {
        let catalog = vec![entry("p1", "玉溪软盒", Some("玉溪"))];
        let mut memory = MemoryStore::new();
        learn_times(&mut memory, "中华(软)", "p-gone", 3);

        let candidates = match_line_item(
            &item("中华(软)"),
            &catalog,
            &HashSet::new(),
            &memory,
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        assert!(candidates.iter().all(|c| !c.is_memory_match));
    }

    #[test]
    fn test_no_candidates_below_floor() {
        let catalog = vec![entry("p1", "完全不同的产品", None)];
        let candidates = match_line_item(
            &item("abcd1234"),
            &catalog,
            &HashSet::new(),
            &MemoryStore::new(),
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_brand_conflict_candidate_survives_the_floor() {
        let catalog = vec![entry("p1", "中华硬盒", Some("中华"))];
        let brand_set: HashSet<String> = ["中华".to_string(), "玉溪".to_string()]
            .into_iter()
            .collect();
        let candidates = match_line_item(
            &item("玉溪硬"),
            &catalog,
            &brand_set,
            &MemoryStore::new(),
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score.total, 15);
        assert!(matches!(
            candidates[0].reasons[0],
            MatchReason::BrandConflict { .. }
        ));
    }

    #[test]
    fn test_candidate_list_truncated_and_ranked() {
        let catalog: Vec<CatalogEntry> = (0..20)
            .map(|i| entry(&format!("p{}", i), &format!("中华软盒{}号", i), None))
            .collect();
        let candidates = match_line_item(
            &item("中华软盒"),
            &catalog,
            &HashSet::new(),
            &MemoryStore::new(),
            &template(),
            &ScoreProfile::default(),
            Utc::now(),
        );
        assert!(candidates.len() <= MAX_CANDIDATES);
        for (i, c) in candidates.iter().enumerate() {
            assert_eq!(c.rank, (i + 1) as i32);
        }
        for pair in candidates.windows(2) {
            assert!(pair[0].score.total >= pair[1].score.total);
        }
    }
}
