// src/matching/scorer.rs
//
// Rule-cascade similarity scorer between a wholesale line item and a catalog
// entry. The first matching rule decides the base name score; a price
// proximity adjustment is then applied to non-exact, non-conflict outcomes
// and the total is clipped to [0, 100].

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use strsim::normalized_levenshtein;

use crate::matching::normalize::deep_normalize;
use crate::models::core::{CatalogEntry, WholesaleLineItem};
use crate::models::matching::{ConfidenceTier, MatchReason, ScoreBreakdown};

/// Closed set of packaging/specification tokens (post-deep-normalization
/// forms, so the short 硬/软 variants never appear here).
const SPEC_TOKENS: [&str; 8] = [
    "硬盒", "软盒", "细支", "中支", "粗支", "短支", "爆珠", "双爆",
];

/// Maximal runs of two or more CJK ideographs, used as match keywords.
static CJK_KEYWORD_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\p{Han}{2,}").expect("invalid keyword regex"));

/// Threshold/weight profile for the scorer. The default follows the
/// aggressive name-first strategy; alternative profiles are data, not code.
#[derive(Debug, Clone)]
pub struct ScoreProfile {
    pub high_tier: i32,
    pub medium_tier: i32,
    pub brand_conflict_score: i32,
    /// Candidates below this never surface
    pub min_candidate_score: i32,
    /// Cap applied when only specification tokens differ across brands
    pub spec_only_cap: i32,
    pub levenshtein_weight: f64,
    pub jaccard_weight: f64,
}

impl ScoreProfile {
    pub fn aggressive() -> Self {
        Self {
            high_tier: 80,
            medium_tier: 60,
            brand_conflict_score: 15,
            min_candidate_score: 30,
            spec_only_cap: 50,
            levenshtein_weight: 0.7,
            jaccard_weight: 0.3,
        }
    }

    /// Older multi-field weighted variant, kept as a profile for comparison
    /// runs. Not the production default.
    pub fn legacy_weighted() -> Self {
        Self {
            high_tier: 85,
            medium_tier: 65,
            brand_conflict_score: 20,
            min_candidate_score: 40,
            spec_only_cap: 55,
            levenshtein_weight: 0.5,
            jaccard_weight: 0.5,
        }
    }

    pub fn tier_for(&self, total: i32) -> ConfidenceTier {
        if total >= self.high_tier {
            ConfidenceTier::High
        } else if total >= self.medium_tier {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

impl Default for ScoreProfile {
    fn default() -> Self {
        Self::aggressive()
    }
}

/// Scorer output for one pair, before ranking.
#[derive(Debug, Clone)]
pub struct ScoredPair {
    pub breakdown: ScoreBreakdown,
    pub tier: ConfidenceTier,
    pub reasons: Vec<MatchReason>,
}

/// Finds the longest brand from `brand_set` contained in a normalized name.
pub fn detect_brand(normalized: &str, brand_set: &HashSet<String>) -> Option<String> {
    brand_set
        .iter()
        .filter(|brand| !brand.is_empty() && normalized.contains(brand.as_str()))
        .max_by_key(|brand| brand.chars().count())
        .cloned()
}

/// Weighted blend of normalized Levenshtein similarity and character-set
/// Jaccard, in [0, 1]. Shared with the binding conflict detector.
pub fn combined_similarity(a: &str, b: &str) -> f64 {
    combined_similarity_weighted(a, b, 0.7, 0.3)
}

fn combined_similarity_weighted(a: &str, b: &str, lev_weight: f64, jac_weight: f64) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    lev_weight * normalized_levenshtein(a, b) + jac_weight * char_jaccard(a, b)
}

fn char_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn strip_all(s: &str, token: &str) -> String {
    s.replace(token, "")
}

fn strip_spec_tokens(s: &str) -> String {
    let mut out = s.to_string();
    for token in SPEC_TOKENS {
        out = strip_all(&out, token);
    }
    out
}

fn cjk_keyword_runs(s: &str) -> HashSet<String> {
    CJK_KEYWORD_RUN
        .find_iter(s)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn keyword_jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Any shared 2-gram between the shorter and the longer string.
fn has_partial_containment(shorter: &str, longer: &str) -> bool {
    let chars: Vec<char> = shorter.chars().collect();
    if chars.len() < 2 {
        return false;
    }
    chars
        .windows(2)
        .any(|w| longer.contains(&w.iter().collect::<String>()))
}

/// Relative/absolute price proximity adjustment in [-10, +10]. No price on
/// either side means no adjustment.
pub fn price_adjustment(wholesale: Option<f64>, catalog: Option<f64>) -> i32 {
    let (a, b) = match (wholesale, catalog) {
        (Some(a), Some(b)) if a > 0.0 && b > 0.0 => (a, b),
        _ => return 0,
    };
    let gap = (a - b).abs();
    if gap < 0.5 {
        return 10;
    }
    let relative = gap / a.max(b);
    if relative <= 0.05 {
        10
    } else if relative <= 0.15 {
        5
    } else if relative <= 0.30 {
        0
    } else if relative <= 0.50 {
        -5
    } else {
        -10
    }
}

/// Scores one (wholesale item, catalog entry) pair against the given brand
/// set and profile.
pub fn score(
    item: &WholesaleLineItem,
    entry: &CatalogEntry,
    brand_set: &HashSet<String>,
    profile: &ScoreProfile,
) -> ScoredPair {
    let a = deep_normalize(&item.name);
    let b = deep_normalize(&entry.name);

    if a.is_empty() || b.is_empty() {
        return ScoredPair {
            breakdown: ScoreBreakdown::zero(),
            tier: ConfidenceTier::Low,
            reasons: Vec::new(),
        };
    }

    let brand_a = detect_brand(&a, brand_set);
    let brand_b = detect_brand(&b, brand_set).or_else(|| {
        entry
            .brand
            .as_deref()
            .map(deep_normalize)
            .filter(|s| !s.is_empty())
    });

    // Informational dimensions, computed regardless of which rule decides.
    let mut keywords_b = cjk_keyword_runs(&b);
    for kw in &entry.keywords {
        let normalized = deep_normalize(kw);
        if char_len(&normalized) >= 2 {
            keywords_b.insert(normalized);
        }
    }
    let keywords_a = cjk_keyword_runs(&a);
    let kw_jaccard = keyword_jaccard(&keywords_a, &keywords_b);
    let keyword_score = (kw_jaccard * 100.0).round() as i32;

    let spec_a: HashSet<&str> = SPEC_TOKENS.iter().copied().filter(|t| a.contains(*t)).collect();
    let spec_b: HashSet<&str> = SPEC_TOKENS.iter().copied().filter(|t| b.contains(*t)).collect();
    let package_score = if spec_a.is_empty() && spec_b.is_empty() {
        100
    } else {
        let inter = spec_a.intersection(&spec_b).count();
        let union = spec_a.union(&spec_b).count();
        ((inter as f64 / union as f64) * 100.0).round() as i32
    };

    let brand_score = match (&brand_a, &brand_b) {
        (Some(x), Some(y)) if x == y => 100,
        (Some(_), Some(_)) => 0,
        _ => 50,
    };

    let mut reasons = Vec::new();

    // Rule 1: brand-conflict guard dominates any textual similarity.
    if let (Some(ba), Some(bb)) = (&brand_a, &brand_b) {
        if ba != bb {
            reasons.push(MatchReason::BrandConflict {
                wholesale_brand: ba.clone(),
                catalog_brand: bb.clone(),
            });
            let total = profile.brand_conflict_score;
            return ScoredPair {
                breakdown: ScoreBreakdown {
                    name: total,
                    brand: 0,
                    keywords: keyword_score,
                    package: package_score,
                    price: 0,
                    total,
                },
                tier: profile.tier_for(total),
                reasons,
            };
        }
    }

    // Rule 2: exact match post-normalization.
    if a == b {
        reasons.push(MatchReason::ExactMatch);
        return finish(100, 0, brand_score, keyword_score, package_score, profile, reasons);
    }

    // Brand-stripped forms for the remaining rules. An empty remainder means
    // the name was the brand alone; keep the full form in that case.
    let a1 = strip_for_compare(&a, brand_a.as_deref());
    let b1 = strip_for_compare(&b, brand_b.as_deref());

    // Rule 3: exact match after brand removal.
    if a1 == b1 {
        reasons.push(MatchReason::ExactAfterBrandStrip);
        return finish(98, 0, brand_score, keyword_score, package_score, profile, reasons);
    }

    let price_adj = price_adjustment(item.price, entry.wholesale_price.or(entry.retail_price));

    // Rule 4: specification-only-match guard. If stripping packaging tokens
    // leaves almost nothing on either side and the remainders differ, the
    // textual similarity is spec-driven; across brands that is capped.
    let core_a = strip_spec_tokens(&a1);
    let core_b = strip_spec_tokens(&b1);
    if core_a != core_b && (char_len(&core_a) <= 2 || char_len(&core_b) <= 2) && brand_a != brand_b
    {
        let similarity = combined_similarity_weighted(
            &a1,
            &b1,
            profile.levenshtein_weight,
            profile.jaccard_weight,
        );
        let capped = ((similarity * 100.0).round() as i32).min(profile.spec_only_cap);
        reasons.push(MatchReason::SpecOnlyMatch);
        return finish(capped, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }

    // Rule 5: tolerant match on reordered characters.
    let mut sorted_a: Vec<char> = a1.chars().collect();
    let mut sorted_b: Vec<char> = b1.chars().collect();
    sorted_a.sort_unstable();
    sorted_b.sort_unstable();
    if sorted_a == sorted_b {
        reasons.push(MatchReason::TolerantMatch);
        return finish(97, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }
    let len_a = char_len(&a1);
    let len_b = char_len(&b1);
    let contains = a1.contains(&b1) || b1.contains(&a1);
    if contains && len_a.abs_diff(len_b) <= 1 {
        reasons.push(MatchReason::TolerantMatch);
        return finish(95, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }

    // Rule 6: containment and keyword overlap.
    if contains {
        let ratio = len_a.min(len_b) as f64 / len_a.max(len_b).max(1) as f64;
        reasons.push(MatchReason::Containment { ratio });
        let base = (80.0 + 15.0 * ratio).round() as i32;
        return finish(base, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }
    let (shorter, longer) = if len_a <= len_b { (&a1, &b1) } else { (&b1, &a1) };
    if char_len(shorter) >= 2 && has_partial_containment(shorter, longer) {
        reasons.push(MatchReason::Containment { ratio: 0.0 });
        return finish(75, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }
    if kw_jaccard > 0.0 {
        reasons.push(MatchReason::KeywordOverlap { jaccard: kw_jaccard });
        let base = (60.0 + 25.0 * kw_jaccard).round() as i32;
        return finish(base, price_adj, brand_score, keyword_score, package_score, profile, reasons);
    }

    // Rule 7: fallback combined similarity with a flat bonus near the top.
    let combined = combined_similarity_weighted(
        &a1,
        &b1,
        profile.levenshtein_weight,
        profile.jaccard_weight,
    );
    let bonus = if combined > 0.9 {
        10
    } else if combined > 0.8 {
        5
    } else {
        0
    };
    let base = (combined * 100.0).round() as i32 + bonus;
    reasons.push(MatchReason::FuzzySimilarity { combined });
    finish(base, price_adj, brand_score, keyword_score, package_score, profile, reasons)
}

fn strip_for_compare(normalized: &str, brand: Option<&str>) -> String {
    match brand {
        Some(brand) => {
            let stripped = strip_all(normalized, brand);
            if stripped.is_empty() {
                normalized.to_string()
            } else {
                stripped
            }
        }
        None => normalized.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    base: i32,
    price_adj: i32,
    brand_score: i32,
    keyword_score: i32,
    package_score: i32,
    profile: &ScoreProfile,
    mut reasons: Vec<MatchReason>,
) -> ScoredPair {
    if price_adj != 0 {
        reasons.push(MatchReason::PriceProximity { adjustment: price_adj });
    }
    let total = (base + price_adj).clamp(0, 100);
    ScoredPair {
        breakdown: ScoreBreakdown {
            name: base.clamp(0, 100),
            brand: brand_score,
            keywords: keyword_score,
            package: package_score,
            price: price_adj,
            total,
        },
        tier: profile.tier_for(total),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::{ProductId, TemplateId};

    fn item(name: &str, price: Option<f64>) -> WholesaleLineItem {
        WholesaleLineItem {
            name: name.to_string(),
            price,
            quantity: 1,
            unit: None,
            supplier: None,
            raw: serde_json::Value::Null,
        }
    }

    fn entry(name: &str, brand: Option<&str>, price: Option<f64>) -> CatalogEntry {
        CatalogEntry {
            id: ProductId(format!("p-{}", name)),
            name: name.to_string(),
            brand: brand.map(|s| s.to_string()),
            template_id: TemplateId("t1".to_string()),
            wholesale_price: price,
            retail_price: None,
            keywords: Vec::new(),
        }
    }

    fn brands(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| deep_normalize(s)).collect()
    }

    #[test]
    fn test_same_brand_packaging_variant_scores_high() {
        // "中华(软)" deep-normalizes to the same form as "中华(软盒)"
        let profile = ScoreProfile::default();
        let scored = score(
            &item("中华(软)", None),
            &entry("中华(软盒)", Some("中华"), None),
            &brands(&["中华", "玉溪"]),
            &profile,
        );
        assert!(scored.breakdown.total >= 90);
        assert_eq!(scored.tier, ConfidenceTier::High);
    }

    #[test]
    fn test_brand_conflict_dominates_similarity() {
        let profile = ScoreProfile::default();
        let scored = score(
            &item("玉溪硬", None),
            &entry("中华硬盒", Some("中华"), None),
            &brands(&["中华", "玉溪"]),
            &profile,
        );
        assert_eq!(scored.breakdown.total, 15);
        assert_eq!(scored.tier, ConfidenceTier::Low);
        assert!(matches!(scored.reasons[0], MatchReason::BrandConflict { .. }));
    }

    #[test]
    fn test_exact_after_brand_removal() {
        let profile = ScoreProfile::default();
        let scored = score(
            &item("中华硬盒", None),
            &entry("硬盒", Some("中华"), None),
            &brands(&["中华"]),
            &profile,
        );
        assert_eq!(scored.breakdown.total, 98);
        assert!(scored.reasons.contains(&MatchReason::ExactAfterBrandStrip));
    }

    #[test]
    fn test_tolerant_match_on_reordered_characters() {
        let profile = ScoreProfile::default();
        let scored = score(
            &item("硬盒玉溪", None),
            &entry("玉溪硬盒", None, None),
            &HashSet::new(),
            &profile,
        );
        assert_eq!(scored.breakdown.total, 97);
    }

    #[test]
    fn test_containment_scales_with_length_ratio() {
        let profile = ScoreProfile::default();
        let scored = score(
            &item("黄鹤楼1916", None),
            &entry("黄鹤楼1916豪华版", None, None),
            &HashSet::new(),
            &profile,
        );
        assert!(scored.breakdown.total >= 80 && scored.breakdown.total <= 95);
        assert!(matches!(scored.reasons[0], MatchReason::Containment { .. }));
    }

    #[test]
    fn test_spec_only_match_capped_across_brands() {
        let profile = ScoreProfile::default();
        // After stripping the brand and packaging tokens the wholesale side is
        // empty; the catalog side differs, so containment must not fire.
        let scored = score(
            &item("玉溪细支", None),
            &entry("1916细支", None, None),
            &brands(&["玉溪"]),
            &profile,
        );
        assert!(scored.breakdown.total <= profile.spec_only_cap);
        assert!(scored.reasons.contains(&MatchReason::SpecOnlyMatch));
    }

    #[test]
    fn test_price_adjustment_bands() {
        assert_eq!(price_adjustment(None, Some(10.0)), 0);
        assert_eq!(price_adjustment(Some(10.0), None), 0);
        assert_eq!(price_adjustment(Some(100.0), Some(100.2)), 10);
        assert_eq!(price_adjustment(Some(100.0), Some(96.0)), 10);
        assert_eq!(price_adjustment(Some(100.0), Some(90.0)), 5);
        assert_eq!(price_adjustment(Some(100.0), Some(75.0)), 0);
        assert_eq!(price_adjustment(Some(100.0), Some(60.0)), -5);
        assert_eq!(price_adjustment(Some(100.0), Some(20.0)), -10);
    }

    #[test]
    fn test_score_bounded_for_assorted_pairs() {
        let profile = ScoreProfile::default();
        let brand_set = brands(&["中华", "玉溪", "黄鹤楼"]);
        let items = [
            item("中华(软)", Some(650.0)),
            item("玉溪硬", Some(0.01)),
            item("???", None),
            item("", None),
            item("xx", Some(1e9)),
        ];
        let entries = [
            entry("中华(软盒)", Some("中华"), Some(640.0)),
            entry("玉溪硬盒", Some("玉溪"), Some(230.0)),
            entry("黄鹤楼1916", None, Some(1.0)),
        ];
        for it in &items {
            for en in &entries {
                let scored = score(it, en, &brand_set, &profile);
                assert!(
                    (0..=100).contains(&scored.breakdown.total),
                    "total out of range for {:?} vs {:?}",
                    it.name,
                    en.name
                );
            }
        }
    }

    #[test]
    fn test_combined_similarity_bounds() {
        assert_eq!(combined_similarity("", ""), 1.0);
        assert_eq!(combined_similarity("abc", ""), 0.0);
        let sim = combined_similarity("中华软盒", "中华软盒");
        assert!((sim - 1.0).abs() < 1e-9);
    }
}
