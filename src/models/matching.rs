// src/models/matching.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::core::{ProductId, TaskId, WholesaleLineItem};

//------------------------------------------------------------------------------
// SCORING
//------------------------------------------------------------------------------

/// Per-dimension score breakdown for one (line item, catalog entry) pair.
/// All dimensions are 0-100 except `price`, which is a signed adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub name: i32,
    pub brand: i32,
    pub keywords: i32,
    pub package: i32,
    pub price: i32,
    pub total: i32,
}

impl ScoreBreakdown {
    pub fn zero() -> Self {
        Self {
            name: 0,
            brand: 0,
            keywords: 0,
            package: 0,
            price: 0,
            total: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Typed, human-readable reason attached to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum MatchReason {
    BrandConflict { wholesale_brand: String, catalog_brand: String },
    ExactMatch,
    ExactAfterBrandStrip,
    SpecOnlyMatch,
    TolerantMatch,
    Containment { ratio: f64 },
    KeywordOverlap { jaccard: f64 },
    FuzzySimilarity { combined: f64 },
    PriceProximity { adjustment: i32 },
    MemoryHit { confirm_count: i32 },
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrandConflict { wholesale_brand, catalog_brand } => write!(
                f,
                "brand conflict: wholesale '{}' vs catalog '{}'",
                wholesale_brand, catalog_brand
            ),
            Self::ExactMatch => write!(f, "exact match after normalization"),
            Self::ExactAfterBrandStrip => write!(f, "exact match after brand removal"),
            Self::SpecOnlyMatch => write!(f, "only packaging/specification tokens match"),
            Self::TolerantMatch => write!(f, "tolerant match (reordered characters)"),
            Self::Containment { ratio } => {
                write!(f, "one name contains the other (length ratio {:.2})", ratio)
            }
            Self::KeywordOverlap { jaccard } => {
                write!(f, "keyword overlap (jaccard {:.2})", jaccard)
            }
            Self::FuzzySimilarity { combined } => {
                write!(f, "fuzzy similarity {:.2}", combined)
            }
            Self::PriceProximity { adjustment } => {
                write!(f, "price proximity adjustment {:+}", adjustment)
            }
            Self::MemoryHit { confirm_count } => {
                write!(f, "learned association confirmed {} time(s)", confirm_count)
            }
        }
    }
}

/// Provenance of a memory-backed candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySource {
    pub memory_id: String,
    pub confirm_count: i32,
    pub trust_score: f64,
    pub is_high_trust: bool,
}

/// One ranked match proposal for a line item. Created fresh per match call
/// and embedded into a MatchingRecord, never persisted standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub product_id: ProductId,
    pub score: ScoreBreakdown,
    pub tier: ConfidenceTier,
    pub reasons: Vec<MatchReason>,
    /// 1-based position after ranking
    pub rank: i32,
    pub is_memory_match: bool,
    pub memory_source: Option<MemorySource>,
}

//------------------------------------------------------------------------------
// MATCHING RECORDS
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Confirmed,
    Rejected,
    Exception,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Exception => "exception",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "confirmed" => Self::Confirmed,
            "rejected" => Self::Rejected,
            "exception" => Self::Exception,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Auto,
    Manual,
    Memory,
    Expert,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Memory => "memory",
            Self::Expert => "expert",
        }
    }
}

/// The chosen (or suggested) binding on a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedMatch {
    pub product_id: ProductId,
    pub confidence: i32,
    pub confirmed_by: Option<String>,
    pub match_type: MatchType,
    /// True while the binding is only a review suggestion, not a confirmation
    pub is_suggestion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    LowConfidence,
    NoCandidates,
    DuplicateName,
    ProcessingError,
    MissingName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub kind: ExceptionKind,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Confirm,
    Reject,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub action: ReviewAction,
    pub actor_id: String,
    pub product_id: Option<ProductId>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// One matching record per wholesale line item. Owned by its task
/// (cascade-deleted with it); mutated by the automated pass and by human
/// review actions afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingRecord {
    pub id: super::core::RecordId,
    pub task_id: TaskId,
    pub original: WholesaleLineItem,
    pub normalized_name: String,
    pub candidates: Vec<MatchCandidate>,
    pub selected: Option<SelectedMatch>,
    pub status: RecordStatus,
    pub exceptions: Vec<ExceptionEntry>,
    pub review_history: Vec<ReviewEntry>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
