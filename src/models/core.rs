// src/models/core.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Newtype pattern for type safety to prevent mixing different ID types

/// Strongly typed identifier for catalog products
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

/// Strongly typed identifier for catalog templates (catalog partitions)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

/// Strongly typed identifier for matching tasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

/// Strongly typed identifier for matching records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

//------------------------------------------------------------------------------
// CORE DOMAIN MODELS
//------------------------------------------------------------------------------

/// One free-text row from a wholesale batch.
///
/// Ephemeral: created per batch row and owned by the task runner for the
/// duration of processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WholesaleLineItem {
    /// Human-entered product description (required)
    pub name: String,

    /// Wholesale unit price, when the row carried one
    pub price: Option<f64>,

    #[serde(default = "default_quantity")]
    pub quantity: i32,

    pub unit: Option<String>,

    pub supplier: Option<String>,

    /// Raw row payload as received from the ingestion layer
    #[serde(default)]
    pub raw: serde_json::Value,
}

fn default_quantity() -> i32 {
    1
}

/// A curated catalog product.
///
/// Immutable during a matching pass; loaded once per task as a read-only
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: ProductId,
    pub name: String,
    pub brand: Option<String>,
    pub template_id: TemplateId,
    pub wholesale_price: Option<f64>,
    pub retail_price: Option<f64>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

//------------------------------------------------------------------------------
// LEARNED MEMORY
//------------------------------------------------------------------------------

/// Lifecycle status of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Active,
    Deprecated,
    Conflicted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Conflicted => "conflicted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "deprecated" => Self::Deprecated,
            "conflicted" => Self::Conflicted,
            _ => Self::Active,
        }
    }
}

/// How a learn event originated. Manual learns are weighted higher than
/// bulk/automatic ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnSource {
    Manual,
    Auto,
    Bulk,
}

impl LearnSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Bulk => "bulk",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "auto" => Self::Auto,
            "bulk" => Self::Bulk,
            _ => Self::Manual,
        }
    }

    /// Starting weight for a freshly learned record.
    pub fn initial_weight(&self) -> f64 {
        match self {
            Self::Manual => 1.0,
            Self::Auto => 0.8,
            Self::Bulk => 0.6,
        }
    }
}

/// Attribution for a learn/reject call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnProvenance {
    pub source: LearnSource,
    pub task_id: Option<TaskId>,
    pub record_id: Option<RecordId>,
}

/// A conflict noted against a memory record (e.g. a human rejection of the
/// binding it encodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConflict {
    pub rejected_product_id: ProductId,
    pub actor_id: String,
    pub noted_at: DateTime<Utc>,
}

/// One entry in a memory record's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor_id: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Confirmed,
    UsageBump,
    Rejected,
    Deprecated,
    Disputed,
}

/// A learned, persisted association between a wholesale name and a catalog
/// product, scoped to one catalog template.
///
/// Invariant: at most one `active` record exists per
/// `(normalized_name, template_id)` pair. The database enforces this with a
/// partial unique index; in-memory mutation preserves it by deprecating the
/// previous binding before creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub normalized_name: String,
    pub original_name: String,
    pub confirmed_product_id: ProductId,
    pub template_id: TemplateId,

    /// Base confidence, 0-100
    pub confidence: f64,

    /// Number of distinct confirmations (>= 1)
    pub confirm_count: i32,

    /// Times this record was consumed during automated matching
    pub usage_count: i64,

    /// Multiplier in [0.1, 10.0], default 1.0
    pub weight: f64,

    pub status: MemoryStatus,
    pub is_user_preference: bool,
    pub source: LearnSource,
    pub source_task_id: Option<TaskId>,

    pub conflicts: Vec<MemoryConflict>,
    pub audit_trail: Vec<AuditEntry>,

    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const WEIGHT_FLOOR: f64 = 0.1;
pub const WEIGHT_CAP: f64 = 10.0;
pub const CONFIDENCE_FLOOR_ON_REJECT: f64 = 30.0;

impl MemoryRecord {
    /// Derived trust score in [0, 100]: base confidence plus a confirmation
    /// bonus (capped at 25), minus time decay (capped at 20, kicking in after
    /// 30 days without confirmation), plus a weight contribution.
    pub fn trust_score(&self, now: DateTime<Utc>) -> f64 {
        let days_since = (now - self.last_confirmed_at).num_days();
        let decay = if days_since > 30 {
            (((days_since - 30) / 10) as f64).min(20.0)
        } else {
            0.0
        };
        let confirm_bonus = ((self.confirm_count as f64) * 5.0).min(25.0);
        let weight_bonus = (self.weight - 1.0) * 10.0;
        (self.confidence + confirm_bonus - decay + weight_bonus).clamp(0.0, 100.0)
    }

    pub fn is_high_trust(&self, now: DateTime<Utc>) -> bool {
        self.trust_score(now) >= 85.0 && self.confirm_count >= 2
    }

    pub fn push_audit(&mut self, action: AuditAction, actor_id: &str, detail: String, at: DateTime<Utc>) {
        self.audit_trail.push(AuditEntry {
            action,
            actor_id: actor_id.to_string(),
            detail,
            at,
        });
    }
}
