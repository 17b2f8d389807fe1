// src/models/task.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::core::{TaskId, TemplateId};

/// Task lifecycle: pending -> processing -> {review | completed};
/// processing -> failed. Completed and failed are terminal for the automated
/// pass; review transitions to completed once manual review drains the
/// pending/exception items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Review,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "review" => Self::Review,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Per-task matching thresholds. Stored on the task row; falls back to
/// environment-level defaults when the submission omitted them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Minimum total score for a candidate to be routed to human review
    #[serde(default = "default_review_threshold")]
    pub review_threshold: i32,

    /// Minimum total score for unattended confirmation
    #[serde(default = "default_auto_confirm_threshold")]
    pub auto_confirm_threshold: i32,
}

fn default_review_threshold() -> i32 {
    60
}

fn default_auto_confirm_threshold() -> i32 {
    90
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            review_threshold: default_review_threshold(),
            auto_confirm_threshold: default_auto_confirm_threshold(),
        }
    }
}

/// Progress counters for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: i64,
    pub processed: i64,
    pub confirmed: i64,
    pub pending: i64,
    pub rejected: i64,
    pub exception: i64,
}

impl TaskProgress {
    /// Conservation invariant: every processed item landed in exactly one
    /// terminal bucket, and we never processed more than the batch held.
    pub fn is_conserved(&self) -> bool {
        self.confirmed + self.rejected + self.pending + self.exception == self.processed
            && self.processed <= self.total
    }

    pub fn has_open_items(&self) -> bool {
        self.pending > 0 || self.exception > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// confirmed / processed
    pub match_rate: f64,
    /// mean selected-match confidence over confirmed records
    pub avg_confidence: f64,
    pub duration_secs: f64,
}

/// A matching task over one uploaded batch of wholesale line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingTask {
    pub id: TaskId,
    pub template_id: TemplateId,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub progress: TaskProgress,
    pub statistics: Option<TaskStatistics>,
    /// Temporary input artifact removed after the automated pass
    pub source_file: Option<String>,
    pub error_message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
