// src/utils/constants.rs

/// Records flushed per batch write during the automated pass.
pub const BATCH_DB_OPS_SIZE: usize = 200;

/// Items processed between task-progress writes.
pub const PROGRESS_FLUSH_EVERY: usize = 50;
