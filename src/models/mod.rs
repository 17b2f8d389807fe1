pub mod core;
pub mod matching;
pub mod task;
