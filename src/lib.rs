pub mod catalog;
pub mod matching;
pub mod memory;
pub mod models;
pub mod task;
pub mod utils;
