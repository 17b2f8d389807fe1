pub mod db;
pub mod review;
pub mod runner;
