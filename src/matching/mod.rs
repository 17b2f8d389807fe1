pub mod conflict;
pub mod normalize;
pub mod orchestrator;
pub mod scorer;
