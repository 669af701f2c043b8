pub mod agents;
pub mod breakdown;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod evidence;
pub mod lifecycle;
pub mod orchestrator;
pub mod store;
