pub mod notifier;
pub mod orchestrator;
pub mod pool;
pub mod store;
pub mod sweeper;
pub mod transform;
