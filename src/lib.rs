//! IFC model filtering service
//!
//! Runs the CPU-heavy filtering of IFC engineering models as asynchronous
//! jobs: uploads become jobs, jobs run on a bounded worker pool with a
//! deadline, their state survives restarts through a JSON snapshot, and
//! optional callbacks announce completion.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
