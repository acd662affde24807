//! Chunk Planner - splits a requested file size across members' free quota
//!
//! Pure and deterministic: the same quota snapshot always yields the same plan.

mod allocation;

pub use allocation::{AllocationPlan, ChunkPlanner, PlanEntry};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("No free storage available")]
    NoCapacity,

    #[error("Insufficient pooled storage: requested {requested} bytes, {available} bytes free")]
    InsufficientPooledCapacity { requested: u64, available: u64 },

    #[error("Plan integrity violated: requested {requested} bytes but planned {planned}")]
    PlanIntegrity { requested: u64, planned: u64 },

    #[error("Requested size must be greater than zero")]
    EmptyRequest,
}
