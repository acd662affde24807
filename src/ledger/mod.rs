//! Quota Ledger - per-member allocated/used byte counters
//!
//! Each trip member contributes an `allocated_bytes` ceiling to the trip's pool.
//! Chunks charged to a member count against it through `used_bytes`.

mod quota;

pub use quota::{Member, ReleasePolicy, Released, TripQuotaSummary};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Release of {release} bytes exceeds usage of {used} bytes for member {user_id}")]
    ReleaseUnderflow {
        user_id: String,
        used: u64,
        release: u64,
    },
}
