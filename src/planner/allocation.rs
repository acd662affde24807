//! Allocation algorithm
//!
//! Prefers a single owner per file (first sufficient candidate in
//! descending-remaining order, not the tightest fit). Falls back to a greedy
//! split across candidates when nobody can hold the whole file.

use super::PlanError;
use crate::ledger::Member;

use serde::{Deserialize, Serialize};

/// One member's share of a planned file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub user_id: String,
    pub size_bytes: u64,
}

/// Ordered list of (member, size) pairs. Entry order is chunk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub requested_bytes: u64,
    pub entries: Vec<PlanEntry>,
}

impl AllocationPlan {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn is_single_owner(&self) -> bool {
        self.entries.len() == 1
    }

    /// `(offset, entry)` pairs, offsets prefix-summed in plan order
    pub fn with_offsets(&self) -> Vec<(u64, &PlanEntry)> {
        let mut offset = 0u64;
        self.entries
            .iter()
            .map(|entry| {
                let start = offset;
                offset += entry.size_bytes;
                (start, entry)
            })
            .collect()
    }
}

pub struct ChunkPlanner;

impl ChunkPlanner {
    /// Plan how `requested` bytes are split across `members`.
    ///
    /// `members` must be in stable enumeration order (join order); it breaks
    /// ties between members with equal remaining quota.
    pub fn plan(members: &[Member], requested: u64) -> Result<AllocationPlan, PlanError> {
        if requested == 0 {
            return Err(PlanError::EmptyRequest);
        }

        let mut candidates: Vec<(&Member, u64)> = members
            .iter()
            .map(|m| (m, m.remaining()))
            .filter(|(_, free)| *free > 0)
            .collect();

        if candidates.is_empty() {
            return Err(PlanError::NoCapacity);
        }

        // sort_by is stable
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        if let Some((member, _)) = candidates.iter().find(|(_, free)| *free >= requested) {
            return Ok(AllocationPlan {
                requested_bytes: requested,
                entries: vec![PlanEntry {
                    user_id: member.user_id.clone(),
                    size_bytes: requested,
                }],
            });
        }

        let available = candidates
            .iter()
            .fold(0u64, |acc, (_, free)| acc.saturating_add(*free));
        if available < requested {
            return Err(PlanError::InsufficientPooledCapacity {
                requested,
                available,
            });
        }

        let mut still_needed = requested;
        let mut entries = Vec::new();
        for (member, free) in candidates {
            if still_needed == 0 {
                break;
            }

            let take = free.min(still_needed);
            entries.push(PlanEntry {
                user_id: member.user_id.clone(),
                size_bytes: take,
            });
            still_needed -= take;
        }

        let plan = AllocationPlan {
            requested_bytes: requested,
            entries,
        };

        let planned = plan.total_bytes();
        if planned != requested {
            return Err(PlanError::PlanIntegrity { requested, planned });
        }

        Ok(plan)
    }
}
