//! Member quota counters
//!
//! The ledger never validates a charge against `allocated_bytes`: callers
//! re-check capacity inside the same transaction before charging.

use super::LedgerError;
use serde::{Deserialize, Serialize};

/// What to do when a release would push `used_bytes` below zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Floor `used_bytes` at zero and log a warning
    #[default]
    Clamp,
    /// Refuse the release with `LedgerError::ReleaseUnderflow`
    Strict,
}

/// A trip member's share of the pooled quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Trip this membership belongs to
    pub trip_id: String,
    /// User ID of the member
    pub user_id: String,
    /// Join order within the trip, used as the stable enumeration order
    pub join_seq: u64,
    /// Quota ceiling contributed by this member
    pub allocated_bytes: u64,
    /// Bytes of chunks currently charged to this member
    pub used_bytes: u64,
    /// Provider of the member's linked cloud account (e.g. `google_drive`)
    pub provider: Option<String>,
}

/// Outcome of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Bytes actually subtracted from `used_bytes`
    pub bytes: u64,
    /// True if the requested amount exceeded usage and was floored at zero
    pub clamped: bool,
}

impl Member {
    pub fn new(trip_id: impl Into<String>, user_id: impl Into<String>, allocated_bytes: u64) -> Self {
        Self {
            trip_id: trip_id.into(),
            user_id: user_id.into(),
            join_seq: 0,
            allocated_bytes,
            used_bytes: 0,
            provider: None,
        }
    }

    /// Free quota, zero when usage meets or exceeds the allocation
    pub fn remaining(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.used_bytes)
    }

    pub fn has_capacity(&self) -> bool {
        self.remaining() > 0
    }

    /// Charge `bytes` against this member
    pub fn charge(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }

    /// Release `bytes` previously charged to this member
    pub fn release(&mut self, bytes: u64, policy: ReleasePolicy) -> Result<Released, LedgerError> {
        if bytes <= self.used_bytes {
            self.used_bytes -= bytes;
            return Ok(Released {
                bytes,
                clamped: false,
            });
        }

        match policy {
            ReleasePolicy::Clamp => {
                let released = self.used_bytes;
                tracing::warn!(
                    "Clamping release for member {} of trip {}: releasing {} bytes but only {} in use",
                    self.user_id,
                    self.trip_id,
                    bytes,
                    released
                );
                self.used_bytes = 0;
                Ok(Released {
                    bytes: released,
                    clamped: true,
                })
            }
            ReleasePolicy::Strict => Err(LedgerError::ReleaseUnderflow {
                user_id: self.user_id.clone(),
                used: self.used_bytes,
                release: bytes,
            }),
        }
    }

    /// Usage as percentage of allocation (0-100)
    pub fn usage_percentage(&self) -> f64 {
        if self.allocated_bytes == 0 {
            return 100.0;
        }

        (self.used_bytes as f64 / self.allocated_bytes as f64 * 100.0).min(100.0)
    }
}

/// Pool-wide quota figures for a trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripQuotaSummary {
    pub trip_id: String,
    pub member_count: u64,
    pub total_allocated: u64,
    pub total_used: u64,
    /// Sum of every member's remaining quota
    pub total_free: u64,
    /// Largest file that fits on a single member
    pub largest_free_slot: u64,
    pub usage_percentage: f64,
}

impl TripQuotaSummary {
    pub fn from_members(trip_id: &str, members: &[Member]) -> Self {
        let mut total_allocated = 0u64;
        let mut total_used = 0u64;
        let mut total_free = 0u64;
        let mut largest_free_slot = 0u64;

        for member in members {
            total_allocated = total_allocated.saturating_add(member.allocated_bytes);
            total_used = total_used.saturating_add(member.used_bytes);
            total_free = total_free.saturating_add(member.remaining());
            largest_free_slot = largest_free_slot.max(member.remaining());
        }

        let usage_percentage = if total_allocated == 0 {
            0.0
        } else {
            (total_used as f64 / total_allocated as f64 * 100.0).min(100.0)
        };

        Self {
            trip_id: trip_id.to_string(),
            member_count: members.len() as u64,
            total_allocated,
            total_used,
            total_free,
            largest_free_slot,
            usage_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_never_negative() {
        let mut member = Member::new("trip", "alice", 100);
        member.charge(60);
        assert_eq!(member.remaining(), 40);
        assert!((member.usage_percentage() - 60.0).abs() < f64::EPSILON);

        // Allocation lowered below usage
        member.allocated_bytes = 50;
        assert_eq!(member.remaining(), 0);
        assert!(!member.has_capacity());
    }

    #[test]
    fn test_charge_does_not_revalidate() {
        let mut member = Member::new("trip", "alice", 10);
        member.charge(25);
        assert_eq!(member.used_bytes, 25);
        assert_eq!(member.remaining(), 0);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let mut member = Member::new("trip", "alice", 100);
        member.charge(30);

        let released = member.release(40, ReleasePolicy::Clamp).unwrap();
        assert_eq!(member.used_bytes, 0);
        assert_eq!(released, Released { bytes: 30, clamped: true });
    }

    #[test]
    fn test_strict_release_reports_underflow() {
        let mut member = Member::new("trip", "alice", 100);
        member.charge(30);

        let err = member.release(40, ReleasePolicy::Strict).unwrap_err();
        assert_eq!(
            err,
            LedgerError::ReleaseUnderflow {
                user_id: "alice".into(),
                used: 30,
                release: 40,
            }
        );
        // Counters untouched on refusal
        assert_eq!(member.used_bytes, 30);
    }

    #[test]
    fn test_exact_release() {
        let mut member = Member::new("trip", "bob", 100);
        member.charge(15);
        let released = member.release(15, ReleasePolicy::Strict).unwrap();
        assert!(!released.clamped);
        assert_eq!(member.used_bytes, 0);
    }

    #[test]
    fn test_trip_summary() {
        let mut a = Member::new("trip", "a", 100);
        a.charge(40);
        let b = Member::new("trip", "b", 50);
        let mut c = Member::new("trip", "c", 10);
        c.charge(10);

        let summary = TripQuotaSummary::from_members("trip", &[a, b, c]);
        assert_eq!(summary.member_count, 3);
        assert_eq!(summary.total_allocated, 160);
        assert_eq!(summary.total_used, 50);
        assert_eq!(summary.total_free, 110);
        assert_eq!(summary.largest_free_slot, 60);
        assert!((summary.usage_percentage - 31.25).abs() < f64::EPSILON);
    }
}
