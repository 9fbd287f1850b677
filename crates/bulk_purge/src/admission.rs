//! Admission control: maps one congestion snapshot to a scheduling decision.
//!
//! Stateless. Delays are randomized to spread out tasks that were throttled
//! together, but each tier draws from its own range and the ranges are
//! disjoint and ascending, so a busier snapshot never earns a shorter wait.

use std::ops::Range;
use std::time::Duration;

use rand::Rng;

use crate::telemetry::{CongestionSnapshot, UtilizationStatus};

/// Backoff before resampling when the cache is saturated.
pub const BLOCK_BACKOFF_MS: Range<u64> = 250..500;
/// Delay when write slots and checkpointing are both saturated.
pub const HEAVY_THROTTLE_MS: Range<u64> = 100..200;
/// Delay when dirty or update bytes are building up.
pub const LIGHT_THROTTLE_MS: Range<u64> = 10..50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Proceed,
    /// Wait `delay`, then ask again.
    Throttle { delay: Duration, reason: &'static str },
    /// Stop, wait `backoff`, and resample before asking again.
    Block { backoff: Duration, reason: &'static str },
}

impl AdmissionDecision {
    /// Time the caller sleeps before the next attempt.
    pub fn delay(&self) -> Duration {
        match self {
            Self::Proceed => Duration::ZERO,
            Self::Throttle { delay, .. } => *delay,
            Self::Block { backoff, .. } => *backoff,
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Proceed => None,
            Self::Throttle { reason, .. } | Self::Block { reason, .. } => Some(*reason),
        }
    }
}

fn draw<R: Rng + ?Sized>(rng: &mut R, range: Range<u64>) -> Duration {
    Duration::from_millis(rng.gen_range(range))
}

/// Decide whether a batch may run now.
pub fn decide<R: Rng + ?Sized>(snapshot: &CongestionSnapshot, rng: &mut R) -> AdmissionDecision {
    use UtilizationStatus::{High, Medium};

    if snapshot.cache.status == High {
        return AdmissionDecision::Block {
            backoff: draw(rng, BLOCK_BACKOFF_MS),
            reason: "cache utilization high",
        };
    }
    if snapshot.dirty.status == High {
        return AdmissionDecision::Block {
            backoff: draw(rng, BLOCK_BACKOFF_MS),
            reason: "dirty cache high",
        };
    }
    if snapshot.updates.status == High {
        return AdmissionDecision::Block {
            backoff: draw(rng, BLOCK_BACKOFF_MS),
            reason: "pending updates high",
        };
    }
    // The heavier throttle is checked first so that a snapshot matching both
    // throttle rules gets the longer delay.
    if snapshot.write_tickets.status == High && snapshot.checkpoint.status == High {
        return AdmissionDecision::Throttle {
            delay: draw(rng, HEAVY_THROTTLE_MS),
            reason: "write tickets and checkpoint saturated",
        };
    }
    if snapshot.dirty.status == Medium || snapshot.updates.status == Medium {
        return AdmissionDecision::Throttle {
            delay: draw(rng, LIGHT_THROTTLE_MS),
            reason: "dirty cache or pending updates elevated",
        };
    }
    AdmissionDecision::Proceed
}
