//! Global and per-object injection statistics.
//!
//! Live counters are atomics updated from the I/O path.  Callers only
//! ever see plain snapshots ([`GetStatsResult`], [`GetObjectStatsResult`]).

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Engine-wide snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatsResult {
    pub enabled: bool,
    pub num_objects: u64,
    pub num_records: u64,
    pub num_objects_enabled: u64,
    pub num_errors_injected: u64,
    pub correctable_errors_detected: u64,
    pub uncorrectable_errors_detected: u64,
    pub num_validations: u64,
    pub num_failed_validations: u64,
}

/// Per-object snapshot.  Additive: summing the stats of every mirror of
/// a striped mirror gives the stats of the whole group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectStatsResult {
    pub num_read_media_errors_injected: u64,
    pub num_write_verify_blocks_remapped: u64,
    pub num_errors_injected: u64,
    pub num_validations: u64,
}

impl GetObjectStatsResult {
    /// Add `other` into `self`.
    pub fn accumulate(&mut self, other: &GetObjectStatsResult) {
        self.num_read_media_errors_injected += other.num_read_media_errors_injected;
        self.num_write_verify_blocks_remapped += other.num_write_verify_blocks_remapped;
        self.num_errors_injected += other.num_errors_injected;
        self.num_validations += other.num_validations;
    }
}

impl AddAssign for GetObjectStatsResult {
    fn add_assign(&mut self, rhs: Self) {
        self.accumulate(&rhs);
    }
}

impl std::iter::Sum for GetObjectStatsResult {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, s| {
            acc += s;
            acc
        })
    }
}

/// Engine-wide counters.  Reset by `enable()`.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    pub num_errors_injected: AtomicU64,
    pub correctable_errors_detected: AtomicU64,
    pub uncorrectable_errors_detected: AtomicU64,
    pub num_validations: AtomicU64,
    pub num_failed_validations: AtomicU64,
}

impl GlobalCounters {
    pub fn reset(&self) {
        self.num_errors_injected.store(0, Ordering::Relaxed);
        self.correctable_errors_detected.store(0, Ordering::Relaxed);
        self.uncorrectable_errors_detected.store(0, Ordering::Relaxed);
        self.num_validations.store(0, Ordering::Relaxed);
        self.num_failed_validations.store(0, Ordering::Relaxed);
    }

    /// Copy the counters into `out`, leaving the registry fields alone.
    pub fn fill(&self, out: &mut GetStatsResult) {
        out.num_errors_injected = self.num_errors_injected.load(Ordering::Relaxed);
        out.correctable_errors_detected = self.correctable_errors_detected.load(Ordering::Relaxed);
        out.uncorrectable_errors_detected =
            self.uncorrectable_errors_detected.load(Ordering::Relaxed);
        out.num_validations = self.num_validations.load(Ordering::Relaxed);
        out.num_failed_validations = self.num_failed_validations.load(Ordering::Relaxed);
    }
}

/// Counters owned by one registered object.
#[derive(Debug, Default)]
pub struct ObjectCounters {
    pub num_read_media_errors_injected: AtomicU64,
    pub num_write_verify_blocks_remapped: AtomicU64,
    pub num_errors_injected: AtomicU64,
    pub num_validations: AtomicU64,
}

impl ObjectCounters {
    pub fn snapshot(&self) -> GetObjectStatsResult {
        GetObjectStatsResult {
            num_read_media_errors_injected: self.num_read_media_errors_injected.load(Ordering::Relaxed),
            num_write_verify_blocks_remapped: self
                .num_write_verify_blocks_remapped
                .load(Ordering::Relaxed),
            num_errors_injected: self.num_errors_injected.load(Ordering::Relaxed),
            num_validations: self.num_validations.load(Ordering::Relaxed),
        }
    }
}

/// Bump an atomic counter by `n`.
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
