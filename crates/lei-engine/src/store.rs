//! Bounded store of error records with per-record atomic counters.
//!
//! The store itself is mutated only under the engine's write lock.  The
//! I/O path reads it under the read lock and updates counters through
//! atomics, so concurrent I/Os on different positions never serialize on
//! each other.

use std::sync::atomic::{AtomicU64, Ordering};

use lei_protocol::{MAX_DELAY_MS, MAX_RECORDS};
use serde::Serialize;

use crate::error::{LeiError, Result};
use crate::record::{ErrorRecord, RecordHandle};
use crate::types::{ErrorMode, ObjectId};

/// High bit of the skip phase word: set while the record is inserting.
const PHASE_INSERTING: u64 = 1 << 63;

/// Mutable counters attached to a stored record.
#[derive(Debug, Default)]
pub struct RecordCounters {
    err_count: AtomicU64,
    skip_count: AtomicU64,
    /// `PHASE_INSERTING | n` or `n`: matches seen in the current phase.
    skip_phase: AtomicU64,
}

impl RecordCounters {
    fn for_mode(mode: ErrorMode) -> Self {
        let counters = Self::default();
        if mode == ErrorMode::SkipInsert {
            counters.skip_phase.store(PHASE_INSERTING, Ordering::Relaxed);
        }
        counters
    }

    pub fn err_count(&self) -> u64 {
        self.err_count.load(Ordering::Relaxed)
    }

    pub fn skip_count(&self) -> u64 {
        self.skip_count.load(Ordering::Relaxed)
    }

    /// Claim one injection if fewer than `limit` have happened.
    pub fn try_claim(&self, limit: u64) -> bool {
        self.err_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < limit).then_some(c + 1)
            })
            .is_ok()
    }

    /// Count an injection that is not capped.
    pub fn note_injection(&self) {
        self.err_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance the SKIP / SKIP_INSERT state machine by one match.
    ///
    /// The skipping phase lets `skip_limit` matches through and then
    /// switches to inserting; the inserting phase injects
    /// `skip_limit + 1` times and then switches back.  Returns whether
    /// this match injects.
    pub fn skip_gate(&self, skip_limit: u64) -> bool {
        let mut current = self.skip_phase.load(Ordering::Acquire);
        loop {
            let (inject, next) = next_skip_phase(current, skip_limit);
            match self.skip_phase.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if inject {
                        self.err_count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.skip_count.fetch_add(1, Ordering::Relaxed);
                    }
                    return inject;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the record is in its inserting phase.
    pub fn is_inserting(&self) -> bool {
        self.skip_phase.load(Ordering::Relaxed) & PHASE_INSERTING != 0
    }
}

fn next_skip_phase(current: u64, skip_limit: u64) -> (bool, u64) {
    let seen = current & !PHASE_INSERTING;
    let insert_quota = skip_limit.saturating_add(1);
    if current & PHASE_INSERTING != 0 {
        let injected = seen + 1;
        if injected >= insert_quota {
            (true, 0)
        } else {
            (true, PHASE_INSERTING | injected)
        }
    } else if seen < skip_limit {
        (false, seen + 1)
    } else if insert_quota <= 1 {
        (true, 0)
    } else {
        (true, PHASE_INSERTING | 1)
    }
}

/// A stored record and its counters.
#[derive(Debug)]
pub struct Slot {
    pub handle: RecordHandle,
    pub record: ErrorRecord,
    pub armed: bool,
    pub counters: RecordCounters,
}

/// Read-only view of a stored record, as returned by
/// [`RecordStore::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordEntry {
    pub handle: RecordHandle,
    pub record: ErrorRecord,
    pub armed: bool,
    pub err_count: u64,
    pub skip_count: u64,
}

/// Up to [`MAX_RECORDS`] records kept in creation order.
#[derive(Debug)]
pub struct RecordStore {
    slots: Vec<Slot>,
    next_handle: usize,
    max_delay_ms: u64,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new(MAX_DELAY_MS)
    }
}

impl RecordStore {
    pub fn new(max_delay_ms: u64) -> Self {
        Self {
            slots: Vec::new(),
            next_handle: 0,
            max_delay_ms,
        }
    }

    /// Add a record.
    ///
    /// An armed record with identical content already in the store is
    /// returned instead of adding a duplicate.
    pub fn create(&mut self, record: ErrorRecord) -> Result<RecordHandle> {
        record.validate_with_delay_cap(self.max_delay_ms)?;
        if let Some(existing) = self
            .slots
            .iter()
            .find(|s| s.armed && s.record == record)
        {
            log::debug!("record {} already present as {}", record, existing.handle);
            return Ok(existing.handle);
        }
        if self.slots.len() >= MAX_RECORDS {
            log::warn!("record store full, rejecting {record}");
            return Err(LeiError::ResourceExhausted { limit: MAX_RECORDS });
        }
        let handle = RecordHandle(self.next_handle);
        self.next_handle += 1;
        log::info!("created record {handle}: {record}");
        self.slots.push(Slot {
            handle,
            counters: RecordCounters::for_mode(record.error_mode),
            record,
            armed: true,
        });
        Ok(handle)
    }

    /// Add a record scoped to `object_id`.
    pub fn create_for_object(
        &mut self,
        record: ErrorRecord,
        object_id: ObjectId,
    ) -> Result<RecordHandle> {
        self.create(record.for_object(object_id))
    }

    /// Replace a record's content and reset its counters.
    pub fn modify(&mut self, handle: RecordHandle, record: ErrorRecord) -> Result<()> {
        record.validate_with_delay_cap(self.max_delay_ms)?;
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.handle == handle)
            .ok_or(LeiError::RecordNotFound(handle.0))?;
        log::info!("modified record {handle}: {record}");
        slot.counters = RecordCounters::for_mode(record.error_mode);
        slot.record = record;
        slot.armed = true;
        Ok(())
    }

    pub fn delete(&mut self, handle: RecordHandle) -> Result<()> {
        let index = self
            .slots
            .iter()
            .position(|s| s.handle == handle)
            .ok_or(LeiError::RecordNotFound(handle.0))?;
        self.slots.remove(index);
        log::info!("deleted record {handle}");
        Ok(())
    }

    /// Disarm `count` records starting at creation-order index
    /// `start_index`.  Indices past the end are ignored.  Returns the
    /// number of records disarmed.
    pub fn disable_range(&mut self, start_index: usize, count: usize) -> Result<usize> {
        let end = start_index
            .checked_add(count)
            .filter(|&e| e <= MAX_RECORDS)
            .ok_or_else(|| {
                LeiError::InvalidParameter(format!(
                    "record range {start_index}+{count} exceeds {MAX_RECORDS}"
                ))
            })?;
        let mut disarmed = 0;
        for slot in self.slots.iter_mut().take(end).skip(start_index) {
            if slot.armed {
                slot.armed = false;
                disarmed += 1;
            }
        }
        log::info!("disabled {disarmed} records in [{start_index}, {end})");
        Ok(disarmed)
    }

    /// Drop every record and load `records` in order.
    ///
    /// Validation happens up front, so a bad record leaves the store
    /// untouched.
    pub fn replace_all(&mut self, records: &[ErrorRecord]) -> Result<()> {
        if records.len() > MAX_RECORDS {
            return Err(LeiError::ResourceExhausted { limit: MAX_RECORDS });
        }
        for record in records {
            record.validate_with_delay_cap(self.max_delay_ms)?;
        }
        self.slots.clear();
        for record in records {
            self.create(record.clone())?;
        }
        Ok(())
    }

    /// Snapshot of every record in creation order.
    pub fn entries(&self) -> Vec<RecordEntry> {
        self.slots
            .iter()
            .map(|s| RecordEntry {
                handle: s.handle,
                record: s.record.clone(),
                armed: s.armed,
                err_count: s.counters.err_count(),
                skip_count: s.counters.skip_count(),
            })
            .collect()
    }

    pub fn get(&self, handle: RecordHandle) -> Option<&Slot> {
        self.slots.iter().find(|s| s.handle == handle)
    }

    /// Armed records in creation order.
    pub fn armed(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|s| s.armed)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
