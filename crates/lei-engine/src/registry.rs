//! Which objects and classes have injection enabled.
//!
//! An object is eligible when it is enabled itself or its class is.
//! Objects of an enabled class that were never enabled individually get
//! registered the first time they issue I/O, so a class enable covers
//! future objects too.
//!
//! Each object also carries a small ledger, guarded by its own mutex, of
//! media errors awaiting remap, remapped ranges and healed transient
//! blocks.  The ledger is touched only when a record actually matches, so
//! the lock never sits on the pass-through path.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{LeiError, Result};
use crate::record::RecordHandle;
use crate::stats::{GetObjectStatsResult, ObjectCounters};
use crate::types::{ClassId, ObjectId, PackageId};
use crate::verified;

/// Registration of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionTarget {
    pub object_id: ObjectId,
    pub class_id: ClassId,
    pub package_id: PackageId,
    /// Enabled individually (class enablement is tracked separately).
    pub enabled: bool,
    /// Opaque hook selector forwarded to the storage engine.
    pub edge_hook_bitmask: u32,
    /// Subtracted from I/O LBAs before records are matched.
    pub lba_adjustment: u64,
}

/// Registration of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTarget {
    pub class_id: ClassId,
    pub package_id: PackageId,
    pub enabled: bool,
    pub edge_hook_bitmask: u32,
    pub lba_adjustment: u64,
}

/// Per-object remap and heal bookkeeping.
#[derive(Debug, Default)]
pub struct ObjectLedger {
    /// Last LBA that took a media error, per position.
    last_media_error: HashMap<u16, u64>,
    /// Remapped ranges per position, as disjoint `start -> end` (exclusive)
    /// intervals.  Overlapping and adjacent ranges are merged on insert.
    remapped: HashMap<u16, BTreeMap<u64, u64>>,
    /// `(record, position, lba)` blocks whose transient error was already
    /// delivered.
    healed: HashSet<(RecordHandle, u16, u64)>,
}

impl ObjectLedger {
    pub fn note_media_error(&mut self, position: u16, lba: u64) {
        self.last_media_error.insert(position, lba);
    }

    pub fn last_media_error(&self, position: u16) -> Option<u64> {
        self.last_media_error.get(&position).copied()
    }

    /// If a write covering `[lba, lba + blocks)` on `position` rewrites the
    /// last media error, forget it and return its LBA.
    pub fn take_covered_media_error(&mut self, position: u16, lba: u64, blocks: u64) -> Option<u64> {
        let bad = self.last_media_error(position)?;
        if verified::ranges_overlap(lba, blocks, bad, 1) {
            self.last_media_error.remove(&position);
            Some(bad)
        } else {
            None
        }
    }

    pub fn mark_remapped(&mut self, position: u16, lba: u64, blocks: u64) {
        if blocks == 0 {
            return;
        }
        if let Some(bad) = self.last_media_error(position) {
            if verified::ranges_overlap(lba, blocks, bad, 1) {
                self.last_media_error.remove(&position);
            }
        }
        let ranges = self.remapped.entry(position).or_default();
        let mut start = lba;
        let mut end = lba.saturating_add(blocks);
        // Absorb a range starting at or before `start` that reaches it.
        if let Some((&s, &e)) = ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
            }
        }
        // Absorb every range starting inside `[start, end]`.
        let absorbed: Vec<(u64, u64)> = ranges.range(start..=end).map(|(&s, &e)| (s, e)).collect();
        for (s, e) in absorbed {
            ranges.remove(&s);
            end = end.max(e);
        }
        ranges.insert(start, end);
    }

    pub fn is_remapped(&self, position: u16, lba: u64) -> bool {
        self.remapped
            .get(&position)
            .and_then(|ranges| ranges.range(..=lba).next_back())
            .is_some_and(|(_, &end)| end > lba)
    }

    /// Number of disjoint remapped ranges on `position`.
    pub fn remapped_ranges(&self, position: u16) -> usize {
        self.remapped.get(&position).map_or(0, BTreeMap::len)
    }

    pub fn is_healed(&self, record: RecordHandle, position: u16, lba: u64) -> bool {
        self.healed.contains(&(record, position, lba))
    }

    pub fn heal(&mut self, record: RecordHandle, position: u16, lba: u64) {
        self.healed.insert((record, position, lba));
    }

    /// Re-arm every block healed by `record`.
    pub fn forget_heals(&mut self, record: RecordHandle) {
        self.healed.retain(|&(r, _, _)| r != record);
    }

    pub fn clear_heals(&mut self) {
        self.healed.clear();
    }
}

/// A registered object with its counters and ledger.
#[derive(Debug)]
pub struct ObjectEntry {
    pub target: InjectionTarget,
    pub counters: ObjectCounters,
    pub ledger: Mutex<ObjectLedger>,
}

impl ObjectEntry {
    fn new(target: InjectionTarget) -> Self {
        Self {
            target,
            counters: ObjectCounters::default(),
            ledger: Mutex::new(ObjectLedger::default()),
        }
    }
}

/// Object and class enablement.
#[derive(Debug, Default)]
pub struct Registry {
    objects: BTreeMap<ObjectId, ObjectEntry>,
    classes: HashMap<ClassId, ClassTarget>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable injection on one object, registering it if needed.
    pub fn enable_object(&mut self, object_id: ObjectId, class_id: ClassId, package_id: PackageId) {
        let entry = self.entry_or_register(object_id, class_id, package_id);
        entry.target.enabled = true;
        entry.target.class_id = class_id;
        log::info!("enabled injection on object {object_id} ({class_id}, {package_id})");
    }

    /// Disable injection on one object.  Unknown objects are ignored.
    pub fn disable_object(&mut self, object_id: ObjectId, package_id: PackageId) {
        match self.objects.get_mut(&object_id) {
            Some(entry) => {
                entry.target.enabled = false;
                log::info!("disabled injection on object {object_id} ({package_id})");
            }
            None => log::warn!("disable of unregistered object {object_id} ignored"),
        }
    }

    /// Enable injection on every current and future object of a class.
    pub fn enable_class(&mut self, class_id: ClassId, package_id: PackageId) {
        let class = self.classes.entry(class_id).or_insert(ClassTarget {
            class_id,
            package_id,
            enabled: false,
            edge_hook_bitmask: 0,
            lba_adjustment: 0,
        });
        class.enabled = true;
        class.package_id = package_id;
        log::info!("enabled injection on {class_id} ({package_id})");
    }

    /// Disable a class and every registered object that belongs to it.
    pub fn disable_class(&mut self, class_id: ClassId, package_id: PackageId) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.enabled = false;
        }
        let mut members = 0;
        for entry in self.objects.values_mut() {
            if entry.target.class_id == class_id {
                entry.target.enabled = false;
                members += 1;
            }
        }
        log::info!("disabled injection on {class_id} ({package_id}), {members} member objects");
    }

    pub fn modify_object(
        &mut self,
        object_id: ObjectId,
        edge_hook_bitmask: u32,
        lba_adjustment: u64,
    ) -> Result<()> {
        let entry = self
            .objects
            .get_mut(&object_id)
            .ok_or(LeiError::ObjectNotFound(object_id))?;
        entry.target.edge_hook_bitmask = edge_hook_bitmask;
        entry.target.lba_adjustment = lba_adjustment;
        log::info!(
            "object {object_id}: edge hooks {edge_hook_bitmask:#x}, lba adjustment {lba_adjustment:#x}"
        );
        Ok(())
    }

    /// Set class defaults and apply them to the class's registered objects.
    pub fn modify_class(
        &mut self,
        class_id: ClassId,
        package_id: PackageId,
        edge_hook_bitmask: u32,
        lba_adjustment: u64,
    ) {
        let class = self.classes.entry(class_id).or_insert(ClassTarget {
            class_id,
            package_id,
            enabled: false,
            edge_hook_bitmask: 0,
            lba_adjustment: 0,
        });
        class.edge_hook_bitmask = edge_hook_bitmask;
        class.lba_adjustment = lba_adjustment;
        for entry in self.objects.values_mut() {
            if entry.target.class_id == class_id {
                entry.target.edge_hook_bitmask = edge_hook_bitmask;
                entry.target.lba_adjustment = lba_adjustment;
            }
        }
    }

    pub fn remove_object(&mut self, object_id: ObjectId) -> Result<()> {
        if self.objects.remove(&object_id).is_none() {
            return Err(LeiError::ObjectNotFound(object_id));
        }
        log::info!("removed object {object_id}");
        Ok(())
    }

    /// Forget every object and class, with their statistics.
    pub fn destroy_objects(&mut self) {
        log::info!(
            "destroying {} objects and {} classes",
            self.objects.len(),
            self.classes.len()
        );
        self.objects.clear();
        self.classes.clear();
    }

    /// Register an object on behalf of its enabled class.  Returns whether
    /// a new entry was created.
    pub fn register_from_class(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        package_id: PackageId,
    ) -> bool {
        if self.objects.contains_key(&object_id) || !self.class_enabled(class_id) {
            return false;
        }
        self.entry_or_register(object_id, class_id, package_id);
        log::debug!("registered object {object_id} through {class_id}");
        true
    }

    pub fn get(&self, object_id: ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(&object_id)
    }

    pub fn class_enabled(&self, class_id: ClassId) -> bool {
        self.classes.get(&class_id).is_some_and(|c| c.enabled)
    }

    /// Whether I/O on `object_id` is subject to injection.
    pub fn is_enabled(&self, object_id: ObjectId) -> bool {
        self.objects
            .get(&object_id)
            .is_some_and(|e| e.target.enabled || self.class_enabled(e.target.class_id))
    }

    /// Whether an I/O from an object this registry has not seen yet
    /// should trigger class registration.
    pub fn needs_registration(&self, object_id: ObjectId, class_id: ClassId) -> bool {
        !self.objects.contains_key(&object_id) && self.class_enabled(class_id)
    }

    pub fn object_stats(&self, object_id: ObjectId) -> Result<GetObjectStatsResult> {
        self.objects
            .get(&object_id)
            .map(|e| e.counters.snapshot())
            .ok_or(LeiError::ObjectNotFound(object_id))
    }

    pub fn targets(&self) -> Vec<InjectionTarget> {
        self.objects.values().map(|e| e.target).collect()
    }

    pub fn num_objects(&self) -> u64 {
        self.objects.len() as u64
    }

    pub fn num_objects_enabled(&self) -> u64 {
        self.objects
            .keys()
            .filter(|&&id| self.is_enabled(id))
            .count() as u64
    }

    /// Re-arm the transient blocks `record` healed on every object.
    pub fn forget_heals(&self, record: RecordHandle) {
        for entry in self.objects.values() {
            entry.ledger.lock().forget_heals(record);
        }
    }

    /// Re-arm every healed transient block on every object.
    pub fn clear_heals(&self) {
        for entry in self.objects.values() {
            entry.ledger.lock().clear_heals();
        }
    }

    // ── Internal ────────────────────────────────────────────────

    fn entry_or_register(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        package_id: PackageId,
    ) -> &mut ObjectEntry {
        let (edge_hook_bitmask, lba_adjustment) = self
            .classes
            .get(&class_id)
            .map_or((0, 0), |c| (c.edge_hook_bitmask, c.lba_adjustment));
        self.objects.entry(object_id).or_insert_with(|| {
            ObjectEntry::new(InjectionTarget {
                object_id,
                class_id,
                package_id,
                enabled: false,
                edge_hook_bitmask,
                lba_adjustment,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::bump;

    const MIRROR: ClassId = ClassId(0x20);
    const PARITY: ClassId = ClassId(0x21);
    const SEP: PackageId = PackageId(3);

    #[test]
    fn enable_then_disable_object() {
        let mut reg = Registry::new();
        reg.enable_object(ObjectId(1), PARITY, SEP);
        assert!(reg.is_enabled(ObjectId(1)));
        assert_eq!(reg.num_objects(), 1);
        assert_eq!(reg.num_objects_enabled(), 1);

        reg.disable_object(ObjectId(1), SEP);
        assert!(!reg.is_enabled(ObjectId(1)));
        assert_eq!(reg.num_objects(), 1);
        assert_eq!(reg.num_objects_enabled(), 0);
    }

    #[test]
    fn disable_unknown_object_is_soft() {
        let mut reg = Registry::new();
        reg.disable_object(ObjectId(9), SEP);
        assert_eq!(reg.num_objects(), 0);
    }

    #[test]
    fn class_enable_covers_future_objects() {
        let mut reg = Registry::new();
        reg.enable_class(MIRROR, SEP);
        assert!(reg.needs_registration(ObjectId(5), MIRROR));
        assert!(!reg.needs_registration(ObjectId(5), PARITY));

        assert!(reg.register_from_class(ObjectId(5), MIRROR, SEP));
        assert!(!reg.register_from_class(ObjectId(5), MIRROR, SEP));
        assert!(reg.is_enabled(ObjectId(5)));
        assert_eq!(reg.num_objects_enabled(), 1);
    }

    #[test]
    fn class_disable_leaves_objects_registered() {
        let mut reg = Registry::new();
        reg.enable_class(MIRROR, SEP);
        reg.register_from_class(ObjectId(5), MIRROR, SEP);
        reg.enable_object(ObjectId(6), MIRROR, SEP);
        reg.enable_object(ObjectId(7), PARITY, SEP);

        reg.disable_class(MIRROR, SEP);
        assert_eq!(reg.num_objects(), 3);
        assert_eq!(reg.num_objects_enabled(), 1);
        assert!(reg.is_enabled(ObjectId(7)));
    }

    #[test]
    fn enabled_never_exceeds_registered() {
        let mut reg = Registry::new();
        for i in 0..8 {
            reg.enable_object(ObjectId(i), if i % 2 == 0 { MIRROR } else { PARITY }, SEP);
            assert!(reg.num_objects_enabled() <= reg.num_objects());
        }
        reg.disable_class(MIRROR, SEP);
        assert_eq!(reg.num_objects_enabled(), 4);
        assert!(reg.num_objects_enabled() <= reg.num_objects());
    }

    #[test]
    fn destroy_clears_targets_and_stats() {
        let mut reg = Registry::new();
        reg.enable_object(ObjectId(1), PARITY, SEP);
        bump(&reg.get(ObjectId(1)).unwrap().counters.num_errors_injected, 3);
        reg.destroy_objects();
        assert_eq!(reg.num_objects(), 0);
        assert_eq!(
            reg.object_stats(ObjectId(1)),
            Err(LeiError::ObjectNotFound(ObjectId(1)))
        );

        // Re-registering starts from zero.
        reg.enable_object(ObjectId(1), PARITY, SEP);
        assert_eq!(reg.object_stats(ObjectId(1)).unwrap().num_errors_injected, 0);
    }

    #[test]
    fn modify_and_remove_require_registration() {
        let mut reg = Registry::new();
        assert!(reg.modify_object(ObjectId(1), 0x3, 0x100).is_err());
        assert!(reg.remove_object(ObjectId(1)).unwrap_err().is_not_found());

        reg.enable_object(ObjectId(1), PARITY, SEP);
        reg.modify_object(ObjectId(1), 0x3, 0x100).unwrap();
        let target = reg.get(ObjectId(1)).unwrap().target;
        assert_eq!(target.edge_hook_bitmask, 0x3);
        assert_eq!(target.lba_adjustment, 0x100);

        reg.remove_object(ObjectId(1)).unwrap();
        assert_eq!(reg.num_objects(), 0);
    }

    #[test]
    fn class_adjustment_inherited_by_new_objects() {
        let mut reg = Registry::new();
        reg.modify_class(MIRROR, SEP, 0x1, 0x800);
        reg.enable_class(MIRROR, SEP);
        reg.register_from_class(ObjectId(2), MIRROR, SEP);
        assert_eq!(reg.get(ObjectId(2)).unwrap().target.lba_adjustment, 0x800);
    }

    // ── ledger ───────────────────────────────────────────────────

    #[test]
    fn write_over_media_error_remaps_it() {
        let mut ledger = ObjectLedger::default();
        ledger.note_media_error(0, 0x10);
        assert_eq!(ledger.take_covered_media_error(0, 0x20, 4), None);
        assert_eq!(ledger.take_covered_media_error(1, 0x10, 1), None);
        assert_eq!(ledger.take_covered_media_error(0, 0x8, 0x10), Some(0x10));
        assert_eq!(ledger.last_media_error(0), None);
    }

    #[test]
    fn remapped_ranges_are_per_position() {
        let mut ledger = ObjectLedger::default();
        ledger.mark_remapped(2, 0x100, 4);
        assert!(ledger.is_remapped(2, 0x103));
        assert!(!ledger.is_remapped(2, 0x104));
        assert!(!ledger.is_remapped(1, 0x100));
    }

    #[test]
    fn remapped_ranges_merge_instead_of_growing() {
        let mut ledger = ObjectLedger::default();
        for _ in 0..100 {
            ledger.mark_remapped(0, 0x10, 1);
        }
        assert_eq!(ledger.remapped_ranges(0), 1);

        // Adjacent on both sides, then a range bridging two islands.
        ledger.mark_remapped(0, 0x11, 3);
        ledger.mark_remapped(0, 0xc, 4);
        assert_eq!(ledger.remapped_ranges(0), 1);
        ledger.mark_remapped(0, 0x40, 8);
        assert_eq!(ledger.remapped_ranges(0), 2);
        ledger.mark_remapped(0, 0x12, 0x30);
        assert_eq!(ledger.remapped_ranges(0), 1);

        assert!(!ledger.is_remapped(0, 0xb));
        assert!(ledger.is_remapped(0, 0xc));
        assert!(ledger.is_remapped(0, 0x30));
        assert!(ledger.is_remapped(0, 0x47));
        assert!(!ledger.is_remapped(0, 0x48));
    }

    #[test]
    fn disjoint_remaps_stay_separate() {
        let mut ledger = ObjectLedger::default();
        ledger.mark_remapped(1, 0x20, 2);
        ledger.mark_remapped(1, 0x10, 2);
        assert_eq!(ledger.remapped_ranges(1), 2);
        assert!(ledger.is_remapped(1, 0x11));
        assert!(!ledger.is_remapped(1, 0x12));
        assert!(!ledger.is_remapped(1, 0x1f));
        assert!(ledger.is_remapped(1, 0x21));
    }

    #[test]
    fn heal_is_per_record_and_block() {
        let mut ledger = ObjectLedger::default();
        ledger.heal(RecordHandle(0), 0, 5);
        assert!(ledger.is_healed(RecordHandle(0), 0, 5));
        assert!(!ledger.is_healed(RecordHandle(0), 0, 6));
        assert!(!ledger.is_healed(RecordHandle(0), 1, 5));
        assert!(!ledger.is_healed(RecordHandle(1), 0, 5));
    }

    #[test]
    fn forgetting_a_record_rearms_only_its_blocks() {
        let mut ledger = ObjectLedger::default();
        ledger.heal(RecordHandle(0), 0, 5);
        ledger.heal(RecordHandle(1), 0, 5);
        ledger.forget_heals(RecordHandle(0));
        assert!(!ledger.is_healed(RecordHandle(0), 0, 5));
        assert!(ledger.is_healed(RecordHandle(1), 0, 5));
        ledger.clear_heals();
        assert!(!ledger.is_healed(RecordHandle(1), 0, 5));
    }

    #[test]
    fn registry_clears_heals_on_every_object() {
        let mut reg = Registry::new();
        reg.enable_object(ObjectId(1), PARITY, SEP);
        reg.enable_object(ObjectId(2), PARITY, SEP);
        for id in [ObjectId(1), ObjectId(2)] {
            reg.get(id).unwrap().ledger.lock().heal(RecordHandle(3), 0, 0x10);
        }
        reg.forget_heals(RecordHandle(3));
        for id in [ObjectId(1), ObjectId(2)] {
            assert!(!reg.get(id).unwrap().ledger.lock().is_healed(RecordHandle(3), 0, 0x10));
        }
    }
}
