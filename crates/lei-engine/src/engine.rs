//! Injection engine: the object the storage engine and the test driver
//! share.
//!
//! The [`InjectionEngine`] combines the record store, the enable
//! registry, the canned tables and a deterministic RNG.  The storage
//! engine calls [`InjectionEngine::intercept`] on every block I/O it
//! issues; the test driver configures records and reads statistics.
//!
//! All operations take `&self`.  Administrative calls take the state
//! lock for writing, the I/O path takes it for reading and updates
//! counters through atomics.

use lei_protocol::MAX_DELAY_MS;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LeiError, Result};
use crate::events::{self, CorrelationContext, ExpectedEvent};
use crate::record::{ErrorRecord, RecordHandle};
use crate::registry::{InjectionTarget, ObjectEntry, Registry};
use crate::sector::{corrupt_sector, Corruption, Sector};
use crate::stats::{bump, GetObjectStatsResult, GetStatsResult, GlobalCounters};
use crate::store::{RecordEntry, RecordStore, Slot};
use crate::tables::{CannedTable, TableInfo, TableSet};
use crate::types::{
    BlockOpcode, ClassId, ErrorCategory, ErrorMode, ErrorType, ObjectId, PackageId, RaidKind,
};
use crate::verified;

/// Configuration for the injection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seed for RANDOM, TRANS_RND and random media decisions.
    pub seed: u64,
    /// Wrap I/O LBAs into the record table.
    pub lba_normalize: bool,
    /// Report parity coherency errors as parity-of-checksum.
    pub poc_injection: bool,
    /// Accept detected corrupt-crc, corrupt-data and invalidated regions
    /// without a matching record.
    pub ignore_corrupt_crc_data_errors: bool,
    /// Largest delay a DELAY_UP / DELAY_DOWN record may carry.
    pub max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            lba_normalize: true,
            poc_injection: false,
            ignore_corrupt_crc_data_errors: false,
            max_delay_ms: MAX_DELAY_MS,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LeiError::InvalidParameter(format!("engine config: {e}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  I/O request and outcome
// ═══════════════════════════════════════════════════════════════════════

/// One block I/O as seen by the engine.
///
/// `lba` is in the object's own address space; the engine subtracts the
/// object's LBA adjustment itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRequest {
    pub object_id: ObjectId,
    pub class_id: ClassId,
    pub package_id: PackageId,
    pub opcode: BlockOpcode,
    pub lba: u64,
    pub blocks: u64,
    /// FRU position of the drive the I/O goes to.
    pub position: u16,
    /// Number of positions in the group.
    pub width: u16,
    /// Positions that hold parity for this strip.
    pub parity_bitmask: u16,
    pub raid_kind: RaidKind,
    /// Whether the group can rebuild a lost block.
    pub redundant: bool,
    /// Whether this is a retry of a failed I/O.
    pub retried: bool,
}

impl IoRequest {
    pub fn new(object_id: ObjectId, opcode: BlockOpcode, lba: u64, blocks: u64) -> Self {
        Self {
            object_id,
            class_id: ClassId(0),
            package_id: PackageId(0),
            opcode,
            lba,
            blocks,
            position: 0,
            width: 1,
            parity_bitmask: 0,
            raid_kind: RaidKind::Standard,
            redundant: true,
            retried: false,
        }
    }

    pub fn class(mut self, class_id: ClassId, package_id: PackageId) -> Self {
        self.class_id = class_id;
        self.package_id = package_id;
        self
    }

    pub fn at_position(mut self, position: u16, width: u16) -> Self {
        self.position = position;
        self.width = width;
        self
    }

    pub fn parity(mut self, parity_bitmask: u16) -> Self {
        self.parity_bitmask = parity_bitmask;
        self
    }

    pub fn raid(mut self, raid_kind: RaidKind) -> Self {
        self.raid_kind = raid_kind;
        self
    }

    pub fn redundant(mut self, redundant: bool) -> Self {
        self.redundant = redundant;
        self
    }

    pub fn retried(mut self, retried: bool) -> Self {
        self.retried = retried;
        self
    }

    pub fn is_parity_position(&self) -> bool {
        self.parity_bitmask & verified::position_bit(self.position) != 0
    }
}

/// Why a failed I/O failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoQualifier {
    UnexpectedError,
    RetryNotPossible,
    KeyError,
    KeyNotFound,
    EncryptionNotEnabled,
}

/// Status the storage engine must report for an intercepted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoStatus {
    Success,
    /// Data is good but the block at `lba` should be rewritten.
    RemapRequired { lba: u64 },
    /// Data from `lba` on is lost.
    MediaError { lba: u64 },
    IoFailed { qualifier: IoQualifier },
    /// Report success without performing the write.
    Dropped,
}

/// Which side of the device a delay sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayDirection {
    /// Before the I/O reaches the device.
    Down,
    /// After the device completes.
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub direction: DelayDirection,
    pub ms: u64,
}

/// One injection performed on an I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedError {
    pub handle: RecordHandle,
    /// Type actually applied; random media resolves to hard or soft.
    pub error_type: ErrorType,
    pub position: u16,
    /// First affected block, in the I/O's address space.
    pub lba: u64,
    pub blocks: u64,
    pub parity: bool,
    pub correctable: bool,
    pub error_info: u32,
    pub raid_kind: RaidKind,
    pub retried: bool,
}

impl InjectedError {
    /// Events the RAID engine must log when it detects this injection.
    pub fn expected_events(&self, ctx: &CorrelationContext) -> Vec<ExpectedEvent> {
        events::events_for(
            self.error_type,
            self.position,
            self.parity,
            self.lba,
            self.blocks,
            self.correctable,
            self.raid_kind == RaidKind::Raid6,
            self.retried,
            ctx,
        )
    }
}

/// Result of [`InjectionEngine::intercept`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionOutcome {
    pub status: IoStatus,
    /// Blocks the device is to report as transferred.
    pub blocks_transferred: u64,
    pub delay: Option<Delay>,
    pub injected: Vec<InjectedError>,
}

impl InjectionOutcome {
    fn pass_through(blocks: u64) -> Self {
        Self {
            status: IoStatus::Success,
            blocks_transferred: blocks,
            delay: None,
            injected: Vec::new(),
        }
    }

    /// Whether the I/O went through untouched.
    pub fn is_clean(&self) -> bool {
        self.status == IoStatus::Success && self.delay.is_none() && self.injected.is_empty()
    }
}

/// A region the RAID engine reports as having found bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRegion {
    pub lba: u64,
    pub blocks: u64,
    pub position_bitmask: u16,
    pub error_type: ErrorType,
    pub correctable: bool,
    pub redundant: bool,
    pub raid_kind: RaidKind,
}

impl ErrorRegion {
    pub fn new(lba: u64, blocks: u64, position_bitmask: u16, error_type: ErrorType) -> Self {
        Self {
            lba,
            blocks,
            position_bitmask,
            error_type,
            correctable: true,
            redundant: true,
            raid_kind: RaidKind::Standard,
        }
    }

    pub fn uncorrectable(mut self) -> Self {
        self.correctable = false;
        self
    }
}

/// Process-wide behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFlags {
    pub lba_normalize: bool,
    pub poc_injection: bool,
    pub ignore_corrupt_crc_data_errors: bool,
}

/// Snapshot of the engine RNG, for replaying a random run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    rng_seed: [u8; 32],
    rng_stream: u64,
    rng_word_pos: u128,
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

struct EngineState {
    enabled: bool,
    store: RecordStore,
    registry: Registry,
    tables: TableSet,
    active_table: Option<usize>,
    max_table_lba: u64,
    flags: EngineFlags,
}

impl EngineState {
    fn refresh_table_lba(&mut self) {
        self.max_table_lba = verified::max_table_lba(self.store.armed().map(|s| s.record.end()));
    }
}

/// The logical error injection engine.
///
/// # Example
///
/// ```
/// use lei_engine::engine::{EngineConfig, InjectionEngine, IoRequest, IoStatus};
/// use lei_engine::record::ErrorRecord;
/// use lei_engine::types::{BlockOpcode, ClassId, ErrorMode, ErrorType, ObjectId, PackageId};
///
/// let engine = InjectionEngine::new(EngineConfig::default());
/// engine.enable_object(ObjectId(7), ClassId(1), PackageId(0));
/// engine
///     .create_record(
///         ErrorRecord::new(ErrorType::SoftMedia, ErrorMode::Always)
///             .range(0x10, 1)
///             .positions(0x1, 3),
///     )
///     .unwrap();
/// engine.enable().unwrap();
///
/// let io = IoRequest::new(ObjectId(7), BlockOpcode::Read, 0x10, 1).at_position(0, 3);
/// let outcome = engine.intercept(&io, &mut []);
/// assert_eq!(outcome.status, IoStatus::RemapRequired { lba: 0x10 });
/// assert_eq!(engine.get_stats().num_errors_injected, 1);
/// ```
pub struct InjectionEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    rng: Mutex<ChaCha20Rng>,
    counters: GlobalCounters,
}

impl InjectionEngine {
    /// Create a disabled engine with the built-in tables and no records.
    pub fn new(config: EngineConfig) -> Self {
        let state = EngineState {
            enabled: false,
            store: RecordStore::new(config.max_delay_ms),
            registry: Registry::new(),
            tables: TableSet::builtin(),
            active_table: None,
            max_table_lba: 0,
            flags: EngineFlags {
                lba_normalize: config.lba_normalize,
                poc_injection: config.poc_injection,
                ignore_corrupt_crc_data_errors: config.ignore_corrupt_crc_data_errors,
            },
        };
        Self {
            rng: Mutex::new(Self::rng_from_seed(config.seed)),
            config,
            state: RwLock::new(state),
            counters: GlobalCounters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Enable / disable ────────────────────────────────────────

    /// Start injecting.
    ///
    /// Validates every armed record, recomputes the table wrap point,
    /// resets the global counters and re-arms healed transient blocks.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.state.write();
        for slot in state.store.armed() {
            slot.record.validate_with_delay_cap(self.config.max_delay_ms)?;
        }
        state.refresh_table_lba();
        state.registry.clear_heals();
        self.counters.reset();
        state.enabled = true;
        log::info!(
            "injection enabled: {} records, table wraps at {:#x}",
            state.store.len(),
            state.max_table_lba
        );
        Ok(())
    }

    /// Stop injecting.  Idempotent.
    pub fn disable(&self) {
        let mut state = self.state.write();
        if state.enabled {
            log::info!("injection disabled");
        }
        state.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    // ── Records ─────────────────────────────────────────────────

    pub fn create_record(&self, record: ErrorRecord) -> Result<RecordHandle> {
        let mut state = self.state.write();
        let handle = state.store.create(record)?;
        state.refresh_table_lba();
        Ok(handle)
    }

    /// Create a record that applies only to `object_id`, at every position.
    pub fn create_object_record(
        &self,
        record: ErrorRecord,
        object_id: ObjectId,
    ) -> Result<RecordHandle> {
        let mut state = self.state.write();
        let handle = state.store.create_for_object(record, object_id)?;
        state.refresh_table_lba();
        Ok(handle)
    }

    pub fn modify_record(&self, handle: RecordHandle, record: ErrorRecord) -> Result<()> {
        let mut state = self.state.write();
        state.store.modify(handle, record)?;
        state.registry.forget_heals(handle);
        state.refresh_table_lba();
        Ok(())
    }

    pub fn delete_record(&self, handle: RecordHandle) -> Result<()> {
        let mut state = self.state.write();
        state.store.delete(handle)?;
        state.registry.forget_heals(handle);
        state.refresh_table_lba();
        Ok(())
    }

    /// Disarm `count` records from creation-order index `start_index`.
    /// Only legal while disabled.
    pub fn disable_records(&self, start_index: usize, count: usize) -> Result<usize> {
        let mut state = self.state.write();
        if state.enabled {
            return Err(LeiError::InvalidState("disable_records while enabled"));
        }
        let disarmed = state.store.disable_range(start_index, count)?;
        state.refresh_table_lba();
        Ok(disarmed)
    }

    /// Every stored record with its counters, in creation order.
    pub fn get_records(&self) -> Vec<RecordEntry> {
        self.state.read().store.entries()
    }

    // ── Objects and classes ─────────────────────────────────────

    pub fn enable_object(&self, object_id: ObjectId, class_id: ClassId, package_id: PackageId) {
        self.state
            .write()
            .registry
            .enable_object(object_id, class_id, package_id);
    }

    pub fn disable_object(&self, object_id: ObjectId, package_id: PackageId) {
        self.state.write().registry.disable_object(object_id, package_id);
    }

    pub fn enable_class(&self, class_id: ClassId, package_id: PackageId) {
        self.state.write().registry.enable_class(class_id, package_id);
    }

    pub fn disable_class(&self, class_id: ClassId, package_id: PackageId) {
        self.state.write().registry.disable_class(class_id, package_id);
    }

    pub fn modify_object(
        &self,
        object_id: ObjectId,
        edge_hook_bitmask: u32,
        lba_adjustment: u64,
    ) -> Result<()> {
        self.state
            .write()
            .registry
            .modify_object(object_id, edge_hook_bitmask, lba_adjustment)
    }

    pub fn modify_class(
        &self,
        class_id: ClassId,
        package_id: PackageId,
        edge_hook_bitmask: u32,
        lba_adjustment: u64,
    ) {
        self.state
            .write()
            .registry
            .modify_class(class_id, package_id, edge_hook_bitmask, lba_adjustment);
    }

    pub fn remove_object(&self, object_id: ObjectId) -> Result<()> {
        self.state.write().registry.remove_object(object_id)
    }

    /// Forget every object, class and per-object statistic.  Records and
    /// the enabled flag are left alone.
    pub fn destroy_objects(&self) {
        self.state.write().registry.destroy_objects();
    }

    pub fn targets(&self) -> Vec<InjectionTarget> {
        self.state.read().registry.targets()
    }

    // ── Statistics ──────────────────────────────────────────────

    pub fn get_stats(&self) -> GetStatsResult {
        let state = self.state.read();
        let mut out = GetStatsResult {
            enabled: state.enabled,
            num_objects: state.registry.num_objects(),
            num_records: state.store.len() as u64,
            num_objects_enabled: state.registry.num_objects_enabled(),
            ..Default::default()
        };
        self.counters.fill(&mut out);
        out
    }

    pub fn get_object_stats(&self, object_id: ObjectId) -> Result<GetObjectStatsResult> {
        self.state.read().registry.object_stats(object_id)
    }

    /// Add `object_id`'s statistics into `acc`.
    pub fn accumulate_object_stats(
        &self,
        acc: &mut GetObjectStatsResult,
        object_id: ObjectId,
    ) -> Result<()> {
        let stats = self.get_object_stats(object_id)?;
        acc.accumulate(&stats);
        Ok(())
    }

    // ── Flags ───────────────────────────────────────────────────

    pub fn flags(&self) -> EngineFlags {
        self.state.read().flags
    }

    pub fn disable_lba_normalize(&self) {
        self.state.write().flags.lba_normalize = false;
        log::info!("lba normalization disabled");
    }

    pub fn enable_lba_normalize(&self) {
        self.state.write().flags.lba_normalize = true;
        log::info!("lba normalization enabled");
    }

    pub fn enable_poc(&self) {
        self.state.write().flags.poc_injection = true;
        log::info!("poc injection enabled");
    }

    pub fn disable_poc(&self) {
        self.state.write().flags.poc_injection = false;
        log::info!("poc injection disabled");
    }

    pub fn enable_ignore_corrupt_crc_data_errors(&self) {
        self.state.write().flags.ignore_corrupt_crc_data_errors = true;
        log::info!("ignoring detected corrupt crc/data errors");
    }

    pub fn disable_ignore_corrupt_crc_data_errors(&self) {
        self.state.write().flags.ignore_corrupt_crc_data_errors = false;
        log::info!("validating detected corrupt crc/data errors");
    }

    /// Correlation context reflecting the current flags.
    pub fn correlation_context(&self) -> CorrelationContext {
        CorrelationContext {
            poc: self.state.read().flags.poc_injection,
            ..Default::default()
        }
    }

    // ── Tables ──────────────────────────────────────────────────

    pub fn get_table_info(&self, index: usize, simulation: bool) -> Result<TableInfo> {
        self.state.read().tables.info(index, simulation)
    }

    /// Info of the table last loaded with [`load_table`](Self::load_table).
    pub fn get_active_table_info(&self, simulation: bool) -> Result<TableInfo> {
        let state = self.state.read();
        let index = state
            .active_table
            .ok_or(LeiError::InvalidState("no table loaded"))?;
        state.tables.info(index, simulation)
    }

    /// Replace the record store with a canned table.  Only legal while
    /// disabled.
    pub fn load_table(&self, index: usize, simulation: bool) -> Result<()> {
        let mut state = self.state.write();
        if state.enabled {
            return Err(LeiError::InvalidState("load_table while enabled"));
        }
        let records = state.tables.get(index)?.records_for(simulation).to_vec();
        state.store.replace_all(&records)?;
        state.registry.clear_heals();
        state.active_table = Some(index);
        state.refresh_table_lba();
        log::info!(
            "loaded table {index} ({} records, simulation={simulation})",
            records.len()
        );
        Ok(())
    }

    /// Add a user-defined table and return its index.
    pub fn register_table(&self, table: CannedTable) -> Result<usize> {
        let index = self.state.write().tables.register(table)?;
        log::info!("registered table {index}");
        Ok(index)
    }

    // ── I/O path ────────────────────────────────────────────────

    /// Apply every matching record to `io`.
    ///
    /// `sectors` holds the I/O's data, one entry per block starting at
    /// `io.lba`; it may be shorter than the I/O (or empty) when the caller
    /// only wants the status.  Never fails: unmatched I/O passes through.
    pub fn intercept(&self, io: &IoRequest, sectors: &mut [Sector]) -> InjectionOutcome {
        let mut outcome = InjectionOutcome::pass_through(io.blocks);
        if io.blocks == 0 {
            return outcome;
        }
        let state = self.read_registering(io);
        if !state.enabled || !state.registry.is_enabled(io.object_id) {
            return outcome;
        }
        let Some(entry) = state.registry.get(io.object_id) else {
            return outcome;
        };

        if io.opcode == BlockOpcode::WriteVerify {
            self.remap_on_write_verify(entry, io);
        }

        let Some(adjusted) = io.lba.checked_sub(entry.target.lba_adjustment) else {
            return outcome;
        };
        let table_lba = if state.flags.lba_normalize {
            verified::normalize_lba(adjusted, io.blocks, state.max_table_lba)
        } else {
            adjusted
        };

        let scoped = state
            .store
            .armed()
            .filter(|s| s.record.object_id == Some(io.object_id));
        let unscoped = state.store.armed().filter(|s| s.record.object_id.is_none());

        for slot in scoped.chain(unscoped) {
            let record = &slot.record;
            if record.opcode.is_some_and(|op| op != io.opcode) {
                continue;
            }
            if record.object_id.is_none() && !record.covers_position(io.position) {
                continue;
            }

            if record.error_type.is_pre_io() {
                if !pre_io_applies(record.error_type, io.opcode) {
                    continue;
                }
                let Some((start, blocks)) =
                    verified::intersection(record.lba, record.blocks, adjusted, io.blocks)
                else {
                    continue;
                };
                let io_start = io.lba + (start - adjusted);
                let Some((lba, blocks)) = self.admit(slot, entry, io, io_start, blocks) else {
                    continue;
                };
                self.note_injection(entry, &mut outcome, slot, record.error_type, io, lba, blocks);
                if apply_pre_io(record, io, &mut outcome) {
                    return outcome;
                }
                continue;
            }

            if !sector_applies(record.error_type, io) {
                continue;
            }
            let Some((start, blocks)) =
                verified::intersection(record.lba, record.blocks, table_lba, io.blocks)
            else {
                continue;
            };
            let io_start = io.lba + (start - table_lba);
            let Some((lba, blocks)) = self.admit(slot, entry, io, io_start, blocks) else {
                continue;
            };

            let applied = if record.error_type.is_media() {
                self.apply_media(record.error_type, entry, io, lba, &mut outcome)
            } else {
                apply_corruption(record, io, lba, blocks, sectors);
                record.error_type
            };
            self.note_injection(entry, &mut outcome, slot, applied, io, lba, blocks);
        }
        outcome
    }

    /// Record that `[lba, lba + blocks)` on `position` was rewritten.
    ///
    /// Remapped blocks are no longer injected by INJECT_UNTIL_REMAPPED
    /// records.
    pub fn mark_remapped(
        &self,
        object_id: ObjectId,
        position: u16,
        lba: u64,
        blocks: u64,
    ) -> Result<()> {
        let state = self.state.read();
        let entry = state
            .registry
            .get(object_id)
            .ok_or(LeiError::ObjectNotFound(object_id))?;
        entry.ledger.lock().mark_remapped(position, lba, blocks);
        bump(&entry.counters.num_write_verify_blocks_remapped, blocks);
        log::debug!("object {object_id} position {position}: remapped {blocks} blocks at {lba:#x}");
        Ok(())
    }

    /// Check that a region the RAID engine found bad is explained by the
    /// records.  Returns whether it is.
    pub fn validate_region(&self, object_id: ObjectId, region: &ErrorRegion) -> Result<bool> {
        if region.blocks == 0 {
            return Err(LeiError::InvalidParameter("empty error region".into()));
        }
        let state = self.state.read();
        let entry = state
            .registry
            .get(object_id)
            .ok_or(LeiError::ObjectNotFound(object_id))?;

        if region.correctable {
            bump(&self.counters.correctable_errors_detected, 1);
        } else {
            bump(&self.counters.uncorrectable_errors_detected, 1);
        }

        let always_accepted = matches!(region.error_type, ErrorType::RaidCrc | ErrorType::CorruptCrc);
        let ignored = state.flags.ignore_corrupt_crc_data_errors
            && matches!(
                region.error_type,
                ErrorType::CorruptCrc | ErrorType::CorruptData | ErrorType::Invalidated
            );
        let valid = always_accepted || ignored || explained(&state, entry, object_id, region);

        if valid {
            bump(&self.counters.num_validations, 1);
            bump(&entry.counters.num_validations, 1);
        } else {
            bump(&self.counters.num_failed_validations, 1);
            log::warn!(
                "object {object_id}: unexplained {} region at {:#x}+{} positions {:#x}",
                region.error_type,
                region.lba,
                region.blocks,
                region.position_bitmask
            );
        }
        Ok(valid)
    }

    // ── Snapshot ────────────────────────────────────────────────

    /// Capture the RNG position.
    pub fn snapshot(&self) -> EngineSnapshot {
        let rng = self.rng.lock();
        EngineSnapshot {
            rng_seed: rng.get_seed(),
            rng_stream: rng.get_stream(),
            rng_word_pos: rng.get_word_pos(),
        }
    }

    /// Rewind the RNG to a snapshot.
    pub fn restore(&self, snapshot: &EngineSnapshot) {
        let mut rng = ChaCha20Rng::from_seed(snapshot.rng_seed);
        rng.set_stream(snapshot.rng_stream);
        rng.set_word_pos(snapshot.rng_word_pos);
        *self.rng.lock() = rng;
    }

    // ── Internal ────────────────────────────────────────────────

    fn rng_from_seed(seed: u64) -> ChaCha20Rng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&seed.to_le_bytes());
        ChaCha20Rng::from_seed(key)
    }

    /// Uniform draw from `0..limit`; `limit` of 0 is treated as 1.
    fn roll(&self, limit: u64) -> u64 {
        self.rng.lock().gen_range(0..limit.max(1))
    }

    /// Read lock on the state, registering `io`'s object first if an
    /// enabled class covers it.
    fn read_registering(&self, io: &IoRequest) -> RwLockReadGuard<'_, EngineState> {
        {
            let state = self.state.read();
            if !state.enabled || !state.registry.needs_registration(io.object_id, io.class_id) {
                return state;
            }
        }
        let mut state = self.state.write();
        state
            .registry
            .register_from_class(io.object_id, io.class_id, io.package_id);
        RwLockWriteGuard::downgrade(state)
    }

    fn remap_on_write_verify(&self, entry: &ObjectEntry, io: &IoRequest) {
        let mut ledger = entry.ledger.lock();
        if let Some(bad) = ledger.take_covered_media_error(io.position, io.lba, io.blocks) {
            ledger.mark_remapped(io.position, bad, 1);
            bump(&entry.counters.num_write_verify_blocks_remapped, 1);
            log::debug!(
                "object {} position {}: write-verify remapped {bad:#x}",
                io.object_id,
                io.position
            );
        }
    }

    /// Mode gating.  Returns the part of the window that injects.
    fn admit(
        &self,
        slot: &Slot,
        entry: &ObjectEntry,
        io: &IoRequest,
        lba: u64,
        blocks: u64,
    ) -> Option<(u64, u64)> {
        let record = &slot.record;
        let counters = &slot.counters;

        // A delay record's err_limit is its delay, not a cap.
        if record.error_type.is_delay()
            && matches!(
                record.error_mode,
                ErrorMode::Count | ErrorMode::Random | ErrorMode::TransitoryRandom
            )
        {
            counters.note_injection();
            return Some((lba, blocks));
        }

        match record.error_mode {
            ErrorMode::Count => counters.try_claim(record.err_limit).then_some((lba, blocks)),
            ErrorMode::Always => {
                counters.note_injection();
                Some((lba, blocks))
            }
            ErrorMode::Random => {
                if self.roll(record.err_limit) != 0 {
                    return None;
                }
                counters.note_injection();
                Some((lba, blocks))
            }
            ErrorMode::Skip | ErrorMode::SkipInsert => counters
                .skip_gate(record.skip_limit)
                .then_some((lba, blocks)),
            ErrorMode::InjectUntilRemapped => {
                let run = {
                    let ledger = entry.ledger.lock();
                    verified::first_run(lba, blocks, |l| ledger.is_remapped(io.position, l))?
                };
                counters.note_injection();
                Some(run)
            }
            ErrorMode::InjectSameLba => {
                counters.note_injection();
                Some((lba, 1))
            }
            ErrorMode::Transitory => self.transient(slot, entry, io, lba, blocks),
            ErrorMode::TransitoryRandom => {
                if self.roll(record.err_limit) == 0 {
                    self.transient(slot, entry, io, lba, blocks)
                } else {
                    counters.note_injection();
                    Some((lba, blocks))
                }
            }
        }
    }

    /// Inject once per block, then heal it.  Retries always see good data.
    fn transient(
        &self,
        slot: &Slot,
        entry: &ObjectEntry,
        io: &IoRequest,
        lba: u64,
        blocks: u64,
    ) -> Option<(u64, u64)> {
        if io.retried {
            return None;
        }
        let mut ledger = entry.ledger.lock();
        let (start, run) =
            verified::first_run(lba, blocks, |l| ledger.is_healed(slot.handle, io.position, l))?;
        for l in start..start + run {
            ledger.heal(slot.handle, io.position, l);
        }
        slot.counters.note_injection();
        Some((start, run))
    }

    /// Apply a media error at `lba` and return the type actually used.
    fn apply_media(
        &self,
        error_type: ErrorType,
        entry: &ObjectEntry,
        io: &IoRequest,
        lba: u64,
        outcome: &mut InjectionOutcome,
    ) -> ErrorType {
        let resolved = match error_type {
            ErrorType::RandomMedia if self.roll(2) == 0 => ErrorType::HardMedia,
            ErrorType::RandomMedia => ErrorType::SoftMedia,
            other => other,
        };
        entry.ledger.lock().note_media_error(io.position, lba);
        if io.opcode == BlockOpcode::Read {
            bump(&entry.counters.num_read_media_errors_injected, 1);
        }

        match (resolved, outcome.status) {
            (ErrorType::HardMedia, IoStatus::MediaError { lba: prior }) if prior <= lba => {}
            (ErrorType::HardMedia, _) => {
                outcome.status = IoStatus::MediaError { lba };
                outcome.blocks_transferred = outcome.blocks_transferred.min(lba - io.lba);
            }
            (_, IoStatus::Success) => outcome.status = IoStatus::RemapRequired { lba },
            (_, IoStatus::RemapRequired { lba: prior }) if lba < prior => {
                outcome.status = IoStatus::RemapRequired { lba }
            }
            _ => {}
        }
        resolved
    }

    #[allow(clippy::too_many_arguments)]
    fn note_injection(
        &self,
        entry: &ObjectEntry,
        outcome: &mut InjectionOutcome,
        slot: &Slot,
        error_type: ErrorType,
        io: &IoRequest,
        lba: u64,
        blocks: u64,
    ) {
        bump(&self.counters.num_errors_injected, 1);
        bump(&entry.counters.num_errors_injected, 1);
        let correctable = events::is_correctable(
            error_type,
            io.position,
            slot.record.err_adj,
            io.redundant,
            io.raid_kind,
        );
        log::debug!(
            "record {} injected {error_type} on object {} position {} at {lba:#x}+{blocks} ({})",
            slot.handle,
            io.object_id,
            io.position,
            if correctable { "correctable" } else { "uncorrectable" }
        );
        outcome.injected.push(InjectedError {
            handle: slot.handle,
            error_type,
            position: io.position,
            lba,
            blocks,
            parity: io.is_parity_position(),
            correctable,
            error_info: events::error_info_bits(error_type, io.retried, false),
            raid_kind: io.raid_kind,
            retried: io.retried,
        });
    }
}

// ── I/O helpers ─────────────────────────────────────────────────

fn pre_io_applies(error_type: ErrorType, opcode: BlockOpcode) -> bool {
    match error_type {
        ErrorType::Timeout | ErrorType::SilentDrop => opcode.is_write(),
        ErrorType::IncompleteWrite => {
            matches!(opcode, BlockOpcode::Write | BlockOpcode::WriteVerify)
        }
        ErrorType::DelayUp | ErrorType::DelayDown => {
            matches!(opcode, BlockOpcode::Read | BlockOpcode::Write)
        }
        ErrorType::KeyError | ErrorType::KeyNotFound | ErrorType::EncryptionNotEnabled => true,
        _ => false,
    }
}

/// Apply a pre-I/O record.  Returns whether the I/O is finished.
fn apply_pre_io(record: &ErrorRecord, io: &IoRequest, outcome: &mut InjectionOutcome) -> bool {
    let failed = |qualifier| IoStatus::IoFailed { qualifier };
    match record.error_type {
        ErrorType::Timeout => {
            outcome.status = failed(IoQualifier::UnexpectedError);
            outcome.blocks_transferred = 0;
        }
        ErrorType::SilentDrop => outcome.status = IoStatus::Dropped,
        ErrorType::IncompleteWrite => {
            outcome.status = failed(IoQualifier::RetryNotPossible);
            outcome.blocks_transferred = io.blocks.saturating_sub(1);
        }
        ErrorType::DelayDown | ErrorType::DelayUp => {
            if outcome.delay.is_none() {
                let direction = if record.error_type == ErrorType::DelayDown {
                    DelayDirection::Down
                } else {
                    DelayDirection::Up
                };
                outcome.delay = Some(Delay {
                    direction,
                    ms: record.err_limit,
                });
            }
            return false;
        }
        ErrorType::KeyError => outcome.status = failed(IoQualifier::KeyError),
        ErrorType::KeyNotFound => outcome.status = failed(IoQualifier::KeyNotFound),
        ErrorType::EncryptionNotEnabled => {
            outcome.status = failed(IoQualifier::EncryptionNotEnabled)
        }
        _ => return false,
    }
    true
}

/// Whether a sector-path type may be applied to `io`.
fn sector_applies(error_type: ErrorType, io: &IoRequest) -> bool {
    if !io.opcode.is_sector_eligible() {
        return false;
    }
    if io.opcode.is_write() && !error_type.applies_to_writes() {
        return false;
    }
    if io.raid_kind == RaidKind::HotSpare && !error_type.allowed_on_hot_spare() {
        return false;
    }
    if io.raid_kind == RaidKind::Raid6
        && matches!(
            error_type,
            ErrorType::Invalidated | ErrorType::RaidCrc | ErrorType::CorruptCrc
        )
    {
        return false;
    }
    if error_type.is_media() {
        return match io.opcode {
            BlockOpcode::Read | BlockOpcode::Write | BlockOpcode::WriteVerify => true,
            BlockOpcode::Verify | BlockOpcode::ErrorVerify => !io.redundant,
            BlockOpcode::Zero | BlockOpcode::WriteNoncached => false,
        };
    }
    true
}

fn apply_corruption(
    record: &ErrorRecord,
    io: &IoRequest,
    lba: u64,
    blocks: u64,
    sectors: &mut [Sector],
) {
    for block in lba..lba + blocks {
        let Some(sector) = usize::try_from(block - io.lba)
            .ok()
            .and_then(|i| sectors.get_mut(i))
        else {
            break;
        };
        corrupt_sector(
            sector,
            &Corruption {
                error_type: record.error_type,
                seed: block,
                position: io.position,
                width: io.width,
                parity_bitmask: io.parity_bitmask,
                raid_kind: io.raid_kind,
                start_bit: record.start_bit,
                num_bits: record.num_bits,
                bit_adj: record.bit_adj,
                crc_det: record.crc_det,
            },
        );
    }
}

// ── Validation helpers ──────────────────────────────────────────

/// Whether the records account for every block of `region`.
fn explained(
    state: &EngineState,
    entry: &ObjectEntry,
    object_id: ObjectId,
    region: &ErrorRegion,
) -> bool {
    let Some(adjusted) = region.lba.checked_sub(entry.target.lba_adjustment) else {
        return false;
    };
    let mut cursor = if state.flags.lba_normalize {
        verified::normalize_lba(adjusted, region.blocks, state.max_table_lba)
    } else {
        adjusted
    };
    let Some(end) = verified::range_end(cursor, region.blocks) else {
        return false;
    };

    while cursor < end {
        let found = state.store.armed().find(|s| {
            let r = &s.record;
            let in_scope = match r.object_id {
                Some(id) => id == object_id,
                None => r.position_bitmap & region.position_bitmask != 0,
            };
            in_scope
                && verified::ranges_overlap(r.lba, r.blocks, cursor, 1)
                && types_equivalent(r.error_type, region.error_type)
                && correctability_matches(r, region)
        });
        match found {
            Some(slot) => cursor = slot.record.end().min(end),
            None => return false,
        }
    }
    true
}

/// Whether an injected type explains a detected type.
fn types_equivalent(injected: ErrorType, detected: ErrorType) -> bool {
    if injected.detected_as() == detected.detected_as() {
        return true;
    }
    if injected.is_media() && detected.is_media() {
        return injected == ErrorType::RandomMedia || detected == ErrorType::RandomMedia;
    }
    injected.category() == ErrorCategory::Checksum
        && detected.category() == ErrorCategory::Checksum
        && lei_protocol::vr_reason(events::error_info_bits(injected, false, false))
            == lei_protocol::vr_reason(events::error_info_bits(detected, false, false))
}

fn correctability_matches(record: &ErrorRecord, region: &ErrorRegion) -> bool {
    if record.error_type == ErrorType::RandomMedia {
        return true;
    }
    let position = region.position_bitmask.trailing_zeros() as u16;
    events::is_correctable(
        record.error_type,
        position,
        record.err_adj,
        region.redundant,
        region.raid_kind,
    ) == region.correctable
}
