//! The event-log contract between injected errors and the RAID engine.
//!
//! The injection engine never emits events.  It does fix, for every
//! injection, which event-log messages a correct RAID engine must emit
//! when it finds the error: message code, FRU position, LBA range and the
//! verify-report error-info bits.  Tests compare the RAID engine's log
//! against [`expected_events`].
//!
//! ```text
//! error type ──→ error_info_bits() ──→ reason + flags
//!                                         │
//! correctable? ─┬─ yes ─→ one event, by priority:
//!               │          retried → reconstructed
//!               │          lba stamp → LBA_STAMP_ERROR
//!               │          coherency (non-RAID6) → (EXPECTED_)COHERENCY_ERROR
//!               │          unexpected crc → DATA/PARITY_CHECKSUM_ERROR
//!               │          otherwise → reconstructed
//!               └─ no ──→ UNCORRECTABLE_(PARITY_)SECTOR
//!                         then SECTOR_INVALIDATED / PARITY_SECTOR_RECONSTRUCTED
//! ```

use lei_protocol::*;
use serde::{Deserialize, Serialize};

use crate::engine::IoRequest;
use crate::record::ErrorRecord;
use crate::types::{ErrorCategory, ErrorType, RaidKind};
use crate::verified;

/// One event-log message the RAID engine is expected to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEvent {
    pub code: u32,
    pub fru_position: u16,
    pub lba: u64,
    pub blocks: u64,
    pub error_info: u32,
}

impl ExpectedEvent {
    /// Whether the message is informational rather than an error.
    pub fn is_info(&self) -> bool {
        is_info_event(self.code)
    }
}

/// Conditions of the RAID operation that found the error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// The RAID engine zeroed the sector on reconstruction.
    pub zeroed: bool,
    /// Found while verifying after an incomplete write.
    pub incomplete_write_verify: bool,
    /// Parity-of-checksum injection is enabled.
    pub poc: bool,
}

/// Verify-report bits for an error of `error_type`.
///
/// Returns 0 for types that never reach a sector.
pub fn error_info_bits(error_type: ErrorType, retried: bool, zeroed: bool) -> u32 {
    let base = match error_type {
        ErrorType::HardMedia | ErrorType::SoftMedia | ErrorType::RandomMedia => VR_MEDIA_CRC,
        ErrorType::KlondCrc => VR_KLONDIKE_CRC,
        ErrorType::DhCrc => VR_DH_CRC,
        ErrorType::RaidCrc => VR_RAID_CRC,
        ErrorType::CorruptCrc => VR_CORRUPT_CRC,
        ErrorType::CorruptData => VR_CORRUPT_DATA,
        ErrorType::Invalidated => VR_INVALID_CRC,
        ErrorType::LbaStamp => VR_LBA_STAMP,
        ErrorType::SingleBitCrc => VR_UNEXPECTED_CRC | VR_SINGLE_BIT_CRC,
        ErrorType::Crc | ErrorType::MultiBitCrc | ErrorType::MultiBitWithLbaStamp => {
            VR_UNEXPECTED_CRC | VR_MULTI_BIT_CRC
        }
        ErrorType::WriteStamp | ErrorType::BogusWriteStamp => VR_WS,
        ErrorType::TimeStamp | ErrorType::BogusTimeStamp => VR_TS,
        ErrorType::ShedStamp | ErrorType::BogusShedStamp => VR_SS,
        ErrorType::Coherency => VR_COH,
        ErrorType::RawMirrorBadMagic => VR_RAW_MIRROR_MAGIC_NUM,
        ErrorType::RawMirrorBadSequence => VR_RAW_MIRROR_SEQ_NUM,
        ErrorType::Timeout
        | ErrorType::SilentDrop
        | ErrorType::DelayUp
        | ErrorType::DelayDown
        | ErrorType::IncompleteWrite
        | ErrorType::KeyError
        | ErrorType::KeyNotFound
        | ErrorType::EncryptionNotEnabled => return 0,
    };
    let mut bits = base;
    if zeroed {
        bits |= VR_ZEROED;
    }
    if retried {
        bits |= VR_CRC_RETRY;
    }
    bits
}

/// Whether a redundant group can rebuild the data an injection destroys.
///
/// Transport errors and soft media errors lose nothing.  Everything else
/// is correctable only on a redundant object, and only while the strip
/// has no more errored positions (`err_adj` plus this one) than the group
/// tolerates.
pub fn is_correctable(
    error_type: ErrorType,
    position: u16,
    err_adj: u16,
    redundant: bool,
    raid_kind: RaidKind,
) -> bool {
    match error_type.category() {
        ErrorCategory::Transport | ErrorCategory::Encryption => return true,
        ErrorCategory::Media if error_type == ErrorType::SoftMedia => return true,
        _ => {}
    }
    if !redundant {
        return false;
    }
    let tolerance = if raid_kind == RaidKind::Raid6 { 2 } else { 1 };
    (err_adj | verified::position_bit(position)).count_ones() <= tolerance
}

/// Events for an error of `error_type` over `[lba, lba + blocks)` at
/// `position`.
#[allow(clippy::too_many_arguments)]
pub fn events_for(
    error_type: ErrorType,
    position: u16,
    parity: bool,
    lba: u64,
    blocks: u64,
    correctable: bool,
    raid6: bool,
    retried: bool,
    ctx: &CorrelationContext,
) -> Vec<ExpectedEvent> {
    let mut error_info = error_info_bits(error_type, retried, ctx.zeroed);
    if error_info == 0 {
        return Vec::new();
    }
    if ctx.poc && parity && error_type == ErrorType::Coherency {
        error_info = (error_info & !VR_COH) | VR_POC;
    }
    let event = |code| ExpectedEvent {
        code,
        fru_position: position,
        lba,
        blocks,
        error_info,
    };
    let reconstructed = if parity {
        EVENT_HOST_PARITY_SECTOR_RECONSTRUCTED
    } else {
        EVENT_HOST_SECTOR_RECONSTRUCTED
    };

    if !correctable {
        let (first, second) = if parity {
            (
                EVENT_HOST_UNCORRECTABLE_PARITY_SECTOR,
                EVENT_HOST_PARITY_SECTOR_RECONSTRUCTED,
            )
        } else {
            (EVENT_HOST_UNCORRECTABLE_SECTOR, EVENT_HOST_SECTOR_INVALIDATED)
        };
        return vec![event(first), event(second)];
    }

    let code = if retried {
        reconstructed
    } else if vr_reason(error_info) == VR_LBA_STAMP {
        EVENT_HOST_LBA_STAMP_ERROR
    } else if error_info & (VR_COH | VR_POC | VR_N_POC) != 0 && !raid6 {
        if ctx.incomplete_write_verify {
            EVENT_EXPECTED_COHERENCY_ERROR
        } else {
            EVENT_HOST_COHERENCY_ERROR
        }
    } else if error_info & VR_UNEXPECTED_CRC != 0 {
        if parity {
            EVENT_HOST_PARITY_CHECKSUM_ERROR
        } else {
            EVENT_HOST_DATA_CHECKSUM_ERROR
        }
    } else {
        reconstructed
    };
    vec![event(code)]
}

/// Events a RAID engine must log when it detects `record`'s error in `io`.
///
/// `io` is taken in record address space: the caller applies any LBA
/// adjustment or table wrap before asking.  Returns nothing when the
/// record does not cover the I/O.
pub fn expected_events(
    record: &ErrorRecord,
    io: &IoRequest,
    ctx: &CorrelationContext,
) -> Vec<ExpectedEvent> {
    let Some((lba, blocks)) = verified::intersection(record.lba, record.blocks, io.lba, io.blocks)
    else {
        return Vec::new();
    };
    if !record.covers_position(io.position) && record.object_id != Some(io.object_id) {
        return Vec::new();
    }
    let (lba, blocks) = if record.error_mode == crate::types::ErrorMode::InjectSameLba {
        (lba, 1)
    } else {
        (lba, blocks)
    };
    let correctable = is_correctable(
        record.error_type,
        io.position,
        record.err_adj,
        io.redundant,
        io.raid_kind,
    );
    events_for(
        record.error_type,
        io.position,
        io.is_parity_position(),
        lba,
        blocks,
        correctable,
        io.raid_kind == RaidKind::Raid6,
        io.retried,
        ctx,
    )
}
