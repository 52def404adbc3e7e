//! Shared constants between the logical error injection engine and the
//! storage stack that consumes it.
//!
//! The RAID engine, the injection engine and the test driver all need to
//! agree on a handful of numbers: block opcodes, the on-disk sector
//! layout and its checksum, the verify-report (VR) error-info bits, and
//! the event-log message codes a RAID group emits when it finds an
//! injected error.  They live here so that neither side has to depend on
//! the other.  The crate is `no_std`-compatible with zero dependencies.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Limits
// ═══════════════════════════════════════════════════════════════════════

/// Maximum number of live error records.
pub const MAX_RECORDS: usize = 256;

/// Maximum number of canned error tables.
pub const MAX_TABLES: usize = 17;

/// Maximum length of a canned table description, in bytes.
pub const MAX_TABLE_DESCRIPTION_LEN: usize = 128;

/// Maximum delay a DELAY_UP / DELAY_DOWN record may request.
pub const MAX_DELAY_MS: u64 = 10_000;

/// Widest RAID group a position bitmap can describe.
pub const MAX_WIDTH: u16 = 16;

/// Gap left between the last record and the wrap point of a table.
pub const TABLE_LBA_GAP: u64 = 100;

/// The table wrap point is rounded up to a multiple of this (one chunk).
pub const TABLE_ROUND_BLOCKS: u64 = 0x800;

// ═══════════════════════════════════════════════════════════════════════
//  Block opcodes
// ═══════════════════════════════════════════════════════════════════════

pub const OPCODE_READ: u8 = 0x01;
pub const OPCODE_WRITE: u8 = 0x02;
pub const OPCODE_VERIFY: u8 = 0x03;
pub const OPCODE_ERROR_VERIFY: u8 = 0x04;
pub const OPCODE_WRITE_VERIFY: u8 = 0x05;
pub const OPCODE_ZERO: u8 = 0x06;
pub const OPCODE_WRITE_NONCACHED: u8 = 0x07;

// ═══════════════════════════════════════════════════════════════════════
//  Sector layout
// ═══════════════════════════════════════════════════════════════════════

/// Bytes of user data per sector.
pub const SECTOR_DATA_BYTES: usize = 512;

/// Number of 32-bit words in the data area.
pub const SECTOR_DATA_WORDS: usize = SECTOR_DATA_BYTES / 4;

/// Full sector size including the four 16-bit metadata fields.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x000   512   data
/// 0x200   2     crc
/// 0x202   2     time_stamp
/// 0x204   2     write_stamp
/// 0x206   2     lba_stamp (shed stamp on parity positions)
/// ```
pub const SECTOR_BYTES: usize = SECTOR_DATA_BYTES + 8;

/// Checksum of an all-zero data area.
pub const CHECKSUM_SEED: u16 = 0x5EED;

/// Byte offset of the raw-mirror magic number inside the data area.
pub const RAW_MIRROR_MAGIC_OFFSET: usize = SECTOR_DATA_BYTES - 16;

/// Byte offset of the raw-mirror sequence number inside the data area.
pub const RAW_MIRROR_SEQUENCE_OFFSET: usize = SECTOR_DATA_BYTES - 8;

/// Magic number carried by every valid raw-mirror sector.
pub const RAW_MIRROR_MAGIC: u64 = 0x5241_574D_4952_524F;

/// Compute the metadata checksum of a sector's data area.
///
/// XORs every little-endian data word into the seed and folds the high
/// half onto the low half.  Flipping the same bit in two different words
/// leaves the checksum unchanged, which is how coherency errors are built.
pub fn checksum(data: &[u8; SECTOR_DATA_BYTES]) -> u16 {
    let mut acc = CHECKSUM_SEED as u32;
    let mut i = 0;
    while i < SECTOR_DATA_BYTES {
        acc ^= u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;
    }
    ((acc >> 16) ^ (acc & 0xFFFF)) as u16
}

// ── Invalidated sectors ─────────────────────────────────────────

/// First data word of a sector the RAID layer (or injection) invalidated.
pub const INVALID_SECTOR_TEST_WORD: u32 = 0xBAD0_BAD0;

/// Second data word: why the sector was invalidated.
pub const INVALID_REASON_DATA_LOST: u32 = 0x01;
pub const INVALID_REASON_VERIFY: u32 = 0x02;
pub const INVALID_REASON_CORRUPT_CRC: u32 = 0x03;
pub const INVALID_REASON_DH_INVALIDATED: u32 = 0x04;
pub const INVALID_REASON_CORRUPT_DATA: u32 = 0x05;

/// Third data word: who invalidated it.
pub const INVALID_WHO_ERROR_INJECTION: u32 = 0x02;

// ═══════════════════════════════════════════════════════════════════════
//  Verify-report error-info bits
// ═══════════════════════════════════════════════════════════════════════

pub const VR_UNEXPECTED_CRC: u32 = 0x0000_0001;
pub const VR_COH: u32 = 0x0000_0002;
pub const VR_TS: u32 = 0x0000_0004;
pub const VR_WS: u32 = 0x0000_0008;
pub const VR_SS: u32 = 0x0000_0010;
pub const VR_POC: u32 = 0x0000_0020;
pub const VR_N_POC: u32 = 0x0000_0040;
pub const VR_UNKNOWN_COH: u32 = 0x0000_0080;
pub const VR_ZEROED: u32 = 0x0000_0100;
pub const VR_CRC_RETRY: u32 = 0x0000_0200;

/// The reason field is a small enumeration, not a bitmask.
pub const VR_REASON_SHIFT: u32 = 16;
pub const VR_REASON_MASK: u32 = 0x00FF_0000;

pub const VR_RAID_CRC: u32 = 0x01 << VR_REASON_SHIFT;
pub const VR_KLONDIKE_CRC: u32 = 0x02 << VR_REASON_SHIFT;
pub const VR_DH_CRC: u32 = 0x03 << VR_REASON_SHIFT;
pub const VR_MEDIA_CRC: u32 = 0x04 << VR_REASON_SHIFT;
pub const VR_CORRUPT_CRC: u32 = 0x05 << VR_REASON_SHIFT;
pub const VR_CORRUPT_DATA: u32 = 0x06 << VR_REASON_SHIFT;
pub const VR_SINGLE_BIT_CRC: u32 = 0x07 << VR_REASON_SHIFT;
pub const VR_MULTI_BIT_CRC: u32 = 0x08 << VR_REASON_SHIFT;
pub const VR_INVALID_CRC: u32 = 0x09 << VR_REASON_SHIFT;
pub const VR_BAD_CRC: u32 = 0x0A << VR_REASON_SHIFT;
pub const VR_COPY_CRC: u32 = 0x0B << VR_REASON_SHIFT;
pub const VR_PVD_METADATA_CRC: u32 = 0x0C << VR_REASON_SHIFT;
pub const VR_LBA_STAMP: u32 = 0x0D << VR_REASON_SHIFT;
pub const VR_RAW_MIRROR_MAGIC_NUM: u32 = 0x0E << VR_REASON_SHIFT;
pub const VR_RAW_MIRROR_SEQ_NUM: u32 = 0x0F << VR_REASON_SHIFT;

/// Extract the reason field of an error-info word.
pub const fn vr_reason(error_info: u32) -> u32 {
    error_info & VR_REASON_MASK
}

// ═══════════════════════════════════════════════════════════════════════
//  Event-log message codes
// ═══════════════════════════════════════════════════════════════════════

pub const EVENT_HOST_SECTOR_RECONSTRUCTED: u32 = 0x6168_0002;
pub const EVENT_HOST_PARITY_SECTOR_RECONSTRUCTED: u32 = 0x6168_0003;
pub const EVENT_EXPECTED_COHERENCY_ERROR: u32 = 0x6168_0004;

pub const EVENT_HOST_SECTOR_INVALIDATED: u32 = 0xE168_8001;
pub const EVENT_HOST_UNCORRECTABLE_SECTOR: u32 = 0xE168_8002;
pub const EVENT_HOST_DATA_CHECKSUM_ERROR: u32 = 0xE168_8003;
pub const EVENT_HOST_PARITY_CHECKSUM_ERROR: u32 = 0xE168_8004;
pub const EVENT_HOST_LBA_STAMP_ERROR: u32 = 0xE168_8005;
pub const EVENT_HOST_COHERENCY_ERROR: u32 = 0xE168_8006;
pub const EVENT_HOST_UNCORRECTABLE_PARITY_SECTOR: u32 = 0xE168_8007;

/// Whether an event code is informational (does not call home).
pub const fn is_info_event(code: u32) -> bool {
    code & 0xF000_0000 == 0x6000_0000
}

// ═══════════════════════════════════════════════════════════════════════
//  Table flags
// ═══════════════════════════════════════════════════════════════════════

/// Every error in the table can be corrected by a redundant group.
pub const TABLE_FLAG_CORRECTABLE: u32 = 0x01;
/// The table may produce uncorrectable errors.
pub const TABLE_FLAG_UNCORRECTABLE: u32 = 0x02;
/// Position bitmaps are physical and apply to any RAID type.
pub const TABLE_FLAG_ALL_RAID_TYPES: u32 = 0x04;
/// Position bitmaps are RAID6 logical positions.
pub const TABLE_FLAG_RAID6_ONLY: u32 = 0x08;

/// Exactly one correctability flag and one RAID-type flag must be set.
pub const fn table_flags_valid(flags: u32) -> bool {
    let correctability = flags & (TABLE_FLAG_CORRECTABLE | TABLE_FLAG_UNCORRECTABLE);
    let raid = flags & (TABLE_FLAG_ALL_RAID_TYPES | TABLE_FLAG_RAID6_ONLY);
    correctability.count_ones() == 1 && raid.count_ones() == 1
}
