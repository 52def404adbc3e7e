//! Error records: one injection rule each.
//!
//! A record names an LBA range, the RAID positions it applies to, what to
//! do to matching blocks ([`ErrorType`]) and how often ([`ErrorMode`]).
//! Records are plain data; their counters live in the
//! [`RecordStore`](crate::store::RecordStore) slot that holds them.

use std::fmt;

use lei_protocol::{MAX_DELAY_MS, MAX_WIDTH};
use serde::{Deserialize, Serialize};

use crate::error::{LeiError, Result};
use crate::types::{BlockOpcode, ErrorMode, ErrorType, ObjectId};
use crate::verified;

/// Handle returned by record creation.  Stable until the record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordHandle(pub usize);

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One injection rule.
///
/// Equality compares content only; counters are not part of a record.
///
/// # Example
///
/// ```
/// use lei_engine::record::ErrorRecord;
/// use lei_engine::types::{ErrorMode, ErrorType};
///
/// let rec = ErrorRecord::new(ErrorType::Crc, ErrorMode::Count)
///     .range(0x0, 0x10)
///     .positions(0x10, 5)
///     .limit(0x10);
/// assert!(rec.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Positions (bit per column) this record applies to.
    pub position_bitmap: u16,
    /// Width the bitmap is interpreted against.
    pub width: u16,
    pub lba: u64,
    pub blocks: u64,
    pub error_type: ErrorType,
    pub error_mode: ErrorMode,
    /// Injection cap (COUNT), probability divisor (RANDOM, TRANS_RND) or
    /// delay in milliseconds (DELAY_UP, DELAY_DOWN).
    #[serde(default)]
    pub err_limit: u64,
    /// Matches to let through per SKIP phase.
    #[serde(default)]
    pub skip_limit: u64,
    /// Positions that carry an error in the same strip.  Used to decide
    /// whether redundancy can still correct the strip.
    #[serde(default)]
    pub err_adj: u16,
    /// First bit flipped by a coherency error.
    #[serde(default)]
    pub start_bit: u16,
    /// Number of bits flipped by a coherency error.
    #[serde(default)]
    pub num_bits: u16,
    /// Whether the flipped bits are contiguous.
    #[serde(default)]
    pub bit_adj: bool,
    /// Whether a coherency error is detectable by the checksum.
    #[serde(default)]
    pub crc_det: bool,
    /// Only match this opcode.  `None` matches any.
    #[serde(default)]
    pub opcode: Option<BlockOpcode>,
    /// Scope the record to one object.
    #[serde(default)]
    pub object_id: Option<ObjectId>,
}

impl ErrorRecord {
    /// A record covering block 0 of position 0 on a single-column group.
    pub fn new(error_type: ErrorType, error_mode: ErrorMode) -> Self {
        Self {
            position_bitmap: 0x1,
            width: 1,
            lba: 0,
            blocks: 1,
            error_type,
            error_mode,
            err_limit: 0,
            skip_limit: 0,
            err_adj: 0,
            start_bit: 0,
            num_bits: 0,
            bit_adj: false,
            crc_det: false,
            opcode: None,
            object_id: None,
        }
    }

    pub fn range(mut self, lba: u64, blocks: u64) -> Self {
        self.lba = lba;
        self.blocks = blocks;
        self
    }

    pub fn positions(mut self, position_bitmap: u16, width: u16) -> Self {
        self.position_bitmap = position_bitmap;
        self.width = width;
        self
    }

    pub fn limit(mut self, err_limit: u64) -> Self {
        self.err_limit = err_limit;
        self
    }

    pub fn skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn opcode(mut self, opcode: BlockOpcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn adjacent_errors(mut self, err_adj: u16) -> Self {
        self.err_adj = err_adj;
        self
    }

    /// Bit pattern for coherency errors.
    pub fn coherency_bits(mut self, start_bit: u16, num_bits: u16, bit_adj: bool, crc_det: bool) -> Self {
        self.start_bit = start_bit;
        self.num_bits = num_bits;
        self.bit_adj = bit_adj;
        self.crc_det = crc_det;
        self
    }

    pub fn for_object(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    /// Exclusive end of the covered range.  Only meaningful once
    /// [`validate`](Self::validate) has passed.
    pub fn end(&self) -> u64 {
        self.lba.saturating_add(self.blocks)
    }

    /// Whether the record applies to `position`.
    pub fn covers_position(&self, position: u16) -> bool {
        self.position_bitmap & verified::position_bit(position) != 0
    }

    /// Check the record against the default delay cap.
    pub fn validate(&self) -> Result<()> {
        self.validate_with_delay_cap(MAX_DELAY_MS)
    }

    /// Check every structural invariant of the record.
    pub fn validate_with_delay_cap(&self, max_delay_ms: u64) -> Result<()> {
        if self.blocks == 0 {
            return Err(invalid(format!("record at lba {:#x} has zero blocks", self.lba)));
        }
        if verified::range_end(self.lba, self.blocks).is_none() {
            return Err(invalid(format!(
                "lba {:#x} + blocks {:#x} overflows",
                self.lba, self.blocks
            )));
        }
        if self.width == 0 || self.width > MAX_WIDTH {
            return Err(invalid(format!("width {} outside 1..={MAX_WIDTH}", self.width)));
        }
        if !verified::bitmap_fits_width(self.position_bitmap, self.width) {
            return Err(invalid(format!(
                "position bitmap {:#x} exceeds width {}",
                self.position_bitmap, self.width
            )));
        }
        if self.position_bitmap == 0 && self.object_id.is_none() {
            return Err(invalid("empty position bitmap on an unscoped record".into()));
        }
        if !verified::bitmap_fits_width(self.err_adj, self.width) {
            return Err(invalid(format!(
                "adjacency bitmap {:#x} exceeds width {}",
                self.err_adj, self.width
            )));
        }
        if self.error_type.is_delay() && self.err_limit > max_delay_ms {
            return Err(invalid(format!(
                "delay {} ms exceeds {max_delay_ms} ms",
                self.err_limit
            )));
        }
        if self.error_type == ErrorType::Coherency
            && verified::coherency_mask(self.start_bit, self.num_bits, self.bit_adj).is_none()
        {
            return Err(invalid(format!(
                "coherency bits start={} num={} do not fit a word",
                self.start_bit, self.num_bits
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} pos={:#x} width={} lba={:#x} blocks={:#x} limit={}",
            self.error_type,
            self.error_mode,
            self.position_bitmap,
            self.width,
            self.lba,
            self.blocks,
            self.err_limit
        )?;
        if let Some(op) = self.opcode {
            write!(f, " op={op}")?;
        }
        if let Some(obj) = self.object_id {
            write!(f, " obj={obj}")?;
        }
        Ok(())
    }
}

fn invalid(msg: String) -> LeiError {
    log::warn!("rejecting error record: {msg}");
    LeiError::InvalidParameter(msg)
}
