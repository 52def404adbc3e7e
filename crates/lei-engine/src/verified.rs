//! Pure functions for range matching, bitmap checks and LBA normalization.
//!
//! Every function in this module is:
//! - **Pure**: no locks, no RNG, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` preconditions and
//!   postconditions on every non-trivial function.
//!
//! The engine and the record store call these instead of open-coding the
//! arithmetic so the overflow-sensitive parts live in one place.
//!
//! | Function                  | Used by                                   |
//! |---------------------------|-------------------------------------------|
//! | [`range_end`]             | record validation, table max LBA          |
//! | [`ranges_overlap`]        | record matching, validation               |
//! | [`intersection`]          | media-error window, sector corruption     |
//! | [`bitmap_fits_width`]     | record validation                         |
//! | [`max_table_lba`]         | `enable()`, `load_table()`                |
//! | [`normalize_lba`]         | record matching                           |
//! | [`first_run`]             | remap and heal suppression                |
//! | [`coherency_mask`]        | coherency corruption, record validation   |

use lei_protocol::{TABLE_LBA_GAP, TABLE_ROUND_BLOCKS};

// ─── Ranges ─────────────────────────────────────────────────────────

/// Exclusive end of `[lba, lba + blocks)`, or `None` on overflow.
pub fn range_end(lba: u64, blocks: u64) -> Option<u64> {
    let end = lba.checked_add(blocks);

    // Postcondition: a returned end is never before the start.
    debug_assert!(end.map_or(true, |e| e >= lba));

    end
}

/// Whether `[a_lba, a_lba + a_blocks)` and `[b_lba, b_lba + b_blocks)`
/// share at least one block.
///
/// Ends saturate, so a range running off the end of the address space is
/// treated as reaching `u64::MAX`.
///
/// # Properties
///
/// - Symmetric in its two ranges.
/// - Empty ranges never overlap anything.
pub fn ranges_overlap(a_lba: u64, a_blocks: u64, b_lba: u64, b_blocks: u64) -> bool {
    if a_blocks == 0 || b_blocks == 0 {
        return false;
    }
    let a_end = a_lba.saturating_add(a_blocks);
    let b_end = b_lba.saturating_add(b_blocks);
    let result = a_lba < b_end && b_lba < a_end;

    debug_assert_eq!(
        result,
        b_lba < a_end && a_lba < b_end,
        "ranges_overlap: must be symmetric"
    );

    result
}

/// The common part of two ranges as `(lba, blocks)`.
///
/// Returns `None` when the ranges do not overlap.  The start of the
/// intersection is `max(a_lba, b_lba)`, which is also the "bad LBA" a
/// media error reports.
pub fn intersection(a_lba: u64, a_blocks: u64, b_lba: u64, b_blocks: u64) -> Option<(u64, u64)> {
    if !ranges_overlap(a_lba, a_blocks, b_lba, b_blocks) {
        return None;
    }
    let start = a_lba.max(b_lba);
    let end = a_lba
        .saturating_add(a_blocks)
        .min(b_lba.saturating_add(b_blocks));

    // Postcondition: non-empty and inside both ranges.
    debug_assert!(end > start, "intersection: must be non-empty");
    debug_assert!(start >= a_lba && start >= b_lba);

    Some((start, end - start))
}

/// First maximal run of blocks in `[lba, lba + blocks)` for which
/// `excluded` is false, as `(lba, blocks)`.
///
/// # Properties
///
/// - `None` iff every block is excluded (or the range is empty).
/// - The returned run lies inside the input range.
/// - No block before the run is included.
pub fn first_run(lba: u64, blocks: u64, excluded: impl Fn(u64) -> bool) -> Option<(u64, u64)> {
    let end = lba.saturating_add(blocks);
    let mut cursor = lba;
    while cursor < end && excluded(cursor) {
        cursor += 1;
    }
    if cursor == end {
        return None;
    }
    let start = cursor;
    while cursor < end && !excluded(cursor) {
        cursor += 1;
    }

    debug_assert!(start >= lba && cursor <= end && cursor > start);
    debug_assert!((lba..start).all(&excluded));

    Some((start, cursor - start))
}

// ─── Position bitmaps ───────────────────────────────────────────────

/// Whether every set bit of `bitmap` names a position below `width`.
pub fn bitmap_fits_width(bitmap: u16, width: u16) -> bool {
    if width >= 16 {
        return true;
    }
    let allowed = (1u16 << width) - 1;
    bitmap & !allowed == 0
}

/// Single-bit mask for `position`, or 0 when it cannot be represented.
pub fn position_bit(position: u16) -> u16 {
    if position >= 16 {
        0
    } else {
        1 << position
    }
}

// ─── Table LBA normalization ────────────────────────────────────────

/// Wrap point of a record table.
///
/// `round_up(max_end + TABLE_LBA_GAP, TABLE_ROUND_BLOCKS)` where `max_end`
/// is the largest exclusive record end.  Returns 0 for an empty table,
/// which disables normalization.
pub fn max_table_lba(ends: impl IntoIterator<Item = u64>) -> u64 {
    let Some(max_end) = ends.into_iter().max() else {
        return 0;
    };
    let padded = max_end.saturating_add(TABLE_LBA_GAP);
    let rounded = padded
        .checked_next_multiple_of(TABLE_ROUND_BLOCKS)
        .unwrap_or(u64::MAX - (u64::MAX % TABLE_ROUND_BLOCKS));

    // Postcondition: the wrap point covers every record.
    debug_assert!(rounded >= max_end.min(u64::MAX - TABLE_ROUND_BLOCKS));
    debug_assert_eq!(rounded % TABLE_ROUND_BLOCKS, 0);

    rounded
}

/// Map an I/O start LBA into table space.
///
/// A table describes the first `max_table_lba` blocks and repeats every
/// `max_table_lba` blocks after that.  An I/O that straddles the wrap
/// point is left alone so it can still match the records near the end of
/// the table.
///
/// # Properties
///
/// - `max_table_lba == 0` returns `lba` unchanged.
/// - The result is `< max_table_lba` unless the I/O straddles it.
pub fn normalize_lba(lba: u64, blocks: u64, max_table_lba: u64) -> u64 {
    if max_table_lba == 0 {
        return lba;
    }
    let end = lba.saturating_add(blocks);
    if lba < max_table_lba && end > max_table_lba {
        return lba;
    }
    let result = lba % max_table_lba;

    debug_assert!(result < max_table_lba);

    result
}

// ─── Coherency bit masks ────────────────────────────────────────────

/// Mask of the bits a coherency error flips inside one 32-bit data word.
///
/// Adjacent bits form a contiguous run `[start_bit, start_bit + num_bits)`.
/// Non-adjacent bits are spaced two apart starting at `start_bit`.
/// Returns `None` when the run does not fit in a word or is empty.
pub fn coherency_mask(start_bit: u16, num_bits: u16, adjacent: bool) -> Option<u32> {
    if num_bits == 0 {
        return None;
    }
    let stride: u32 = if adjacent { 1 } else { 2 };
    let last = start_bit as u32 + (num_bits as u32 - 1) * stride;
    if last >= 32 {
        return None;
    }
    let mut mask = 0u32;
    for i in 0..num_bits as u32 {
        mask |= 1 << (start_bit as u32 + i * stride);
    }

    // Postcondition: exactly num_bits bits are set.
    debug_assert_eq!(mask.count_ones(), num_bits as u32);

    Some(mask)
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── ranges ───────────────────────────────────────────────────

    #[test]
    fn range_end_detects_overflow() {
        assert_eq!(range_end(10, 5), Some(15));
        assert_eq!(range_end(u64::MAX, 0), Some(u64::MAX));
        assert_eq!(range_end(u64::MAX, 1), None);
    }

    #[test]
    fn single_block_record_boundary() {
        // Record [X, X+1) matches [X, X+1) but not [X+1, X+2).
        assert!(ranges_overlap(0x40, 1, 0x40, 1));
        assert!(!ranges_overlap(0x40, 1, 0x41, 1));
        assert!(!ranges_overlap(0x40, 1, 0x3F, 1));
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [(0, 10, 5, 10), (0, 10, 10, 10), (100, 1, 0, 200), (7, 3, 9, 1)];
        for (a, ab, b, bb) in cases {
            assert_eq!(ranges_overlap(a, ab, b, bb), ranges_overlap(b, bb, a, ab));
        }
    }

    #[test]
    fn empty_ranges_never_overlap() {
        assert!(!ranges_overlap(5, 0, 0, 100));
        assert!(!ranges_overlap(0, 100, 5, 0));
    }

    #[test]
    fn overlap_saturates_at_top_of_address_space() {
        assert!(ranges_overlap(u64::MAX - 1, 10, u64::MAX - 1, 1));
    }

    #[test]
    fn intersection_of_partial_overlap() {
        assert_eq!(intersection(0, 0x10, 0x8, 0x10), Some((0x8, 0x8)));
        assert_eq!(intersection(0x8, 0x10, 0, 0x10), Some((0x8, 0x8)));
        assert_eq!(intersection(0, 0x10, 0x4, 0x2), Some((0x4, 0x2)));
        assert_eq!(intersection(0, 0x10, 0x10, 0x2), None);
    }

    #[test]
    fn first_run_skips_excluded_prefix() {
        assert_eq!(first_run(10, 5, |_| false), Some((10, 5)));
        assert_eq!(first_run(10, 5, |l| l < 12), Some((12, 3)));
        assert_eq!(first_run(10, 5, |l| l == 12), Some((10, 2)));
        assert_eq!(first_run(10, 5, |_| true), None);
        assert_eq!(first_run(10, 0, |_| false), None);
    }

    // ── bitmaps ──────────────────────────────────────────────────

    #[test]
    fn bitmap_width_check() {
        assert!(bitmap_fits_width(0x1F, 5));
        assert!(!bitmap_fits_width(0x20, 5));
        assert!(bitmap_fits_width(0x10, 5));
        assert!(bitmap_fits_width(0x8000, 16));
        assert!(!bitmap_fits_width(0x1, 0));
        assert!(bitmap_fits_width(0, 0));
    }

    #[test]
    fn position_bit_out_of_range_is_zero() {
        assert_eq!(position_bit(0), 1);
        assert_eq!(position_bit(4), 0x10);
        assert_eq!(position_bit(16), 0);
    }

    // ── normalization ────────────────────────────────────────────

    #[test]
    fn max_table_lba_rounds_to_chunk() {
        assert_eq!(max_table_lba([0x10, 0x20]), 0x800);
        assert_eq!(max_table_lba([0x800 - 100]), 0x800);
        assert_eq!(max_table_lba([0x800 - 99]), 0x1000);
        assert_eq!(max_table_lba(std::iter::empty()), 0);
    }

    #[test]
    fn normalize_wraps_into_table() {
        assert_eq!(normalize_lba(0x810, 1, 0x800), 0x10);
        assert_eq!(normalize_lba(0x10, 1, 0x800), 0x10);
        assert_eq!(normalize_lba(0x1805, 4, 0x800), 0x5);
    }

    #[test]
    fn normalize_leaves_straddling_io() {
        assert_eq!(normalize_lba(0x7FF, 2, 0x800), 0x7FF);
    }

    #[test]
    fn normalize_disabled_for_empty_table() {
        assert_eq!(normalize_lba(0x12345, 8, 0), 0x12345);
    }

    // ── coherency masks ──────────────────────────────────────────

    #[test]
    fn adjacent_mask_is_contiguous() {
        assert_eq!(coherency_mask(0, 4, true), Some(0xF));
        assert_eq!(coherency_mask(28, 4, true), Some(0xF000_0000));
        assert_eq!(coherency_mask(29, 4, true), None);
    }

    #[test]
    fn spread_mask_skips_bits() {
        assert_eq!(coherency_mask(0, 3, false), Some(0b10101));
        assert_eq!(coherency_mask(30, 2, false), None);
    }

    #[test]
    fn empty_mask_rejected() {
        assert_eq!(coherency_mask(0, 0, true), None);
    }
}
