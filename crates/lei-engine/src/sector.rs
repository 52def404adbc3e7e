//! In-flight sectors and the corruption each error type applies to them.
//!
//! A sector is 512 bytes of data plus four 16-bit metadata fields (see
//! [`lei_protocol::SECTOR_BYTES`]).  Corruption is a pure transform on
//! one sector; the engine decides which sectors of an I/O get it.

use lei_protocol::{
    checksum, INVALID_REASON_CORRUPT_CRC, INVALID_REASON_CORRUPT_DATA,
    INVALID_REASON_DATA_LOST, INVALID_REASON_DH_INVALIDATED, INVALID_REASON_VERIFY,
    INVALID_SECTOR_TEST_WORD, INVALID_WHO_ERROR_INJECTION, RAW_MIRROR_MAGIC,
    RAW_MIRROR_MAGIC_OFFSET, RAW_MIRROR_SEQUENCE_OFFSET, SECTOR_DATA_BYTES, SECTOR_DATA_WORDS,
};

use crate::types::{ErrorType, RaidKind};
use crate::verified;

/// Time stamp bit meaning "every position was written together".
const TS_ALL_STAMPS: u16 = 0x8000;

/// One 520-byte sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub data: [u8; SECTOR_DATA_BYTES],
    pub crc: u16,
    pub time_stamp: u16,
    pub write_stamp: u16,
    /// LBA stamp on data positions, shed stamp on parity positions.
    pub lba_stamp: u16,
}

impl Default for Sector {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Sector {
    /// All-zero data with a good checksum and clear stamps.
    pub fn zeroed() -> Self {
        let data = [0u8; SECTOR_DATA_BYTES];
        Self {
            crc: checksum(&data),
            data,
            time_stamp: 0,
            write_stamp: 0,
            lba_stamp: 0,
        }
    }

    /// Data filled with `byte` and a good checksum.
    pub fn filled(byte: u8) -> Self {
        let mut sector = Self::zeroed();
        sector.data = [byte; SECTOR_DATA_BYTES];
        sector.set_good_crc();
        sector
    }

    /// A raw-mirror sector carrying a valid magic and `sequence`.
    pub fn raw_mirror(sequence: u64) -> Self {
        let mut sector = Self::zeroed();
        sector.set_u64(RAW_MIRROR_MAGIC_OFFSET, RAW_MIRROR_MAGIC);
        sector.set_u64(RAW_MIRROR_SEQUENCE_OFFSET, sequence);
        sector.set_good_crc();
        sector
    }

    pub fn word(&self, index: usize) -> u32 {
        debug_assert!(index < SECTOR_DATA_WORDS);
        let i = index * 4;
        u32::from_le_bytes([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        debug_assert!(index < SECTOR_DATA_WORDS);
        let i = index * 4;
        self.data[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn u64_at(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn set_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn raw_mirror_magic(&self) -> u64 {
        self.u64_at(RAW_MIRROR_MAGIC_OFFSET)
    }

    pub fn raw_mirror_sequence(&self) -> u64 {
        self.u64_at(RAW_MIRROR_SEQUENCE_OFFSET)
    }

    pub fn computed_crc(&self) -> u16 {
        checksum(&self.data)
    }

    pub fn has_good_crc(&self) -> bool {
        self.crc == self.computed_crc()
    }

    pub fn set_good_crc(&mut self) {
        self.crc = self.computed_crc();
    }

    /// Whether the data carries the invalidated-sector pattern, and why.
    pub fn invalid_reason(&self) -> Option<u32> {
        (self.word(0) == INVALID_SECTOR_TEST_WORD).then(|| self.word(1))
    }

    /// Overwrite with the invalidated-sector pattern and a bad checksum.
    pub fn fill_invalid(&mut self, reason: u32) {
        self.data = [0u8; SECTOR_DATA_BYTES];
        self.set_word(0, INVALID_SECTOR_TEST_WORD);
        self.set_word(1, reason);
        self.set_word(2, INVALID_WHO_ERROR_INJECTION);
        self.crc = !self.computed_crc();
    }

    fn zero_data(&mut self) {
        self.data = [0u8; SECTOR_DATA_BYTES];
    }
}

/// Everything [`corrupt_sector`] needs besides the sector itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    pub error_type: ErrorType,
    /// LBA of the sector; varies the pattern from block to block.
    pub seed: u64,
    pub position: u16,
    pub width: u16,
    pub parity_bitmask: u16,
    pub raid_kind: RaidKind,
    pub start_bit: u16,
    pub num_bits: u16,
    pub bit_adj: bool,
    pub crc_det: bool,
}

impl Corruption {
    pub fn is_parity_position(&self) -> bool {
        self.parity_bitmask & verified::position_bit(self.position) != 0
    }

    fn width_mask(&self) -> u16 {
        if self.width >= 16 {
            u16::MAX
        } else {
            (1u16 << self.width) - 1
        }
    }
}

/// Apply `c.error_type` to `sector`.  Returns whether the sector changed.
///
/// Media, transport and encryption types never touch sector contents.
pub fn corrupt_sector(sector: &mut Sector, c: &Corruption) -> bool {
    if c.raid_kind == RaidKind::HotSpare && !c.error_type.allowed_on_hot_spare() {
        return false;
    }
    let raid6 = c.raid_kind == RaidKind::Raid6;
    let parity = c.is_parity_position();
    let pos_bit = verified::position_bit(c.position);

    match c.error_type {
        // ── checksum ────────────────────────────────────────────
        ErrorType::Crc | ErrorType::MultiBitCrc => {
            sector.zero_data();
            sector.crc = 0;
        }
        ErrorType::MultiBitWithLbaStamp => {
            sector.zero_data();
            sector.crc = 0;
            sector.lba_stamp = if c.seed as u16 == 0x0BAD { 0xBAD0 } else { 0x0BAD };
        }
        ErrorType::SingleBitCrc => {
            sector.zero_data();
            sector.crc = sector.computed_crc() ^ 0x1;
        }
        ErrorType::KlondCrc => {
            sector.zero_data();
            sector.set_word(0, 0xFFFF_FFFF);
            sector.crc = !sector.computed_crc();
            sector.lba_stamp = 0xFFFF;
            sector.write_stamp = 0xFFFF;
        }
        ErrorType::DhCrc => sector.fill_invalid(INVALID_REASON_DH_INVALIDATED),
        ErrorType::Invalidated | ErrorType::RaidCrc | ErrorType::CorruptCrc if raid6 => {
            return false;
        }
        ErrorType::Invalidated => sector.fill_invalid(INVALID_REASON_DATA_LOST),
        ErrorType::RaidCrc => sector.fill_invalid(INVALID_REASON_VERIFY),
        ErrorType::CorruptCrc => sector.fill_invalid(INVALID_REASON_CORRUPT_CRC),
        ErrorType::CorruptData => {
            sector.fill_invalid(INVALID_REASON_CORRUPT_DATA);
            sector.set_good_crc();
        }

        // ── stamps ──────────────────────────────────────────────
        ErrorType::WriteStamp if parity => {
            let width_mask = c.width_mask();
            sector.write_stamp ^= width_mask & !pos_bit;
            sector.write_stamp &= width_mask & !c.parity_bitmask;
            sector.time_stamp &= !TS_ALL_STAMPS;
        }
        ErrorType::WriteStamp => {
            sector.write_stamp = if sector.write_stamp != 0 {
                sector.write_stamp & !pos_bit
            } else {
                pos_bit
            };
            sector.time_stamp = 0x7FFF;
        }
        ErrorType::TimeStamp => {
            sector.time_stamp = 0x1BAD;
            if !parity {
                sector.write_stamp = 0;
            }
        }
        ErrorType::BogusWriteStamp if parity => sector.write_stamp |= pos_bit,
        ErrorType::BogusWriteStamp => {
            sector.write_stamp = if c.position == 0 { 0x2 } else { 0x1 };
        }
        ErrorType::BogusTimeStamp => {
            sector.time_stamp = if parity { 0xFBAD } else { 0x8BAD };
        }
        ErrorType::LbaStamp | ErrorType::ShedStamp if parity => sector.lba_stamp = pos_bit,
        ErrorType::BogusShedStamp if parity => sector.lba_stamp = 0x00FF | pos_bit,
        ErrorType::LbaStamp | ErrorType::ShedStamp | ErrorType::BogusShedStamp => {
            sector.lba_stamp = if c.seed as u16 == 0x8BAD { 0xFBAD } else { 0x8BAD };
        }
        ErrorType::Coherency => {
            let Some(mask) = verified::coherency_mask(c.start_bit, c.num_bits, c.bit_adj) else {
                return false;
            };
            let index = (c.seed % (SECTOR_DATA_WORDS as u64 - 1)) as usize;
            sector.set_word(index, sector.word(index) ^ mask);
            if !c.crc_det {
                sector.set_word(index + 1, sector.word(index + 1) ^ mask);
            }
        }

        // ── raw mirror ──────────────────────────────────────────
        ErrorType::RawMirrorBadMagic => {
            sector.set_u64(RAW_MIRROR_MAGIC_OFFSET, RAW_MIRROR_MAGIC ^ 0xFFFF);
            sector.set_good_crc();
        }
        ErrorType::RawMirrorBadSequence => {
            let seq = sector.raw_mirror_sequence();
            sector.set_u64(RAW_MIRROR_SEQUENCE_OFFSET, seq.wrapping_sub(1));
            sector.set_good_crc();
        }

        ErrorType::HardMedia
        | ErrorType::SoftMedia
        | ErrorType::RandomMedia
        | ErrorType::Timeout
        | ErrorType::SilentDrop
        | ErrorType::DelayUp
        | ErrorType::DelayDown
        | ErrorType::IncompleteWrite
        | ErrorType::KeyError
        | ErrorType::KeyNotFound
        | ErrorType::EncryptionNotEnabled => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corruption(error_type: ErrorType) -> Corruption {
        Corruption {
            error_type,
            seed: 0x10,
            position: 1,
            width: 5,
            parity_bitmask: 0x10,
            raid_kind: RaidKind::Standard,
            start_bit: 0,
            num_bits: 0,
            bit_adj: false,
            crc_det: false,
        }
    }

    fn at_parity(mut c: Corruption) -> Corruption {
        c.position = 4;
        c
    }

    #[test]
    fn zeroed_sector_is_valid() {
        let s = Sector::zeroed();
        assert!(s.has_good_crc());
        assert_eq!(s.invalid_reason(), None);
    }

    #[test]
    fn crc_zeroes_sector_with_bad_checksum() {
        let mut s = Sector::filled(0xAA);
        assert!(corrupt_sector(&mut s, &corruption(ErrorType::Crc)));
        assert!(s.data.iter().all(|&b| b == 0));
        assert_eq!(s.crc, 0);
        assert!(!s.has_good_crc());
    }

    #[test]
    fn single_bit_crc_differs_in_one_bit() {
        let mut s = Sector::filled(0x55);
        corrupt_sector(&mut s, &corruption(ErrorType::SingleBitCrc));
        assert_eq!((s.crc ^ s.computed_crc()).count_ones(), 1);
    }

    #[test]
    fn lba_stamped_crc_avoids_matching_seed() {
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &corruption(ErrorType::MultiBitWithLbaStamp));
        assert_eq!(s.lba_stamp, 0x0BAD);

        let mut s = Sector::zeroed();
        let mut c = corruption(ErrorType::MultiBitWithLbaStamp);
        c.seed = 0x0BAD;
        corrupt_sector(&mut s, &c);
        assert_eq!(s.lba_stamp, 0xBAD0);
    }

    #[test]
    fn klondike_pattern() {
        let mut s = Sector::filled(0x11);
        corrupt_sector(&mut s, &corruption(ErrorType::KlondCrc));
        assert_eq!(s.word(0), 0xFFFF_FFFF);
        assert_eq!(s.word(1), 0);
        assert_eq!(s.lba_stamp, 0xFFFF);
        assert_eq!(s.write_stamp, 0xFFFF);
        assert!(!s.has_good_crc());
    }

    #[test]
    fn invalidated_types_tag_reason() {
        for (t, reason) in [
            (ErrorType::DhCrc, INVALID_REASON_DH_INVALIDATED),
            (ErrorType::Invalidated, INVALID_REASON_DATA_LOST),
            (ErrorType::RaidCrc, INVALID_REASON_VERIFY),
            (ErrorType::CorruptCrc, INVALID_REASON_CORRUPT_CRC),
        ] {
            let mut s = Sector::filled(0x42);
            assert!(corrupt_sector(&mut s, &corruption(t)));
            assert_eq!(s.invalid_reason(), Some(reason), "{t}");
            assert_eq!(s.word(2), INVALID_WHO_ERROR_INJECTION);
            assert!(!s.has_good_crc(), "{t}");
        }
    }

    #[test]
    fn corrupt_data_keeps_good_checksum() {
        let mut s = Sector::filled(0x42);
        corrupt_sector(&mut s, &corruption(ErrorType::CorruptData));
        assert_eq!(s.invalid_reason(), Some(INVALID_REASON_CORRUPT_DATA));
        assert!(s.has_good_crc());
    }

    #[test]
    fn raid6_skips_invalidation_types() {
        let mut c = corruption(ErrorType::Invalidated);
        c.raid_kind = RaidKind::Raid6;
        let mut s = Sector::filled(0x42);
        assert!(!corrupt_sector(&mut s, &c));
        assert_eq!(s, Sector::filled(0x42));

        c.error_type = ErrorType::DhCrc;
        assert!(corrupt_sector(&mut s, &c));
    }

    #[test]
    fn write_stamp_on_data_position() {
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &corruption(ErrorType::WriteStamp));
        assert_eq!(s.write_stamp, 0x2);
        assert_eq!(s.time_stamp, 0x7FFF);

        let mut s = Sector::zeroed();
        s.write_stamp = 0x3;
        corrupt_sector(&mut s, &corruption(ErrorType::WriteStamp));
        assert_eq!(s.write_stamp, 0x1);
    }

    #[test]
    fn write_stamp_on_parity_position() {
        let mut s = Sector::zeroed();
        s.time_stamp = TS_ALL_STAMPS | 0x12;
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::WriteStamp)));
        // Every data bit of the width flipped, parity bit cleared.
        assert_eq!(s.write_stamp, 0x0F);
        assert_eq!(s.time_stamp, 0x12);
    }

    #[test]
    fn time_stamp_clears_write_stamp_on_data() {
        let mut s = Sector::zeroed();
        s.write_stamp = 0x4;
        corrupt_sector(&mut s, &corruption(ErrorType::TimeStamp));
        assert_eq!(s.time_stamp, 0x1BAD);
        assert_eq!(s.write_stamp, 0);

        let mut s = Sector::zeroed();
        s.write_stamp = 0x4;
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::TimeStamp)));
        assert_eq!(s.write_stamp, 0x4);
    }

    #[test]
    fn bogus_stamps() {
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &corruption(ErrorType::BogusWriteStamp));
        assert_eq!(s.write_stamp, 0x1);

        let mut c = corruption(ErrorType::BogusWriteStamp);
        c.position = 0;
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &c);
        assert_eq!(s.write_stamp, 0x2);

        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::BogusWriteStamp)));
        assert_eq!(s.write_stamp, 0x10);

        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::BogusTimeStamp)));
        assert_eq!(s.time_stamp, 0xFBAD);
    }

    #[test]
    fn shed_stamps_on_parity() {
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::ShedStamp)));
        assert_eq!(s.lba_stamp, 0x10);

        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &at_parity(corruption(ErrorType::BogusShedStamp)));
        assert_eq!(s.lba_stamp, 0xFF | 0x10);
    }

    #[test]
    fn lba_stamp_on_data_avoids_seed() {
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &corruption(ErrorType::LbaStamp));
        assert_eq!(s.lba_stamp, 0x8BAD);

        let mut c = corruption(ErrorType::LbaStamp);
        c.seed = 0x1_8BAD;
        let mut s = Sector::zeroed();
        corrupt_sector(&mut s, &c);
        assert_eq!(s.lba_stamp, 0xFBAD);
    }

    #[test]
    fn undetectable_coherency_keeps_checksum() {
        let mut c = corruption(ErrorType::Coherency);
        c.start_bit = 4;
        c.num_bits = 3;
        c.bit_adj = true;
        let mut s = Sector::filled(0x5A);
        let before = s;
        assert!(corrupt_sector(&mut s, &c));
        assert_ne!(s.data, before.data);
        assert!(s.has_good_crc());
    }

    #[test]
    fn detectable_coherency_breaks_checksum() {
        let mut c = corruption(ErrorType::Coherency);
        c.start_bit = 4;
        c.num_bits = 3;
        c.crc_det = true;
        let mut s = Sector::filled(0x5A);
        corrupt_sector(&mut s, &c);
        assert!(!s.has_good_crc());
    }

    #[test]
    fn raw_mirror_corruption_keeps_crc_good() {
        let mut s = Sector::raw_mirror(7);
        corrupt_sector(&mut s, &corruption(ErrorType::RawMirrorBadMagic));
        assert_ne!(s.raw_mirror_magic(), RAW_MIRROR_MAGIC);
        assert!(s.has_good_crc());

        let mut s = Sector::raw_mirror(7);
        corrupt_sector(&mut s, &corruption(ErrorType::RawMirrorBadSequence));
        assert_eq!(s.raw_mirror_magic(), RAW_MIRROR_MAGIC);
        assert_eq!(s.raw_mirror_sequence(), 6);
        assert!(s.has_good_crc());
    }

    #[test]
    fn media_and_transport_leave_data_alone() {
        for t in [ErrorType::HardMedia, ErrorType::SoftMedia, ErrorType::Timeout] {
            let mut s = Sector::filled(0x42);
            assert!(!corrupt_sector(&mut s, &corruption(t)));
            assert_eq!(s, Sector::filled(0x42));
        }
    }

    #[test]
    fn hot_spare_only_takes_checksum_family() {
        let mut c = corruption(ErrorType::WriteStamp);
        c.raid_kind = RaidKind::HotSpare;
        let mut s = Sector::zeroed();
        assert!(!corrupt_sector(&mut s, &c));

        c.error_type = ErrorType::Crc;
        assert!(corrupt_sector(&mut s, &c));

        c.raid_kind = RaidKind::ProactiveSpare;
        c.error_type = ErrorType::WriteStamp;
        assert!(corrupt_sector(&mut Sector::zeroed(), &c));
    }
}
