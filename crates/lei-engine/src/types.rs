//! Error types, injection modes and identifiers.
//!
//! Each [`ErrorType`] names one way a block can go wrong: a bad
//! checksum, a corrupted out-of-band stamp, a media error reported by the
//! drive, or a transport-level failure such as a timeout.  Every match on
//! these enums is exhaustive so that adding a variant forces a decision
//! at every site that classifies, corrupts or reports errors.

use std::fmt;

use lei_protocol::{
    OPCODE_ERROR_VERIFY, OPCODE_READ, OPCODE_VERIFY, OPCODE_WRITE, OPCODE_WRITE_NONCACHED,
    OPCODE_WRITE_VERIFY, OPCODE_ZERO,
};
use serde::{Deserialize, Serialize};

// ── Identifiers ─────────────────────────────────────────────────

/// Identifier of a storage object (RAID group, mirror, virtual drive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Identifier of an object class (all mirrors, all parity groups, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

/// Identifier of the package an object lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{:#x}", self.0)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}", self.0)
    }
}

// ── Block opcodes ───────────────────────────────────────────────

/// Block operation carried by an intercepted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOpcode {
    Read,
    Write,
    Verify,
    ErrorVerify,
    WriteVerify,
    Zero,
    WriteNoncached,
}

impl BlockOpcode {
    /// Wire value shared with the storage stack.
    pub fn code(self) -> u8 {
        match self {
            BlockOpcode::Read => OPCODE_READ,
            BlockOpcode::Write => OPCODE_WRITE,
            BlockOpcode::Verify => OPCODE_VERIFY,
            BlockOpcode::ErrorVerify => OPCODE_ERROR_VERIFY,
            BlockOpcode::WriteVerify => OPCODE_WRITE_VERIFY,
            BlockOpcode::Zero => OPCODE_ZERO,
            BlockOpcode::WriteNoncached => OPCODE_WRITE_NONCACHED,
        }
    }

    /// Decode a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            OPCODE_READ => Some(BlockOpcode::Read),
            OPCODE_WRITE => Some(BlockOpcode::Write),
            OPCODE_VERIFY => Some(BlockOpcode::Verify),
            OPCODE_ERROR_VERIFY => Some(BlockOpcode::ErrorVerify),
            OPCODE_WRITE_VERIFY => Some(BlockOpcode::WriteVerify),
            OPCODE_ZERO => Some(BlockOpcode::Zero),
            OPCODE_WRITE_NONCACHED => Some(BlockOpcode::WriteNoncached),
            _ => None,
        }
    }

    /// Whether this opcode moves data onto the media.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            BlockOpcode::Write | BlockOpcode::WriteVerify | BlockOpcode::WriteNoncached
        )
    }

    /// Whether sector-level injection may look at this I/O at all.
    pub fn is_sector_eligible(self) -> bool {
        match self {
            BlockOpcode::Read
            | BlockOpcode::Verify
            | BlockOpcode::ErrorVerify
            | BlockOpcode::WriteVerify
            | BlockOpcode::Write => true,
            BlockOpcode::Zero | BlockOpcode::WriteNoncached => false,
        }
    }
}

impl fmt::Display for BlockOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOpcode::Read => write!(f, "read"),
            BlockOpcode::Write => write!(f, "write"),
            BlockOpcode::Verify => write!(f, "verify"),
            BlockOpcode::ErrorVerify => write!(f, "error-verify"),
            BlockOpcode::WriteVerify => write!(f, "write-verify"),
            BlockOpcode::Zero => write!(f, "zero"),
            BlockOpcode::WriteNoncached => write!(f, "write-noncached"),
        }
    }
}

// ── RAID geometry hints ─────────────────────────────────────────

/// What kind of group the I/O belongs to, as far as corruption cares.
///
/// The engine has no topology knowledge; the caller passes this hint so
/// that corruption can skip patterns a given group type treats as
/// expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidKind {
    /// Striped, mirrored or single-parity group.
    #[default]
    Standard,
    /// Double-parity group.
    Raid6,
    /// Hot spare copying on behalf of a failed drive.
    HotSpare,
    /// Proactive spare copying from a drive that is still alive.
    ProactiveSpare,
}

// ── Error types ─────────────────────────────────────────────────

/// One way a block can be corrupted or an I/O can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    // ── Checksum errors ─────────────────────────────────────────
    /// Generic checksum error; the sector is zeroed with a zero crc.
    Crc,
    /// Checksum differs from the good value in exactly one bit.
    SingleBitCrc,
    /// Checksum differs in several bits.
    MultiBitCrc,
    /// Multi-bit checksum error plus a bad LBA stamp.
    MultiBitWithLbaStamp,
    /// Pattern left behind when the drive firmware invalidates a block.
    KlondCrc,
    /// Pattern left behind by the device handler on remap.
    DhCrc,
    /// Block invalidated by RAID during verify.
    RaidCrc,
    /// Block invalidated because its data was lost.
    Invalidated,
    /// Block invalidated by an explicit corrupt-crc request.
    CorruptCrc,
    /// Data overwritten with a recognizable pattern under a good crc.
    CorruptData,

    // ── Stamp errors ────────────────────────────────────────────
    LbaStamp,
    WriteStamp,
    /// Write stamp with bits no valid stripe could produce.
    BogusWriteStamp,
    TimeStamp,
    /// Time stamp with the all-stamps bit set.
    BogusTimeStamp,
    ShedStamp,
    /// Shed stamp with bits outside the group width.
    BogusShedStamp,
    /// Data changed under an unchanged checksum so parity disagrees.
    Coherency,

    // ── Media errors ────────────────────────────────────────────
    /// Unrecoverable read; data is lost.
    HardMedia,
    /// Recovered read that asks for a remap.
    SoftMedia,
    /// Hard or soft, chosen by the engine's RNG.
    RandomMedia,

    // ── Raw-mirror errors ───────────────────────────────────────
    RawMirrorBadMagic,
    RawMirrorBadSequence,

    // ── Transport errors ────────────────────────────────────────
    Timeout,
    /// Write reports success but never reaches the media.
    SilentDrop,
    /// Completion is held for `err_limit` milliseconds.
    DelayUp,
    /// Dispatch is held for `err_limit` milliseconds.
    DelayDown,
    /// One block fewer is written than requested.
    IncompleteWrite,

    // ── Encryption errors ───────────────────────────────────────
    KeyError,
    KeyNotFound,
    EncryptionNotEnabled,
}

/// Coarse classification of an [`ErrorType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Checksum,
    Stamp,
    Media,
    RawMirror,
    Transport,
    Encryption,
}

impl ErrorType {
    /// Every error type, in declaration order.
    pub const ALL: [ErrorType; 31] = [
        ErrorType::Crc,
        ErrorType::SingleBitCrc,
        ErrorType::MultiBitCrc,
        ErrorType::MultiBitWithLbaStamp,
        ErrorType::KlondCrc,
        ErrorType::DhCrc,
        ErrorType::RaidCrc,
        ErrorType::Invalidated,
        ErrorType::CorruptCrc,
        ErrorType::CorruptData,
        ErrorType::LbaStamp,
        ErrorType::WriteStamp,
        ErrorType::BogusWriteStamp,
        ErrorType::TimeStamp,
        ErrorType::BogusTimeStamp,
        ErrorType::ShedStamp,
        ErrorType::BogusShedStamp,
        ErrorType::Coherency,
        ErrorType::HardMedia,
        ErrorType::SoftMedia,
        ErrorType::RandomMedia,
        ErrorType::RawMirrorBadMagic,
        ErrorType::RawMirrorBadSequence,
        ErrorType::Timeout,
        ErrorType::SilentDrop,
        ErrorType::DelayUp,
        ErrorType::DelayDown,
        ErrorType::IncompleteWrite,
        ErrorType::KeyError,
        ErrorType::KeyNotFound,
        ErrorType::EncryptionNotEnabled,
    ];

    /// Get the category of this error type.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorType::Crc
            | ErrorType::SingleBitCrc
            | ErrorType::MultiBitCrc
            | ErrorType::MultiBitWithLbaStamp
            | ErrorType::KlondCrc
            | ErrorType::DhCrc
            | ErrorType::RaidCrc
            | ErrorType::Invalidated
            | ErrorType::CorruptCrc
            | ErrorType::CorruptData => ErrorCategory::Checksum,
            ErrorType::LbaStamp
            | ErrorType::WriteStamp
            | ErrorType::BogusWriteStamp
            | ErrorType::TimeStamp
            | ErrorType::BogusTimeStamp
            | ErrorType::ShedStamp
            | ErrorType::BogusShedStamp
            | ErrorType::Coherency => ErrorCategory::Stamp,
            ErrorType::HardMedia | ErrorType::SoftMedia | ErrorType::RandomMedia => {
                ErrorCategory::Media
            }
            ErrorType::RawMirrorBadMagic | ErrorType::RawMirrorBadSequence => {
                ErrorCategory::RawMirror
            }
            ErrorType::Timeout
            | ErrorType::SilentDrop
            | ErrorType::DelayUp
            | ErrorType::DelayDown
            | ErrorType::IncompleteWrite => ErrorCategory::Transport,
            ErrorType::KeyError | ErrorType::KeyNotFound | ErrorType::EncryptionNotEnabled => {
                ErrorCategory::Encryption
            }
        }
    }

    /// Whether this type is applied before the I/O reaches the device,
    /// instead of by rewriting returned sectors.
    pub fn is_pre_io(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Encryption
        )
    }

    pub fn is_media(&self) -> bool {
        self.category() == ErrorCategory::Media
    }

    /// Whether the type carries a delay in `err_limit`.
    pub fn is_delay(&self) -> bool {
        matches!(self, ErrorType::DelayUp | ErrorType::DelayDown)
    }

    /// Whether the type may be applied to data being written.
    ///
    /// Stamps are owned by the writer, so only checksum and media errors
    /// are injected on writes.
    pub fn applies_to_writes(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Checksum | ErrorCategory::Media
        )
    }

    /// Whether a non-proactive hot spare can detect (and so may receive)
    /// this type.
    pub fn allowed_on_hot_spare(&self) -> bool {
        match self {
            ErrorType::Crc
            | ErrorType::SingleBitCrc
            | ErrorType::MultiBitWithLbaStamp
            | ErrorType::KlondCrc
            | ErrorType::DhCrc
            | ErrorType::Invalidated
            | ErrorType::RaidCrc
            | ErrorType::CorruptCrc
            | ErrorType::RandomMedia
            | ErrorType::HardMedia
            | ErrorType::SoftMedia
            | ErrorType::RawMirrorBadMagic
            | ErrorType::RawMirrorBadSequence => true,
            ErrorType::MultiBitCrc
            | ErrorType::CorruptData
            | ErrorType::LbaStamp
            | ErrorType::WriteStamp
            | ErrorType::BogusWriteStamp
            | ErrorType::TimeStamp
            | ErrorType::BogusTimeStamp
            | ErrorType::ShedStamp
            | ErrorType::BogusShedStamp
            | ErrorType::Coherency
            | ErrorType::Timeout
            | ErrorType::SilentDrop
            | ErrorType::DelayUp
            | ErrorType::DelayDown
            | ErrorType::IncompleteWrite
            | ErrorType::KeyError
            | ErrorType::KeyNotFound
            | ErrorType::EncryptionNotEnabled => false,
        }
    }

    /// The type a RAID group reports when it detects this injection.
    ///
    /// Bogus stamps are detected as plain stamp errors; the generic crc
    /// and the lba-stamped multi-bit crc are detected as multi-bit crc.
    pub fn detected_as(&self) -> ErrorType {
        match self {
            ErrorType::BogusWriteStamp => ErrorType::WriteStamp,
            ErrorType::BogusTimeStamp => ErrorType::TimeStamp,
            ErrorType::BogusShedStamp => ErrorType::ShedStamp,
            ErrorType::Crc | ErrorType::MultiBitWithLbaStamp => ErrorType::MultiBitCrc,
            other => *other,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorType::Crc => "crc",
            ErrorType::SingleBitCrc => "single-bit-crc",
            ErrorType::MultiBitCrc => "multi-bit-crc",
            ErrorType::MultiBitWithLbaStamp => "multi-bit-crc-lba-stamp",
            ErrorType::KlondCrc => "klondike-crc",
            ErrorType::DhCrc => "dh-crc",
            ErrorType::RaidCrc => "raid-crc",
            ErrorType::Invalidated => "invalidated",
            ErrorType::CorruptCrc => "corrupt-crc",
            ErrorType::CorruptData => "corrupt-data",
            ErrorType::LbaStamp => "lba-stamp",
            ErrorType::WriteStamp => "write-stamp",
            ErrorType::BogusWriteStamp => "bogus-write-stamp",
            ErrorType::TimeStamp => "time-stamp",
            ErrorType::BogusTimeStamp => "bogus-time-stamp",
            ErrorType::ShedStamp => "shed-stamp",
            ErrorType::BogusShedStamp => "bogus-shed-stamp",
            ErrorType::Coherency => "coherency",
            ErrorType::HardMedia => "hard-media",
            ErrorType::SoftMedia => "soft-media",
            ErrorType::RandomMedia => "random-media",
            ErrorType::RawMirrorBadMagic => "raw-mirror-bad-magic",
            ErrorType::RawMirrorBadSequence => "raw-mirror-bad-sequence",
            ErrorType::Timeout => "timeout",
            ErrorType::SilentDrop => "silent-drop",
            ErrorType::DelayUp => "delay-up",
            ErrorType::DelayDown => "delay-down",
            ErrorType::IncompleteWrite => "incomplete-write",
            ErrorType::KeyError => "key-error",
            ErrorType::KeyNotFound => "key-not-found",
            ErrorType::EncryptionNotEnabled => "encryption-not-enabled",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Checksum => write!(f, "checksum"),
            ErrorCategory::Stamp => write!(f, "stamp"),
            ErrorCategory::Media => write!(f, "media"),
            ErrorCategory::RawMirror => write!(f, "raw-mirror"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Encryption => write!(f, "encryption"),
        }
    }
}

// ── Injection modes ─────────────────────────────────────────────

/// How often a matching record actually injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Inject while `err_count < err_limit`.
    Count,
    /// Inject on every match.
    Always,
    /// Inject with probability `1 / err_limit`.
    Random,
    /// Let `skip_limit` matches through, then switch to [`ErrorMode::SkipInsert`].
    Skip,
    /// Inject `skip_limit + 1` times, then switch back to [`ErrorMode::Skip`].
    SkipInsert,
    /// Inject once per block, then treat the block as healed.
    Transitory,
    /// Like [`ErrorMode::Transitory`] but only for a random subset of matches.
    TransitoryRandom,
    /// Inject on every match until the block is remapped.
    InjectUntilRemapped,
    /// Inject on every match, always at the record's first block.
    InjectSameLba,
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMode::Count => write!(f, "count"),
            ErrorMode::Always => write!(f, "always"),
            ErrorMode::Random => write!(f, "random"),
            ErrorMode::Skip => write!(f, "skip"),
            ErrorMode::SkipInsert => write!(f, "skip-insert"),
            ErrorMode::Transitory => write!(f, "trans"),
            ErrorMode::TransitoryRandom => write!(f, "trans-rnd"),
            ErrorMode::InjectUntilRemapped => write!(f, "until-remapped"),
            ErrorMode::InjectSameLba => write!(f, "same-lba"),
        }
    }
}
