//! Canned error tables.
//!
//! A table is a named, ready-made set of records a test can load in one
//! call instead of building records by hand.  Each table carries a
//! hardware record set and, optionally, a second set tuned for simulated
//! drives (smaller ranges so a short simulated run still hits them).

use lei_protocol::{
    table_flags_valid, MAX_RECORDS, MAX_TABLES, MAX_TABLE_DESCRIPTION_LEN,
    TABLE_FLAG_ALL_RAID_TYPES, TABLE_FLAG_CORRECTABLE, TABLE_FLAG_RAID6_ONLY,
    TABLE_FLAG_UNCORRECTABLE,
};
use serde::{Deserialize, Serialize};

use crate::error::{LeiError, Result};
use crate::record::ErrorRecord;
use crate::types::{ErrorMode, ErrorType};

/// One canned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CannedTable {
    pub description: String,
    /// `TABLE_FLAG_*` bits.
    pub flags: u32,
    pub records: Vec<ErrorRecord>,
    #[serde(default)]
    pub simulation_records: Vec<ErrorRecord>,
}

impl CannedTable {
    /// Parse and validate a table definition.
    ///
    /// ```
    /// use lei_engine::tables::CannedTable;
    ///
    /// let table = CannedTable::from_json(r#"{
    ///     "description": "one soft media error",
    ///     "flags": 5,
    ///     "records": [{"position_bitmap": 1, "width": 3, "lba": 16, "blocks": 1,
    ///                  "error_type": "soft_media", "error_mode": "always"}]
    /// }"#).unwrap();
    /// assert_eq!(table.records.len(), 1);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let table: CannedTable = serde_json::from_str(json)
            .map_err(|e| LeiError::InvalidParameter(format!("table definition: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.description.len() > MAX_TABLE_DESCRIPTION_LEN {
            return Err(LeiError::InvalidParameter(format!(
                "table description is {} bytes, limit {MAX_TABLE_DESCRIPTION_LEN}",
                self.description.len()
            )));
        }
        if !table_flags_valid(self.flags) {
            return Err(LeiError::InvalidParameter(format!(
                "table flags {:#x} need one correctability and one raid-type flag",
                self.flags
            )));
        }
        if self.records.len() > MAX_RECORDS || self.simulation_records.len() > MAX_RECORDS {
            return Err(LeiError::ResourceExhausted { limit: MAX_RECORDS });
        }
        for record in self.records.iter().chain(&self.simulation_records) {
            record.validate()?;
        }
        Ok(())
    }

    /// The record set to load.  Tables without simulation records use
    /// their hardware records for both.
    pub fn records_for(&self, simulation: bool) -> &[ErrorRecord] {
        if simulation && !self.simulation_records.is_empty() {
            &self.simulation_records
        } else {
            &self.records
        }
    }

    pub fn is_correctable(&self) -> bool {
        self.flags & TABLE_FLAG_CORRECTABLE != 0
    }

    pub fn is_raid6_only(&self) -> bool {
        self.flags & TABLE_FLAG_RAID6_ONLY != 0
    }
}

/// Summary of a table, as reported to the test driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub index: usize,
    pub description: String,
    pub flags: u32,
    pub simulation: bool,
    pub num_records: usize,
}

/// Every table the engine knows about.
#[derive(Debug, Clone)]
pub struct TableSet {
    tables: Vec<CannedTable>,
}

impl Default for TableSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TableSet {
    pub fn empty() -> Self {
        Self { tables: Vec::new() }
    }

    /// The built-in tables.
    pub fn builtin() -> Self {
        Self {
            tables: builtin_tables(),
        }
    }

    pub fn get(&self, index: usize) -> Result<&CannedTable> {
        self.tables.get(index).ok_or(LeiError::TableNotFound(index))
    }

    pub fn info(&self, index: usize, simulation: bool) -> Result<TableInfo> {
        let table = self.get(index)?;
        Ok(TableInfo {
            index,
            description: table.description.clone(),
            flags: table.flags,
            simulation,
            num_records: table.records_for(simulation).len(),
        })
    }

    /// Add a table and return its index.
    pub fn register(&mut self, table: CannedTable) -> Result<usize> {
        table.validate()?;
        if self.tables.len() >= MAX_TABLES {
            return Err(LeiError::ResourceExhausted { limit: MAX_TABLES });
        }
        self.tables.push(table);
        Ok(self.tables.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

// ── Built-in tables ─────────────────────────────────────────────

const WIDE: u16 = 16;

fn on(position: u16, error_type: ErrorType, mode: ErrorMode, lba: u64, blocks: u64) -> ErrorRecord {
    ErrorRecord::new(error_type, mode)
        .range(lba, blocks)
        .positions(1 << position, WIDE)
}

fn builtin_tables() -> Vec<CannedTable> {
    let correctable_any = TABLE_FLAG_CORRECTABLE | TABLE_FLAG_ALL_RAID_TYPES;

    let crc_sweep = (0..WIDE)
        .map(|p| on(p, ErrorType::Crc, ErrorMode::Always, 0x100 * p as u64, 0x10))
        .collect();
    let crc_sweep_sim = (0..WIDE)
        .map(|p| on(p, ErrorType::Crc, ErrorMode::Always, 0x10 * p as u64, 0x2))
        .collect();

    let stamp_types = [
        ErrorType::WriteStamp,
        ErrorType::TimeStamp,
        ErrorType::ShedStamp,
        ErrorType::LbaStamp,
    ];
    let stamps = (0..WIDE)
        .map(|p| {
            let t = stamp_types[p as usize % stamp_types.len()];
            on(p, t, ErrorMode::Always, 0x200 + 0x80 * p as u64, 0x8)
        })
        .collect();

    let media = vec![
        on(0, ErrorType::SoftMedia, ErrorMode::InjectUntilRemapped, 0x10, 0x1),
        on(1, ErrorType::HardMedia, ErrorMode::InjectUntilRemapped, 0x40, 0x1),
        on(2, ErrorType::RandomMedia, ErrorMode::InjectUntilRemapped, 0x80, 0x4),
    ];

    // Two positions of the same strip; no single-parity group survives it.
    let double_crc = vec![
        on(0, ErrorType::MultiBitCrc, ErrorMode::Always, 0x300, 0x10).adjacent_errors(0x3),
        on(1, ErrorType::MultiBitCrc, ErrorMode::Always, 0x300, 0x10).adjacent_errors(0x3),
    ];

    let raid6_coherency = vec![
        ErrorRecord::new(ErrorType::Coherency, ErrorMode::Always)
            .range(0x400, 0x20)
            .positions(0x1, 6)
            .coherency_bits(0, 4, true, false),
        ErrorRecord::new(ErrorType::Coherency, ErrorMode::Always)
            .range(0x500, 0x20)
            .positions(0x2, 6)
            .coherency_bits(8, 2, false, true),
    ];

    let random_crc = (0..4u16)
        .map(|p| on(p, ErrorType::SingleBitCrc, ErrorMode::Random, 0x1000 * p as u64, 0x800).limit(10))
        .collect();
    let random_crc_sim = (0..4u16)
        .map(|p| on(p, ErrorType::SingleBitCrc, ErrorMode::Random, 0x40 * p as u64, 0x40).limit(2))
        .collect();

    let transient = vec![
        on(0, ErrorType::Crc, ErrorMode::Transitory, 0x600, 0x20),
        on(1, ErrorType::KlondCrc, ErrorMode::TransitoryRandom, 0x700, 0x20).limit(4),
    ];

    vec![
        CannedTable {
            description: "No errors.".into(),
            flags: correctable_any,
            records: Vec::new(),
            simulation_records: Vec::new(),
        },
        CannedTable {
            description: "Correctable CRC errors on every position, staggered by 0x100 blocks.".into(),
            flags: correctable_any,
            records: crc_sweep,
            simulation_records: crc_sweep_sim,
        },
        CannedTable {
            description: "Correctable write, time, shed and LBA stamp errors rotating across positions.".into(),
            flags: correctable_any,
            records: stamps,
            simulation_records: Vec::new(),
        },
        CannedTable {
            description: "Soft, hard and random media errors until remapped.".into(),
            flags: correctable_any,
            records: media,
            simulation_records: Vec::new(),
        },
        CannedTable {
            description: "Uncorrectable multi-bit CRC errors on two positions of one strip.".into(),
            flags: TABLE_FLAG_UNCORRECTABLE | TABLE_FLAG_ALL_RAID_TYPES,
            records: double_crc,
            simulation_records: Vec::new(),
        },
        CannedTable {
            description: "RAID6 coherency errors, checksum-invisible and checksum-detectable.".into(),
            flags: TABLE_FLAG_CORRECTABLE | TABLE_FLAG_RAID6_ONLY,
            records: raid6_coherency,
            simulation_records: Vec::new(),
        },
        CannedTable {
            description: "Random single-bit CRC errors, one match in ten.".into(),
            flags: correctable_any,
            records: random_crc,
            simulation_records: random_crc_sim,
        },
        CannedTable {
            description: "Transient CRC and Klondike errors that heal after one hit.".into(),
            flags: correctable_any,
            records: transient,
            simulation_records: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_are_valid() {
        let set = TableSet::builtin();
        assert!(set.len() < MAX_TABLES);
        for i in 0..set.len() {
            set.get(i).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn unknown_table_not_found() {
        let set = TableSet::builtin();
        assert_eq!(set.get(99).unwrap_err(), LeiError::TableNotFound(99));
    }

    #[test]
    fn simulation_flag_selects_record_set() {
        let set = TableSet::builtin();
        let hw = set.info(1, false).unwrap();
        let sim = set.info(1, true).unwrap();
        assert_eq!(hw.num_records, 16);
        assert_eq!(sim.num_records, 16);
        assert_ne!(
            set.get(1).unwrap().records_for(true),
            set.get(1).unwrap().records_for(false)
        );
        assert!(sim.simulation);
    }

    #[test]
    fn simulation_falls_back_to_hardware_records() {
        let set = TableSet::builtin();
        let table = set.get(3).unwrap();
        assert_eq!(table.records_for(true), table.records_for(false));
    }

    #[test]
    fn register_respects_table_limit() {
        let mut set = TableSet::empty();
        let table = CannedTable {
            description: "x".into(),
            flags: TABLE_FLAG_CORRECTABLE | TABLE_FLAG_ALL_RAID_TYPES,
            records: Vec::new(),
            simulation_records: Vec::new(),
        };
        for i in 0..MAX_TABLES {
            assert_eq!(set.register(table.clone()).unwrap(), i);
        }
        assert_eq!(
            set.register(table),
            Err(LeiError::ResourceExhausted { limit: MAX_TABLES })
        );
    }

    #[test]
    fn long_description_rejected() {
        let table = CannedTable {
            description: "d".repeat(MAX_TABLE_DESCRIPTION_LEN + 1),
            flags: TABLE_FLAG_CORRECTABLE | TABLE_FLAG_ALL_RAID_TYPES,
            records: Vec::new(),
            simulation_records: Vec::new(),
        };
        assert!(table.validate().is_err());
    }

    #[test]
    fn bad_flags_rejected() {
        let err = CannedTable::from_json(r#"{"description":"x","flags":3,"records":[]}"#)
            .unwrap_err();
        assert!(matches!(err, LeiError::InvalidParameter(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(CannedTable::from_json("{not json").is_err());
    }

    #[test]
    fn flags_helpers() {
        let set = TableSet::builtin();
        assert!(set.get(1).unwrap().is_correctable());
        assert!(!set.get(4).unwrap().is_correctable());
        assert!(set.get(5).unwrap().is_raid6_only());
    }
}
