//! End-to-end scenarios driving the engine the way a RAID test would.

use lei_protocol::{EVENT_HOST_DATA_CHECKSUM_ERROR, EVENT_HOST_PARITY_CHECKSUM_ERROR};

use crate::engine::{EngineConfig, InjectionEngine, IoRequest, IoStatus};
use crate::events::CorrelationContext;
use crate::record::ErrorRecord;
use crate::sector::Sector;
use crate::stats::GetObjectStatsResult;
use crate::types::{BlockOpcode, ClassId, ErrorMode, ErrorType, ObjectId, PackageId};

const RAID0: ObjectId = ObjectId(0x10);
const RAID5: ObjectId = ObjectId(0x11);
const MIRROR: ClassId = ClassId(0x20);
const PARITY: ClassId = ClassId(0x21);
const SEP: PackageId = PackageId(1);

fn engine() -> InjectionEngine {
    InjectionEngine::new(EngineConfig::default())
}

#[test]
fn soft_media_error_until_write_verify_remap() {
    let engine = engine();
    engine.enable_object(RAID0, PARITY, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::SoftMedia, ErrorMode::InjectUntilRemapped)
                .range(0x10, 0x1)
                .positions(0x1, 5),
        )
        .unwrap();
    engine.enable().unwrap();

    let read = IoRequest::new(RAID0, BlockOpcode::Read, 0x10, 1)
        .at_position(0, 5)
        .redundant(false);
    let outcome = engine.intercept(&read, &mut []);
    assert_eq!(outcome.status, IoStatus::RemapRequired { lba: 0x10 });
    assert_eq!(outcome.injected.len(), 1);
    assert!(outcome.injected[0].correctable);

    let write_verify = IoRequest::new(RAID0, BlockOpcode::WriteVerify, 0x10, 1)
        .at_position(0, 5)
        .redundant(false);
    assert!(engine.intercept(&write_verify, &mut []).is_clean());

    let stats = engine.get_object_stats(RAID0).unwrap();
    assert_eq!(stats.num_write_verify_blocks_remapped, 1);
    assert_eq!(stats.num_read_media_errors_injected, 1);
    assert_eq!(stats.num_errors_injected, 1);

    assert!(engine.intercept(&read, &mut []).is_clean());
}

#[test]
fn counted_crc_on_parity_position_stops_at_limit() {
    let engine = engine();
    engine.enable_object(RAID5, PARITY, SEP);
    let handle = engine
        .create_record(
            ErrorRecord::new(ErrorType::Crc, ErrorMode::Count)
                .range(0x0, 0x10)
                .positions(0x10, 5)
                .limit(0x10),
        )
        .unwrap();
    engine.enable().unwrap();

    for i in 0..0x10 {
        let write = IoRequest::new(RAID5, BlockOpcode::Write, i, 1)
            .at_position(4, 5)
            .parity(0x10);
        let mut data = [Sector::filled(0x3C)];
        let outcome = engine.intercept(&write, &mut data);
        assert_eq!(outcome.injected.len(), 1, "write {i}");
        assert!(!data[0].has_good_crc());

        let events = outcome.injected[0].expected_events(&CorrelationContext::default());
        assert_eq!(events[0].code, EVENT_HOST_PARITY_CHECKSUM_ERROR);
    }
    assert_eq!(engine.get_stats().num_errors_injected, 0x10);

    let write = IoRequest::new(RAID5, BlockOpcode::Write, 0x5, 1)
        .at_position(4, 5)
        .parity(0x10);
    let mut data = [Sector::filled(0x3C)];
    assert!(engine.intercept(&write, &mut data).is_clean());
    assert!(data[0].has_good_crc());

    let entry = engine
        .get_records()
        .into_iter()
        .find(|e| e.handle == handle)
        .unwrap();
    assert_eq!(entry.err_count, 0x10);
    assert_eq!(engine.get_stats().num_errors_injected, 0x10);
}

#[test]
fn class_enable_then_disable_leaves_nothing_enabled() {
    let engine = engine();
    engine.enable_class(MIRROR, SEP);
    engine.enable().unwrap();

    for id in 1..=3 {
        let io = IoRequest::new(ObjectId(id), BlockOpcode::Read, 0, 1).class(MIRROR, SEP);
        engine.intercept(&io, &mut []);
    }
    let stats = engine.get_stats();
    assert_eq!(stats.num_objects, 3);
    assert_eq!(stats.num_objects_enabled, 3);

    engine.disable_class(MIRROR, SEP);
    let stats = engine.get_stats();
    assert_eq!(stats.num_objects_enabled, 0);
    assert_eq!(stats.num_objects, 3);

    engine.destroy_objects();
    assert_eq!(engine.get_stats().num_objects, 0);
    assert!(engine.is_enabled());
}

#[test]
fn overlapping_records_fire_independently() {
    let engine = engine();
    engine.enable_object(RAID5, PARITY, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::Crc, ErrorMode::Always)
                .range(0x100, 0x10)
                .positions(0x2, 5),
        )
        .unwrap();
    engine
        .create_record(
            ErrorRecord::new(ErrorType::LbaStamp, ErrorMode::Always)
                .range(0x108, 0x10)
                .positions(0x2, 5),
        )
        .unwrap();
    engine.enable().unwrap();

    let read = IoRequest::new(RAID5, BlockOpcode::Read, 0x100, 0x20).at_position(1, 5);
    let mut data = [Sector::filled(0x11); 0x20];
    let outcome = engine.intercept(&read, &mut data);

    assert_eq!(outcome.injected.len(), 2);
    assert_eq!(outcome.injected[0].error_type, ErrorType::Crc);
    assert_eq!(outcome.injected[1].error_type, ErrorType::LbaStamp);
    assert_eq!(data[0x10].lba_stamp, 0x8BAD);
    assert_eq!(data[0x18].lba_stamp, 0);
    assert!(!data[0x0].has_good_crc());
    assert!(data[0x1F].has_good_crc());

    let stats = engine.get_stats();
    assert_eq!(stats.num_records, 2);
    assert_eq!(stats.num_errors_injected, 2);
    let events = outcome.injected[0].expected_events(&CorrelationContext::default());
    assert_eq!(events[0].code, EVENT_HOST_DATA_CHECKSUM_ERROR);
}

#[test]
fn count_injects_exactly_limit_times() {
    for limit in [1u64, 3, 7] {
        let engine = engine();
        engine.enable_object(RAID5, PARITY, SEP);
        engine
            .create_record(
                ErrorRecord::new(ErrorType::SingleBitCrc, ErrorMode::Count)
                    .range(0x40, 1)
                    .positions(0x1, 3)
                    .limit(limit),
            )
            .unwrap();
        engine.enable().unwrap();

        let read = IoRequest::new(RAID5, BlockOpcode::Read, 0x40, 1).at_position(0, 3);
        let injected = (0..limit + 5)
            .filter(|_| !engine.intercept(&read, &mut []).is_clean())
            .count() as u64;
        assert_eq!(injected, limit);
        assert_eq!(engine.get_records()[0].err_count, limit);
    }
}

#[test]
fn always_has_no_cap() {
    let engine = engine();
    engine.enable_object(RAID5, PARITY, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::KlondCrc, ErrorMode::Always)
                .range(0x40, 8)
                .positions(0x6, 3),
        )
        .unwrap();
    engine.enable().unwrap();

    for i in 0..100u64 {
        let io = IoRequest::new(RAID5, BlockOpcode::Read, 0x40 + i % 8, 1)
            .at_position(1 + (i % 2) as u16, 3);
        assert_eq!(engine.intercept(&io, &mut []).injected.len(), 1);
    }
    assert_eq!(engine.get_records()[0].err_count, 100);
}

#[test]
fn single_block_record_boundary() {
    let engine = engine();
    engine.enable_object(RAID5, PARITY, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::Crc, ErrorMode::Always)
                .range(0x77, 1)
                .positions(0x1, 3),
        )
        .unwrap();
    engine.enable().unwrap();

    let at = |lba| IoRequest::new(RAID5, BlockOpcode::Read, lba, 1).at_position(0, 3);
    assert_eq!(engine.intercept(&at(0x77), &mut []).injected.len(), 1);
    assert!(engine.intercept(&at(0x78), &mut []).is_clean());
    assert!(engine.intercept(&at(0x76), &mut []).is_clean());
}

#[test]
fn create_list_delete_round_trip() {
    let engine = engine();
    let record = ErrorRecord::new(ErrorType::WriteStamp, ErrorMode::Random)
        .range(0x200, 0x20)
        .positions(0x5, 4)
        .limit(4);
    let handle = engine.create_record(record.clone()).unwrap();

    let entries = engine.get_records();
    let entry = entries.iter().find(|e| e.handle == handle).unwrap();
    assert_eq!(entry.record, record);
    assert_eq!(entry.err_count, 0);
    assert_eq!(entry.skip_count, 0);

    engine.delete_record(handle).unwrap();
    assert!(engine.get_records().iter().all(|e| e.handle != handle));
    assert!(engine.delete_record(handle).unwrap_err().is_not_found());
}

#[test]
fn object_stats_accumulate_in_any_order() {
    let engine = engine();
    let a = ObjectId(0x30);
    let b = ObjectId(0x31);
    engine.enable_object(a, MIRROR, SEP);
    engine.enable_object(b, MIRROR, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::HardMedia, ErrorMode::Always)
                .range(0, 0x10)
                .positions(0x1, 2),
        )
        .unwrap();
    engine.enable().unwrap();

    for (obj, n) in [(a, 2), (b, 5)] {
        for _ in 0..n {
            let io = IoRequest::new(obj, BlockOpcode::Read, 0, 1).at_position(0, 2);
            engine.intercept(&io, &mut []);
        }
    }

    let mut ab = GetObjectStatsResult::default();
    engine.accumulate_object_stats(&mut ab, a).unwrap();
    engine.accumulate_object_stats(&mut ab, b).unwrap();
    let mut ba = GetObjectStatsResult::default();
    engine.accumulate_object_stats(&mut ba, b).unwrap();
    engine.accumulate_object_stats(&mut ba, a).unwrap();

    assert_eq!(ab, ba);
    assert_eq!(ab.num_read_media_errors_injected, 7);
    assert_eq!(ab.num_errors_injected, 7);
    assert!(engine
        .accumulate_object_stats(&mut ab, ObjectId(0x99))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn records_survive_destroy_objects() {
    let engine = engine();
    engine.enable_object(RAID5, PARITY, SEP);
    engine
        .create_record(ErrorRecord::new(ErrorType::Crc, ErrorMode::Always).positions(0x1, 1))
        .unwrap();
    engine.enable().unwrap();
    engine.destroy_objects();

    let stats = engine.get_stats();
    assert_eq!(stats.num_records, 1);
    assert_eq!(stats.num_objects, 0);
    assert!(stats.enabled);
    assert!(engine.get_object_stats(RAID5).unwrap_err().is_not_found());

    let io = IoRequest::new(RAID5, BlockOpcode::Read, 0, 1);
    assert!(engine.intercept(&io, &mut []).is_clean());
}

#[test]
fn concurrent_io_counts_every_injection() {
    use std::sync::Arc;

    let engine = Arc::new(engine());
    engine.enable_object(RAID5, PARITY, SEP);
    engine
        .create_record(
            ErrorRecord::new(ErrorType::Crc, ErrorMode::Count)
                .range(0, 0x100)
                .positions(0xF, 4)
                .limit(1000),
        )
        .unwrap();
    engine.enable().unwrap();

    let handles: Vec<_> = (0..4u16)
        .map(|position| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for lba in 0..0x100 {
                    let io = IoRequest::new(RAID5, BlockOpcode::Read, lba, 1).at_position(position, 4);
                    engine.intercept(&io, &mut []);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 4 x 256 matches against a cap of 1000.
    assert_eq!(engine.get_stats().num_errors_injected, 1000);
    assert_eq!(engine.get_records()[0].err_count, 1000);
}
