//! End-to-end table lifecycle scenarios.

use std::fs;

use slabtable::{Error, Table, TableOptions};
use tempfile::tempdir;

fn open_opts() -> TableOptions {
    let mut opts = TableOptions::new();
    opts.create_if_missing = true;
    opts
}

/// S1: create/read/update/delete.
#[test]
fn create_read_update_delete() {
    let dir = tempdir().unwrap();
    let mut table = Table::with_options(dir.path(), open_opts());
    table.open().unwrap();

    table.put(b"key", b"value").unwrap();
    assert_eq!(table.get(b"key").unwrap(), b"value");

    table.put(b"key", b"new-value").unwrap();
    assert_eq!(table.get(b"key").unwrap(), b"new-value");

    table.del(b"key").unwrap();
    assert!(matches!(table.get(b"key"), Err(Error::NotFound)));
}

/// S2 + S3: load/dump round-trip and file rollover, checked together since S3
/// examines the directory state S2's dump leaves behind.
#[test]
fn round_trip_and_rollover() {
    let dir = tempdir().unwrap();

    let mut opts = open_opts();
    opts.max_file_size = 4096;

    let keys: Vec<[u8; 16]> = (0..1000u32)
        .map(|i| {
            let mut k = [0u8; 16];
            k[..4].copy_from_slice(&i.to_be_bytes());
            k
        })
        .collect();
    let values: Vec<[u8; 16]> = (0..1000u32)
        .map(|i| {
            let mut v = [0u8; 16];
            v[..4].copy_from_slice(&i.wrapping_mul(31).to_be_bytes());
            v
        })
        .collect();

    {
        let mut table = Table::with_options(dir.path(), opts.clone());
        table.open().unwrap();
        for (k, v) in keys.iter().zip(&values) {
            table.put(k, v).unwrap();
        }
        table.close().unwrap(); // dump_when_close defaults to true
    }

    // S3: segments are contiguous, numbered from zero, and each respects the cap.
    let mut segment_numbers: Vec<u32> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter_map(|name| u32::from_str_radix(&name, 16).ok())
        .collect();
    segment_numbers.sort_unstable();
    assert!(segment_numbers.len() > 1, "1000 16-byte entries must roll over past one 4096-byte segment");
    assert_eq!(
        segment_numbers,
        (0..segment_numbers.len() as u32).collect::<Vec<_>>(),
        "segment numbers must be contiguous starting from 0"
    );
    for n in &segment_numbers {
        let path = dir.path().join(format!("{n:08X}"));
        assert!(fs::metadata(&path).unwrap().len() <= 4096);
    }

    // S2: reopen and check every value survived the round trip.
    let mut table = Table::with_options(dir.path(), opts);
    table.open().unwrap();
    for (k, v) in keys.iter().zip(&values) {
        assert_eq!(&table.get(k).unwrap(), v);
    }
}

/// S4: an entry whose on-disk record would exceed `max_file_size` is rejected, and
/// the index remains untouched.
#[test]
fn oversized_entry_rejected() {
    let dir = tempdir().unwrap();
    let mut opts = open_opts();
    opts.max_file_size = 1;

    let mut table = Table::with_options(dir.path(), opts);
    table.open().unwrap();

    assert!(matches!(table.put(b"key", b"value"), Err(Error::InvalidOperation(_))));
    assert_eq!(table.len().unwrap(), 0);
}

/// S5: opening a nonexistent directory without `create_if_missing` fails with an I/O
/// error and does not create the directory.
#[test]
fn missing_directory_without_create_if_missing() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("does-not-exist-yet");

    let mut table = Table::new(&missing);
    assert!(matches!(table.open(), Err(Error::Io { .. })));
    assert!(!missing.exists());
}

/// S6: double lifecycle transitions, and operations attempted before open.
#[test]
fn double_lifecycle_and_operations_before_open() {
    let dir = tempdir().unwrap();
    let mut table = Table::with_options(dir.path(), open_opts());

    assert!(matches!(table.get(b"k"), Err(Error::InvalidOperation(_))));
    assert!(matches!(table.put(b"k", b"v"), Err(Error::InvalidOperation(_))));
    assert!(matches!(table.del(b"k"), Err(Error::InvalidOperation(_))));
    assert!(matches!(table.dump(), Err(Error::InvalidOperation(_))));

    table.open().unwrap();
    assert!(matches!(table.open(), Err(Error::InvalidOperation(_))));

    table.close().unwrap();
    assert!(matches!(table.close(), Err(Error::InvalidOperation(_))));
}

#[test]
fn error_if_exists_rejects_reopen_of_existing_directory() {
    let dir = tempdir().unwrap();

    let mut opts = open_opts();
    let mut table = Table::with_options(dir.path(), opts.clone());
    table.open().unwrap();
    table.close().unwrap();

    opts.error_if_exists = true;
    let mut table = Table::with_options(dir.path(), opts);
    assert!(matches!(table.open(), Err(Error::Io { .. })));
}
