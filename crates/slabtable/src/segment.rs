//! On-disk segment format and the load/dump procedures that move entries between it
//! and an in-memory [`SkipList`].
//!
//! A segment is a directory entry named with an 8-digit uppercase hex integer
//! (`00000000`, `00000001`, ...) holding a concatenation of length-prefixed
//! `(key, value)` records. Length fields are a fixed 8-byte little-endian integer
//! rather than the host-width, host-endian integer naively available in the source
//! language, so that segments written on one platform can be read on another.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use slabtable_skiplist::{Comparator, SkipList};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::options::TableOptions;

/// Size in bytes of a single length field.
const LENGTH_FIELD_SIZE: u64 = 8;

fn segment_name(index: u32) -> String {
    format!("{index:08X}")
}

fn parse_segment_name(name: &str) -> Option<u32> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

/// On-disk size of the record for `(key, value)`: two 8-byte length fields plus the
/// key and value bytes themselves.
pub(crate) fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    2 * LENGTH_FIELD_SIZE + key.len() as u64 + value.len() as u64
}

fn write_entry(w: &mut impl Write, key: &[u8], value: &[u8]) -> io::Result<()> {
    w.write_all(&(key.len() as u64).to_le_bytes())?;
    w.write_all(key)?;
    w.write_all(&(value.len() as u64).to_le_bytes())?;
    w.write_all(value)?;
    Ok(())
}

/// Scan one memory-mapped segment's bytes, invoking `on_entry` for each `(key,
/// value)` record found. Stops at the first point where fewer than
/// `LENGTH_FIELD_SIZE` bytes remain, a length field is zero, or a declared length
/// would run past the end of the mapping (a truncated final record).
fn scan_segment<'a>(data: &'a [u8], mut on_entry: impl FnMut(&'a [u8], &'a [u8])) {
    let mut pos: usize = 0;
    let len_sz = LENGTH_FIELD_SIZE as usize;

    loop {
        if data.len() - pos < len_sz {
            break;
        }
        let key_len = u64::from_le_bytes(data[pos..pos + len_sz].try_into().unwrap()) as usize;
        if key_len == 0 {
            break;
        }
        pos += len_sz;
        if data.len() - pos < key_len {
            break;
        }
        let key = &data[pos..pos + key_len];
        pos += key_len;

        if data.len() - pos < len_sz {
            break;
        }
        let val_len = u64::from_le_bytes(data[pos..pos + len_sz].try_into().unwrap()) as usize;
        if val_len == 0 {
            break;
        }
        pos += len_sz;
        if data.len() - pos < val_len {
            break;
        }
        let value = &data[pos..pos + val_len];
        pos += val_len;

        on_entry(key, value);
    }
}

#[cfg(unix)]
fn create_dir_0755(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir_0755(path: &Path) -> io::Result<()> {
    fs::create_dir(path)
}

/// Open (creating if required by `opts`) the table directory and populate `index`
/// from every segment file found in it.
pub(crate) fn load<C: Comparator>(
    dir: &Path,
    opts: &TableOptions<C>,
    index: &SkipList<C>,
) -> Result<()> {
    match fs::metadata(dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(Error::io(
                    dir,
                    io::Error::new(io::ErrorKind::Other, "table path exists and is not a directory"),
                ));
            }
            if opts.error_if_exists {
                return Err(Error::io(
                    dir,
                    io::Error::new(io::ErrorKind::AlreadyExists, "table directory already exists"),
                ));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if !opts.create_if_missing {
                return Err(Error::io(dir, err));
            }
            create_dir_0755(dir).map_err(|e| Error::io(dir, e))?;
        }
        Err(err) => return Err(Error::io(dir, err)),
    }

    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| Error::io(entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        if parse_segment_name(&entry.file_name().to_string_lossy()).is_none() {
            // Not a segment: e.g. a `.tmp` file left behind by a dump that crashed
            // between writing it and renaming it into place.
            continue;
        }

        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| Error::io(&path, e))?;
        if metadata.len() > opts.max_file_size {
            return Err(Error::io(
                &path,
                io::Error::new(io::ErrorKind::InvalidData, "segment file exceeds max_file_size"),
            ));
        }
        if metadata.len() == 0 {
            continue;
        }

        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        // SAFETY: the file is not concurrently modified by another process for the
        // duration of the mapping; this is an embedded, single-process table and
        // nothing outside this process is expected to touch its directory.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(&path, e))?;

        let mut duplicate = None;
        let mut loaded = 0usize;
        scan_segment(&mmap, |key, value| {
            if duplicate.is_none() {
                if index.insert(key, value) {
                    loaded += 1;
                } else {
                    duplicate = Some(key.to_vec());
                }
            }
        });
        if let Some(key) = duplicate {
            error!(?path, ?key, "duplicate key observed across segment files while loading");
            return Err(Error::invalid(format!(
                "duplicate key {key:?} observed across segment files while loading"
            )));
        }
        debug!(?path, entries = loaded, "segment loaded");
    }

    Ok(())
}

/// Write `index` out to `dir` as one or more segment files, rolling over at
/// `opts.max_file_size`, then remove any higher-numbered leftover segments from a
/// previous, longer dump.
///
/// Each segment is written to a temporary name first and atomically renamed into
/// place once complete, so a dump that fails partway through never leaves a
/// half-written file under its real name.
pub(crate) fn dump<C: Comparator>(
    dir: &Path,
    opts: &TableOptions<C>,
    index: &SkipList<C>,
) -> Result<()> {
    let mut segment_index: u32 = 0;
    let mut writer: Option<(BufWriter<File>, PathBuf, PathBuf, u64)> = None;

    for (key, value) in index.iter() {
        let size = entry_size(key, value);

        let needs_new_file = match &writer {
            None => true,
            Some((_, _, _, written)) => written + size > opts.max_file_size,
        };

        if needs_new_file {
            if let Some((mut w, tmp_path, final_path, written)) = writer.take() {
                w.flush().map_err(|e| Error::io(&tmp_path, e))?;
                drop(w);
                fs::rename(&tmp_path, &final_path).map_err(|e| Error::io(&final_path, e))?;
                debug!(path = %final_path.display(), bytes = written, "segment written");
            }

            let final_path = dir.join(segment_name(segment_index));
            let tmp_path = dir.join(format!("{}.tmp", segment_name(segment_index)));
            let file = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
            writer = Some((BufWriter::new(file), tmp_path, final_path, 0));
            segment_index += 1;
        }

        let (w, tmp_path, _, written) = writer.as_mut().expect("just ensured a writer exists");
        write_entry(w, key, value).map_err(|e| Error::io(&tmp_path.clone(), e))?;
        *written += size;
    }

    if let Some((mut w, tmp_path, final_path, written)) = writer.take() {
        w.flush().map_err(|e| Error::io(&tmp_path, e))?;
        drop(w);
        fs::rename(&tmp_path, &final_path).map_err(|e| Error::io(&final_path, e))?;
        debug!(path = %final_path.display(), bytes = written, "segment written");
    }

    remove_stale_segments(dir, segment_index)
}

/// Remove leftover segment files numbered `from` and up, stopping at the first
/// missing index. These correspond to entries a previous, larger dump wrote that no
/// longer exist in the current index.
fn remove_stale_segments(dir: &Path, from: u32) -> Result<()> {
    let mut index = from;
    loop {
        let path = dir.join(segment_name(index));
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(err) => return Err(Error::io(&path, err)),
        }
        index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_round_trips() {
        for n in [0u32, 1, 255, 0xABCD_EF01] {
            let name = segment_name(n);
            assert_eq!(name.len(), 8);
            assert_eq!(name, name.to_uppercase());
            assert_eq!(parse_segment_name(&name), Some(n));
        }
    }

    #[test]
    fn parse_segment_name_rejects_non_hex_and_wrong_length() {
        assert_eq!(parse_segment_name("0000000"), None);
        assert_eq!(parse_segment_name("000000000"), None);
        assert_eq!(parse_segment_name("0000000Z"), None);
        assert_eq!(parse_segment_name("0000.tmp"), None);
    }

    #[test]
    fn scan_segment_reads_back_written_entries() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"alpha", b"1").unwrap();
        write_entry(&mut buf, b"beta", b"22").unwrap();

        let mut seen = Vec::new();
        scan_segment(&buf, |k, v| seen.push((k.to_vec(), v.to_vec())));

        assert_eq!(
            seen,
            vec![
                (b"alpha".to_vec(), b"1".to_vec()),
                (b"beta".to_vec(), b"22".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_segment_stops_at_zero_length_key() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"alpha", b"1").unwrap();
        buf.extend_from_slice(&0u64.to_le_bytes());
        write_entry(&mut buf, b"never-seen", b"x").unwrap();

        let mut seen = Vec::new();
        scan_segment(&buf, |k, _| seen.push(k.to_vec()));
        assert_eq!(seen, vec![b"alpha".to_vec()]);
    }

    #[test]
    fn scan_segment_stops_on_truncated_trailer() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"alpha", b"1").unwrap();
        buf.extend_from_slice(&3u64.to_le_bytes()); // declares 3 bytes that never come

        let mut seen = Vec::new();
        scan_segment(&buf, |k, _| seen.push(k.to_vec()));
        assert_eq!(seen, vec![b"alpha".to_vec()]);
    }
}
