//! On-disk index log: an append-only sequence of fixed-size location
//! records, one per index mutation. Each record carries a trailer with the
//! fork's live item count, so the tail four bytes of the file always answer
//! `len` without a scan.
//!
//! Record layout, big-endian: `u64 key | u64 offset | u32 len | u32 total`.
//! A `len` of zero tombstones the key on replay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::index::Index;
use crate::types::{ForkName, Key, Location, LOCATION_SIZE, TRAILER_SIZE};

pub(crate) struct IndexLog {
    file: File,
}

impl IndexLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, loc: Location, total_items: u64) -> Result<()> {
        use std::io::Write;

        let mut buf = [0u8; LOCATION_SIZE];
        encode_record(&mut buf, loc, total_items);
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Replaces the log contents with a serialization of `index`'s live
    /// runs in key order.
    pub fn rewrite(&mut self, index: &Index) -> Result<()> {
        use std::io::Write;

        self.file.set_len(0)?;
        let mut total = 0u64;
        let mut buf = [0u8; LOCATION_SIZE];
        for (_, loc) in index.iter() {
            total += loc.len as u64;
            encode_record(&mut buf, loc, total);
            self.file.write_all(&buf)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn encode_record(buf: &mut [u8; LOCATION_SIZE], loc: Location, total_items: u64) {
    buf[0..8].copy_from_slice(&(loc.key.0 as u64).to_be_bytes());
    buf[8..16].copy_from_slice(&loc.off.to_be_bytes());
    buf[16..20].copy_from_slice(&loc.len.to_be_bytes());
    let total = total_items.min(u32::MAX as u64) as u32;
    buf[20..24].copy_from_slice(&total.to_be_bytes());
}

fn decode_record(buf: &[u8; LOCATION_SIZE]) -> Location {
    Location {
        key: Key(u64::from_be_bytes(buf[0..8].try_into().unwrap()) as i64),
        off: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        len: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
    }
}

/// Streams a log into its in-memory form. Tombstones remove, everything
/// else inserts or overwrites. A partial record at the tail is damage and
/// surfaces as an error so the caller can fall back to regeneration.
pub(crate) fn load(path: &Path) -> Result<Index> {
    let mut file = io::BufReader::new(File::open(path)?);
    let mut index = Index::new();
    let mut buf = [0u8; LOCATION_SIZE];

    while read_record_or_eof(&mut file, &mut buf)? {
        let loc = decode_record(&buf);
        if loc.is_tombstone() {
            index.remove(loc.key);
        } else {
            index.set(loc);
        }
    }

    Ok(index)
}

fn read_record_or_eof(r: &mut impl Read, buf: &mut [u8; LOCATION_SIZE]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = r.read(&mut buf[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "index log ends in a partial record",
            )
            .into());
        }
        read += n;
    }
    Ok(true)
}

/// Reads the live item count from the tail of an index log. Returns zero
/// for files too short to hold a record or with a ragged tail; the next
/// open repairs those.
pub(crate) fn read_trailer(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size < LOCATION_SIZE as u64 || size % LOCATION_SIZE as u64 != 0 {
        return Ok(0);
    }

    file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
    let mut buf = [0u8; TRAILER_SIZE];
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf) as u64)
}

/// Maps fork name to trailer for every index log in a bucket directory.
/// `None` marks a log that is unreadable or structurally broken; it needs
/// a rebuild before its count means anything.
pub(crate) fn read_trailers(dir: &Path) -> Result<Vec<(ForkName, Option<u64>)>> {
    let mut trailers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(fork) = ForkName::from_index_file_name(name) else {
            continue;
        };
        let fork = fork?;
        let path = entry.path();
        let trailer = if is_loadable(&path) {
            read_trailer(&path).ok()
        } else {
            None
        };
        trailers.push((fork, trailer));
    }
    trailers.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(trailers)
}

/// Index log file of `fork` inside `bucket_dir`.
pub(crate) fn path_for(bucket_dir: &Path, fork: &ForkName) -> PathBuf {
    bucket_dir.join(fork.index_file_name())
}

/// True when the file can be loaded record by record: present, readable
/// and holding a whole number of records. Anything else goes through
/// regeneration.
pub(crate) fn is_loadable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => {
            let size = meta.len();
            size >= LOCATION_SIZE as u64 && size % LOCATION_SIZE as u64 == 0
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn loc(key: i64, off: u64, len: u32) -> Location {
        Location {
            key: Key(key),
            off,
            len,
        }
    }

    #[test]
    fn append_load_roundtrip_with_tombstones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.log");

        let mut log = IndexLog::open(&path).unwrap();
        log.append(loc(1, 0, 10), 10).unwrap();
        log.append(loc(2, 100, 5), 15).unwrap();
        // batch at key 1 fully consumed.
        log.append(Location::tombstone(Key(1)), 5).unwrap();
        // batch at key 2 shrunk to a suffix.
        log.append(loc(2, 120, 3), 3).unwrap();
        log.sync().unwrap();

        let index = load(&path).unwrap();
        assert_eq!(index.num_entries(), 1);
        assert_eq!(index.get(Key(2)), Some(loc(2, 120, 3)));
        assert_eq!(index.item_count(), 3);

        assert_eq!(read_trailer(&path).unwrap(), 3);
    }

    #[test]
    fn partial_tail_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.log");

        let mut log = IndexLog::open(&path).unwrap();
        log.append(loc(1, 0, 1), 1).unwrap();
        drop(log);

        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..LOCATION_SIZE - 1]).unwrap();

        assert!(load(&path).is_err());
        assert!(!is_loadable(&path));
        assert_eq!(read_trailer(&path).unwrap(), 0);
    }

    #[test]
    fn rewrite_serializes_live_runs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.log");

        let mut index = Index::new();
        index.set(loc(3, 64, 2));
        index.set(loc(1, 0, 4));

        let mut log = IndexLog::open(&path).unwrap();
        log.rewrite(&index).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get(Key(1)), Some(loc(1, 0, 4)));
        assert_eq!(loaded.get(Key(3)), Some(loc(3, 64, 2)));
        assert_eq!(read_trailer(&path).unwrap(), 6);
    }

    #[test]
    fn trailers_of_a_bucket_directory() {
        let dir = tempdir().unwrap();

        let mut base = IndexLog::open(&dir.path().join("idx.log")).unwrap();
        base.append(loc(1, 0, 7), 7).unwrap();
        let mut fork = IndexLog::open(&dir.path().join("slow.idx.log")).unwrap();
        fork.append(loc(1, 0, 7), 7).unwrap();
        fork.append(Location::tombstone(Key(1)), 0).unwrap();
        fs::write(dir.path().join("dat.log"), b"ignored").unwrap();

        let trailers = read_trailers(dir.path()).unwrap();
        assert_eq!(
            trailers,
            vec![
                (ForkName::default(), Some(7)),
                (ForkName::new("slow").unwrap(), Some(0)),
            ]
        );

        // a ragged log reads as damaged, not as empty.
        let full = fs::read(dir.path().join("idx.log")).unwrap();
        fs::write(dir.path().join("idx.log"), &full[..LOCATION_SIZE - 1]).unwrap();
        let trailers = read_trailers(dir.path()).unwrap();
        assert_eq!(trailers[0], (ForkName::default(), None));
    }
}
