//! Disk spill for the initial-sync buffer
//!
//! Entries that do not fit in memory are appended to a file and read back in
//! order. The file is truncated once every spilled entry has been read.

use super::OplogEntry;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only spill file with an independent read cursor
pub struct SpillFile {
    path: PathBuf,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    /// Entries written but not yet read back
    pending: usize,
}

impl SpillFile {
    /// Create (or truncate) the spill file
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let reader = File::open(&path)?;

        info!("Initial-sync buffer spilling to {:?}", path);

        Ok(SpillFile {
            path,
            writer: BufWriter::new(file),
            reader: BufReader::new(reader),
            pending: 0,
        })
    }

    /// Append an entry
    pub fn append(&mut self, entry: &OplogEntry) -> io::Result<()> {
        self.writer.write_all(&entry.to_bytes())?;
        self.pending += 1;
        Ok(())
    }

    /// Read the oldest unread entry
    pub fn read_next(&mut self) -> io::Result<Option<OplogEntry>> {
        if self.pending == 0 {
            return Ok(None);
        }
        self.writer.flush()?;

        let entry = OplogEntry::read_from(&mut self.reader)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "spill file shorter than expected")
            })?;
        self.pending -= 1;

        if self.pending == 0 {
            self.reset()?;
        }
        Ok(Some(entry))
    }

    /// Drop everything spilled so far
    pub fn reset(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        self.writer.seek(SeekFrom::Start(0))?;
        self.reader.seek(SeekFrom::Start(0))?;
        self.pending = 0;
        debug!("Spill file {:?} truncated", self.path);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OpTime;
    use serde_json::json;

    #[test]
    fn test_spill_preserves_order_across_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillFile::create(dir.path().join("buffer.spill")).unwrap();

        for i in 1..=3 {
            spill
                .append(&OplogEntry::insert(OpTime::new(i, 0, 1), "app.c", json!({"_id": i})))
                .unwrap();
        }
        assert_eq!(spill.pending(), 3);

        assert_eq!(spill.read_next().unwrap().unwrap().op_time, OpTime::new(1, 0, 1));
        spill
            .append(&OplogEntry::insert(OpTime::new(4, 0, 1), "app.c", json!({"_id": 4})))
            .unwrap();

        let rest: Vec<u32> = std::iter::from_fn(|| spill.read_next().unwrap())
            .map(|e| e.op_time.timestamp.secs)
            .collect();
        assert_eq!(rest, vec![2, 3, 4]);
        assert_eq!(spill.pending(), 0);
        assert!(spill.read_next().unwrap().is_none());
    }
}
