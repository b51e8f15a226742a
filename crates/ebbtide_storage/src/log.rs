//! Append-only framed record file.
//!
//! Every record is written as:
//!
//! ```text
//! | len: u32 LE | crc32: u32 LE | payload: len bytes |
//! ```
//!
//! A frame cut short by a crash at the tail of the file is truncated away on
//! open. A checksum mismatch anywhere before the tail is reported as
//! corruption.

use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload accepted in a single frame.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// An append-only log of checksummed records.
///
/// # Example
///
/// ```no_run
/// use ebbtide_storage::RecordLog;
/// use std::path::Path;
///
/// let mut log = RecordLog::open(Path::new("archive.log")).unwrap();
/// log.append(b"first").unwrap();
/// log.sync().unwrap();
/// assert_eq!(log.records().unwrap(), vec![b"first".to_vec()]);
/// ```
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    file: File,
    size: u64,
}

impl RecordLog {
    /// Opens or creates a log, discarding a torn trailing frame.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a frame before the tail fails its checksum.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let (_, valid) = decode_frames(&buf)?;

        if (valid as u64) < buf.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                discarded = buf.len() - valid,
                "truncating torn record at log tail"
            );
            file.set_len(valid as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: valid as u64,
        })
    }

    /// Opens a log, creating parent directories if needed.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the byte length of the valid portion of the log.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a record and returns the offset of its frame.
    ///
    /// The record is not durable until [`RecordLog::sync`] returns.
    pub fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "record of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    MAX_RECORD_SIZE
                ),
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        encode_frame(payload, &mut frame);

        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(offset)
    }

    /// Appends several records with a single write.
    pub fn append_all<'a>(
        &mut self,
        payloads: impl IntoIterator<Item = &'a [u8]>,
    ) -> StorageResult<u64> {
        let mut frames = Vec::new();
        for payload in payloads {
            encode_frame(payload, &mut frames);
        }
        let offset = self.size;
        if frames.is_empty() {
            return Ok(offset);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frames)?;
        self.size += frames.len() as u64;
        Ok(offset)
    }

    /// Flushes written records to stable storage.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads every record in append order.
    pub fn records(&mut self) -> StorageResult<Vec<Vec<u8>>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&mut self.file).take(self.size).read_to_end(&mut buf)?;
        let (records, _) = decode_frames(&buf)?;
        Ok(records)
    }

    /// Reads every record of a log file without opening it for writing.
    ///
    /// A missing file reads as empty.
    pub fn read_file(path: &Path) -> StorageResult<Vec<Vec<u8>>> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let (records, _) = decode_frames(&buf)?;
        Ok(records)
    }
}

fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Decodes frames from `buf`, returning the records and the length of the
/// valid prefix.
fn decode_frames(buf: &[u8]) -> StorageResult<(Vec<Vec<u8>>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        let Some(header) = buf.get(pos..pos + FRAME_HEADER_SIZE) else {
            break;
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = pos + FRAME_HEADER_SIZE;
        let Some(payload) = start.checked_add(len).and_then(|end| buf.get(start..end)) else {
            break;
        };

        if crc32fast::hash(payload) != crc {
            let end = start + len;
            if end == buf.len() {
                break;
            }
            return Err(StorageError::corrupted(format!(
                "checksum mismatch in record at offset {pos}"
            )));
        }

        records.push(payload.to_vec());
        pos = start + len;
    }

    Ok((records, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");

        let mut log = RecordLog::open(&path).unwrap();
        assert_eq!(log.append(b"alpha").unwrap(), 0);
        assert_eq!(log.append(b"beta").unwrap(), (FRAME_HEADER_SIZE + 5) as u64);
        log.sync().unwrap();

        assert_eq!(log.records().unwrap(), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert_eq!(RecordLog::read_file(&path).unwrap().len(), 2);
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.append_all([b"a".as_slice(), b"b".as_slice()]).unwrap();
            log.sync().unwrap();
        }
        let mut log = RecordLog::open(&path).unwrap();
        log.append(b"c").unwrap();
        assert_eq!(log.records().unwrap().len(), 3);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");
        let intact;
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.append(b"complete").unwrap();
            intact = log.size();
            log.append(b"will be torn").unwrap();
            log.sync().unwrap();
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact + 5).unwrap();

        let mut log = RecordLog::open(&path).unwrap();
        assert_eq!(log.size(), intact);
        assert_eq!(log.records().unwrap(), vec![b"complete".to_vec()]);
    }

    #[test]
    fn interior_corruption_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");
        {
            let mut log = RecordLog::open(&path).unwrap();
            log.append(b"first").unwrap();
            log.append(b"second").unwrap();
            log.sync().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[FRAME_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(RecordLog::open(&path), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(RecordLog::read_file(&dir.path().join("absent.log"))
            .unwrap()
            .is_empty());
    }
}
