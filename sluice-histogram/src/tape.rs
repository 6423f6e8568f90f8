//! Durable queues of raw lines between listeners and ingestion.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::store::sibling_path;

/// An error returned by [`Tape`] operations.
#[derive(Debug, thiserror::Error)]
pub enum TapeError {
    /// Reading or writing the tape file failed.
    #[error("failed to access tape")]
    Io(#[from] io::Error),
}

/// A FIFO queue of raw lines.
///
/// Listeners [`push`](Self::push) received lines, ingestion tasks [`poll`](Self::poll) them in
/// batches. Lines must not contain line breaks.
pub trait Tape: fmt::Debug + Send + Sync {
    /// Appends lines to the end of the tape.
    fn push(&self, lines: &[String]) -> Result<(), TapeError>;

    /// Removes and returns up to `max` lines from the front of the tape.
    fn poll(&self, max: usize) -> Result<Vec<String>, TapeError>;
}

/// An in-memory tape, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryTape {
    lines: Mutex<VecDeque<String>>,
}

impl MemoryTape {
    /// Creates an empty tape.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of lines waiting on the tape.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Returns `true` if no lines are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Tape for MemoryTape {
    fn push(&self, lines: &[String]) -> Result<(), TapeError> {
        self.lines.lock().extend(lines.iter().cloned());
        Ok(())
    }

    fn poll(&self, max: usize) -> Result<Vec<String>, TapeError> {
        let mut lines = self.lines.lock();
        let count = max.min(lines.len());
        Ok(lines.drain(..count).collect())
    }
}

/// Magic bytes at the start of every record on a file tape.
const RECORD_MAGIC: [u8; 4] = *b"SLTP";

/// Size of the record header: magic, CRC32 of the payload and payload length.
const RECORD_HEADER_SIZE: u64 = 4 + 4 + 4;

/// Appends the record for a single line to `buf`.
fn encode_record(line: &str, buf: &mut Vec<u8>) {
    let payload = line.trim_end_matches(['\r', '\n']).as_bytes();
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Sequential reader over the records of a tape file.
///
/// Bytes that do not start a valid record are skipped one at a time until the next record with
/// a matching checksum. Nothing past `limit` is read.
struct RecordReader<'a> {
    reader: BufReader<&'a File>,
    position: u64,
    limit: u64,
    skipped: u64,
}

impl<'a> RecordReader<'a> {
    fn new(file: &'a File, position: u64, limit: u64) -> io::Result<Self> {
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position))?;
        Ok(Self {
            reader,
            position,
            limit,
            skipped: 0,
        })
    }

    /// Returns the payload of the next valid record, or `None` at the limit.
    fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        while self.position + RECORD_HEADER_SIZE <= self.limit {
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            self.reader.read_exact(&mut header)?;

            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as u64;
            let end = self.position + RECORD_HEADER_SIZE + len;

            if header[0..4] == RECORD_MAGIC && end <= self.limit {
                let mut payload = vec![0u8; len as usize];
                self.reader.read_exact(&mut payload)?;
                if crc32fast::hash(&payload) == crc {
                    self.position = end;
                    return Ok(Some(payload));
                }
            }

            self.position += 1;
            self.skipped += 1;
            self.reader.seek(SeekFrom::Start(self.position))?;
        }

        Ok(None)
    }
}

#[derive(Debug)]
struct FileTapeInner {
    file: File,
    /// Byte offset of the first unread record.
    offset: u64,
    /// Byte length of the file up to the end of its last valid record.
    len: u64,
}

/// A tape backed by an append-only file of checksummed records and a persisted read cursor.
///
/// Every line is written as a record with a magic prefix, a CRC32 of the line and its length.
/// Polling advances a cursor that is stored next to the file, so unread lines survive restarts.
/// Once all records have been read, the file is truncated.
///
/// A record torn by a crash during a push is discarded on open. Damaged records in the middle of
/// the file are skipped with a warning, reading resumes at the next intact record.
#[derive(Debug)]
pub struct FileTape {
    path: PathBuf,
    cursor_path: PathBuf,
    inner: Mutex<FileTapeInner>,
}

impl FileTape {
    /// Opens the tape at `path`, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, TapeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let len = valid_len(&file, file_len)?;
        if len < file_len {
            sluice_log::warn!(
                path = %path.display(),
                bytes = file_len - len,
                "discarding torn record at end of tape"
            );
            file.set_len(len)?;
        }

        let cursor_path = sibling_path(path, "cursor");
        let offset = match fs::read(&cursor_path) {
            Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_slice()) {
                Ok(bytes) => u64::from_be_bytes(bytes).min(len),
                Err(_) => {
                    sluice_log::warn!(path = %cursor_path.display(), "ignoring invalid tape cursor");
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            cursor_path,
            inner: Mutex::new(FileTapeInner { file, offset, len }),
        })
    }

    /// The path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The number of unread bytes on the tape.
    pub fn pending_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.len - inner.offset
    }

    fn store_cursor(&self, offset: u64) -> io::Result<()> {
        fs::write(&self.cursor_path, offset.to_be_bytes())
    }
}

/// Returns the length of the file up to the end of its last valid record.
fn valid_len(file: &File, file_len: u64) -> io::Result<u64> {
    let mut records = RecordReader::new(file, 0, file_len)?;
    let mut len = 0;
    while records.next_record()?.is_some() {
        len = records.position;
    }
    Ok(len)
}

impl Tape for FileTape {
    fn push(&self, lines: &[String]) -> Result<(), TapeError> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for line in lines {
            encode_record(line, &mut buf);
        }

        let mut inner = self.inner.lock();
        let len = inner.len;
        inner.file.seek(SeekFrom::Start(len))?;
        inner.file.write_all(&buf)?;
        inner.len += buf.len() as u64;

        Ok(())
    }

    fn poll(&self, max: usize) -> Result<Vec<String>, TapeError> {
        let mut inner = self.inner.lock();
        if inner.offset >= inner.len || max == 0 {
            return Ok(Vec::new());
        }

        let mut records = RecordReader::new(&inner.file, inner.offset, inner.len)?;
        let mut lines = Vec::with_capacity(max.min(1024));
        while lines.len() < max {
            match records.next_record()? {
                Some(payload) => lines.push(String::from_utf8_lossy(&payload).into_owned()),
                None => break,
            }
        }

        let (position, skipped) = (records.position, records.skipped);
        if skipped > 0 {
            sluice_log::warn!(
                path = %self.path.display(),
                bytes = skipped,
                "skipped corrupted records on tape"
            );
        }

        inner.offset = match lines.len() < max {
            true => inner.len,
            false => position,
        };
        if inner.offset >= inner.len {
            inner.file.set_len(0)?;
            inner.offset = 0;
            inner.len = 0;
        }
        self.store_cursor(inner.offset)?;

        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_memory_tape() {
        let tape = MemoryTape::new();
        tape.push(&lines(&["a", "b", "c"])).unwrap();

        assert_eq!(tape.poll(2).unwrap(), lines(&["a", "b"]));
        assert_eq!(tape.len(), 1);
        assert_eq!(tape.poll(10).unwrap(), lines(&["c"]));
        assert!(tape.poll(10).unwrap().is_empty());
    }

    #[test]
    fn test_file_tape_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let tape = FileTape::open(&dir.path().join("tape.minute.2878.0")).unwrap();

        tape.push(&lines(&["a 1", "b 2"])).unwrap();
        tape.push(&lines(&["c 3"])).unwrap();

        assert_eq!(tape.poll(2).unwrap(), lines(&["a 1", "b 2"]));
        tape.push(&lines(&["d 4"])).unwrap();
        assert_eq!(tape.poll(10).unwrap(), lines(&["c 3", "d 4"]));
        assert!(tape.poll(10).unwrap().is_empty());
    }

    #[test]
    fn test_file_tape_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape");

        let tape = FileTape::open(&path).unwrap();
        tape.push(&lines(&["a", "b", "c"])).unwrap();
        assert_eq!(tape.poll(1).unwrap(), lines(&["a"]));
        drop(tape);

        let tape = FileTape::open(&path).unwrap();
        assert_eq!(tape.poll(10).unwrap(), lines(&["b", "c"]));
    }

    #[test]
    fn test_file_tape_truncates_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape");

        let tape = FileTape::open(&path).unwrap();
        tape.push(&lines(&["a", "b"])).unwrap();
        tape.poll(10).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(tape.pending_bytes(), 0);

        tape.push(&lines(&["c"])).unwrap();
        assert_eq!(tape.poll(10).unwrap(), lines(&["c"]));
    }

    #[test]
    fn test_file_tape_discards_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape");

        let tape = FileTape::open(&path).unwrap();
        tape.push(&lines(&["a", "b"])).unwrap();
        let complete = tape.pending_bytes();
        drop(tape);

        let mut torn = Vec::new();
        encode_record("partial", &mut torn);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..torn.len() - 3]).unwrap();
        drop(file);

        let tape = FileTape::open(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), complete);
        assert_eq!(tape.poll(10).unwrap(), lines(&["a", "b"]));
    }

    #[test]
    fn test_file_tape_skips_corrupted_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape");

        let tape = FileTape::open(&path).unwrap();
        tape.push(&lines(&["m 1", "m 2", "m 3"])).unwrap();
        drop(tape);

        // Flip a byte in the payload of the second record.
        let mut bytes = fs::read(&path).unwrap();
        let record_len = RECORD_HEADER_SIZE as usize + 3;
        bytes[record_len + RECORD_HEADER_SIZE as usize] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let tape = FileTape::open(&path).unwrap();
        assert_eq!(tape.poll(10).unwrap(), lines(&["m 1", "m 3"]));
        assert!(tape.poll(10).unwrap().is_empty());
    }

    #[test]
    fn test_file_tape_skips_garbled_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tape");

        let tape = FileTape::open(&path).unwrap();
        tape.push(&lines(&["m 1", "m 2", "m 3"])).unwrap();
        drop(tape);

        // Garble the length of the second record so that it points past the end of the file.
        let mut bytes = fs::read(&path).unwrap();
        let length_at = RECORD_HEADER_SIZE as usize + 3 + 8;
        bytes[length_at..length_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let tape = FileTape::open(&path).unwrap();
        assert_eq!(tape.poll(1).unwrap(), lines(&["m 1"]));
        assert_eq!(tape.poll(10).unwrap(), lines(&["m 3"]));
    }

    #[test]
    fn test_file_tape_strips_line_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let tape = FileTape::open(&dir.path().join("tape")).unwrap();

        tape.push(&lines(&["a\r\n", "b\n"])).unwrap();
        assert_eq!(tape.poll(10).unwrap(), lines(&["a", "b"]));
    }
}
