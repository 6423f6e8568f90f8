//! The on-disk format of a persistent store.
//!
//! A store file starts with a header identifying the format and the key and value types it holds:
//!
//! - `magic` (8 bytes, `SLUICEDB`)
//! - `version` (u16)
//! - key type and value type (each a u16 length followed by UTF-8 bytes)
//!
//! The header is followed by append-only records:
//!
//! - `len` of the body (u32)
//! - `crc32` of the body (u32)
//! - body: `op` (u8) followed by the payload
//!
//! A put payload is the key length (u32), the encoded key, and the encoded digest. A remove
//! payload is the encoded key. Replaying all records in order yields the live entries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use hashbrown::HashMap;

use crate::codec;
use crate::digest::AgentDigest;
use crate::key::HistogramKey;
use crate::store::StoreError;

const MAGIC: &[u8; 8] = b"SLUICEDB";
const VERSION: u16 = 1;

const RECORD_HEADER_SIZE: usize = 8;
/// Upper bound for a single record body, rejecting garbage lengths during recovery.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Compaction is skipped while the log holds fewer records than this.
const COMPACTION_MIN_RECORDS: u64 = 4096;
/// Compact once the log holds this many records per live entry.
const COMPACTION_RATIO: u64 = 4;

/// Type identity written into the header of a store file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub key_type: String,
    pub value_type: String,
}

impl Header {
    fn write(&self, writer: &mut impl Write) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(64);
        buf.put_slice(MAGIC);
        buf.put_u16(VERSION);
        codec::put_str(&mut buf, &self.key_type)?;
        codec::put_str(&mut buf, &self.value_type)?;
        writer.write_all(&buf)?;
        Ok(())
    }

    fn read(reader: &mut impl Read) -> Result<(Self, u64), StoreError> {
        let mut fixed = [0u8; 10];
        read_header_bytes(reader, &mut fixed)?;
        if &fixed[..8] != MAGIC {
            return Err(StoreError::InvalidHeader("bad magic".to_owned()));
        }

        let version = u16::from_be_bytes([fixed[8], fixed[9]]);
        if version != VERSION {
            return Err(StoreError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }

        let key_type = read_header_str(reader)?;
        let value_type = read_header_str(reader)?;
        let len = 10 + 2 + key_type.len() + 2 + value_type.len();

        Ok((
            Self {
                key_type,
                value_type,
            },
            len as u64,
        ))
    }
}

fn read_header_bytes(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), StoreError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => StoreError::InvalidHeader("truncated header".to_owned()),
        _ => StoreError::Io(e),
    })
}

fn read_header_str(reader: &mut impl Read) -> Result<String, StoreError> {
    let mut len = [0u8; 2];
    read_header_bytes(reader, &mut len)?;
    let mut bytes = vec![0u8; u16::from_be_bytes(len) as usize];
    read_header_bytes(reader, &mut bytes)?;
    String::from_utf8(bytes).map_err(|_| StoreError::InvalidHeader("invalid type name".to_owned()))
}

/// Takes an exclusive advisory lock on the file or fails immediately.
fn lock(file: &File, path: &Path) -> Result<(), StoreError> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(fs::TryLockError::WouldBlock) => Err(StoreError::Locked(path.to_path_buf())),
        Err(fs::TryLockError::Error(e)) => Err(StoreError::Io(e)),
    }
}

/// A single decoded record.
enum Record {
    Put(HistogramKey, AgentDigest),
    Remove(HistogramKey),
}

impl Record {
    fn decode(mut body: &[u8]) -> Result<Self, StoreError> {
        codec::ensure(&body, 1)?;
        match body.get_u8() {
            OP_PUT => {
                codec::ensure(&body, 4)?;
                let key_len = body.get_u32() as usize;
                codec::ensure(&body, key_len)?;
                let key = HistogramKey::from_bytes(&body[..key_len])?;
                let digest = AgentDigest::from_bytes(&body[key_len..])?;
                Ok(Self::Put(key, digest))
            }
            OP_REMOVE => Ok(Self::Remove(HistogramKey::from_bytes(body)?)),
            op => Err(StoreError::Corruption(format!("unknown record type {op}"))),
        }
    }
}

fn encode_put(key: &HistogramKey, digest: &AgentDigest) -> Result<Vec<u8>, StoreError> {
    let key_len = key.encoded_len();
    let mut body = Vec::with_capacity(1 + 4 + key_len + digest.encoded_len());
    body.put_u8(OP_PUT);
    body.put_u32(key_len as u32);
    key.encode(&mut body)?;
    digest.encode(&mut body);
    Ok(body)
}

fn encode_remove(key: &HistogramKey) -> Result<Vec<u8>, StoreError> {
    let mut body = Vec::with_capacity(1 + key.encoded_len());
    body.put_u8(OP_REMOVE);
    key.encode(&mut body)?;
    Ok(body)
}

fn write_record(writer: &mut impl Write, body: &[u8]) -> io::Result<u64> {
    let mut head = [0u8; RECORD_HEADER_SIZE];
    head[..4].copy_from_slice(&(body.len() as u32).to_be_bytes());
    head[4..].copy_from_slice(&crc32fast::hash(body).to_be_bytes());
    writer.write_all(&head)?;
    writer.write_all(body)?;
    Ok((RECORD_HEADER_SIZE + body.len()) as u64)
}

/// Reads the next record body. Returns `None` at the end of the valid log.
fn read_record(reader: &mut impl Read) -> Result<Option<Vec<u8>>, String> {
    let mut head = [0u8; RECORD_HEADER_SIZE];
    match read_full(reader, &mut head) {
        Ok(0) => return Ok(None),
        Ok(n) if n < RECORD_HEADER_SIZE => return Err("torn record header".to_owned()),
        Ok(_) => (),
        Err(e) => return Err(e.to_string()),
    }

    let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
    let crc = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
    if len == 0 || len > MAX_RECORD_SIZE {
        return Err(format!("invalid record length {len}"));
    }

    let mut body = vec![0u8; len];
    match read_full(reader, &mut body) {
        Ok(n) if n == len => (),
        Ok(_) => return Err("torn record body".to_owned()),
        Err(e) => return Err(e.to_string()),
    }

    if crc32fast::hash(&body) != crc {
        return Err("checksum mismatch".to_owned());
    }

    Ok(Some(body))
}

/// Reads until `buf` is full or the reader is exhausted, returning the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Entries recovered from a store file.
pub(crate) struct Recovered {
    pub entries: HashMap<HistogramKey, AgentDigest>,
    pub records: u64,
    /// Length of the valid prefix of the file.
    pub valid_len: u64,
    /// Length of the file before recovery.
    pub file_len: u64,
}

fn replay(
    file: &File,
    path: &Path,
    expected: &Header,
    capacity_hint: usize,
) -> Result<Recovered, StoreError> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let (header, header_len) = Header::read(&mut reader)?;
    if header.key_type != expected.key_type || header.value_type != expected.value_type {
        return Err(StoreError::IncompatibleTypes {
            expected: format!("{}/{}", expected.key_type, expected.value_type),
            found: format!("{}/{}", header.key_type, header.value_type),
        });
    }

    let mut entries = HashMap::with_capacity(capacity_hint);
    let mut records = 0;
    let mut valid_len = header_len;

    loop {
        let body = match read_record(&mut reader) {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(reason) => {
                sluice_log::warn!(
                    path = %path.display(),
                    offset = valid_len,
                    "discarding corrupt tail of accumulator store: {reason}"
                );
                break;
            }
        };

        match Record::decode(&body) {
            Ok(Record::Put(key, digest)) => {
                entries.insert(key, digest);
            }
            Ok(Record::Remove(key)) => {
                entries.remove(&key);
            }
            Err(error) => {
                sluice_log::warn!(
                    path = %path.display(),
                    offset = valid_len,
                    error = &error as &dyn std::error::Error,
                    "discarding undecodable tail of accumulator store",
                );
                break;
            }
        }

        records += 1;
        valid_len += (RECORD_HEADER_SIZE + body.len()) as u64;
    }

    Ok(Recovered {
        entries,
        records,
        valid_len,
        file_len,
    })
}

/// An exclusively locked, append-only store file.
#[derive(Debug)]
pub(crate) struct StoreLog {
    path: PathBuf,
    header: Header,
    writer: BufWriter<File>,
    buffer_size: usize,
    records: u64,
}

impl StoreLog {
    /// Creates a new store file at `path`, replacing any existing file.
    pub fn create(path: &Path, header: Header, buffer_size: usize) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(&file, path)?;
        file.set_len(0)?;

        let mut writer = BufWriter::with_capacity(buffer_size, file);
        header.write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            writer,
            buffer_size,
            records: 0,
        })
    }

    /// Opens an existing store file and replays its records.
    ///
    /// A corrupt or torn tail is truncated so that new records append after the last valid one.
    pub fn open(
        path: &Path,
        header: Header,
        buffer_size: usize,
        capacity_hint: usize,
    ) -> Result<(Self, HashMap<HistogramKey, AgentDigest>), StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        lock(&file, path)?;

        let recovered = replay(&file, path, &header, capacity_hint)?;
        if recovered.valid_len < recovered.file_len {
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(recovered.valid_len))?;

        let log = Self {
            path: path.to_path_buf(),
            header,
            writer: BufWriter::with_capacity(buffer_size, file),
            buffer_size,
            records: recovered.records,
        };

        Ok((log, recovered.entries))
    }

    /// Replays a store file without modifying it.
    pub fn read(
        path: &Path,
        header: &Header,
        capacity_hint: usize,
    ) -> Result<HashMap<HistogramKey, AgentDigest>, StoreError> {
        let file = File::open(path)?;
        lock(&file, path)?;
        Ok(replay(&file, path, header, capacity_hint)?.entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_put(&mut self, key: &HistogramKey, digest: &AgentDigest) -> Result<(), StoreError> {
        let body = encode_put(key, digest)?;
        write_record(&mut self.writer, &body)?;
        self.records += 1;
        Ok(())
    }

    pub fn append_remove(&mut self, key: &HistogramKey) -> Result<(), StoreError> {
        let body = encode_remove(key)?;
        write_record(&mut self.writer, &body)?;
        self.records += 1;
        Ok(())
    }

    /// Flushes buffered records and syncs them to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Returns `true` if dead records dominate the log.
    pub fn should_compact(&self, live: usize) -> bool {
        self.records >= COMPACTION_MIN_RECORDS
            && self.records > (live as u64).saturating_mul(COMPACTION_RATIO)
    }

    /// Rewrites the log to contain exactly one record per live entry.
    ///
    /// The new file is written next to the old one and atomically renamed over it.
    pub fn compact<'a>(
        &mut self,
        entries: impl ExactSizeIterator<Item = (&'a HistogramKey, &'a AgentDigest)>,
    ) -> Result<(), StoreError> {
        let compact_path = super::sibling_path(&self.path, "compact");
        let live = entries.len() as u64;

        let mut compacted = Self::create(&compact_path, self.header.clone(), self.buffer_size)?;
        for (key, digest) in entries {
            compacted.append_put(key, digest)?;
        }
        compacted.sync()?;

        fs::rename(&compact_path, &self.path)?;

        let previous = self.records;
        compacted.path = self.path.clone();
        *self = compacted;

        sluice_log::debug!(
            path = %self.path.display(),
            "compacted accumulator store from {previous} to {live} records"
        );

        Ok(())
    }
}
