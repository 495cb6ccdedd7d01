//! Length-framed record files
//!
//! Layout of every data file:
//!
//! ```text
//! [magic "LKRF"(4)] [format version u32 LE] [record kind u8]
//! [len u32 LE] [bincode body] ...
//! ```
//!
//! Record bodies never carry scan acceleration; it is rebuilt after import.

use crate::error::{TransferError, TransferResult};
use bytes::Bytes;
use lakeref_core::{
    CommitLogEntry, Hash, Key, KeyWithBytes, NamedRef, ReferenceInfo, ScanAcceleration,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Magic bytes at the start of every record file
pub const RECORD_MAGIC: &[u8; 4] = b"LKRF";

/// Version of the record layout and bodies
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 9;

/// What a record file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Commit = 1,
    NamedReference = 2,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Commit),
            2 => Some(RecordKind::NamedReference),
            _ => None,
        }
    }

    /// File name prefix for this kind
    pub fn file_prefix(self) -> &'static str {
        match self {
            RecordKind::Commit => "commits",
            RecordKind::NamedReference => "named-refs",
        }
    }

    /// Name of the `index`-th (1-based) data file of this kind
    pub fn file_name(self, index: usize) -> String {
        format!("{}-{:05}.bin", self.file_prefix(), index)
    }
}

/// A record type stored in data files
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;
}

/// One commit, without its scan acceleration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: Hash,
    pub parents: Vec<Hash>,
    pub commit_seq: u64,
    pub commit_meta: Bytes,
    pub puts: Vec<KeyWithBytes>,
    pub deletes: Vec<Key>,
}

impl Record for CommitRecord {
    const KIND: RecordKind = RecordKind::Commit;
}

impl From<&CommitLogEntry> for CommitRecord {
    fn from(entry: &CommitLogEntry) -> Self {
        Self {
            hash: entry.hash,
            parents: entry.parents.clone(),
            commit_seq: entry.commit_seq,
            commit_meta: entry.commit_meta.clone(),
            puts: entry.puts.clone(),
            deletes: entry.deletes.clone(),
        }
    }
}

impl CommitRecord {
    /// Entry to replay, with an empty acceleration
    pub fn into_entry(self) -> CommitLogEntry {
        CommitLogEntry {
            hash: self.hash,
            parents: self.parents,
            commit_seq: self.commit_seq,
            commit_meta: self.commit_meta,
            puts: self.puts,
            deletes: self.deletes,
            acceleration: ScanAcceleration::default(),
        }
    }
}

/// One named reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub named_ref: NamedRef,
    pub hash: Hash,
}

impl Record for RefRecord {
    const KIND: RecordKind = RecordKind::NamedReference;
}

impl From<&ReferenceInfo> for RefRecord {
    fn from(info: &ReferenceInfo) -> Self {
        Self {
            named_ref: info.named_ref.clone(),
            hash: info.hash,
        }
    }
}

/// Writes records of one kind after a file header
pub struct RecordWriter<W: Write> {
    inner: W,
    kind: RecordKind,
    count: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(mut inner: W, kind: RecordKind) -> TransferResult<Self> {
        inner.write_all(RECORD_MAGIC)?;
        inner.write_all(&RECORD_FORMAT_VERSION.to_le_bytes())?;
        inner.write_all(&[kind as u8])?;
        Ok(Self {
            inner,
            kind,
            count: 0,
        })
    }

    pub fn write<T: Record>(&mut self, record: &T) -> TransferResult<()> {
        debug_assert_eq!(T::KIND, self.kind);
        let body = bincode::serialize(record)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(TransferError::archive(format!(
                "record too large: {} bytes (max {})",
                body.len(),
                MAX_FRAME_SIZE
            )));
        }
        self.inner.write_all(&(body.len() as u32).to_le_bytes())?;
        self.inner.write_all(&body)?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush and hand back the underlying writer with the record count
    pub fn finish(mut self) -> TransferResult<(W, u64)> {
        self.inner.flush()?;
        Ok((self.inner, self.count))
    }
}

/// Encode a batch of records into a complete file image
pub fn encode_file<T: Record>(records: &[T]) -> TransferResult<Vec<u8>> {
    let mut writer = RecordWriter::new(Vec::new(), T::KIND)?;
    for record in records {
        writer.write(record)?;
    }
    let (data, _) = writer.finish()?;
    Ok(data)
}

/// Reads frames from a record file after validating its header
pub struct RecordReader<R: Read> {
    inner: R,
    file: String,
    failed: bool,
}

impl<R: Read> RecordReader<R> {
    /// Validate the header; `file` is used in error messages
    pub fn open(mut inner: R, file: &str, expected: RecordKind) -> TransferResult<Self> {
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| {
            TransferError::invalid_record_file(file, format!("truncated header: {}", e))
        })?;
        if &header[0..4] != RECORD_MAGIC {
            return Err(TransferError::invalid_record_file(file, "bad magic"));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != RECORD_FORMAT_VERSION {
            return Err(TransferError::UnsupportedFormat {
                found: version,
                supported: RECORD_FORMAT_VERSION,
            });
        }
        match RecordKind::from_u8(header[8]) {
            Some(kind) if kind == expected => {}
            _ => {
                return Err(TransferError::invalid_record_file(
                    file,
                    format!("expected {} records", expected.file_prefix()),
                ));
            }
        }
        Ok(Self {
            inner,
            file: file.to_string(),
            failed: false,
        })
    }

    // Ok(None) at a clean end of file.
    fn next_frame(&mut self) -> TransferResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match read_full(&mut self.inner, &mut len_buf)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(TransferError::invalid_record_file(
                    &self.file,
                    format!("truncated frame length ({} bytes)", n),
                ));
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransferError::invalid_record_file(
                &self.file,
                format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
            ));
        }
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).map_err(|e| {
            TransferError::invalid_record_file(&self.file, format!("truncated frame: {}", e))
        })?;
        Ok(Some(body))
    }

    /// Count the remaining frames without decoding them
    pub fn count_frames(mut self) -> TransferResult<u64> {
        let mut count = 0;
        while self.next_frame()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Decode the remaining frames as `T`
    pub fn records<T: Record>(self) -> Records<R, T> {
        Records {
            reader: self,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Iterator over decoded records
pub struct Records<R: Read, T> {
    reader: RecordReader<R>,
    _marker: std::marker::PhantomData<T>,
}

impl<R: Read, T: Record> Iterator for Records<R, T> {
    type Item = TransferResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.failed {
            return None;
        }
        let result = self
            .reader
            .next_frame()
            .and_then(|frame| match frame {
                Some(body) => bincode::deserialize(&body).map(Some).map_err(Into::into),
                None => Ok(None),
            });
        match result {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.reader.failed = true;
                Some(Err(e))
            }
        }
    }
}

// Like read_exact, but reports how much was read before end of file.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeref_core::ContentId;
    use std::io::Cursor;

    fn commit_record(label: &str) -> CommitRecord {
        CommitRecord {
            hash: Hash::from_data(label.as_bytes()),
            parents: vec![Hash::no_ancestor()],
            commit_seq: 1,
            commit_meta: Bytes::from(label.as_bytes().to_vec()),
            puts: vec![KeyWithBytes::of(
                Key::of(["ns", label]),
                ContentId::of(label),
                1,
                b"value".to_vec(),
            )],
            deletes: vec![],
        }
    }

    #[test]
    fn test_file_roundtrip() {
        let records = vec![commit_record("a"), commit_record("b")];
        let data = encode_file(&records).unwrap();

        let reader = RecordReader::open(Cursor::new(&data), "c", RecordKind::Commit).unwrap();
        let decoded: Vec<CommitRecord> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded, records);

        let reader = RecordReader::open(Cursor::new(&data), "c", RecordKind::Commit).unwrap();
        assert_eq!(reader.count_frames().unwrap(), 2);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let data = encode_file(&[commit_record("a")]).unwrap();
        let result = RecordReader::open(Cursor::new(&data), "c", RecordKind::NamedReference);
        assert!(matches!(result, Err(TransferError::InvalidRecordFile { .. })));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut data = encode_file(&[commit_record("a")]).unwrap();
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        let result = RecordReader::open(Cursor::new(&data), "c", RecordKind::Commit);
        assert!(matches!(
            result,
            Err(TransferError::UnsupportedFormat { found: 2, supported: 1 })
        ));
    }

    #[test]
    fn test_truncated_frame_detected() {
        let mut data = encode_file(&[commit_record("a")]).unwrap();
        data.truncate(data.len() - 3);
        let reader = RecordReader::open(Cursor::new(&data), "c", RecordKind::Commit).unwrap();
        assert!(matches!(
            reader.count_frames(),
            Err(TransferError::InvalidRecordFile { .. })
        ));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(RecordKind::Commit.file_name(1), "commits-00001.bin");
        assert_eq!(RecordKind::NamedReference.file_name(12), "named-refs-00012.bin");
    }
}
