//! Binary format of log records
//!
//! Every record follows the same layout, with no padding between records:
//! length(u64 BE) + id(12 bytes) + payload bytes
//!
//! The byte offset of a record's length field is its durable locator.
//! A file, a snapshot's log section and a record batch are all just a
//! sequence of records in this layout.

use std::io::{ErrorKind, Read};

use crate::error::{LogKvError, LogKvResult};
use crate::id::{Identifier, ID_SIZE};

/// Size of the payload length field
pub const LENGTH_SIZE: usize = 8;

/// Full record header: length + identifier
pub const HEADER_SIZE: usize = LENGTH_SIZE + ID_SIZE;

/// Largest payload a reader will accept unless configured otherwise (64MB)
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Initial buffer reservation when reading a payload; the rest grows as
/// bytes actually arrive so a corrupt length cannot force a huge allocation.
const PAYLOAD_PREALLOC: usize = 64 * 1024;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset of the record's length header
    pub offset: u64,
    pub id: Identifier,
    pub payload: Vec<u8>,
}

impl Record {
    /// Bytes this record occupies on disk.
    pub fn encoded_len(&self) -> u64 {
        encoded_len(self.payload.len())
    }

    /// Offset of the byte just past this record.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.encoded_len()
    }
}

/// On-disk size of a record carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> u64 {
    (HEADER_SIZE + payload_len) as u64
}

/// Serialize one record.
pub fn encode(id: &Identifier, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    encode_into(&mut buffer, id, payload);
    buffer
}

/// Append one serialized record to `buffer`.
pub fn encode_into(buffer: &mut Vec<u8>, id: &Identifier, payload: &[u8]) {
    buffer.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buffer.extend_from_slice(id.as_bytes());
    buffer.extend_from_slice(payload);
}

/// Serialize a batch of records back to back.
pub fn encode_batch<'a, I>(records: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a Identifier, &'a [u8])>,
{
    let mut buffer = Vec::new();
    for (id, payload) in records {
        encode_into(&mut buffer, id, payload);
    }
    buffer
}

/// Decode every record in `bytes`. Any trailing partial record is an error.
pub fn decode_batch(bytes: &[u8]) -> LogKvResult<Vec<Record>> {
    let mut reader = RecordReader::new(bytes, 0);
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        records.push(record);
    }
    Ok(records)
}

/// Read exactly one record from a stream positioned at a record boundary.
///
/// Returns `(bytes_consumed, id, payload)`, or `None` on a clean end of
/// stream before any header byte.
pub fn decode<R: Read>(reader: R) -> LogKvResult<Option<(u64, Identifier, Vec<u8>)>> {
    let mut reader = RecordReader::new(reader, 0);
    Ok(reader.next_record()?.map(|r| (r.encoded_len(), r.id, r.payload)))
}

/// Outcome of a full replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records visited
    pub records: u64,
    /// Offset just past the last complete record
    pub end_offset: u64,
}

/// Replay a stream from offset `start`, calling `visit(id, payload, offset)`
/// for every record in order until a clean end of stream.
///
/// A decode error aborts the replay and is returned to the caller; records
/// visited before it stay visited.
pub fn decode_all<R, F>(reader: R, start: u64, max_payload: u64, mut visit: F) -> LogKvResult<ReplaySummary>
where
    R: Read,
    F: FnMut(Identifier, &[u8], u64) -> LogKvResult<()>,
{
    let mut reader = RecordReader::new(reader, start).with_max_payload(max_payload);
    let mut records = 0u64;
    while let Some(record) = reader.next_record()? {
        visit(record.id, &record.payload, record.offset)?;
        records += 1;
    }
    Ok(ReplaySummary { records, end_offset: reader.offset() })
}

/// Sequential record decoder that tracks the offset of each record.
///
/// This is the only place offsets advance while scanning a log.
pub struct RecordReader<R> {
    reader: R,
    offset: u64,
    max_payload: u64,
}

impl<R: Read> RecordReader<R> {
    /// Reader whose first record sits at `offset`.
    pub fn new(reader: R, offset: u64) -> Self {
        Self { reader, offset, max_payload: MAX_PAYLOAD_SIZE }
    }

    /// Override the payload size limit.
    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Offset of the next record to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> LogKvResult<Option<Record>> {
        let offset = self.offset;

        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(LogKvError::Truncated {
                offset,
                expected: HEADER_SIZE as u64,
                available: got as u64,
            });
        }

        let mut len_bytes = [0u8; LENGTH_SIZE];
        len_bytes.copy_from_slice(&header[..LENGTH_SIZE]);
        let payload_len = u64::from_be_bytes(len_bytes);

        if payload_len > self.max_payload {
            return Err(LogKvError::CorruptRecord {
                offset,
                reason: format!("payload length {} exceeds limit {}", payload_len, self.max_payload),
            });
        }

        let id = Identifier::from_bytes(&header[LENGTH_SIZE..])?;

        let mut payload = Vec::with_capacity((payload_len as usize).min(PAYLOAD_PREALLOC));
        let read = (&mut self.reader).take(payload_len).read_to_end(&mut payload)?;
        if (read as u64) < payload_len {
            return Err(LogKvError::Truncated {
                offset,
                expected: HEADER_SIZE as u64 + payload_len,
                available: (HEADER_SIZE + read) as u64,
            });
        }

        self.offset += HEADER_SIZE as u64 + payload_len;
        Ok(Some(Record { offset, id, payload }))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = LogKvResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Fill `buf` as far as the stream allows; returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> LogKvResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id(ts: u32, counter: u64) -> Identifier {
        Identifier::from_parts(ts, counter)
    }

    #[test]
    fn test_layout() {
        let bytes = encode(&id(1, 2), b"abc");
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[..8], &3u64.to_be_bytes());
        assert_eq!(&bytes[8..20], id(1, 2).as_bytes());
        assert_eq!(&bytes[20..], b"abc");
    }

    #[test]
    fn test_roundtrip_including_empty_payload() {
        for payload in [&b""[..], b"x", b"{\"trace\":\"abc\"}", &[0u8, 255, 7][..]] {
            let bytes = encode(&id(100, 9), payload);
            let (consumed, got_id, got_payload) = decode(Cursor::new(&bytes)).unwrap().unwrap();
            assert_eq!(consumed, bytes.len() as u64);
            assert_eq!(got_id, id(100, 9));
            assert_eq!(got_payload, payload);
        }
    }

    #[test]
    fn test_clean_eof_is_none() {
        assert!(decode(Cursor::new(Vec::<u8>::new())).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let bytes = encode(&id(1, 1), b"payload");
        let result = decode(Cursor::new(&bytes[..10]));
        assert!(matches!(result, Err(LogKvError::Truncated { expected, available: 10, .. }) if expected == HEADER_SIZE as u64));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = encode(&id(1, 1), b"payload");
        let result = decode(Cursor::new(&bytes[..bytes.len() - 2]));
        assert!(matches!(result, Err(LogKvError::Truncated { offset: 0, .. })));
    }

    #[test]
    fn test_absurd_length_is_corrupt() {
        let mut bytes = encode(&id(1, 1), b"p");
        bytes[..8].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(decode(Cursor::new(&bytes)), Err(LogKvError::CorruptRecord { .. })));

        let small = RecordReader::new(Cursor::new(encode(&id(1, 1), b"0123456789")), 0).with_max_payload(4);
        let errs: Vec<_> = small.collect();
        assert!(matches!(errs[0], Err(LogKvError::CorruptRecord { .. })));
    }

    #[test]
    fn test_decode_all_offsets() {
        let mut file = Vec::new();
        encode_into(&mut file, &id(1, 1), b"a");
        encode_into(&mut file, &id(1, 2), b"bbbb");
        encode_into(&mut file, &id(2, 3), b"");

        let mut seen = Vec::new();
        let summary = decode_all(Cursor::new(&file), 0, MAX_PAYLOAD_SIZE, |id, payload, offset| {
            seen.push((id.counter(), payload.to_vec(), offset));
            Ok(())
        })
        .unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.end_offset, file.len() as u64);
        assert_eq!(seen[0], (1, b"a".to_vec(), 0));
        assert_eq!(seen[1], (2, b"bbbb".to_vec(), encoded_len(1)));
        assert_eq!(seen[2], (3, Vec::new(), encoded_len(1) + encoded_len(4)));
    }

    #[test]
    fn test_decode_all_surfaces_mid_stream_error() {
        let mut file = encode(&id(1, 1), b"good");
        file.extend_from_slice(&encode(&id(1, 2), b"torn")[..HEADER_SIZE + 1]);

        let mut visited = 0;
        let result = decode_all(Cursor::new(&file), 0, MAX_PAYLOAD_SIZE, |_, _, _| {
            visited += 1;
            Ok(())
        });
        assert_eq!(visited, 1);
        assert!(matches!(result, Err(LogKvError::Truncated { offset, .. }) if offset == encoded_len(4)));
    }

    #[test]
    fn test_batch() {
        let a = id(5, 1);
        let b = id(5, 2);
        let bytes = encode_batch([(&a, &b"one"[..]), (&b, &b"two"[..])]);
        let records = decode_batch(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, b);
        assert_eq!(records[1].payload, b"two");
        assert_eq!(records[1].offset, records[0].end_offset());

        assert!(decode_batch(&bytes[..bytes.len() - 1]).is_err());
    }
}
