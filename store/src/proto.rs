//! Wire types for manifests and hashsets.
//!
//! These are hand-derived prost messages (the schema is small and stable
//! enough not to warrant protoc at build time). Field numbers are part of
//! the on-disk format and must never change.

use bytes::Bytes;
use prost::Message;

use crate::ids::BlobId;
use crate::Error;

/// A contiguous region inside one blob object.
///
/// The blob used to be identified by its encoded string form; new writes
/// store the raw 35-byte ID in `blob_bytes` and leave the string empty.
#[derive(Clone, PartialEq, Message)]
pub struct Range {
    #[prost(string, tag = "1")]
    pub deprecated_blob_string: String,
    #[prost(int64, tag = "2")]
    pub offset: i64,
    #[prost(int64, tag = "3")]
    pub length: i64,
    #[prost(bytes = "bytes", tag = "4")]
    pub blob_bytes: Bytes,
}

impl Range {
    pub fn new(blob: &BlobId, offset: u64, length: u64) -> Self {
        Range {
            deprecated_blob_string: String::new(),
            offset: offset as i64,
            length: length as i64,
            blob_bytes: Bytes::copy_from_slice(blob.as_slice()),
        }
    }

    /// The blob this range lives in, whichever encoding it was stored
    /// with.
    pub fn blob(&self) -> Result<BlobId, Error> {
        if !self.blob_bytes.is_empty() {
            return BlobId::try_from(self.blob_bytes.as_ref());
        }
        BlobId::decode(&self.deprecated_blob_string)
    }
}

/// An ordered sequence of [Range]s forming one logical byte stream.
#[derive(Clone, PartialEq, Message)]
pub struct Stream {
    #[prost(message, repeated, tag = "1")]
    pub ranges: Vec<Range>,
}

impl Stream {
    /// Total logical length in bytes.
    pub fn length(&self) -> u64 {
        self.ranges.iter().map(|r| r.length as u64).sum()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(enumeration = "metadata::Type", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub creation: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub modified: Option<prost_types::Timestamp>,
    #[prost(uint32, tag = "4")]
    pub mode: u32,
    #[prost(string, tag = "5")]
    pub link_target: String,
}

pub mod metadata {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Unknown = 0,
        File = 1,
        Symlink = 2,
    }
}

impl Metadata {
    pub fn kind(&self) -> metadata::Type {
        metadata::Type::try_from(self.r#type).unwrap_or(metadata::Type::Unknown)
    }
}

/// What a path points at: file metadata plus the content hash. `data` is
/// a legacy inline stream which readers still honor when `hash` is empty.
#[derive(Clone, PartialEq, Message)]
pub struct Content {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(message, optional, tag = "2")]
    pub data: Option<Stream>,
    #[prost(bytes = "bytes", tag = "3")]
    pub hash: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct Entry {
    #[prost(bytes = "bytes", tag = "1")]
    pub path: Bytes,
    #[prost(message, optional, tag = "2")]
    pub content: Option<Content>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntrySet {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<Entry>,
}

/// One record of a serialized path database. Today's writers emit a
/// single root page of entries; the loader also accepts `branch` pages
/// pointing at further serialized pages stored as a [Stream].
#[derive(Clone, PartialEq, Message)]
pub struct Page {
    #[prost(string, tag = "1")]
    pub sort_key: String,
    #[prost(oneof = "page::Descendents", tags = "2, 3")]
    pub descendents: Option<page::Descendents>,
}

pub mod page {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Descendents {
        #[prost(message, tag = "2")]
        Branch(super::Stream),
        #[prost(message, tag = "3")]
        Entries(super::EntrySet),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct HashedData {
    #[prost(bytes = "bytes", tag = "1")]
    pub hash: Bytes,
    #[prost(message, optional, tag = "2")]
    pub data: Option<Stream>,
}

/// One serialized group of hash → stream mappings.
#[derive(Clone, PartialEq, Message)]
pub struct HashSet {
    #[prost(message, repeated, tag = "1")]
    pub hashes: Vec<HashedData>,
}

/// Serializes a message with a 4-byte big-endian length prefix, the unit
/// of concatenation inside manifest and hashset documents.
pub fn marshal_sized(msg: &impl Message) -> Vec<u8> {
    let encoded = msg.encode_to_vec();
    let mut out = Vec::with_capacity(encoded.len() + 4);
    out.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    out.extend_from_slice(&encoded);
    out
}

/// Reads the next length-prefixed message out of `buf`, advancing it.
/// Returns `None` cleanly at end of input.
pub fn unmarshal_sized<M: Message + Default>(buf: &mut &[u8]) -> Result<Option<M>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 4 {
        return Err(Error::Integrity(
            "truncated message length prefix".to_string(),
        ));
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let rest = &buf[4..];
    if rest.len() < size {
        return Err(Error::Integrity("truncated message body".to_string()));
    }
    let msg = M::decode(&rest[..size])
        .map_err(|e| Error::Integrity(format!("undecodable message: {}", e)))?;
    *buf = &rest[size..];
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BlobId;

    #[test]
    fn sized_roundtrip() {
        let blob = BlobId::generate();
        let stream = Stream {
            ranges: vec![Range::new(&blob, 7, 35), Range::new(&blob, 42, 1)],
        };
        let mut buf: Vec<u8> = marshal_sized(&stream);
        buf.extend_from_slice(&marshal_sized(&Stream::default()));

        let mut cursor = &buf[..];
        let first: Stream = unmarshal_sized(&mut cursor).unwrap().unwrap();
        assert_eq!(first, stream);
        assert_eq!(first.length(), 36);
        let second: Stream = unmarshal_sized(&mut cursor).unwrap().unwrap();
        assert_eq!(second, Stream::default());
        assert!(unmarshal_sized::<Stream>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn sized_rejects_truncation() {
        let blob = BlobId::generate();
        let stream = Stream {
            ranges: vec![Range::new(&blob, 0, 100)],
        };
        let buf = marshal_sized(&stream);
        let mut cursor = &buf[..buf.len() - 1];
        assert!(unmarshal_sized::<Stream>(&mut cursor).is_err());
    }

    #[test]
    fn range_blob_prefers_binary_id() {
        let blob = BlobId::generate();
        let range = Range::new(&blob, 0, 1);
        assert_eq!(range.blob().unwrap(), blob);

        let legacy = Range {
            deprecated_blob_string: blob.encoded(),
            offset: 0,
            length: 1,
            blob_bytes: Bytes::new(),
        };
        assert_eq!(legacy.blob().unwrap(), blob);
    }
}
