//! The outer container for manifests and hashsets: a fixed ASCII version
//! header, then the zlib-compressed payload cut into 2-byte big-endian
//! length-prefixed frames, terminated by a zero-length frame.
//!
//! The explicit terminator matters: these documents travel through the
//! encryption layer, which pads objects to a whole cipher block, so a
//! reader must be able to tell where the document ends without trusting
//! the object's byte length.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::Error;

pub const VERSION_HEADER: &[u8] = b"jam-v0\n";

const FRAME_LEN_BYTES: usize = 2;
const MAX_FRAME: usize = u16::MAX as usize;

/// Cuts `data` into length-prefixed frames and appends the zero-length
/// terminator.
pub fn frame(data: &[u8]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(data.len() + (data.len() / MAX_FRAME + 2) * FRAME_LEN_BYTES);
    for chunk in data.chunks(MAX_FRAME) {
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

/// Reassembles framed data. Bytes after the terminator are ignored (they
/// are encryption padding); a missing terminator is an error.
pub fn unframe(mut data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len());
    loop {
        if data.len() < FRAME_LEN_BYTES {
            return Err(Error::Integrity(
                "framed data ended without terminator".to_string(),
            ));
        }
        let size = u16::from_be_bytes([data[0], data[1]]) as usize;
        data = &data[FRAME_LEN_BYTES..];
        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(Error::Integrity("truncated frame".to_string()));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size..];
    }
}

/// Produces a complete document: version header + framed zlib body.
pub fn seal_document(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .and_then(|()| encoder.finish())
        .map_err(|e| Error::Integrity(format!("compressing document: {}", e)))
        .map(|compressed| {
            let mut out = Vec::with_capacity(VERSION_HEADER.len() + compressed.len() + 8);
            out.extend_from_slice(VERSION_HEADER);
            out.extend_from_slice(&frame(&compressed));
            out
        })
}

/// Parses a document produced by [seal_document], returning the payload.
pub fn open_document(doc: &[u8]) -> Result<Vec<u8>, Error> {
    if doc.len() < VERSION_HEADER.len() || &doc[..VERSION_HEADER.len()] != VERSION_HEADER {
        return Err(Error::Integrity("invalid manifest version".to_string()));
    }
    let compressed = unframe(&doc[VERSION_HEADER.len()..])?;
    let mut payload = Vec::new();
    ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut payload)
        .map_err(|e| Error::Integrity(format!("decompressing document: {}", e)))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(0)]
    #[case::tiny(1)]
    #[case::one_frame(65535)]
    #[case::frame_boundary(65536)]
    #[case::multi_frame(200_000)]
    fn frame_roundtrip(#[case] len: usize) {
        let data: Vec<u8> = (0..len).map(|i| (i % 257 % 256) as u8).collect();
        let framed = frame(&data);
        assert_eq!(&framed[framed.len() - 2..], &[0, 0]);
        assert_eq!(unframe(&framed).unwrap(), data);
    }

    #[test]
    fn unframe_ignores_trailing_padding() {
        let mut framed = frame(b"payload");
        framed.extend_from_slice(&[0u8; 512]);
        assert_eq!(unframe(&framed).unwrap(), b"payload");
    }

    #[test]
    fn unframe_requires_terminator() {
        let framed = frame(b"payload");
        assert!(unframe(&framed[..framed.len() - 2]).is_err());
        assert!(unframe(&[]).is_err());
    }

    #[test]
    fn document_roundtrip() {
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
        let doc = seal_document(&payload).unwrap();
        assert!(doc.starts_with(VERSION_HEADER));
        assert_eq!(open_document(&doc).unwrap(), payload);
    }

    #[test]
    fn document_rejects_bad_header() {
        let doc = seal_document(b"payload").unwrap();
        let mut bad = doc.clone();
        bad[0] ^= 0xff;
        assert!(open_document(&bad).is_err());
        assert!(open_document(b"jam").is_err());
    }
}
