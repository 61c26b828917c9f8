//! Task context codec.
//!
//! Context blobs above a threshold are stored gzip-compressed; the runner
//! surface always serves them decompressed.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use shepherd_store::models::ContextEncoding;

/// Contexts at or below this size are stored as-is.
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// Errors from decoding stored context bytes.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to decompress context: {0}")]
    Decompress(#[from] std::io::Error),
}

/// Encode context for storage, compressing when it pays off.
///
/// Small contexts stay plain; larger ones are gzipped unless compression
/// does not actually shrink them.
pub fn encode(raw: &[u8]) -> (Vec<u8>, ContextEncoding) {
    if raw.len() <= COMPRESSION_THRESHOLD {
        return (raw.to_vec(), ContextEncoding::Plain);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(raw).is_err() {
        return (raw.to_vec(), ContextEncoding::Plain);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < raw.len() => (compressed, ContextEncoding::Gzip),
        _ => (raw.to_vec(), ContextEncoding::Plain),
    }
}

/// Decode stored context back to its original bytes.
pub fn decode(stored: &[u8], encoding: ContextEncoding) -> Result<Vec<u8>, ContextError> {
    match encoding {
        ContextEncoding::Plain => Ok(stored.to_vec()),
        ContextEncoding::Gzip => {
            let mut decoder = GzDecoder::new(stored);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_context_stays_plain() {
        let raw = b"short context";
        let (stored, encoding) = encode(raw);
        assert_eq!(encoding, ContextEncoding::Plain);
        assert_eq!(stored, raw);
        assert_eq!(decode(&stored, encoding).unwrap(), raw);
    }

    #[test]
    fn large_context_roundtrips_through_gzip() {
        // Highly compressible payload well above the threshold.
        let raw: Vec<u8> = b"issue body line\n"
            .iter()
            .cycle()
            .take(64 * 1024)
            .copied()
            .collect();

        let (stored, encoding) = encode(&raw);
        assert_eq!(encoding, ContextEncoding::Gzip);
        assert!(stored.len() < raw.len(), "gzip should shrink this payload");
        assert_eq!(decode(&stored, encoding).unwrap(), raw);
    }

    #[test]
    fn incompressible_context_stays_plain() {
        // Pseudo-random bytes barely compress; encode must not grow them.
        let mut raw = Vec::with_capacity(32 * 1024);
        let mut x: u32 = 0x2545_f491;
        for _ in 0..32 * 1024 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            raw.push((x & 0xff) as u8);
        }

        let (stored, encoding) = encode(&raw);
        assert_eq!(decode(&stored, encoding).unwrap(), raw);
        assert!(stored.len() <= raw.len());
    }

    #[test]
    fn empty_context_roundtrips() {
        let (stored, encoding) = encode(b"");
        assert_eq!(encoding, ContextEncoding::Plain);
        assert!(decode(&stored, encoding).unwrap().is_empty());
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let result = decode(b"definitely not gzip", ContextEncoding::Gzip);
        assert!(result.is_err());
    }
}
