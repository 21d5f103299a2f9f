//! Binary encoding of [`PersistedState`].
//!
//! # Format
//! ```text
//! magic:   "TMS1"         (4 bytes)
//! version: u32 LE         (4 bytes)
//! flags:   u8             (bit 0 = body is gzip-compressed)
//! body:    bincode(PersistedState), optionally gzipped
//! ```

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

use super::PersistedState;

const MAGIC: &[u8; 4] = b"TMS1";
const HEADER_LEN: usize = 9;
const FLAG_GZIP: u8 = 0x01;

/// Bumped whenever the body layout changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("state blob shorter than its header ({0} bytes)")]
    Truncated(usize),
    #[error("state blob has an unknown magic number")]
    BadMagic,
    #[error("unsupported state format version {0}")]
    UnsupportedVersion(u32),
    #[error("state body could not be (de)serialized: {0}")]
    Body(String),
    #[error("state body could not be (de)compressed: {0}")]
    Compression(String),
}

pub fn encode(state: &PersistedState, compress: bool) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(state).map_err(|e| CodecError::Body(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(if compress { FLAG_GZIP } else { 0 });

    if compress {
        let mut encoder = GzEncoder::new(out, Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    } else {
        out.extend_from_slice(&body);
        Ok(out)
    }
}

pub fn decode(bytes: &[u8]) -> Result<PersistedState, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if &bytes[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let flags = bytes[8];
    let body = &bytes[HEADER_LEN..];

    if flags & FLAG_GZIP != 0 {
        let mut decompressed = Vec::new();
        GzDecoder::new(body)
            .read_to_end(&mut decompressed)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        bincode::deserialize(&decompressed).map_err(|e| CodecError::Body(e.to_string()))
    } else {
        bincode::deserialize(body).map_err(|e| CodecError::Body(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::{DrainConfig, TemplateMiner};
    use crate::types::Cursor;

    fn sample_state() -> PersistedState {
        let mut miner = TemplateMiner::new(DrainConfig::default());
        for line in [
            "user 123 login ok",
            "user 456 login ok",
            "user 789 login fail",
            "disk full on /dev/sda1",
            "",
        ] {
            miner.add_line(line).unwrap();
        }
        PersistedState {
            cursor: Cursor::new(1_700_000_000_000_000_000),
            tree: miner.into_tree(),
        }
    }

    #[test]
    fn test_round_trip_plain_and_compressed() {
        let state = sample_state();
        for compress in [false, true] {
            let bytes = encode(&state, compress).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, state);

            let templates: Vec<String> =
                decoded.tree.clusters().map(|c| c.template_string()).collect();
            assert!(templates.contains(&"user <*> login <*>".to_string()));
        }
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(matches!(decode(b"TMS"), Err(CodecError::Truncated(3))));
        assert!(matches!(
            decode(b"XXXX\x01\x00\x00\x00\x00body"),
            Err(CodecError::BadMagic)
        ));
        assert!(matches!(
            decode(b"TMS1\x09\x00\x00\x00\x00body"),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let bytes = encode(&sample_state(), false).unwrap();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(decode(cut), Err(CodecError::Body(_))));
    }
}
