//! MD5 checksum encodings
//!
//! Object specs and the gRPC API carry hex digests; HTTP `Content-MD5`
//! headers and most cloud metadata carry base64 of the raw digest.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ::md5::{Digest, Md5};

use crate::SciError;

/// Hex digest of `data`
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Hex digest to `Content-MD5` base64
pub fn hex_to_base64(hex_digest: &str) -> Result<String, SciError> {
    let raw = hex::decode(hex_digest.trim())
        .map_err(|e| SciError::InvalidArgument(format!("md5 is not hex: {e}")))?;
    if raw.len() != 16 {
        return Err(SciError::InvalidArgument(format!(
            "md5 must be 16 bytes, got {}",
            raw.len()
        )));
    }
    Ok(STANDARD.encode(raw))
}

/// `Content-MD5` base64 to lowercase hex
pub fn base64_to_hex(b64: &str) -> Result<String, SciError> {
    let raw = STANDARD
        .decode(b64.trim())
        .map_err(|e| SciError::InvalidArgument(format!("md5 is not base64: {e}")))?;
    Ok(hex::encode(raw))
}

/// Incremental MD5 over a stream of chunks
#[derive(Default)]
pub struct Md5Stream(Md5);

impl Md5Stream {
    /// Feed a chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    /// Hex digest of everything fed so far
    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}
