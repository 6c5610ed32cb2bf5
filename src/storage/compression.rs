//! Blob framing: optional Snappy compression plus CRC32 integrity
//!
//! Every persisted chunk travels as `[flag: u8][payload]` where flag 1 means
//! the payload is a Snappy frame and flag 0 means raw bytes. The flag keeps
//! readers independent of build-time settings. Checksums are computed over
//! the whole on-disk blob and stored out of band (in the registry state), so
//! the blob format itself stays a plain compressed stream.

use crate::error::{IndexError, Result};

const FLAG_RAW: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// Frame `data` for disk, compressing unless told otherwise.
pub fn pack(data: &[u8], compress: bool) -> Result<Vec<u8>> {
    if !compress {
        let mut blob = Vec::with_capacity(1 + data.len());
        blob.push(FLAG_RAW);
        blob.extend_from_slice(data);
        return Ok(blob);
    }

    let compressed = snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| IndexError::Compression(format!("compress failed: {}", e)))?;

    let mut blob = Vec::with_capacity(1 + compressed.len());
    blob.push(FLAG_COMPRESSED);
    blob.extend_from_slice(&compressed);
    Ok(blob)
}

/// Undo [`pack`].
pub fn unpack(blob: &[u8]) -> Result<Vec<u8>> {
    let (&flag, payload) = blob
        .split_first()
        .ok_or_else(|| IndexError::Compression("empty blob".into()))?;

    match flag {
        FLAG_RAW => Ok(payload.to_vec()),
        FLAG_COMPRESSED => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|e| IndexError::Compression(format!("decompress failed: {}", e))),
        other => Err(IndexError::Compression(format!(
            "unknown compression flag {}",
            other
        ))),
    }
}

/// CRC32 over the on-disk form of a blob.
pub fn checksum(blob: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(blob);
    hasher.finalize()
}

/// Verify a fetched blob against its recorded checksum. Corruption is fatal
/// for the chunk and propagates.
pub fn verify(id: u64, blob: &[u8], expected: u32) -> Result<()> {
    let actual = checksum(blob);
    if actual != expected {
        return Err(IndexError::ChecksumMismatch {
            id,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_compressed() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let blob = pack(&data, true).unwrap();
        assert_eq!(blob[0], FLAG_COMPRESSED);
        assert!(blob.len() < data.len());
        assert_eq!(unpack(&blob).unwrap(), data);
    }

    #[test]
    fn test_round_trip_raw() {
        let data = b"short".to_vec();
        let blob = pack(&data, false).unwrap();
        assert_eq!(blob[0], FLAG_RAW);
        assert_eq!(unpack(&blob).unwrap(), data);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let blob = pack(b"payload bytes", true).unwrap();
        let sum = checksum(&blob);
        verify(9, &blob, sum).unwrap();

        let mut corrupt = blob.clone();
        corrupt[1] ^= 0xFF;
        let err = verify(9, &corrupt, sum).unwrap_err();
        assert!(matches!(
            err,
            crate::error::IndexError::ChecksumMismatch { id: 9, .. }
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(unpack(&[7, 1, 2, 3]).is_err());
        assert!(unpack(&[]).is_err());
    }
}
