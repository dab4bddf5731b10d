//! LZ4 block compression for packet payloads.
//!
//! Payloads are compressed as a raw LZ4 block with no size prefix. The
//! receiver bounds the output by the largest payload a packet may carry, so
//! a hostile block can never expand beyond one packet.

use crate::error::{ProtocolError, Result};

/// Sampled data at or above this many bits per byte is treated as
/// incompressible.
const MIN_ENTROPY_THRESHOLD: f64 = 7.0;

/// Bytes sampled for the entropy estimate.
const ENTROPY_SAMPLE: usize = 512;

/// Shannon entropy of `data` in bits per byte.
fn shannon_entropy(data: &[u8]) -> f64 {
    let mut histogram = [0usize; 256];
    data.iter().for_each(|&b| histogram[usize::from(b)] += 1);

    let total = data.len() as f64;
    histogram
        .iter()
        .filter(|&&n| n != 0)
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Cheap pre-check used by adaptive compression: sample the head of the
/// payload and skip compression for data that already looks random.
pub fn is_compressible(data: &[u8]) -> bool {
    // Too small for the sample to mean anything
    if data.len() < ENTROPY_SAMPLE {
        return true;
    }
    shannon_entropy(&data[..ENTROPY_SAMPLE]) < MIN_ENTROPY_THRESHOLD
}

/// Compress `data` into a raw LZ4 block.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn compress_block(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; lz4_flex::block::get_maximum_output_size(data.len())];
    let n = lz4_flex::block::compress_into(data, &mut out)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    out.truncate(n);
    Ok(out)
}

/// Decompress a raw LZ4 block whose output may not exceed `max_len` bytes.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if the block is malformed
/// or would expand past `max_len`
pub fn decompress_block(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; max_len];
    let n = lz4_flex::block::decompress_into(data, &mut out)
        .map_err(|_| ProtocolError::DecompressionFailure)?;
    out.truncate(n);
    Ok(out)
}
