//! Reed-Solomon forward error correction over segment grids.
//!
//! Wire packets are sliced into `segment_length`-byte data segments for
//! transmission; this module derives parity segments from the zero-padded
//! segment grid using a systematic Reed-Solomon code over GF(2^8), and can
//! reconstruct missing data segments from any sufficient subset.
//!
//! The parity count is `ceil(ratio * data_segments)`, minimum 1. Padding
//! exists only inside the encoder's working set. The source bytes are
//! never mutated, so a caller observes the same packet length before and
//! after parity generation.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use crate::packet::NetworkData;
use crate::{Result, RtcError};

/// GF(2^8) bounds the total shard count.
const MAX_TOTAL_SEGMENTS: usize = 255;

/// Number of data segments a byte sequence occupies at `segment_length`.
pub fn data_segment_count(data_length: usize, segment_length: usize) -> usize {
    data_length / segment_length + usize::from(data_length % segment_length != 0)
}

/// Number of parity segments for a given data segment count and ratio.
pub fn parity_segment_count(data_segments: usize, ratio: f64) -> usize {
    ((ratio * data_segments as f64).ceil() as usize).max(1)
}

/// Compute Reed-Solomon parity over `data`, zero-padded to a whole number
/// of `segment_length`-byte segments.
///
/// Returns the parity segments concatenated as new [`NetworkData`] of
/// exactly `parity_segments * segment_length` bytes. The input is read
/// only; its length is unchanged by this call.
pub fn parity_data(data: &[u8], segment_length: usize, ratio: f64) -> Result<NetworkData> {
    if data.is_empty() {
        return Err(RtcError::FecEncoding { details: "empty source data".into() });
    }
    if segment_length == 0 {
        return Err(RtcError::FecEncoding { details: "zero segment length".into() });
    }
    if !(ratio > 0.0) {
        return Err(RtcError::FecEncoding { details: format!("non-positive ratio {ratio}") });
    }

    let n_data = data_segment_count(data.len(), segment_length);
    let n_parity = parity_segment_count(n_data, ratio);
    if n_data + n_parity > MAX_TOTAL_SEGMENTS {
        return Err(RtcError::FecEncoding {
            details: format!(
                "{n_data} data + {n_parity} parity segments exceed GF(2^8) limit {MAX_TOTAL_SEGMENTS}"
            ),
        });
    }

    debug!(n_data, n_parity, segment_length, "computing FEC parity");

    // Zero-padded working copy; the caller's bytes stay untouched.
    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(n_data + n_parity);
    for i in 0..n_data {
        let start = i * segment_length;
        let end = (start + segment_length).min(data.len());
        let mut shard = data[start..end].to_vec();
        shard.resize(segment_length, 0);
        shards.push(shard);
    }
    shards.extend(std::iter::repeat_with(|| vec![0u8; segment_length]).take(n_parity));

    let codec = ReedSolomon::new(n_data, n_parity)
        .map_err(|e| RtcError::FecEncoding { details: e.to_string() })?;
    codec
        .encode(&mut shards)
        .map_err(|e| RtcError::FecEncoding { details: e.to_string() })?;

    let mut parity = Vec::with_capacity(n_parity * segment_length);
    for shard in &shards[n_data..] {
        parity.extend_from_slice(shard);
    }
    Ok(NetworkData::new(parity))
}

/// Reconstruct missing data segments from a partial segment grid.
///
/// `segments` holds `data_segments + parity_segments` entries in wire
/// order; `None` marks a segment lost in transit. On success the data
/// portion is returned reassembled, still zero-padded to whole segments;
/// the caller trims to the known packet length.
pub fn recover(
    segments: Vec<Option<Vec<u8>>>,
    data_segments: usize,
    parity_segments: usize,
    segment_length: usize,
) -> Result<Vec<u8>> {
    if segments.len() != data_segments + parity_segments {
        return Err(RtcError::FecEncoding {
            details: format!(
                "segment grid of {} entries, expected {}",
                segments.len(),
                data_segments + parity_segments
            ),
        });
    }

    let codec = ReedSolomon::new(data_segments, parity_segments)
        .map_err(|e| RtcError::FecEncoding { details: e.to_string() })?;

    let mut shards = segments;
    codec
        .reconstruct_data(&mut shards)
        .map_err(|e| RtcError::FecEncoding { details: e.to_string() })?;

    let mut out = Vec::with_capacity(data_segments * segment_length);
    for shard in shards.into_iter().take(data_segments) {
        // reconstruct_data fills every data slot on success
        let shard = shard.ok_or_else(|| RtcError::FecEncoding {
            details: "data segment missing after reconstruction".into(),
        })?;
        out.extend_from_slice(&shard);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parity_never_mutates_source_and_has_exact_length(
                data in prop::collection::vec(any::<u8>(), 1..2000),
                segment_length in 16usize..256,
                ratio in 0.05f64..1.0
            ) {
                let before = data.clone();
                let parity = parity_data(&data, segment_length, ratio).unwrap();
                prop_assert_eq!(&data, &before);

                let n_data = data_segment_count(data.len(), segment_length);
                let n_parity = parity_segment_count(n_data, ratio);
                prop_assert_eq!(parity.len(), n_parity * segment_length);
                prop_assert!(parity.is_valid());
            }

            #[test]
            fn lost_data_segments_recover_within_parity_budget(
                data in prop::collection::vec(any::<u8>(), 64..1500),
                segment_length in 32usize..128
            ) {
                let ratio = 0.5;
                let n_data = data_segment_count(data.len(), segment_length);
                let n_parity = parity_segment_count(n_data, ratio);
                let parity = parity_data(&data, segment_length, ratio).unwrap();

                // Build the full grid, then drop up to n_parity data segments.
                let mut grid: Vec<Option<Vec<u8>>> = Vec::new();
                for i in 0..n_data {
                    let start = i * segment_length;
                    let end = (start + segment_length).min(data.len());
                    let mut shard = data[start..end].to_vec();
                    shard.resize(segment_length, 0);
                    grid.push(Some(shard));
                }
                for i in 0..n_parity {
                    let start = i * segment_length;
                    grid.push(Some(parity.bytes()[start..start + segment_length].to_vec()));
                }
                let losses = n_parity.min(n_data);
                for slot in grid.iter_mut().take(losses) {
                    *slot = None;
                }

                let recovered = recover(grid, n_data, n_parity, segment_length).unwrap();
                prop_assert_eq!(&recovered[..data.len()], &data[..]);
            }
        }
    }

    #[test]
    fn segment_count_arithmetic() {
        assert_eq!(data_segment_count(100, 100), 1);
        assert_eq!(data_segment_count(101, 100), 2);
        assert_eq!(data_segment_count(1, 100), 1);
        // Minimum one parity segment regardless of ratio.
        assert_eq!(parity_segment_count(1, 0.01), 1);
        assert_eq!(parity_segment_count(10, 0.2), 2);
        assert_eq!(parity_segment_count(10, 0.25), 3);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(parity_data(&[], 16, 0.2).is_err());
        assert!(parity_data(&[1, 2, 3], 0, 0.2).is_err());
        assert!(parity_data(&[1, 2, 3], 16, 0.0).is_err());
        assert!(parity_data(&[1, 2, 3], 16, -1.0).is_err());
    }

    #[test]
    fn rejects_grids_over_gf256_limit() {
        let data = vec![0u8; 300];
        // 300 data segments of 1 byte blows the shard limit.
        assert!(parity_data(&data, 1, 0.2).is_err());
    }
}
