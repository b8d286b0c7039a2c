use bytes::Bytes;
use lcmprims_frame::Envelope;

use crate::error::{Result, TransportError};

/// Maximum number of fragments one message can be split into.
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Split a payload into envelopes of at most `fragment_size` payload bytes.
///
/// Payloads up to `fragment_size` (including empty ones) produce a single
/// envelope. Chunks share `payload`'s buffer.
pub fn fragment(
    channel: &str,
    sequence_number: u32,
    payload: &Bytes,
    fragment_size: usize,
) -> Result<Vec<Envelope>> {
    if fragment_size == 0 {
        return Err(TransportError::InvalidConfig(
            "fragment size must be greater than zero".to_string(),
        ));
    }

    let total = payload.len().div_ceil(fragment_size).max(1);
    if total > MAX_FRAGMENTS {
        return Err(TransportError::PayloadTooLarge {
            size: payload.len(),
            max: fragment_size.saturating_mul(MAX_FRAGMENTS),
        });
    }

    let fragments = (0..total)
        .map(|index| {
            let start = index * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            Envelope {
                channel: channel.to_string(),
                payload: payload.slice(start..end),
                sequence_number,
                fragment_offset: index as u16,
                fragment_total: total as u16,
            }
        })
        .collect();

    Ok(fragments)
}
