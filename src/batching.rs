//! Optional small-record coalescing (§4.3 `CombineRecords`).

use crate::envelope::{Batch, Envelope};
use bytes::{BufMut, Bytes, BytesMut};

/// Coalesce small byte-record envelopes into ≤`max_bytes` concatenations,
/// preserving the highest position per coalesced bucket so the bookmark
/// coordinator can still commit correctly. Never produces a bucket larger
/// than `max_bytes`, and never merges across `bookmark_key` boundaries
/// (doing so would make the max-position-per-key rule ambiguous).
pub fn combine_small_records(batch: Batch<Bytes>, max_bytes: usize) -> Batch<Bytes> {
    if batch.is_empty() {
        return batch;
    }

    let mut out = Batch::new();
    let mut current: Option<(BytesMut, Envelope<Bytes>)> = None;

    for env in batch.envelopes {
        let size = env.payload.len();
        match &mut current {
            Some((buf, carrier)) if buf.len() + size <= max_bytes && carrier.bookmark_key == env.bookmark_key => {
                buf.put_slice(&env.payload);
                if env.position > carrier.position {
                    carrier.position = env.position;
                }
            }
            _ => {
                if let Some((buf, carrier)) = current.take() {
                    let len = buf.len();
                    out.push(
                        Envelope {
                            payload: buf.freeze(),
                            ..carrier
                        },
                        len,
                    );
                }
                let mut buf = BytesMut::with_capacity(size.max(64));
                buf.put_slice(&env.payload);
                current = Some((buf, env));
            }
        }
    }

    if let Some((buf, carrier)) = current {
        let len = buf.len();
        out.push(
            Envelope {
                payload: buf.freeze(),
                ..carrier
            },
            len,
        );
    }

    out
}
