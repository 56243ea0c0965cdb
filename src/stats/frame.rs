//! Stats wire format
//!
//! One frame per broadcast: the JSON array of tunnel snapshots followed by
//! zero bytes up to the next 256-byte boundary. There is always at least one
//! zero byte, and the first zero after the payload terminates the frame.
//! JSON text never contains a raw zero byte, so no length prefix is needed.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::forwarding::TunnelStatsSnapshot;

/// Frames are padded to a multiple of this many bytes
pub const FRAME_BLOCK: usize = 256;

/// Upper bound on an unterminated payload before the stream is abandoned
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct StatsFrameCodec;

impl StatsFrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl<'a> Encoder<&'a [TunnelStatsSnapshot]> for StatsFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &'a [TunnelStatsSnapshot], dst: &mut BytesMut) -> io::Result<()> {
        let payload = serde_json::to_vec(item)?;
        let padding = FRAME_BLOCK - payload.len() % FRAME_BLOCK;
        dst.reserve(payload.len() + padding);
        dst.put_slice(&payload);
        dst.put_bytes(0, padding);
        Ok(())
    }
}

impl Decoder for StatsFrameCodec {
    type Item = Vec<TunnelStatsSnapshot>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            // Padding left over from the previous frame
            match src.iter().position(|b| *b != 0) {
                Some(start) => src.advance(start),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            let Some(end) = src.iter().position(|b| *b == 0) else {
                if src.len() > MAX_FRAME_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("stats frame exceeds {} bytes", MAX_FRAME_LEN),
                    ));
                }
                return Ok(None);
            };

            let payload = src.split_to(end);
            match serde_json::from_slice(&payload) {
                Ok(stats) => return Ok(Some(stats)),
                Err(e) => warn!("Discarding malformed stats frame: {}", e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            debug!("Dropping {} bytes of truncated stats frame", src.len());
            src.clear();
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, connections: u64, received: u64, transmitted: u64) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            name: name.into(),
            connections,
            received,
            transmitted,
        }
    }

    fn encode(stats: &[TunnelStatsSnapshot]) -> BytesMut {
        let mut buf = BytesMut::new();
        StatsFrameCodec.encode(stats, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_is_padded_to_block() {
        let stats = vec![snapshot("T1", 1, 4, 4)];
        let payload = serde_json::to_vec(&stats).unwrap();
        let frame = encode(&stats);

        assert_eq!(frame.len(), FRAME_BLOCK);
        assert_eq!(&frame[..payload.len()], payload.as_slice());
        assert!(frame[payload.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_exact_block_payload_gets_full_padding_block() {
        // An empty list serializes to "[]"; grow a name until the payload
        // lands exactly on the boundary
        let base = serde_json::to_vec(&[snapshot("", 0, 0, 0)]).unwrap().len();
        let stats = vec![snapshot(&"x".repeat(FRAME_BLOCK - base), 0, 0, 0)];
        assert_eq!(serde_json::to_vec(&stats).unwrap().len(), FRAME_BLOCK);

        let frame = encode(&stats);
        assert_eq!(frame.len(), 2 * FRAME_BLOCK);
        assert_eq!(frame[FRAME_BLOCK], 0);
    }

    #[test]
    fn test_decode_reproduces_values() {
        let stats = vec![
            snapshot("web", 3, 1_234_567, 89),
            snapshot("A jumphost", 1, u64::MAX, 0),
        ];
        let mut buf = encode(&stats);

        let decoded = StatsFrameCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(stats));
        assert_eq!(StatsFrameCodec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let frame = encode(&[snapshot("T1", 1, 2, 3)]);
        let mut buf = BytesMut::from(&frame[..10]);
        assert_eq!(StatsFrameCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[10..]);
        assert!(StatsFrameCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_consecutive_frames_split_on_padding() {
        let first = vec![snapshot("T1", 1, 0, 0)];
        let second = vec![snapshot("T1", 2, 10, 20)];
        let mut buf = encode(&first);
        buf.extend_from_slice(&encode(&second));

        assert_eq!(StatsFrameCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(StatsFrameCodec.decode(&mut buf).unwrap(), Some(second));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut buf = BytesMut::from(&b"{not json"[..]);
        buf.put_bytes(0, FRAME_BLOCK - 9);
        let good = vec![snapshot("T1", 1, 2, 3)];
        buf.extend_from_slice(&encode(&good));

        assert_eq!(StatsFrameCodec.decode(&mut buf).unwrap(), Some(good));
    }

    #[test]
    fn test_truncated_frame_at_eof_is_dropped() {
        let mut buf = BytesMut::from(&b"[{\"name\":"[..]);
        assert_eq!(StatsFrameCodec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}
