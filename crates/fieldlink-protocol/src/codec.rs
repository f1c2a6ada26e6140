//! Length-delimited JSON codec for the mesh relay link.
//!
//! Wire format: 4-byte big-endian length prefix + JSON frame payload.
//! Frames with an unknown `type` are skipped inside `decode` so a single
//! unrecognised frame never stalls the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frames::MeshFrame;
use crate::{ProtocolError, CURRENT_PARAMS};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing MeshFrame values over a byte stream.
pub struct MeshFrameCodec;

impl MeshFrameCodec {
    fn max_frame_bytes() -> usize {
        CURRENT_PARAMS.max_frame_bytes
    }
}

impl Decoder for MeshFrameCodec {
    type Item = MeshFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Need at least the length prefix
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            // Peek at the length
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

            if length > Self::max_frame_bytes() {
                return Err(ProtocolError::FrameTooLarge {
                    size: length,
                    max: Self::max_frame_bytes(),
                });
            }

            // Check if we have the full frame
            let total = LENGTH_PREFIX_SIZE + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_PREFIX_SIZE);
            let frame_bytes = src.split_to(length);

            let value: serde_json::Value = serde_json::from_slice(&frame_bytes)?;
            match MeshFrame::from_json(value)? {
                Some(frame) => return Ok(Some(frame)),
                None => {
                    // Unknown frame type: log, drop, keep decoding.
                    tracing::warn!(
                        bytes = length,
                        "mesh: unknown frame type, ignoring"
                    );
                    continue;
                }
            }
        }
    }
}

impl Encoder<MeshFrame> for MeshFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: MeshFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > Self::max_frame_bytes() {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: Self::max_frame_bytes(),
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
