//! Decompression and reassembly state machine
//!
//! States, entered once per pending request:
//!   WaitingForRequest -> AccumulatingBody -> Decompressing -> Slicing -> WaitingForRequest
//!
//! Bytes are accumulated for the front in-flight request only, never past its
//! compressed length. Whatever is left of an incoming buffer belongs to the
//! next request in FIFO order. A finished body is decompressed in one call and
//! cut into fixed-size blocks; a codec error yields no blocks at all.
//!
//! When bodies are decoded off the connection, the next body may already be
//! accumulating while the previous one is still being delivered. The decode
//! states are only entered while nothing is buffered.

use bytes::Bytes;
use zipseed_chunks::PieceCodec;
use zipseed_core::{CodecError, PieceIndex};

use crate::scheduler::PendingPieceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    WaitingForRequest,
    AccumulatingBody,
    Decompressing,
    Slicing,
}

/// One block handed to the downstream block sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledBlock {
    pub piece: PieceIndex,
    /// Offset of this block within its piece
    pub offset: u64,
    pub payload: Bytes,
}

/// A complete compressed body, ready for decompression.
#[derive(Debug, Clone)]
pub struct PieceBody {
    pub request: PendingPieceRequest,
    pub body: Vec<u8>,
}

/// Accumulator for the body of the front in-flight request.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    state: ReassemblyState,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ReassemblyState::WaitingForRequest,
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Bytes accumulated so far for the current request.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take as much of `data` as `front` still needs; returns the count taken.
    pub fn accumulate(&mut self, front: &PendingPieceRequest, data: &[u8]) -> usize {
        if self.state != ReassemblyState::AccumulatingBody {
            self.buf.reserve(front.compressed_length as usize);
            self.state = ReassemblyState::AccumulatingBody;
        }
        let remaining = (front.compressed_length as usize).saturating_sub(self.buf.len());
        let take = remaining.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    pub fn is_complete(&self, front: &PendingPieceRequest) -> bool {
        self.state == ReassemblyState::AccumulatingBody
            && self.buf.len() as u64 == front.compressed_length
    }

    /// Hand out the finished body and move to `Decompressing`.
    pub fn take_body(&mut self) -> Vec<u8> {
        self.state = ReassemblyState::Decompressing;
        std::mem::take(&mut self.buf)
    }

    /// Enter `Slicing` for a decoded body. Bytes of the next body that are
    /// already buffered keep the accumulator where it is.
    pub fn begin_slicing(&mut self) {
        if self.state != ReassemblyState::AccumulatingBody {
            self.state = ReassemblyState::Slicing;
        }
    }

    /// Delivery of a decoded body is over; the buffer is left alone.
    pub fn finish_slicing(&mut self) {
        if self.state != ReassemblyState::AccumulatingBody {
            self.state = ReassemblyState::WaitingForRequest;
        }
    }

    /// Drop everything buffered, after a codec error or a disconnect.
    pub fn reset(&mut self) {
        self.buf = Vec::new();
        self.state = ReassemblyState::WaitingForRequest;
    }
}

/// Decompress one body and cut the plaintext into blocks.
pub fn decode_piece(
    codec: &dyn PieceCodec,
    request: &PendingPieceRequest,
    body: &[u8],
    block_size: u32,
) -> Result<Vec<ReassembledBlock>, CodecError> {
    let plain = codec.decompress(body, request.expected_plain_length as usize)?;
    Ok(slice_blocks(request.piece, Bytes::from(plain), block_size))
}

/// Split `plain` into `block_size` blocks in offset order; only the last may
/// be shorter. Blocks share the plaintext buffer.
pub fn slice_blocks(piece: PieceIndex, plain: Bytes, block_size: u32) -> Vec<ReassembledBlock> {
    let block_size = block_size.max(1) as usize;
    let mut blocks = Vec::with_capacity(plain.len().div_ceil(block_size));
    let mut offset = 0usize;
    while offset < plain.len() {
        let end = (offset + block_size).min(plain.len());
        blocks.push(ReassembledBlock {
            piece,
            offset: offset as u64,
            payload: plain.slice(offset..end),
        });
        offset = end;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use zipseed_chunks::codec_for;
    use zipseed_core::CodecKind;

    fn request(piece: PieceIndex, compressed: u64, plain: u64) -> PendingPieceRequest {
        PendingPieceRequest {
            piece,
            compressed_length: compressed,
            expected_plain_length: plain,
            start_offset: 0,
        }
    }

    #[test]
    fn accumulate_stops_at_compressed_length() {
        let req = request(0, 10, 100);
        let mut r = Reassembler::new();
        assert_eq!(r.accumulate(&req, &[1u8; 4]), 4);
        assert!(!r.is_complete(&req));
        assert_eq!(r.accumulate(&req, &[2u8; 20]), 6);
        assert!(r.is_complete(&req));
        assert_eq!(r.buffered(), 10);

        let body = r.take_body();
        assert_eq!(body.len(), 10);
        assert_eq!(r.state(), ReassemblyState::Decompressing);
        r.reset();
        assert_eq!(r.state(), ReassemblyState::WaitingForRequest);
    }

    #[test]
    fn next_body_survives_delivery_of_previous() {
        let first = request(0, 4, 100);
        let second = request(1, 6, 100);
        let mut r = Reassembler::new();
        assert_eq!(r.accumulate(&first, &[1u8; 7]), 4);
        assert!(r.is_complete(&first));
        let body = r.take_body();
        assert_eq!(body, vec![1u8; 4]);

        // leftover of the same buffer starts the second body
        assert_eq!(r.accumulate(&second, &[2u8; 3]), 3);
        r.begin_slicing();
        r.finish_slicing();
        assert_eq!(r.state(), ReassemblyState::AccumulatingBody);
        assert_eq!(r.buffered(), 3);

        assert_eq!(r.accumulate(&second, &[3u8; 3]), 3);
        assert!(r.is_complete(&second));
        assert_eq!(r.take_body(), vec![2, 2, 2, 3, 3, 3]);
        r.begin_slicing();
        assert_eq!(r.state(), ReassemblyState::Slicing);
        r.finish_slicing();
        assert_eq!(r.state(), ReassemblyState::WaitingForRequest);
    }

    #[test]
    fn decode_into_two_blocks() {
        let plain: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let codec = codec_for(CodecKind::Zlib, 6);
        let body = codec.compress(&plain).unwrap();
        let req = request(1, body.len() as u64, 16384);

        let blocks = decode_piece(codec.as_ref(), &req, &body, 8192).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 8192);
        assert!(blocks.iter().all(|b| b.piece == 1 && b.payload.len() == 8192));
        assert_eq!(&blocks[1].payload[..], &plain[8192..]);
    }

    #[test]
    fn length_mismatch_yields_no_blocks() {
        let codec = codec_for(CodecKind::Zlib, 6);
        let body = codec.compress(&[3u8; 1000]).unwrap();
        let req = request(0, body.len() as u64, 1024);
        let err = decode_piece(codec.as_ref(), &req, &body, 512).unwrap_err();
        assert!(matches!(
            err,
            CodecError::LengthMismatch { expected: 1024, actual: 1000 }
        ));
    }

    #[test]
    fn short_last_block() {
        let blocks = slice_blocks(3, Bytes::from(vec![0u8; 20000]), 16384);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].offset, 16384);
        assert_eq!(blocks[1].payload.len(), 20000 - 16384);
    }

    proptest! {
        #[test]
        fn slicing_law(size in 1usize..=70_000, shift in 9u32..=15) {
            let block = 1u32 << shift;
            let blocks = slice_blocks(0, Bytes::from(vec![0u8; size]), block);
            let b = block as usize;
            prop_assert_eq!(blocks.len(), size.div_ceil(b));
            for (i, blk) in blocks.iter().enumerate() {
                prop_assert_eq!(blk.offset as usize, i * b);
                if i + 1 < blocks.len() {
                    prop_assert_eq!(blk.payload.len(), b);
                }
            }
            let last = blocks.last().map(|b| b.payload.len()).unwrap_or(0);
            let expected_last = if size % b == 0 { b } else { size % b };
            prop_assert_eq!(last, expected_last);
        }
    }
}
