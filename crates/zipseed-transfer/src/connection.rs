//! Compressed web-seed connection
//!
//! `ZipSeedConnection` layers the request scheduler and the reassembly state
//! machine over an opaque peer capability. The peer issues the actual HTTP
//! requests, ingests blocks, and hears about progress and disconnects; the
//! connection decides what to request and turns compressed bytes back into
//! protocol blocks.
//!
//! Two ways to consume response bytes:
//!   - `on_bytes`: decompress inline within the call
//!   - `feed` + `complete_offloaded`: hand finished bodies to a worker pool
//!     and deliver the decoded blocks afterwards, in body order

use std::sync::Arc;

use tracing::{debug, info, warn};
use zipseed_chunks::PieceCodec;
use zipseed_core::{PieceIndex, ZipseedError, ZipseedResult};

use crate::mapper::RangeMapper;
use crate::reassembly::{decode_piece, PieceBody, ReassembledBlock, Reassembler};
use crate::scheduler::{PendingPieceRequest, RequestScheduler, TransferGate};

/// Connection capability the compressed layer is composed over.
pub trait WebSeedPeer {
    /// Issue `GET` with `Range: <request.range().header_value()>`.
    fn send_range_request(&mut self, request: &PendingPieceRequest);

    /// Downstream block ingestion.
    fn incoming_block(&mut self, block: ReassembledBlock);

    /// Plaintext bytes delivered, for stats and stall detection.
    fn on_progress(&mut self, _bytes: u64) {}

    fn on_disconnect(&mut self, _reason: &ZipseedError) {}
}

pub struct ZipSeedConnection<P: WebSeedPeer> {
    peer: P,
    scheduler: RequestScheduler,
    reassembler: Reassembler,
    codec: Arc<dyn PieceCodec>,
    gate: TransferGate,
    block_size: u32,
    /// Pieces dropped by a failure-triggered disconnect
    dropped: Vec<PieceIndex>,
}

impl<P: WebSeedPeer> ZipSeedConnection<P> {
    pub fn new(
        peer: P,
        mapper: Arc<RangeMapper>,
        codec: Arc<dyn PieceCodec>,
        gate: TransferGate,
        block_size: u32,
    ) -> Self {
        Self {
            peer,
            scheduler: RequestScheduler::new(mapper),
            reassembler: Reassembler::new(),
            codec,
            gate,
            block_size,
            dropped: Vec::new(),
        }
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }

    pub fn into_peer(self) -> P {
        self.peer
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn gate_mut(&mut self) -> &mut TransferGate {
        &mut self.gate
    }

    pub fn is_disconnected(&self) -> bool {
        self.scheduler.is_disconnecting()
    }

    /// Desire `piece`; false if it is already pending here.
    pub fn enqueue(&mut self, piece: PieceIndex) -> bool {
        self.scheduler.enqueue(piece)
    }

    /// Issue whatever requests the gate and depth allow. A mapping failure
    /// disconnects the connection.
    pub fn pump(&mut self) -> ZipseedResult<usize> {
        match self.scheduler.pump(&mut self.gate) {
            Ok(issued) => {
                for request in &issued {
                    self.peer.send_range_request(request);
                }
                Ok(issued.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Consume response bytes, decompressing and delivering inline.
    pub fn on_bytes(&mut self, data: &[u8]) -> ZipseedResult<()> {
        let mut bodies = self.feed(data)?.into_iter();
        while let Some(body) = bodies.next() {
            let result = decode_piece(
                self.codec.as_ref(),
                &body.request,
                &body.body,
                self.block_size,
            );
            if let Err(e) = self.complete_offloaded(&body.request, result.map_err(ZipseedError::from)) {
                // Bodies after the failed one already left the in-flight queue.
                self.dropped.extend(bodies.map(|b| b.request.piece));
                return Err(e);
            }
        }
        self.pump().map(|_| ())
    }

    /// Accumulate response bytes and return every body completed by them,
    /// in request order. Decompression is left to the caller.
    pub fn feed(&mut self, mut data: &[u8]) -> ZipseedResult<Vec<PieceBody>> {
        if self.is_disconnected() {
            return Err(ZipseedError::Disconnected(
                "bytes received after disconnect".into(),
            ));
        }

        let mut bodies = Vec::new();
        while !data.is_empty() {
            let Some(front) = self.scheduler.front().copied() else {
                warn!(len = data.len(), "bytes received with no request in flight, discarding");
                break;
            };
            let taken = self.reassembler.accumulate(&front, data);
            data = &data[taken..];

            if self.reassembler.is_complete(&front) {
                let body = self.reassembler.take_body();
                self.scheduler.complete_front();
                debug!(
                    piece = front.piece,
                    compressed = front.compressed_length,
                    "piece body complete"
                );
                bodies.push(PieceBody {
                    request: front,
                    body,
                });
            }
        }
        Ok(bodies)
    }

    /// Deliver the decoded blocks of `request`, or tear the connection down
    /// on a codec error. Nothing is delivered once disconnected.
    pub fn complete_offloaded(
        &mut self,
        request: &PendingPieceRequest,
        decoded: ZipseedResult<Vec<ReassembledBlock>>,
    ) -> ZipseedResult<()> {
        if self.is_disconnected() {
            return Err(ZipseedError::Disconnected(format!(
                "piece {} decoded after disconnect",
                request.piece
            )));
        }

        let blocks = match decoded {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!(piece = request.piece, error = %e, "piece decode failed");
                self.dropped.push(request.piece);
                return Err(self.fail(e));
            }
        };

        self.reassembler.begin_slicing();
        for block in blocks {
            let len = block.payload.len() as u64;
            self.peer.incoming_block(block);
            self.scheduler.on_block_delivered(len);
            self.peer.on_progress(len);
        }
        self.reassembler.finish_slicing();
        Ok(())
    }

    /// Drop all pending work and notify the peer. Returns the pieces that
    /// were desired or in flight.
    pub fn disconnect(&mut self, reason: ZipseedError) -> Vec<PieceIndex> {
        if self.is_disconnected() {
            return Vec::new();
        }
        let lost = self.scheduler.disconnect();
        self.reassembler.reset();
        info!(reason = %reason, dropped = lost.len(), "web seed connection disconnected");
        self.peer.on_disconnect(&reason);
        lost
    }

    /// Pieces that were pending when an error tore the connection down.
    pub fn take_dropped(&mut self) -> Vec<PieceIndex> {
        std::mem::take(&mut self.dropped)
    }

    fn fail(&mut self, e: ZipseedError) -> ZipseedError {
        let reason = ZipseedError::Disconnected(e.to_string());
        let lost = self.disconnect(reason);
        self.dropped.extend(lost);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::ReassemblyState;
    use crate::scheduler::SchedulerState;
    use proptest::prelude::*;
    use zipseed_chunks::{codec_for, encode, MemoryPieceReader, PieceSizeIndex};
    use zipseed_core::{CodecKind, TransferPhase};

    #[derive(Default)]
    struct RecordingPeer {
        requests: Vec<PendingPieceRequest>,
        blocks: Vec<ReassembledBlock>,
        progress: u64,
        disconnects: Vec<String>,
    }

    impl WebSeedPeer for RecordingPeer {
        fn send_range_request(&mut self, request: &PendingPieceRequest) {
            self.requests.push(*request);
        }
        fn incoming_block(&mut self, block: ReassembledBlock) {
            self.blocks.push(block);
        }
        fn on_progress(&mut self, bytes: u64) {
            self.progress += bytes;
        }
        fn on_disconnect(&mut self, reason: &ZipseedError) {
            self.disconnects.push(reason.to_string());
        }
    }

    struct Fixture {
        plain: Vec<u8>,
        blob: Vec<u8>,
        mapper: Arc<RangeMapper>,
        codec: Arc<dyn PieceCodec>,
    }

    fn fixture(len: usize, piece_length: usize) -> Fixture {
        let plain: Vec<u8> = (0..len).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect();
        let codec = codec_for(CodecKind::Zlib, 6);
        let mut blob = Vec::new();
        let mut reader = MemoryPieceReader::new(&plain, piece_length);
        let encoded = encode(&mut reader, &codec, &mut blob, None).unwrap();
        let mapper = Arc::new(RangeMapper::new(
            Arc::new(encoded.index),
            piece_length as u64,
            len as u64,
        ));
        Fixture {
            plain,
            blob,
            mapper,
            codec,
        }
    }

    fn connection(f: &Fixture, depth: usize, block_size: u32) -> ZipSeedConnection<RecordingPeer> {
        ZipSeedConnection::new(
            RecordingPeer::default(),
            f.mapper.clone(),
            f.codec.clone(),
            TransferGate::downloading(depth),
            block_size,
        )
    }

    fn body_of(f: &Fixture, r: &PendingPieceRequest) -> Vec<u8> {
        let range = r.range().as_range();
        f.blob[range.start as usize..range.end as usize].to_vec()
    }

    fn assemble(blocks: &[ReassembledBlock], piece_length: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for b in blocks {
            let at = b.piece as usize * piece_length + b.offset as usize;
            if out.len() < at + b.payload.len() {
                out.resize(at + b.payload.len(), 0);
            }
            out[at..at + b.payload.len()].copy_from_slice(&b.payload);
        }
        out
    }

    #[test]
    fn full_transfer_round_trips_and_settles_accounting() {
        let f = fixture(16384 * 5 + 1234, 16384);
        let mut conn = connection(&f, 2, 4096);
        for p in 0..6 {
            conn.enqueue(p);
        }
        conn.pump().unwrap();

        let mut served = 0;
        while served < conn.peer().requests.len() {
            let req = conn.peer().requests[served];
            served += 1;
            conn.on_bytes(&body_of(&f, &req)).unwrap();
        }

        assert_eq!(served, 6);
        assert_eq!(assemble(&conn.peer().blocks, 16384), f.plain);
        assert_eq!(conn.scheduler().outstanding_bytes(), 0);
        assert_eq!(conn.scheduler().underflow_count(), 0);
        assert_eq!(conn.scheduler().state(), SchedulerState::Idle);
        assert_eq!(conn.reassembler().state(), ReassemblyState::WaitingForRequest);
        assert_eq!(conn.peer().progress, f.plain.len() as u64);
    }

    #[test]
    fn blocks_within_piece_are_ordered() {
        let f = fixture(16384 * 2, 16384);
        let mut conn = connection(&f, 4, 8192);
        conn.enqueue(1);
        conn.pump().unwrap();
        let req = conn.peer().requests[0];
        let last = req.start_offset + req.compressed_length - 1;
        assert_eq!(
            req.range().header_value(),
            format!("bytes={}-{last}", req.start_offset)
        );
        conn.on_bytes(&body_of(&f, &req)).unwrap();

        let offsets: Vec<u64> = conn.peer().blocks.iter().map(|b| b.offset).collect();
        assert_eq!(offsets, vec![0, 8192]);
    }

    #[test]
    fn one_response_spanning_two_pieces() {
        let f = fixture(16384 * 3, 16384);
        let mut conn = connection(&f, 4, 16384);
        conn.enqueue(0);
        conn.enqueue(1);
        conn.pump().unwrap();

        // One buffer holding both bodies back to back
        let mut data = body_of(&f, &conn.peer().requests[0]);
        data.extend(body_of(&f, &conn.peer().requests[1]));
        conn.on_bytes(&data).unwrap();

        assert_eq!(conn.peer().blocks.len(), 2);
        assert_eq!(assemble(&conn.peer().blocks, 16384), &f.plain[..32768]);
    }

    #[test]
    fn corrupt_body_disconnects_without_blocks() {
        let f = fixture(16384 * 2, 16384);
        let mut conn = connection(&f, 4, 8192);
        conn.enqueue(0);
        conn.enqueue(1);
        conn.pump().unwrap();

        let req = conn.peer().requests[0];
        let garbage = vec![0xA5u8; req.compressed_length as usize];
        let err = conn.on_bytes(&garbage).unwrap_err();

        assert!(matches!(err, ZipseedError::Codec(_)));
        assert!(conn.peer().blocks.is_empty());
        assert!(conn.is_disconnected());
        assert_eq!(conn.peer().disconnects.len(), 1);
        assert_eq!(conn.take_dropped(), vec![0, 1]);
        assert!(conn.on_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn response_split_inside_second_body_keeps_leftover() {
        let f = fixture(16384 * 2, 16384);
        let mut conn = connection(&f, 4, 8192);
        conn.enqueue(0);
        conn.enqueue(1);
        conn.pump().unwrap();

        let mut data = body_of(&f, &conn.peer().requests[0]);
        let first_len = data.len();
        data.extend(body_of(&f, &conn.peer().requests[1]));

        // first call ends one byte into the second body
        conn.on_bytes(&data[..first_len + 1]).unwrap();
        assert_eq!(conn.peer().blocks.len(), 2);
        assert_eq!(conn.reassembler().state(), ReassemblyState::AccumulatingBody);
        assert_eq!(conn.reassembler().buffered(), 1);

        conn.on_bytes(&data[first_len + 1..]).unwrap();
        assert_eq!(conn.peer().blocks.len(), 4);
        assert_eq!(assemble(&conn.peer().blocks, 16384), f.plain);
        assert_eq!(conn.reassembler().buffered(), 0);
        assert_eq!(conn.scheduler().outstanding_bytes(), 0);
        assert_eq!(conn.scheduler().in_flight_len(), 0);
    }

    #[test]
    fn offloaded_delivery_keeps_next_body_bytes() {
        let f = fixture(16384 * 2, 16384);
        let mut conn = connection(&f, 4, 16384);
        conn.enqueue(0);
        conn.enqueue(1);
        conn.pump().unwrap();

        let mut data = body_of(&f, &conn.peer().requests[0]);
        let first_len = data.len();
        data.extend(body_of(&f, &conn.peer().requests[1]));
        let cut = first_len + 10;

        let bodies = conn.feed(&data[..cut]).unwrap();
        assert_eq!(bodies.len(), 1);
        let decoded = decode_piece(f.codec.as_ref(), &bodies[0].request, &bodies[0].body, 16384)
            .map_err(ZipseedError::from);
        conn.complete_offloaded(&bodies[0].request, decoded).unwrap();
        assert_eq!(conn.reassembler().buffered(), 10);

        let bodies = conn.feed(&data[cut..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].request.piece, 1);
        let decoded = decode_piece(f.codec.as_ref(), &bodies[0].request, &bodies[0].body, 16384)
            .map_err(ZipseedError::from);
        conn.complete_offloaded(&bodies[0].request, decoded).unwrap();
        assert_eq!(assemble(&conn.peer().blocks, 16384), f.plain);
        assert_eq!(conn.reassembler().state(), ReassemblyState::WaitingForRequest);
    }

    #[test]
    fn failed_body_reports_later_bodies_from_same_buffer() {
        let f = fixture(16384 * 3, 16384);
        let mut conn = connection(&f, 4, 16384);
        for p in 0..3 {
            conn.enqueue(p);
        }
        conn.pump().unwrap();

        let first = conn.peer().requests[0];
        let mut data = vec![0xA5u8; first.compressed_length as usize];
        data.extend(body_of(&f, &conn.peer().requests[1]));
        assert!(conn.on_bytes(&data).is_err());

        let mut dropped = conn.take_dropped();
        dropped.sort_unstable();
        assert_eq!(dropped, vec![0, 1, 2]);
        assert!(conn.peer().blocks.is_empty());
    }

    #[test]
    fn mismatched_plain_length_is_codec_error() {
        // Advertise 16384 plaintext bytes for a body that expands to 16000
        let codec = codec_for(CodecKind::Zlib, 6);
        let body = codec.compress(&[9u8; 16000]).unwrap();
        let index = PieceSizeIndex::from_sizes([body.len() as u64]);
        let mapper = Arc::new(RangeMapper::new(Arc::new(index), 16384, 16384));
        let mut conn = ZipSeedConnection::new(
            RecordingPeer::default(),
            mapper,
            codec,
            TransferGate::downloading(1),
            8192,
        );
        conn.enqueue(0);
        conn.pump().unwrap();
        let err = conn.on_bytes(&body).unwrap_err();
        assert!(matches!(
            err,
            ZipseedError::Codec(zipseed_core::CodecError::LengthMismatch { .. })
        ));
        assert!(conn.peer().blocks.is_empty());
    }

    #[test]
    fn disconnect_mid_body_discards_partial_state() {
        let f = fixture(16384 * 2, 16384);
        let mut conn = connection(&f, 4, 8192);
        conn.enqueue(0);
        conn.enqueue(1);
        conn.pump().unwrap();
        let body = body_of(&f, &conn.peer().requests[0]);
        conn.on_bytes(&body[..body.len() / 2]).unwrap();
        assert_eq!(conn.reassembler().state(), ReassemblyState::AccumulatingBody);

        let lost = conn.disconnect(ZipseedError::Disconnected("peer closed".into()));
        assert_eq!(lost, vec![0, 1]);
        assert_eq!(conn.reassembler().buffered(), 0);
        assert!(conn.peer().blocks.is_empty());
        assert_eq!(conn.scheduler().outstanding_bytes(), 0);
    }

    #[test]
    fn offloaded_result_after_disconnect_is_dropped() {
        let f = fixture(16384, 16384);
        let mut conn = connection(&f, 1, 8192);
        conn.enqueue(0);
        conn.pump().unwrap();
        let req = conn.peer().requests[0];
        let bodies = conn.feed(&body_of(&f, &req)).unwrap();
        assert_eq!(bodies.len(), 1);

        conn.disconnect(ZipseedError::Disconnected("timeout".into()));
        let decoded = decode_piece(f.codec.as_ref(), &bodies[0].request, &bodies[0].body, 8192)
            .map_err(ZipseedError::from);
        assert!(conn.complete_offloaded(&req, decoded).is_err());
        assert!(conn.peer().blocks.is_empty());
    }

    #[test]
    fn stray_bytes_are_discarded() {
        let f = fixture(16384, 16384);
        let mut conn = connection(&f, 1, 8192);
        assert!(conn.feed(&[1, 2, 3]).unwrap().is_empty());
        assert_eq!(conn.reassembler().buffered(), 0);
    }

    #[test]
    fn gate_change_resumes_requests() {
        let f = fixture(16384, 16384);
        let mut conn = connection(&f, 1, 8192);
        conn.gate_mut().phase = TransferPhase::CheckingResumeData;
        conn.enqueue(0);
        assert_eq!(conn.pump().unwrap(), 0);
        conn.gate_mut().phase = TransferPhase::Downloading;
        assert_eq!(conn.pump().unwrap(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn fragment_size_does_not_change_output(frag in 1usize..=4096) {
            let f = fixture(16384 * 3 + 77, 16384);

            let mut whole = connection(&f, 8, 4096);
            let mut split = connection(&f, 8, 4096);
            for p in 0..4 {
                whole.enqueue(p);
                split.enqueue(p);
            }
            whole.pump().unwrap();
            split.pump().unwrap();

            let all: Vec<u8> = whole.peer().requests.iter().flat_map(|r| body_of(&f, r)).collect();
            whole.on_bytes(&all).unwrap();
            for chunk in all.chunks(frag) {
                split.on_bytes(chunk).unwrap();
            }

            prop_assert_eq!(&whole.peer().blocks, &split.peer().blocks);
            prop_assert_eq!(split.scheduler().outstanding_bytes(), 0);
        }
    }
}
