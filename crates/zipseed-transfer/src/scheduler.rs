//! Per-connection request scheduler
//!
//! State machine:
//!   Idle -> Requesting -> AwaitingBody -> (loop) -> Idle
//!   any  -> Disconnecting (terminal)
//!
//! Two queues drive it:
//!   - `desired`: pieces this connection has been asked to fetch
//!   - `in_flight`: issued range requests in FIFO order; the front is the
//!     piece whose body bytes are currently arriving
//!
//! A piece may sit in at most one of the two queues at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};
use zipseed_core::{PieceIndex, TransferPhase, ZipseedResult};

use crate::mapper::{PieceRange, RangeMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Requesting,
    AwaitingBody,
    Disconnecting,
}

/// External inputs that decide whether and how deep `pump` may request.
#[derive(Debug, Clone)]
pub struct TransferGate {
    pub phase: TransferPhase,
    pub upload_only: bool,
    pub desired_queue_size: usize,
    /// Requests allowed past the queue depth limit; each one used is consumed.
    pub time_critical: usize,
}

impl TransferGate {
    pub fn downloading(desired_queue_size: usize) -> Self {
        Self {
            phase: TransferPhase::Downloading,
            upload_only: false,
            desired_queue_size,
            time_critical: 0,
        }
    }

    pub fn allows_requests(&self) -> bool {
        self.phase.can_download() && !self.upload_only
    }
}

/// An issued range request waiting for its compressed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPieceRequest {
    pub piece: PieceIndex,
    pub compressed_length: u64,
    pub expected_plain_length: u64,
    /// Start of the piece in the remote blob
    pub start_offset: u64,
}

impl From<PieceRange> for PendingPieceRequest {
    fn from(r: PieceRange) -> Self {
        Self {
            piece: r.piece,
            compressed_length: r.compressed_length,
            expected_plain_length: r.expected_plain_length,
            start_offset: r.offset,
        }
    }
}

impl PendingPieceRequest {
    pub fn range(&self) -> PieceRange {
        PieceRange {
            piece: self.piece,
            offset: self.start_offset,
            compressed_length: self.compressed_length,
            expected_plain_length: self.expected_plain_length,
        }
    }
}

pub struct RequestScheduler {
    mapper: Arc<RangeMapper>,
    desired: VecDeque<PieceIndex>,
    in_flight: VecDeque<PendingPieceRequest>,
    /// Plaintext bytes requested but not yet delivered
    outstanding_bytes: u64,
    underflows: u64,
    state: SchedulerState,
}

impl RequestScheduler {
    pub fn new(mapper: Arc<RangeMapper>) -> Self {
        Self {
            mapper,
            desired: VecDeque::new(),
            in_flight: VecDeque::new(),
            outstanding_bytes: 0,
            underflows: 0,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state == SchedulerState::Disconnecting
    }

    /// True if `piece` is desired or in flight on this connection.
    pub fn is_pending(&self, piece: PieceIndex) -> bool {
        self.desired.contains(&piece) || self.in_flight.iter().any(|r| r.piece == piece)
    }

    /// Add a desire for `piece`. Duplicates are dropped and return false.
    pub fn enqueue(&mut self, piece: PieceIndex) -> bool {
        if self.is_disconnecting() {
            return false;
        }
        if self.is_pending(piece) {
            debug!(piece, "duplicate request desire dropped");
            return false;
        }
        self.desired.push_back(piece);
        true
    }

    /// Turn desires into range requests while the gate and depth allow.
    ///
    /// Returns the requests issued this call, in issue order. A mapping
    /// failure is returned to the caller; the failing desire is dropped.
    pub fn pump(&mut self, gate: &mut TransferGate) -> ZipseedResult<Vec<PendingPieceRequest>> {
        let mut issued = Vec::new();
        if self.is_disconnecting() || !gate.allows_requests() {
            return Ok(issued);
        }

        self.state = SchedulerState::Requesting;
        while let Some(&piece) = self.desired.front() {
            let within_depth = self.in_flight.len() < gate.desired_queue_size;
            if !within_depth && gate.time_critical == 0 {
                break;
            }
            self.desired.pop_front();

            let range = match self.mapper.map(piece) {
                Ok(r) => r,
                Err(e) => {
                    self.settle_state();
                    return Err(e);
                }
            };
            if !within_depth {
                gate.time_critical -= 1;
            }

            let request = PendingPieceRequest::from(range);
            self.outstanding_bytes += request.expected_plain_length;
            self.in_flight.push_back(request);
            debug!(
                piece,
                range = %range.header_value(),
                in_flight = self.in_flight.len(),
                "range request issued"
            );
            issued.push(request);
        }
        self.settle_state();
        Ok(issued)
    }

    /// The request whose body is currently arriving.
    pub fn front(&self) -> Option<&PendingPieceRequest> {
        self.in_flight.front()
    }

    /// Remove the front request once its body is complete.
    pub fn complete_front(&mut self) -> Option<PendingPieceRequest> {
        let done = self.in_flight.pop_front();
        if !self.is_disconnecting() {
            self.settle_state();
        }
        done
    }

    /// Account for `len` plaintext bytes handed downstream.
    pub fn on_block_delivered(&mut self, len: u64) {
        match self.outstanding_bytes.checked_sub(len) {
            Some(rest) => self.outstanding_bytes = rest,
            None => {
                self.underflows += 1;
                warn!(
                    outstanding = self.outstanding_bytes,
                    delivered = len,
                    "outstanding byte counter underflow, clamping to zero"
                );
                self.outstanding_bytes = 0;
            }
        }
    }

    /// Enter the terminal state and drop all queued work.
    ///
    /// Returns every piece that was desired or in flight, so the owner can
    /// hand them to another connection.
    pub fn disconnect(&mut self) -> Vec<PieceIndex> {
        self.state = SchedulerState::Disconnecting;
        let mut lost: Vec<PieceIndex> = self.in_flight.drain(..).map(|r| r.piece).collect();
        lost.extend(self.desired.drain(..));
        self.outstanding_bytes = 0;
        lost
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    /// Times the outstanding counter would have gone negative.
    pub fn underflow_count(&self) -> u64 {
        self.underflows
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn desired_len(&self) -> usize {
        self.desired.len()
    }

    fn settle_state(&mut self) {
        self.state = if self.in_flight.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::AwaitingBody
        };
    }
}
