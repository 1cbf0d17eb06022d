//! zipseed-transfer: compressed web-seed transfer side
//!
//! Leaf-first:
//!   - `mapper`: piece index -> HTTP byte range of the compressed blob
//!   - `scheduler`: per-connection dedup, queue depth, request issue
//!   - `reassembly`: accumulate body bytes, decompress, slice into blocks
//!   - `connection`: scheduler + reassembler composed over a peer capability
//!   - `pool`: bounded off-executor decompression
//!   - `sink`: verify and write delivered pieces
//!   - `session`: concurrent multi-seed fetch over OpenDAL

pub mod connection;
pub mod mapper;
pub mod pool;
pub mod reassembly;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use connection::{WebSeedPeer, ZipSeedConnection};
pub use mapper::{PieceRange, RangeMapper};
pub use pool::DecompressPool;
pub use reassembly::{
    decode_piece, slice_blocks, PieceBody, ReassembledBlock, ReassemblyState, Reassembler,
};
pub use scheduler::{PendingPieceRequest, RequestScheduler, SchedulerState, TransferGate};
pub use session::{FetchReport, FetchSession, Seed, SessionProgressFn};
pub use sink::{PieceOutcome, PieceStore};
