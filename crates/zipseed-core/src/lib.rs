pub mod config;
pub mod error;
pub mod types;

pub use error::{CodecError, ZipseedError, ZipseedResult};
pub use types::{CodecKind, PieceIndex, TransferPhase};
