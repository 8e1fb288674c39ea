//! Piece placement, verification and fast-resume for the shoal transfer
//! engine. This crate is the authoritative record of what is done, what is
//! requestable, and where bytes physically live; scheduling lives in
//! `shoal_swarm`.

mod chunks;
mod disk;
mod error;
mod layout;
mod piece_map;
mod resume;
mod scan;
mod slots;
mod store;

pub use chunks::{ChunkPool, ChunkRange};
pub use disk::FileSet;
pub use error::{is_late_corruption, is_resume_mismatch, Error, Result, StoreError};
pub use layout::{FileSpec, Layout, PieceSpec};
pub use piece_map::PieceMap;
pub use resume::{marker_tile, match_marker_tile, ResumeState, ALLOCATED, MARKER, PARTIAL, UNALLOCATED};
pub use scan::{hash_slots, ScanProgress};
pub use slots::{SlotState, SlotTable};
pub use store::{ChunkOutcome, Origin, PieceEvent, PieceEventHandler, PieceEventNotifier, PieceStore};

/// Default sub-range size handed to peers, matching the common wire unit.
pub const DEFAULT_CHUNK_SIZE: usize = 16384;
