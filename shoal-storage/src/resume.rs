use std::path::Path;

use anyhow::Context;
use tokio::fs;
use tracing::warn;

use crate::slots::{SlotState, SlotTable};
use crate::Result;

/// Slot claimed on disk, no completed piece.
pub const ALLOCATED: i32 = -1;
/// Slot free.
pub const UNALLOCATED: i32 = -2;
/// Slot held an in-progress piece at save time; undone ranges carry the
/// marker tile.
pub const PARTIAL: i32 = -3;

/// Text prefix of the partial-piece marker tile.
pub const MARKER: &[u8] = b"SHOAL-PART";

/// Snapshot of the slot-occupancy array: one big-endian `i32` per slot,
/// `>= 0` meaning the piece index held there.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeState(Vec<i32>);

impl ResumeState {
    pub fn from_entries(entries: Vec<i32>) -> ResumeState {
        ResumeState(entries)
    }

    pub fn entries(&self) -> &[i32] {
        &self.0
    }

    /// Snapshot a slot table; slots holding a piece not in `complete` are
    /// written as the partial sentinel.
    pub fn snapshot(slots: &SlotTable, complete: impl Fn(u32) -> bool) -> ResumeState {
        ResumeState(
            slots
                .states()
                .map(|(_, state)| match state {
                    SlotState::Unallocated => UNALLOCATED,
                    SlotState::Allocated => ALLOCATED,
                    SlotState::Held(piece) if complete(piece) => piece as i32,
                    SlotState::Held(_) => PARTIAL,
                })
                .collect(),
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for entry in &self.0 {
            out.extend_from_slice(&entry.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ResumeState> {
        anyhow::ensure!(bytes.len() % 4 == 0, "truncated fast-resume array");
        let entries: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        for entry in &entries {
            anyhow::ensure!(*entry >= PARTIAL, "bad fast-resume entry {}", entry);
        }
        Ok(ResumeState(entries))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes())
            .await
            .with_context(|| format!("write fast-resume {:?}", path))
    }

    /// Load a fast-resume file. Any I/O or decode failure degrades to
    /// `None` with a warning: the caller re-verifies from scratch.
    pub async fn load(path: &Path) -> Option<ResumeState> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(?path, %err, "fast-resume unreadable, will re-verify");
                return None;
            }
        };
        match Self::from_bytes(&bytes) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(?path, %err, "fast-resume corrupt, will re-verify");
                None
            }
        }
    }
}

/// The tile written over an undone sub-range on a slot's first touch:
/// marker text + big-endian piece index, repeated and truncated to the
/// range length. Recognizing the tile at chunk-aligned offsets after a
/// restart recovers both the held piece and the undone set.
pub fn marker_tile(piece: u32, length: usize) -> Vec<u8> {
    let mut unit = Vec::with_capacity(MARKER.len() + 4);
    unit.extend_from_slice(MARKER);
    unit.extend_from_slice(&piece.to_be_bytes());
    unit.iter().cycle().take(length).copied().collect()
}

/// Extract the piece index if `data` is exactly a marker tile. Needs at
/// least one whole marker unit to identify the index.
pub fn match_marker_tile(data: &[u8]) -> Option<u32> {
    if data.len() < MARKER.len() + 4 || !data.starts_with(MARKER) {
        return None;
    }
    let at = MARKER.len();
    let piece = u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    if data == marker_tile(piece, data.len()).as_slice() {
        Some(piece)
    } else {
        None
    }
}
