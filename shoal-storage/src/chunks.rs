/// Sub-range of a piece: the unit requested over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub offset: u32,
    pub length: u32,
}

/// Undone-work pool for one piece.
///
/// `Unsplit` means the piece has never been demanded; `Pending` holds the
/// ranges not yet handed out (an empty list means everything is in flight);
/// `Complete` means the piece verified and nothing will be requested again.
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkPool {
    Unsplit,
    Pending(Vec<ChunkRange>),
    Complete,
}

impl ChunkPool {
    /// Ranges a piece splits into: `chunk_size` runs plus a short tail.
    pub fn split(piece_length: usize, chunk_size: usize) -> Vec<ChunkRange> {
        let mut ranges = Vec::with_capacity(piece_length.div_ceil(chunk_size));
        let mut offset = 0usize;
        while offset < piece_length {
            let length = chunk_size.min(piece_length - offset);
            ranges.push(ChunkRange {
                offset: offset as u32,
                length: length as u32,
            });
            offset += length;
        }
        ranges
    }

    /// Whether any range remains to hand out.
    pub fn has_pending(&self) -> bool {
        match self {
            ChunkPool::Unsplit => true,
            ChunkPool::Pending(ranges) => !ranges.is_empty(),
            ChunkPool::Complete => false,
        }
    }

    pub fn pending_bytes(&self, piece_length: usize) -> u64 {
        match self {
            ChunkPool::Unsplit => piece_length as u64,
            ChunkPool::Pending(ranges) => ranges.iter().map(|r| r.length as u64).sum(),
            ChunkPool::Complete => 0,
        }
    }

    /// Take the smallest pending range, splitting on first demand. Ordered
    /// by `(length, offset)` so short tail stragglers are serviced first and
    /// selection is deterministic.
    pub fn take_smallest(&mut self, piece_length: usize, chunk_size: usize) -> Option<ChunkRange> {
        if let ChunkPool::Unsplit = self {
            *self = ChunkPool::Pending(Self::split(piece_length, chunk_size));
        }
        match self {
            ChunkPool::Pending(ranges) => {
                let at = ranges
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| (r.length, r.offset))
                    .map(|(i, _)| i)?;
                Some(ranges.swap_remove(at))
            }
            _ => None,
        }
    }

    /// Return a lost range. Only meaningful for in-progress pieces.
    pub fn push(&mut self, range: ChunkRange) {
        match self {
            ChunkPool::Pending(ranges) => ranges.push(range),
            _ => *self = ChunkPool::Pending(vec![range]),
        }
    }

    /// Exact-match removal, for deliveries that race a disconnect in
    /// endgame: the range went back to pending but another connection still
    /// had it on the wire.
    pub fn remove(&mut self, range: &ChunkRange) -> bool {
        match self {
            ChunkPool::Pending(ranges) => match ranges.iter().position(|r| r == range) {
                Some(at) => {
                    ranges.swap_remove(at);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}
