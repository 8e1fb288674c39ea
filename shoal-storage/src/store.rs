use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::chunks::{ChunkPool, ChunkRange};
use crate::disk::FileSet;
use crate::error::StoreError;
use crate::layout::Layout;
use crate::piece_map::PieceMap;
use crate::resume::{self, ResumeState, ALLOCATED, MARKER, PARTIAL, UNALLOCATED};
use crate::scan::{hash_slots, ScanProgress};
use crate::slots::{SlotState, SlotTable};
use crate::Result;

/// Connection a chunk arrived from; recorded per delivered range for blame
/// attribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub conn: u64,
    pub addr: IpAddr,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PieceEvent {
    Verified { piece: u32, finished: bool },
    Flunked { piece: u32, length: usize },
}

pub trait PieceEventHandler {
    fn piece_event(&self, event: &PieceEvent) -> Result<()>;
}

pub struct PieceEventNotifier {
    tx: flume::Sender<PieceEvent>,
}

impl PieceEventNotifier {
    pub fn new() -> (Self, flume::Receiver<PieceEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl PieceEventHandler for PieceEventNotifier {
    fn piece_event(&self, event: &PieceEvent) -> Result<()> {
        self.tx.send(event.clone())?;
        Ok(())
    }
}

#[derive(Default)]
struct HandlerChain {
    handlers: Vec<Box<dyn PieceEventHandler + Send + Sync>>,
}

impl HandlerChain {
    fn add(&mut self, handler: Box<dyn PieceEventHandler + Send + Sync>) {
        self.handlers.push(handler);
    }

    fn piece_event(&self, event: &PieceEvent) -> Result<()> {
        for handler in self.handlers.iter() {
            handler.piece_event(event)?;
        }
        Ok(())
    }
}

/// What became of a delivered chunk.
#[derive(Debug, PartialEq)]
pub enum ChunkOutcome {
    /// No matching outstanding range; nothing written.
    Stale,
    /// Written; the piece still has work outstanding.
    Accepted,
    /// Last range landed and the piece verified. `rewarded` lists each
    /// distinct contributing connection once; `blamed` are deferred suspects
    /// that did not contribute to the good copy.
    PieceComplete {
        finished: bool,
        rewarded: Vec<Origin>,
        blamed: Vec<IpAddr>,
    },
    /// Last range landed and the digest did not match. The whole piece is
    /// undone again. `blamed` is the sole contributing address, or repeat
    /// offenders across failed attempts.
    PieceFlunked { length: usize, blamed: Vec<IpAddr> },
}

/// Authoritative record of what is done, what is requestable, and where
/// bytes physically live.
pub struct PieceStore {
    layout: Layout,
    files: FileSet,
    chunk_size: usize,
    slots: SlotTable,
    have: PieceMap,
    /// Restored as complete without hashing; verified lazily on first read.
    unchecked: PieceMap,
    pools: Vec<ChunkPool>,
    active: Vec<Vec<ChunkRange>>,
    delivered: Vec<u64>,
    amount_inactive: u64,
    amount_left: u64,
    endgame: bool,
    history: HashMap<u32, HashMap<u32, Origin>>,
    suspects: HashMap<u32, HashSet<IpAddr>>,
    flunked: u64,
    handlers: HandlerChain,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("chunk_size", &self.chunk_size)
            .field("amount_inactive", &self.amount_inactive)
            .field("amount_left", &self.amount_left)
            .field("endgame", &self.endgame)
            .field("flunked", &self.flunked)
            .finish_non_exhaustive()
    }
}

impl PieceStore {
    pub async fn open(layout: Layout, chunk_size: usize, resume: Option<ResumeState>) -> Result<PieceStore> {
        Self::open_with_progress(layout, chunk_size, resume, None).await
    }

    /// Open the store, restoring trusted fast-resume state when given, or
    /// hashing every preallocated slot otherwise. `progress` observes the
    /// rescan.
    #[tracing::instrument(skip_all, err)]
    pub async fn open_with_progress(
        layout: Layout,
        chunk_size: usize,
        resume: Option<ResumeState>,
        progress: Option<watch::Sender<ScanProgress>>,
    ) -> Result<PieceStore> {
        anyhow::ensure!(chunk_size > 0, "chunk size must be non-zero");
        let files = FileSet::create(layout.root(), layout.files()).await?;
        let n = layout.n_pieces();
        let mut store = PieceStore {
            slots: SlotTable::new(n),
            have: PieceMap::new(),
            unchecked: PieceMap::new(),
            pools: vec![ChunkPool::Unsplit; n],
            active: vec![Vec::new(); n],
            delivered: vec![0; n],
            amount_inactive: layout.total_length(),
            amount_left: layout.total_length(),
            endgame: false,
            history: HashMap::new(),
            suspects: HashMap::new(),
            flunked: 0,
            handlers: HandlerChain::default(),
            chunk_size,
            layout,
            files,
        };
        let restored = match resume {
            Some(state) => store.restore(state).await?,
            None => false,
        };
        if !restored {
            store.rescan(progress).await?;
        }
        debug!(
            have = store.have.count_ones(),
            pieces = store.layout.n_pieces(),
            "store opened"
        );
        Ok(store)
    }

    pub fn subscribe(&mut self, handler: Box<dyn PieceEventHandler + Send + Sync>) {
        self.handlers.add(handler);
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index)
    }

    pub fn has_requests(&self, index: u32) -> bool {
        self.pools[index as usize].has_pending()
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    pub fn is_complete(&self) -> bool {
        self.have.count_ones() == self.layout.n_pieces()
    }

    /// Bytes not yet verified.
    pub fn amount_left(&self) -> u64 {
        self.amount_left
    }

    pub fn flunked_count(&self) -> u64 {
        self.flunked
    }

    pub fn active_bytes(&self, index: u32) -> u64 {
        self.active[index as usize]
            .iter()
            .map(|r| r.length as u64)
            .sum()
    }

    pub fn inactive_bytes(&self, index: u32) -> u64 {
        self.pools[index as usize].pending_bytes(self.layout.piece_length_at(index))
    }

    /// Bytes written and not since re-marked undone.
    pub fn done_bytes(&self, index: u32) -> u64 {
        self.delivered[index as usize]
    }

    /// Split on first demand and hand out the smallest pending range.
    /// Flips endgame the instant total undone bytes reaches zero.
    pub fn new_request(&mut self, index: u32) -> Option<ChunkRange> {
        if self.have.get(index) {
            return None;
        }
        let plen = self.layout.piece_length_at(index);
        let range = self.pools[index as usize].take_smallest(plen, self.chunk_size)?;
        self.active[index as usize].push(range);
        self.amount_inactive -= range.length as u64;
        self.maybe_endgame();
        Some(range)
    }

    /// Return an undelivered range to the pool (disconnect or choke).
    pub fn request_lost(&mut self, index: u32, range: ChunkRange) {
        let at = self.active[index as usize].iter().position(|r| *r == range);
        match at {
            Some(at) => {
                self.active[index as usize].swap_remove(at);
            }
            None => {
                trace!(index, ?range, "lost range was not active");
                return;
            }
        }
        self.pools[index as usize].push(range);
        self.amount_inactive += range.length as u64;
    }

    /// Accept one delivered chunk. Lazily binds a slot, writes the bytes,
    /// and verifies the piece when nothing remains outstanding for it.
    #[tracing::instrument(skip(self, data), fields(piece = index, offset), err)]
    pub async fn chunk_came_in(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        origin: Origin,
    ) -> Result<ChunkOutcome> {
        let range = ChunkRange {
            offset,
            length: data.len() as u32,
        };
        let at = self.active[index as usize].iter().position(|r| *r == range);
        let matched = match at {
            Some(at) => {
                self.active[index as usize].swap_remove(at);
                true
            }
            None => {
                // A disconnect may have returned the range to pending while
                // a duplicate was still on the wire.
                if self.pools[index as usize].remove(&range) {
                    self.amount_inactive -= range.length as u64;
                    self.maybe_endgame();
                    true
                } else {
                    false
                }
            }
        };
        if !matched {
            trace!("stale chunk");
            return Ok(ChunkOutcome::Stale);
        }

        let slot_offset = self.ensure_slot(index).await?;
        self.files.write_at(slot_offset + offset as u64, data).await?;
        self.delivered[index as usize] += range.length as u64;
        self.history.entry(index).or_default().insert(offset, origin);

        if self.pools[index as usize].has_pending() || !self.active[index as usize].is_empty() {
            return Ok(ChunkOutcome::Accepted);
        }

        let plen = self.layout.piece_length_at(index);
        let digest = self.digest_piece(index).await?;
        if digest == self.layout.piece(index).digest {
            self.have.set(index);
            self.pools[index as usize] = ChunkPool::Complete;
            self.amount_left -= plen as u64;

            let contributors = self.history.remove(&index).unwrap_or_default();
            let mut rewarded: Vec<Origin> = Vec::new();
            for origin in contributors.values() {
                if !rewarded.contains(origin) {
                    rewarded.push(*origin);
                }
            }
            let good_addrs: HashSet<IpAddr> = rewarded.iter().map(|o| o.addr).collect();
            let mut blamed: Vec<IpAddr> = match self.suspects.remove(&index) {
                Some(suspects) => suspects
                    .into_iter()
                    .filter(|a| !good_addrs.contains(a))
                    .collect(),
                None => vec![],
            };
            blamed.sort();

            let finished = self.is_complete();
            if finished {
                info!("download complete");
            }
            self.handlers
                .piece_event(&PieceEvent::Verified { piece: index, finished })?;
            Ok(ChunkOutcome::PieceComplete {
                finished,
                rewarded,
                blamed,
            })
        } else {
            self.flunked += 1;
            self.delivered[index as usize] = 0;
            self.pools[index as usize] =
                ChunkPool::Pending(ChunkPool::split(plen, self.chunk_size));
            self.amount_inactive += plen as u64;

            let contributors = self.history.remove(&index).unwrap_or_default();
            let addrs: HashSet<IpAddr> = contributors.values().map(|o| o.addr).collect();
            let mut blamed: Vec<IpAddr> = if addrs.len() == 1 {
                self.suspects.remove(&index);
                addrs.into_iter().collect()
            } else {
                let repeat: Vec<IpAddr> = match self.suspects.get(&index) {
                    Some(prior) => addrs.intersection(prior).copied().collect(),
                    None => vec![],
                };
                self.suspects.insert(index, addrs);
                repeat
            };
            blamed.sort();
            warn!(
                flunked = self.flunked,
                expect = hex::encode(self.layout.piece(index).digest),
                got = hex::encode(digest),
                "piece failed verification"
            );
            self.handlers
                .piece_event(&PieceEvent::Flunked { piece: index, length: plen })?;
            Ok(ChunkOutcome::PieceFlunked { length: plen, blamed })
        }
    }

    /// Serve an upload read. A piece restored without checking is verified
    /// here on first read; failure means the file set was tampered with.
    pub async fn read_piece(
        &mut self,
        index: u32,
        offset: u32,
        length: usize,
    ) -> Result<Option<Vec<u8>>> {
        if !self.have.get(index) {
            return Ok(None);
        }
        if self.unchecked.get(index) {
            let digest = self.digest_piece(index).await?;
            if digest != self.layout.piece(index).digest {
                return Err(StoreError::LateCorruption { piece: index }.into());
            }
            self.unchecked.clear(index);
            trace!(piece = index, "lazy verification passed");
        }
        let plen = self.layout.piece_length_at(index);
        anyhow::ensure!(offset as usize + length <= plen, "read beyond piece");
        let slot = self
            .slots
            .slot_of(index)
            .ok_or_else(|| anyhow::anyhow!("complete piece {} has no slot", index))?;
        let (slot_offset, _) = self.layout.slot_range(slot);
        let mut buf = vec![0u8; length];
        self.files.read_at(slot_offset + offset as u64, &mut buf).await?;
        Ok(Some(buf))
    }

    /// Snapshot the slot-occupancy array; slots holding an incomplete piece
    /// become the partial sentinel.
    pub fn fastresume(&self) -> ResumeState {
        ResumeState::snapshot(&self.slots, |piece| self.have.get(piece))
    }

    pub async fn write_fastresume(&self, path: &Path) -> Result<()> {
        self.fastresume().save(path).await
    }

    fn maybe_endgame(&mut self) {
        if !self.endgame && self.amount_inactive == 0 {
            info!("entering endgame");
            self.endgame = true;
        }
    }

    /// Physical payload offset of the piece's slot, binding one if needed.
    /// The preferred slot is the piece's own index; whatever holds it is
    /// moved to the lowest free slot first.
    async fn ensure_slot(&mut self, piece: u32) -> Result<u64> {
        if let Some(slot) = self.slots.slot_of(piece) {
            return Ok(self.layout.slot_range(slot).0);
        }
        let preferred = piece;
        let slot = match self.slots.state(preferred) {
            SlotState::Held(occupant) => {
                let dest = self
                    .slots
                    .lowest_free(|s| self.layout.fits_slot(occupant, s));
                match dest {
                    Some(dest) => {
                        self.relocate_piece(occupant, preferred, dest).await?;
                        preferred
                    }
                    None => self
                        .slots
                        .lowest_free(|s| self.layout.fits_slot(piece, s))
                        .ok_or_else(|| anyhow::anyhow!("no slot fits piece {}", piece))?,
                }
            }
            _ => preferred,
        };
        match self.slots.state(slot) {
            SlotState::Unallocated => {
                self.slots.claim(slot, piece);
                self.tile_undone(piece, slot).await?;
            }
            SlotState::Allocated => self.slots.claim(slot, piece),
            SlotState::Held(_) => unreachable!("chosen slot is free"),
        }
        debug!(piece, slot, "slot bound");
        Ok(self.layout.slot_range(slot).0)
    }

    /// Move a placed piece's bytes to a free slot. The move re-reads the
    /// bytes anyway, so a piece already counted have is verified here; a
    /// mismatch means out-of-band modification.
    async fn relocate_piece(&mut self, occupant: u32, from: u32, to: u32) -> Result<()> {
        let (from_offset, _) = self.layout.slot_range(from);
        let plen = self.layout.piece_length_at(occupant);
        let mut buf = vec![0u8; plen];
        self.files.read_at(from_offset, &mut buf).await?;
        if self.have.get(occupant) {
            let digest: [u8; 32] = Sha256::digest(&buf).into();
            if digest != self.layout.piece(occupant).digest {
                return Err(StoreError::LateCorruption { piece: occupant }.into());
            }
            self.unchecked.clear(occupant);
        }
        let (to_offset, _) = self.layout.slot_range(to);
        self.files.write_at(to_offset, &buf).await?;
        self.slots.relocate(occupant, to);
        debug!(occupant, from, to, "piece relocated");
        Ok(())
    }

    /// First touch of an unallocated slot: tile every range with the marker
    /// so a restart can tell written data from hole.
    async fn tile_undone(&mut self, piece: u32, slot: u32) -> Result<()> {
        let (slot_offset, _) = self.layout.slot_range(slot);
        let plen = self.layout.piece_length_at(piece);
        for range in ChunkPool::split(plen, self.chunk_size) {
            let tile = resume::marker_tile(piece, range.length as usize);
            self.files
                .write_at(slot_offset + range.offset as u64, &tile)
                .await?;
        }
        Ok(())
    }

    async fn digest_piece(&mut self, index: u32) -> Result<[u8; 32]> {
        let slot = self
            .slots
            .slot_of(index)
            .ok_or_else(|| anyhow::anyhow!("piece {} has no slot", index))?;
        let (offset, _) = self.layout.slot_range(slot);
        let plen = self.layout.piece_length_at(index);
        let mut buf = vec![0u8; plen];
        self.files.read_at(offset, &mut buf).await?;
        Ok(Sha256::digest(&buf).into())
    }

    /// Restore trusted fast-resume state. `Ok(false)` degrades to a rescan;
    /// `Err` is a structural contradiction with on-disk preallocation.
    async fn restore(&mut self, state: ResumeState) -> Result<bool> {
        let n = self.layout.n_pieces();
        if state.entries().len() != n {
            warn!(
                entries = state.entries().len(),
                pieces = n,
                "fast-resume length mismatch, will re-verify"
            );
            return Ok(false);
        }
        let mut seen = PieceMap::new();
        for entry in state.entries() {
            if *entry < PARTIAL {
                warn!(entry, "fast-resume entry invalid, will re-verify");
                return Ok(false);
            }
            if *entry >= 0 {
                let piece = *entry as u32;
                if piece as usize >= n || seen.get(piece) {
                    warn!(piece, "fast-resume piece entry invalid, will re-verify");
                    return Ok(false);
                }
                seen.set(piece);
            }
        }
        for (slot, entry) in state.entries().iter().enumerate() {
            let slot = slot as u32;
            let (offset, extent) = self.layout.slot_range(slot);
            match *entry {
                UNALLOCATED => {}
                ALLOCATED => {
                    self.require_preallocated(slot, offset, extent)?;
                    self.slots.mark_allocated(slot);
                }
                PARTIAL => {
                    self.require_preallocated(slot, offset, extent)?;
                    self.restore_partial(slot, offset, extent).await?;
                }
                piece => {
                    let piece = piece as u32;
                    self.require_preallocated(slot, offset, extent)?;
                    if !self.layout.fits_slot(piece, slot) {
                        return Err(StoreError::ResumeMismatch {
                            reason: format!("piece {} does not fit slot {}", piece, slot),
                        }
                        .into());
                    }
                    self.slots.claim(slot, piece);
                    self.have.set(piece);
                    self.unchecked.set(piece);
                    self.pools[piece as usize] = ChunkPool::Complete;
                    let plen = self.layout.piece_length_at(piece) as u64;
                    self.delivered[piece as usize] = plen;
                    self.amount_inactive -= plen;
                    self.amount_left -= plen;
                }
            }
        }
        Ok(true)
    }

    /// Recover a partial slot: marker-tiled ranges are still undone; the
    /// embedded index identifies the piece held.
    async fn restore_partial(&mut self, slot: u32, offset: u64, extent: usize) -> Result<()> {
        let n = self.layout.n_pieces();
        let mut buf = vec![0u8; self.chunk_size];
        let mut piece: Option<u32> = None;
        for range in ChunkPool::split(extent, self.chunk_size) {
            if (range.length as usize) < MARKER.len() + 4 {
                continue;
            }
            let data = &mut buf[..range.length as usize];
            self.files.read_at(offset + range.offset as u64, data).await?;
            if let Some(found) = resume::match_marker_tile(data) {
                if (found as usize) < n && self.layout.fits_slot(found, slot) {
                    piece = Some(found);
                    break;
                }
            }
        }
        let Some(piece) = piece else {
            warn!(slot, "partial slot has no marker, treating as allocated");
            self.slots.mark_allocated(slot);
            return Ok(());
        };
        if self.slots.slot_of(piece).is_some() || self.have.get(piece) {
            return Err(StoreError::ResumeMismatch {
                reason: format!("piece {} held by more than one slot", piece),
            }
            .into());
        }

        let plen = self.layout.piece_length_at(piece);
        let mut undone = Vec::new();
        let mut done_bytes = 0u64;
        for range in ChunkPool::split(plen, self.chunk_size) {
            let data = &mut buf[..range.length as usize];
            self.files.read_at(offset + range.offset as u64, data).await?;
            if data == resume::marker_tile(piece, range.length as usize).as_slice() {
                undone.push(range);
            } else {
                done_bytes += range.length as u64;
            }
        }
        debug!(slot, piece, undone = undone.len(), "partial slot restored");
        self.slots.claim(slot, piece);
        self.pools[piece as usize] = ChunkPool::Pending(undone);
        self.delivered[piece as usize] = done_bytes;
        self.amount_inactive -= done_bytes;
        Ok(())
    }

    fn require_preallocated(&self, slot: u32, offset: u64, extent: usize) -> Result<()> {
        if !self.files.preallocated(offset, extent) {
            return Err(StoreError::ResumeMismatch {
                reason: format!("slot {} claimed but not preallocated", slot),
            }
            .into());
        }
        Ok(())
    }

    /// Hash every preallocated slot and claim matches. Content may be found
    /// at a different index than expected and is relocated logically.
    async fn rescan(&mut self, progress: Option<watch::Sender<ScanProgress>>) -> Result<()> {
        let mut work = Vec::new();
        for slot in 0..self.layout.n_pieces() as u32 {
            let (offset, extent) = self.layout.slot_range(slot);
            if self.files.preallocated(offset, extent) {
                work.push((slot, offset, extent));
            }
        }
        let digests =
            hash_slots(self.layout.root(), self.layout.files(), work, progress).await?;

        let mut by_digest: HashMap<[u8; 32], Vec<u32>> = HashMap::new();
        for piece in 0..self.layout.n_pieces() as u32 {
            by_digest
                .entry(self.layout.piece(piece).digest)
                .or_default()
                .push(piece);
        }
        for (slot, digest) in digests {
            let extent = self.layout.slot_range(slot).1;
            let matched = by_digest.get(&digest).and_then(|cands| {
                cands
                    .iter()
                    .copied()
                    .filter(|p| {
                        self.slots.slot_of(*p).is_none()
                            && self.layout.piece_length_at(*p) == extent
                    })
                    .min_by_key(|p| (*p != slot, *p))
            });
            match matched {
                Some(piece) => {
                    if piece != slot {
                        debug!(piece, slot, "content discovered at relocated slot");
                    }
                    self.slots.claim(slot, piece);
                    self.have.set(piece);
                    self.pools[piece as usize] = ChunkPool::Complete;
                    let plen = self.layout.piece_length_at(piece) as u64;
                    self.delivered[piece as usize] = plen;
                    self.amount_inactive -= plen;
                    self.amount_left -= plen;
                }
                None => self.slots.mark_allocated(slot),
            }
        }
        Ok(())
    }
}
