use std::net::IpAddr;
use std::time::Instant;

use shoal_storage::{ChunkRange, PieceMap};

use crate::config::Config;
use crate::peer::PeerLink;
use crate::rate::RateMeter;

/// Per-connection request state: choke/interest flags, the in-flight
/// request list, measured throughput, and the peer's have-bitmap. All
/// transitions are driven by the coordinator so that one download's state
/// never sees interleaved mutation.
pub struct PeerScheduler {
    pub conn: u64,
    pub addr: IpAddr,
    pub link: Box<dyn PeerLink>,
    pub choked: bool,
    pub interested: bool,
    pub active: Vec<(u32, ChunkRange)>,
    pub have: PieceMap,
    pub rate: RateMeter,
    pub wasted: u64,
    pub chunks_delivered: u64,
    pub last_data_at: Instant,
}

impl PeerScheduler {
    pub fn new(conn: u64, link: Box<dyn PeerLink>, config: &Config) -> PeerScheduler {
        let addr = link.addr();
        PeerScheduler {
            conn,
            addr,
            link,
            choked: true,
            interested: false,
            active: Vec::new(),
            have: PieceMap::new(),
            rate: RateMeter::new(config.rate_window),
            wasted: 0,
            chunks_delivered: 0,
            last_data_at: Instant::now(),
        }
    }

    /// In-flight depth this connection has earned: two requests plus one
    /// per 5000 bytes/s of measured throughput, clamped to the ceiling.
    pub fn backlog(&mut self, config: &Config) -> usize {
        let earned = 2 + (self.rate.rate() / 5000.0) as usize;
        earned.min(config.max_backlog)
    }

    pub fn peer_has(&self, piece: u32) -> bool {
        self.have.get(piece)
    }

    /// Peer holds every piece of the download.
    pub fn peer_is_seed(&self, n_pieces: usize) -> bool {
        self.have.count_ones() >= n_pieces
    }

    pub fn has_active(&self, piece: u32, range: &ChunkRange) -> bool {
        self.active.iter().any(|(p, r)| *p == piece && r == range)
    }

    pub fn take_active(&mut self, piece: u32, range: &ChunkRange) -> bool {
        match self
            .active
            .iter()
            .position(|(p, r)| *p == piece && r == range)
        {
            Some(at) => {
                self.active.swap_remove(at);
                true
            }
            None => false,
        }
    }

    pub fn declare_interest(&mut self) {
        if !self.interested {
            self.interested = true;
            self.link.send_interested();
        }
    }

    pub fn withdraw_interest(&mut self) {
        if self.interested {
            self.interested = false;
            self.link.send_not_interested();
        }
    }

    pub fn request(&mut self, piece: u32, range: ChunkRange) {
        self.active.push((piece, range));
        self.link.send_request(piece, range.offset, range.length);
    }
}
