use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::{debug, info};

/// Trust bookkeeping for one address, across every connection it has made.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    good: u32,
    bad_pieces: HashMap<u32, u32>,
    credited: HashSet<u32>,
    live_conns: u32,
    last_conn: Option<u64>,
    peer_id: Vec<u8>,
    banned: bool,
}

impl PeerStats {
    pub fn good(&self) -> u32 {
        self.good
    }

    /// Distinct pieces this address corrupted.
    pub fn distinct_bad(&self) -> u32 {
        self.bad_pieces.len() as u32
    }

    pub fn live_conns(&self) -> u32 {
        self.live_conns
    }

    pub fn last_conn(&self) -> Option<u64> {
        self.last_conn
    }

    pub fn peer_id(&self) -> &[u8] {
        &self.peer_id
    }

    pub fn banned(&self) -> bool {
        self.banned
    }

    /// An absolute floor of three distinct bad pieces, and past that a
    /// ratio test that only bites once the address has history. Favors
    /// tolerance early, strict policing once history-rich; the exact
    /// integer formula is load-bearing.
    fn over_threshold(&self) -> bool {
        self.distinct_bad() >= 3 && self.distinct_bad() > self.good / 30
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BadVerdict {
    /// The address crossed the ban threshold with this report.
    pub banned: bool,
    /// The address had already sent bad data before this report.
    pub repeat: bool,
}

/// Per-address trust ledger. Never evicts: ban decisions depend on the
/// whole history of an address.
#[derive(Default)]
pub struct ReputationBook {
    stats: HashMap<IpAddr, PeerStats>,
}

impl ReputationBook {
    pub fn new() -> ReputationBook {
        ReputationBook::default()
    }

    pub fn stats(&self, addr: &IpAddr) -> Option<&PeerStats> {
        self.stats.get(addr)
    }

    pub fn is_banned(&self, addr: &IpAddr) -> bool {
        self.stats.get(addr).map(|s| s.banned).unwrap_or(false)
    }

    pub fn connected(&mut self, addr: IpAddr, conn: u64, peer_id: &[u8]) {
        let stats = self.stats.entry(addr).or_default();
        stats.live_conns += 1;
        stats.last_conn = Some(conn);
        stats.peer_id = peer_id.to_vec();
    }

    pub fn disconnected(&mut self, addr: &IpAddr) {
        if let Some(stats) = self.stats.get_mut(addr) {
            stats.live_conns = stats.live_conns.saturating_sub(1);
        }
    }

    /// Credit a verified piece, at most once per (address, piece) no matter
    /// how many sub-ranges the address contributed.
    pub fn good(&mut self, addr: IpAddr, piece: u32) -> bool {
        let stats = self.stats.entry(addr).or_default();
        if !stats.credited.insert(piece) {
            return false;
        }
        stats.good += 1;
        true
    }

    /// Attribute a corrupted piece. The returned verdict drives sibling
    /// kicks and the global ban.
    pub fn bad(&mut self, addr: IpAddr, piece: u32) -> BadVerdict {
        let stats = self.stats.entry(addr).or_default();
        let repeat = !stats.bad_pieces.is_empty();
        *stats.bad_pieces.entry(piece).or_insert(0) += 1;
        debug!(
            %addr,
            piece,
            distinct_bad = stats.distinct_bad(),
            good = stats.good,
            "bad data attributed"
        );
        if !stats.banned && stats.over_threshold() {
            stats.banned = true;
            info!(%addr, "address banned for corrupt data");
            return BadVerdict { banned: true, repeat };
        }
        BadVerdict { banned: false, repeat }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn addr(x: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, x))
    }

    #[test]
    fn good_credits_once_per_piece() {
        let mut book = ReputationBook::new();
        assert!(book.good(addr(1), 4));
        assert!(!book.good(addr(1), 4));
        assert!(book.good(addr(1), 5));
        assert_eq!(book.stats(&addr(1)).unwrap().good(), 2);
    }

    #[test]
    fn ban_needs_three_distinct_bad_pieces() {
        let mut book = ReputationBook::new();
        assert!(!book.bad(addr(1), 0).banned);
        // Same piece again: still one distinct bad piece.
        assert!(!book.bad(addr(1), 0).banned);
        assert!(!book.bad(addr(1), 1).banned);
        let verdict = book.bad(addr(1), 2);
        assert!(verdict.banned);
        assert!(verdict.repeat);
        assert!(book.is_banned(&addr(1)));
    }

    #[test]
    fn history_rich_address_tolerates_ratio() {
        let mut book = ReputationBook::new();
        // 120 good pieces: 120 / 30 = 4, so 3 distinct bad is not enough...
        for piece in 0..120 {
            book.good(addr(1), piece);
        }
        book.bad(addr(1), 0);
        book.bad(addr(1), 1);
        assert!(!book.bad(addr(1), 2).banned);
        book.bad(addr(1), 3);
        // ...but the fifth distinct bad piece (5 > 4) is.
        assert!(book.bad(addr(1), 4).banned);
    }

    #[test]
    fn sixty_good_three_bad_is_banned() {
        let mut book = ReputationBook::new();
        for piece in 0..60 {
            book.good(addr(1), piece);
        }
        book.bad(addr(1), 0);
        book.bad(addr(1), 1);
        // 60 / 30 = 2 and 3 > 2, with the floor of 3 met.
        assert!(book.bad(addr(1), 2).banned);
    }

    #[test]
    fn connection_counting() {
        let mut book = ReputationBook::new();
        book.connected(addr(1), 10, b"peer-a");
        book.connected(addr(1), 11, b"peer-a");
        assert_eq!(book.stats(&addr(1)).unwrap().live_conns(), 2);
        assert_eq!(book.stats(&addr(1)).unwrap().last_conn(), Some(11));
        book.disconnected(&addr(1));
        assert_eq!(book.stats(&addr(1)).unwrap().live_conns(), 1);
        // History survives disconnects.
        book.disconnected(&addr(1));
        book.disconnected(&addr(1));
        assert_eq!(book.stats(&addr(1)).unwrap().live_conns(), 0);
        assert_eq!(book.stats(&addr(1)).unwrap().peer_id(), b"peer-a");
    }

    #[test]
    fn repeat_flag_reports_prior_bad_data() {
        let mut book = ReputationBook::new();
        let first = book.bad(addr(1), 7);
        assert!(!first.repeat);
        let second = book.bad(addr(1), 8);
        assert!(second.repeat);
    }
}
