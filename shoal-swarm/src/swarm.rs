use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use shoal_storage::{
    ChunkOutcome, ChunkRange, Origin, PieceEventHandler, PieceMap, PieceStore,
};
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{CancelError, Result};
use crate::peer::PeerLink;
use crate::picker::PiecePicker;
use crate::reputation::ReputationBook;
use crate::scheduler::PeerScheduler;

/// Connection events, processed strictly one at a time.
pub enum ConnEvent {
    Connected { conn: u64, link: Box<dyn PeerLink> },
    Choke { conn: u64 },
    Unchoke { conn: u64 },
    Have { conn: u64, piece: u32 },
    Bitfield { conn: u64, pieces: Vec<u8> },
    Chunk { conn: u64, piece: u32, offset: u32, data: Vec<u8> },
    Disconnected { conn: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SwarmEvent {
    /// A piece verified; announce it to the swarm.
    PieceHave(u32),
    /// The whole download verified.
    Finished,
    /// A connection was proactively closed.
    Kicked(IpAddr),
    /// An address crossed the ban threshold; all its connections are gone
    /// and new ones will be refused.
    Banned(IpAddr),
}

pub trait SwarmEventHandler {
    fn swarm_event(&self, event: &SwarmEvent) -> Result<()>;
}

pub struct SwarmEventNotifier {
    tx: flume::Sender<SwarmEvent>,
}

impl SwarmEventNotifier {
    pub fn new() -> (Self, flume::Receiver<SwarmEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl SwarmEventHandler for SwarmEventNotifier {
    fn swarm_event(&self, event: &SwarmEvent) -> Result<()> {
        self.tx.send(event.clone())?;
        Ok(())
    }
}

#[derive(Default)]
struct HandlerChain {
    handlers: Vec<Box<dyn SwarmEventHandler + Send + Sync>>,
}

impl HandlerChain {
    fn add(&mut self, handler: Box<dyn SwarmEventHandler + Send + Sync>) {
        self.handlers.push(handler);
    }

    fn swarm_event(&self, event: &SwarmEvent) -> Result<()> {
        for handler in self.handlers.iter() {
            handler.swarm_event(event)?;
        }
        Ok(())
    }
}

struct Inner {
    config: Config,
    store: PieceStore,
    picker: Box<dyn PiecePicker + Send>,
    reputation: ReputationBook,
    conns: HashMap<u64, PeerScheduler>,
    handlers: HandlerChain,
}

/// One download's swarm: the piece store, the picker, per-address
/// reputation and every live connection's scheduler, all behind a single
/// lock so no two mutations ever interleave.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<Mutex<Inner>>,
}

impl Swarm {
    pub fn new(store: PieceStore, picker: Box<dyn PiecePicker + Send>, config: Config) -> Swarm {
        debug_assert_eq!(store.chunk_size(), config.chunk_size);
        Swarm {
            inner: Arc::new(Mutex::new(Inner {
                config,
                store,
                picker,
                reputation: ReputationBook::new(),
                conns: HashMap::new(),
                handlers: HandlerChain::default(),
            })),
        }
    }

    pub async fn subscribe(&self, handler: Box<dyn SwarmEventHandler + Send + Sync>) {
        let mut inner = self.inner.lock().await;
        inner.handlers.add(handler);
    }

    pub async fn subscribe_piece_events(
        &self,
        handler: Box<dyn PieceEventHandler + Send + Sync>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.store.subscribe(handler);
    }

    /// Dispatch one connection event.
    pub async fn handle(&self, event: ConnEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match event {
            ConnEvent::Connected { conn, link } => {
                inner.on_connected(conn, link);
                Ok(())
            }
            ConnEvent::Choke { conn } => {
                inner.on_choke(conn);
                Ok(())
            }
            ConnEvent::Unchoke { conn } => {
                inner.on_unchoke(conn);
                Ok(())
            }
            ConnEvent::Have { conn, piece } => {
                inner.on_have(conn, piece);
                Ok(())
            }
            ConnEvent::Bitfield { conn, pieces } => {
                inner.on_bitfield(conn, pieces);
                Ok(())
            }
            ConnEvent::Chunk { conn, piece, offset, data } => {
                inner.on_chunk(conn, piece, offset, data).await
            }
            ConnEvent::Disconnected { conn } => {
                inner.on_disconnected(conn);
                Ok(())
            }
        }
    }

    /// Pump events until cancelled or the sender goes away.
    #[tracing::instrument(skip_all, err)]
    pub async fn run(
        &self,
        cancel: CancellationToken,
        events: flume::Receiver<ConnEvent>,
    ) -> Result<()> {
        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CancelError.into());
                }
                res = events.recv_async() => {
                    match res {
                        Ok(event) => self.handle(event).await?,
                        Err(_) => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn is_endgame(&self) -> bool {
        self.inner.lock().await.store.is_endgame()
    }

    pub async fn is_complete(&self) -> bool {
        self.inner.lock().await.store.is_complete()
    }

    pub async fn amount_left(&self) -> u64 {
        self.inner.lock().await.store.amount_left()
    }

    pub async fn flunked_count(&self) -> u64 {
        self.inner.lock().await.store.flunked_count()
    }

    /// When the connection last delivered payload; the surrounding
    /// application compares this against the snub timeout.
    pub async fn last_data_at(&self, conn: u64) -> Option<Instant> {
        self.inner
            .lock()
            .await
            .conns
            .get(&conn)
            .map(|s| s.last_data_at)
    }

    pub async fn wasted(&self, conn: u64) -> Option<u64> {
        self.inner.lock().await.conns.get(&conn).map(|s| s.wasted)
    }

    /// Serve an upload read.
    pub async fn read_piece(
        &self,
        index: u32,
        offset: u32,
        length: usize,
    ) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.store.read_piece(index, offset, length).await
    }

    pub async fn write_fastresume(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock().await;
        inner.store.write_fastresume(path).await
    }
}

impl Inner {
    fn emit(&self, event: SwarmEvent) {
        if let Err(err) = self.handlers.swarm_event(&event) {
            warn!(?err, "swarm event handler");
        }
    }

    fn on_connected(&mut self, conn: u64, mut link: Box<dyn PeerLink>) {
        let addr = link.addr();
        if self.reputation.is_banned(&addr) {
            info!(%addr, "refusing connection from banned address");
            link.close();
            return;
        }
        let peer_id = link.peer_id().to_vec();
        self.reputation.connected(addr, conn, &peer_id);
        self.conns
            .insert(conn, PeerScheduler::new(conn, link, &self.config));
        debug!(conn, %addr, "connection registered");
    }

    fn on_choke(&mut self, conn: u64) {
        let Some(sch) = self.conns.get_mut(&conn) else { return };
        sch.choked = true;
        if self.store.is_endgame() {
            // Abandoning duplicated work hurts more than it helps here.
            return;
        }
        let freed: Vec<(u32, ChunkRange)> = sch.active.drain(..).collect();
        for (piece, range) in &freed {
            self.store.request_lost(*piece, *range);
        }
        let mut lost: Vec<u32> = freed.iter().map(|(p, _)| *p).collect();
        lost.sort();
        lost.dedup();
        if lost.is_empty() {
            return;
        }
        trace!(conn, ?lost, "choked, redistributing freed pieces");
        self.wake_interest(&lost);
        self.redistribute(&lost, Some(conn));
    }

    fn on_unchoke(&mut self, conn: u64) {
        let interested = {
            let Some(sch) = self.conns.get_mut(&conn) else { return };
            sch.choked = false;
            sch.interested
        };
        if interested {
            self.request_more(conn, None);
        }
    }

    fn on_have(&mut self, conn: u64, piece: u32) {
        let n = self.store.layout().n_pieces();
        {
            let Some(sch) = self.conns.get_mut(&conn) else { return };
            sch.have.set(piece);
        }
        self.picker.got_have(piece);
        if self.store.is_complete() {
            let redundant = self
                .conns
                .get(&conn)
                .map(|s| s.peer_is_seed(n))
                .unwrap_or(false);
            if redundant {
                // Neither side has anything the other wants.
                self.drop_conn(conn, "mutually redundant");
            }
            return;
        }
        if self.store.has_piece(piece) {
            return;
        }
        if self.store.has_requests(piece) || self.store.is_endgame() {
            let choked = self.conns.get(&conn).map(|s| s.choked).unwrap_or(true);
            if !choked {
                self.request_more(conn, Some(&[piece]));
            } else if let Some(sch) = self.conns.get_mut(&conn) {
                sch.declare_interest();
            }
        }
    }

    fn on_bitfield(&mut self, conn: u64, pieces: Vec<u8>) {
        let n = self.store.layout().n_pieces();
        let announced: Vec<u32> = {
            let Some(sch) = self.conns.get_mut(&conn) else { return };
            let mut map = PieceMap::from(pieces);
            let extra: Vec<u32> = map.iter().filter(|p| (*p as usize) >= n).collect();
            for p in extra {
                map.clear(p);
            }
            sch.have = map;
            sch.have.iter().collect()
        };
        for piece in &announced {
            self.picker.got_have(*piece);
        }
        if self.store.is_complete() {
            let redundant = self
                .conns
                .get(&conn)
                .map(|s| s.peer_is_seed(n))
                .unwrap_or(false);
            if redundant {
                self.drop_conn(conn, "mutually redundant");
            }
            return;
        }
        let wanted = announced
            .iter()
            .any(|p| !self.store.has_piece(*p) && (self.store.has_requests(*p) || self.store.is_endgame()));
        if wanted {
            let choked = self.conns.get(&conn).map(|s| s.choked).unwrap_or(true);
            if !choked {
                self.request_more(conn, None);
            } else if let Some(sch) = self.conns.get_mut(&conn) {
                sch.declare_interest();
            }
        }
    }

    async fn on_chunk(&mut self, conn: u64, piece: u32, offset: u32, data: Vec<u8>) -> Result<()> {
        let n = self.store.layout().n_pieces();
        let range = ChunkRange {
            offset,
            length: data.len() as u32,
        };
        let origin = {
            let Some(sch) = self.conns.get_mut(&conn) else {
                return Ok(());
            };
            sch.last_data_at = Instant::now();
            sch.rate.update(data.len() as u64);
            if !sch.take_active(piece, &range) {
                // Legitimate after a cancel race.
                sch.wasted += data.len() as u64;
                trace!(conn, piece, offset, "chunk matched no outstanding request");
                return Ok(());
            }
            sch.chunks_delivered += 1;
            Origin { conn, addr: sch.addr }
        };

        let outcome = self.store.chunk_came_in(piece, offset, &data, origin).await?;

        if matches!(outcome, ChunkOutcome::Stale) {
            if let Some(sch) = self.conns.get_mut(&conn) {
                sch.wasted += data.len() as u64;
            }
        } else if self.store.is_endgame() {
            // This range is settled; cancel it on everyone else.
            for (id, other) in self.conns.iter_mut() {
                if *id == conn {
                    continue;
                }
                if other.take_active(piece, &range) {
                    other.link.send_cancel(piece, range.offset, range.length);
                }
            }
        }

        match outcome {
            ChunkOutcome::Stale | ChunkOutcome::Accepted => {}
            ChunkOutcome::PieceFlunked { blamed, .. } => {
                for addr in blamed {
                    self.report_bad(addr, piece);
                }
                // Spread the re-queued piece across other unchoked peers in
                // this same step.
                self.redistribute(&[piece], Some(conn));
            }
            ChunkOutcome::PieceComplete { finished, rewarded, blamed } => {
                for origin in rewarded {
                    self.reputation.good(origin.addr, piece);
                }
                for addr in blamed {
                    self.report_bad(addr, piece);
                }
                self.picker.complete(piece);
                self.emit(SwarmEvent::PieceHave(piece));
                if finished {
                    self.emit(SwarmEvent::Finished);
                    // Nothing left to exchange with complete peers.
                    let seeds: Vec<u64> = self
                        .conns
                        .iter()
                        .filter(|(_, s)| s.peer_is_seed(n))
                        .map(|(id, _)| *id)
                        .collect();
                    for id in seeds {
                        self.drop_conn(id, "download complete");
                    }
                }
            }
        }

        let unchoked = self
            .conns
            .get(&conn)
            .map(|s| !s.choked)
            .unwrap_or(false);
        if unchoked {
            self.request_more(conn, None);
        }
        Ok(())
    }

    fn on_disconnected(&mut self, conn: u64) {
        self.drop_conn(conn, "disconnected");
    }

    /// Remove a connection, returning its in-flight work to the pool and
    /// re-placing it on other peers within this same step.
    fn drop_conn(&mut self, conn: u64, reason: &str) {
        let Some(mut sch) = self.conns.remove(&conn) else { return };
        debug!(conn, addr = %sch.addr, reason, "closing connection");
        sch.link.close();
        self.reputation.disconnected(&sch.addr);
        for piece in sch.have.iter() {
            self.picker.lost_have(piece);
        }
        let freed: Vec<(u32, ChunkRange)> = sch.active.drain(..).collect();
        for (piece, range) in &freed {
            self.store.request_lost(*piece, *range);
        }
        let mut lost: Vec<u32> = freed.iter().map(|(p, _)| *p).collect();
        lost.sort();
        lost.dedup();
        if !lost.is_empty() {
            self.wake_interest(&lost);
            self.redistribute(&lost, None);
        }
    }

    /// Choked-but-uninterested peers holding freed work should ask for it.
    fn wake_interest(&mut self, lost: &[u32]) {
        for sch in self.conns.values_mut() {
            if sch.choked && !sch.interested && lost.iter().any(|p| sch.peer_has(*p)) {
                sch.declare_interest();
            }
        }
    }

    /// Re-place freed pieces across unchoked connections, in shuffled order
    /// so no connection systematically wins.
    fn redistribute(&mut self, lost: &[u32], exclude: Option<u64>) {
        let mut ids: Vec<u64> = self
            .conns
            .iter()
            .filter(|(id, s)| Some(**id) != exclude && !s.choked)
            .map(|(id, _)| *id)
            .collect();
        ids.shuffle(&mut rand::thread_rng());
        for id in ids {
            self.request_more(id, Some(lost));
        }
    }

    fn request_more(&mut self, conn: u64, candidates: Option<&[u32]>) {
        self.fill_requests(conn, candidates);
        if self.store.is_endgame() {
            self.endgame_fill(conn);
        }
    }

    /// Keep the pipeline at the earned backlog. Once committed to a piece,
    /// its ranges are drawn past the nominal backlog (up to twice) so the
    /// picker is not re-polled per chunk.
    fn fill_requests(&mut self, conn: u64, candidates: Option<&[u32]>) {
        let Inner { config, store, picker, conns, .. } = self;
        let Some(sch) = conns.get_mut(&conn) else { return };
        if sch.choked {
            return;
        }
        let backlog = sch.backlog(config);
        let cap = (backlog * 2).max(1);
        let mut starved = false;
        while sch.active.len() < backlog && !starved {
            let have = &sch.have;
            let piece = match candidates {
                Some(cands) => {
                    let found = cands.iter().copied().find(|p| {
                        have.get(*p) && !store.has_piece(*p) && store.has_requests(*p)
                    });
                    if let Some(p) = found {
                        picker.requested(p, true);
                    }
                    found
                }
                None => {
                    let want =
                        |p: u32| have.get(p) && !store.has_piece(p) && store.has_requests(p);
                    match picker.next(&want, false) {
                        Some(p) => {
                            picker.requested(p, false);
                            Some(p)
                        }
                        None => None,
                    }
                }
            };
            match piece {
                Some(piece) => {
                    sch.declare_interest();
                    while sch.active.len() < cap {
                        match store.new_request(piece) {
                            Some(range) => sch.request(piece, range),
                            None => break,
                        }
                    }
                    if sch.active.len() >= cap {
                        break;
                    }
                }
                None => starved = true,
            }
        }
        if candidates.is_none()
            && starved
            && sch.active.is_empty()
            && (!store.is_endgame() || store.is_complete())
        {
            sch.withdraw_interest();
        }
    }

    /// In endgame every outstanding range on other connections is fair
    /// game: request the duplicates this peer can serve.
    fn endgame_fill(&mut self, conn: u64) {
        let dups: Vec<(u32, ChunkRange)> = {
            let Some(sch) = self.conns.get(&conn) else { return };
            if sch.choked || self.store.is_complete() {
                return;
            }
            let mut dups = Vec::new();
            for (id, other) in self.conns.iter() {
                if *id == conn {
                    continue;
                }
                for (piece, range) in &other.active {
                    if !sch.peer_has(*piece)
                        || sch.has_active(*piece, range)
                        || dups.contains(&(*piece, *range))
                    {
                        continue;
                    }
                    dups.push((*piece, *range));
                }
            }
            dups
        };
        if dups.is_empty() {
            return;
        }
        let Some(sch) = self.conns.get_mut(&conn) else { return };
        trace!(conn, dups = dups.len(), "requesting endgame duplicates");
        sch.declare_interest();
        for (piece, range) in dups {
            sch.request(piece, range);
        }
    }

    /// Apply blame: ban the address past the threshold, kick sibling
    /// connections that never contributed, and deprioritize the piece.
    fn report_bad(&mut self, addr: IpAddr, piece: u32) {
        let verdict = self.reputation.bad(addr, piece);
        if verdict.banned {
            let ids: Vec<u64> = self
                .conns
                .iter()
                .filter(|(_, s)| s.addr == addr)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.drop_conn(id, "banned");
            }
            self.emit(SwarmEvent::Banned(addr));
            return;
        }
        // One bad actor taints the address, not just the connection.
        let siblings: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, s)| s.addr == addr && s.chunks_delivered == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in siblings {
            self.drop_conn(id, "sibling of bad sender");
            self.emit(SwarmEvent::Kicked(addr));
        }
        if self.config.retaliate_on_bad_data {
            self.picker.bump(piece);
        }
    }
}
