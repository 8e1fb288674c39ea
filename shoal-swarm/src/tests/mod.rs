
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use shoal_storage::{FileSpec, Layout, PieceMap, PieceStore};

use crate::config::Config;
use crate::swarm::{ConnEvent, Swarm, SwarmEvent, SwarmEventNotifier};
use crate::tests::stub_peer::{PeerLog, StubPeer};
use crate::tests::stub_picker::StubPicker;

const PLEN: usize = 8192;
const CHUNK: usize = 4096;

fn piece_bytes(index: u32) -> Vec<u8> {
    vec![(index as u8).wrapping_add(1); PLEN]
}

fn layout_for(root: &Path, n: usize) -> Layout {
    let digests = (0..n)
        .map(|i| Sha256::digest(piece_bytes(i as u32)).into())
        .collect();
    Layout::new(
        root.to_path_buf(),
        vec![FileSpec {
            path: PathBuf::from("payload.bin"),
            length: (n * PLEN) as u64,
        }],
        PLEN,
        digests,
    )
    .expect("layout")
}

async fn swarm_for(root: &Path, n: usize) -> Swarm {
    let config = Config {
        chunk_size: CHUNK,
        ..Default::default()
    };
    let store = PieceStore::open(layout_for(root, n), config.chunk_size, None)
        .await
        .expect("store");
    Swarm::new(store, Box::new(StubPicker::new(n as u32)), config)
}

fn full_bitfield(n: usize) -> Vec<u8> {
    let mut map = PieceMap::new();
    for piece in 0..n as u32 {
        map.set(piece);
    }
    map.into()
}

async fn connect(swarm: &Swarm, conn: u64, host: u8) -> PeerLog {
    let (link, log) = StubPeer::new(host);
    swarm
        .handle(ConnEvent::Connected {
            conn,
            link: Box::new(link),
        })
        .await
        .expect("connected");
    log
}

fn parse(entries: Vec<String>) -> Vec<(u32, u32, u32)> {
    entries
        .iter()
        .map(|s| {
            let rest = s.split_once(' ').expect("verb").1;
            let (p, rest) = rest.split_once('+').expect("piece");
            let (o, l) = rest.split_once('x').expect("offset");
            (
                p.parse().expect("piece"),
                o.parse().expect("offset"),
                l.parse().expect("length"),
            )
        })
        .collect()
}

/// Requested and neither delivered nor cancelled, in (piece, offset) order.
fn outstanding(log: &PeerLog, delivered: &[(u32, u32, u32)]) -> Vec<(u32, u32, u32)> {
    let mut counts: HashMap<(u32, u32, u32), i64> = HashMap::new();
    for r in parse(log.requests()) {
        *counts.entry(r).or_insert(0) += 1;
    }
    for r in parse(log.cancels()) {
        *counts.entry(r).or_insert(0) -= 1;
    }
    for r in delivered {
        *counts.entry(*r).or_insert(0) -= 1;
    }
    let mut out: Vec<(u32, u32, u32)> = counts
        .into_iter()
        .filter(|(_, c)| *c > 0)
        .map(|(r, _)| r)
        .collect();
    out.sort();
    out
}

async fn deliver(swarm: &Swarm, conn: u64, req: (u32, u32, u32), good: bool) {
    let (piece, offset, length) = req;
    let data = if good {
        piece_bytes(piece)[offset as usize..(offset + length) as usize].to_vec()
    } else {
        vec![0xEEu8; length as usize]
    };
    swarm
        .handle(ConnEvent::Chunk {
            conn,
            piece,
            offset,
            data,
        })
        .await
        .expect("chunk");
}

#[tokio::test]
async fn unchoke_fills_pipeline_to_backlog() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;
    let log = connect(&swarm, 1, 1).await;

    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    // Choked: only interest can be declared.
    assert_eq!(log.sent(), vec!["interested".to_string()]);

    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");
    // Fresh connection earns a backlog of two; the committed piece is piece
    // zero and its ranges come smallest-offset first.
    assert_eq!(
        log.requests(),
        vec!["request 0+0x4096".to_string(), "request 0+4096x4096".to_string()]
    );
}

#[tokio::test]
async fn delivery_completes_piece_and_announces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;
    let (notifier, events) = SwarmEventNotifier::new();
    swarm.subscribe(Box::new(notifier)).await;

    let log = connect(&swarm, 1, 1).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");

    let mut delivered = vec![];
    for req in outstanding(&log, &delivered) {
        deliver(&swarm, 1, req, true).await;
        delivered.push(req);
    }
    assert!(!swarm.is_complete().await);
    let drained: Vec<SwarmEvent> = events.try_iter().collect();
    assert!(drained.contains(&SwarmEvent::PieceHave(0)), "{:?}", drained);
    // The pipeline refilled after delivery.
    assert!(!outstanding(&log, &delivered).is_empty());
}

#[tokio::test]
async fn choke_redistributes_in_the_same_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;

    // A drains piece 0 into its pipeline.
    let log_a = connect(&swarm, 1, 1).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");
    assert_eq!(outstanding(&log_a, &[]).len(), 2);

    // B holds pieces 0 and 1, finishes piece 1, and goes idle.
    let log_b = connect(&swarm, 2, 2).await;
    let mut b_map = PieceMap::new();
    b_map.set(0);
    b_map.set(1);
    swarm
        .handle(ConnEvent::Bitfield { conn: 2, pieces: b_map.into() })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 2 }).await.expect("unchoke");
    let mut b_delivered = vec![];
    for req in outstanding(&log_b, &b_delivered) {
        deliver(&swarm, 2, req, true).await;
        b_delivered.push(req);
    }
    assert!(log_b.contains("not_interested"));

    // C holds piece 0 but has no reason to be interested: piece 0 is fully
    // in flight on A.
    let log_c = connect(&swarm, 3, 3).await;
    swarm
        .handle(ConnEvent::Have { conn: 3, piece: 0 })
        .await
        .expect("have");
    assert!(!log_c.contains("interested"));

    // Choking A frees piece 0 in the same dispatch step: B picks the
    // ranges up immediately and C declares interest.
    swarm.handle(ConnEvent::Choke { conn: 1 }).await.expect("choke");
    assert_eq!(
        outstanding(&log_b, &b_delivered),
        vec![(0, 0, CHUNK as u32), (0, CHUNK as u32, CHUNK as u32)]
    );
    assert!(log_c.contains("interested"));
}

#[tokio::test]
async fn endgame_duplicates_and_cancels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 2).await;
    let (notifier, events) = SwarmEventNotifier::new();
    swarm.subscribe(Box::new(notifier)).await;

    let log_a = connect(&swarm, 1, 1).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(2) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");

    let log_b = connect(&swarm, 2, 2).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 2, pieces: full_bitfield(2) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 2 }).await.expect("unchoke");

    // A drew piece 0, B drew piece 1; every byte is now in flight.
    assert!(swarm.is_endgame().await);
    // B duplicated A's outstanding piece-0 ranges on top of its own work.
    assert_eq!(outstanding(&log_b, &[]).len(), 4);

    // A lands the first half of piece 0: the duplicate gets cancelled on B.
    deliver(&swarm, 1, (0, 0, CHUNK as u32), true).await;
    assert!(log_b.cancels().contains(&format!("cancel 0+0x{}", CHUNK)));

    // B lands the second half first; A's duplicate is cancelled, and the
    // late copy arriving on A anyway is discarded as wasted, not written.
    deliver(&swarm, 2, (0, CHUNK as u32, CHUNK as u32), true).await;
    assert!(log_a
        .cancels()
        .contains(&format!("cancel 0+{}x{}", CHUNK, CHUNK)));
    deliver(&swarm, 1, (0, CHUNK as u32, CHUNK as u32), true).await;
    assert_eq!(swarm.wasted(1).await, Some(CHUNK as u64));

    // A finishes piece 1 through its endgame duplicates.
    deliver(&swarm, 1, (1, 0, CHUNK as u32), true).await;
    deliver(&swarm, 1, (1, CHUNK as u32, CHUNK as u32), true).await;

    assert!(swarm.is_complete().await);
    // Both peers had everything; nothing left to exchange.
    assert!(log_a.closed());
    assert!(log_b.closed());
    let drained: Vec<SwarmEvent> = events.try_iter().collect();
    assert_eq!(
        drained,
        vec![
            SwarmEvent::PieceHave(0),
            SwarmEvent::PieceHave(1),
            SwarmEvent::Finished,
        ]
    );
}

#[tokio::test]
async fn corrupt_sender_is_banned_after_three_distinct_pieces() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;
    let (notifier, events) = SwarmEventNotifier::new();
    swarm.subscribe(Box::new(notifier)).await;

    let log = connect(&swarm, 1, 66).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");

    // Corrupt a piece, then make it good so the connection keeps flowing;
    // three distinct corrupted pieces cross the threshold.
    let mut delivered = vec![];
    let mut corrupted = std::collections::HashSet::new();
    while !log.closed() {
        let reqs = outstanding(&log, &delivered);
        assert!(!reqs.is_empty(), "stalled before ban");
        for req in reqs {
            if log.closed() {
                break;
            }
            let good = corrupted.contains(&req.0);
            if !good {
                corrupted.insert(req.0);
            }
            deliver(&swarm, 1, req, good).await;
            delivered.push(req);
        }
        if delivered.len() > 100 {
            panic!("ban never triggered");
        }
    }

    let drained: Vec<SwarmEvent> = events.try_iter().collect();
    let addr = std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 66));
    assert!(drained.contains(&SwarmEvent::Banned(addr)), "{:?}", drained);
    assert_eq!(swarm.last_data_at(1).await, None);

    // New connections from the banned address are refused outright.
    let (link, log2) = StubPeer::new(66);
    swarm
        .handle(ConnEvent::Connected { conn: 9, link: Box::new(link) })
        .await
        .expect("connected");
    assert!(log2.closed());
    assert_eq!(swarm.last_data_at(9).await, None);
}

#[tokio::test]
async fn silent_sibling_is_kicked_with_the_bad_sender() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;
    let (notifier, events) = SwarmEventNotifier::new();
    swarm.subscribe(Box::new(notifier)).await;

    // Two connections from the same address; the second never sends.
    let log_a = connect(&swarm, 1, 5).await;
    let log_b = connect(&swarm, 2, 5).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");

    let mut delivered = vec![];
    for req in outstanding(&log_a, &delivered) {
        deliver(&swarm, 1, req, false).await;
        delivered.push(req);
    }

    // The bad sender survives (below the ban threshold), the silent
    // sibling does not.
    assert!(!log_a.closed());
    assert!(log_b.closed());
    assert!(swarm.last_data_at(1).await.is_some());
    assert_eq!(swarm.last_data_at(2).await, None);
    let addr = std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5));
    let drained: Vec<SwarmEvent> = events.try_iter().collect();
    assert_eq!(drained, vec![SwarmEvent::Kicked(addr)]);
}

#[tokio::test]
async fn mutually_redundant_peer_is_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 2).await;

    // Finish the download through A.
    let log_a = connect(&swarm, 1, 1).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(2) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");
    let mut delivered = vec![];
    while !swarm.is_complete().await {
        for req in outstanding(&log_a, &delivered) {
            deliver(&swarm, 1, req, true).await;
            delivered.push(req);
        }
    }

    // A seed connecting now has nothing to exchange with us.
    let log_b = connect(&swarm, 2, 2).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 2, pieces: full_bitfield(2) })
        .await
        .expect("bitfield");
    assert!(log_b.closed());

    // A peer that still needs pieces stays connected.
    let log_c = connect(&swarm, 3, 3).await;
    let mut partial = PieceMap::new();
    partial.set(0);
    swarm
        .handle(ConnEvent::Bitfield { conn: 3, pieces: partial.into() })
        .await
        .expect("bitfield");
    assert!(!log_c.closed());
}

#[tokio::test]
async fn disconnect_returns_work_and_forgets_haves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let swarm = swarm_for(dir.path(), 4).await;

    let log_a = connect(&swarm, 1, 1).await;
    swarm
        .handle(ConnEvent::Bitfield { conn: 1, pieces: full_bitfield(4) })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 1 }).await.expect("unchoke");
    assert_eq!(outstanding(&log_a, &[]).len(), 2);

    let log_b = connect(&swarm, 2, 2).await;
    let mut b_map = PieceMap::new();
    b_map.set(0);
    swarm
        .handle(ConnEvent::Bitfield { conn: 2, pieces: b_map.into() })
        .await
        .expect("bitfield");
    swarm.handle(ConnEvent::Unchoke { conn: 2 }).await.expect("unchoke");

    // A vanishes mid-piece: its ranges land on B within the same step.
    swarm
        .handle(ConnEvent::Disconnected { conn: 1 })
        .await
        .expect("disconnect");
    assert_eq!(swarm.last_data_at(1).await, None);
    assert_eq!(
        outstanding(&log_b, &[]),
        vec![(0, 0, CHUNK as u32), (0, CHUNK as u32, CHUNK as u32)]
    );
}
