use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bencode::Value;

use crate::{
    config::Config,
    events::{EventBus, EventBusConfig},
    magnet::MagnetLink,
    metainfo::{MetaInfo, TorrentData},
    peer::{PeerEndpoint, PeerSource},
    ports::{
        CheckpointManager, PeerManager, PeerManagerSlot, PieceManager, TorrentCheckpoint,
    },
    tracker::Announcer,
    ID,
};
use super::{Collaborators, TorrentSession, TorrentStatus};

struct StubPieces {
    total: u32,
    verified: AtomicU32,
    downloading: AtomicBool,
    start_calls: AtomicU32,
    metadata_seen: AtomicBool,
}

impl StubPieces {
    fn new(total: u32, downloading: bool) -> Arc<Self> {
        Arc::new(Self {
            total,
            verified: AtomicU32::new(0),
            downloading: AtomicBool::new(downloading),
            start_calls: AtomicU32::new(0),
            metadata_seen: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl PieceManager for StubPieces {
    fn num_pieces(&self) -> u32 { self.total }
    fn piece_length(&self) -> u32 { 16_384 }
    fn verified_pieces(&self) -> u32 { self.verified.load(Ordering::SeqCst) }
    fn is_downloading(&self) -> bool { self.downloading.load(Ordering::SeqCst) }

    async fn start_download(&self) {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_metadata_available(&self, _metadata: &MetaInfo) {
        self.metadata_seen.store(true, Ordering::SeqCst);
    }

    async fn get_checkpoint_state(
        &self,
        name: &str,
        info_hash: ID,
        output_dir: &std::path::Path,
    ) -> TorrentCheckpoint {
        TorrentCheckpoint {
            info_hash,
            torrent_name: name.to_string(),
            total_pieces: self.total,
            output_dir: output_dir.to_path_buf(),
            progress: Vec::new(),
        }
    }
}

struct StubCheckpoints {
    fail: bool,
}

#[async_trait::async_trait]
impl CheckpointManager for StubCheckpoints {
    async fn save_checkpoint(&self, _checkpoint: TorrentCheckpoint) -> std::io::Result<()> {
        if self.fail {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space"))
        } else {
            Ok(())
        }
    }
}

struct StubPeers {
    connected: Mutex<Vec<PeerEndpoint>>,
    metadata: Option<Vec<u8>>,
}

impl StubPeers {
    fn new(metadata: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            connected: Mutex::new(Vec::new()),
            metadata,
        })
    }

    fn connected_count(&self) -> usize {
        self.connected.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PeerManager for StubPeers {
    async fn connect_to_peers(&self, peers: Vec<PeerEndpoint>) {
        self.connected.lock().unwrap().extend(peers);
    }

    fn active_peers(&self) -> Vec<SocketAddr> {
        self.connected.lock().unwrap().iter().map(|p| p.addr).collect()
    }

    fn download_rate(&self) -> f64 { 0.0 }

    async fn fetch_metadata(
        &self,
        _peers: &[PeerEndpoint],
        _timeout: Duration,
    ) -> Option<Vec<u8>> {
        self.metadata.clone()
    }
}

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    // Keep session tests off the network and fast.
    config.tracker.strict_private_mode = true;
    config.network.status_tick_interval = Duration::from_millis(20);
    config.network.announce_interval = Duration::from_millis(100);
    Arc::new(config)
}

// Minimal single-file torrent, announce-less so the fan-out has nothing
// to reach for.
fn test_metainfo() -> MetaInfo {
    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::ByteString(b"fixture".to_vec()));
    info.insert(b"piece length".to_vec(), Value::Integer(16_384));
    info.insert(b"pieces".to_vec(), Value::ByteString(vec![0xcd; 80]));
    info.insert(b"length".to_vec(), Value::Integer(65_536));
    let mut root = BTreeMap::new();
    root.insert(b"info".to_vec(), Value::Dictionary(info));
    let raw = bencode::encode_to_raw(&Value::Dictionary(root)).unwrap();
    MetaInfo::from_bytes(&raw).unwrap()
}

fn info_dict_bytes(metainfo: &MetaInfo) -> Vec<u8> {
    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::ByteString(metainfo.info.name.as_bytes().to_vec()));
    info.insert(b"piece length".to_vec(), Value::Integer(metainfo.info.piece_length as i64));
    info.insert(b"pieces".to_vec(), Value::ByteString(metainfo.info.pieces.clone()));
    info.insert(b"length".to_vec(), Value::Integer(metainfo.info.length.unwrap() as i64));
    bencode::encode_to_raw(&Value::Dictionary(info)).unwrap()
}

struct Fixture {
    session: Arc<TorrentSession>,
    pieces: Arc<StubPieces>,
    slot: PeerManagerSlot,
    bus: EventBus,
}

fn build_session(
    torrent: TorrentData,
    pieces: Arc<StubPieces>,
    peer_manager: Option<Arc<StubPeers>>,
    failing_checkpoints: bool,
) -> Fixture {

    let config = test_config();
    let bus = EventBus::new(EventBusConfig::default());
    let announcer = Arc::new(Announcer::new(&config, bus.clone()).unwrap());
    let slot: PeerManagerSlot = Arc::new(tokio::sync::RwLock::new(
        peer_manager.map(|pm| pm as Arc<dyn PeerManager>),
    ));

    let session = TorrentSession::new(
        torrent,
        config,
        *b"-SW0001-abcdefghijkl",
        PathBuf::from("/tmp/swarm-test"),
        announcer,
        Collaborators {
            piece_manager: pieces.clone(),
            checkpoint_manager: Arc::new(StubCheckpoints { fail: failing_checkpoints }),
            peer_manager: slot.clone(),
            dht: None,
            nat: None,
        },
        bus.clone(),
    );

    Fixture { session, pieces, slot, bus }
}

fn peer(n: u8) -> PeerEndpoint {
    PeerEndpoint::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 9, 0, n)), 6881),
        PeerSource::Dht,
    )
}

async fn wait_for_status(session: &Arc<TorrentSession>, wanted: TorrentStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while session.status() != wanted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}, stuck at {}",
            wanted,
            session.status(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn start_reaches_downloading_when_pieces_flow() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        Some(StubPeers::new(None)),
        false,
    );

    fixture.session.start().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Starting);
    wait_for_status(&fixture.session, TorrentStatus::Downloading).await;

    // Selection was built from metadata at start.
    assert!(fixture.session.selection().await.is_some());

    fixture.session.stop().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Stopped);
}

#[tokio::test]
async fn all_pieces_verified_means_seeding() {
    let pieces = StubPieces::new(4, false);
    pieces.verified.store(4, Ordering::SeqCst);
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        pieces,
        Some(StubPeers::new(None)),
        false,
    );

    fixture.session.start().await.unwrap();
    wait_for_status(&fixture.session, TorrentStatus::Seeding).await;

    let completed = fixture
        .bus
        .get_replay_events(Some(crate::events::types::TORRENT_COMPLETED), 5);
    assert!(!completed.is_empty());

    fixture.session.stop().await.unwrap();
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        Some(StubPeers::new(None)),
        false,
    );

    fixture.session.start().await.unwrap();
    assert!(fixture.session.start().await.is_err());
    fixture.session.stop().await.unwrap();
}

#[tokio::test]
async fn stop_then_start_again() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        Some(StubPeers::new(None)),
        false,
    );

    fixture.session.start().await.unwrap();
    wait_for_status(&fixture.session, TorrentStatus::Downloading).await;
    fixture.session.stop().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Stopped);

    fixture.session.start().await.unwrap();
    wait_for_status(&fixture.session, TorrentStatus::Downloading).await;
    fixture.session.stop().await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_follow_completeness() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        Some(StubPeers::new(None)),
        false,
    );

    fixture.session.start().await.unwrap();
    wait_for_status(&fixture.session, TorrentStatus::Downloading).await;

    fixture.session.pause().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Paused);

    fixture.session.resume().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Downloading);

    // Completing while paused resumes straight into seeding.
    fixture.session.pause().await.unwrap();
    fixture.pieces.verified.store(4, Ordering::SeqCst);
    fixture.session.resume().await.unwrap();
    assert_eq!(fixture.session.status(), TorrentStatus::Seeding);

    fixture.session.stop().await.unwrap();
}

#[tokio::test]
async fn peers_arriving_before_manager_are_queued_then_flushed() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        None,
        false,
    );

    let session = fixture.session.clone();
    let batch: Vec<PeerEndpoint> = (1..=10).map(peer).collect();
    let handler = tokio::spawn({
        let session = session.clone();
        let batch = batch.clone();
        async move { session.handle_discovered_peers(batch).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.queued_peer_count().await, 10);

    // Peer manager shows up inside the 2s window; the queue drains.
    let pm = StubPeers::new(None);
    *fixture.slot.write().await = Some(pm.clone() as Arc<dyn PeerManager>);
    handler.await.unwrap();

    assert_eq!(pm.connected_count(), 10);
    assert_eq!(session.queued_peer_count().await, 0);

    // Replays of the same endpoints are filtered, not reconnected.
    session.handle_discovered_peers(batch).await;
    assert_eq!(pm.connected_count(), 10);
}

#[tokio::test]
async fn status_loop_flushes_queue_when_manager_arrives_late() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        None,
        false,
    );

    fixture.session.start().await.unwrap();
    fixture.session.handle_discovered_peers(vec![peer(1), peer(2)]).await;
    assert_eq!(fixture.session.queued_peer_count().await, 2);

    let pm = StubPeers::new(None);
    *fixture.slot.write().await = Some(pm.clone() as Arc<dyn PeerManager>);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while pm.connected_count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fixture.session.stop().await.unwrap();
}

#[tokio::test]
async fn magnet_bootstraps_metadata_from_peers() {
    let metainfo = test_metainfo();
    let info_bytes = info_dict_bytes(&metainfo);
    let magnet = MagnetLink {
        info_hash: metainfo.info_hash(),
        display_name: Some("fixture".to_string()),
        trackers: Vec::new(),
        sources: Vec::new(),
    };

    let pm = StubPeers::new(Some(info_bytes));
    let fixture = build_session(
        TorrentData::Magnet(magnet),
        StubPieces::new(4, false),
        Some(pm.clone()),
        false,
    );

    assert!(!fixture.session.has_metadata().await);
    fixture.session.handle_discovered_peers(vec![peer(1)]).await;

    assert!(fixture.session.has_metadata().await);
    assert!(fixture.pieces.metadata_seen.load(Ordering::SeqCst));
    assert_eq!(fixture.pieces.start_calls.load(Ordering::SeqCst), 1);
    assert!(fixture.session.selection().await.is_some());
    assert_eq!(pm.connected_count(), 1);

    let received = fixture
        .bus
        .get_replay_events(Some(crate::events::types::METADATA_RECEIVED), 5);
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn corrupt_metadata_is_rejected() {
    let metainfo = test_metainfo();
    let magnet = MagnetLink {
        // Wrong infohash: fetched bytes will not verify.
        info_hash: [0x11; 20],
        display_name: None,
        trackers: Vec::new(),
        sources: Vec::new(),
    };

    let pm = StubPeers::new(Some(info_dict_bytes(&metainfo)));
    let fixture = build_session(
        TorrentData::Magnet(magnet),
        StubPieces::new(4, false),
        Some(pm.clone()),
        false,
    );

    fixture.session.handle_discovered_peers(vec![peer(1)]).await;
    assert!(!fixture.session.has_metadata().await);
    assert_eq!(fixture.pieces.start_calls.load(Ordering::SeqCst), 0);
    // The peers are still useful for later retries.
    assert_eq!(pm.connected_count(), 1);
}

#[tokio::test]
async fn checkpoint_failure_turns_the_session_errored() {
    let fixture = build_session(
        TorrentData::Metadata(test_metainfo()),
        StubPieces::new(4, true),
        Some(StubPeers::new(None)),
        true,
    );

    fixture.session.start().await.unwrap();
    fixture.session.on_piece_verified(0).await;
    // Checkpoint batch flushes within its 1s window, then the status loop
    // notices the failure.
    wait_for_status(&fixture.session, TorrentStatus::Error).await;
}

#[tokio::test]
async fn download_starts_once_despite_racing_callbacks() {
    let metainfo = test_metainfo();
    let pm = StubPeers::new(None);
    let fixture = build_session(
        TorrentData::Metadata(metainfo),
        StubPieces::new(4, false),
        Some(pm),
        false,
    );

    let mut handles = Vec::new();
    for n in 1..=8 {
        let session = fixture.session.clone();
        handles.push(tokio::spawn(async move {
            session.handle_discovered_peers(vec![peer(n)]).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(fixture.pieces.start_calls.load(Ordering::SeqCst), 1);
}
