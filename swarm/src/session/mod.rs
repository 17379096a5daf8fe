use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::{self, CheckpointConfig, CheckpointHandle},
    config::Config,
    dht::DhtDiscovery,
    events::{self, Event, EventBus, EventData, EventPriority},
    magnet::MagnetError,
    metainfo::{MetaInfoError, TorrentData},
    peer::{PeerEndpoint, RecentPeers},
    ports::{CheckpointManager, DhtClient, NatManager, PeerManagerSlot, PieceManager, Protocol},
    selection::FileSelectionManager,
    supervisor::TaskSupervisor,
    tracker::{AnnounceParams, Announcer, Event as TrackerEvent},
    ID,
};

mod loops;

// How long a freshly arrived peer batch waits for the peer manager before
// being parked on the queue for the next lifecycle tick.
const PEER_MANAGER_WAIT: Duration = Duration::from_secs(2);

const PEER_MANAGER_POLL: Duration = Duration::from_millis(500);

// Metadata exchange deadline for magnet links.
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

// Grace period for the final event=stopped announce.
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {

    #[error("invalid torrent data: {0}")]
    InvalidTorrent(String),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error(transparent)]
    Magnet(#[from] MagnetError),

    #[error("cannot {action} while {status}")]
    IllegalTransition {
        action: &'static str,
        status: TorrentStatus,
    },

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Stopped,
    Starting,
    Downloading,
    Seeding,
    Paused,
    Error,
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorrentStatus::Stopped => write!(f, "stopped"),
            TorrentStatus::Starting => write!(f, "starting"),
            TorrentStatus::Downloading => write!(f, "downloading"),
            TorrentStatus::Seeding => write!(f, "seeding"),
            TorrentStatus::Paused => write!(f, "paused"),
            TorrentStatus::Error => write!(f, "error"),
        }
    }
}

impl TorrentStatus {

    // The transition table is the only legal way status changes.
    fn can_transition(self, to: TorrentStatus) -> bool {
        use TorrentStatus::*;
        match (self, to) {
            (_, Stopped) | (_, Error) => true,
            (Stopped, Starting) => true,
            (Starting, Downloading) | (Starting, Seeding) | (Starting, Paused) => true,
            (Downloading, Seeding) | (Downloading, Paused) => true,
            (Seeding, Paused) => true,
            (Paused, Downloading) | (Paused, Seeding) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Error(String),
}

// External collaborators a session talks to. The peer manager is expected
// to arrive late; everything else is handed in up front.
pub struct Collaborators {

    pub piece_manager: Arc<dyn PieceManager>,

    pub checkpoint_manager: Arc<dyn CheckpointManager>,

    pub peer_manager: PeerManagerSlot,

    pub dht: Option<Arc<dyn DhtClient>>,

    pub nat: Option<Arc<dyn NatManager>>,

}

// Per-torrent orchestrator: wires trackers, DHT, file selection and
// checkpointing together and owns the lifecycle state machine.
pub struct TorrentSession {

    info_hash: ID,

    display_name: String,

    torrent: RwLock<TorrentData>,

    status: watch::Sender<TorrentStatus>,

    config: Arc<Config>,

    client_id: ID,

    output_dir: PathBuf,

    announcer: Arc<Announcer>,

    collaborators: Collaborators,

    events: EventBus,

    supervisor: TaskSupervisor,

    selection: RwLock<Option<Arc<FileSelectionManager>>>,

    checkpoint: Mutex<Option<CheckpointHandle>>,

    // Peers that arrived before the peer manager did.
    queued_peers: AsyncMutex<Vec<PeerEndpoint>>,

    // Endpoint dedup across every discovery source.
    recently_processed: Mutex<RecentPeers>,

    tracker_status: Mutex<TrackerConnectionStatus>,

    last_tracker_error: Mutex<Option<String>>,

    download_started: AtomicBool,

    // Serializes the download-start path; discovery callbacks fire often
    // and the start sequence must run at most once.
    download_start: AsyncMutex<()>,

    // Serializes metadata exchange attempts.
    metadata_fetch: AsyncMutex<()>,

    // Cancelling this detaches DHT work without stopping the session;
    // pause uses it, and resume replaces it.
    dht_token: Mutex<Option<CancellationToken>>,

}

impl TorrentSession {

    pub fn new(
        torrent: TorrentData,
        config: Arc<Config>,
        client_id: ID,
        output_dir: PathBuf,
        announcer: Arc<Announcer>,
        collaborators: Collaborators,
        events: EventBus,
    ) -> Arc<Self> {

        let (status, _) = watch::channel(TorrentStatus::Stopped);
        Arc::new(Self {
            info_hash: torrent.info_hash(),
            display_name: torrent.display_name(),
            torrent: RwLock::new(torrent),
            status,
            config,
            client_id,
            output_dir,
            announcer,
            collaborators,
            events,
            supervisor: TaskSupervisor::new(),
            selection: RwLock::new(None),
            checkpoint: Mutex::new(None),
            queued_peers: AsyncMutex::new(Vec::new()),
            recently_processed: Mutex::new(RecentPeers::default()),
            tracker_status: Mutex::new(TrackerConnectionStatus::Idle),
            last_tracker_error: Mutex::new(None),
            download_started: AtomicBool::new(false),
            download_start: AsyncMutex::new(()),
            metadata_fetch: AsyncMutex::new(()),
            dht_token: Mutex::new(None),
        })
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn display_name(&self) -> &str { &self.display_name }

    pub fn status(&self) -> TorrentStatus { *self.status.borrow() }

    pub fn watch_status(&self) -> watch::Receiver<TorrentStatus> {
        self.status.subscribe()
    }

    pub fn tracker_status(&self) -> TrackerConnectionStatus {
        self.tracker_status.lock().expect("tracker status poisoned").clone()
    }

    pub fn last_tracker_error(&self) -> Option<String> {
        self.last_tracker_error.lock().expect("tracker error poisoned").clone()
    }

    pub async fn has_metadata(&self) -> bool {
        self.torrent.read().await.has_metadata()
    }

    pub async fn selection(&self) -> Option<Arc<FileSelectionManager>> {
        self.selection.read().await.clone()
    }

    pub async fn queued_peer_count(&self) -> usize {
        self.queued_peers.lock().await.len()
    }

    // Piece-verified signal from the embedder's piece manager. Feeds the
    // checkpoint batcher; the status loop notices completion.
    pub async fn on_piece_verified(&self, piece: u32) {
        if let Some(handle) = self.checkpoint.lock().expect("checkpoint slot poisoned").clone() {
            handle.piece_verified(piece);
        }
        self.events
            .emit(Event::new(
                events::types::PIECE_COMPLETED,
                EventPriority::Low,
                EventData::PieceCompleted {
                    info_hash: self.info_hash,
                    piece_index: piece,
                },
            ))
            .await;
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {

        let current = self.status();
        if !current.can_transition(TorrentStatus::Starting) {
            return Err(SessionError::IllegalTransition { action: "start", status: current });
        }
        self.set_status(TorrentStatus::Starting).await;
        tracing::info!("starting torrent {}", self.display_name);

        // A restarted session gets a fresh task generation and a fresh
        // shot at the download-start path.
        self.supervisor.reset();
        self.download_started.store(false, Ordering::Release);

        // Selection and piece-file mapping exist as soon as metadata does;
        // for magnets they are built when metadata arrives from peers.
        {
            let torrent = self.torrent.read().await;
            if let Some(metadata) = torrent.metadata() {
                self.build_selection(metadata).await;
            }
        }

        let handle = checkpoint::spawn(
            &self.supervisor,
            CheckpointConfig::default(),
            self.collaborators.piece_manager.clone(),
            self.collaborators.checkpoint_manager.clone(),
            self.display_name.clone(),
            self.info_hash,
            self.output_dir.clone(),
            self.events.clone(),
        );
        *self.checkpoint.lock().expect("checkpoint slot poisoned") = Some(handle);

        // Initial tracker fan-out runs concurrently with DHT registration.
        let session = self.clone();
        self.supervisor.spawn("initial-announce", async move {
            session.run_initial_announce().await;
        });

        self.spawn_dht_tasks().await;

        let session = self.clone();
        let token = self.supervisor.token();
        self.supervisor.spawn("announce-loop", async move {
            loops::announce_loop(session, token).await;
        });

        let session = self.clone();
        let token = self.supervisor.token();
        self.supervisor.spawn("status-loop", async move {
            loops::status_loop(session, token).await;
        });

        Ok(())
    }

    pub async fn pause(self: &Arc<Self>) -> Result<()> {

        let current = self.status();
        if !current.can_transition(TorrentStatus::Paused) {
            return Err(SessionError::IllegalTransition { action: "pause", status: current });
        }
        // Conservative choice: a paused torrent keeps no DHT subscription.
        if let Some(token) = self.dht_token.lock().expect("dht token poisoned").take() {
            token.cancel();
        }
        self.set_status(TorrentStatus::Paused).await;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>) -> Result<()> {

        let current = self.status();
        if current != TorrentStatus::Paused {
            return Err(SessionError::IllegalTransition { action: "resume", status: current });
        }

        self.spawn_dht_tasks().await;

        let next = if self.is_complete() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        };
        self.set_status(next).await;
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<()> {

        if self.status() == TorrentStatus::Stopped {
            return Ok(());
        }
        tracing::info!("stopping torrent {}", self.display_name);

        // Background tasks first, so nothing touches shared state while
        // the session winds down.
        self.supervisor.cancel_all();
        self.supervisor.await_all(Duration::from_secs(5)).await;

        // Courtesy goodbye to the trackers, bounded so a dead tracker
        // cannot stall shutdown.
        let torrent = self.torrent.read().await.clone();
        let params = self.announce_params(Some(TrackerEvent::Stopped)).await;
        let _ = tokio::time::timeout(
            STOP_ANNOUNCE_TIMEOUT,
            self.announcer.announce_all(&torrent, params),
        )
        .await;

        self.set_status(TorrentStatus::Stopped).await;
        Ok(())
    }

    // Peers from any discovery source (tracker, DHT, PEX, incoming) funnel
    // through here: dedup, magnet metadata bootstrap, then handover or
    // queueing when the peer manager is not up yet.
    pub async fn handle_discovered_peers(self: &Arc<Self>, peers: Vec<PeerEndpoint>) {

        let fresh: Vec<PeerEndpoint> = {
            let mut recent = self.recently_processed.lock().expect("recent peers poisoned");
            recent.filter_new(peers)
        };
        if fresh.is_empty() {
            return;
        }

        self.events
            .emit(Event::new(
                events::types::PEERS_DISCOVERED,
                EventPriority::Low,
                EventData::PeersDiscovered {
                    info_hash: self.info_hash,
                    count: fresh.len(),
                    source: fresh[0].source.to_string(),
                },
            ))
            .await;

        if let Some(peer_manager) = self.peer_manager().await {
            self.bootstrap_metadata_if_needed(&fresh).await;
            peer_manager.connect_to_peers(fresh).await;
            self.maybe_start_download().await;
            return;
        }

        // No peer manager yet: park the batch, poll briefly, and leave the
        // rest to the status loop. Never drop peers silently.
        let queued_total = {
            let mut queued = self.queued_peers.lock().await;
            queued.extend(fresh);
            queued.len()
        };
        tracing::warn!(
            "peer manager not ready, queued {} peer(s) for {}",
            queued_total,
            self.display_name,
        );

        let deadline = tokio::time::Instant::now() + PEER_MANAGER_WAIT;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(PEER_MANAGER_POLL).await;
            if self.flush_queued_peers().await {
                return;
            }
        }
    }

    // Drains the parked queue once the peer manager exists. Returns true
    // if a handover happened or nothing was queued.
    pub async fn flush_queued_peers(self: &Arc<Self>) -> bool {

        let Some(peer_manager) = self.peer_manager().await else {
            return false;
        };
        let queued: Vec<PeerEndpoint> = {
            let mut queued = self.queued_peers.lock().await;
            std::mem::take(&mut *queued)
        };
        if queued.is_empty() {
            return true;
        }

        tracing::info!("flushing {} queued peer(s) for {}", queued.len(), self.display_name);
        self.bootstrap_metadata_if_needed(&queued).await;
        peer_manager.connect_to_peers(queued).await;
        self.maybe_start_download().await;
        true
    }

    // Magnet links need the info dictionary from peers before any piece
    // can be requested.
    async fn bootstrap_metadata_if_needed(self: &Arc<Self>, peers: &[PeerEndpoint]) {

        if self.torrent.read().await.has_metadata() {
            return;
        }
        // One exchange at a time; concurrent batches just skip.
        let Ok(_guard) = self.metadata_fetch.try_lock() else {
            return;
        };
        if self.torrent.read().await.has_metadata() {
            return;
        }
        let Some(peer_manager) = self.peer_manager().await else {
            return;
        };

        tracing::info!(
            "attempting metadata exchange with {} peer(s) for {}",
            peers.len(),
            self.display_name,
        );
        let Some(raw) = peer_manager.fetch_metadata(peers, METADATA_TIMEOUT).await else {
            tracing::debug!("metadata exchange yielded nothing for {}", self.display_name);
            return;
        };

        let metadata = match crate::MetaInfo::from_info_bytes(&raw, self.info_hash) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("rejecting fetched metadata for {}: {}", self.display_name, e);
                return;
            }
        };

        let num_pieces = metadata.num_pieces();
        let piece_length = metadata.piece_len();
        tracing::info!(
            "metadata acquired for {}: {} pieces of {} bytes",
            self.display_name,
            num_pieces,
            piece_length,
        );

        self.build_selection(&metadata).await;
        self.collaborators
            .piece_manager
            .on_metadata_available(&metadata)
            .await;
        *self.torrent.write().await = TorrentData::Metadata(metadata);

        self.events
            .emit(Event::new(
                events::types::METADATA_RECEIVED,
                EventPriority::High,
                EventData::MetadataReceived {
                    info_hash: self.info_hash,
                    num_pieces,
                    piece_length,
                },
            ))
            .await;
    }

    // At-most-once download start, no matter how many discovery callbacks
    // race through here.
    async fn maybe_start_download(&self) {

        let _guard = self.download_start.lock().await;
        if self.download_started.load(Ordering::Acquire) {
            return;
        }
        if !self.torrent.read().await.has_metadata() {
            return;
        }
        self.download_started.store(true, Ordering::Release);
        self.collaborators.piece_manager.start_download().await;
        tracing::info!("download started for {}", self.display_name);
    }

    async fn build_selection(&self, metadata: &crate::MetaInfo) {
        let manager = Arc::new(FileSelectionManager::new(
            self.info_hash,
            &metadata.files(),
            metadata.piece_len(),
            self.events.clone(),
        ));
        *self.selection.write().await = Some(manager);
    }

    async fn run_initial_announce(self: Arc<Self>) {

        self.set_tracker_status(TrackerConnectionStatus::Connecting);
        let torrent = self.torrent.read().await.clone();
        let params = self.announce_params(Some(TrackerEvent::Started)).await;

        let outcome = self.announcer.announce_initial(&torrent, params).await;
        if outcome.all_failed() {
            let error = format!("all {} tracker announce(s) failed", outcome.failures);
            tracing::warn!("{} for {}", error, self.display_name);
            *self.last_tracker_error.lock().expect("tracker error poisoned") = Some(error.clone());
            self.set_tracker_status(TrackerConnectionStatus::Error(error));
            return;
        }
        if outcome.successes > 0 {
            self.set_tracker_status(TrackerConnectionStatus::Connected);
        } else {
            self.set_tracker_status(TrackerConnectionStatus::Idle);
        }

        if !outcome.peers.is_empty() {
            tracing::info!(
                "initial announce found {} peer(s) for {}",
                outcome.peers.len(),
                self.display_name,
            );
            self.handle_discovered_peers(outcome.peers).await;
        }
    }

    // Registers for passive pushes and runs the active lookup loop. The
    // subscription handle unregisters itself when these tasks die.
    async fn spawn_dht_tasks(self: &Arc<Self>) {

        let Some(dht_client) = self.collaborators.dht.clone() else {
            return;
        };
        if self.torrent.read().await.is_private() {
            tracing::debug!("private torrent {}, dht disabled", self.display_name);
            return;
        }

        // Child of the supervisor token so stop() still wins; pause only
        // cancels this generation of DHT work.
        let token = self.supervisor.token().child_token();
        *self.dht_token.lock().expect("dht token poisoned") = Some(token.clone());

        let (driver, mut intake) = DhtDiscovery::new(
            dht_client.clone(),
            self.config.dht.clone(),
            self.config.network.max_peers_per_torrent,
            self.events.clone(),
            self.info_hash,
        );

        let subscription = dht_client.subscribe(self.info_hash);

        let run_token = token.clone();
        let run_driver = driver.clone();
        let peer_manager = self.collaborators.peer_manager.clone();
        self.supervisor.spawn("dht-discovery", async move {
            run_driver.run(run_token, peer_manager).await;
        });

        let sub_token = token.clone();
        self.supervisor.spawn("dht-subscription", async move {
            driver.run_subscription(sub_token, subscription).await;
        });

        let session = self.clone();
        self.supervisor.spawn("dht-intake", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    peers = intake.recv() => match peers {
                        Some(peers) => session.handle_discovered_peers(peers).await,
                        None => return,
                    },
                }
            }
        });
    }

    pub(crate) async fn announce_params(&self, event: Option<TrackerEvent>) -> AnnounceParams {

        let torrent = self.torrent.read().await;
        let piece_manager = &self.collaborators.piece_manager;
        let downloaded =
            piece_manager.verified_pieces() as u64 * piece_manager.piece_length() as u64;
        let left = torrent.total_len().saturating_sub(downloaded);

        AnnounceParams {
            info_hash: self.info_hash,
            client_id: self.client_id,
            port: self.external_port(),
            uploaded: 0,
            downloaded,
            left,
            event,
            num_want: None,
            tracker_id: None,
        }
    }

    pub(crate) fn external_port(&self) -> u16 {
        let internal = self.config.network.listen_port;
        self.collaborators
            .nat
            .as_ref()
            .and_then(|nat| nat.external_port(internal, Protocol::Tcp))
            .unwrap_or(internal)
    }

    pub(crate) fn is_complete(&self) -> bool {
        let piece_manager = &self.collaborators.piece_manager;
        let total = piece_manager.num_pieces();
        total > 0 && piece_manager.verified_pieces() == total
    }

    pub(crate) async fn peer_manager(
        &self,
    ) -> Option<Arc<dyn crate::ports::PeerManager>> {
        self.collaborators.peer_manager.read().await.clone()
    }

    pub(crate) async fn active_peer_count(&self) -> usize {
        match self.peer_manager().await {
            Some(pm) => pm.active_peers().len(),
            None => 0,
        }
    }

    pub(crate) fn checkpoint_failed(&self) -> bool {
        self.checkpoint
            .lock()
            .expect("checkpoint slot poisoned")
            .as_ref()
            .is_some_and(CheckpointHandle::has_failed)
    }

    pub(crate) fn set_tracker_status(&self, status: TrackerConnectionStatus) {
        *self.tracker_status.lock().expect("tracker status poisoned") = status;
    }

    pub(crate) async fn set_status(&self, to: TorrentStatus) {

        let from = self.status();
        if from == to {
            return;
        }
        if !from.can_transition(to) {
            tracing::error!(
                "illegal status transition {} -> {} for {}",
                from,
                to,
                self.display_name,
            );
            return;
        }
        self.status.send_replace(to);
        tracing::info!("torrent {} now {}", self.display_name, to);

        self.events
            .emit(Event::new(
                events::types::STATE_CHANGED,
                EventPriority::High,
                EventData::StateChanged {
                    info_hash: self.info_hash,
                    from: from.to_string(),
                    to: to.to_string(),
                },
            ))
            .await;

        if to == TorrentStatus::Seeding {
            self.events
                .emit(Event::new(
                    events::types::TORRENT_COMPLETED,
                    EventPriority::High,
                    EventData::None,
                ))
                .await;
        }
    }

    pub(crate) fn announcer(&self) -> &Announcer { &self.announcer }

    pub(crate) async fn torrent(&self) -> TorrentData {
        self.torrent.read().await.clone()
    }

    pub(crate) fn config(&self) -> &Config { &self.config }

    pub(crate) fn events(&self) -> &EventBus { &self.events }
}

#[cfg(test)]
mod tests;
