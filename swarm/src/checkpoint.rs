use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{self, Event, EventBus, EventData, EventPriority},
    ports::{CheckpointManager, PieceManager},
    supervisor::TaskSupervisor,
    ID,
};

#[derive(Debug, Clone)]
pub struct CheckpointConfig {

    // Outer bound on how long a verified piece can go unpersisted.
    pub flush_interval: Duration,

    // Flush early once this many pieces accumulate.
    pub flush_pieces: usize,

}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_pieces: 25,
        }
    }
}

// Input side of the controller. The embedder wires piece-verified signals
// from its piece manager into piece_verified().
#[derive(Clone)]
pub struct CheckpointHandle {

    tx: mpsc::UnboundedSender<u32>,

    failed: Arc<AtomicBool>,

}

impl CheckpointHandle {

    pub fn piece_verified(&self, piece: u32) {
        if self.tx.send(piece).is_err() {
            tracing::warn!("checkpoint controller gone, piece {} not recorded", piece);
        }
    }

    // A failed flush is unrecoverable for the torrent; the session watches
    // this and transitions to error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

// Batches piece completions into durable snapshots. Flushes are serialized:
// the loop awaits each save before taking the next batch, so at most one
// write is in flight per torrent.
pub fn spawn(
    supervisor: &TaskSupervisor,
    cfg: CheckpointConfig,
    piece_manager: Arc<dyn PieceManager>,
    checkpoint_manager: Arc<dyn CheckpointManager>,
    torrent_name: String,
    info_hash: ID,
    output_dir: PathBuf,
    events: EventBus,
) -> CheckpointHandle {

    let (tx, rx) = mpsc::unbounded_channel();
    let failed = Arc::new(AtomicBool::new(false));

    let token = supervisor.token();
    let flag = failed.clone();
    supervisor.spawn("checkpoint-flush", async move {
        run(
            cfg,
            rx,
            token,
            piece_manager,
            checkpoint_manager,
            torrent_name,
            info_hash,
            output_dir,
            events,
            flag,
        )
        .await;
    });

    CheckpointHandle { tx, failed }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    cfg: CheckpointConfig,
    mut rx: mpsc::UnboundedReceiver<u32>,
    token: CancellationToken,
    piece_manager: Arc<dyn PieceManager>,
    checkpoint_manager: Arc<dyn CheckpointManager>,
    torrent_name: String,
    info_hash: ID,
    output_dir: PathBuf,
    events: EventBus,
    failed: Arc<AtomicBool>,
) {

    let mut pending = 0usize;
    let mut ticker = tokio::time::interval(cfg.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let flush = |pending: &mut usize| {
        let piece_manager = piece_manager.clone();
        let checkpoint_manager = checkpoint_manager.clone();
        let torrent_name = torrent_name.clone();
        let output_dir = output_dir.clone();
        let events = events.clone();
        let failed = failed.clone();
        *pending = 0;
        async move {
            let checkpoint = piece_manager
                .get_checkpoint_state(&torrent_name, info_hash, &output_dir)
                .await;
            if let Err(e) = checkpoint_manager.save_checkpoint(checkpoint).await {
                tracing::error!("checkpoint save for {} failed: {}", torrent_name, e);
                failed.store(true, Ordering::Release);
                events
                    .emit(Event::new(
                        events::types::CHECKPOINT_ERROR,
                        EventPriority::Critical,
                        EventData::Message(format!("checkpoint save failed: {}", e)),
                    ))
                    .await;
            }
        }
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if pending > 0 {
                    flush(&mut pending).await;
                }
                return;
            }

            piece = rx.recv() => match piece {
                Some(piece) => {
                    tracing::trace!("piece {} verified for {}", piece, torrent_name);
                    pending += 1;
                    if pending >= cfg.flush_pieces {
                        flush(&mut pending).await;
                    }
                }
                None => {
                    if pending > 0 {
                        flush(&mut pending).await;
                    }
                    return;
                }
            },

            _ = ticker.tick() => {
                if pending > 0 {
                    flush(&mut pending).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::ports::TorrentCheckpoint;
    use std::sync::Mutex;

    struct FakePieces {
        total: u32,
    }

    #[async_trait::async_trait]
    impl PieceManager for FakePieces {
        fn num_pieces(&self) -> u32 { self.total }
        fn piece_length(&self) -> u32 { 16_384 }
        fn verified_pieces(&self) -> u32 { 0 }
        fn is_downloading(&self) -> bool { true }
        async fn start_download(&self) {}
        async fn on_metadata_available(&self, _metadata: &crate::MetaInfo) {}

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
                progress: vec![0xff],
            }
        }
    }

    struct FakeCheckpoints {
        saved: Mutex<Vec<TorrentCheckpoint>>,
        fail: bool,
    }

    impl FakeCheckpoints {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self { saved: Mutex::new(Vec::new()), fail })
        }

        fn count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl CheckpointManager for FakeCheckpoints {
        async fn save_checkpoint(&self, checkpoint: TorrentCheckpoint) -> std::io::Result<()> {
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.saved.lock().unwrap().push(checkpoint);
            Ok(())
        }
    }

    fn controller(
        cfg: CheckpointConfig,
        saves: Arc<FakeCheckpoints>,
    ) -> (TaskSupervisor, CheckpointHandle, EventBus) {
        let supervisor = TaskSupervisor::new();
        let bus = EventBus::new(EventBusConfig::default());
        let handle = spawn(
            &supervisor,
            cfg,
            Arc::new(FakePieces { total: 64 }),
            saves,
            "test".to_string(),
            [1; 20],
            PathBuf::from("/tmp/out"),
            bus.clone(),
        );
        (supervisor, handle, bus)
    }

    #[tokio::test]
    async fn piece_count_triggers_flush() {
        let saves = FakeCheckpoints::new(false);
        let cfg = CheckpointConfig {
            flush_interval: Duration::from_secs(60),
            flush_pieces: 3,
        };
        let (supervisor, handle, _) = controller(cfg, saves.clone());

        for piece in 0..3 {
            handle.piece_verified(piece);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(saves.count(), 1);
        let saved = saves.saved.lock().unwrap()[0].clone();
        assert_eq!(saved.total_pieces, 64);
        assert_eq!(saved.torrent_name, "test");

        supervisor.cancel_all();
        supervisor.await_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn flush_window_bounds_loss() {
        let saves = FakeCheckpoints::new(false);
        let cfg = CheckpointConfig {
            flush_interval: Duration::from_millis(50),
            flush_pieces: 1000,
        };
        let (supervisor, handle, _) = controller(cfg, saves.clone());

        handle.piece_verified(7);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(saves.count() >= 1);

        // No new pieces: the ticker does not write empty checkpoints.
        let count = saves.count();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(saves.count(), count);

        supervisor.cancel_all();
        supervisor.await_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancellation_flushes_the_tail() {
        let saves = FakeCheckpoints::new(false);
        let cfg = CheckpointConfig {
            flush_interval: Duration::from_secs(60),
            flush_pieces: 1000,
        };
        let (supervisor, handle, _) = controller(cfg, saves.clone());

        handle.piece_verified(1);
        handle.piece_verified(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.cancel_all();
        supervisor.await_all(Duration::from_secs(1)).await;
        assert_eq!(saves.count(), 1);
    }

    #[tokio::test]
    async fn save_failure_raises_the_error_flag() {
        let saves = FakeCheckpoints::new(true);
        let cfg = CheckpointConfig {
            flush_interval: Duration::from_millis(20),
            flush_pieces: 1,
        };
        let (supervisor, handle, bus) = controller(cfg, saves);

        handle.piece_verified(0);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(handle.has_failed());
        let errors = bus.get_replay_events(Some(events::types::CHECKPOINT_ERROR), 5);
        assert!(!errors.is_empty());

        supervisor.cancel_all();
        supervisor.await_all(Duration::from_secs(1)).await;
    }
}
