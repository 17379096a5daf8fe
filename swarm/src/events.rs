use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ID;

// Event type strings. Kept as strings (not an enum) so throttling and
// subscription work for embedder-defined types too.
pub mod types {
    pub const STATE_CHANGED: &str = "state_changed";
    pub const PEERS_DISCOVERED: &str = "peers_discovered";
    pub const PIECE_COMPLETED: &str = "piece_completed";
    pub const TORRENT_COMPLETED: &str = "torrent_completed";
    pub const METADATA_RECEIVED: &str = "metadata_received";
    pub const FILE_SELECTION_CHANGED: &str = "file_selection_changed";
    pub const FILE_PRIORITY_CHANGED: &str = "file_priority_changed";
    pub const TRACKER_ANNOUNCE_ERROR: &str = "tracker_announce_error";
    pub const TRACKER_DISCOVERED: &str = "tracker_discovered";
    pub const CHECKPOINT_ERROR: &str = "checkpoint_error";
    pub const DHT_NODE_FOUND: &str = "dht_node_found";
    pub const DHT_ITERATIVE_LOOKUP_COMPLETE: &str = "dht_iterative_lookup_complete";
    pub const MONITORING_HEARTBEAT: &str = "monitoring_heartbeat";
    pub const GLOBAL_METRICS_UPDATE: &str = "global_metrics_update";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

// Typed payloads for the events the engine itself emits. Embedders can ride
// along with Message.
#[derive(Debug, Clone)]
pub enum EventData {

    None,

    Message(String),

    StateChanged {
        info_hash: ID,
        from: String,
        to: String,
    },

    PeersDiscovered {
        info_hash: ID,
        count: usize,
        source: String,
    },

    PieceCompleted {
        info_hash: ID,
        piece_index: u32,
    },

    MetadataReceived {
        info_hash: ID,
        num_pieces: u32,
        piece_length: u32,
    },

    FileSelectionChanged {
        info_hash: ID,
        file_index: usize,
        selected: bool,
    },

    FilePriorityChanged {
        info_hash: ID,
        file_index: usize,
        priority: u8,
    },

    TrackerAnnounceError {
        info_hash: ID,
        url: String,
        error: String,
    },

    DhtLookupComplete {
        info_hash: ID,
        peers_found: usize,
        query_duration: Duration,
        query_depth: usize,
        nodes_queried: usize,
        aggressive_mode: bool,
    },

}

#[derive(Debug, Clone)]
pub struct Event {

    pub id: Uuid,

    pub event_type: String,

    pub timestamp: DateTime<Utc>,

    pub priority: EventPriority,

    pub source: Option<String>,

    pub data: EventData,

    pub correlation_id: Option<Uuid>,

}

impl Event {

    pub fn new(event_type: impl Into<String>, priority: EventPriority, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            priority,
            source: None,
            data,
            correlation_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {

    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> Result<(), HandlerError>;

}

#[derive(Debug, Clone)]
pub struct EventBusConfig {

    pub max_queue_size: usize,

    pub batch_size: usize,

    // How long the dispatcher waits to fill a batch.
    pub batch_timeout: Duration,

    // Bounded wait when the queue is full before dropping.
    pub emit_timeout: Duration,

    // Occupancy above which sub-Normal events are shed outright.
    pub queue_full_threshold: f64,

    pub max_replay_events: usize,

    // Per-type minimum emission interval.
    pub throttle_intervals: HashMap<String, Duration>,

}

impl Default for EventBusConfig {
    fn default() -> Self {
        let mut throttle_intervals = HashMap::new();
        throttle_intervals.insert(types::DHT_NODE_FOUND.to_string(), Duration::from_millis(100));
        throttle_intervals.insert(types::MONITORING_HEARTBEAT.to_string(), Duration::from_secs(1));
        throttle_intervals.insert(types::GLOBAL_METRICS_UPDATE.to_string(), Duration::from_millis(500));
        Self {
            max_queue_size: 10_000,
            batch_size: 50,
            batch_timeout: Duration::from_millis(50),
            emit_timeout: Duration::from_millis(10),
            queue_full_threshold: 0.9,
            max_replay_events: 1000,
            throttle_intervals,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {

    pub emitted: u64,

    pub processed: u64,

    pub dropped: u64,

    pub throttled: u64,

    // Current queue depth.
    pub queued: u64,

}

struct Inner {
    cfg: EventBusConfig,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    throttle_times: Mutex<HashMap<String, Instant>>,
    replay: Mutex<VecDeque<Event>>,
    emitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    throttled: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

// Bounded pub/sub bus. One per runtime, created and owned by the embedder
// and threaded through construction so tests can spin up isolated instances.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {

    pub fn new(cfg: EventBusConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.max_queue_size);
        Self {
            inner: Arc::new(Inner {
                cfg,
                tx,
                rx: Mutex::new(Some(rx)),
                handlers: RwLock::new(HashMap::new()),
                throttle_times: Mutex::new(HashMap::new()),
                replay: Mutex::new(VecDeque::new()),
                emitted: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                throttled: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.inner.handlers.write().expect("handler registry poisoned");
        handlers.entry(event_type.to_string()).or_default().push(handler);
    }

    pub fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        let mut handlers = self.inner.handlers.write().expect("handler registry poisoned");
        if let Some(list) = handlers.get_mut(event_type) {
            list.retain(|h| h.name() != handler_name);
        }
    }

    // Non-blocking except for the bounded emit timeout when the queue is
    // full. Never fails; overload shows up in the drop counters instead.
    pub async fn emit(&self, event: Event) {

        let inner = &self.inner;
        inner.emitted.fetch_add(1, Ordering::Relaxed);

        // Throttled types get a minimum spacing; surplus emissions vanish.
        if let Some(interval) = inner.cfg.throttle_intervals.get(&event.event_type) {
            let mut times = inner.throttle_times.lock().expect("throttle map poisoned");
            let now = Instant::now();
            let inside_window = times
                .get(&event.event_type)
                .is_some_and(|last| now.duration_since(*last) < *interval);
            if inside_window {
                inner.throttled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            times.insert(event.event_type.clone(), now);
        }

        {
            let mut replay = inner.replay.lock().expect("replay buffer poisoned");
            replay.push_back(event.clone());
            while replay.len() > inner.cfg.max_replay_events {
                replay.pop_front();
            }
        }

        let occupancy = 1.0
            - inner.tx.capacity() as f64 / inner.tx.max_capacity() as f64;
        if event.priority < EventPriority::Normal && occupancy >= inner.cfg.queue_full_threshold {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match inner.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Bounded wait; higher priorities get this second chance.
                match tokio::time::timeout(inner.cfg.emit_timeout, inner.tx.send(event)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Spawns the dispatch task. Idempotent.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().expect("task slot poisoned");
        if task.is_some() {
            return;
        }
        let Some(rx) = self.inner.rx.lock().expect("receiver slot poisoned").take() else {
            return;
        };
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(dispatch_loop(inner, rx)));
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().expect("task slot poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("event dispatch task failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> EventBusStats {
        let inner = &self.inner;
        EventBusStats {
            emitted: inner.emitted.load(Ordering::Relaxed),
            processed: inner.processed.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            throttled: inner.throttled.load(Ordering::Relaxed),
            queued: (inner.tx.max_capacity() - inner.tx.capacity()) as u64,
        }
    }

    // Recent events for post-hoc inspection. Purely observational; nothing
    // is re-dispatched.
    pub fn get_replay_events(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let replay = self.inner.replay.lock().expect("replay buffer poisoned");
        let filtered: Vec<Event> = replay
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>) {

    loop {
        let first = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        // Assemble a batch: whatever arrives within the window, capped.
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + inner.cfg.batch_timeout;
        while batch.len() < inner.cfg.batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                _ => break,
            }
        }

        // The batch is FIFO, so every handler observes emission order; the
        // handlers of a single event run concurrently.
        for event in batch {
            let handlers = {
                let registry = inner.handlers.read().expect("handler registry poisoned");
                let mut list = registry.get(event.event_type.as_str()).cloned().unwrap_or_default();
                if let Some(wildcard) = registry.get("*") {
                    list.extend(wildcard.iter().cloned());
                }
                list
            };

            let tasks: Vec<_> = handlers
                .into_iter()
                .map(|handler| {
                    let event = event.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(event).await {
                            tracing::warn!("event handler {} failed: {}", handler.name(), e);
                        }
                    })
                })
                .collect();
            for task in futures::future::join_all(tasks).await {
                if let Err(e) = task {
                    tracing::error!("event handler panicked: {}", e);
                }
            }

            inner.processed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
