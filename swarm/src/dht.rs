use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DhtConfig,
    events::{self, Event, EventBus, EventData, EventPriority},
    peer::{PeerEndpoint, PeerSource, RecentPeers},
    ports::{DhtClient, DhtSubscription, PeerManagerSlot},
    supervisor::sleep_cancellable,
    ID,
};

// Retry interval when the routing table is still empty after bootstrap
// timed out.
const EMPTY_TABLE_RETRY: Duration = Duration::from_secs(30);

// A torrent moving faster than this counts as actively downloading.
const ACTIVE_DOWNLOAD_RATE: f64 = 1024.0; // bytes/sec

// Per-torrent driver for DHT peer discovery. The Kademlia mechanics live
// behind the DhtClient port; this type decides when to query, how hard, and
// routes whatever comes back (from queries or the passive subscription)
// into the session's peer intake after dedup.
pub struct DhtDiscovery {

    client: Arc<dyn DhtClient>,

    cfg: DhtConfig,

    events: EventBus,

    info_hash: ID,

    max_peers_per_torrent: u32,

    recent: Mutex<RecentPeers>,

    out: mpsc::UnboundedSender<Vec<PeerEndpoint>>,

    last_query: Mutex<Option<Instant>>,

    // Once enough peers arrived by other means this opens and stays open.
    gate_open: AtomicBool,

    attempts: AtomicU32,

}

impl DhtDiscovery {

    pub fn new(
        client: Arc<dyn DhtClient>,
        cfg: DhtConfig,
        max_peers_per_torrent: u32,
        events: EventBus,
        info_hash: ID,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<PeerEndpoint>>) {

        let (out, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                client,
                cfg,
                events,
                info_hash,
                max_peers_per_torrent,
                recent: Mutex::new(RecentPeers::default()),
                out,
                last_query: Mutex::new(None),
                gate_open: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
            }),
            rx,
        )
    }

    // Aggressive only pays off for torrents that are already going
    // somewhere, and never once the peer set is close to full. Anything
    // more eager gets the client blacklisted by public nodes.
    pub fn aggressive_mode(peer_count: usize, download_rate: f64, max_peers: u32) -> bool {
        let popular = peer_count >= 50;
        let active = download_rate > ACTIVE_DOWNLOAD_RATE;
        let below_limit = (peer_count as f64) < 0.7 * max_peers as f64;
        (popular || active) && below_limit
    }

    // Query timeout scales with how many times we have tried already.
    pub fn query_timeout(attempts: u32) -> Duration {
        let secs = (45.0 + 0.15 * attempts as f64 * 45.0).min(90.0);
        Duration::from_secs_f64(secs)
    }

    // Drives iterative lookups until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken, peer_manager: PeerManagerSlot) {

        if !self.wait_for_routing_table(&token).await {
            return;
        }

        let mut interval = self.cfg.base_query_interval;

        loop {
            if token.is_cancelled() {
                return;
            }

            // Minimum-peer gate: rapid-fire queries from a peerless client
            // look like scraping, so hold off until other sources deliver.
            if !self.gate_open.load(Ordering::Acquire) {
                let count = peer_count(&peer_manager).await;
                if count < self.cfg.min_peers_before_query {
                    tracing::debug!(
                        "dht gate closed for {} ({}/{} peers)",
                        hex::encode(self.info_hash),
                        count,
                        self.cfg.min_peers_before_query,
                    );
                    if !sleep_cancellable(&token, self.cfg.gate_poll_interval).await {
                        return;
                    }
                    continue;
                }
                self.gate_open.store(true, Ordering::Release);
                tracing::info!(
                    "dht gate open for {} with {} peers",
                    hex::encode(self.info_hash),
                    count,
                );
            }

            // Hard floor between queries regardless of how we got here.
            let wait = {
                let last = self.last_query.lock().expect("pacing clock poisoned");
                last.map(|at| self.cfg.min_query_interval.saturating_sub(at.elapsed()))
            };
            if let Some(wait) = wait {
                if !wait.is_zero() && !sleep_cancellable(&token, wait).await {
                    return;
                }
            }

            let (count, rate) = peer_stats(&peer_manager).await;
            let aggressive = Self::aggressive_mode(count, rate, self.max_peers_per_torrent);
            let params = if aggressive { self.cfg.aggressive } else { self.cfg.normal };
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            let timeout = Self::query_timeout(attempt);

            *self.last_query.lock().expect("pacing clock poisoned") = Some(Instant::now());
            let started = Instant::now();

            let lookup = tokio::time::timeout(
                timeout,
                self.client.get_peers(
                    self.info_hash,
                    self.cfg.max_peers_per_query,
                    params.alpha,
                    params.k,
                    params.max_depth,
                ),
            )
            .await;

            match lookup {
                Ok(Ok(lookup)) => {
                    let found = lookup.peers.len();
                    self.dispatch(lookup.peers).await;
                    self.events
                        .emit(Event::new(
                            events::types::DHT_ITERATIVE_LOOKUP_COMPLETE,
                            EventPriority::Normal,
                            EventData::DhtLookupComplete {
                                info_hash: self.info_hash,
                                peers_found: found,
                                query_duration: started.elapsed(),
                                query_depth: lookup.depth,
                                nodes_queried: lookup.nodes_queried,
                                aggressive_mode: aggressive,
                            },
                        ))
                        .await;
                    interval = self.cfg.base_query_interval;
                }
                Ok(Err(e)) => {
                    tracing::warn!("dht lookup for {} failed: {}", hex::encode(self.info_hash), e);
                    interval = (interval * 2).min(self.cfg.max_query_interval);
                }
                Err(_) => {
                    tracing::warn!(
                        "dht lookup for {} timed out after {:?}",
                        hex::encode(self.info_hash),
                        timeout,
                    );
                    interval = (interval * 2).min(self.cfg.max_query_interval);
                }
            }

            if !sleep_cancellable(&token, interval).await {
                return;
            }
        }
    }

    // Forwards peers the DHT client pushes for our infohash (other nodes
    // announcing, not our own lookups).
    pub async fn run_subscription(
        self: Arc<Self>,
        token: CancellationToken,
        mut subscription: DhtSubscription,
    ) {
        debug_assert_eq!(subscription.info_hash, self.info_hash);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                peers = subscription.peers.recv() => match peers {
                    Some(addrs) => self.dispatch(addrs).await,
                    None => return,
                },
            }
        }
    }

    // Dedup against the rolling recently-seen set, then hand the remainder
    // to the session's intake.
    async fn dispatch(&self, addrs: Vec<SocketAddr>) {

        if addrs.is_empty() {
            return;
        }
        let fresh: Vec<PeerEndpoint> = {
            let mut recent = self.recent.lock().expect("recent peers poisoned");
            addrs
                .into_iter()
                .filter(|addr| recent.insert(*addr))
                .map(|addr| PeerEndpoint::new(addr, PeerSource::Dht))
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        self.events
            .emit(Event::new(
                events::types::DHT_NODE_FOUND,
                EventPriority::Low,
                EventData::PeersDiscovered {
                    info_hash: self.info_hash,
                    count: fresh.len(),
                    source: "dht".to_string(),
                },
            ))
            .await;

        if self.out.send(fresh).is_err() {
            tracing::debug!("session intake closed, dropping dht peers");
        }
    }

    // Bootstrap gating: wait for the routing table, degrade if it is merely
    // thin, keep retrying while it is empty.
    async fn wait_for_routing_table(&self, token: &CancellationToken) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }
            let bootstrap = tokio::select! {
                _ = token.cancelled() => return false,
                ok = self.client.wait_for_bootstrap(self.cfg.bootstrap_timeout) => ok,
            };
            if bootstrap {
                return true;
            }
            let nodes = self.client.node_count();
            if nodes > 0 {
                tracing::warn!(
                    "dht bootstrap incomplete, proceeding in degraded mode with {} node(s)",
                    nodes,
                );
                return true;
            }
            tracing::warn!("dht routing table empty, retrying bootstrap");
            if !sleep_cancellable(token, EMPTY_TABLE_RETRY).await {
                return false;
            }
        }
    }
}

async fn peer_count(slot: &PeerManagerSlot) -> usize {
    match slot.read().await.as_ref() {
        Some(pm) => pm.active_peers().len(),
        None => 0,
    }
}

async fn peer_stats(slot: &PeerManagerSlot) -> (usize, f64) {
    match slot.read().await.as_ref() {
        Some(pm) => (pm.active_peers().len(), pm.download_rate()),
        None => (0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBusConfig;
    use crate::ports::{DhtError, DhtLookup, PeerManager};
    use std::net::{IpAddr, Ipv4Addr};

    struct StubDht {
        bootstrap: bool,
        nodes: usize,
        fail: bool,
        queries: Mutex<Vec<Instant>>,
    }

    impl StubDht {
        fn new(bootstrap: bool, nodes: usize, fail: bool) -> Arc<Self> {
            Arc::new(Self { bootstrap, nodes, fail, queries: Mutex::new(Vec::new()) })
        }

        fn query_times(&self) -> Vec<Instant> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DhtClient for StubDht {
        async fn wait_for_bootstrap(&self, _timeout: Duration) -> bool {
            self.bootstrap
        }

        fn node_count(&self) -> usize { self.nodes }

        async fn get_peers(
            &self,
            _info_hash: ID,
            _max_peers: usize,
            _alpha: usize,
            _k: usize,
            _max_depth: usize,
        ) -> Result<DhtLookup, DhtError> {
            self.queries.lock().unwrap().push(Instant::now());
            if self.fail {
                return Err(DhtError::QueryFailed("stub".to_string()));
            }
            Ok(DhtLookup {
                peers: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 6881)],
                depth: 3,
                nodes_queried: 12,
            })
        }

        fn subscribe(&self, info_hash: ID) -> DhtSubscription {
            let (_tx, rx) = mpsc::unbounded_channel();
            DhtSubscription::new(info_hash, rx, None)
        }
    }

    struct StubPeers {
        count: usize,
    }

    #[async_trait::async_trait]
    impl PeerManager for StubPeers {
        async fn connect_to_peers(&self, _peers: Vec<PeerEndpoint>) {}

        fn active_peers(&self) -> Vec<SocketAddr> {
            (0..self.count)
                .map(|i| {
                    SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::new(10, 2, (i >> 8) as u8, i as u8)),
                        6881,
                    )
                })
                .collect()
        }

        fn download_rate(&self) -> f64 { 0.0 }

        async fn fetch_metadata(
            &self,
            _peers: &[PeerEndpoint],
            _timeout: Duration,
        ) -> Option<Vec<u8>> {
            None
        }
    }

    fn slot_with(count: usize) -> PeerManagerSlot {
        Arc::new(tokio::sync::RwLock::new(Some(
            Arc::new(StubPeers { count }) as Arc<dyn PeerManager>
        )))
    }

    fn fast_config() -> DhtConfig {
        DhtConfig {
            min_query_interval: Duration::from_millis(100),
            base_query_interval: Duration::from_millis(20),
            max_query_interval: Duration::from_millis(400),
            bootstrap_timeout: Duration::from_millis(10),
            gate_poll_interval: Duration::from_millis(50),
            ..DhtConfig::default()
        }
    }

    #[test]
    fn query_timeout_scales_and_caps() {
        assert_eq!(DhtDiscovery::query_timeout(0), Duration::from_secs(45));
        let later = DhtDiscovery::query_timeout(3);
        assert!(later > Duration::from_secs(45) && later < Duration::from_secs(90));
        assert_eq!(DhtDiscovery::query_timeout(100), Duration::from_secs(90));
    }

    #[test]
    fn aggressive_mode_requires_activity_and_headroom() {
        // Popular and below limit.
        assert!(DhtDiscovery::aggressive_mode(60, 0.0, 200));
        // Active download, few peers.
        assert!(DhtDiscovery::aggressive_mode(5, 10_000.0, 200));
        // Idle and unpopular.
        assert!(!DhtDiscovery::aggressive_mode(5, 0.0, 200));
        // Popular but peer set nearly full.
        assert!(!DhtDiscovery::aggressive_mode(180, 10_000.0, 200));
    }

    #[tokio::test]
    async fn queries_respect_minimum_interval() {
        let client = StubDht::new(true, 10, false);
        let (driver, _rx) = DhtDiscovery::new(
            client.clone(),
            fast_config(),
            200,
            EventBus::new(EventBusConfig::default()),
            [9; 20],
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(driver.run(token.clone(), slot_with(60)));
        tokio::time::sleep(Duration::from_millis(450)).await;
        token.cancel();
        let _ = handle.await;

        let times = client.query_times();
        assert!(times.len() >= 2, "expected multiple queries, got {}", times.len());
        for pair in times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap >= Duration::from_millis(95),
                "queries only {:?} apart",
                gap,
            );
        }
    }

    #[tokio::test]
    async fn gate_blocks_until_peer_threshold() {
        let client = StubDht::new(true, 10, false);
        let (driver, _rx) = DhtDiscovery::new(
            client.clone(),
            fast_config(),
            200,
            EventBus::new(EventBusConfig::default()),
            [9; 20],
        );

        let slot: PeerManagerSlot = Arc::new(tokio::sync::RwLock::new(Some(
            Arc::new(StubPeers { count: 3 }) as Arc<dyn PeerManager>
        )));
        let token = CancellationToken::new();
        let handle = tokio::spawn(driver.clone().run(token.clone(), slot.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.query_times().is_empty(), "gate should block queries");

        // Threshold reached: gate opens on the next poll.
        *slot.write().await = Some(Arc::new(StubPeers { count: 60 }) as Arc<dyn PeerManager>);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.query_times().is_empty());

        // Dropping below the threshold does not close it again.
        *slot.write().await = Some(Arc::new(StubPeers { count: 0 }) as Arc<dyn PeerManager>);
        let before = client.query_times().len();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.query_times().len() > before);

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn degraded_mode_with_thin_routing_table() {
        let client = StubDht::new(false, 2, false);
        let (driver, _rx) = DhtDiscovery::new(
            client.clone(),
            fast_config(),
            200,
            EventBus::new(EventBusConfig::default()),
            [9; 20],
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(driver.run(token.clone(), slot_with(60)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        let _ = handle.await;

        assert!(!client.query_times().is_empty());
    }

    #[tokio::test]
    async fn dispatch_dedupes_and_forwards() {
        let client = StubDht::new(true, 10, false);
        let (driver, mut rx) = DhtDiscovery::new(
            client,
            fast_config(),
            200,
            EventBus::new(EventBusConfig::default()),
            [9; 20],
        );

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 3, 0, 1)), 6881);
        driver.dispatch(vec![addr, addr]).await;
        driver.dispatch(vec![addr]).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].source, PeerSource::Dht);
        // Second dispatch was entirely duplicates; nothing else arrives.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lookup_completion_emits_event() {
        let client = StubDht::new(true, 10, false);
        let bus = EventBus::new(EventBusConfig::default());
        let (driver, _rx) = DhtDiscovery::new(
            client,
            fast_config(),
            200,
            bus.clone(),
            [9; 20],
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(driver.run(token.clone(), slot_with(60)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();
        let _ = handle.await;

        let events = bus.get_replay_events(Some(events::types::DHT_ITERATIVE_LOOKUP_COMPLETE), 10);
        assert!(!events.is_empty());
        match &events[0].data {
            EventData::DhtLookupComplete { peers_found, nodes_queried, .. } => {
                assert_eq!(*peers_found, 1);
                assert_eq!(*nodes_queried, 12);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
