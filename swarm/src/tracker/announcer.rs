use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rand::Rng;
use url::Url;

use crate::{
    config::{Config, NetworkConfig, TrackerConfig},
    events::{self, Event as BusEvent, EventBus, EventData, EventPriority},
    metainfo::TorrentData,
    peer::PeerEndpoint,
    supervisor::TaskSupervisor,
    ID,
};
use super::{
    announce_udp, AnnounceParams, HttpTrackerClient, Result, TrackerError,
    TrackerHealthManager, TrackerResponse, DEFAULT_ANNOUNCE_INTERVAL, UNKNOWN_LEFT,
};

const RESPONSE_TIME_WINDOW: usize = 10;

// Sliding-window performance record for one (torrent, tracker) pair.
#[derive(Debug, Clone)]
pub struct TrackerPerformance {

    response_times: VecDeque<Duration>,

    pub success_count: u64,

    pub failure_count: u64,

    // Peers returned by the most recent successful announce.
    pub peers_returned: usize,

    pub last_success: Option<DateTime<Utc>>,

    pub performance_score: f64,

}

impl Default for TrackerPerformance {
    fn default() -> Self {
        Self {
            response_times: VecDeque::with_capacity(RESPONSE_TIME_WINDOW),
            success_count: 0,
            failure_count: 0,
            peers_returned: 0,
            last_success: None,
            // Optimistic until proven otherwise so new trackers get tried.
            performance_score: 1.0,
        }
    }
}

impl TrackerPerformance {

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<Duration>() / self.response_times.len() as u32)
    }

    fn record(&mut self, success: bool, response_time: Duration, peers_returned: usize) {
        self.response_times.push_back(response_time);
        while self.response_times.len() > RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        if success {
            self.success_count += 1;
            self.peers_returned = peers_returned;
            self.last_success = Some(Utc::now());
        } else {
            self.failure_count += 1;
        }
        self.recompute();
    }

    // 0.4 success rate, 0.3 response time, 0.2 peer yield, 0.1 recency.
    fn recompute(&mut self) {
        let success_score = self.success_rate();

        let response_score = match self.average_response_time() {
            Some(avg) => (1.0 - (avg.as_secs_f64() - 0.1) / 4.9).clamp(0.0, 1.0),
            None => 0.5,
        };

        let peer_score = (self.peers_returned as f64 / 50.0).min(1.0);

        let recency_score = match self.last_success {
            Some(last) => {
                let age = (Utc::now() - last).num_seconds().max(0) as f64;
                (1.0 - age / 3600.0).max(0.0)
            }
            None => 0.0,
        };

        self.performance_score =
            0.4 * success_score + 0.3 * response_score + 0.2 * peer_score + 0.1 * recency_score;
    }
}

// Announce state for one (torrent, tracker) pair.
#[derive(Debug, Clone)]
pub struct TrackerSession {

    pub url: Url,

    pub interval: Duration,

    pub min_interval: Option<Duration>,

    pub tracker_id: Option<String>,

    pub consecutive_failures: u32,

    pub last_announce: Option<DateTime<Utc>>,

    pub last_failure: Option<DateTime<Utc>>,

    pub last_warning: Option<String>,

    pub performance: TrackerPerformance,

}

impl TrackerSession {

    fn new(url: Url) -> Self {
        Self {
            url,
            interval: Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL),
            min_interval: None,
            tracker_id: None,
            consecutive_failures: 0,
            last_announce: None,
            last_failure: None,
            last_warning: None,
            performance: TrackerPerformance::default(),
        }
    }
}

// Result of one multi-tracker fan-out.
#[derive(Debug, Default)]
pub struct AnnounceOutcome {

    // Aggregated and deduped across every successful response.
    pub peers: Vec<PeerEndpoint>,

    pub successes: usize,

    pub failures: usize,

    // Subset of failures that were transport-level.
    pub network_failures: usize,

}

impl AnnounceOutcome {
    pub fn all_failed(&self) -> bool {
        self.successes == 0 && self.failures > 0
    }
}

// Fans announces out to every relevant tracker, aggregates the peers, and
// keeps the health and per-session performance books. The single writer for
// tracker health lives here.
pub struct Announcer {

    http: HttpTrackerClient,

    health: TrackerHealthManager,

    network: NetworkConfig,

    cfg: TrackerConfig,

    sessions: Mutex<HashMap<(ID, String), TrackerSession>>,

    events: EventBus,

}

impl Announcer {

    pub fn new(config: &Config, events: EventBus) -> Result<Self> {
        Ok(Self {
            http: HttpTrackerClient::new(&config.tracker)?,
            health: TrackerHealthManager::new(),
            network: config.network.clone(),
            cfg: config.tracker.clone(),
            sessions: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn health(&self) -> &TrackerHealthManager { &self.health }

    pub fn http_client(&self) -> &HttpTrackerClient { &self.http }

    // Periodic health cleanup, owned by the caller's supervisor.
    pub fn spawn_maintenance(self: &std::sync::Arc<Self>, supervisor: &TaskSupervisor) {
        let announcer = self.clone();
        let token = supervisor.token();
        supervisor.spawn("tracker-health-cleanup", async move {
            announcer.health.run_cleanup(token).await;
        });
    }

    // Magnet links without metadata have no honest value for `left`; see
    // UNKNOWN_LEFT for why it is 1 TiB and not 0 or u64::MAX.
    pub fn effective_left(torrent: &TorrentData, left: u64) -> u64 {
        if !torrent.has_metadata() && left == 0 {
            UNKNOWN_LEFT
        } else {
            left
        }
    }

    // Announce targets, in priority order and deduped: the torrent's own
    // tiers, trackers that proved healthy, and, only when the torrent has
    // no usable HTTP tracker of its own, the public fallback pool. Private
    // torrents get exactly what their metadata names.
    pub fn collect_urls(&self, torrent: &TorrentData) -> Vec<Url> {

        let mut seen: HashSet<String> = HashSet::new();
        let mut urls: Vec<Url> = Vec::new();
        let mut push = |url: Url, seen: &mut HashSet<String>, urls: &mut Vec<Url>| {
            if seen.insert(url.as_str().to_string()) {
                urls.push(url);
            }
        };

        for tier in torrent.tracker_tiers() {
            for url in tier {
                push(url, &mut seen, &mut urls);
            }
        }

        if torrent.is_private() || self.cfg.strict_private_mode {
            return self.filter_http(urls);
        }

        for url in self.health.healthy(&urls) {
            push(url, &mut seen, &mut urls);
        }

        let has_http = urls
            .iter()
            .any(|u| matches!(u.scheme(), "http" | "https"))
            && self.cfg.enable_http_trackers;
        if !has_http {
            for url in self.health.fallback(&urls) {
                push(url, &mut seen, &mut urls);
            }
        }

        self.filter_http(urls)
    }

    fn filter_http(&self, urls: Vec<Url>) -> Vec<Url> {
        if self.cfg.enable_http_trackers {
            urls
        } else {
            urls.into_iter().filter(|u| u.scheme() == "udp").collect()
        }
    }

    // Candidate trackers ordered by demonstrated performance for this
    // torrent, best first.
    pub fn rank_trackers(&self, info_hash: ID, urls: Vec<Url>) -> Vec<Url> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        let mut scored: Vec<(f64, Url)> = urls
            .into_iter()
            .map(|url| {
                let score = sessions
                    .get(&(info_hash, url.as_str().to_string()))
                    .map(|s| s.performance.performance_score)
                    .unwrap_or(1.0);
                (score, url)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, url)| url).collect()
    }

    // Concurrent announce to every URL. Individual failures never abort
    // the fan-out; the caller sees per-tracker results.
    pub async fn announce_all(
        &self,
        torrent: &TorrentData,
        mut params: AnnounceParams,
    ) -> Vec<(Url, Result<TrackerResponse>)> {

        params.left = Self::effective_left(torrent, params.left);
        let info_hash = torrent.info_hash();
        let urls = self.rank_trackers(info_hash, self.collect_urls(torrent));
        if urls.is_empty() {
            tracing::warn!("no usable trackers for {}", hex::encode(info_hash));
            return Vec::new();
        }

        let announces = urls.into_iter().map(|url| {
            let params = params.clone();
            async move {
                let result = self.announce_one(info_hash, &url, params).await;
                (url, result)
            }
        });
        let results = futures::future::join_all(announces).await;

        for (url, result) in &results {
            if let Err(e) = result {
                tracing::warn!("tracker announce to {} failed: {}", url, e);
                self.events
                    .emit(BusEvent::new(
                        events::types::TRACKER_ANNOUNCE_ERROR,
                        EventPriority::Normal,
                        EventData::TrackerAnnounceError {
                            info_hash,
                            url: url.as_str().to_string(),
                            error: e.to_string(),
                        },
                    ))
                    .await;
            }
        }
        results
    }

    // Fan-out plus aggregation: the initial announce path.
    pub async fn announce_initial(
        &self,
        torrent: &TorrentData,
        params: AnnounceParams,
    ) -> AnnounceOutcome {
        let results = self.announce_all(torrent, params).await;
        self.aggregate(results)
    }

    pub fn aggregate(&self, results: Vec<(Url, Result<TrackerResponse>)>) -> AnnounceOutcome {

        let mut outcome = AnnounceOutcome::default();
        let mut seen: HashSet<std::net::SocketAddr> = HashSet::new();

        for (_, result) in results {
            match result {
                Ok(response) => {
                    outcome.successes += 1;
                    for peer in response.peers {
                        if seen.insert(peer.addr) {
                            outcome.peers.push(peer);
                        }
                    }
                }
                Err(e) => {
                    outcome.failures += 1;
                    if e.is_network() {
                        outcome.network_failures += 1;
                    }
                }
            }
        }
        outcome
    }

    async fn announce_one(
        &self,
        info_hash: ID,
        url: &Url,
        mut params: AnnounceParams,
    ) -> Result<TrackerResponse> {

        params.tracker_id = self.session_tracker_id(info_hash, url);

        let started = Instant::now();
        let result = match url.scheme() {
            "http" | "https" => self.http.announce(url, &params).await,
            "udp" => {
                match announce_udp(url, &params).await {
                    Ok(announce) => Ok(TrackerResponse {
                        interval: Some(announce.interval as u64),
                        complete: Some(announce.seeders as u64),
                        incomplete: Some(announce.leechers as u64),
                        peers: announce.peers,
                        ..TrackerResponse::default()
                    }),
                    // A tracker-reported failure is authoritative; anything
                    // else is worth one try over http on the same host.
                    Err(e @ TrackerError::Failure(_)) => Err(e),
                    Err(e) if self.cfg.enable_http_trackers => {
                        // The whole BEP 15 retransmit schedule ran dry:
                        // four attempts, four failures on the books.
                        for _ in 0..4 {
                            self.health.record_result(url, false, Duration::ZERO, 0);
                        }
                        let fallback = rewrite_udp_to_http(url)?;
                        tracing::info!(
                            "udp announce to {} failed ({}), retrying via {}",
                            url,
                            e,
                            fallback
                        );
                        let result = self.http.announce(&fallback, &params).await;
                        self.record_outcome(info_hash, &fallback, &result, started.elapsed());
                        return result;
                    }
                    Err(e) => Err(e),
                }
            }
            other => Err(TrackerError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        let elapsed = started.elapsed();

        self.record_outcome(info_hash, url, &result, elapsed);
        result
    }

    fn session_tracker_id(&self, info_hash: ID, url: &Url) -> Option<String> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(&(info_hash, url.as_str().to_string()))
            .and_then(|s| s.tracker_id.clone())
    }

    fn record_outcome(
        &self,
        info_hash: ID,
        url: &Url,
        result: &Result<TrackerResponse>,
        elapsed: Duration,
    ) {
        // An authentication demand from a middlebox says nothing about the
        // tracker itself; leave its books alone.
        if let Err(TrackerError::ProxyAuthRequired { .. }) = result {
            return;
        }

        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions
            .entry((info_hash, url.as_str().to_string()))
            .or_insert_with(|| TrackerSession::new(url.clone()));

        match result {
            Ok(response) => {
                session.consecutive_failures = 0;
                session.last_announce = Some(Utc::now());
                if let Some(interval) = response.interval {
                    session.interval = Duration::from_secs(interval);
                }
                if let Some(min_interval) = response.min_interval {
                    session.min_interval = Some(Duration::from_secs(min_interval));
                }
                if let Some(tracker_id) = &response.tracker_id {
                    session.tracker_id = Some(tracker_id.clone());
                }
                if let Some(warning) = &response.warning_message {
                    session.last_warning = Some(warning.clone());
                }
                session.performance.record(true, elapsed, response.peers.len());
                drop(sessions);

                self.health.record_result(url, true, elapsed, response.peers.len());
                for discovered in &response.discovered_trackers {
                    self.health.add_discovered(discovered);
                }
            }
            Err(_) => {
                session.consecutive_failures += 1;
                session.last_failure = Some(Utc::now());
                session.performance.record(false, elapsed, 0);
                drop(sessions);

                self.health.record_result(url, false, elapsed, 0);
            }
        }
    }

    // interval = base * performance multiplier * peer multiplier, clamped
    // to the configured bounds and never below the tracker's own minimum.
    // Announce less when things are good, more when starving.
    pub fn adaptive_interval(&self, info_hash: ID, url: &Url, peer_count: usize) -> Duration {

        let sessions = self.sessions.lock().expect("session map poisoned");
        let session = sessions.get(&(info_hash, url.as_str().to_string()));

        let base = session
            .map(|s| s.interval)
            .unwrap_or(self.network.announce_interval);
        let score = session
            .map(|s| s.performance.performance_score)
            .unwrap_or(1.0);
        let tracker_min = session.and_then(|s| s.min_interval);

        let perf_multiplier = if score >= 0.8 {
            1.5
        } else if score < 0.5 {
            0.5
        } else {
            1.0
        };

        let peer_multiplier = if peer_count >= 50 {
            1.3
        } else if peer_count < 10 {
            0.7
        } else {
            1.0
        };

        let mut min = self.cfg.adaptive_interval_min;
        if let Some(tracker_min) = tracker_min {
            min = min.max(tracker_min);
        }

        let adaptive = base.mul_f64(perf_multiplier).mul_f64(peer_multiplier);
        adaptive.clamp(min, self.cfg.adaptive_interval_max.max(min))
    }

    // Exponential backoff with jitter for repeated fan-out failures.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.cfg.backoff_base;
        let exp = base.saturating_mul(2u32.saturating_pow(failures.min(16)));
        let jitter = base.mul_f64(rand::thread_rng().gen::<f64>());
        (exp + jitter).min(self.cfg.backoff_max)
    }

    pub fn session_stats(&self, info_hash: ID) -> Vec<TrackerSession> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .iter()
            .filter(|((hash, _), _)| *hash == info_hash)
            .map(|(_, session)| session.clone())
            .collect()
    }

    // Regular announce interval for the next loop iteration: the smallest
    // adaptive interval across this torrent's trackers.
    pub fn next_announce_interval(&self, info_hash: ID, peer_count: usize) -> Duration {
        let urls: Vec<Url> = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            sessions
                .iter()
                .filter(|((hash, _), _)| *hash == info_hash)
                .map(|(_, s)| s.url.clone())
                .collect()
        };
        urls.iter()
            .map(|url| self.adaptive_interval(info_hash, url, peer_count))
            .min()
            .unwrap_or(self.network.announce_interval)
    }
}

// Scenario fallback for dead udp trackers: same endpoint, http scheme. The
// url crate refuses cross-family scheme changes, so rebuild from the string.
fn rewrite_udp_to_http(url: &Url) -> Result<Url> {
    let rewritten = url.as_str().replacen("udp://", "http://", 1);
    Url::parse(&rewritten).map_err(|e| TrackerError::InvalidUrl(format!("{}: {}", e, rewritten)))
}
