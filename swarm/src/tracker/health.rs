use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{magnet::normalize_tracker_url, supervisor::sleep_cancellable};

// Trackers known to be alive on the public internet, used to top up
// torrents whose own tracker lists are thin or dead.
const FALLBACK_TRACKERS: [&str; 16] = [
    "https://tracker.opentrackr.org:443/announce",
    "https://tracker.torrent.eu.org:443/announce",
    "https://tracker.openbittorrent.com:443/announce",
    "http://tracker.opentrackr.org:1337/announce",
    "http://tracker.openbittorrent.com:80/announce",
    "http://tracker.torrent.eu.org:451/announce",
    "http://tracker.internetwarriors.net:1337/announce",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://tracker.internetwarriors.net:1337/announce",
    "udp://tracker.leechers-paradise.org:6969/announce",
    "udp://tracker.coppersurfer.tk:6969/announce",
    "udp://tracker.pirateparty.gr:6969/announce",
    "udp://tracker.zer0day.to:1337/announce",
    "udp://public.popcorn-tracker.org:6969/announce",
];

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

const HEALTHY_SCORE_FLOOR: f64 = 0.3;

const MAX_FALLBACKS: usize = 10;

#[derive(Debug, Clone)]
pub struct TrackerHealth {

    pub url: Url,

    pub success_count: u64,

    pub failure_count: u64,

    pub consecutive_failures: u32,

    pub total_response_time: Duration,

    pub peers_returned: u64,

    pub last_attempt: Option<DateTime<Utc>>,

    pub last_success: Option<DateTime<Utc>>,

    pub added_at: DateTime<Utc>,

}

impl TrackerHealth {

    fn new(url: Url) -> Self {
        Self {
            url,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            total_response_time: Duration::ZERO,
            peers_returned: 0,
            last_attempt: None,
            last_success: None,
            added_at: Utc::now(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn average_response_time(&self) -> Option<Duration> {
        if self.success_count == 0 {
            None
        } else {
            Some(self.total_response_time / self.success_count as u32)
        }
    }

    // 0.6 weight on the success rate, 0.4 on how recently the tracker last
    // answered, decaying to nothing over 24 hours. Three consecutive
    // failures mean dead regardless of history.
    pub fn health_score(&self, now: DateTime<Utc>) -> f64 {
        if self.consecutive_failures >= 3 {
            return 0.0;
        }

        let recency = match self.last_success {
            Some(last) => {
                let age = (now - last).num_seconds().max(0) as f64;
                (1.0 - age / (24.0 * 3600.0)).max(0.0)
            }
            None => 0.0,
        };

        0.6 * self.success_rate() + 0.4 * recency
    }

    fn record_success(&mut self, response_time: Duration, peers_returned: usize) {
        self.success_count += 1;
        self.total_response_time += response_time;
        self.peers_returned += peers_returned as u64;
        self.last_attempt = Some(Utc::now());
        self.last_success = Some(Utc::now());
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_attempt = Some(Utc::now());
        self.consecutive_failures += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStats {

    pub tracked: usize,

    pub healthy: usize,

    pub unhealthy: usize,

    pub fallback_pool: usize,

}

// Health records for every tracker we have talked to. The announcer is the
// single writer; everything else reads snapshots.
pub struct TrackerHealthManager {

    records: Mutex<HashMap<String, TrackerHealth>>,

    fallbacks: Vec<Url>,

}

impl TrackerHealthManager {

    pub fn new() -> Self {
        let fallbacks = FALLBACK_TRACKERS
            .iter()
            .filter_map(|raw| match normalize_tracker_url(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::error!("fallback tracker url rejected: {}", e);
                    None
                }
            })
            .collect();
        Self {
            records: Mutex::new(HashMap::new()),
            fallbacks,
        }
    }

    pub fn record_result(
        &self,
        url: &Url,
        success: bool,
        response_time: Duration,
        peers_returned: usize,
    ) {
        let mut records = self.records.lock().expect("health map poisoned");
        let record = records
            .entry(url.as_str().to_string())
            .or_insert_with(|| TrackerHealth::new(url.clone()));
        if success {
            record.record_success(response_time, peers_returned);
        } else {
            record.record_failure();
        }
    }

    // Trackers with a health score above the floor, best first.
    pub fn healthy(&self, exclude: &[Url]) -> Vec<Url> {
        let now = Utc::now();
        let records = self.records.lock().expect("health map poisoned");
        let mut scored: Vec<(f64, Url)> = records
            .values()
            .filter(|r| !exclude.contains(&r.url))
            .map(|r| (r.health_score(now), r.url.clone()))
            .filter(|(score, _)| *score > HEALTHY_SCORE_FLOOR)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, url)| url).collect()
    }

    // Up to ten well-known trackers not already in use.
    pub fn fallback(&self, exclude: &[Url]) -> Vec<Url> {
        self.fallbacks
            .iter()
            .filter(|url| !exclude.contains(url))
            .take(MAX_FALLBACKS)
            .cloned()
            .collect()
    }

    // Registers a tracker advertised by a response body (BEP 12) so future
    // announces can try it.
    pub fn add_discovered(&self, url: &Url) {
        match url.scheme() {
            "http" | "https" | "udp" => {}
            other => {
                tracing::debug!("ignoring discovered tracker with scheme {}", other);
                return;
            }
        }
        let mut records = self.records.lock().expect("health map poisoned");
        records
            .entry(url.as_str().to_string())
            .or_insert_with(|| {
                tracing::debug!("added discovered tracker: {}", url);
                TrackerHealth::new(url.clone())
            });
    }

    pub fn snapshot(&self, url: &Url) -> Option<TrackerHealth> {
        self.records
            .lock()
            .expect("health map poisoned")
            .get(url.as_str())
            .cloned()
    }

    pub fn stats(&self) -> HealthStats {
        let now = Utc::now();
        let records = self.records.lock().expect("health map poisoned");
        let healthy = records
            .values()
            .filter(|r| r.health_score(now) > HEALTHY_SCORE_FLOOR)
            .count();
        HealthStats {
            tracked: records.len(),
            healthy,
            unhealthy: records.len() - healthy,
            fallback_pool: self.fallbacks.len(),
        }
    }

    // Evicts dead weight: 3+ consecutive failures, chronically failing with
    // nothing recent to show, or simply untouched for two days.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock().expect("health map poisoned");
        let before = records.len();
        records.retain(|url, r| {
            let stale_success = match r.last_success {
                Some(last) => (now - last) > chrono::Duration::hours(24),
                None => true,
            };
            let stale_attempt = match r.last_attempt {
                Some(last) => (now - last) > chrono::Duration::hours(48),
                // Never attempted: judge staleness from registration time.
                None => (now - r.added_at) > chrono::Duration::hours(48),
            };
            let evict = r.consecutive_failures >= 3
                || (r.success_rate() < 0.1 && r.failure_count > 0 && stale_success)
                || stale_attempt;
            if evict {
                tracing::info!(
                    "removing unhealthy tracker {} (success_rate={:.2}, consecutive_failures={})",
                    url,
                    r.success_rate(),
                    r.consecutive_failures,
                );
            }
            !evict
        });
        before - records.len()
    }

    // Periodic cleanup; spawned by the announcer under its supervisor.
    pub async fn run_cleanup(&self, token: CancellationToken) {
        loop {
            if !sleep_cancellable(&token, CLEANUP_INTERVAL).await {
                return;
            }
            let evicted = self.cleanup();
            if evicted > 0 {
                tracing::debug!("tracker cleanup evicted {} record(s)", evicted);
            }
        }
    }
}

impl Default for TrackerHealthManager {
    fn default() -> Self { Self::new() }
}
