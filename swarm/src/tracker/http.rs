use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;

use crate::{
    config::TrackerConfig,
    magnet::normalize_tracker_url,
    peer::{PeerEndpoint, PeerSource},
    ID,
};
use super::{AnnounceParams, Result, ScrapeStats, TrackerError, TrackerResponse};

// Request accounting per tracker host.
#[derive(Debug, Clone, Default)]
pub struct HostMetrics {

    pub requests: u64,

    pub total_time: Duration,

    pub errors: u64,

}

// Announce/scrape client over one pooled connection set. Shared by every
// torrent; per-host keepalive and limits come from config.
pub struct HttpTrackerClient {

    client: reqwest::Client,

    numwant: usize,

    metrics: Mutex<HashMap<String, HostMetrics>>,

}

impl HttpTrackerClient {

    pub fn new(cfg: &TrackerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
            .pool_idle_timeout(cfg.pool_idle_timeout)
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| TrackerError::ResponseError(format!("http client init: {}", e)))?;

        Ok(Self {
            client,
            numwant: cfg.numwant,
            metrics: Mutex::new(HashMap::new()),
        })
    }

    pub async fn announce(&self, url: &Url, params: &AnnounceParams) -> Result<TrackerResponse> {

        params.validate()?;
        let request_url = build_announce_url(url, params, self.numwant);
        tracing::debug!("announce url: {}", request_url);

        let host = url.host_str().unwrap_or("unknown").to_string();
        let start = Instant::now();

        let response = self.client.get(request_url).send().await;
        let elapsed = start.elapsed();
        self.record_request(&host, elapsed, response.is_err());

        let response = response.map_err(|e| classify_transport_error(url, e))?;

        if response.status() == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(TrackerError::ProxyAuthRequired { host });
        }
        if !response.status().is_success() {
            return Err(TrackerError::ResponseError(format!(
                "http status {} from {}",
                response.status(),
                host
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(url, e))?;
        parse_response(&body)
    }

    // Best-effort swarm statistics; any failure collapses to None.
    pub async fn scrape(&self, url: &Url, info_hash: ID) -> Option<ScrapeStats> {

        let scrape_url = build_scrape_url(url)?;
        let request_url = format!(
            "{}{}info_hash={}",
            scrape_url,
            if scrape_url.query().is_some() { "&" } else { "?" },
            urlencoding::encode_binary(&info_hash),
        );

        let host = url.host_str().unwrap_or("unknown").to_string();
        let start = Instant::now();
        let result = self.client.get(request_url).send().await;
        self.record_request(&host, start.elapsed(), result.is_err());

        let body = match result {
            Ok(response) if response.status().is_success() => response.bytes().await.ok()?,
            Ok(response) => {
                tracing::debug!("scrape failed with status {}", response.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("scrape request failed: {}", e);
                return None;
            }
        };

        let raw: RawScrapeResponse = match bencode::decode_bytes(&body) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("scrape response undecodable: {}", e);
                return None;
            }
        };

        raw.files.and_then(|files| {
            files.into_iter().find_map(|(key, entry)| {
                (key[..] == info_hash[..]).then(|| ScrapeStats {
                    seeders: entry.complete.unwrap_or(0),
                    leechers: entry.incomplete.unwrap_or(0),
                    completed: entry.downloaded.unwrap_or(0),
                })
            })
        })
    }

    pub fn host_metrics(&self) -> HashMap<String, HostMetrics> {
        self.metrics.lock().expect("metrics poisoned").clone()
    }

    fn record_request(&self, host: &str, elapsed: Duration, failed: bool) {
        let mut metrics = self.metrics.lock().expect("metrics poisoned");
        let entry = metrics.entry(host.to_string()).or_default();
        entry.requests += 1;
        entry.total_time += elapsed;
        if failed {
            entry.errors += 1;
        }
    }
}

// The query string is assembled by hand: the binary info_hash and peer_id
// must be percent-encoded exactly once, and generic URL encoders re-encode
// them into garbage some trackers reject with HTTP 400.
fn build_announce_url(url: &Url, params: &AnnounceParams, numwant: usize) -> String {

    let mut out = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
        url.as_str(),
        if url.query().is_some() { "&" } else { "?" },
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.client_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.num_want.unwrap_or(numwant),
    );
    if let Some(event) = params.event {
        out.push_str(&format!("&event={}", event));
    }
    if let Some(tracker_id) = &params.tracker_id {
        out.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
    }
    out
}

// announce -> scrape per the BEP 48 convention; trackers without the
// /announce suffix get /scrape appended.
fn build_scrape_url(url: &Url) -> Option<Url> {
    let mut scrape = url.clone();
    let path = url.path();
    if let Some(prefix) = path.strip_suffix("/announce") {
        scrape.set_path(&format!("{}/scrape", prefix));
    } else {
        scrape.set_path(&format!("{}/scrape", path.trim_end_matches('/')));
    }
    Some(scrape)
}

fn classify_transport_error(url: &Url, e: reqwest::Error) -> TrackerError {

    let scheme = url.scheme().to_string();
    let host = url.host_str().unwrap_or("unknown").to_string();

    if e.is_timeout() {
        return TrackerError::Unreachable {
            scheme,
            host,
            message: "request timed out".to_string(),
        };
    }
    if error_chain_mentions_tls(&e) {
        return TrackerError::SslHandshake {
            host,
            message: e.to_string(),
        };
    }
    if e.is_connect() {
        return TrackerError::Unreachable {
            scheme,
            host,
            message: format!("connect failed: {}", e),
        };
    }
    TrackerError::Unreachable {
        scheme,
        host,
        message: e.to_string(),
    }
}

fn error_chain_mentions_tls(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = source {
        let text = err.to_string().to_lowercase();
        if text.contains("tls") || text.contains("ssl") || text.contains("certificate") {
            return true;
        }
        source = err.source();
    }
    false
}

fn parse_response(body: &[u8]) -> Result<TrackerResponse> {

    let raw: RawResponse = bencode::decode_bytes(body)?;

    if let Some(failure) = raw.failure_reason {
        return Err(TrackerError::Failure(failure));
    }
    if let Some(warning) = &raw.warning_message {
        tracing::warn!("tracker warning: {}", warning);
    }

    if raw.interval.is_none() {
        return Err(TrackerError::ResponseError("response missing interval".to_string()));
    }
    let Some(mut addrs) = raw.peers else {
        return Err(TrackerError::ResponseError("response missing peers".to_string()));
    };
    if let Some(v6) = raw.peers6 {
        addrs.extend(v6);
    }

    let total = addrs.len();
    let peers: Vec<PeerEndpoint> = addrs
        .into_iter()
        .filter(|a| a.port() != 0)
        .map(|a| PeerEndpoint::new(a, PeerSource::Tracker))
        .collect();
    if peers.len() < total {
        tracing::debug!("dropped {} invalid peer entries from response", total - peers.len());
    }

    // BEP 12 tracker discovery riding along in the response body.
    let mut discovered_trackers = Vec::new();
    let mut raw_discovered: Vec<String> = raw.announce.into_iter().collect();
    if let Some(tiers) = raw.announce_list {
        raw_discovered.extend(tiers.into_iter().flatten());
    }
    for raw_url in raw_discovered {
        match normalize_tracker_url(&raw_url) {
            Ok(url) => {
                if !discovered_trackers.contains(&url) {
                    discovered_trackers.push(url);
                }
            }
            Err(e) => tracing::debug!("ignoring advertised tracker: {}", e),
        }
    }

    Ok(TrackerResponse {
        interval: raw.interval,
        min_interval: raw.min_interval,
        tracker_id: raw.tracker_id,
        complete: raw.complete,
        incomplete: raw.incomplete,
        warning_message: raw.warning_message,
        peers,
        discovered_trackers,
    })
}

#[derive(Deserialize, Debug, Default)]
struct RawResponse {

    // If present no other keys matter; human-readable reason the request
    // was refused.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Processed normally, surfaced like an error message.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds to wait between regular announces.
    interval: Option<u64>,

    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // Echoed back on subsequent announces when present.
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    complete: Option<u64>,

    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_deserialize")]
    peers: Option<Vec<SocketAddr>>,

    // Compact IPv6 peers (BEP 7).
    #[serde(default)]
    #[serde(deserialize_with = "peers6_deserialize")]
    peers6: Option<Vec<SocketAddr>>,

    // BEP 12 fields some trackers embed in announce responses.
    #[serde(default)]
    announce: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,

}

#[derive(Deserialize, Debug, Default)]
struct RawScrapeResponse {

    #[serde(default)]
    files: Option<HashMap<serde_bytes::ByteBuf, RawScrapeEntry>>,

}

#[derive(Deserialize, Debug, Default)]
struct RawScrapeEntry {

    #[serde(default)]
    complete: Option<u64>,

    #[serde(default)]
    incomplete: Option<u64>,

    #[serde(default)]
    downloaded: Option<u64>,

}

// The tracker can answer in the compact string model or the dictionary
// model regardless of what we asked for with compact=1.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<SocketAddr>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of dictionaries")
        }

        // Compact model: 4-byte network-order IP + 2-byte network-order
        // port per peer.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact peer string not a multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }

        // Dictionary model: list of {ip, port}; entries that don't parse
        // are skipped, not fatal.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            let mut dropped = 0usize;
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => dropped += 1,
                }
            }
            if dropped > 0 {
                tracing::debug!("dropped {} undecodable dictionary peers", dropped);
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor).map(Some)
}

fn peers6_deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<SocketAddr>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Peer6Visitor;

    impl<'de> de::Visitor<'de> for Peer6Visitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact ipv6 peer string")
        }

        // 16-byte address + 2-byte port per peer.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 18 != 0 {
                return Err(E::custom("compact ipv6 peer string not a multiple of 18"));
            }

            let num_peers = v.len() / 18;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                let mut octets = [0u8; 16];
                v.copy_to_slice(&mut octets);
                peers.push(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&v)
        }
    }

    deserializer.deserialize_any(Peer6Visitor).map(Some)
}
