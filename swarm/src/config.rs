use std::time::Duration;

use crate::ID;

#[derive(Debug, Clone, Default)]
pub struct Config {

    pub network: NetworkConfig,

    pub tracker: TrackerConfig,

    pub dht: DhtConfig,

}

#[derive(Debug, Clone)]
pub struct NetworkConfig {

    // TCP port peers connect to us on.
    pub listen_port: u16,

    // UDP port the DHT node listens on.
    pub dht_port: u16,

    pub max_peers_per_torrent: u32,

    // Base interval between regular announces.
    pub announce_interval: Duration,

    // Cadence of the session status tick.
    pub status_tick_interval: Duration,

}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            dht_port: 6881,
            max_peers_per_torrent: 200,
            announce_interval: Duration::from_secs(1800),
            status_tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {

    // Connection pool for the shared HTTP client.
    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,

    pub connect_timeout: Duration,

    pub request_timeout: Duration,

    // Number of peers requested per announce.
    pub numwant: usize,

    // When set, only trackers named by the torrent itself are used.
    pub strict_private_mode: bool,

    pub enable_http_trackers: bool,

    // Bounds for the adaptive announce interval.
    pub adaptive_interval_min: Duration,

    pub adaptive_interval_max: Duration,

    // Per-tracker announce backoff.
    pub backoff_base: Duration,

    pub backoff_max: Duration,

}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 8,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            numwant: 200,
            strict_private_mode: false,
            enable_http_trackers: true,
            adaptive_interval_min: Duration::from_secs(60),
            adaptive_interval_max: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

// Iterative lookup parameters for one DHT mode.
#[derive(Debug, Clone, Copy)]
pub struct DhtQueryParams {

    // Parallel outstanding queries.
    pub alpha: usize,

    // Bucket size considered per round.
    pub k: usize,

    // Iterative lookup depth cap.
    pub max_depth: usize,

}

#[derive(Debug, Clone)]
pub struct DhtConfig {

    pub normal: DhtQueryParams,

    // Ceilings here are deliberate: pushing alpha/k/depth past 6/16/12 gets
    // the client blacklisted by public nodes.
    pub aggressive: DhtQueryParams,

    // Hard floor between two queries for the same infohash.
    pub min_query_interval: Duration,

    pub base_query_interval: Duration,

    pub max_query_interval: Duration,

    pub bootstrap_timeout: Duration,

    // Queries are withheld until this many peers arrived by other means.
    pub min_peers_before_query: usize,

    // How often the closed gate re-checks the peer count.
    pub gate_poll_interval: Duration,

    pub max_peers_per_query: usize,

}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            normal: DhtQueryParams { alpha: 3, k: 8, max_depth: 8 },
            aggressive: DhtQueryParams { alpha: 6, k: 16, max_depth: 12 },
            min_query_interval: Duration::from_secs(15),
            base_query_interval: Duration::from_secs(60),
            max_query_interval: Duration::from_secs(1920),
            bootstrap_timeout: Duration::from_secs(120),
            min_peers_before_query: 50,
            gate_poll_interval: Duration::from_secs(5),
            max_peers_per_query: 50,
        }
    }
}

// Client id: 8-byte family/version prefix followed by 12 random bytes.
// Pattern -SW<major:02><minor:02>-, so 0.1.x announces as -SW0001-.
pub fn client_id_prefix() -> [u8; 8] {
    let major: u8 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u8 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let s = format!("-SW{:02}{:02}-", major % 100, minor % 100);
    s.as_bytes().try_into().expect("prefix is 8 bytes")
}

pub fn generate_client_id() -> ID {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(&client_id_prefix());
    rand::Rng::fill(&mut rand::thread_rng(), &mut id[8..]);
    id
}
