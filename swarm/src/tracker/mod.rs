use url::Url;

use crate::{magnet::MagnetError, peer::PeerEndpoint, ID};

mod announcer;
mod health;
mod http;
mod udp;

pub use announcer::{Announcer, AnnounceOutcome, TrackerSession, TrackerPerformance};
pub use health::{TrackerHealth, TrackerHealthManager, HealthStats};
pub use http::{HttpTrackerClient, HostMetrics};
pub use udp::{announce_udp, bind_udp_socket, UdpAnnounce};

pub type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us an interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: u64 = 1800; // seconds

// Magnet links without metadata cannot report a real `left`. 0 would read
// as "completed" and suppress peer returns; u64::MAX confuses some
// trackers. 1 TiB is the conventional "unknown, want everything" sentinel.
pub const UNKNOWN_LEFT: u64 = 1_099_511_627_776;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    UrlError(#[from] MagnetError),

    // Caller handed us parameters that break protocol invariants.
    #[error("invalid announce parameter: {0}")]
    InvalidParams(String),

    #[error("proxy authentication required for {host}")]
    ProxyAuthRequired {
        host: String,
    },

    #[error("tls handshake with {host} failed: {message}")]
    SslHandshake {
        host: String,
        message: String,
    },

    // Transport-level failure, annotated so "http tracker unreachable"
    // reads differently from "invalid url".
    #[error("{scheme} tracker {host} unreachable: {message}")]
    Unreachable {
        scheme: String,
        host: String,
        message: String,
    },

    // Structured `failure reason` in an otherwise valid response body.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("response error: {0}")]
    ResponseError(String),

    // The process-wide UDP socket never came up; see bind_udp_socket.
    #[error("udp tracker socket unavailable")]
    UdpSocketUnavailable,

}

impl TrackerError {

    // Network-class failures back off on the short schedule; everything
    // else on the long one.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            TrackerError::IoError(_)
                | TrackerError::Timeout(_)
                | TrackerError::Unreachable { .. }
                | TrackerError::SslHandshake { .. }
                | TrackerError::UdpSocketUnavailable
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: ID,

    // 20-byte unique ID for this client.
    pub client_id: ID,

    // Port we accept peer connections on.
    pub port: u16,

    // Totals since the 'started' event, in bytes.
    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for 100%; see UNKNOWN_LEFT for magnets.
    pub left: u64,

    // None for the regular interval announces.
    pub event: Option<Event>,

    pub num_want: Option<usize>,

    // Opaque id some trackers hand back to be echoed on the next announce.
    pub tracker_id: Option<String>,

}

impl AnnounceParams {

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TrackerError::InvalidParams("port must be 1-65535".to_string()));
        }
        if self.info_hash == [0u8; 20] {
            return Err(TrackerError::InvalidParams("info hash is zero".to_string()));
        }
        if self.client_id == [0u8; 20] {
            return Err(TrackerError::InvalidParams("client id is zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackerResponse {

    pub interval: Option<u64>,

    pub min_interval: Option<u64>,

    pub tracker_id: Option<String>,

    // Seeders / leechers as the tracker counts them.
    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    pub warning_message: Option<String>,

    pub peers: Vec<PeerEndpoint>,

    // BEP 12 urls advertised in the response body, already normalized.
    pub discovered_trackers: Vec<Url>,

}

// Swarm statistics from a scrape, per infohash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {

    pub seeders: u64,

    pub leechers: u64,

    pub completed: u64,

}
