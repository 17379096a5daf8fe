use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    net::UdpSocket,
    sync::{oneshot, Mutex, OnceCell},
    time,
};
use url::Url;

use crate::peer::{PeerEndpoint, PeerSource};
use super::{AnnounceParams, Event, Result, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

// BEP 15: a connection id may be reused for two minutes.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(110);

// Retransmit schedule: 15 * 2^n seconds for n = 0..=3, then give up and let
// the announcer fall back to http.
const RETRY_BASE: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 4;

pub struct UdpAnnounce {

    pub peers: Vec<PeerEndpoint>,

    pub interval: u32,

    pub leechers: u32,

    pub seeders: u32,

}

// One UDP socket for the whole process. Some platforms refuse to rebind a
// torn-down socket cleanly, so it is bound exactly once; if that bind
// fails, UDP announces stay unavailable until the daemon restarts.
struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>,
    connections: Mutex<HashMap<SocketAddr, (i64, Instant)>>,
}

static ENDPOINT: OnceCell<Option<UdpEndpoint>> = OnceCell::const_new();

// Binds the process-wide socket. Called once at startup; later calls are
// no-ops. Announce attempts before any bind will bind lazily on port 0.
pub async fn bind_udp_socket(port: u16) -> Result<()> {
    let endpoint = ENDPOINT.get_or_init(|| init_endpoint(port)).await;
    if endpoint.is_some() {
        Ok(())
    } else {
        Err(TrackerError::UdpSocketUnavailable)
    }
}

async fn init_endpoint(port: u16) -> Option<UdpEndpoint> {
    match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => {
            let socket = Arc::new(socket);
            let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>> =
                Arc::new(Mutex::new(HashMap::new()));

            // Demultiplex responses by transaction id so concurrent
            // exchanges can share the one socket.
            let recv_socket = socket.clone();
            let recv_pending = pending.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match recv_socket.recv_from(&mut buf).await {
                        Ok((n, _)) => n,
                        Err(e) => {
                            tracing::warn!("udp tracker socket recv error: {}", e);
                            continue;
                        }
                    };
                    if n < 8 {
                        continue;
                    }
                    let trans_id = u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes"));
                    if let Some(tx) = recv_pending.lock().await.remove(&trans_id) {
                        let _ = tx.send(buf[..n].to_vec());
                    } else {
                        tracing::trace!("udp response for unknown transaction {}", trans_id);
                    }
                }
            });

            Some(UdpEndpoint {
                socket,
                pending,
                connections: Mutex::new(HashMap::new()),
            })
        }
        Err(e) => {
            tracing::error!("failed to bind udp tracker socket: {}", e);
            None
        }
    }
}

async fn endpoint() -> Result<&'static UdpEndpoint> {
    ENDPOINT
        .get_or_init(|| init_endpoint(0))
        .await
        .as_ref()
        .ok_or(TrackerError::UdpSocketUnavailable)
}

impl UdpEndpoint {

    // One request/response round trip, matched by transaction id.
    async fn exchange(
        &self,
        addr: SocketAddr,
        request: &[u8],
        trans_id: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>> {

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(trans_id, tx);

        let send = async {
            self.socket.send_to(request, addr).await?;
            rx.await
                .map_err(|_| TrackerError::ResponseError("udp response channel closed".to_string()))
        };

        match time::timeout(timeout, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&trans_id);
                Err(e)
            }
            Err(elapsed) => {
                self.pending.lock().await.remove(&trans_id);
                Err(TrackerError::Timeout(elapsed))
            }
        }
    }

    async fn connection_id(&self, addr: SocketAddr, timeout: Duration) -> Result<i64> {

        if let Some((id, acquired)) = self.connections.lock().await.get(&addr) {
            if acquired.elapsed() < CONNECTION_ID_TTL {
                return Ok(*id);
            }
        }

        let trans_id: u32 = rand::random();
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_u32(trans_id);

        let response = self.exchange(addr, &buf, trans_id, timeout).await?;
        let mut resp = &response[..];
        if resp.len() < 16 {
            return Err(TrackerError::ResponseError("connect response too short".to_string()));
        }
        let action = resp.get_i32();
        let resp_trans = resp.get_u32();
        if resp_trans != trans_id {
            return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
        }
        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(String::from_utf8_lossy(resp).to_string()));
        }
        if action != ACTION_CONNECT {
            return Err(TrackerError::ResponseError(format!("expected action 0, got {}", action)));
        }
        let conn_id = resp.get_i64();

        self.connections.lock().await.insert(addr, (conn_id, Instant::now()));
        tracing::trace!("udp tracker connection established with {}", addr);
        Ok(conn_id)
    }
}

// Builds the 98-byte BEP 15 announce request.
fn build_announce_request(conn_id: i64, trans_id: u32, params: &AnnounceParams) -> BytesMut {

    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_u32(trans_id);
    buf.put(&params.info_hash[..]);
    buf.put(&params.client_id[..]);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_i32(match params.event {
        None => 0,
        Some(Event::Completed) => 1,
        Some(Event::Started) => 2,
        Some(Event::Stopped) => 3,
    });
    buf.put_i32(0); // IP address, default = 0.
    buf.put_i32(rand::random()); // Key, random per announce.
    buf.put_i32(match params.num_want {
        Some(num_want) => num_want as i32,
        None => -1,
    });
    buf.put_u16(params.port);
    buf
}

fn parse_announce_response(response: &[u8], trans_id: u32) -> Result<UdpAnnounce> {

    if response.len() < 20 {
        return Err(TrackerError::ResponseError("announce response too short".to_string()));
    }
    let mut resp = &response[..];
    let action = resp.get_i32();
    let resp_trans = resp.get_u32();
    if resp_trans != trans_id {
        return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(String::from_utf8_lossy(resp).to_string()));
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::ResponseError(format!("expected action 1, got {}", action)));
    }

    let interval = resp.get_u32();
    let leechers = resp.get_u32();
    let seeders = resp.get_u32();

    if resp.remaining() % 6 != 0 {
        return Err(TrackerError::ResponseError(
            "peer list not a multiple of 6 bytes".to_string(),
        ));
    }
    let num_peers = resp.remaining() / 6;
    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        let ip = std::net::Ipv4Addr::from(resp.get_u32());
        let port = resp.get_u16();
        if port != 0 {
            peers.push(PeerEndpoint::new(
                SocketAddr::new(ip.into(), port),
                PeerSource::Tracker,
            ));
        }
    }

    Ok(UdpAnnounce { peers, interval, leechers, seeders })
}

pub async fn announce_udp(url: &Url, params: &AnnounceParams) -> Result<UdpAnnounce> {

    params.validate()?;

    let host = url.host_str().ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let port = url.port().ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TrackerError::InvalidUrl(format!("cannot resolve {}", host)))?;

    let endpoint = endpoint().await?;

    let mut last_error = TrackerError::UdpSocketUnavailable;
    for attempt in 0..MAX_ATTEMPTS {
        let timeout = RETRY_BASE * 2u32.pow(attempt);

        let round_trip = async {
            let conn_id = endpoint.connection_id(addr, timeout).await?;
            let trans_id: u32 = rand::random();
            let request = build_announce_request(conn_id, trans_id, params);
            let response = endpoint.exchange(addr, &request, trans_id, timeout).await?;
            parse_announce_response(&response, trans_id)
        };

        match round_trip.await {
            Ok(announce) => {
                tracing::debug!(
                    "udp tracker {} returned {} peers (seeders={}, leechers={})",
                    host,
                    announce.peers.len(),
                    announce.seeders,
                    announce.leechers,
                );
                return Ok(announce);
            }
            Err(e @ TrackerError::Failure(_)) => return Err(e),
            Err(e) => {
                tracing::debug!("udp announce attempt {} to {} failed: {}", attempt + 1, host, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}
