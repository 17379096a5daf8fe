use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{peer::PeerEndpoint, ID};

// The collaborator interfaces the engine calls into. Everything behind them
// (wire protocol, disk, NAT, the Kademlia implementation) lives outside this
// crate; the engine only ever sees these surfaces.

// Opaque-progress snapshot persisted per torrent. The progress blob is
// whatever the piece manager wants to see again on restart.
#[derive(Debug, Clone)]
pub struct TorrentCheckpoint {

    pub info_hash: ID,

    pub torrent_name: String,

    pub total_pieces: u32,

    pub output_dir: PathBuf,

    pub progress: Vec<u8>,

}

#[async_trait::async_trait]
pub trait PeerManager: Send + Sync {

    // Hand endpoints over for connection. The engine never inspects wire
    // state; duplicates are already filtered on this side.
    async fn connect_to_peers(&self, peers: Vec<PeerEndpoint>);

    fn active_peers(&self) -> Vec<SocketAddr>;

    // Bytes per second over the recent window.
    fn download_rate(&self) -> f64;

    // BEP 9 metadata exchange with the given peers. None on timeout or if
    // no peer had the metadata.
    async fn fetch_metadata(&self, peers: &[PeerEndpoint], timeout: Duration) -> Option<Vec<u8>>;

}

#[async_trait::async_trait]
pub trait PieceManager: Send + Sync {

    fn num_pieces(&self) -> u32;

    fn piece_length(&self) -> u32;

    fn verified_pieces(&self) -> u32;

    fn is_downloading(&self) -> bool;

    async fn start_download(&self);

    // Called once when magnet metadata arrives, before start_download.
    async fn on_metadata_available(&self, metadata: &crate::MetaInfo);

    async fn get_checkpoint_state(
        &self,
        name: &str,
        info_hash: ID,
        output_dir: &std::path::Path,
    ) -> TorrentCheckpoint;

}

#[async_trait::async_trait]
pub trait CheckpointManager: Send + Sync {

    async fn save_checkpoint(&self, checkpoint: TorrentCheckpoint) -> std::io::Result<()>;

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

pub trait NatManager: Send + Sync {

    // External port mapped for the internal one, if a mapping exists.
    fn external_port(&self, internal_port: u16, protocol: Protocol) -> Option<u16>;

}

// Late-bound peer manager. Sessions start before the wire layer is ready;
// everything that needs it reads through this slot and queues when empty.
pub type PeerManagerSlot = Arc<tokio::sync::RwLock<Option<Arc<dyn PeerManager>>>>;

// What one iterative lookup actually did, for the observability event.
#[derive(Debug, Clone, Default)]
pub struct DhtLookup {

    pub peers: Vec<SocketAddr>,

    pub depth: usize,

    pub nodes_queried: usize,

}

#[derive(Debug, thiserror::Error)]
pub enum DhtError {

    #[error("dht routing table is empty")]
    NotBootstrapped,

    #[error("dht query timed out")]
    Timeout,

    #[error("dht query failed: {0}")]
    QueryFailed(String),

}

// Peers pushed for one infohash. Dropping the subscription unregisters it;
// there is nothing to verify and nothing to retry.
pub struct DhtSubscription {

    pub info_hash: ID,

    pub peers: mpsc::UnboundedReceiver<Vec<SocketAddr>>,

    unregister: Option<Box<dyn FnOnce() + Send>>,

}

impl DhtSubscription {

    pub fn new(
        info_hash: ID,
        peers: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
        unregister: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { info_hash, peers, unregister }
    }
}

impl Drop for DhtSubscription {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

#[async_trait::async_trait]
pub trait DhtClient: Send + Sync {

    // Blocks until the routing table has nodes or the timeout passes;
    // returns whether bootstrap completed.
    async fn wait_for_bootstrap(&self, timeout: Duration) -> bool;

    fn node_count(&self) -> usize;

    // One iterative get_peers lookup.
    async fn get_peers(
        &self,
        info_hash: ID,
        max_peers: usize,
        alpha: usize,
        k: usize,
        max_depth: usize,
    ) -> Result<DhtLookup, DhtError>;

    fn subscribe(&self, info_hash: ID) -> DhtSubscription;

}
