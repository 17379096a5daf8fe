use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    num::NonZeroUsize,
};
use chrono::{DateTime, Utc};
use lru::LruCache;

// Where an endpoint was learned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Incoming,
}

impl std::fmt::Display for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerSource::Tracker => write!(f, "tracker"),
            PeerSource::Dht => write!(f, "dht"),
            PeerSource::Pex => write!(f, "pex"),
            PeerSource::Incoming => write!(f, "incoming"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerEndpoint {

    pub addr: SocketAddr,

    pub source: PeerSource,

    // None until the extension handshake tells us either way.
    pub ssl_capable: Option<bool>,

    pub queued_at: DateTime<Utc>,

}

impl PeerEndpoint {

    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            source,
            ssl_capable: None,
            queued_at: Utc::now(),
        }
    }
}

// Identity is (ip, port); provenance does not distinguish endpoints.

impl PartialEq for PeerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PeerEndpoint {}

impl Hash for PeerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

pub const RECENT_PEERS_CAPACITY: usize = 2000;

// Rolling set of recently seen endpoints. When full, the oldest half is
// evicted in one go rather than churning entry-by-entry.
pub struct RecentPeers {

    seen: LruCache<SocketAddr, ()>,

    capacity: usize,

}

impl RecentPeers {

    pub fn new(capacity: usize) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(capacity.max(2)).expect("capacity > 0")),
            capacity: capacity.max(2),
        }
    }

    // Returns true if the endpoint was not seen recently.
    pub fn insert(&mut self, addr: SocketAddr) -> bool {
        if self.seen.contains(&addr) {
            // Refresh recency.
            self.seen.get(&addr);
            return false;
        }
        if self.seen.len() >= self.capacity {
            for _ in 0..self.capacity / 2 {
                self.seen.pop_lru();
            }
        }
        self.seen.put(addr, ());
        true
    }

    // Keeps only endpoints not seen recently, marking them seen.
    pub fn filter_new(&mut self, peers: Vec<PeerEndpoint>) -> Vec<PeerEndpoint> {
        peers.into_iter().filter(|p| self.insert(p.addr)).collect()
    }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

impl Default for RecentPeers {
    fn default() -> Self { Self::new(RECENT_PEERS_CAPACITY) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8)), 6881)
    }

    #[test]
    fn dedupes_by_addr() {
        let mut recent = RecentPeers::new(10);
        assert!(recent.insert(addr(1)));
        assert!(!recent.insert(addr(1)));
        assert!(recent.insert(addr(2)));
    }

    #[test]
    fn endpoint_identity_ignores_source() {
        let a = PeerEndpoint::new(addr(1), PeerSource::Tracker);
        let b = PeerEndpoint::new(addr(1), PeerSource::Dht);
        assert_eq!(a, b);
    }

    #[test]
    fn overflow_evicts_oldest_half() {
        let mut recent = RecentPeers::new(100);
        for n in 0..100 {
            recent.insert(addr(n));
        }
        assert_eq!(recent.len(), 100);
        recent.insert(addr(200));
        // Half went out, the new entry came in.
        assert_eq!(recent.len(), 51);
        // The newest survivors are still known.
        assert!(!recent.insert(addr(99)));
        // The oldest were evicted and count as fresh again.
        assert!(recent.insert(addr(0)));
    }

    #[test]
    fn filter_new_marks_and_drops() {
        let mut recent = RecentPeers::new(10);
        let batch = vec![
            PeerEndpoint::new(addr(1), PeerSource::Dht),
            PeerEndpoint::new(addr(1), PeerSource::Dht),
            PeerEndpoint::new(addr(2), PeerSource::Dht),
        ];
        let fresh = recent.filter_new(batch);
        assert_eq!(fresh.len(), 2);
        assert!(recent.filter_new(vec![PeerEndpoint::new(addr(2), PeerSource::Tracker)]).is_empty());
    }
}
