use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::supervisor::sleep_cancellable;
use super::{TorrentSession, TorrentStatus, TrackerConnectionStatus};

// Periodic regular announces with failure backoff. The first announce
// (event=started) happens outside this loop; each iteration here is an
// interval announce with an empty event.
pub(crate) async fn announce_loop(session: Arc<TorrentSession>, token: CancellationToken) {

    let mut consecutive_failures: u32 = 0;
    let mut delay = session.config().network.announce_interval;

    loop {
        if !sleep_cancellable(&token, delay).await {
            return;
        }
        if session.status() == TorrentStatus::Paused {
            continue;
        }

        let torrent = session.torrent().await;
        let params = session.announce_params(None).await;
        let results = session.announcer().announce_all(&torrent, params).await;

        if results.is_empty() {
            // Nothing to announce to; peer discovery rides on DHT alone.
            session.set_tracker_status(TrackerConnectionStatus::Idle);
            delay = session.config().network.announce_interval;
            continue;
        }

        let outcome = session.announcer().aggregate(results);
        if outcome.all_failed() {
            consecutive_failures += 1;
            let network = outcome.network_failures > 0;
            let error = format!(
                "all {} tracker announce(s) failed ({} network)",
                outcome.failures, outcome.network_failures,
            );
            tracing::warn!("{} for {}", error, session.display_name());
            session.set_tracker_status(TrackerConnectionStatus::Error(error));
            delay = announce_backoff(consecutive_failures, network);
            continue;
        }

        consecutive_failures = 0;
        session.set_tracker_status(TrackerConnectionStatus::Connected);
        if !outcome.peers.is_empty() {
            session.handle_discovered_peers(outcome.peers).await;
        }

        let peer_count = session.active_peer_count().await;
        delay = session
            .announcer()
            .next_announce_interval(session.info_hash(), peer_count);
    }
}

// Backoff for a failing announce loop: network-class trouble retries from
// 30s, everything else from 60s, both capped at five minutes. Recovery
// snaps back to the adaptive interval.
pub(crate) fn announce_backoff(consecutive_failures: u32, network: bool) -> Duration {
    let n = consecutive_failures.max(1) - 1;
    let secs = if network {
        (30 * 2u64.pow(n.min(4))).min(300)
    } else {
        (60 * 2u64.pow(n.min(3))).min(300)
    };
    Duration::from_secs(secs)
}

// Lifecycle tick: watches the piece manager and peer layer for the
// transitions the state machine derives rather than commands, and drains
// the parked peer queue once the peer manager shows up.
pub(crate) async fn status_loop(session: Arc<TorrentSession>, token: CancellationToken) {

    let tick = session.config().network.status_tick_interval;
    loop {
        if !sleep_cancellable(&token, tick).await {
            return;
        }

        if session.checkpoint_failed() {
            session.set_status(TorrentStatus::Error).await;
            return;
        }

        match session.status() {
            TorrentStatus::Starting => {
                if session.is_complete() {
                    session.set_status(TorrentStatus::Seeding).await;
                } else if session.download_signals().await {
                    session.set_status(TorrentStatus::Downloading).await;
                }
            }
            TorrentStatus::Downloading => {
                if session.is_complete() {
                    session.set_status(TorrentStatus::Seeding).await;
                }
            }
            TorrentStatus::Stopped | TorrentStatus::Error => return,
            _ => {}
        }

        session.flush_queued_peers().await;
    }
}

impl TorrentSession {

    // Any sign of life from the download path moves starting -> downloading.
    pub(crate) async fn download_signals(&self) -> bool {
        if self.collaborators.piece_manager.is_downloading() {
            return true;
        }
        match self.peer_manager().await {
            Some(pm) => !pm.active_peers().is_empty() || pm.download_rate() > 0.0,
            None => false,
        }
    }
}
