//! Per-magnet orchestration: race every tracker and every discovered
//! peer, take the first validated info dictionary, and tear the rest
//! down.
//!
//! One task scope per magnet: a task per tracker URL feeding a bounded
//! peer channel, a worker task per novel peer gated by a semaphore, and
//! a single-slot result channel the workers race to fill. Cancellation
//! flows through a watch channel so tracker tasks can still deliver
//! their courtesy `stopped` announce before exiting.
use crate::bencode::Bencode;
use crate::consts::PEERS_PER_MAGNET_LIMIT;
use crate::core::Demagnetizer;
use crate::magnet::Magnet;
use crate::peer::{Peer, PeerAddress};
use crate::torrent::InfoHash;
use crate::tracker::Tracker;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How many discovered peers may sit unclaimed between the tracker tasks
/// and the orchestrator.
const PEER_BUFFER: usize = 64;

/// Terminal failure for one magnet; everything below it is logged and
/// absorbed.
#[derive(Debug, Error)]
pub enum DemagnetizeError {
    #[error("cannot fetch info for info hash {0}: no trackers in magnet link")]
    NoTrackers(InfoHash),

    #[error("could not fetch info for {0}")]
    NoInfo(InfoHash),
}

/// Coordinator for a single magnet.
pub struct TorrentSession<'a> {
    app: &'a Demagnetizer,
    magnet: &'a Magnet,
}

impl<'a> TorrentSession<'a> {
    pub fn new(app: &'a Demagnetizer, magnet: &'a Magnet) -> TorrentSession<'a> {
        TorrentSession { app, magnet }
    }

    /// Fetches the magnet's info dictionary from the swarm.
    ///
    /// Returns as soon as one peer delivers an info dict whose SHA-1
    /// matches the magnet's info hash; every other tracker task and peer
    /// worker is cancelled and joined before this returns.
    pub async fn get_info(&self) -> Result<Bencode, DemagnetizeError> {
        let info_hash = self.magnet.info_hash;
        if self.magnet.trackers.is_empty() {
            return Err(DemagnetizeError::NoTrackers(info_hash));
        }
        match &self.magnet.display_name {
            Some(name) => info!("fetching info for info hash {info_hash} ({name})"),
            None => info!("fetching info for info hash {info_hash}"),
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (peer_tx, mut peer_rx) = mpsc::channel::<Peer>(PEER_BUFFER);
        let mut trackers: JoinSet<()> = JoinSet::new();
        for url in &self.magnet.trackers {
            match Tracker::from_url(url) {
                Ok(tracker) => {
                    let app = self.app.clone();
                    let sink = peer_tx.clone();
                    let cancel = cancel_rx.clone();
                    trackers.spawn(async move {
                        tracker.get_peers(&app, info_hash, sink, cancel).await;
                    });
                }
                Err(e) => warn!("{url}: {e}"),
            }
        }
        // Tracker tasks hold the only senders now; the peer channel
        // closes when the last of them finishes.
        drop(peer_tx);

        let (info_tx, mut info_rx) = mpsc::channel::<Bencode>(1);
        let mut info_tx = Some(info_tx);
        let limit = Arc::new(Semaphore::new(PEERS_PER_MAGNET_LIMIT));
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut peers_seen: HashSet<PeerAddress> = HashSet::new();

        let found = loop {
            tokio::select! {
                maybe_peer = peer_rx.recv(), if info_tx.is_some() => {
                    match maybe_peer {
                        Some(peer) => {
                            if let Some(sender) = &info_tx {
                                if peers_seen.insert(peer.address()) {
                                    workers.spawn(peer_task(
                                        self.app.clone(),
                                        peer,
                                        info_hash,
                                        limit.clone(),
                                        sender.clone(),
                                    ));
                                } else {
                                    debug!("{peer} returned by multiple trackers; skipping");
                                }
                            }
                        }
                        // All trackers are done; drop our result sender so
                        // the channel closes once the last worker exits.
                        None => info_tx = None,
                    }
                }
                maybe_info = info_rx.recv() => break maybe_info,
            }
        };

        // First result wins; cancel the whole scope and wait everything
        // out so no task outlives the session.
        let _ = cancel_tx.send(true);
        drop(peer_rx);
        workers.shutdown().await;
        while trackers.join_next().await.is_some() {}
        found.ok_or(DemagnetizeError::NoInfo(info_hash))
    }
}

/// One peer worker: run the full peer-wire exchange and push a validated
/// info dict into the result slot. Peer failures are logged, nothing
/// more.
async fn peer_task(
    app: Demagnetizer,
    peer: Peer,
    info_hash: InfoHash,
    limit: Arc<Semaphore>,
    sender: mpsc::Sender<Bencode>,
) {
    let Ok(_permit) = limit.acquire().await else {
        return;
    };
    match peer.get_info(&app, info_hash).await {
        Ok(info) => {
            info!("received info from {peer}");
            let _ = sender.send(info).await;
        }
        Err(e) => warn!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testutil::{spawn_fake_peer, FakePeerScript};
    use crate::torrent::InfoHash;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A one-endpoint HTTP tracker that answers every announce with the
    /// same bencoded body, then exits.
    async fn spawn_fake_http_tracker(body: Vec<u8>, announces: usize) -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            for _ in 0..announces {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len(),
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            }
        });
        (port, handle)
    }

    fn compact_announce_body(peer_addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = peer_addr else {
            panic!("fake peer should listen on IPv4 loopback");
        };
        let mut packed = v4.ip().octets().to_vec();
        packed.extend_from_slice(&v4.port().to_be_bytes());
        Bencode::Dict(BTreeMap::from([
            (b"interval".to_vec(), Bencode::Int(1800)),
            (b"peers".to_vec(), Bencode::Bytes(packed)),
        ]))
        .to_bytes()
    }

    #[tokio::test]
    async fn fetches_info_end_to_end() {
        let info = Bencode::Dict(BTreeMap::from([
            (b"length".to_vec(), Bencode::Int(1048576)),
            (b"name".to_vec(), Bencode::from("example")),
            (b"piece length".to_vec(), Bencode::Int(262144)),
            (b"pieces".to_vec(), Bencode::Bytes(vec![0x5A; 80])),
        ]));
        let info_bytes = info.to_bytes();
        let info_hash = InfoHash::of_info(&info_bytes);
        let (peer_addr, peer_server) =
            spawn_fake_peer(info_bytes.clone(), FakePeerScript::ServeMetadata).await;
        // Expect the started announce and the courtesy stopped announce.
        let (tracker_port, tracker_server) =
            spawn_fake_http_tracker(compact_announce_body(peer_addr), 2).await;
        let magnet = Magnet {
            info_hash,
            display_name: Some("example".into()),
            trackers: vec![format!("http://127.0.0.1:{tracker_port}/announce")],
        };
        let app = Demagnetizer::new();
        let session = TorrentSession::new(&app, &magnet);
        let fetched = session.get_info().await.unwrap();
        assert_eq!(fetched, info);
        assert_eq!(InfoHash::of_info(&fetched.to_bytes()), info_hash);
        tracker_server.await.unwrap();
        peer_server.await.unwrap();
    }

    #[tokio::test]
    async fn fails_without_trackers() {
        let app = Demagnetizer::new();
        let magnet: Magnet = "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84"
            .parse()
            .unwrap();
        let session = TorrentSession::new(&app, &magnet);
        assert!(matches!(
            session.get_info().await,
            Err(DemagnetizeError::NoTrackers(_))
        ));
    }

    #[tokio::test]
    async fn fails_when_no_tracker_yields_peers() {
        let app = Demagnetizer::new();
        // An unsupported scheme is rejected before any network I/O, so
        // the session runs out of peer sources immediately.
        let magnet: Magnet = "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84\
             &tr=wss%3A%2F%2Ftracker.example"
            .parse()
            .unwrap();
        let session = TorrentSession::new(&app, &magnet);
        assert!(matches!(
            session.get_info().await,
            Err(DemagnetizeError::NoInfo(_))
        ));
    }
}
