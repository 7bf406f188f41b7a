//! Tracker announces over both supported transports.
//!
//! A [`Tracker`] is parsed from an announce URL and dispatches on its
//! scheme: `http`/`https` announces are query-string GETs with bencoded
//! responses, `udp` follows the BEP 15 connect/announce exchange. Both
//! share the announce contract: a `started` announce bounded by
//! [`TRACKER_TIMEOUT`](crate::consts::TRACKER_TIMEOUT), discovered peers
//! streamed to the session, and a best-effort `stopped` announce on the
//! way out that upstream cancellation cannot suppress.
use crate::consts::{TRACKER_STOP_TIMEOUT, TRACKER_TIMEOUT};
use crate::core::Demagnetizer;
use crate::peer::Peer;
use crate::torrent::InfoHash;
use rand::Rng;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use url::Url;

pub mod http;
pub mod udp;

pub use http::HttpTracker;
pub use udp::UdpTracker;

/// The random per-process key sent with every announce so a tracker can
/// correlate our requests across IP changes. Rendered as 8 hex digits in
/// query strings and as 4 big-endian bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(u32);

impl Key {
    pub fn generate() -> Key {
        Key(rand::rng().random())
    }

    pub fn new(value: u32) -> Key {
        Key(value)
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// The event slot of an announce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A regular announce; carries no event on the wire.
    Announce,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    pub fn udp_value(self) -> u32 {
        match self {
            AnnounceEvent::Announce => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }

    pub fn http_value(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Announce => None,
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }
}

/// What a tracker told us in response to an announce. HTTP trackers fill
/// the `complete`/`incomplete` pair, UDP trackers the
/// `leechers`/`seeders` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub peers: Vec<Peer>,
    pub warning_message: Option<String>,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<Vec<u8>>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub leechers: Option<u32>,
    pub seeders: Option<u32>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker URL scheme {0:?}")]
    UnsupportedScheme(String),

    /// The tracker itself reported a failure (HTTP `failure reason` or a
    /// UDP error packet). Retrying is pointless.
    #[error("tracker replied with failure: {0}")]
    Failure(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request to tracker returned {0}")]
    BadStatus(reqwest::StatusCode),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not resolve tracker host")]
    Unresolvable,

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("announce timed out")]
    Timeout,
}

/// A tracker from a magnet link, keyed by URL scheme.
#[derive(Debug, Clone)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Tracker, TrackerError> {
        let parsed = Url::parse(url).map_err(|e| TrackerError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Tracker::Http(HttpTracker::new(parsed))),
            "udp" => Ok(Tracker::Udp(UdpTracker::new(parsed)?)),
            scheme => Err(TrackerError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// Announces to this tracker and streams the peers it returns into
    /// `sink`. Any error is logged and swallowed: one bad tracker must
    /// not take the whole session down.
    pub async fn get_peers(
        &self,
        app: &Demagnetizer,
        info_hash: InfoHash,
        sink: mpsc::Sender<Peer>,
        mut cancel: watch::Receiver<bool>,
    ) {
        debug!("requesting peers for {info_hash} from {self}");
        if let Err(e) = self.run(app, info_hash, &sink, &mut cancel).await {
            warn!("error announcing to {self} for {info_hash}: {e}");
        }
    }

    async fn run(
        &self,
        app: &Demagnetizer,
        info_hash: InfoHash,
        sink: &mpsc::Sender<Peer>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TrackerError> {
        let announced = tokio::select! {
            outcome = timeout(TRACKER_TIMEOUT, async {
                let mut session = self.connect(app).await?;
                let response = session.announce(info_hash, AnnounceEvent::Started).await?;
                Ok::<_, TrackerError>((session, response))
            }) => match outcome {
                Ok(inner) => inner?,
                Err(_) => return Err(TrackerError::Timeout),
            },
            _ = cancel.changed() => {
                trace!("{self}: cancelled before announce completed");
                return Ok(());
            }
        };
        let (mut session, response) = announced;
        if let Some(warning) = &response.warning_message {
            warn!("{self} replied with warning: {warning}");
        }
        info!("{self} returned {} peers", response.peers.len());
        for peer in response.peers {
            if sink.send(peer).await.is_err() {
                // The session stopped listening; the goodbye still goes out.
                break;
            }
        }
        match timeout(
            TRACKER_STOP_TIMEOUT,
            session.announce(info_hash, AnnounceEvent::Stopped),
        )
        .await
        {
            Ok(Ok(_)) => trace!("sent stopped announce to {self}"),
            Ok(Err(e)) => trace!("stopped announce to {self} failed: {e}"),
            Err(_) => trace!("stopped announce to {self} timed out"),
        }
        Ok(())
    }

    async fn connect<'a>(
        &'a self,
        app: &'a Demagnetizer,
    ) -> Result<TrackerSession<'a>, TrackerError> {
        match self {
            Tracker::Http(tracker) => Ok(TrackerSession::Http(tracker.connect(app)?)),
            Tracker::Udp(tracker) => Ok(TrackerSession::Udp(tracker.connect(app).await?)),
        }
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracker::Http(tracker) => write!(f, "{tracker}"),
            Tracker::Udp(tracker) => write!(f, "{tracker}"),
        }
    }
}

pub(crate) enum TrackerSession<'a> {
    Http(http::HttpTrackerSession<'a>),
    Udp(udp::UdpTrackerSession<'a>),
}

impl TrackerSession<'_> {
    async fn announce(
        &mut self,
        info_hash: InfoHash,
        event: AnnounceEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            TrackerSession::Http(session) => session.announce(info_hash, event).await,
            TrackerSession::Udp(session) => session.announce(info_hash, event).await,
        }
    }
}

pub(crate) fn make_transaction_id() -> i32 {
    rand::rng().random()
}

/// Unpacks a BEP 23 compact peer list: 6 bytes per peer, IPv4 address
/// then big-endian port.
pub(crate) fn unpack_peers(data: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if data.len() % 6 != 0 {
        return Err(TrackerError::BadResponse("invalid 'peers' list".into()));
    }
    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer::new(ip.to_string(), port)
        })
        .collect())
}

/// Unpacks a BEP 7 compact IPv6 peer list: 16 address bytes then port.
pub(crate) fn unpack_peers6(data: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if data.len() % 18 != 0 {
        return Err(TrackerError::BadResponse("invalid 'peers6' list".into()));
    }
    Ok(data
        .chunks_exact(18)
        .map(|chunk| {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            Peer::new(Ipv6Addr::from(addr).to_string(), port)
        })
        .collect())
}

/// Percent-encodes raw bytes for a query string, leaving only RFC 3986
/// unreserved characters as-is. `info_hash` and `peer_id` are raw
/// 20-byte values and cannot go through a UTF-8 encoder.
pub(crate) fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}
