//! HTTP(S) tracker announces.
//!
//! The announce is a GET whose query string carries the request fields;
//! `info_hash` and `peer_id` are raw bytes and are percent-encoded by
//! hand rather than pushed through a UTF-8 query serializer. The
//! response is a bencoded dictionary with peers in either the BEP 3
//! dict-list form or the BEP 23/BEP 7 compact forms.
use super::{
    unpack_peers, unpack_peers6, url_encode, AnnounceEvent, AnnounceResponse, TrackerError,
};
use crate::consts::{CLIENT, LEFT, NUMWANT};
use crate::core::Demagnetizer;
use crate::peer::Peer;
use crate::torrent::InfoHash;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::fmt;
use tracing::trace;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpTracker {
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> HttpTracker {
        HttpTracker { url }
    }

    pub(crate) fn connect<'a>(
        &'a self,
        app: &'a Demagnetizer,
    ) -> Result<HttpTrackerSession<'a>, TrackerError> {
        let client = reqwest::Client::builder().user_agent(CLIENT).build()?;
        Ok(HttpTrackerSession {
            tracker: self,
            app,
            client,
        })
    }
}

impl fmt::Display for HttpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<HTTPTracker {}>", self.url)
    }
}

pub(crate) struct HttpTrackerSession<'a> {
    tracker: &'a HttpTracker,
    app: &'a Demagnetizer,
    client: reqwest::Client,
}

impl HttpTrackerSession<'_> {
    pub(crate) async fn announce(
        &mut self,
        info_hash: InfoHash,
        event: AnnounceEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        let target = build_announce_url(&self.tracker.url, self.app, info_hash, event);
        trace!("announcing to {target}");
        let response = self.client.get(&target).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::BadStatus(status));
        }
        let body = response.bytes().await?;
        parse_response(&body).inspect_err(|e| {
            if !matches!(e, TrackerError::Failure(_)) {
                trace!("bad response from {}: {:?}", self.tracker, body);
            }
        })
    }
}

/// Appends the announce parameters to the tracker URL's existing query
/// string, with the fragment stripped.
fn build_announce_url(
    url: &Url,
    app: &Demagnetizer,
    info_hash: InfoHash,
    event: AnnounceEvent,
) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let mut params = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&numwant={}&key={}&compact=1",
        url_encode(info_hash.as_bytes()),
        url_encode(&app.peer_id),
        app.peer_port,
        LEFT,
        NUMWANT,
        app.key,
    );
    if let Some(value) = event.http_value() {
        params.push_str("&event=");
        params.push_str(value);
    }
    let sep = match url.query() {
        Some(query) if !query.is_empty() => "&",
        Some(_) => "",
        None => "?",
    };
    format!("{url}{sep}{params}")
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<ByteBuf>,
    #[serde(rename = "warning message")]
    warning_message: Option<ByteBuf>,
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<ByteBuf>,
    complete: Option<i64>,
    incomplete: Option<i64>,
    peers: Option<PeerList>,
    peers6: Option<ByteBuf>,
}

/// `peers` comes as either a list of dictionaries (BEP 3) or a packed
/// byte string of 6-byte records (BEP 23).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeerList {
    Compact(ByteBuf),
    Full(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
    #[serde(rename = "peer id")]
    peer_id: Option<ByteBuf>,
}

/// Parses a bencoded announce response body. Unknown fields and most
/// fields of the wrong type are discarded.
fn parse_response(content: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let raw: RawResponse = serde_bencode::from_bytes(content)
        .map_err(|e| TrackerError::BadResponse(format!("invalid bencoded data: {e}")))?;
    if let Some(failure) = raw.failure_reason {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(&failure).into_owned(),
        ));
    }
    let mut peers = match raw.peers {
        None => Vec::new(),
        Some(PeerList::Compact(packed)) => unpack_peers(&packed)?,
        Some(PeerList::Full(dicts)) => dicts
            .into_iter()
            .map(|dict| Peer {
                host: dict.ip,
                port: dict.port,
                id: dict.peer_id.map(ByteBuf::into_vec),
            })
            .collect(),
    };
    if let Some(packed) = raw.peers6 {
        peers.extend(unpack_peers6(&packed)?);
    }
    Ok(AnnounceResponse {
        interval: raw
            .interval
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or(1800),
        peers,
        warning_message: raw
            .warning_message
            .map(|w| String::from_utf8_lossy(&w).into_owned()),
        min_interval: raw.min_interval.and_then(|i| u32::try_from(i).ok()),
        tracker_id: raw.tracker_id.map(ByteBuf::into_vec),
        complete: raw.complete.and_then(|i| u32::try_from(i).ok()),
        incomplete: raw.incomplete.and_then(|i| u32::try_from(i).ok()),
        leechers: None,
        seeders: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_app() -> Demagnetizer {
        Demagnetizer::with_parts(crate::tracker::Key::new(0x2C545EDE), *b"-DM-0010-abcdefghijk", 60069)
    }

    #[test]
    fn builds_announce_url() {
        let url = Url::parse("http://tracker.example:8080/announce").unwrap();
        let info_hash: InfoHash = "4c3e215f9e50b06d708a74c9b0e66e08bce520aa".parse().unwrap();
        let target = build_announce_url(&url, &fixed_app(), info_hash, AnnounceEvent::Started);
        assert_eq!(
            target,
            "http://tracker.example:8080/announce?\
             info_hash=L%3E%21_%9EP%B0mp%8At%C9%B0%E6n%08%BC%E5%20%AA\
             &peer_id=-DM-0010-abcdefghijk&port=60069&uploaded=0&downloaded=0\
             &left=65535&numwant=50&key=2c545ede&compact=1&event=started"
        );
    }

    #[test]
    fn appends_to_existing_query_and_strips_fragment() {
        let url = Url::parse("http://tracker.example/announce?auth=letmein#frag").unwrap();
        let info_hash: InfoHash = "4c3e215f9e50b06d708a74c9b0e66e08bce520aa".parse().unwrap();
        let target = build_announce_url(&url, &fixed_app(), info_hash, AnnounceEvent::Announce);
        assert!(target.starts_with("http://tracker.example/announce?auth=letmein&info_hash="));
        assert!(!target.contains('#'));
        assert!(!target.contains("event="));
    }

    #[test]
    fn parses_compact_response_with_ipv6() {
        let response =
            parse_response(b"d8:intervali1800e5:peers6:iiiipp6:peers618:iiiiiiiiiiiiiiiippe")
                .unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].host, "105.105.105.105");
        assert_eq!(response.peers[0].port, 28784);
        assert_eq!(response.peers[1].host, "6969:6969:6969:6969:6969:6969:6969:6969");
        assert_eq!(response.peers[1].port, 28784);
    }

    #[test]
    fn parses_compact_response_with_stats() {
        let blob: &[u8] = b"d8:completei47e10:incompletei5e8:intervali1800e\
            12:min intervali1800e5:peers12:w\x94bls\xdf\xd8\xb4C,\x1a\xe1e";
        let response = parse_response(blob).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(47));
        assert_eq!(response.incomplete, Some(5));
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].host, "119.148.98.108");
        assert_eq!(response.peers[0].port, 29663);
        assert_eq!(response.peers[1].host, "216.180.67.44");
        assert_eq!(response.peers[1].port, 6881);
    }

    #[test]
    fn parses_dict_peer_list() {
        let blob: &[u8] = b"d8:intervali1800e5:peersl\
            d2:ip13:93.35.146.2127:peer id20:-TR3000-vfu1svh0ewb64:porti17218ee\
            d2:ip14:185.21.217.1084:porti57606eeee";
        let response = parse_response(blob).unwrap();
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].host, "93.35.146.212");
        assert_eq!(response.peers[0].port, 17218);
        assert_eq!(
            response.peers[0].id.as_deref(),
            Some(b"-TR3000-vfu1svh0ewb6".as_slice())
        );
        assert_eq!(response.peers[1].host, "185.21.217.108");
        assert!(response.peers[1].id.is_none());
    }

    #[test]
    fn failure_reason_wins() {
        let result = parse_response(b"d14:failure reason12:unregisterede");
        assert!(matches!(result, Err(TrackerError::Failure(msg)) if msg == "unregistered"));
    }

    #[test]
    fn carries_warning_through() {
        let response =
            parse_response(b"d8:intervali1800e5:peers0:15:warning message7:be kinde").unwrap();
        assert_eq!(response.warning_message.as_deref(), Some("be kind"));
        assert!(response.peers.is_empty());
    }

    #[test]
    fn defaults_interval_when_missing() {
        let response = parse_response(b"d5:peers0:e").unwrap();
        assert_eq!(response.interval, 1800);
    }

    #[test]
    fn rejects_malformed_peer_blocks() {
        // "peers6" whose length is not a multiple of 18.
        let blob: &[u8] = b"d8:completei45e10:downloadedi8384e10:incompletei4e\
            8:intervali900e12:min intervali300e6:peers66:\x00\x00\x00\x00\x00\x00\
            10:tracker id7:AniRenae";
        assert!(matches!(parse_response(blob), Err(TrackerError::BadResponse(_))));
        assert!(parse_response(b"not bencode").is_err());
    }
}
