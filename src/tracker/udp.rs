//! UDP tracker announces (BEP 15), with BEP 41 URL-data and BEP 7 IPv6
//! peer lists.
//!
//! The exchange is connect-then-announce over a connected UDP socket.
//! Datagrams are retransmitted on a `15 * 2^n` second schedule with `n`
//! clamped at 8; responses that fail to parse or carry the wrong
//! transaction ID are discarded and the message resent, since packets
//! from earlier attempts may arrive late. A connection ID is only good
//! for 60 seconds; if it expires mid-announce the session silently
//! reconnects and starts the announce over.
use super::{
    make_transaction_id, unpack_peers, unpack_peers6, AnnounceEvent, AnnounceResponse, Key,
    TrackerError,
};
use crate::consts::{LEFT, NUMWANT};
use crate::core::Demagnetizer;
use crate::torrent::InfoHash;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, trace};
use url::Url;

pub(crate) const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

/// How long a connection ID stays valid after the connect exchange.
const CONNECTION_LIFETIME: Duration = Duration::from_secs(60);

/// BEP 41 option type for URL data.
const OPTION_URLDATA: u8 = 0x2;

#[derive(Debug, Clone)]
pub struct UdpTracker {
    url: Url,
    host: String,
    port: u16,
}

impl UdpTracker {
    pub fn new(url: Url) -> Result<UdpTracker, TrackerError> {
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::InvalidUrl("URL missing host".into()))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| TrackerError::InvalidUrl("URL missing port".into()))?;
        Ok(UdpTracker { url, host, port })
    }

    /// The BEP 41 URL data for this tracker: path plus query, if any.
    fn url_data(&self) -> String {
        let mut data = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            data.push('?');
            data.push_str(query);
        }
        data
    }

    pub(crate) async fn connect<'a>(
        &'a self,
        app: &'a Demagnetizer,
    ) -> Result<UdpTrackerSession<'a>, TrackerError> {
        let remote = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or(TrackerError::Unresolvable)?;
        let local: std::net::SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().map_err(|_| TrackerError::Unresolvable)?
        } else {
            "0.0.0.0:0".parse().map_err(|_| TrackerError::Unresolvable)?
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(UdpTrackerSession {
            tracker: self,
            app,
            is_ipv6: remote.is_ipv6(),
            socket,
            connection: None,
        })
    }
}

impl fmt::Display for UdpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<UDPTracker {}>", self.url)
    }
}

/// A connection ID handed out by the tracker, and when it lapses.
#[derive(Debug, Clone, Copy)]
struct Connection {
    id: u64,
    expires: Instant,
}

pub(crate) struct UdpTrackerSession<'a> {
    tracker: &'a UdpTracker,
    app: &'a Demagnetizer,
    is_ipv6: bool,
    socket: UdpSocket,
    connection: Option<Connection>,
}

/// Outcome of a single send/receive exchange.
enum Exchange<T> {
    Ok(T),
    /// The connection ID lapsed before the tracker answered.
    Expired,
    Failed(TrackerError),
}

impl UdpTrackerSession<'_> {
    pub(crate) async fn announce(
        &mut self,
        info_hash: InfoHash,
        event: AnnounceEvent,
    ) -> Result<AnnounceResponse, TrackerError> {
        loop {
            let connection = match self.connection {
                Some(connection) => connection,
                None => self.establish_connection().await?,
            };
            let transaction_id = make_transaction_id();
            let packet = build_announce_request(&UdpAnnounceFields {
                transaction_id,
                connection_id: connection.id,
                info_hash,
                peer_id: &self.app.peer_id,
                peer_port: self.app.peer_port,
                key: self.app.key,
                event,
                downloaded: 0,
                uploaded: 0,
                left: LEFT,
                numwant: NUMWANT,
                urldata: &self.tracker.url_data(),
            });
            let is_ipv6 = self.is_ipv6;
            let exchange = self
                .send_receive(&packet, Some(connection.expires), |resp| {
                    parse_announce_response(transaction_id, resp, is_ipv6)
                })
                .await;
            match exchange {
                Exchange::Ok(response) => {
                    info!("{} returned {} peers", self.tracker, response.peers.len());
                    return Ok(response);
                }
                Exchange::Expired => {
                    trace!("connection to {} timed out; restarting", self.tracker);
                    self.connection = None;
                }
                Exchange::Failed(e) => return Err(e),
            }
        }
    }

    async fn establish_connection(&mut self) -> Result<Connection, TrackerError> {
        let transaction_id = make_transaction_id();
        let packet = build_connect_request(transaction_id);
        let exchange = self
            .send_receive(&packet, None, |resp| {
                parse_connect_response(transaction_id, resp)
            })
            .await;
        match exchange {
            Exchange::Ok(id) => {
                let connection = Connection {
                    id,
                    expires: Instant::now() + CONNECTION_LIFETIME,
                };
                self.connection = Some(connection);
                Ok(connection)
            }
            Exchange::Expired => Err(TrackerError::Timeout),
            Exchange::Failed(e) => Err(e),
        }
    }

    /// Sends `msg` and waits for a response `parse` accepts, resending on
    /// the BEP 15 backoff schedule. Unparseable responses are discarded;
    /// an error packet from the tracker ends the exchange for good.
    async fn send_receive<T, F>(
        &self,
        msg: &[u8],
        deadline: Option<Instant>,
        parse: F,
    ) -> Exchange<T>
    where
        F: Fn(&[u8]) -> Result<UdpReply<T>, UdpParseError>,
    {
        let exchange = async {
            // TODO: Should the retry counter remember timeouts from previous
            // connections and connection attempts?
            let mut n: u32 = 0;
            let mut buf = vec![0u8; 8192];
            loop {
                trace!("sending {} bytes to {}", msg.len(), self.tracker);
                if let Err(e) = self.socket.send(msg).await {
                    return Exchange::Failed(TrackerError::Io(e));
                }
                let received =
                    match timeout(Duration::from_secs(15 << n), self.socket.recv(&mut buf)).await {
                        Err(_) => {
                            trace!("{} did not reply in time; resending message", self.tracker);
                            if n < 8 {
                                n += 1;
                            }
                            continue;
                        }
                        Ok(Err(e)) => return Exchange::Failed(TrackerError::Io(e)),
                        Ok(Ok(received)) => received,
                    };
                match parse(&buf[..received]) {
                    Err(e) => {
                        trace!("response from {} was invalid, will resend: {e}", self.tracker);
                        continue;
                    }
                    Ok(UdpReply::Failure(message)) => {
                        return Exchange::Failed(TrackerError::Failure(message));
                    }
                    Ok(UdpReply::Parsed(value)) => return Exchange::Ok(value),
                }
            }
        };
        match deadline {
            None => exchange.await,
            Some(deadline) => match timeout_at(deadline, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => Exchange::Expired,
            },
        }
    }
}

/// A structurally valid tracker response: either the parsed value or the
/// error message of an `action = 3` packet.
#[derive(Debug)]
enum UdpReply<T> {
    Parsed(T),
    Failure(String),
}

/// A response that must be discarded, with the socket kept waiting.
#[derive(Debug, Error, PartialEq, Eq)]
enum UdpParseError {
    #[error("packet too short")]
    Short,

    #[error("transaction ID mismatch: expected {expected}, got {got}")]
    TransactionId { expected: i32, got: i32 },

    #[error("action mismatch: expected {expected}, got {got}")]
    Action { expected: i32, got: i32 },

    #[error("invalid peers list")]
    Peers,
}

struct UdpAnnounceFields<'a> {
    transaction_id: i32,
    connection_id: u64,
    info_hash: InfoHash,
    peer_id: &'a [u8; 20],
    peer_port: u16,
    key: Key,
    event: AnnounceEvent,
    downloaded: u64,
    uploaded: u64,
    left: u64,
    numwant: u32,
    urldata: &'a str,
}

fn build_connect_request(transaction_id: i32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.put_u64(PROTOCOL_ID);
    packet.put_i32(ACTION_CONNECT);
    packet.put_i32(transaction_id);
    packet
}

fn build_announce_request(fields: &UdpAnnounceFields<'_>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98 + fields.urldata.len());
    packet.put_u64(fields.connection_id);
    packet.put_i32(ACTION_ANNOUNCE);
    packet.put_i32(fields.transaction_id);
    packet.put_slice(fields.info_hash.as_bytes());
    packet.put_slice(fields.peer_id);
    packet.put_u64(fields.downloaded);
    packet.put_u64(fields.left);
    packet.put_u64(fields.uploaded);
    packet.put_u32(fields.event.udp_value());
    packet.put_u32(0); // IP address: default to the sender's
    packet.put_slice(&fields.key.to_be_bytes());
    packet.put_u32(fields.numwant);
    packet.put_u16(fields.peer_port);
    // BEP 41: the URL's path and query ride along as options, split into
    // chunks of at most 255 bytes.
    for chunk in fields.urldata.as_bytes().chunks(255) {
        packet.put_u8(OPTION_URLDATA);
        packet.put_u8(chunk.len() as u8);
        packet.put_slice(chunk);
    }
    packet
}

/// Picks an `action = 3` error message out of a response, if that is
/// what it is.
fn get_error_response(resp: &[u8]) -> Result<Option<String>, UdpParseError> {
    if resp.len() < 8 {
        return Err(UdpParseError::Short);
    }
    let mut cursor = Cursor::new(resp);
    let action = cursor.read_i32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    if action == ACTION_ERROR {
        Ok(Some(String::from_utf8_lossy(&resp[8..]).into_owned()))
    } else {
        Ok(None)
    }
}

fn parse_connect_response(
    transaction_id: i32,
    resp: &[u8],
) -> Result<UdpReply<u64>, UdpParseError> {
    if let Some(message) = get_error_response(resp)? {
        return Ok(UdpReply::Failure(message));
    }
    if resp.len() < 16 {
        return Err(UdpParseError::Short);
    }
    let mut cursor = Cursor::new(resp);
    let action = cursor.read_i32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let got = cursor.read_i32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let connection_id = cursor.read_u64::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    if got != transaction_id {
        return Err(UdpParseError::TransactionId {
            expected: transaction_id,
            got,
        });
    }
    if action != ACTION_CONNECT {
        return Err(UdpParseError::Action {
            expected: ACTION_CONNECT,
            got: action,
        });
    }
    Ok(UdpReply::Parsed(connection_id))
}

fn parse_announce_response(
    transaction_id: i32,
    resp: &[u8],
    is_ipv6: bool,
) -> Result<UdpReply<AnnounceResponse>, UdpParseError> {
    if let Some(message) = get_error_response(resp)? {
        return Ok(UdpReply::Failure(message));
    }
    if resp.len() < 20 {
        return Err(UdpParseError::Short);
    }
    let mut cursor = Cursor::new(resp);
    let action = cursor.read_i32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let got = cursor.read_i32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let interval = cursor.read_u32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let leechers = cursor.read_u32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    let seeders = cursor.read_u32::<BigEndian>().map_err(|_| UdpParseError::Short)?;
    if got != transaction_id {
        return Err(UdpParseError::TransactionId {
            expected: transaction_id,
            got,
        });
    }
    if action != ACTION_ANNOUNCE {
        return Err(UdpParseError::Action {
            expected: ACTION_ANNOUNCE,
            got: action,
        });
    }
    let peers = if is_ipv6 {
        unpack_peers6(&resp[20..])
    } else {
        unpack_peers(&resp[20..])
    }
    .map_err(|_| UdpParseError::Peers)?;
    Ok(UdpReply::Parsed(AnnounceResponse {
        interval,
        peers,
        leechers: Some(leechers),
        seeders: Some(seeders),
        ..AnnounceResponse::default()
    }))
}
