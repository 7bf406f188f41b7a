//! Peer wire protocol: connecting to a peer, handshaking, and pulling
//! the info dictionary over BEP 9.
//!
//! A connection is driven by a single message loop. Base-protocol
//! traffic we have no use for (chokes, bitfields, piece data and the
//! like) is absorbed; everything else either advances the metadata
//! exchange or kills the connection.
use crate::bencode::{self, Bencode, BencodeError};
use crate::consts::{CLIENT, KEEPALIVE_PERIOD, MAX_PEER_MSG_LEN, PEER_HANDSHAKE_TIMEOUT};
use crate::core::Demagnetizer;
use crate::torrent::{piecer::PieceError, InfoHash, InfoPiecer};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

pub mod extensions;
pub mod handshake;
pub mod messages;

use extensions::{Bep10Extension, Bep10Registry, Extension, ExtensionSet};
use handshake::{Handshake, HANDSHAKE_LEN};
use messages::{Bep9Message, Bep9MsgType, ExtendedHandshake, ExtendedMessage, Message, MessageError};

/// A peer address discovered through a tracker. The optional ID is
/// whatever the tracker reported; it plays no part in equality.
#[derive(Debug, Clone)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub id: Option<Vec<u8>>,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Peer {}

/// Key used to de-duplicate peers across trackers.
pub type PeerAddress = (String, u16);

impl Peer {
    pub fn new(host: String, port: u16) -> Peer {
        Peer {
            host,
            port,
            id: None,
        }
    }

    pub fn address(&self) -> PeerAddress {
        (self.host.clone(), self.port)
    }

    /// Runs the complete exchange against this peer: connect, handshake,
    /// fetch the info dictionary, and validate it against `info_hash`.
    pub async fn get_info(
        &self,
        app: &Demagnetizer,
        info_hash: InfoHash,
    ) -> Result<Bencode, PeerError> {
        info!("requesting info for {info_hash} from {self}");
        let mut conn =
            match timeout(PEER_HANDSHAKE_TIMEOUT, PeerConnection::open(self, app, info_hash)).await
            {
                Ok(conn) => conn?,
                Err(_) => return Err(self.err(info_hash, PeerErrorKind::ConnectTimeout)),
            };
        conn.get_metadata_info().await
    }

    fn err(&self, info_hash: InfoHash, kind: PeerErrorKind) -> PeerError {
        PeerError {
            peer: self.to_string(),
            info_hash,
            kind,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error communicating with a single peer. Always local to that peer:
/// the session logs it and moves on.
#[derive(Debug, Error)]
#[error("error communicating with {peer} for {info_hash}: {kind}")]
pub struct PeerError {
    pub peer: String,
    pub info_hash: InfoHash,
    pub kind: PeerErrorKind,
}

#[derive(Debug, Error)]
pub enum PeerErrorKind {
    #[error("could not connect to peer in time")]
    ConnectTimeout,

    #[error("communication error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection early")]
    ClosedEarly,

    #[error("peer sent bad handshake: {0}")]
    BadHandshake(#[from] handshake::HandshakeError),

    #[error("peer replied with wrong info hash (got {0})")]
    WrongInfoHash(InfoHash),

    #[error("peer does not support BEP 10 extensions")]
    NoExtensionProtocol,

    #[error("peer does not support metadata transfer")]
    NoMetadataExtension,

    #[error("peer did not report info size in extended handshake")]
    NoMetadataSize,

    #[error("peer tried to send overly large message of {0} bytes; not trusting")]
    OversizedMessage(u32),

    #[error("peer sent invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("peer sent unexpected message: {0}")]
    Unexpected(String),

    #[error("peer rejected request for info piece {0}")]
    PieceRejected(u32),

    #[error("received data for info piece {got}, which we did not request (wanted {wanted})")]
    WrongPiece { got: u32, wanted: u32 },

    #[error("'total_size' in info data message ({got}) differs from handshake value ({expected})")]
    TotalSizeMismatch { got: u64, expected: u64 },

    #[error("bad info piece: {0}")]
    BadPiece(#[from] PieceError),

    #[error("received info with invalid digest; expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("received invalid bencoded data as info: {0}")]
    InvalidInfo(#[from] BencodeError),

    #[error("received bencoded non-dict as info")]
    InfoNotDict,
}

/// The extensions we advertise in the handshake's reserved bits.
fn supported_extensions() -> ExtensionSet {
    [Extension::Bep10, Extension::Fast].into_iter().collect()
}

/// An established connection to a peer, post TCP connect and handshake.
struct PeerConnection {
    peer: Peer,
    info_hash: InfoHash,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    /// Bytes received but not yet framed into a message.
    read_buf: BytesMut,
    local_registry: Bep10Registry,
    remote_registry: Bep10Registry,
    extensions: ExtensionSet,
    keepalive: Interval,
}

impl PeerConnection {
    async fn open(
        peer: &Peer,
        app: &Demagnetizer,
        info_hash: InfoHash,
    ) -> Result<PeerConnection, PeerError> {
        debug!("connecting to {peer}");
        let stream = TcpStream::connect((peer.host.as_str(), peer.port))
            .await
            .map_err(|e| peer.err(info_hash, PeerErrorKind::Io(e)))?;
        trace!("connected to {peer}");
        let (read_half, write_half) = stream.into_split();
        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut conn = PeerConnection {
            peer: peer.clone(),
            info_hash,
            reader: read_half,
            writer: write_half,
            read_buf: BytesMut::with_capacity(8 * 1024),
            local_registry: Bep10Registry::local(),
            remote_registry: Bep10Registry::new(),
            extensions: ExtensionSet::default(),
            keepalive,
        };
        conn.handshake(app).await?;
        Ok(conn)
    }

    fn err(&self, kind: PeerErrorKind) -> PeerError {
        self.peer.err(self.info_hash, kind)
    }

    /// Exchanges handshakes and records the extension set both sides
    /// support. Fails unless the peer speaks BEP 10; without it there is
    /// no way to ask for metadata.
    async fn handshake(&mut self, app: &Demagnetizer) -> Result<(), PeerError> {
        trace!("sending handshake to {}", self.peer);
        let ours = Handshake {
            extensions: supported_extensions(),
            info_hash: self.info_hash,
            peer_id: app.peer_id,
        };
        self.write_all(&ours.encode()).await?;
        let mut buf = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut buf).await?;
        let theirs = Handshake::parse(&buf).map_err(|e| self.err(e.into()))?;
        trace!("{} sent handshake; extensions: {}", self.peer, theirs.extensions);
        if theirs.info_hash != self.info_hash {
            return Err(self.err(PeerErrorKind::WrongInfoHash(theirs.info_hash)));
        }
        self.extensions = supported_extensions() & theirs.extensions;
        if !self.extensions.contains(Extension::Bep10) {
            return Err(self.err(PeerErrorKind::NoExtensionProtocol));
        }
        let handshake = ExtendedHandshake {
            extensions: self.local_registry.clone(),
            client: Some(CLIENT.to_string()),
            metadata_size: None,
        };
        self.send(&Message::Extended(ExtendedMessage::Handshake(handshake)))
            .await?;
        if self.extensions.contains(Extension::Fast) {
            self.send(&Message::HaveNone).await?;
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        match self.writer.write_all(bytes).await {
            Ok(()) => {
                self.keepalive.reset();
                Ok(())
            }
            Err(e) if is_disconnect(&e) => Err(self.err(PeerErrorKind::ClosedEarly)),
            Err(e) => Err(self.err(PeerErrorKind::Io(e))),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PeerError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if is_disconnect(&e) => Err(self.err(PeerErrorKind::ClosedEarly)),
            Err(e) => Err(self.err(PeerErrorKind::Io(e))),
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<(), PeerError> {
        trace!("sending to {}: {}", self.peer, msg);
        let frame = msg
            .encode(&self.remote_registry)
            .map_err(|e| self.err(e.into()))?;
        self.write_all(&frame).await
    }

    /// Reads the next message, emitting keepalives whenever our side of
    /// the connection has been idle for a full period.
    ///
    /// Incoming bytes accumulate in `read_buf` and are framed from
    /// there; `read_buf()` appends whole reads, so losing the race
    /// against the keepalive timer never drops partial frames.
    async fn receive(&mut self) -> Result<Message, PeerError> {
        loop {
            match take_frame(&mut self.read_buf) {
                Ok(Some(None)) => {
                    trace!("{} sent keepalive", self.peer);
                    continue;
                }
                Ok(Some(Some(body))) => {
                    let msg = Message::decode(&body, &self.local_registry)
                        .map_err(|e| self.err(e.into()))?;
                    trace!("{} sent message: {}", self.peer, msg);
                    return Ok(msg);
                }
                Ok(None) => {}
                Err(length) => return Err(self.err(PeerErrorKind::OversizedMessage(length))),
            }
            tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => {
                    match read {
                        Ok(0) => return Err(self.err(PeerErrorKind::ClosedEarly)),
                        Ok(_) => {}
                        Err(e) if is_disconnect(&e) => {
                            return Err(self.err(PeerErrorKind::ClosedEarly));
                        }
                        Err(e) => return Err(self.err(PeerErrorKind::Io(e))),
                    }
                }
                _ = self.keepalive.tick() => {
                    trace!("sending keepalive to {}", self.peer);
                    match self.writer.write_all(&0u32.to_be_bytes()).await {
                        Ok(()) => {}
                        Err(e) if is_disconnect(&e) => {
                            return Err(self.err(PeerErrorKind::ClosedEarly));
                        }
                        Err(e) => return Err(self.err(PeerErrorKind::Io(e))),
                    }
                }
            }
        }
    }

    /// Waits out the stream until the peer's first extended handshake.
    async fn extended_handshake(&mut self) -> Result<ExtendedHandshake, PeerError> {
        loop {
            match self.receive().await? {
                Message::Extended(ExtendedMessage::Handshake(handshake)) => {
                    debug!(
                        "{} sent extended handshake; ut_metadata: {:?}; client: {:?}",
                        self.peer,
                        handshake.extensions.code_for(Bep10Extension::Metadata),
                        handshake.client,
                    );
                    return Ok(handshake);
                }
                msg if is_ignored(&msg) => {}
                msg => return Err(self.err(PeerErrorKind::Unexpected(msg.to_string()))),
            }
        }
    }

    /// The BEP 9 loop: request every info piece in order, one request
    /// outstanding at a time, then validate the assembled dictionary.
    ///
    /// We expect the whole info from this one peer and fail if it cannot
    /// deliver: a peer should only advertise metadata it has verified in
    /// full.
    async fn get_metadata_info(&mut self) -> Result<Bencode, PeerError> {
        let handshake = self.extended_handshake().await?;
        if !handshake.extensions.contains(Bep10Extension::Metadata) {
            return Err(self.err(PeerErrorKind::NoMetadataExtension));
        }
        let Some(metadata_size) = handshake.metadata_size else {
            return Err(self.err(PeerErrorKind::NoMetadataSize));
        };
        // Subsequent extended handshakes are legal; only the first counts.
        self.remote_registry = handshake.extensions;
        trace!("{} declares info size as {metadata_size} bytes", self.peer);
        let mut piecer = InfoPiecer::new(metadata_size);
        for index in 0..piecer.piece_count() {
            let index = index as u32;
            debug!(
                "sending request to {} for info piece {index}/{}",
                self.peer,
                piecer.piece_count(),
            );
            self.send(&Message::Extended(ExtendedMessage::Metadata(
                Bep9Message::request(index),
            )))
            .await?;
            self.await_piece(index, &mut piecer).await?;
        }
        debug!("all info pieces received from {}; validating ...", self.peer);
        let expected = self.info_hash.to_string();
        let actual = piecer.digest_hex();
        if expected != actual {
            return Err(self.err(PeerErrorKind::DigestMismatch { expected, actual }));
        }
        let info = bencode::decode(piecer.data()).map_err(|e| self.err(e.into()))?;
        if info.as_dict().is_none() {
            return Err(self.err(PeerErrorKind::InfoNotDict));
        }
        Ok(info)
    }

    /// Absorbs traffic until the data message for piece `index` arrives.
    async fn await_piece(&mut self, index: u32, piecer: &mut InfoPiecer) -> Result<(), PeerError> {
        loop {
            match self.receive().await? {
                Message::Extended(ExtendedMessage::Metadata(msg)) => match msg.msg_type {
                    Bep9MsgType::Data => {
                        if msg.piece != index {
                            return Err(self.err(PeerErrorKind::WrongPiece {
                                got: msg.piece,
                                wanted: index,
                            }));
                        }
                        if let Some(total_size) = msg.total_size {
                            if total_size != piecer.total_size() {
                                return Err(self.err(PeerErrorKind::TotalSizeMismatch {
                                    got: total_size,
                                    expected: piecer.total_size(),
                                }));
                            }
                        }
                        debug!("{} sent info piece {}", self.peer, msg.piece);
                        piecer
                            .add_piece(&msg.payload)
                            .map_err(|e| self.err(e.into()))?;
                        return Ok(());
                    }
                    Bep9MsgType::Reject => {
                        return Err(self.err(PeerErrorKind::PieceRejected(msg.piece)));
                    }
                    Bep9MsgType::Request => {
                        trace!(
                            "{} sent request for info piece {}; rejecting",
                            self.peer,
                            msg.piece,
                        );
                        self.send(&Message::Extended(ExtendedMessage::Metadata(
                            Bep9Message::reject(msg.piece),
                        )))
                        .await?;
                    }
                    Bep9MsgType::Other(code) => {
                        trace!(
                            "{} sent ut_metadata message with unknown msg_type {code}; ignoring",
                            self.peer,
                        );
                    }
                },
                // Repeat extended handshakes are valid and ignored.
                Message::Extended(ExtendedMessage::Handshake(_)) => {}
                msg if is_ignored(&msg) => {}
                msg => return Err(self.err(PeerErrorKind::Unexpected(msg.to_string()))),
            }
        }
    }
}

/// Base-protocol messages absorbed without comment while we wait on the
/// metadata exchange.
fn is_ignored(msg: &Message) -> bool {
    matches!(
        msg,
        Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Have { .. }
            | Message::Bitfield(_)
            | Message::Piece { .. }
            | Message::AllowedFast { .. }
            | Message::Suggest { .. }
            | Message::HaveAll
            | Message::HaveNone
    )
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Pops one complete length-prefixed frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(None))` for a
/// keepalive, `Ok(Some(Some(body)))` for a message body, and the
/// declared length as the error when it exceeds [`MAX_PEER_MSG_LEN`].
fn take_frame(buf: &mut BytesMut) -> Result<Option<Option<Vec<u8>>>, u32> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length == 0 {
        buf.advance(4);
        return Ok(Some(None));
    }
    if length > MAX_PEER_MSG_LEN {
        return Err(length);
    }
    let length = length as usize;
    if buf.len() < 4 + length {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(length).to_vec();
    Ok(Some(Some(body)))
}


#[cfg(test)]
mod tests {
    use super::testutil::{spawn_fake_peer, FakePeerScript};
    use super::*;
    use std::collections::BTreeMap;

    fn sample_info() -> Bencode {
        // Three metadata pieces' worth of info dict.
        Bencode::Dict(BTreeMap::from([
            (b"length".to_vec(), Bencode::Int(671088640)),
            (b"name".to_vec(), Bencode::from("example")),
            (b"piece length".to_vec(), Bencode::Int(262144)),
            (b"pieces".to_vec(), Bencode::Bytes(vec![0xAB; 40960])),
        ]))
    }

    #[tokio::test]
    async fn fetches_info_from_scripted_peer() {
        let info = sample_info();
        let info_bytes = info.to_bytes();
        let info_hash = InfoHash::of_info(&info_bytes);
        let (addr, server) = spawn_fake_peer(info_bytes, FakePeerScript::ServeMetadata).await;
        let app = Demagnetizer::new();
        let peer = Peer::new(addr.ip().to_string(), addr.port());
        let fetched = peer.get_info(&app, info_hash).await.unwrap();
        assert_eq!(fetched, info);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_piece_fails_the_connection() {
        let info_bytes = sample_info().to_bytes();
        let info_hash = InfoHash::of_info(&info_bytes);
        let (addr, server) = spawn_fake_peer(info_bytes, FakePeerScript::RejectPieces).await;
        let app = Demagnetizer::new();
        let peer = Peer::new(addr.ip().to_string(), addr.port());
        let err = peer.get_info(&app, info_hash).await.unwrap_err();
        assert!(matches!(err.kind, PeerErrorKind::PieceRejected(0)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_digest_fails_the_connection() {
        let info_bytes = sample_info().to_bytes();
        let info_hash = InfoHash::of_info(&info_bytes);
        let (addr, server) = spawn_fake_peer(info_bytes, FakePeerScript::CorruptPieces).await;
        let app = Demagnetizer::new();
        let peer = Peer::new(addr.ip().to_string(), addr.port());
        let err = peer.get_info(&app, info_hash).await.unwrap_err();
        assert!(matches!(err.kind, PeerErrorKind::DigestMismatch { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_without_extension_protocol_fails() {
        let info_bytes = sample_info().to_bytes();
        let info_hash = InfoHash::of_info(&info_bytes);
        let (addr, server) = spawn_fake_peer(info_bytes, FakePeerScript::NoExtensions).await;
        let app = Demagnetizer::new();
        let peer = Peer::new(addr.ip().to_string(), addr.port());
        let err = peer.get_info(&app, info_hash).await.unwrap_err();
        assert!(matches!(err.kind, PeerErrorKind::NoExtensionProtocol));
        server.await.unwrap();
    }

    #[test]
    fn peer_display_brackets_ipv6() {
        assert_eq!(Peer::new("185.21.216.149".into(), 2436).to_string(), "185.21.216.149:2436");
        assert_eq!(
            Peer::new("6969:6969:6969:6969:6969:6969:6969:6969".into(), 28784).to_string(),
            "[6969:6969:6969:6969:6969:6969:6969:6969]:28784"
        );
    }

    #[test]
    fn dedup_key_ignores_peer_id() {
        let mut a = Peer::new("1.2.3.4".into(), 5);
        a.id = Some(b"-TR3000-vfu1svh0ewb6".to_vec());
        let b = Peer::new("1.2.3.4".into(), 5);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn frames_messages_incrementally() {
        let mut buf = BytesMut::new();
        assert_eq!(take_frame(&mut buf), Ok(None));
        buf.extend_from_slice(b"\x00\x00\x00\x00\x00\x00\x00\x03\x09\x88");
        // Keepalive, then a partial port message.
        assert_eq!(take_frame(&mut buf), Ok(Some(None)));
        assert_eq!(take_frame(&mut buf), Ok(None));
        buf.extend_from_slice(b"\xb7");
        assert_eq!(take_frame(&mut buf), Ok(Some(Some(b"\x09\x88\xb7".to_vec()))));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x00\x01\x00\x00");
        assert_eq!(take_frame(&mut buf), Err(0x10000));
    }

    #[test]
    fn ignored_message_set() {
        assert!(is_ignored(&Message::Choke));
        assert!(is_ignored(&Message::Bitfield(vec![0xFF])));
        assert!(is_ignored(&Message::HaveNone));
        assert!(!is_ignored(&Message::Port(6881)));
        assert!(!is_ignored(&Message::Request {
            index: 0,
            begin: 0,
            length: 16384
        }));
    }
}
