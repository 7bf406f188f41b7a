//! Codec for the messages of the peer wire protocol: the BEP 3 core
//! kinds, the BEP 6 Fast Extension kinds, and the BEP 10 `extended`
//! envelope with its handshake and `ut_metadata` (BEP 9) payloads.
//!
//! Every message is framed as `length(4, big-endian) || type(1) ||
//! payload`; a zero length is a keepalive and is handled by the framing
//! layer, not here.
use super::extensions::{Bep10Extension, Bep10Registry};
use crate::bencode::{self, Bencode};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("invalid length for {kind:?} payload: expected {expected} bytes, got {actual}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("'extended' message lacks a payload")]
    EmptyExtended,

    #[error("unknown extended message ID {0}")]
    UnknownExtendedId(u8),

    #[error("invalid extended handshake: {0}")]
    BadExtendedHandshake(String),

    #[error("invalid ut_metadata message: {0}")]
    BadMetadataMessage(String),

    #[error("peer has not declared support for {0:?}")]
    UnregisteredExtension(&'static str),
}

/// One decoded peer message. Dispatch is a plain match on the numeric
/// type byte; `extended` messages decompose further through the BEP 10
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Suggest { index: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { index: u32 },
    Extended(ExtendedMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    Metadata(Bep9Message),
}

const TYPE_CHOKE: u8 = 0;
const TYPE_UNCHOKE: u8 = 1;
const TYPE_INTERESTED: u8 = 2;
const TYPE_NOT_INTERESTED: u8 = 3;
const TYPE_HAVE: u8 = 4;
const TYPE_BITFIELD: u8 = 5;
const TYPE_REQUEST: u8 = 6;
const TYPE_PIECE: u8 = 7;
const TYPE_CANCEL: u8 = 8;
const TYPE_PORT: u8 = 9;
const TYPE_SUGGEST: u8 = 0x0D;
const TYPE_HAVE_ALL: u8 = 0x0E;
const TYPE_HAVE_NONE: u8 = 0x0F;
const TYPE_REJECT: u8 = 0x10;
const TYPE_ALLOWED_FAST: u8 = 0x11;
const TYPE_EXTENDED: u8 = 20;

fn fixed_payload(kind: &'static str, payload: &[u8], expected: usize) -> Result<(), MessageError> {
    if payload.len() != expected {
        return Err(MessageError::BadLength {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    let mut chunk = &payload[offset..offset + 4];
    chunk.get_u32()
}

impl Message {
    /// Decodes a frame body (type byte plus payload, the length prefix
    /// already stripped). The `local` registry maps the extended message
    /// IDs we advertised to the peer.
    pub fn decode(body: &[u8], local: &Bep10Registry) -> Result<Message, MessageError> {
        let Some((&mtype, payload)) = body.split_first() else {
            return Err(MessageError::UnknownType(0));
        };
        match mtype {
            TYPE_CHOKE => Ok(Message::Choke),
            TYPE_UNCHOKE => Ok(Message::Unchoke),
            TYPE_INTERESTED => Ok(Message::Interested),
            TYPE_NOT_INTERESTED => Ok(Message::NotInterested),
            TYPE_HAVE => {
                fixed_payload("have", payload, 4)?;
                Ok(Message::Have {
                    index: read_u32(payload, 0),
                })
            }
            TYPE_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            TYPE_REQUEST => {
                fixed_payload("request", payload, 12)?;
                Ok(Message::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            TYPE_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::BadLength {
                        kind: "piece",
                        expected: 8,
                        actual: payload.len(),
                    });
                }
                Ok(Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    data: payload[8..].to_vec(),
                })
            }
            TYPE_CANCEL => {
                fixed_payload("cancel", payload, 12)?;
                Ok(Message::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            TYPE_PORT => {
                fixed_payload("port", payload, 2)?;
                Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
            }
            TYPE_SUGGEST => {
                fixed_payload("suggest", payload, 4)?;
                Ok(Message::Suggest {
                    index: read_u32(payload, 0),
                })
            }
            TYPE_HAVE_ALL => Ok(Message::HaveAll),
            TYPE_HAVE_NONE => Ok(Message::HaveNone),
            TYPE_REJECT => {
                fixed_payload("reject", payload, 12)?;
                Ok(Message::Reject {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            TYPE_ALLOWED_FAST => {
                fixed_payload("allowed fast", payload, 4)?;
                Ok(Message::AllowedFast {
                    index: read_u32(payload, 0),
                })
            }
            TYPE_EXTENDED => {
                let Some((&msg_id, rest)) = payload.split_first() else {
                    return Err(MessageError::EmptyExtended);
                };
                if msg_id == 0 {
                    let handshake = ExtendedHandshake::parse(rest)?;
                    Ok(Message::Extended(ExtendedMessage::Handshake(handshake)))
                } else {
                    match local.lookup(msg_id) {
                        Some(Bep10Extension::Metadata) => {
                            let msg = Bep9Message::parse(rest)?;
                            Ok(Message::Extended(ExtendedMessage::Metadata(msg)))
                        }
                        _ => Err(MessageError::UnknownExtendedId(msg_id)),
                    }
                }
            }
            other => Err(MessageError::UnknownType(other)),
        }
    }

    /// Encodes the full frame, length prefix included. Extended messages
    /// other than the handshake are addressed with the message ID the
    /// peer assigned in `remote`.
    pub fn encode(&self, remote: &Bep10Registry) -> Result<Vec<u8>, MessageError> {
        let (mtype, payload) = match self {
            Message::Choke => (TYPE_CHOKE, Vec::new()),
            Message::Unchoke => (TYPE_UNCHOKE, Vec::new()),
            Message::Interested => (TYPE_INTERESTED, Vec::new()),
            Message::NotInterested => (TYPE_NOT_INTERESTED, Vec::new()),
            Message::Have { index } => (TYPE_HAVE, index.to_be_bytes().to_vec()),
            Message::Bitfield(bits) => (TYPE_BITFIELD, bits.clone()),
            Message::Request {
                index,
                begin,
                length,
            } => (TYPE_REQUEST, triple(*index, *begin, *length)),
            Message::Piece { index, begin, data } => {
                let mut payload = Vec::with_capacity(8 + data.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(data);
                (TYPE_PIECE, payload)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => (TYPE_CANCEL, triple(*index, *begin, *length)),
            Message::Port(port) => (TYPE_PORT, port.to_be_bytes().to_vec()),
            Message::Suggest { index } => (TYPE_SUGGEST, index.to_be_bytes().to_vec()),
            Message::HaveAll => (TYPE_HAVE_ALL, Vec::new()),
            Message::HaveNone => (TYPE_HAVE_NONE, Vec::new()),
            Message::Reject {
                index,
                begin,
                length,
            } => (TYPE_REJECT, triple(*index, *begin, *length)),
            Message::AllowedFast { index } => (TYPE_ALLOWED_FAST, index.to_be_bytes().to_vec()),
            Message::Extended(ExtendedMessage::Handshake(handshake)) => {
                let mut payload = vec![0];
                payload.extend_from_slice(&handshake.to_payload());
                (TYPE_EXTENDED, payload)
            }
            Message::Extended(ExtendedMessage::Metadata(msg)) => {
                let code = remote
                    .code_for(Bep10Extension::Metadata)
                    .ok_or(MessageError::UnregisteredExtension("ut_metadata"))?;
                let mut payload = vec![code];
                payload.extend_from_slice(&msg.to_payload());
                (TYPE_EXTENDED, payload)
            }
        };
        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u32(1 + payload.len() as u32);
        frame.put_u8(mtype);
        frame.put_slice(&payload);
        Ok(frame.to_vec())
    }
}

fn triple(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Choke => f.write_str("choke"),
            Message::Unchoke => f.write_str("unchoke"),
            Message::Interested => f.write_str("interested"),
            Message::NotInterested => f.write_str("not interested"),
            Message::Have { index } => write!(f, "have piece {index}"),
            Message::Bitfield(bits) => write!(f, "bitfield of {} bytes", bits.len()),
            Message::Request {
                index,
                begin,
                length,
            } => write!(f, "request piece {index}, offset {begin}, length {length}"),
            Message::Piece { index, begin, data } => {
                write!(f, "piece {index}, offset {begin}, length {}", data.len())
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => write!(f, "cancel request for piece {index}, offset {begin}, length {length}"),
            Message::Port(port) => write!(f, "DHT port {port}"),
            Message::Suggest { index } => write!(f, "suggest piece {index}"),
            Message::HaveAll => f.write_str("have all"),
            Message::HaveNone => f.write_str("have none"),
            Message::Reject {
                index,
                begin,
                length,
            } => write!(f, "reject request for piece {index}, offset {begin}, length {length}"),
            Message::AllowedFast { index } => write!(f, "allow fast download of piece {index}"),
            Message::Extended(ExtendedMessage::Handshake(_)) => f.write_str("extended handshake"),
            Message::Extended(ExtendedMessage::Metadata(msg)) => msg.fmt(f),
        }
    }
}

/// The first BEP 10 message on a connection: which extended messages the
/// peer accepts, and under which IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub extensions: Bep10Registry,
    pub client: Option<String>,
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    pub fn parse(payload: &[u8]) -> Result<ExtendedHandshake, MessageError> {
        let data = bencode::decode(payload)
            .map_err(|e| MessageError::BadExtendedHandshake(e.to_string()))?;
        let m = data
            .get(b"m")
            .and_then(Bencode::as_dict)
            .ok_or_else(|| MessageError::BadExtendedHandshake("'m' dictionary missing".into()))?;
        let extensions = Bep10Registry::from_m(m).map_err(MessageError::BadExtendedHandshake)?;
        Ok(ExtendedHandshake {
            extensions,
            client: data.get_string(b"v"),
            metadata_size: data
                .get(b"metadata_size")
                .and_then(Bencode::as_int)
                .and_then(|i| u64::try_from(i).ok()),
        })
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), self.extensions.to_m());
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Bencode::from(client.as_str()));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Bencode::Int(size as i64));
        }
        Bencode::Dict(dict).to_bytes()
    }
}

/// A `ut_metadata` message (BEP 9). `msg_type` values other than
/// request, data, and reject are carried through as [`Bep9MsgType::Other`]
/// so the driver can ignore them instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bep9Message {
    pub msg_type: Bep9MsgType,
    pub piece: u32,
    pub total_size: Option<u64>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bep9MsgType {
    Request,
    Data,
    Reject,
    Other(i64),
}

impl Bep9MsgType {
    fn from_code(code: i64) -> Bep9MsgType {
        match code {
            0 => Bep9MsgType::Request,
            1 => Bep9MsgType::Data,
            2 => Bep9MsgType::Reject,
            other => Bep9MsgType::Other(other),
        }
    }

    fn code(self) -> i64 {
        match self {
            Bep9MsgType::Request => 0,
            Bep9MsgType::Data => 1,
            Bep9MsgType::Reject => 2,
            Bep9MsgType::Other(code) => code,
        }
    }
}

impl Bep9Message {
    pub fn request(piece: u32) -> Bep9Message {
        Bep9Message {
            msg_type: Bep9MsgType::Request,
            piece,
            total_size: None,
            payload: Vec::new(),
        }
    }

    pub fn reject(piece: u32) -> Bep9Message {
        Bep9Message {
            msg_type: Bep9MsgType::Reject,
            piece,
            total_size: None,
            payload: Vec::new(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Bep9Message, MessageError> {
        let (data, trailing) = bencode::decode_partial(payload)
            .map_err(|_| MessageError::BadMetadataMessage("does not start with valid bencode".into()))?;
        if data.as_dict().is_none() {
            return Err(MessageError::BadMetadataMessage("does not start with a dict".into()));
        }
        let msg_type = data
            .get(b"msg_type")
            .and_then(Bencode::as_int)
            .map(Bep9MsgType::from_code)
            .ok_or_else(|| MessageError::BadMetadataMessage("lacks valid 'msg_type' field".into()))?;
        let piece = data
            .get(b"piece")
            .and_then(Bencode::as_int)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| MessageError::BadMetadataMessage("lacks valid 'piece' field".into()))?;
        let total_size = match data.get(b"total_size") {
            None => None,
            Some(value) => Some(
                value
                    .as_int()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| {
                        MessageError::BadMetadataMessage("has invalid 'total_size' field".into())
                    })?,
            ),
        };
        match msg_type {
            Bep9MsgType::Data => {
                if trailing.is_empty() {
                    return Err(MessageError::BadMetadataMessage("data message lacks trailing data".into()));
                }
            }
            Bep9MsgType::Request | Bep9MsgType::Reject => {
                if !trailing.is_empty() {
                    return Err(MessageError::BadMetadataMessage(
                        "non-data message has trailing bytes".into(),
                    ));
                }
            }
            Bep9MsgType::Other(_) => {}
        }
        Ok(Bep9Message {
            msg_type,
            piece,
            total_size,
            payload: trailing.to_vec(),
        })
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(b"msg_type".to_vec(), Bencode::Int(self.msg_type.code()));
        dict.insert(b"piece".to_vec(), Bencode::Int(i64::from(self.piece)));
        if let Some(size) = self.total_size {
            dict.insert(b"total_size".to_vec(), Bencode::Int(size as i64));
        }
        let mut payload = Bencode::Dict(dict).to_bytes();
        payload.extend_from_slice(&self.payload);
        payload
    }
}

impl fmt::Display for Bep9Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg_type {
            Bep9MsgType::Request => write!(f, "request for info piece {}", self.piece),
            Bep9MsgType::Data => write!(f, "info piece {}", self.piece),
            Bep9MsgType::Reject => write!(f, "rejection of info piece {}", self.piece),
            Bep9MsgType::Other(code) => {
                write!(f, "ut_metadata message with msg_type {code}")
            }
        }
    }
}
