//! Bencode codec used by every other layer of the crate.
//!
//! Tracker responses, the BEP 10 extended handshake, BEP 9 metadata
//! messages, and the final `.torrent` metainfo are all bencoded. The
//! decoder is strict about the canonical form: dictionary keys must be
//! byte strings in strictly ascending order, and integers must not carry
//! leading zeros, a `-0`, or stray whitespace, so that re-encoding a
//! decoded value always reproduces the input bytes.
use std::collections::BTreeMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_partial};
pub use encoder::encode;

/// A bencoded value.
///
/// The four variants mirror the four types of the bencoding grammar:
///
/// 1. `Bytes(Vec<u8>)` - a length-prefixed byte string, e.g. `4:spam`.
///    Byte strings are raw bytes; they are frequently but not necessarily
///    UTF-8.
/// 2. `Int(i64)` - a signed integer, e.g. `i42e`.
/// 3. `List(Vec<Bencode>)` - an ordered sequence, e.g. `l4:spami42ee`.
/// 4. `Dict(BTreeMap<Vec<u8>, Bencode>)` - a mapping with byte-string
///    keys, e.g. `d3:cow3:mooe`. The `BTreeMap` keeps keys in the
///    ascending order the encoding requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// A dictionary's byte string under `key`, decoded as UTF-8 with
    /// replacement characters for invalid sequences.
    pub fn get_string(&self, key: &[u8]) -> Option<String> {
        self.get(key)
            .and_then(Bencode::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// The canonical encoding of this value.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = encoder::encode(&mut buf, self);
        buf
    }
}

impl From<&[u8]> for Bencode {
    fn from(b: &[u8]) -> Bencode {
        Bencode::Bytes(b.to_vec())
    }
}

impl From<&str> for Bencode {
    fn from(s: &str) -> Bencode {
        Bencode::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Bencode {
    fn from(i: i64) -> Bencode {
        Bencode::Int(i)
    }
}

/// Error type for bencode decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended in the middle of a value")]
    ShortInput,

    #[error("non-digit in integer")]
    NonDigit,

    #[error("invalid bencoded integer")]
    InvalidInteger,

    #[error("unexpected byte {0:#04x} in input")]
    InvalidByte(u8),

    #[error("non-bytes key in dict")]
    NonBytesKey,

    #[error("dict keys not in sorted order")]
    UnsortedKeys,

    #[error("too many nested structures")]
    TooDeep,

    #[error("input contains trailing bytes")]
    TrailingBytes,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
