use data_encoding::BASE32;
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The 20-byte SHA-1 of a torrent's bencoded info dictionary.
///
/// Magnet links carry it as either 40 hex digits or 32 base32 characters;
/// the canonical rendering is lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid info hash: {0:?}")]
pub struct InfoHashError(pub String);

impl InfoHash {
    pub fn new(bytes: [u8; 20]) -> InfoHash {
        InfoHash(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<InfoHash, InfoHashError> {
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| InfoHashError(hex::encode(bytes)))?;
        Ok(InfoHash(bytes))
    }

    /// The SHA-1 of an already-bencoded info dictionary.
    pub fn of_info(benc: &[u8]) -> InfoHash {
        InfoHash(Sha1::digest(benc).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for InfoHash {
    type Err = InfoHashError;

    fn from_str(s: &str) -> Result<InfoHash, InfoHashError> {
        let bytes = match s.len() {
            40 => hex::decode(s).map_err(|_| InfoHashError(s.to_string()))?,
            32 => BASE32
                .decode(s.as_bytes())
                .map_err(|_| InfoHashError(s.to_string()))?,
            _ => return Err(InfoHashError(s.to_string())),
        };
        InfoHash::from_bytes(&bytes)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex() {
        let hash: InfoHash = "63a04291a8b266d968aa7ab8a276543fa63a9e84".parse().unwrap();
        assert_eq!(hash.to_string(), "63a04291a8b266d968aa7ab8a276543fa63a9e84");
        assert_eq!(hash.as_bytes()[0], 0x63);
        assert_eq!(hash.as_bytes()[19], 0x84);
    }

    #[test]
    fn parses_base32() {
        let hash: InfoHash = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
        assert_eq!(hash.to_string(), "0000000000000000000000000000000000000000");
        let hash: InfoHash = "7777777777777777777777777777777Q".parse().unwrap();
        assert_eq!(hash.to_string(), "fffffffffffffffffffffffffffffffffffffff0");
    }

    #[test]
    fn rejects_bad_input() {
        assert!("".parse::<InfoHash>().is_err());
        assert!("63a04291".parse::<InfoHash>().is_err());
        assert!("zz".repeat(20).parse::<InfoHash>().is_err());
    }

    #[test]
    fn hashes_info_bytes() {
        // SHA-1 of "abc" is a well-known test vector.
        let hash = InfoHash::of_info(b"abc");
        assert_eq!(hash.to_string(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
