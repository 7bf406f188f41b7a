//! The fixed-format handshake that opens every peer connection.
//!
//! The handshake is the first exchange between two peers. It verifies
//! that both sides are talking about the same torrent (via the info
//! hash) and declares protocol extensions through the reserved bits.
use super::extensions::ExtensionSet;
use crate::torrent::InfoHash;
use thiserror::Error;

const HEADER: &[u8] = b"\x13BitTorrent protocol";

/// A BitTorrent handshake: the protocol header, 8 reserved bytes of
/// extension bits, the info hash, and the sender's peer ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub extensions: ExtensionSet,
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

/// Wire length of a handshake: header + reserved + info hash + peer ID.
pub const HANDSHAKE_LEN: usize = 20 + 8 + 20 + 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("wrong length: got {0} bytes, expected {HANDSHAKE_LEN}")]
    WrongLength(usize),

    #[error("invalid protocol declaration")]
    BadHeader,
}

impl Handshake {
    /// Serializes the handshake into its 68-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[..20].copy_from_slice(HEADER);
        buf[20..28].copy_from_slice(&self.extensions.to_reserved());
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn parse(blob: &[u8]) -> Result<Handshake, HandshakeError> {
        if blob.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::WrongLength(blob.len()));
        }
        if &blob[..20] != HEADER {
            return Err(HandshakeError::BadHeader);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&blob[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&blob[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&blob[48..68]);
        Ok(Handshake {
            extensions: ExtensionSet::from_reserved(reserved),
            info_hash: InfoHash::new(info_hash),
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::extensions::Extension;

    #[test]
    fn handshake_round_trip() {
        let blob: &[u8] = b"\x13BitTorrent protocol\x00\x00\x00\x00\x00\x10\x00\x05\
            k\xcb\xd4A\xd7\xa0\x88\xc6;\xa8\xf8\x82\xe3\x12\x91\xd3\x85\xa7\x96L\
            -TR3000-vfu1svh0ewb6";
        let handshake = Handshake {
            extensions: [Extension::Bep10, Extension::Fast, Extension::Dht]
                .into_iter()
                .collect(),
            info_hash: "6bcbd441d7a088c63ba8f882e31291d385a7964c".parse().unwrap(),
            peer_id: *b"-TR3000-vfu1svh0ewb6",
        };
        assert_eq!(Handshake::parse(blob).unwrap(), handshake);
        assert_eq!(handshake.encode().as_slice(), blob);
    }

    #[test]
    fn unknown_reserved_bits_round_trip() {
        let blob: &[u8] = b"\x13BitTorrent protocol\x00\x00\x00\x00\x00\x18\x00\x05\
            k\xcb\xd4A\xd7\xa0\x88\xc6;\xa8\xf8\x82\xe3\x12\x91\xd3\x85\xa7\x96L\
            -qB4360-5Ngjy9uIMl~O";
        let handshake = Handshake::parse(blob).unwrap();
        assert!(handshake.extensions.contains(Extension::Bep10));
        assert!(handshake.extensions.contains(Extension::Fast));
        assert!(handshake.extensions.contains(Extension::Dht));
        assert_eq!(handshake.encode().as_slice(), blob);
    }

    #[test]
    fn rejects_bad_handshakes() {
        assert_eq!(
            Handshake::parse(b"\x13BitTorrent protocol"),
            Err(HandshakeError::WrongLength(20))
        );
        let mut blob = [0u8; HANDSHAKE_LEN];
        blob[0] = 0x13;
        blob[1..20].copy_from_slice(b"BitTorrent protocom");
        assert_eq!(Handshake::parse(&blob), Err(HandshakeError::BadHeader));
    }
}
