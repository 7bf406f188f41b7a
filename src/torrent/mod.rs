//! Torrent metainfo composition.
//!
//! Once a peer has handed over a validated info dictionary, this module
//! wraps it into a complete `.torrent` metainfo: the trackers from the
//! magnet link, the client string, and the creation time.
use crate::bencode::{self, Bencode};
use crate::consts::CLIENT;
use crate::magnet::Magnet;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod info_hash;
pub mod piecer;

pub use info_hash::{InfoHash, InfoHashError};
pub use piecer::InfoPiecer;

/// A complete torrent metainfo ready to be written to disk.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub metainfo: Bencode,
    pub info_hash: InfoHash,
}

/// Builds the metainfo for a fetched info dictionary: `info`, `announce`
/// and `announce-list` from the magnet's trackers, `created by`, and
/// `creation date`.
pub fn compose_torrent(magnet: &Magnet, info: Bencode) -> TorrentFile {
    let mut meta = BTreeMap::new();
    if let Some(first) = magnet.trackers.first() {
        meta.insert(b"announce".to_vec(), Bencode::from(first.as_str()));
        let tiers = magnet
            .trackers
            .iter()
            .map(|url| Bencode::List(vec![Bencode::from(url.as_str())]))
            .collect();
        meta.insert(b"announce-list".to_vec(), Bencode::List(tiers));
    }
    meta.insert(b"created by".to_vec(), Bencode::from(CLIENT));
    meta.insert(b"creation date".to_vec(), Bencode::Int(unix_now()));
    meta.insert(b"info".to_vec(), info);
    TorrentFile {
        metainfo: Bencode::Dict(meta),
        info_hash: magnet.info_hash,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TorrentFile {
    /// The `name` field of the info dictionary, if present.
    pub fn name(&self) -> Option<String> {
        self.metainfo.get(b"info")?.get_string(b"name")
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        bencode::encode(writer, &self.metainfo)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.metainfo.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_magnet() -> Magnet {
        "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84\
         &dn=example&tr=http%3A%2F%2Ftracker.example%2Fannounce\
         &tr=udp%3A%2F%2Ftracker.example%3A1337"
            .parse()
            .unwrap()
    }

    #[test]
    fn composes_metainfo() {
        let info = Bencode::Dict(BTreeMap::from([
            (b"name".to_vec(), Bencode::from("example")),
            (b"piece length".to_vec(), Bencode::Int(262144)),
        ]));
        let torrent = compose_torrent(&sample_magnet(), info);
        assert_eq!(torrent.name().as_deref(), Some("example"));
        assert_eq!(
            torrent
                .metainfo
                .get_string(b"announce")
                .as_deref(),
            Some("http://tracker.example/announce")
        );
        let encoded = torrent.to_bytes();
        assert!(encoded.starts_with(b"d8:announce31:http://tracker.example/announce"));
        assert!(encoded.ends_with(b"4:infod4:name7:example12:piece lengthi262144eee"));
    }

    #[test]
    fn omits_announce_without_trackers() {
        let magnet: Magnet = "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84"
            .parse()
            .unwrap();
        let torrent = compose_torrent(&magnet, Bencode::Dict(BTreeMap::new()));
        assert!(torrent.metainfo.get(b"announce").is_none());
        assert!(torrent.metainfo.get(b"announce-list").is_none());
    }
}
