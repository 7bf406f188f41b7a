//! Protocol constants shared across the crate.
use std::time::Duration;

/// Client string reported to trackers (`User-Agent`) and peers (extended
/// handshake `v`), and recorded as `created by` in composed torrents.
pub const CLIENT: &str = concat!("demagnetize ", env!("CARGO_PKG_VERSION"));

/// Prefix of the 20-byte peer ID; the remainder is random alphanumerics.
pub const PEER_ID_PREFIX: &str = "-DM-0010-";

/// `left` value to use when announcing to a tracker for a torrent we have
/// only the magnet link of.
// TODO: Look into appropriate values (for comparison, Transmission uses 2^63-1)
pub const LEFT: u64 = 65535;

/// Number of peers to request per announce.
pub const NUMWANT: u32 = 50;

/// Message ID we assign to `ut_metadata` in our extended handshake.
pub const UT_METADATA: u8 = 42;

/// Peers that declare a message longer than this are dropped.
pub const MAX_PEER_MSG_LEN: u32 = 65535;

/// Size of the pieces the info dictionary is transferred in (BEP 9).
pub const INFO_PIECE_SIZE: usize = 16 << 10;

/// How long a peer connection may sit idle before we send a keepalive.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(120);

/// Deadline for establishing a TCP connection and completing the
/// BitTorrent handshake with a peer.
pub const PEER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a complete announce exchange with a tracker.
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the courtesy `stopped` announce sent when a tracker
/// session winds down.
pub const TRACKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum number of peers contacted concurrently per magnet.
pub const PEERS_PER_MAGNET_LIMIT: usize = 30;

/// Maximum number of magnets worked on concurrently in batch mode.
pub const MAGNET_LIMIT: usize = 50;
