//! Library root for demagnetize.
//!
//! Turns magnet links into `.torrent` files by announcing to the
//! magnet's trackers and fetching the info dictionary from peers over
//! the `ut_metadata` extension, without downloading any file data.
pub mod bencode;
pub mod consts;
pub mod core;
pub mod magnet;
pub mod peer;
pub mod session;
pub mod torrent;
pub mod tracker;
