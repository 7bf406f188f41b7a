//! Application state and the per-magnet entry points.
use crate::consts::{MAGNET_LIMIT, PEER_ID_PREFIX};
use crate::magnet::Magnet;
use crate::session::{DemagnetizeError, TorrentSession};
use crate::torrent::{compose_torrent, TorrentFile};
use crate::tracker::Key;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, trace};

/// Identity shared by every announce and handshake this process makes:
/// the tracker key, the peer ID, and the port we claim to listen on.
#[derive(Debug, Clone)]
pub struct Demagnetizer {
    pub key: Key,
    pub peer_id: [u8; 20],
    pub peer_port: u16,
}

impl Demagnetizer {
    pub fn new() -> Demagnetizer {
        let app = Demagnetizer {
            key: Key::generate(),
            peer_id: make_peer_id(),
            peer_port: rand::rng().random_range(1025..=65535),
        };
        trace!("using key = {}", app.key);
        trace!("using peer ID = {:?}", String::from_utf8_lossy(&app.peer_id));
        trace!("using peer port = {}", app.peer_port);
        app
    }

    /// Fixed identity, for tests that need byte-exact requests.
    pub fn with_parts(key: Key, peer_id: [u8; 20], peer_port: u16) -> Demagnetizer {
        Demagnetizer {
            key,
            peer_id,
            peer_port,
        }
    }

    /// Fetches the info dictionary for one magnet and wraps it into a
    /// complete torrent.
    pub async fn demagnetize(&self, magnet: &Magnet) -> Result<TorrentFile, DemagnetizeError> {
        let session = TorrentSession::new(self, magnet);
        let info = session.get_info().await?;
        Ok(compose_torrent(magnet, info))
    }

    /// Fetches one magnet and writes the torrent to the templated path.
    pub async fn demagnetize_to_file(&self, magnet: &Magnet, template: &str) -> Report {
        let torrent = match self.demagnetize(magnet).await {
            Ok(torrent) => torrent,
            Err(e) => {
                error!("{e}");
                return Report::for_failure(magnet.clone());
            }
        };
        let filename = torrent_filename(template, &torrent);
        info!(
            "saving torrent for info hash {} to file {}",
            magnet.info_hash, filename
        );
        match tokio::fs::write(&filename, torrent.to_bytes()).await {
            Ok(()) => Report::for_success(magnet.clone(), PathBuf::from(filename)),
            Err(e) => {
                error!("error writing to file {filename}: {e}");
                Report::for_failure(magnet.clone())
            }
        }
    }

    /// Converts a batch of magnets concurrently, capped at
    /// [`MAGNET_LIMIT`] in flight.
    pub async fn download_torrents(&self, magnets: Vec<Magnet>, template: &str) -> Report {
        let limit = Arc::new(Semaphore::new(MAGNET_LIMIT));
        let mut tasks = JoinSet::new();
        for magnet in magnets {
            let app = self.clone();
            let limit = limit.clone();
            let template = template.to_string();
            tasks.spawn(async move {
                let Ok(_permit) = limit.acquire().await else {
                    return Report::for_failure(magnet);
                };
                app.demagnetize_to_file(&magnet, &template).await
            });
        }
        let mut report = Report::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(partial) => report.merge(partial),
                Err(e) => error!("magnet task failed: {e}"),
            }
        }
        report
    }
}

impl Default for Demagnetizer {
    fn default() -> Demagnetizer {
        Demagnetizer::new()
    }
}

/// A fresh peer ID: the client prefix followed by random alphanumerics,
/// 20 bytes total.
fn make_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    let prefix = PEER_ID_PREFIX.as_bytes();
    id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for byte in &mut id[prefix.len()..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

/// Per-run outcome: which magnets were converted, and where they were
/// saved.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub downloads: Vec<(Magnet, Option<PathBuf>)>,
}

impl Report {
    pub fn for_success(magnet: Magnet, filename: PathBuf) -> Report {
        Report {
            downloads: vec![(magnet, Some(filename))],
        }
    }

    pub fn for_failure(magnet: Magnet) -> Report {
        Report {
            downloads: vec![(magnet, None)],
        }
    }

    pub fn merge(&mut self, other: Report) {
        self.downloads.extend(other.downloads);
    }

    pub fn total(&self) -> usize {
        self.downloads.len()
    }

    pub fn finished(&self) -> usize {
        self.downloads
            .iter()
            .filter(|(_, filename)| filename.is_some())
            .count()
    }

    pub fn ok(&self) -> bool {
        !self.downloads.is_empty() && self.finished() == self.total()
    }
}

/// Expands `{name}` and `{hash}` in an output filename template. The
/// name is sanitised for use as a single path component; a torrent
/// without a usable name falls back to its hash.
pub fn torrent_filename(template: &str, torrent: &TorrentFile) -> String {
    let hash = torrent.info_hash.to_string();
    let name = match torrent.name() {
        Some(name) => sanitize_pathname(&name),
        None => hash.clone(),
    };
    template.replace("{name}", &name).replace("{hash}", &hash)
}

/// Replaces control characters, path separators, and other
/// filesystem-hostile characters with underscores, and collapses any
/// whitespace to plain spaces.
fn sanitize_pathname(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_whitespace() {
                ' '
            } else if c.is_control() || matches!(c, '\\' | '/' | '<' | '>' | ':' | '|' | '"' | '?' | '*') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Bencode;
    use std::collections::BTreeMap;

    #[test]
    fn peer_id_has_prefix_and_alnum_tail() {
        let id = make_peer_id();
        assert_eq!(&id[..9], PEER_ID_PREFIX.as_bytes());
        assert!(id[9..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn report_accounting() {
        let magnet: Magnet = "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84"
            .parse()
            .unwrap();
        let mut report = Report::default();
        assert!(!report.ok());
        report.merge(Report::for_success(magnet.clone(), "a.torrent".into()));
        report.merge(Report::for_failure(magnet.clone()));
        assert_eq!(report.total(), 2);
        assert_eq!(report.finished(), 1);
        assert!(!report.ok());
        let all_good = Report::for_success(magnet, "b.torrent".into());
        assert!(all_good.ok());
    }

    #[test]
    fn filename_templating() {
        let magnet: Magnet = "magnet:?xt=urn:btih:63a04291a8b266d968aa7ab8a276543fa63a9e84\
             &tr=http%3A%2F%2Ftracker.example%2Fannounce"
            .parse()
            .unwrap();
        let info = Bencode::Dict(BTreeMap::from([(
            b"name".to_vec(),
            Bencode::from("dir/evil: name?"),
        )]));
        let torrent = compose_torrent(&magnet, info);
        assert_eq!(
            torrent_filename("{name}.torrent", &torrent),
            "dir_evil_ name_.torrent"
        );
        assert_eq!(
            torrent_filename("{hash}.torrent", &torrent),
            "63a04291a8b266d968aa7ab8a276543fa63a9e84.torrent"
        );
        let nameless = compose_torrent(&magnet, Bencode::Dict(BTreeMap::new()));
        assert_eq!(
            torrent_filename("{name}.torrent", &nameless),
            "63a04291a8b266d968aa7ab8a276543fa63a9e84.torrent"
        );
    }
}
