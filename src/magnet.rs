//! Magnet link parsing.
use crate::torrent::{InfoHash, InfoHashError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// A parsed magnet link: the info hash, an optional display name, and
/// the announce URLs of the trackers that may know peers for it.
#[derive(Debug, Clone)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("not a magnet URL")]
    NotMagnet,

    #[error("magnet URL lacks a BitTorrent info hash")]
    NoInfoHash,

    #[error(transparent)]
    InfoHash(#[from] InfoHashError),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl FromStr for Magnet {
    type Err = MagnetError;

    fn from_str(s: &str) -> Result<Magnet, MagnetError> {
        let url = Url::parse(s)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }
        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if info_hash.is_none() {
                        let urn = value
                            .strip_prefix("urn:btih:")
                            .ok_or(MagnetError::NoInfoHash)?;
                        info_hash = Some(urn.parse::<InfoHash>()?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }
        Ok(Magnet {
            info_hash: info_hash.ok_or(MagnetError::NoInfoHash)?,
            display_name,
            trackers,
        })
    }
}

impl fmt::Display for Magnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "magnet:?xt=urn:btih:{}", self.info_hash)?;
        let mut extras = url::form_urlencoded::Serializer::new(String::new());
        if let Some(dn) = &self.display_name {
            extras.append_pair("dn", dn);
        }
        for tr in &self.trackers {
            extras.append_pair("tr", tr);
        }
        let extras = extras.finish();
        if !extras.is_empty() {
            write!(f, "&{extras}")?;
        }
        Ok(())
    }
}
