use crate::consts::INFO_PIECE_SIZE;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Assembles an info dictionary from the 16 KiB pieces a peer sends over
/// BEP 9, keeping a running SHA-1 of the bytes received so far.
///
/// Pieces must arrive in order and match the scheduled size for their
/// index: every piece is [`INFO_PIECE_SIZE`] bytes except the last, which
/// holds the residue.
#[derive(Debug)]
pub struct InfoPiecer {
    total_size: u64,
    data: Vec<u8>,
    index: usize,
    digest: Sha1,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("too many pieces")]
    TooManyPieces,

    #[error("piece {index} is wrong length: expected {expected} bytes, got {actual}")]
    WrongLength {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

impl InfoPiecer {
    pub fn new(total_size: u64) -> InfoPiecer {
        InfoPiecer {
            total_size,
            data: Vec::new(),
            index: 0,
            digest: Sha1::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_count(&self) -> usize {
        self.total_size.div_ceil(INFO_PIECE_SIZE as u64) as usize
    }

    fn scheduled_size(&self, index: usize) -> usize {
        let offset = index as u64 * INFO_PIECE_SIZE as u64;
        (self.total_size - offset).min(INFO_PIECE_SIZE as u64) as usize
    }

    /// Appends the next piece, feeding the running digest.
    pub fn add_piece(&mut self, blob: &[u8]) -> Result<(), PieceError> {
        if self.index >= self.piece_count() {
            return Err(PieceError::TooManyPieces);
        }
        let expected = self.scheduled_size(self.index);
        if blob.len() != expected {
            return Err(PieceError::WrongLength {
                index: self.index,
                expected,
                actual: blob.len(),
            });
        }
        self.data.extend_from_slice(blob);
        self.digest.update(blob);
        self.index += 1;
        Ok(())
    }

    /// Hex SHA-1 of the bytes fed so far.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest.clone().finalize())
    }

    /// The assembled bytes; only the complete info dict once every piece
    /// has been added.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_schedule() {
        assert_eq!(InfoPiecer::new(0).piece_count(), 0);
        assert_eq!(InfoPiecer::new(1).piece_count(), 1);
        assert_eq!(InfoPiecer::new(16384).piece_count(), 1);
        assert_eq!(InfoPiecer::new(16385).piece_count(), 2);
        let piecer = InfoPiecer::new(40000);
        assert_eq!(piecer.piece_count(), 3);
        assert_eq!(piecer.scheduled_size(0), 16384);
        assert_eq!(piecer.scheduled_size(1), 16384);
        assert_eq!(piecer.scheduled_size(2), 7232);
    }

    #[test]
    fn assembles_in_order() {
        let mut piecer = InfoPiecer::new(16387);
        piecer.add_piece(&[0xAA; 16384]).unwrap();
        piecer.add_piece(b"abc").unwrap();
        assert_eq!(piecer.data().len(), 16387);
        assert_eq!(piecer.add_piece(b"abc"), Err(PieceError::TooManyPieces));
    }

    #[test]
    fn rejects_wrong_length() {
        let mut piecer = InfoPiecer::new(20);
        assert_eq!(
            piecer.add_piece(&[0; 19]),
            Err(PieceError::WrongLength {
                index: 0,
                expected: 20,
                actual: 19
            })
        );
    }

    #[test]
    fn digest_tracks_fed_bytes() {
        let mut piecer = InfoPiecer::new(3);
        // SHA-1 of the empty string, then of "abc".
        assert_eq!(piecer.digest_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        piecer.add_piece(b"abc").unwrap();
        assert_eq!(piecer.digest_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
