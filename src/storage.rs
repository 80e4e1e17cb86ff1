//! The piece storage contract this crate downloads into.
//!
//! Disk layout, caching, and file mapping live behind this trait; the
//! session only ever reads, writes, and verifies whole pieces by
//! index. [`MemoryStorage`] is the in-memory backend used by tests and
//! small tools.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {piece} of {got} bytes, expected {expected}")]
    WrongPieceLength { piece: u32, got: usize, expected: usize },

    #[error("piece not present: {0}")]
    PieceMissing(u32),
}

/// Whole-piece storage for one swarm.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a verified piece back out.
    async fn read_piece(&self, index: u32) -> Result<Bytes, StorageError>;

    /// Commits a verified piece.
    async fn write_piece(&self, index: u32, data: Bytes) -> Result<(), StorageError>;

    /// Whether the stored piece matches its expected hash. Absent
    /// pieces are simply unverified, not errors.
    async fn verify_piece(&self, index: u32) -> Result<bool, StorageError>;

    /// Length of the given piece; only the last one may be short.
    fn piece_length(&self, index: u32) -> usize;

    fn num_pieces(&self) -> usize;
}

/// Piece storage held entirely in memory.
pub struct MemoryStorage {
    pieces: RwLock<Vec<Option<Bytes>>>,
    hashes: Vec<[u8; 20]>,
    piece_length: usize,
    total_length: u64,
}

impl MemoryStorage {
    pub fn new(hashes: Vec<[u8; 20]>, piece_length: usize, total_length: u64) -> Self {
        Self {
            pieces: RwLock::new(vec![None; hashes.len()]),
            hashes,
            piece_length,
            total_length,
        }
    }

    /// Storage pre-filled with the given pieces; hashes are computed.
    /// Handy for building seeders in tests.
    pub fn seeded(pieces: Vec<Bytes>, piece_length: usize, total_length: u64) -> Self {
        let hashes = pieces
            .iter()
            .map(|p| Sha1::digest(p).into())
            .collect();
        Self {
            pieces: RwLock::new(pieces.into_iter().map(Some).collect()),
            hashes,
            piece_length,
            total_length,
        }
    }

    fn check_index(&self, index: u32) -> Result<(), StorageError> {
        if (index as usize) < self.hashes.len() {
            Ok(())
        } else {
            Err(StorageError::InvalidPieceIndex(index))
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_piece(&self, index: u32) -> Result<Bytes, StorageError> {
        self.check_index(index)?;
        self.pieces.read()[index as usize]
            .clone()
            .ok_or(StorageError::PieceMissing(index))
    }

    async fn write_piece(&self, index: u32, data: Bytes) -> Result<(), StorageError> {
        self.check_index(index)?;
        let expected = self.piece_length(index);
        if data.len() != expected {
            return Err(StorageError::WrongPieceLength {
                piece: index,
                got: data.len(),
                expected,
            });
        }
        self.pieces.write()[index as usize] = Some(data);
        Ok(())
    }

    async fn verify_piece(&self, index: u32) -> Result<bool, StorageError> {
        self.check_index(index)?;
        let Some(data) = self.pieces.read()[index as usize].clone() else {
            return Ok(false);
        };
        let digest: [u8; 20] = Sha1::digest(&data).into();
        Ok(digest == self.hashes[index as usize])
    }

    fn piece_length(&self, index: u32) -> usize {
        if (index as usize) < self.hashes.len().saturating_sub(1) {
            self.piece_length
        } else {
            (self.total_length - (self.hashes.len() as u64 - 1) * self.piece_length as u64)
                as usize
        }
    }

    fn num_pieces(&self) -> usize {
        self.hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let data = Bytes::from(vec![7u8; 64]);
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let store = MemoryStorage::new(vec![hash], 64, 64);

        assert!(!store.verify_piece(0).await.unwrap());
        assert!(matches!(
            store.read_piece(0).await,
            Err(StorageError::PieceMissing(0))
        ));

        store.write_piece(0, data.clone()).await.unwrap();
        assert!(store.verify_piece(0).await.unwrap());
        assert_eq!(store.read_piece(0).await.unwrap(), data);

        assert!(matches!(
            store.write_piece(1, data.clone()).await,
            Err(StorageError::InvalidPieceIndex(1))
        ));
        assert!(matches!(
            store.write_piece(0, Bytes::from_static(b"short")).await,
            Err(StorageError::WrongPieceLength { .. })
        ));
    }

    #[tokio::test]
    async fn seeded_storage_verifies() {
        let pieces = vec![Bytes::from(vec![1u8; 32]), Bytes::from(vec![2u8; 16])];
        let store = MemoryStorage::seeded(pieces, 32, 48);
        assert_eq!(store.num_pieces(), 2);
        assert_eq!(store.piece_length(0), 32);
        assert_eq!(store.piece_length(1), 16);
        assert!(store.verify_piece(0).await.unwrap());
        assert!(store.verify_piece(1).await.unwrap());
    }
}
