//! Piece and block coordinate arithmetic.
//!
//! A piece splits into fixed-size blocks; a block is addressed by its
//! piece index, byte offset, and length. Offsets are block-aligned and
//! only the final block of a piece may be short.

use bytes::Bytes;

use crate::constants::BLOCK_SIZE;

/// The address of one block: `(piece, offset, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// Slot index of this block within its piece.
    pub fn slot(&self) -> usize {
        (self.offset / BLOCK_SIZE) as usize
    }

    /// Whether the address is well formed for a piece of `piece_length`.
    pub fn is_aligned(&self, piece_length: u32) -> bool {
        self.offset % BLOCK_SIZE == 0
            && self.offset < piece_length
            && self.length == block_length(piece_length, self.offset / BLOCK_SIZE)
    }
}

/// One block of downloaded data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }

    /// The address this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            piece: self.piece,
            offset: self.offset,
            length: self.data.len() as u32,
        }
    }
}

/// Number of blocks in a piece of the given length.
pub fn block_count(piece_length: u32) -> u32 {
    piece_length.div_ceil(BLOCK_SIZE)
}

/// Length of the block in the given slot of a piece.
pub fn block_length(piece_length: u32, slot: u32) -> u32 {
    piece_length
        .saturating_sub(slot * BLOCK_SIZE)
        .min(BLOCK_SIZE)
}

/// All block addresses of one piece, in offset order.
pub fn blocks(piece: u32, piece_length: u32) -> impl Iterator<Item = BlockRequest> {
    (0..block_count(piece_length)).map(move |slot| BlockRequest {
        piece,
        offset: slot * BLOCK_SIZE,
        length: block_length(piece_length, slot),
    })
}
