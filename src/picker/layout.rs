use std::ops::Range;

use super::error::PickerError;
use super::PieceSegment;
use crate::constants::BLOCK_SIZE;

/// A `request`/`cancel` as it goes on the wire.
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
}

/// Piece and file geometry of a torrent.
///
/// Pieces are `piece_length` bytes except the last, blocks are
/// [`BLOCK_SIZE`] bytes except the last block of each piece. Every size is
/// derived from the total length so the blocks of all pieces add up to it
/// exactly.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    piece_length: u32,
    total_length: u64,
    piece_count: usize,
    files: Vec<u64>,
}

impl TorrentLayout {
    /// A single file torrent.
    pub fn new(total_length: u64, piece_length: u32) -> Result<Self, PickerError> {
        Self::with_files(piece_length, vec![total_length])
    }

    /// A torrent made of files of the given lengths, laid out back to back.
    pub fn with_files(piece_length: u32, files: Vec<u64>) -> Result<Self, PickerError> {
        if piece_length == 0 {
            return Err(PickerError::InvalidLayout("piece length is zero".into()));
        }

        let total_length = files
            .iter()
            .try_fold(0u64, |sum, &len| sum.checked_add(len))
            .ok_or_else(|| PickerError::InvalidLayout("total length overflows".into()))?;
        let piece_count = u32::try_from(total_length.div_ceil(u64::from(piece_length)))
            .map_err(|_| PickerError::InvalidLayout("too many pieces".into()))?;

        Ok(Self {
            piece_length,
            total_length,
            piece_count: piece_count as usize,
            files,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// File lengths in torrent order.
    pub fn files(&self) -> &[u64] {
        &self.files
    }

    /// Length of `piece`, zero past the end of the torrent.
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = u64::from(piece) * u64::from(self.piece_length);
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(u64::from(self.piece_length)) as u32
    }

    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(BLOCK_SIZE)
    }

    pub fn block_size(&self, piece: u32, block: u32) -> u32 {
        self.piece_size(piece)
            .saturating_sub(block.saturating_mul(BLOCK_SIZE))
            .min(BLOCK_SIZE)
    }

    pub fn block_request(&self, segment: PieceSegment) -> BlockRequest {
        BlockRequest::new(
            segment.piece,
            segment.block * BLOCK_SIZE,
            self.block_size(segment.piece, segment.block),
        )
    }

    /// The segment a wire request refers to, if it is a whole block.
    pub fn segment_for(&self, request: &BlockRequest) -> Option<PieceSegment> {
        if request.offset % BLOCK_SIZE != 0 {
            return None;
        }
        let segment = PieceSegment::new(request.piece, request.offset / BLOCK_SIZE);
        let length = self.block_size(segment.piece, segment.block);
        (length != 0 && length == request.length).then_some(segment)
    }

    /// Pieces holding at least one byte of file `index`.
    pub fn file_pieces(&self, index: usize) -> Range<u32> {
        let Some(&len) = self.files.get(index) else {
            return 0..0;
        };
        if len == 0 {
            return 0..0;
        }

        let start: u64 = self.files[..index].iter().sum();
        let piece_length = u64::from(self.piece_length);
        (start / piece_length) as u32..(start + len).div_ceil(piece_length) as u32
    }
}
