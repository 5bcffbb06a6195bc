//! Block request coordination.
//!
//! [`PiecePicker`] maps the pieces peers advertise onto block requests. It
//! keeps one set of outstanding [`PieceSegment`]s per peer, prefers pieces
//! already in progress, then suggested pieces, then new pieces by priority
//! and rarity. Near the end of a download it switches to endgame mode and
//! requests the remaining blocks from several peers, cancelling the
//! duplicates once the first copy arrives.
//!
//! The picker performs no I/O. Requests and cancels go out through a
//! [`RequestEnqueuer`].

mod error;
mod layout;
mod piece_picker;
mod requester;

pub use error::PickerError;
pub use layout::{BlockRequest, TorrentLayout};
pub use piece_picker::{PiecePicker, ReceivedBlock};
pub use requester::{recommended_pending_requests, RequestEnqueuer, Requester};

/// One block of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceSegment {
    pub piece: u32,
    pub block: u32,
}

impl PieceSegment {
    pub fn new(piece: u32, block: u32) -> Self {
        Self { piece, block }
    }
}

/// Download priority of a file, and of the pieces it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    DoNotDownload,
    Low,
    #[default]
    Normal,
    High,
}
