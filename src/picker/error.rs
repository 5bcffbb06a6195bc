use thiserror::Error;

/// Errors returned when setting up a [`PiecePicker`](super::PiecePicker).
#[derive(Debug, Error)]
pub enum PickerError {
    /// An ignorable bitfield does not describe the torrent's pieces.
    #[error("bitfield has {actual} pieces, torrent has {expected}")]
    BitfieldLength { expected: usize, actual: usize },

    /// File priorities were given for the wrong number of files.
    #[error("{actual} file priorities for {expected} files")]
    PriorityLength { expected: usize, actual: usize },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
