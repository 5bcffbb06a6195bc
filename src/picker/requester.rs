use std::net::SocketAddr;

use super::layout::BlockRequest;
use crate::bitfield::Bitfield;
use crate::constants::{
    BLOCK_SIZE, MAX_REQUESTS_PER_PEER, MIN_PENDING_REQUESTS, REQUEST_PIPELINE_SECONDS,
};

/// What the picker needs to know about a connected peer.
pub trait Requester {
    fn addr(&self) -> SocketAddr;

    /// Pieces the peer has announced.
    fn bitfield(&self) -> &Bitfield;

    /// Requests the peer may have in flight at once.
    fn max_pending_requests(&self) -> usize;

    /// Whether the peer is choking us.
    fn is_choking(&self) -> bool;

    /// Fast extension (BEP-6). Without it requests can be neither rejected
    /// nor served while choked.
    fn supports_fast_peer(&self) -> bool;

    /// Pieces we may request while choked.
    fn is_allowed_fast(&self, _piece: u32) -> bool {
        false
    }

    /// Pieces the peer sent `suggest_piece` for.
    fn suggested_pieces(&self) -> &[u32] {
        &[]
    }
}

/// Outbound request queue of the peer wire layer.
pub trait RequestEnqueuer {
    fn request(&mut self, peer: SocketAddr, request: BlockRequest);

    fn cancel(&mut self, peer: SocketAddr, request: BlockRequest);
}

/// Requests to keep in flight to a peer delivering `download_rate` bytes per
/// second: enough blocks to cover [`REQUEST_PIPELINE_SECONDS`], never more
/// than the peer's advertised `reqq`.
pub fn recommended_pending_requests(download_rate: u64, reqq: Option<usize>) -> usize {
    let limit = reqq
        .unwrap_or(MAX_REQUESTS_PER_PEER)
        .clamp(1, MAX_REQUESTS_PER_PEER);
    let blocks = download_rate.saturating_mul(REQUEST_PIPELINE_SECONDS) / u64::from(BLOCK_SIZE);
    usize::try_from(blocks)
        .unwrap_or(usize::MAX)
        .max(MIN_PENDING_REQUESTS)
        .min(limit)
}
