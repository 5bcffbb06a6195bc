use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use tracing::{debug, trace};

use super::error::PickerError;
use super::layout::TorrentLayout;
use super::requester::{RequestEnqueuer, Requester};
use super::{PieceSegment, Priority};
use crate::bitfield::Bitfield;
use crate::settings::PickerSettings;

/// An expected block arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    /// Every block of the piece is in; the piece now waits for its hash check.
    pub piece_complete: bool,
    /// Peers that supplied blocks of the piece, filled in on completion.
    pub peers_involved: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
struct BlockState {
    requested_from: Vec<SocketAddr>,
    received_from: Option<SocketAddr>,
}

impl BlockState {
    fn is_free(&self) -> bool {
        self.received_from.is_none() && self.requested_from.is_empty()
    }
}

#[derive(Debug)]
struct PieceProgress {
    blocks: Vec<BlockState>,
    received: usize,
}

impl PieceProgress {
    fn new(blocks: u32) -> Self {
        Self {
            blocks: vec![BlockState::default(); blocks as usize],
            received: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.blocks.len() - self.received
    }

    fn is_idle(&self) -> bool {
        self.received == 0 && self.blocks.iter().all(|b| b.requested_from.is_empty())
    }
}

/// Decides which blocks to request from which peers.
///
/// Called from the owning torrent's tick; it is not shared between threads.
pub struct PiecePicker<E> {
    settings: PickerSettings,
    layout: TorrentLayout,
    enqueuer: E,
    ignored: Bitfield,
    hashing: Bitfield,
    verified: Bitfield,
    priorities: Vec<Priority>,
    pieces: BTreeMap<u32, PieceProgress>,
    requests: HashMap<SocketAddr, BTreeSet<PieceSegment>>,
    rng: StdRng,
    endgame: bool,
}

impl<E: RequestEnqueuer> PiecePicker<E> {
    /// Creates a picker. Pieces set in any of `ignorable` are never requested.
    pub fn new(
        settings: PickerSettings,
        layout: TorrentLayout,
        enqueuer: E,
        ignorable: &[Bitfield],
    ) -> Result<Self, PickerError> {
        let piece_count = layout.piece_count();
        let ignored = merge_ignorable(piece_count, ignorable)?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            settings,
            layout,
            enqueuer,
            ignored,
            hashing: Bitfield::new(piece_count),
            verified: Bitfield::new(piece_count),
            priorities: vec![Priority::Normal; piece_count],
            pieces: BTreeMap::new(),
            requests: HashMap::new(),
            rng,
            endgame: false,
        })
    }

    /// Forgets every request and starts over with a new layout.
    pub fn initialise(
        &mut self,
        layout: TorrentLayout,
        enqueuer: E,
        ignorable: &[Bitfield],
    ) -> Result<(), PickerError> {
        let piece_count = layout.piece_count();
        self.ignored = merge_ignorable(piece_count, ignorable)?;
        self.layout = layout;
        self.enqueuer = enqueuer;
        self.hashing = Bitfield::new(piece_count);
        self.verified = Bitfield::new(piece_count);
        self.priorities = vec![Priority::Normal; piece_count];
        self.pieces.clear();
        self.requests.clear();
        self.endgame = false;
        Ok(())
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn enqueuer(&self) -> &E {
        &self.enqueuer
    }

    pub fn enqueuer_mut(&mut self) -> &mut E {
        &mut self.enqueuer
    }

    /// Pieces whose hash check passed.
    pub fn verified(&self) -> &Bitfield {
        &self.verified
    }

    pub fn in_endgame_mode(&self) -> bool {
        self.endgame
    }

    pub fn outstanding_count(&self, peer: SocketAddr) -> usize {
        self.requests.get(&peer).map_or(0, BTreeSet::len)
    }

    pub fn outstanding(&self, peer: SocketAddr) -> impl Iterator<Item = PieceSegment> + '_ {
        self.requests.get(&peer).into_iter().flatten().copied()
    }

    fn wanted(&self, piece: u32) -> bool {
        let index = piece as usize;
        index < self.layout.piece_count()
            && !self.ignored.has(index)
            && !self.hashing.has(index)
            && !self.verified.has(index)
            && self.priorities[index] != Priority::DoNotDownload
    }

    /// Whether `bitfield` has any piece we still want.
    pub fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        bitfield.iter_ones().any(|piece| self.wanted(piece as u32))
    }

    fn unreceived_blocks(&self) -> usize {
        (0..self.layout.piece_count() as u32)
            .filter(|&piece| self.wanted(piece))
            .map(|piece| match self.pieces.get(&piece) {
                Some(progress) => progress.remaining(),
                None => self.layout.blocks_in_piece(piece) as usize,
            })
            .sum()
    }

    /// Tops up every peer's request queue. Returns the number of requests sent.
    pub fn add_requests<R: Requester>(&mut self, peers: &[R]) -> usize {
        let piece_count = self.layout.piece_count();

        let mut availability = vec![0u32; piece_count];
        for peer in peers {
            for piece in peer.bitfield().iter_ones() {
                if let Some(count) = availability.get_mut(piece) {
                    *count += 1;
                }
            }
        }

        let capacity: usize = peers.iter().map(Requester::max_pending_requests).sum();
        let unreceived = self.unreceived_blocks();
        let endgame = unreceived > 0 && unreceived < capacity;
        if endgame != self.endgame {
            debug!(
                "Endgame mode {} with {} blocks left",
                if endgame { "entered" } else { "left" },
                unreceived
            );
            self.endgame = endgame;
        }

        let tiebreak: Vec<u32> = if self.settings.randomised {
            (0..piece_count).map(|_| self.rng.random()).collect()
        } else {
            (0..piece_count as u32).collect()
        };

        peers
            .iter()
            .map(|peer| self.request_from(peer, &availability, &tiebreak))
            .sum()
    }

    fn request_from<R: Requester>(
        &mut self,
        peer: &R,
        availability: &[u32],
        tiebreak: &[u32],
    ) -> usize {
        let choked = peer.is_choking();
        if choked && !peer.supports_fast_peer() {
            return 0;
        }

        let addr = peer.addr();
        let mut capacity = peer
            .max_pending_requests()
            .saturating_sub(self.outstanding_count(addr));
        if capacity == 0 {
            return 0;
        }

        let eligible = |picker: &Self, piece: u32| {
            picker.wanted(piece)
                && peer.bitfield().has(piece as usize)
                && (!choked || peer.is_allowed_fast(piece))
        };

        let mut order: Vec<u32> = self
            .pieces
            .keys()
            .copied()
            .filter(|&piece| eligible(self, piece))
            .collect();
        for &piece in peer.suggested_pieces() {
            if !order.contains(&piece) && eligible(self, piece) {
                order.push(piece);
            }
        }

        let mut fresh: Vec<u32> = (0..self.layout.piece_count() as u32)
            .filter(|piece| !order.contains(piece) && eligible(self, *piece))
            .collect();
        fresh.sort_by_key(|&piece| {
            let index = piece as usize;
            let rarity = if self.settings.rarest_first {
                availability[index]
            } else {
                0
            };
            (Reverse(self.priorities[index]), rarity, tiebreak[index])
        });
        order.extend(fresh);

        let mut added = self.fill(addr, &order, &mut capacity, false);
        if self.endgame && capacity > 0 {
            added += self.fill(addr, &order, &mut capacity, true);
        }
        if added > 0 {
            trace!("Requested {} blocks from {}", added, addr);
        }
        added
    }

    /// Requests blocks of `order` from `peer`. The first pass only takes free
    /// blocks; the endgame pass also takes blocks already requested elsewhere.
    fn fill(
        &mut self,
        peer: SocketAddr,
        order: &[u32],
        capacity: &mut usize,
        duplicate: bool,
    ) -> usize {
        let max_requesters = self.settings.endgame_max_requesters;
        let mut added = 0;

        for &piece in order {
            let blocks = self.layout.blocks_in_piece(piece);
            for block in 0..blocks {
                if *capacity == 0 {
                    return added;
                }

                let state = &self
                    .pieces
                    .entry(piece)
                    .or_insert_with(|| PieceProgress::new(blocks))
                    .blocks[block as usize];
                let take = if duplicate {
                    state.received_from.is_none()
                        && !state.requested_from.contains(&peer)
                        && state.requested_from.len() < max_requesters
                } else {
                    state.is_free()
                };

                if take {
                    self.request(peer, PieceSegment::new(piece, block));
                    *capacity -= 1;
                    added += 1;
                }
            }
            self.drop_if_idle(piece);
        }
        added
    }

    fn request(&mut self, peer: SocketAddr, segment: PieceSegment) {
        if let Some(progress) = self.pieces.get_mut(&segment.piece) {
            progress.blocks[segment.block as usize].requested_from.push(peer);
        }
        self.requests.entry(peer).or_default().insert(segment);
        self.enqueuer.request(peer, self.layout.block_request(segment));
    }

    /// Removes `peer` from the requesters of `segment`. The caller has
    /// already taken it out of the peer's outstanding set.
    fn forget_request(&mut self, peer: SocketAddr, segment: PieceSegment) {
        if let Some(state) = self
            .pieces
            .get_mut(&segment.piece)
            .and_then(|progress| progress.blocks.get_mut(segment.block as usize))
        {
            state.requested_from.retain(|p| *p != peer);
        }
        self.drop_if_idle(segment.piece);
    }

    fn drop_if_idle(&mut self, piece: u32) {
        if self.pieces.get(&piece).is_some_and(PieceProgress::is_idle) {
            self.pieces.remove(&piece);
        }
    }

    fn take_outstanding(&mut self, peer: SocketAddr, segment: PieceSegment) -> bool {
        self.requests
            .get_mut(&peer)
            .is_some_and(|set| set.remove(&segment))
    }

    /// Records a block from `peer`.
    ///
    /// Returns `None` when the block was not outstanding at that peer. The
    /// first copy of a block wins; duplicate requests at other peers are
    /// cancelled.
    pub fn validate_piece(
        &mut self,
        peer: SocketAddr,
        segment: PieceSegment,
    ) -> Option<ReceivedBlock> {
        if !self.take_outstanding(peer, segment) {
            debug!("Unexpected block {:?} from {}", segment, peer);
            return None;
        }

        let progress = self.pieces.get_mut(&segment.piece)?;
        let state = progress.blocks.get_mut(segment.block as usize)?;
        let duplicates: Vec<SocketAddr> = state
            .requested_from
            .drain(..)
            .filter(|p| *p != peer)
            .collect();
        state.received_from = Some(peer);
        progress.received += 1;

        let piece_complete = progress.remaining() == 0;
        let mut peers_involved = Vec::new();
        if piece_complete {
            for supplier in progress.blocks.iter().filter_map(|b| b.received_from) {
                if !peers_involved.contains(&supplier) {
                    peers_involved.push(supplier);
                }
            }
            self.pieces.remove(&segment.piece);
            self.hashing.set(segment.piece as usize);
            trace!("Piece {} complete, awaiting hash check", segment.piece);
        }

        let request = self.layout.block_request(segment);
        for other in duplicates {
            self.take_outstanding(other, segment);
            self.enqueuer.cancel(other, request);
        }

        Some(ReceivedBlock {
            piece_complete,
            peers_involved,
        })
    }

    /// Cancels the requests to `peer` for pieces in `start..end`.
    ///
    /// Peers without the fast extension cannot be asked to drop requests, so
    /// nothing happens for them. Returns the number of cancelled requests.
    pub fn cancel_requests<R: Requester + ?Sized>(
        &mut self,
        peer: &R,
        start: u32,
        end: u32,
    ) -> usize {
        if !peer.supports_fast_peer() || start >= end {
            return 0;
        }

        let addr = peer.addr();
        let Some(set) = self.requests.get_mut(&addr) else {
            return 0;
        };
        let cancelled: Vec<PieceSegment> = set
            .range(PieceSegment::new(start, 0)..PieceSegment::new(end, 0))
            .copied()
            .collect();
        for segment in &cancelled {
            set.remove(segment);
        }

        for &segment in &cancelled {
            self.forget_request(addr, segment);
            self.enqueuer.cancel(addr, self.layout.block_request(segment));
        }
        cancelled.len()
    }

    /// The peer rejected a request; the block can be requested again at once.
    pub fn request_rejected(&mut self, peer: SocketAddr, segment: PieceSegment) -> bool {
        if !self.take_outstanding(peer, segment) {
            debug!("Reject for {:?} not requested from {}", segment, peer);
            return false;
        }
        self.forget_request(peer, segment);
        true
    }

    /// Drops every request to `peer` without sending cancels, e.g. after a
    /// disconnect.
    pub fn remove_peer(&mut self, peer: SocketAddr) -> usize {
        let Some(set) = self.requests.remove(&peer) else {
            return 0;
        };
        for &segment in &set {
            self.forget_request(peer, segment);
        }
        set.len()
    }

    /// Result of hashing a completed piece. A failed piece is requested again.
    pub fn piece_hashed(&mut self, piece: u32, passed: bool) {
        let index = piece as usize;
        if !self.hashing.has(index) {
            debug!("Hash result for piece {} which was not pending", piece);
            return;
        }

        self.hashing.clear(index);
        if passed {
            self.verified.set(index);
        } else {
            debug!("Piece {} failed its hash check", piece);
        }
    }

    /// Sets per file priorities. A piece takes the highest priority of the
    /// files it overlaps; requests for pieces that became `DoNotDownload` are
    /// cancelled.
    pub fn set_file_priorities(&mut self, priorities: &[Priority]) -> Result<(), PickerError> {
        let files = self.layout.files().len();
        if priorities.len() != files {
            return Err(PickerError::PriorityLength {
                expected: files,
                actual: priorities.len(),
            });
        }

        let mut piece_priorities = vec![Priority::DoNotDownload; self.layout.piece_count()];
        for (file, &priority) in priorities.iter().enumerate() {
            for piece in self.layout.file_pieces(file) {
                let slot = &mut piece_priorities[piece as usize];
                *slot = (*slot).max(priority);
            }
        }
        self.priorities = piece_priorities;

        let mut skipped = Vec::new();
        for (&peer, set) in &self.requests {
            for &segment in set {
                if self.priorities[segment.piece as usize] == Priority::DoNotDownload {
                    skipped.push((peer, segment));
                }
            }
        }

        for (peer, segment) in skipped {
            self.take_outstanding(peer, segment);
            self.forget_request(peer, segment);
            self.enqueuer.cancel(peer, self.layout.block_request(segment));
        }
        Ok(())
    }
}

fn merge_ignorable(piece_count: usize, ignorable: &[Bitfield]) -> Result<Bitfield, PickerError> {
    let mut ignored = Bitfield::new(piece_count);
    for bitfield in ignorable {
        if bitfield.len() != piece_count {
            return Err(PickerError::BitfieldLength {
                expected: piece_count,
                actual: bitfield.len(),
            });
        }
        ignored.union_with(bitfield);
    }
    Ok(ignored)
}
