use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::node::compact_peer;
use crate::constants::DHT_TOKEN_SECRET_LEN;

type Secret = [u8; DHT_TOKEN_SECRET_LEN];

/// Issues and checks the write tokens handed out in `get_peers` replies.
///
/// A token is the SHA-1 of the requester's compact address and a secret. The
/// secret rotates every `timeout`; tokens made with the current or the
/// previous secret are accepted, so a token stays valid for one to two
/// timeouts without any per-node state.
pub struct TokenManager {
    secret: Secret,
    previous_secret: Secret,
    last_generation: Instant,
    timeout: Duration,
}

impl TokenManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            secret: rand::random(),
            previous_secret: rand::random(),
            last_generation: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn generate_token(&mut self, addr: &SocketAddr) -> Bytes {
        self.rotate_if_expired();
        Self::hash(addr, &self.secret)
    }

    pub fn verify_token(&mut self, addr: &SocketAddr, token: &[u8]) -> bool {
        self.rotate_if_expired();
        Self::hash(addr, &self.secret) == token || Self::hash(addr, &self.previous_secret) == token
    }

    // Rotations are aligned to `last_generation` so a secret never lives
    // longer than two timeouts, however rarely we are asked for tokens.
    fn rotate_if_expired(&mut self) {
        let mut rotations = 0;
        while self.last_generation.elapsed() > self.timeout && rotations < 2 {
            self.previous_secret = self.secret;
            self.secret = rand::random();
            self.last_generation += self.timeout;
            rotations += 1;
        }

        if rotations > 0 {
            trace!("DHT token secret rotated {} time(s)", rotations);
        }
        if self.last_generation.elapsed() > self.timeout {
            self.last_generation = Instant::now();
        }
    }

    fn hash(addr: &SocketAddr, secret: &Secret) -> Bytes {
        let mut hasher = Sha1::new();
        match compact_peer(addr) {
            Some(compact) => hasher.update(compact),
            None => {
                hasher.update(addr.ip().to_string().as_bytes());
                hasher.update(addr.port().to_be_bytes());
            }
        }
        hasher.update(secret);
        Bytes::copy_from_slice(&hasher.finalize())
    }
}
