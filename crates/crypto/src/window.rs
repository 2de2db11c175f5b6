use dmsg_core::NONCE_WINDOW;
use thiserror::Error;

const WORDS: usize = (NONCE_WINDOW as usize).div_ceil(64);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce {0} was already used")]
    Replayed(u64),
    #[error("Nonce {0} is older than the replay window")]
    Stale(u64),
    #[error("Nonce 0 is never issued")]
    Zero,
}

/// Sliding replay window over received nonces.
///
/// Nonces may arrive out of order (frames from concurrent sub-streams race
/// each other), so instead of requiring strict monotonicity the window
/// remembers which of the last [`NONCE_WINDOW`] nonces below the highest
/// seen one were already accepted.
#[derive(Debug, Clone)]
pub struct NonceWindow {
    highest: u64,
    seen: [u64; WORDS],
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            seen: [0; WORDS],
        }
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Whether `nonce` would be accepted. Does not record it.
    pub fn check(&self, nonce: u64) -> Result<(), NonceError> {
        if nonce == 0 {
            return Err(NonceError::Zero);
        }
        if nonce > self.highest {
            return Ok(());
        }
        if self.highest - nonce >= NONCE_WINDOW {
            return Err(NonceError::Stale(nonce));
        }
        if self.is_set(nonce) {
            return Err(NonceError::Replayed(nonce));
        }
        Ok(())
    }

    /// Record `nonce` as used. Call only after the frame authenticated.
    pub fn commit(&mut self, nonce: u64) {
        if nonce > self.highest {
            let advance = nonce - self.highest;
            if advance >= NONCE_WINDOW {
                self.seen = [0; WORDS];
            } else {
                for n in self.highest + 1..nonce {
                    self.clear(n);
                }
            }
            self.highest = nonce;
        }
        self.set(nonce);
    }

    fn slot(nonce: u64) -> (usize, u64) {
        let bit = (nonce % NONCE_WINDOW) as usize;
        (bit / 64, 1u64 << (bit % 64))
    }

    fn is_set(&self, nonce: u64) -> bool {
        let (word, mask) = Self::slot(nonce);
        self.seen[word] & mask != 0
    }

    fn set(&mut self, nonce: u64) {
        let (word, mask) = Self::slot(nonce);
        self.seen[word] |= mask;
    }

    fn clear(&mut self, nonce: u64) {
        let (word, mask) = Self::slot(nonce);
        self.seen[word] &= !mask;
    }
}
