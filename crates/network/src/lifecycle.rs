use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifeState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// Open → Closing → Closed state shared by sessions, listeners and entities.
///
/// Only the caller that wins [`Lifecycle::begin_close`] runs teardown, which
/// makes every `close()` built on top of it idempotent.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self(AtomicU8::new(LifeState::Open as u8))
    }

    pub fn state(&self) -> LifeState {
        match self.0.load(Ordering::Acquire) {
            0 => LifeState::Open,
            1 => LifeState::Closing,
            _ => LifeState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == LifeState::Open
    }

    /// Returns true for exactly one caller.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                LifeState::Open as u8,
                LifeState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.0.store(LifeState::Closed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_closer() {
        let life = Lifecycle::new();
        assert!(life.is_open());
        assert!(life.begin_close());
        assert!(!life.begin_close());
        assert_eq!(life.state(), LifeState::Closing);
        life.finish_close();
        assert_eq!(life.state(), LifeState::Closed);
        assert!(!life.begin_close());
    }
}
