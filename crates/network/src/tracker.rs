//! Stream request timestamp tracking
//!
//! Remembers which request timestamps each source key has used so replayed
//! requests are refused. Under [`ReplayProtection::Window`] requests from one
//! source may arrive out of order as long as they fall inside the replay
//! window; [`ReplayProtection::Strict`] demands strictly increasing stamps.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dmsg_core::{unix_nanos, DmsgError, PublicKey, ReplayProtection};
use parking_lot::Mutex;

use crate::object::{Signed, StreamRequest};

/// Maximum number of sources remembered
const DEFAULT_CAPACITY: usize = 4096;

/// How far behind the newest accepted stamp a request may lag.
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Accepted stamps kept per source before the floor is raised.
const MAX_RECENT: usize = 1024;

struct Seen {
    newest: i64,
    /// Stamps at or below this are refused regardless of the window.
    floor: i64,
    recent: BTreeSet<i64>,
    at: Instant,
}

impl Seen {
    fn new() -> Self {
        Self {
            newest: 0,
            floor: 0,
            recent: BTreeSet::new(),
            at: Instant::now(),
        }
    }

    fn lower_bound(&self, policy: ReplayProtection, window: i64) -> i64 {
        match policy {
            ReplayProtection::Strict => self.newest,
            _ => self.floor.max(self.newest.saturating_sub(window)),
        }
    }

    fn record(&mut self, timestamp: i64, window: i64) {
        self.newest = self.newest.max(timestamp);
        self.at = Instant::now();
        self.recent.insert(timestamp);

        let horizon = self.newest.saturating_sub(window);
        self.recent = self.recent.split_off(&horizon);
        while self.recent.len() > MAX_RECENT {
            match self.recent.pop_first() {
                Some(oldest) => self.floor = self.floor.max(oldest),
                None => break,
            }
        }
    }
}

pub struct TimestampTracker {
    policy: ReplayProtection,
    window: i64,
    seen: Mutex<HashMap<PublicKey, Seen>>,
    capacity: usize,
}

impl TimestampTracker {
    pub fn new(policy: ReplayProtection) -> Self {
        Self::with_capacity(policy, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(policy: ReplayProtection, capacity: usize) -> Self {
        Self {
            policy,
            window: i64::try_from(DEFAULT_REPLAY_WINDOW.as_nanos()).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
        self
    }

    pub fn policy(&self) -> ReplayProtection {
        self.policy
    }

    /// Verify `req` and, if it passes, remember its timestamp.
    pub fn verify(&self, req: &Signed<StreamRequest>) -> Result<(), DmsgError> {
        if self.policy == ReplayProtection::Disabled {
            return req.verify(0);
        }

        let mut seen = self.seen.lock();
        let bound = seen
            .get(&req.src.pk)
            .map_or(0, |s| s.lower_bound(self.policy, self.window));
        req.verify(bound)?;
        if seen
            .get(&req.src.pk)
            .is_some_and(|s| s.recent.contains(&req.timestamp))
        {
            return Err(DmsgError::ReqInvalidTimestamp);
        }

        if !seen.contains_key(&req.src.pk) && seen.len() >= self.capacity {
            if let Some(oldest) = seen.iter().min_by_key(|(_, s)| s.at).map(|(pk, _)| *pk) {
                seen.remove(&oldest);
            }
        }
        seen.entry(req.src.pk)
            .or_insert_with(Seen::new)
            .record(req.timestamp, self.window);
        Ok(())
    }

    /// Newest accepted timestamp from `pk`.
    pub fn last(&self, pk: &PublicKey) -> Option<i64> {
        self.seen.lock().get(pk).map(|s| s.newest)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strictly increasing nanosecond timestamps for outgoing requests.
#[derive(Debug, Default)]
pub struct TimestampClock(AtomicI64);

impl TimestampClock {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn next(&self) -> i64 {
        let now = unix_nanos();
        let mut last = self.0.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .0
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dmsg_core::Addr;
    use dmsg_crypto::Keypair;

    use super::*;

    fn request(src: &Keypair, timestamp: i64) -> Signed<StreamRequest> {
        Signed::sign(
            StreamRequest {
                timestamp,
                src: Addr::new(src.public_key(), 50000),
                dst: Addr::new(Keypair::generate().public_key(), 80),
                noise_msg: Vec::new(),
            },
            src,
        )
        .unwrap()
    }

    #[test]
    fn test_strict_rejects_replay() {
        let tracker = TimestampTracker::new(ReplayProtection::Strict);
        let kp = Keypair::generate();
        let req = request(&kp, 100);

        tracker.verify(&req).unwrap();
        assert_eq!(tracker.verify(&req), Err(DmsgError::ReqInvalidTimestamp));
        assert_eq!(
            tracker.verify(&request(&kp, 99)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        tracker.verify(&request(&kp, 101)).unwrap();
        assert_eq!(tracker.last(&kp.public_key()), Some(101));
    }

    #[test]
    fn test_window_accepts_reordered_requests() {
        let tracker = TimestampTracker::new(ReplayProtection::Window);
        let kp = Keypair::generate();
        let base = 1_000_000_000_000;

        tracker.verify(&request(&kp, base + 3)).unwrap();
        tracker.verify(&request(&kp, base + 1)).unwrap();
        tracker.verify(&request(&kp, base + 2)).unwrap();
        assert_eq!(tracker.last(&kp.public_key()), Some(base + 3));

        // Every stamp is good exactly once.
        for ts in [base + 1, base + 2, base + 3] {
            assert_eq!(
                tracker.verify(&request(&kp, ts)),
                Err(DmsgError::ReqInvalidTimestamp)
            );
        }
    }

    #[test]
    fn test_window_rejects_stamps_behind_window() {
        let tracker = TimestampTracker::new(ReplayProtection::Window)
            .with_window(Duration::from_nanos(100));
        let kp = Keypair::generate();

        tracker.verify(&request(&kp, 1_000)).unwrap();
        tracker.verify(&request(&kp, 950)).unwrap();
        assert_eq!(
            tracker.verify(&request(&kp, 900)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        assert_eq!(
            tracker.verify(&request(&kp, 850)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
    }

    #[test]
    fn test_window_forgets_stamps_behind_window() {
        let tracker = TimestampTracker::new(ReplayProtection::Window)
            .with_window(Duration::from_nanos(100));
        let kp = Keypair::generate();

        tracker.verify(&request(&kp, 1_000)).unwrap();
        tracker.verify(&request(&kp, 2_000)).unwrap();
        // 1_000 fell behind the window, so it is refused as stale, not by
        // lookup.
        assert_eq!(
            tracker.verify(&request(&kp, 1_000)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        let recent = tracker.seen.lock()[&kp.public_key()].recent.clone();
        assert_eq!(recent.into_iter().collect::<Vec<_>>(), vec![2_000]);
    }

    #[test]
    fn test_window_raises_floor_when_full() {
        let tracker = TimestampTracker::new(ReplayProtection::Window);
        let kp = Keypair::generate();
        let base = 1_000_000_000_000;
        for i in 0..=MAX_RECENT as i64 {
            tracker.verify(&request(&kp, base + 2 * i)).unwrap();
        }
        // The oldest stamp was evicted and the floor now covers it.
        assert_eq!(
            tracker.verify(&request(&kp, base)),
            Err(DmsgError::ReqInvalidTimestamp)
        );
        tracker.verify(&request(&kp, base + 1)).unwrap();
    }

    #[test]
    fn test_sources_tracked_separately() {
        let tracker = TimestampTracker::new(ReplayProtection::Strict);
        tracker.verify(&request(&Keypair::generate(), 100)).unwrap();
        tracker.verify(&request(&Keypair::generate(), 100)).unwrap();
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_rejected_request_not_recorded() {
        let tracker = TimestampTracker::new(ReplayProtection::Strict);
        let kp = Keypair::generate();
        let mut value = request(&kp, 100).value().clone();
        value.timestamp = 200;
        let forged = Signed::sign(value, &Keypair::generate()).unwrap();

        assert_eq!(tracker.verify(&forged), Err(DmsgError::ReqInvalidSig));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_disabled_allows_replay() {
        let tracker = TimestampTracker::new(ReplayProtection::Disabled);
        let req = request(&Keypair::generate(), 100);
        tracker.verify(&req).unwrap();
        tracker.verify(&req).unwrap();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let tracker = TimestampTracker::with_capacity(ReplayProtection::Strict, 2);
        let first = Keypair::generate();
        tracker.verify(&request(&first, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.verify(&request(&Keypair::generate(), 1)).unwrap();
        tracker.verify(&request(&Keypair::generate(), 1)).unwrap();

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.last(&first.public_key()), None);
    }

    #[test]
    fn test_clock_strictly_increases() {
        let clock = TimestampClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }
}
