//! Jobsets: the `(project, jobset)` grouping used for fair-share dispatch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::Mutex;

/// `(project, jobset)` pair identifying a jobset.
pub type JobsetKey = (String, String);

/// Per-jobset scheduling weight plus a rolling window of recently consumed
/// build time, shared by all builds of the jobset.
pub struct Jobset {
    shares: AtomicU32,
    /// Total seconds consumed by the steps currently in the window.
    seconds: AtomicI64,
    /// Step start time -> duration.
    steps: Mutex<BTreeMap<i64, i64>>,
}

impl Jobset {
    /// Window over which build time counts against a jobset's share.
    pub const SCHEDULING_WINDOW: i64 = 24 * 60 * 60;

    pub fn new(shares: u32) -> Self {
        Self {
            shares: AtomicU32::new(shares.max(1)),
            seconds: AtomicI64::new(0),
            steps: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn set_shares(&self, shares: u32) {
        self.shares.store(shares.max(1), Ordering::Relaxed);
    }

    /// Seconds consumed per share: the quantity the dispatcher minimizes
    /// across jobsets.
    pub fn share_used(&self) -> f64 {
        self.seconds.load(Ordering::Relaxed) as f64 / f64::from(self.shares())
    }

    /// Account a finished (or historical) step.
    pub fn add_step(&self, start_time: i64, duration: i64) {
        let mut steps = self.steps.lock();
        if steps.insert(start_time, duration).is_none() {
            self.seconds.fetch_add(duration, Ordering::Relaxed);
        }
    }

    /// Drop steps that started before the scheduling window.
    pub fn prune_steps(&self, now: i64) {
        let horizon = now - Self::SCHEDULING_WINDOW;
        let mut steps = self.steps.lock();
        while let Some((&start, &duration)) = steps.first_key_value() {
            if start >= horizon {
                break;
            }
            steps.remove(&start);
            self.seconds.fetch_sub(duration, Ordering::Relaxed);
        }
    }
}
