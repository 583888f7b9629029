use std::sync::atomic::{AtomicU64, Ordering};

/*
    Lamport clock. Every locally generated event increments the counter,
    every timestamp observed from a peer is folded in with max(). The value
    never decreases, so two requests stamped by the same process always
    carry distinct timestamps and the (timestamp, server id) pair is unique
    across the cluster.
*/

pub type Timestamp = u64;

#[derive(Debug, Default)]
pub struct LogicalClock {
    time: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock {
            time: AtomicU64::new(0),
        }
    }

    /// Stamps a locally originated request.
    pub fn increment_and_stamp(&self) -> Timestamp {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn update(&self, observed: Timestamp) {
        self.time.fetch_max(observed, Ordering::SeqCst);
    }

    /// Receive event: folds `observed` in, then counts the receipt itself as
    /// a local event. Returns the new value.
    pub fn witness(&self, observed: Timestamp) -> Timestamp {
        self.update(observed);
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
