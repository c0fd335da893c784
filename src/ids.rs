use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out ids in sequence (1, 2, 3...). Safe to share between threads.
#[derive(Debug, Default)]
pub struct ReferenceIdGenerator {
    last: AtomicU64,
}

impl ReferenceIdGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn new_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }
}
