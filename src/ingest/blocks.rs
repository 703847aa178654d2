use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shortest block ever applied to a rate-limited instance.
pub const MIN_BLOCK: Duration = Duration::from_secs(30);
/// Longest block ever applied.
pub const MAX_BLOCK: Duration = Duration::from_secs(24 * 60 * 60);

/// Instances that answered 429, and until when they are left alone.
#[derive(Default)]
pub struct InstanceBlocks {
    until: Mutex<HashMap<String, Instant>>,
}

impl InstanceBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left on the instance's block, if any. Expired blocks are dropped.
    pub fn remaining(&self, instance: &str) -> Option<Duration> {
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = *until.get(instance)?;
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            until.remove(instance);
            return None;
        }
        Some(left)
    }

    pub fn block(&self, instance: &str, duration: Duration) {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration.clamp(MIN_BLOCK, MAX_BLOCK))
            .or_else(|| now.checked_add(MIN_BLOCK))
            .unwrap_or(now);
        let mut until = self.until.lock().unwrap_or_else(|e| e.into_inner());
        until.insert(instance.to_string(), deadline);
    }
}
