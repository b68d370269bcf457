use std::collections::HashSet;

use parking_lot::Mutex;

/// Keys written on the source shard since the last drain.
#[derive(Debug, Default)]
pub struct DirtyKeyTracker {
    keys: Mutex<HashSet<String>>,
}

impl DirtyKeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut set = self.keys.lock();
        set.extend(keys.into_iter().map(Into::into));
    }

    /// Takes every tracked key, leaving the tracker empty.
    pub fn drain_and_reset(&self) -> HashSet<String> {
        std::mem::take(&mut *self.keys.lock())
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}
