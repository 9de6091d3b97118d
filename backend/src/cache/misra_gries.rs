use std::collections::HashMap;

use crate::Error;

/// Bounded-space approximate heavy-hitters counter (Misra–Gries), with
/// counters capped at `min_hits`. [CappedMisraGries::observe] answers the
/// only question the cache asks: has this key been seen often enough to
/// deserve a cache slot?
pub(crate) struct CappedMisraGries {
    k: usize,
    min_hits: usize,
    counters: HashMap<String, usize>,
}

impl CappedMisraGries {
    pub(crate) fn new(k: usize, min_hits: usize) -> Result<Self, Error> {
        if min_hits < 1 {
            return Err(Error::Storage(
                "invalid cache frequency cap".to_string(),
            ));
        }
        Ok(Self {
            k,
            min_hits,
            counters: HashMap::new(),
        })
    }

    /// Records one observation of `key`. Returns true once the key's
    /// counter has reached `min_hits`; a key observed fewer times never
    /// becomes cache-eligible.
    pub(crate) fn observe(&mut self, key: &str) -> bool {
        if let Some(count) = self.counters.get_mut(key) {
            if *count < self.min_hits {
                *count += 1;
            }
            return *count >= self.min_hits;
        }

        if self.counters.len() < self.k.saturating_sub(1) {
            self.counters.insert(key.to_string(), 1);
            return self.min_hits <= 1;
        }

        // summary is full: decrement everything, dropping zeroed keys
        self.counters.retain(|_, count| {
            *count -= 1;
            *count > 0
        });
        false
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.counters.remove(key);
    }

    pub(crate) fn counters(&self) -> impl Iterator<Item = (&String, &usize)> {
        self.counters.iter()
    }

    pub(crate) fn restore(&mut self, key: String, count: usize) {
        self.counters
            .insert(key, count.min(self.min_hits));
    }
}
