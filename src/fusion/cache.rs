//! Cache of generated kernels keyed by the structure of the fused chain.

use std::collections::HashMap;

/// Map from kernel key to a compiled artifact, with hit/miss counters.
#[derive(Debug)]
pub struct KernelCache<V> {
    entries: HashMap<String, V>,
    hits: usize,
    misses: usize,
}

impl<V> Default for KernelCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<V: Clone> KernelCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached artifact for `key`, building it on a miss.
    pub fn get_or_insert_with(&mut self, key: &str, build: impl FnOnce() -> V) -> V {
        match self.get_or_try_insert_with(key, || Ok::<V, std::convert::Infallible>(build())) {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`KernelCache::get_or_insert_with`]; failures are not cached.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: &str,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(v) = self.entries.get(key) {
            self.hits += 1;
            log::debug!("kernel cache hit ({} entries)", self.entries.len());
            return Ok(v.clone());
        }
        self.misses += 1;
        let v = build()?;
        log::debug!("kernel cache miss, compiled kernel #{}", self.entries.len() + 1);
        self.entries.insert(key.to_owned(), v.clone());
        Ok(v)
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_and_misses() {
        let mut cache = KernelCache::new();
        assert_eq!(cache.get_or_insert_with("a", || 1), 1);
        assert_eq!(cache.get_or_insert_with("a", || 2), 1);
        assert!(cache.get_or_try_insert_with("b", || Err::<i32, _>("boom")).is_err());
        assert_eq!((cache.hits(), cache.misses(), cache.len()), (1, 2, 1));
    }
}
