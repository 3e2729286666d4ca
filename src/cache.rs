//! Bounded signature-keyed cache.
//!
//! Thin wrapper over [`lru::LruCache`] in which every mutation hands
//! evicted entries back to the owner instead of dropping them. The
//! owning aggregator stages any outbound work for those entries in a
//! local buffer and performs it only after its mutex guard is
//! released, which keeps flush callbacks out of the lock.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::signature::Signature;

pub(crate) struct SignatureCache<V> {
    inner: LruCache<Signature, V>,
}

impl<V> SignatureCache<V> {
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Looks up an entry, marking it most recently used.
    pub fn get_mut(&mut self, signature: &Signature) -> Option<&mut V> {
        self.inner.get_mut(signature)
    }

    /// Inserts an entry, returning whatever it displaced: the old
    /// value under the same signature, or the least recently used
    /// entry when the cache is full.
    pub fn put(&mut self, signature: Signature, value: V) -> Option<V> {
        self.inner.push(signature, value).map(|(_, evicted)| evicted)
    }

    pub fn pop(&mut self, signature: &Signature) -> Option<V> {
        self.inner.pop(signature)
    }

    /// Removes and returns every entry matching `expired`.
    pub fn pop_expired(&mut self, mut expired: impl FnMut(&V) -> bool) -> Vec<V> {
        let matching: Vec<Signature> = self
            .inner
            .iter()
            .filter(|(_, value)| expired(value))
            .map(|(signature, _)| *signature)
            .collect();
        matching
            .into_iter()
            .filter_map(|signature| self.inner.pop(&signature))
            .collect()
    }

    /// Removes and returns everything, least recently used first.
    pub fn drain(&mut self) -> Vec<V> {
        let mut drained = Vec::with_capacity(self.inner.len());
        while let Some((_, value)) = self.inner.pop_lru() {
            drained.push(value);
        }
        drained
    }
}
