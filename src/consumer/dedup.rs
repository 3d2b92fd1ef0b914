use std::num::NonZeroUsize;

use lru::LruCache;

use crate::model::{IdentityKey, VehiclePosition};

const MIN_CAPACITY: NonZeroUsize = NonZeroUsize::MIN;

/// Recently stored records of one partition worker, keyed by identity with
/// the content fingerprint as value. Bounded; the least recently seen key
/// is forgotten first.
pub struct DedupCache {
    cache: LruCache<IdentityKey, u64>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(MIN_CAPACITY)),
        }
    }

    /// True when the same identity key was already stored with identical
    /// content.
    pub fn seen(&mut self, position: &VehiclePosition) -> bool {
        self.cache.get(&position.identity_key()) == Some(&position.content_fingerprint())
    }

    pub fn remember(&mut self, position: &VehiclePosition) {
        self.cache
            .put(position.identity_key(), position.content_fingerprint());
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
