//! Unified MRU/LRU eviction over every cached page.

use log::debug;

use crate::buffer::PageCache;

use super::EvictionStrategy;

/// Evicts pages in access-sequence order until the cache is back under its
/// stop size.
///
/// MRU pops the most recently touched page first; LRU the least recently
/// touched one.
#[derive(Debug, Clone, Copy)]
pub struct GlobalAccessOrder {
    mru: bool,
}

impl GlobalAccessOrder {
    pub fn mru() -> Self {
        Self { mru: true }
    }

    pub fn lru() -> Self {
        Self { mru: false }
    }
}

impl EvictionStrategy for GlobalAccessOrder {
    fn name(&self) -> &'static str {
        if self.mru {
            "unified-mru"
        } else {
            "unified-lru"
        }
    }

    fn evict(&self, cache: &PageCache) -> usize {
        let mut candidates = {
            let _guard = cache.eviction_lock();
            cache.evictable_pages()
        };

        // victims are popped from the back
        if self.mru {
            candidates.sort_by_key(|p| p.access_seq());
        } else {
            candidates.sort_by_key(|p| std::cmp::Reverse(p.access_seq()));
        }

        let mut evicted = 0;
        while cache.size() > cache.evict_stop_size() {
            let Some(page) = candidates.pop() else {
                debug!("nothing left to evict");
                break;
            };
            if cache.evict_page(page.key(), true) {
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(GlobalAccessOrder::mru().name(), "unified-mru");
        assert_eq!(GlobalAccessOrder::lru().name(), "unified-lru");
    }
}
