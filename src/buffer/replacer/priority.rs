//! Locality-set-aware eviction over six priority buckets.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffer::locality_set::{LocalitySet, LocalityType, PersistenceType};
use crate::buffer::PageCache;

use super::EvictionStrategy;

/// Eviction priority of a locality set, most evictable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityLevel {
    TransientLifetimeEnded = 0,
    PersistentLifetimeEnded = 1,
    PersistentLifetimeNotEnded = 2,
    TransientLifetimeNotEndedPartialData = 3,
    TransientLifetimeNotEndedShuffleData = 4,
    TransientLifetimeNotEndedHashData = 5,
}

impl PriorityLevel {
    pub const COUNT: usize = 6;

    pub const ALL: [PriorityLevel; Self::COUNT] = [
        PriorityLevel::TransientLifetimeEnded,
        PriorityLevel::PersistentLifetimeEnded,
        PriorityLevel::PersistentLifetimeNotEnded,
        PriorityLevel::TransientLifetimeNotEndedPartialData,
        PriorityLevel::TransientLifetimeNotEndedShuffleData,
        PriorityLevel::TransientLifetimeNotEndedHashData,
    ];

    /// Bucket for a set whose current use has not finished.
    pub fn active(set: &LocalitySet) -> Self {
        match set.persistence() {
            PersistenceType::Persistent => PriorityLevel::PersistentLifetimeNotEnded,
            PersistenceType::Transient => match set.locality_type() {
                LocalityType::ShuffleData => PriorityLevel::TransientLifetimeNotEndedShuffleData,
                LocalityType::HashPartitionData => PriorityLevel::TransientLifetimeNotEndedHashData,
                LocalityType::JobData | LocalityType::PartialAggregationData => {
                    PriorityLevel::TransientLifetimeNotEndedPartialData
                }
            },
        }
    }

    /// Bucket for a set whose use has finished.
    pub fn ended(set: &LocalitySet) -> Self {
        match set.persistence() {
            PersistenceType::Persistent => PriorityLevel::PersistentLifetimeEnded,
            PersistenceType::Transient => PriorityLevel::TransientLifetimeEnded,
        }
    }
}

/// Locality sets grouped by [`PriorityLevel`].
///
/// A set lives in at most one bucket; moving it removes it from wherever it
/// was first.
#[derive(Default)]
pub struct PriorityBuckets {
    buckets: Mutex<[Vec<Arc<LocalitySet>>; PriorityLevel::COUNT]>,
}

impl PriorityBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `set` into `level`, taking it out of any other bucket.
    pub fn place(&self, set: &Arc<LocalitySet>, level: PriorityLevel) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            bucket.retain(|s| !Arc::ptr_eq(s, set));
        }
        buckets[level as usize].push(Arc::clone(set));
    }

    /// Drop `set` from every bucket.
    pub fn remove(&self, set: &Arc<LocalitySet>) {
        for bucket in self.buckets.lock().iter_mut() {
            bucket.retain(|s| !Arc::ptr_eq(s, set));
        }
    }

    /// Bucket currently holding `set`.
    pub fn level_of(&self, set: &Arc<LocalitySet>) -> Option<PriorityLevel> {
        let buckets = self.buckets.lock();
        PriorityLevel::ALL
            .into_iter()
            .find(|&level| buckets[level as usize].iter().any(|s| Arc::ptr_eq(s, set)))
    }

    /// Members of one bucket, in insertion order.
    pub fn sets(&self, level: PriorityLevel) -> Vec<Arc<LocalitySet>> {
        self.buckets.lock()[level as usize].clone()
    }
}

/// Asks locality sets for victims, most evictable bucket first, and stops
/// at the first bucket that gave anything up.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityLocalitySets;

impl EvictionStrategy for PriorityLocalitySets {
    fn name(&self) -> &'static str {
        "unified-intelligent"
    }

    fn evict(&self, cache: &PageCache) -> usize {
        let mut evicted = 0;
        for level in PriorityLevel::ALL {
            // newest members first
            for set in cache.priority_buckets().sets(level).into_iter().rev() {
                let victims = {
                    let _guard = cache.eviction_lock();
                    set.select_pages_for_replacement()
                };
                for page in victims.into_iter().flatten() {
                    if cache.evict_page(page.key(), true) {
                        evicted += 1;
                    }
                }
            }
            if evicted > 0 {
                debug!("evicted {} pages from bucket {:?}", evicted, level);
                break;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::locality_set::{DurabilityType, OperationType, ReplacementPolicy};
    use crate::common::SetKey;

    fn set(locality_type: LocalityType, persistence: PersistenceType) -> Arc<LocalitySet> {
        Arc::new(LocalitySet::new(
            SetKey::new(1, 1, 1),
            locality_type,
            ReplacementPolicy::Mru,
            OperationType::Read,
            DurabilityType::TryCache,
            persistence,
        ))
    }

    #[test]
    fn test_levels() {
        let shuffle = set(LocalityType::ShuffleData, PersistenceType::Transient);
        assert_eq!(
            PriorityLevel::active(&shuffle),
            PriorityLevel::TransientLifetimeNotEndedShuffleData
        );
        assert_eq!(PriorityLevel::ended(&shuffle), PriorityLevel::TransientLifetimeEnded);

        let hash = set(LocalityType::HashPartitionData, PersistenceType::Transient);
        assert_eq!(
            PriorityLevel::active(&hash),
            PriorityLevel::TransientLifetimeNotEndedHashData
        );

        let job = set(LocalityType::JobData, PersistenceType::Persistent);
        assert_eq!(PriorityLevel::active(&job), PriorityLevel::PersistentLifetimeNotEnded);
        assert_eq!(PriorityLevel::ended(&job), PriorityLevel::PersistentLifetimeEnded);
    }

    #[test]
    fn test_place_moves_between_buckets() {
        let buckets = PriorityBuckets::new();
        let job = set(LocalityType::JobData, PersistenceType::Persistent);

        buckets.place(&job, PriorityLevel::PersistentLifetimeNotEnded);
        buckets.place(&job, PriorityLevel::PersistentLifetimeEnded);

        assert_eq!(buckets.level_of(&job), Some(PriorityLevel::PersistentLifetimeEnded));
        assert!(buckets.sets(PriorityLevel::PersistentLifetimeNotEnded).is_empty());

        buckets.remove(&job);
        assert_eq!(buckets.level_of(&job), None);
    }
}
