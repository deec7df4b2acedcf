//! Locality sets - groups of cached pages sharing one eviction policy.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::common::{CacheKey, SetKey};
use crate::storage::page::PageHandle;

/// What kind of data a locality set holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LocalityType {
    /// Job input and output.
    #[default]
    JobData,
    /// Data exchanged between nodes.
    ShuffleData,
    /// Hash-partitioned intermediate data.
    HashPartitionData,
    /// Partially aggregated intermediate data.
    PartialAggregationData,
}

/// Order in which a set gives up its pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    #[default]
    Mru,
    Random,
}

/// How the set's pages are currently being used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    #[default]
    Read,
    RepeatedRead,
    Write,
}

/// Whether writes may stay in the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityType {
    #[default]
    TryCache,
    CacheThrough,
}

/// Whether the set outlives the job that created it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceType {
    Transient,
    #[default]
    Persistent,
}

/// Fraction of a set a read-mode batch eviction frees.
const READ_EVICTION_RATIO: f64 = 0.1;

struct LocalityState {
    policy: ReplacementPolicy,
    operation: OperationType,
    lifetime_ended: bool,
    /// Least recently added or touched first.
    pages: VecDeque<PageHandle>,
}

/// A named group of cached pages evicted together under one policy.
///
/// # Thread Safety
/// Policy, lifetime and the page list sit behind one `Mutex`. The page
/// cache takes it after its own map lock, never before.
pub struct LocalitySet {
    set_key: SetKey,
    locality_type: LocalityType,
    durability: DurabilityType,
    persistence: PersistenceType,
    state: Mutex<LocalityState>,
}

impl LocalitySet {
    pub fn new(
        set_key: SetKey,
        locality_type: LocalityType,
        policy: ReplacementPolicy,
        operation: OperationType,
        durability: DurabilityType,
        persistence: PersistenceType,
    ) -> Self {
        Self {
            set_key,
            locality_type,
            durability,
            persistence,
            state: Mutex::new(LocalityState {
                policy,
                operation,
                lifetime_ended: false,
                pages: VecDeque::new(),
            }),
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Append a page as the most recently used member.
    pub fn add_cached_page(&self, page: PageHandle) {
        self.state.lock().pages.push_back(page);
    }

    /// Move a page to the most recently used end.
    pub fn update_cached_page(&self, page: PageHandle) {
        let mut state = self.state.lock();
        let key = page.key();
        if let Some(pos) = state.pages.iter().position(|p| p.key() == key) {
            state.pages.remove(pos);
        }
        state.pages.push_back(page);
    }

    /// Drop a page from the set. Returns false if it was not a member.
    pub fn remove_cached_page(&self, key: CacheKey) -> bool {
        let mut state = self.state.lock();
        match state.pages.iter().position(|p| p.key() == key) {
            Some(pos) => {
                state.pages.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn num_cached_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Members, least recently used first.
    pub fn cached_pages(&self) -> Vec<PageHandle> {
        self.state.lock().pages.iter().cloned().collect()
    }

    // ========================================================================
    // Victim selection
    // ========================================================================

    /// The first unreferenced member in policy order: newest first for MRU,
    /// oldest first otherwise.
    pub fn select_page_for_replacement(&self) -> Option<PageHandle> {
        let state = self.state.lock();
        let mut scan = Self::scan_order(&state);
        scan.find(|p| p.is_evictable()).cloned()
    }

    /// A batch of victims in policy order.
    ///
    /// A write-mode set gives up one page; a read-mode set gives up pages
    /// until a tenth of its members are collected. `None` if the set is
    /// empty or every member is referenced.
    pub fn select_pages_for_replacement(&self) -> Option<Vec<PageHandle>> {
        let state = self.state.lock();
        let total = state.pages.len();
        if total == 0 {
            return None;
        }

        let mut victims = Vec::new();
        for page in Self::scan_order(&state) {
            if !page.is_evictable() {
                continue;
            }
            victims.push(page.clone());
            let done = match state.operation {
                OperationType::Write => true,
                OperationType::Read | OperationType::RepeatedRead => {
                    victims.len() as f64 / total as f64 >= READ_EVICTION_RATIO
                }
            };
            if done {
                break;
            }
        }

        (!victims.is_empty()).then_some(victims)
    }

    fn scan_order<'a>(state: &'a LocalityState) -> Box<dyn Iterator<Item = &'a PageHandle> + 'a> {
        match state.policy {
            ReplacementPolicy::Mru => Box::new(state.pages.iter().rev()),
            ReplacementPolicy::Lru | ReplacementPolicy::Random => Box::new(state.pages.iter()),
        }
    }

    // ========================================================================
    // Lifetime
    // ========================================================================

    /// Start (or restart) using the set with the given policy.
    pub fn pin(&self, policy: ReplacementPolicy, operation: OperationType) {
        let mut state = self.state.lock();
        state.policy = policy;
        state.operation = operation;
        state.lifetime_ended = false;
    }

    /// Mark the set's current use as finished.
    pub fn unpin(&self) {
        self.state.lock().lifetime_ended = true;
    }

    pub fn is_lifetime_ended(&self) -> bool {
        self.state.lock().lifetime_ended
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn set_key(&self) -> SetKey {
        self.set_key
    }

    pub fn locality_type(&self) -> LocalityType {
        self.locality_type
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.state.lock().policy
    }

    pub fn operation_type(&self) -> OperationType {
        self.state.lock().operation
    }

    pub fn durability(&self) -> DurabilityType {
        self.durability
    }

    pub fn persistence(&self) -> PersistenceType {
        self.persistence
    }
}

impl std::fmt::Debug for LocalitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalitySet")
            .field("set_key", &self.set_key)
            .field("locality_type", &self.locality_type)
            .field("policy", &state.policy)
            .field("operation", &state.operation)
            .field("lifetime_ended", &state.lifetime_ended)
            .field("pages", &state.pages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;
    use crate::memory::SharedMemory;
    use crate::storage::page::Page;
    use std::sync::Arc;

    fn locality(policy: ReplacementPolicy, operation: OperationType) -> LocalitySet {
        LocalitySet::new(
            SetKey::new(1, 1, 1),
            LocalityType::JobData,
            policy,
            operation,
            DurabilityType::TryCache,
            PersistenceType::Persistent,
        )
    }

    fn fill(set: &LocalitySet, shm: &Arc<SharedMemory>, n: u32) -> Vec<PageHandle> {
        (0..n)
            .map(|i| {
                let block = shm.malloc_align(512, 512).unwrap();
                let page = Arc::new(Page::new(
                    SetKey::new(1, 1, 1).page(PageId::new(i)),
                    0,
                    Arc::clone(shm),
                    block,
                ));
                set.add_cached_page(Arc::clone(&page));
                page
            })
            .collect()
    }

    #[test]
    fn test_mru_write_selects_newest() {
        let shm = Arc::new(SharedMemory::new(64 * 1024).unwrap());
        let set = locality(ReplacementPolicy::Mru, OperationType::Write);
        fill(&set, &shm, 5);

        let victims = set.select_pages_for_replacement().unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].page_id(), PageId::new(4));
    }

    #[test]
    fn test_mru_read_selects_ten_percent() {
        let shm = Arc::new(SharedMemory::new(64 * 1024).unwrap());
        let set = locality(ReplacementPolicy::Mru, OperationType::Read);
        fill(&set, &shm, 20);

        let victims = set.select_pages_for_replacement().unwrap();
        let ids: Vec<_> = victims.iter().map(|p| p.page_id()).collect();
        assert_eq!(ids, vec![PageId::new(19), PageId::new(18)]);
    }

    #[test]
    fn test_lru_selects_oldest() {
        let shm = Arc::new(SharedMemory::new(64 * 1024).unwrap());
        let set = locality(ReplacementPolicy::Lru, OperationType::Write);
        let pages = fill(&set, &shm, 3);

        assert_eq!(
            set.select_page_for_replacement().unwrap().page_id(),
            PageId::new(0)
        );

        set.update_cached_page(Arc::clone(&pages[0]));
        assert_eq!(
            set.select_page_for_replacement().unwrap().page_id(),
            PageId::new(1)
        );
    }

    #[test]
    fn test_skips_referenced_pages() {
        let shm = Arc::new(SharedMemory::new(64 * 1024).unwrap());
        let set = locality(ReplacementPolicy::Mru, OperationType::Write);
        let pages = fill(&set, &shm, 3);
        pages[2].inc_ref_count();

        assert_eq!(
            set.select_page_for_replacement().unwrap().page_id(),
            PageId::new(1)
        );

        for page in &pages[..2] {
            page.inc_ref_count();
        }
        assert!(set.select_page_for_replacement().is_none());
        assert!(set.select_pages_for_replacement().is_none());
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let set = locality(ReplacementPolicy::Lru, OperationType::Read);
        assert!(set.select_pages_for_replacement().is_none());
        assert!(set.select_page_for_replacement().is_none());
    }

    #[test]
    fn test_remove_cached_page() {
        let shm = Arc::new(SharedMemory::new(64 * 1024).unwrap());
        let set = locality(ReplacementPolicy::Lru, OperationType::Read);
        let pages = fill(&set, &shm, 2);

        assert!(set.remove_cached_page(pages[0].key()));
        assert!(!set.remove_cached_page(pages[0].key()));
        assert_eq!(set.num_cached_pages(), 1);
    }

    #[test]
    fn test_pin_unpin() {
        let set = locality(ReplacementPolicy::Mru, OperationType::Read);
        set.unpin();
        assert!(set.is_lifetime_ended());

        set.pin(ReplacementPolicy::Lru, OperationType::Write);
        assert!(!set.is_lifetime_ended());
        assert_eq!(set.policy(), ReplacementPolicy::Lru);
        assert_eq!(set.operation_type(), OperationType::Write);
    }
}
