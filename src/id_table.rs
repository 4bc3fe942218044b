use rustc_hash::FxHashMap;

use crate::error::ZtError;

/// Hash table keyed by integer ids with support for allocating a free id out
///  of a configured range, probing forward from a (random) starting point.
///
/// This backs the per-node port table: static ports go in via `insert`,
///  ephemeral ports come out of `allocate`.
pub struct IdTable<V> {
    entries: FxHashMap<u64, V>,
    lo: u64,
    hi: u64,
    next: u64,
}

impl<V> IdTable<V> {
    /// `seed` is clamped into `[lo, hi]` and determines where allocation
    ///  probing starts.
    pub fn new(lo: u64, hi: u64, seed: u64) -> IdTable<V> {
        assert!(lo <= hi);
        let next = lo + (seed % (hi - lo + 1));
        IdTable {
            entries: FxHashMap::default(),
            lo,
            hi,
            next,
        }
    }

    pub fn insert(&mut self, key: u64, value: V) -> Result<(), ZtError> {
        if self.entries.contains_key(&key) {
            return Err(ZtError::AddrInUse);
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Allocates a free key from the configured range, wrapping around once.
    pub fn allocate(&mut self, value: V) -> Result<u64, ZtError> {
        let span = self.hi - self.lo + 1;
        for _ in 0..span {
            let candidate = self.next;
            self.next = if self.next == self.hi { self.lo } else { self.next + 1 };
            if !self.entries.contains_key(&candidate) {
                self.entries.insert(candidate, value);
                return Ok(candidate);
            }
        }
        Err(ZtError::AddrRange)
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        self.entries.get(&key)
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_exclusive() {
        let mut t = IdTable::new(1, 100, 0);
        t.insert(5, "a").unwrap();
        assert_eq!(t.insert(5, "b"), Err(ZtError::AddrInUse));
        assert_eq!(t.get(5), Some(&"a"));
        assert_eq!(t.remove(5), Some("a"));
        assert!(t.insert(5, "b").is_ok());
    }

    #[test]
    fn test_allocate_from_seed() {
        let mut t = IdTable::new(10, 20, 3);
        assert_eq!(t.allocate(()).unwrap(), 13);
        assert_eq!(t.allocate(()).unwrap(), 14);
    }

    #[test]
    fn test_allocate_skips_and_wraps() {
        let mut t = IdTable::new(10, 12, 1);
        t.insert(12, ()).unwrap();
        assert_eq!(t.allocate(()).unwrap(), 11);
        // 12 is taken, wrap to 10
        assert_eq!(t.allocate(()).unwrap(), 10);
        assert_eq!(t.allocate(()), Err(ZtError::AddrRange));
    }

    #[test]
    fn test_allocate_stays_in_range() {
        let mut t = IdTable::new(0x800000, 0xffffff, 0xdeadbeef);
        for _ in 0..1000 {
            let port = t.allocate(()).unwrap();
            assert!(port >= 0x800000 && port <= 0xffffff);
        }
        assert_eq!(t.len(), 1000);
    }
}
