//! Edge coverage.
//!
//! A hit on the transition from the previous traced location to the current
//! one increments one byte of the coverage map, chosen by
//! `hash(cur) ^ prev`, with `prev = hash(prev_loc) >> 1`.

use crate::shm::ShmRegion;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use thiserror::Error;

/// Default coverage map size, the fuzzing engine's classic 64 KiB map.
pub const DEFAULT_MAP_SIZE: usize = 1 << 16;

#[derive(Debug, Error)]
#[error("coverage map size must be a non-zero power of two, got {0}")]
pub struct MapSizeError(pub usize);

enum Storage {
    Local(Box<[AtomicU8]>),
    Shared(ShmRegion),
}

/// Byte map of saturating hit counters.
pub struct CoverageMap {
    storage: Storage,
    size: usize,
}

impl CoverageMap {
    /// Process-local map, for standalone runs and tests.
    pub fn new(size: usize) -> Result<Self, MapSizeError> {
        check_size(size)?;
        let map = (0..size).map(|_| AtomicU8::new(0)).collect();
        Ok(Self {
            storage: Storage::Local(map),
            size,
        })
    }

    /// Map backed by the engine's shared memory, using its first `size` bytes.
    pub fn with_shm(region: ShmRegion, size: usize) -> Result<Self, MapSizeError> {
        check_size(size)?;
        if region.len() < size {
            return Err(MapSizeError(region.len()));
        }
        Ok(Self {
            storage: Storage::Shared(region),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn cells(&self) -> &[AtomicU8] {
        match &self.storage {
            Storage::Local(map) => map,
            Storage::Shared(region) => &region.as_atomic()[..self.size],
        }
    }

    /// Saturating increment of one bucket.
    ///
    /// Writers are not synchronised with each other; a lost update only
    /// undercounts a hit, which coverage tolerates.
    #[inline]
    pub fn hit(&self, idx: usize) {
        let cell = &self.cells()[idx & (self.size - 1)];
        let v = cell.load(Ordering::Relaxed);
        if v != u8::MAX {
            cell.store(v + 1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, idx: usize) -> u8 {
        self.cells()[idx].load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for c in self.cells() {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Non-zero buckets as `(index, count)`.
    pub fn hits(&self) -> Vec<(usize, u8)> {
        self.cells()
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let v = c.load(Ordering::Relaxed);
                if v != 0 {
                    Some((i, v))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn count_nonzero(&self) -> usize {
        self.cells()
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != 0)
            .count()
    }
}

fn check_size(size: usize) -> Result<(), MapSizeError> {
    if size == 0 || !size.is_power_of_two() {
        Err(MapSizeError(size))
    } else {
        Ok(())
    }
}

/// Per-context edge recorder.
///
/// Each traced execution context owns one tracer; the previous location is
/// never shared between contexts. Without a map every call is a no-op.
#[derive(Default, Clone)]
pub struct EdgeTracer {
    map: Option<Arc<CoverageMap>>,
    prev_loc: usize,
}

impl EdgeTracer {
    pub fn new(map: Arc<CoverageMap>) -> Self {
        Self {
            map: Some(map),
            prev_loc: 0,
        }
    }

    /// Tracer without a map, `record` does nothing.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, map: Arc<CoverageMap>) {
        self.map = Some(map);
        self.prev_loc = 0;
    }

    pub fn map(&self) -> Option<&Arc<CoverageMap>> {
        self.map.as_ref()
    }

    /// Start of a new run: forget the previous location.
    pub fn reset(&mut self) {
        self.prev_loc = 0;
    }

    /// Records a control transfer to `loc`.
    #[inline]
    pub fn record(&mut self, loc: u64) {
        let map = match self.map.as_ref() {
            Some(map) => map,
            None => return,
        };
        let h = (((loc >> 4) ^ (loc << 8)) as usize) & (map.size() - 1);
        map.hit(h ^ self.prev_loc);
        self.prev_loc = h >> 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_hash_is_stable() {
        let map = Arc::new(CoverageMap::new(DEFAULT_MAP_SIZE).unwrap());
        let mut tracer = EdgeTracer::new(Arc::clone(&map));
        tracer.record(0x1000);
        tracer.record(0x1004);
        tracer.record(0x1000);

        // h(0x1000) = 0x100 ^ 0x100000 & 0xffff = 0x0100, prev 0      -> 0x0100
        // h(0x1004) = 0x100 ^ 0x100400 & 0xffff = 0x0500, prev 0x0080 -> 0x0580
        // h(0x1000) = 0x0100,                          prev 0x0280 -> 0x0380
        assert_eq!(map.hits(), vec![(0x100, 1), (0x380, 1), (0x580, 1)]);
    }

    #[test]
    fn counters_saturate() {
        let map = Arc::new(CoverageMap::new(1024).unwrap());
        for _ in 0..300 {
            map.hit(7);
        }
        assert_eq!(map.get(7), 255);
        assert_eq!(map.count_nonzero(), 1);
        map.clear();
        assert_eq!(map.count_nonzero(), 0);
    }

    #[test]
    fn detached_tracer_is_noop() {
        let mut tracer = EdgeTracer::detached();
        for loc in 0..1000u64 {
            tracer.record(loc * 0x40);
        }
        assert!(tracer.map().is_none());
    }

    #[test]
    fn tracers_keep_separate_history() {
        let map = Arc::new(CoverageMap::new(DEFAULT_MAP_SIZE).unwrap());
        let mut a = EdgeTracer::new(Arc::clone(&map));
        let mut b = EdgeTracer::new(Arc::clone(&map));
        a.record(0x1000);
        b.record(0x1004);
        a.record(0x1000);
        // b's edge starts from a fresh prev_loc, so no 0x0580 bucket
        assert_eq!(map.hits(), vec![(0x100, 1), (0x180, 1), (0x500, 1)]);
    }

    #[test]
    fn map_size_must_be_power_of_two() {
        assert!(CoverageMap::new(0).is_err());
        assert!(CoverageMap::new(1000).is_err());
        assert!(CoverageMap::new(1 << 12).is_ok());
    }

    #[test]
    fn shm_backed_map() {
        let seg = crate::shm::tests::SysVSegment::new(DEFAULT_MAP_SIZE);
        let region = ShmRegion::attach(&seg.0.to_string()).unwrap();
        let peer = ShmRegion::attach(&seg.0.to_string()).unwrap();
        let map = Arc::new(CoverageMap::with_shm(region, DEFAULT_MAP_SIZE).unwrap());
        let mut tracer = EdgeTracer::new(map);
        tracer.record(0x1000);
        assert_eq!(peer.as_atomic()[0x100].load(Ordering::Relaxed), 1);
    }
}
