//! Cache manager (spec §4.6): owns per-cache history/signal buffers and
//! implements the edge-triggered tick algorithm shared by both storage
//! modes. Scalar caches (audio, uniform visual) use a single cell;
//! pixel-addressed caches use one cell per output pixel.
use crate::analysis::CacheNodeDescriptor;
use crate::error::RuntimeError;
use fxhash::FxHashMap;

#[derive(Debug, Clone)]
struct CacheCell {
    history_size: u32,
    num_cells: usize,
    tap_index: u32,
    /// `num_cells * history_size`, row-major by cell: `history[cell*hist + slot]`.
    history: Vec<f64>,
    /// One per cell; NaN means "never ticked" (spec §4.6 sentinel).
    signal: Vec<f64>,
}

impl CacheCell {
    fn new(history_size: u32, tap_index: u32, num_cells: usize) -> Self {
        CacheCell {
            history_size,
            num_cells,
            tap_index,
            history: vec![0.0; num_cells * history_size as usize],
            signal: vec![f64::NAN; num_cells],
        }
    }

    fn tick(&mut self, cell: usize, value: f64, signal: f64) -> f64 {
        let hist = self.history_size as usize;
        let base = cell * hist;
        let prev_signal = self.signal[cell];
        if prev_signal.is_nan() || prev_signal != signal {
            for slot in (1..hist).rev() {
                self.history[base + slot] = self.history[base + slot - 1];
            }
            self.history[base] = value;
            self.signal[cell] = signal;
        }
        let tap = (self.tap_index as usize).min(hist.saturating_sub(1));
        self.history[base + tap]
    }

    fn previous_value(&self, cell: usize) -> f64 {
        self.history[cell * self.history_size as usize]
    }
}

/// Runtime owner of all cache storage for a compiled unit (spec §4.7: "the
/// coordinator exclusively owns cache/cross-domain buffers"). A fresh
/// `CacheManager` is built for each compiled unit; recompiling drops the
/// old one only after the new compiled unit is swapped in.
#[derive(Debug, Default)]
pub struct CacheManager {
    cells: FxHashMap<u32, CacheCell>,
}

impl CacheManager {
    pub fn new() -> Self {
        CacheManager { cells: FxHashMap::default() }
    }

    /// Allocates storage for one cache descriptor. `num_cells` is `1` for
    /// `Storage::Scalar`, `width * height` for `Storage::PixelAddressed`.
    pub fn register(&mut self, descriptor: &CacheNodeDescriptor, num_cells: usize) {
        self.cells.insert(
            descriptor.id,
            CacheCell::new(descriptor.history_size, descriptor.tap_index, num_cells),
        );
    }

    /// Ticks one cell of a cache and returns the tapped read (spec §4.6
    /// algorithm): shifts history only when `signal` differs from (or is
    /// the first value seen since) the previous tick's signal.
    pub fn tick(&mut self, cache_id: u32, cell: usize, value: f64, signal: f64) -> Result<f64, RuntimeError> {
        let cache = self.cells.get_mut(&cache_id).ok_or(RuntimeError::UnknownCache(cache_id))?;
        if cell >= cache.num_cells {
            return Err(RuntimeError::CacheCellOutOfBounds { id: cache_id, cell, bound: cache.num_cells });
        }
        Ok(cache.tick(cell, value, signal))
    }

    /// `history[slot 0]` pre-shift, for a cache's own self-referential
    /// value expression (spec §4.4.4): reads the previous tick's written
    /// value without seeing this tick's not-yet-computed write.
    pub fn previous_value(&self, cache_id: u32, cell: usize) -> Result<f64, RuntimeError> {
        let cache = self.cells.get(&cache_id).ok_or(RuntimeError::UnknownCache(cache_id))?;
        if cell >= cache.num_cells {
            return Err(RuntimeError::CacheCellOutOfBounds { id: cache_id, cell, bound: cache.num_cells });
        }
        Ok(cache.previous_value(cell))
    }

    pub fn num_cells(&self, cache_id: u32) -> Option<usize> {
        self.cells.get(&cache_id).map(|c| c.num_cells)
    }

    pub fn is_registered(&self, cache_id: u32) -> bool {
        self.cells.contains_key(&cache_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BackendId, Storage};
    use crate::ir::Expr;

    fn descriptor(id: u32, history_size: u32, tap_index: u32) -> CacheNodeDescriptor {
        CacheNodeDescriptor {
            id,
            bundle_name: "trail".into(),
            strand_index: 0,
            backend_id: BackendId::Visual,
            storage: Storage::PixelAddressed,
            history_size,
            tap_index,
            value_expr: Expr::num(0.0),
            signal_expr: Expr::num(0.0),
            has_self_reference: true,
        }
    }

    #[test]
    fn first_tick_always_shifts_from_nan_sentinel() {
        let mut mgr = CacheManager::new();
        mgr.register(&descriptor(0, 2, 1), 1);
        let read = mgr.tick(0, 0, 1.0, 100.0).unwrap();
        // tapIndex 1 on a fresh history still reads the (zeroed) older slot.
        assert_eq!(read, 0.0);
        assert_eq!(mgr.previous_value(0, 0).unwrap(), 1.0);
    }

    #[test]
    fn unchanged_signal_does_not_shift() {
        let mut mgr = CacheManager::new();
        mgr.register(&descriptor(0, 2, 0), 1);
        mgr.tick(0, 0, 1.0, 100.0).unwrap();
        let read = mgr.tick(0, 0, 2.0, 100.0).unwrap();
        // same signal -> no shift, tap 0 still reads the first written value.
        assert_eq!(read, 1.0);
    }

    #[test]
    fn feedback_trail_reaches_threshold_after_two_distinct_ticks() {
        // trail.v = cache(max(me.x, trail.v * 0.95), 2, 1, me.t)
        let mut mgr = CacheManager::new();
        mgr.register(&descriptor(0, 2, 1), 1);
        // tick 1: me.x = 1.0, previous value unknown -> 0.0 so max(1.0, 0.0) = 1.0
        let prev = mgr.previous_value(0, 0).unwrap();
        let value = 1.0_f64.max(prev * 0.95);
        mgr.tick(0, 0, value, 0.0).unwrap();
        // tick 2: distinct signal, previous value now 1.0
        let prev = mgr.previous_value(0, 0).unwrap();
        let value = 1.0_f64.max(prev * 0.95);
        mgr.tick(0, 0, value, 1.0).unwrap();
        assert!(mgr.previous_value(0, 0).unwrap() >= 0.95);
    }

    #[test]
    fn pixel_addressed_cells_are_independent() {
        let mut mgr = CacheManager::new();
        mgr.register(&descriptor(0, 2, 0), 4);
        mgr.tick(0, 1, 5.0, 1.0).unwrap();
        assert_eq!(mgr.previous_value(0, 1).unwrap(), 5.0);
        assert_eq!(mgr.previous_value(0, 2).unwrap(), 0.0);
    }

    #[test]
    fn unknown_cache_id_is_an_error() {
        let mut mgr = CacheManager::new();
        assert!(matches!(mgr.tick(99, 0, 0.0, 0.0), Err(RuntimeError::UnknownCache(99))));
    }
}
