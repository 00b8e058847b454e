use std::sync::atomic::{AtomicU32, Ordering};

/// One advisory progress counter: a `(current, max)` pair written
/// monotonically by the engine. A reader polling from another thread may
/// observe stale values; the engine itself never reads these.
#[derive(Debug, Default)]
pub struct Counter {
    current: AtomicU32,
    max: AtomicU32,
}

impl Counter {
    pub fn set_max(&self, max: u32) {
        self.max.store(max, Ordering::Relaxed);
    }

    pub fn set(&self, current: u32) {
        self.current.store(current, Ordering::Relaxed);
    }

    pub fn add(&self, n: u32) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    /// Snap the counter to its maximum at the end of a stage.
    pub fn finish(&self) {
        self.current
            .store(self.max.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> (u32, u32) {
        (
            self.current.load(Ordering::Relaxed),
            self.max.load(Ordering::Relaxed),
        )
    }
}

/// Progress for one conversion. Phase 1 covers palette construction and
/// per-tile palette fitting (per-block analysis for textures); phase 2
/// covers tile merging (endpoint-palette compression for textures).
#[derive(Debug, Default)]
pub struct Progress {
    pub phase1: Counter,
    pub phase2: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let c = Counter::default();
        c.set_max(10);
        c.add(3);
        c.add(4);
        assert_eq!(c.get(), (7, 10));
        c.finish();
        assert_eq!(c.get(), (10, 10));
    }
}
