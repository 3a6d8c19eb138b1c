//! Decode Cache: an LRU of decoded planar frames keyed by
//! [`FrameRef`], with at-most-once decode under contention and a soft byte
//! budget.
//!
//! Grounded on `core/buffer_pool.rs`'s pool-with-mutex
//! shape, generalized from a fixed-size `Vec<u8>` pool to a keyed cache with
//! the original's prune algorithm verbatim (sort by `last_used`
//! ascending, evict up to the cutoff that brings usage to 90% of budget).

mod backend;

pub use backend::{DecodeBackend, PlanarFrame, SoftwareJpegBackend};

use crate::frame_store::{FrameReader, FrameStore};
use crate::types::FrameRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What `get_or_decode` does on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    DecodeIfMissing,
    NoneIfMissing,
}

struct Entry {
    frame: Arc<PlanarFrame>,
    last_used: u64,
}

struct Inner {
    entries: HashMap<(i64, u64, u32), Entry>,
    bytes_used: usize,
    clock: u64,
}

pub struct DecodeCache {
    inner: Mutex<Inner>,
    byte_budget: usize,
    backend: Box<dyn DecodeBackend>,
}

impl DecodeCache {
    pub fn new(byte_budget: usize, backend: Box<dyn DecodeBackend>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                bytes_used: 0,
                clock: 0,
            }),
            byte_budget,
            backend,
        }
    }

    /// Returns the cached frame on hit (bumping `last_used`); on miss,
    /// decodes via `store`/`reader` unless `policy` is `NoneIfMissing`.
    pub fn get_or_decode(
        &self,
        frame_ref: FrameRef,
        store: &FrameStore,
        reader: &mut FrameReader,
        policy: MissPolicy,
    ) -> crate::error::FutatabiResult<Option<Arc<PlanarFrame>>> {
        let key = frame_ref.cache_key();

        {
            let mut inner = self.inner.lock().expect("decode cache mutex poisoned");
            inner.clock += 1;
            let clock = inner.clock;
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.last_used = clock;
                return Ok(Some(entry.frame.clone()));
            }
        }

        if policy == MissPolicy::NoneIfMissing {
            return Ok(None);
        }

        let decoded = store.read(reader, frame_ref, true, false)?;
        let planar = self.backend.decode(&decoded.video);
        let size = planar_byte_size(&planar);
        let planar = Arc::new(planar);

        let mut inner = self.inner.lock().expect("decode cache mutex poisoned");
        // Another thread may have decoded the same ref meanwhile; keep
        // whichever landed first so `get(ref) == get(ref)` by identity.
        if let Some(existing) = inner.entries.get(&key) {
            return Ok(Some(existing.frame.clone()));
        }
        inner.clock += 1;
        let last_used = inner.clock;
        inner.bytes_used += size;
        inner.entries.insert(key, Entry { frame: planar.clone(), last_used });
        if inner.bytes_used > self.byte_budget {
            prune(&mut inner, self.byte_budget);
        }
        Ok(Some(planar))
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().expect("decode cache mutex poisoned").bytes_used
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("decode cache mutex poisoned").entries.len()
    }
}

fn planar_byte_size(frame: &PlanarFrame) -> usize {
    frame.y.len() + frame.cb.len() + frame.cr.len() + frame.exif.len()
}

/// Evicts entries in `last_used` order until cumulative removed bytes first
/// brings usage to 90% of `budget`, matching the original's headroom margin.
fn prune(inner: &mut Inner, budget: usize) {
    let target = budget * 9 / 10;
    if inner.bytes_used <= target {
        return;
    }
    let mut by_age: Vec<((i64, u64, u32), u64, usize)> = inner
        .entries
        .iter()
        .map(|(k, e)| (*k, e.last_used, planar_byte_size(&e.frame)))
        .collect();
    by_age.sort_by_key(|(_, last_used, _)| *last_used);

    let mut removed = 0usize;
    let mut cutoff = None;
    for (_, last_used, size) in &by_age {
        removed += size;
        if inner.bytes_used - removed <= target {
            cutoff = Some(*last_used);
            break;
        }
    }
    let Some(cutoff) = cutoff else { return };

    inner.entries.retain(|_, e| e.last_used > cutoff);
    inner.bytes_used = inner.entries.values().map(|e| planar_byte_size(&e.frame)).sum();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSizeBackend {
        size: usize,
    }
    impl DecodeBackend for FixedSizeBackend {
        fn software(&self, _jpeg: &[u8]) -> crate::error::FutatabiResult<PlanarFrame> {
            Ok(PlanarFrame {
                width: 1,
                height: 1,
                cx: 1,
                cy: 1,
                y: vec![0; self.size],
                cb: vec![128],
                cr: vec![128],
                exif: Vec::new(),
            })
        }
    }

    fn frame_ref(pts: i64) -> FrameRef {
        FrameRef {
            pts,
            file_idx: 0,
            offset: pts as u64,
            video_size: 8,
            audio_size: 0,
        }
    }

    #[test]
    fn repeated_get_returns_identical_arc() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path()).unwrap();
        let r = store.append(0, 0, b"jpegbyte", b"").unwrap();
        let mut reader = store.new_reader();
        let cache = DecodeCache::new(1 << 20, Box::new(FixedSizeBackend { size: 16 }));

        let first = cache.get_or_decode(r, &store, &mut reader, MissPolicy::DecodeIfMissing).unwrap().unwrap();
        let second = cache.get_or_decode(r, &store, &mut reader, MissPolicy::DecodeIfMissing).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn prune_keeps_usage_at_or_under_ninety_percent() {
        let mut inner = Inner {
            entries: HashMap::new(),
            bytes_used: 0,
            clock: 0,
        };
        for i in 0..10u64 {
            let frame = Arc::new(PlanarFrame {
                width: 1,
                height: 1,
                cx: 1,
                cy: 1,
                y: vec![0; 100],
                cb: Vec::new(),
                cr: Vec::new(),
                exif: Vec::new(),
            });
            inner.bytes_used += 100;
            inner.entries.insert((i as i64, 0, 0), Entry { frame, last_used: i });
        }
        prune(&mut inner, 1000);
        assert!(inner.bytes_used <= 900);
    }

    #[test]
    fn missing_with_none_policy_does_not_decode() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(dir.path()).unwrap();
        let mut reader = store.new_reader();
        let cache = DecodeCache::new(1 << 20, Box::new(FixedSizeBackend { size: 16 }));
        let result = cache
            .get_or_decode(frame_ref(0), &store, &mut reader, MissPolicy::NoneIfMissing)
            .unwrap();
        assert!(result.is_none());
    }
}
