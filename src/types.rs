//! Core data model.

use crate::constants::MAX_STREAMS;
use std::cmp::Ordering;

/// Immutable locator for one encoded video frame plus its trailing audio
/// chunk. Never mutated or deleted once created; `file_idx`/`offset`
/// uniquely locate the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub pts: i64,
    pub file_idx: u32,
    pub offset: u64,
    pub video_size: u32,
    pub audio_size: u32,
}

impl FrameRef {
    /// Ordering key used by the decode cache: `(pts, offset,
    /// file_idx)`.
    pub fn cache_key(&self) -> (i64, u64, u32) {
        (self.pts, self.offset, self.file_idx)
    }
}

impl PartialOrd for FrameRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cache_key().cmp(&other.cache_key())
    }
}

/// Per-stream array of frame refs, sorted strictly increasing by `pts`
/// Append-only during a session.
#[derive(Debug, Default, Clone)]
pub struct StreamIndex {
    frames: Vec<FrameRef>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Appends a new frame ref. Panics if it would violate strict pts
    /// monotonicity — the frame store is the only writer and guarantees
    /// this never happens in practice.
    pub fn push(&mut self, frame: FrameRef) {
        if let Some(last) = self.frames.last() {
            assert!(
                last.pts < frame.pts,
                "pts must be strictly increasing: {} >= {}",
                last.pts,
                frame.pts
            );
        }
        self.frames.push(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn as_slice(&self) -> &[FrameRef] {
        &self.frames
    }

    /// Last frame with `pts <= query`.
    pub fn last_before(&self, pts: i64) -> Option<FrameRef> {
        match self.frames.partition_point(|f| f.pts <= pts) {
            0 => None,
            n => Some(self.frames[n - 1]),
        }
    }

    /// First frame with `pts >= query`.
    pub fn first_at_or_after(&self, pts: i64) -> Option<FrameRef> {
        let idx = self.frames.partition_point(|f| f.pts < pts);
        self.frames.get(idx).copied()
    }

    /// `(lower, upper)`: the last frame with `pts <= query` and the first
    /// with `pts >= query`. An exact match returns the same ref in both.
    pub fn surrounding(&self, pts: i64) -> (Option<FrameRef>, Option<FrameRef>) {
        (self.last_before(pts), self.first_at_or_after(pts))
    }

    /// Index of the first frame with `pts >= query`, or `len()` if none.
    pub fn index_at_or_after(&self, pts: i64) -> usize {
        self.frames.partition_point(|f| f.pts < pts)
    }

    pub fn get(&self, idx: usize) -> Option<FrameRef> {
        self.frames.get(idx).copied()
    }
}

/// One edit-list entry: an in/out range on a stream, played at a given
/// speed, with a crossfade duration into whatever follows it.
#[derive(Debug, Clone)]
pub struct Clip {
    pub pts_in: i64,
    /// `-1` means open (plays until the ingest catches up).
    pub pts_out: i64,
    pub stream_idx: u32,
    pub speed: f64,
    pub fade_time: f64,
    pub descriptions: [String; MAX_STREAMS],
}

impl Clip {
    pub fn is_open(&self) -> bool {
        self.pts_out < 0
    }

    /// Clip duration in output seconds at `speed == 1.0`input time, or
    /// `None` if open-ended.
    pub fn duration_seconds(&self) -> Option<f64> {
        if self.is_open() {
            None
        } else {
            Some((self.pts_out - self.pts_in) as f64 / crate::constants::TIMEBASE as f64)
        }
    }
}

/// A [`Clip`] with a stable identity used as splice identity across edits.
#[derive(Debug, Clone)]
pub struct ClipWithId {
    pub clip: Clip,
    pub id: u64,
}

/// Ordered sequence of clips to play.
pub type Playlist = Vec<ClipWithId>;

/// `{num_infinite, seconds}` time-remaining summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRemaining {
    pub num_infinite: u32,
    pub seconds: f64,
}

impl TimeRemaining {
    pub const ZERO: Self = Self {
        num_infinite: 0,
        seconds: 0.0,
    };

    /// Formats as `H:MM.sss`, prefixed by a clip
    /// count when there's more than one infinite/finite clip contributing.
    pub fn format(&self, num_clips: usize) -> String {
        let hms = format_hms(self.seconds);
        match (num_clips, self.num_infinite) {
            (0, 0) => "0:00.000".to_string(),
            (n, 0) if n > 1 => format!("{n} clips + {hms}"),
            (_, 0) => hms,
            (n, inf) if n > 1 => format!("{n} clips ({inf} infinite) + {hms}"),
            (_, inf) => format!("{inf} infinite + {hms}"),
        }
    }
}

fn format_hms(total_seconds: f64) -> String {
    let total_seconds = total_seconds.max(0.0);
    let hours = (total_seconds / 3600.0) as u64;
    let minutes = ((total_seconds % 3600.0) / 60.0) as u64;
    let seconds = total_seconds % 60.0;
    format!("{hours}:{minutes:02}.{seconds:06.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ref(pts: i64) -> FrameRef {
        FrameRef {
            pts,
            file_idx: 0,
            offset: pts as u64,
            video_size: 100,
            audio_size: 10,
        }
    }

    #[test]
    fn stream_index_is_strictly_increasing() {
        let mut idx = StreamIndex::new();
        for pts in [0, 200_000, 400_000] {
            idx.push(make_ref(pts));
        }
        assert_eq!(idx.len(), 3);
    }

    #[test]
    #[should_panic]
    fn stream_index_rejects_non_monotonic_push() {
        let mut idx = StreamIndex::new();
        idx.push(make_ref(100));
        idx.push(make_ref(100));
    }

    #[test]
    fn surrounding_returns_the_bracketing_frames() {
        let mut idx = StreamIndex::new();
        for pts in [0, 200_000, 400_000, 600_000] {
            idx.push(make_ref(pts));
        }
        let (lower, upper) = idx.surrounding(300_000);
        assert_eq!(lower.unwrap().pts, 200_000);
        assert_eq!(upper.unwrap().pts, 400_000);

        let (lower, upper) = idx.surrounding(200_000);
        assert_eq!(lower.unwrap().pts, 200_000);
        assert_eq!(upper.unwrap().pts, 200_000);

        let (lower, upper) = idx.surrounding(-1);
        assert!(lower.is_none());
        assert_eq!(upper.unwrap().pts, 0);

        let (lower, upper) = idx.surrounding(1_000_000);
        assert_eq!(lower.unwrap().pts, 600_000);
        assert!(upper.is_none());
    }
}
