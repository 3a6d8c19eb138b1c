//! Disk space estimator: watches the output file grow and turns that into
//! a bytes-per-second estimate over a sliding 30-second window, so callers
//! can report "N seconds of recording left" next to free disk space.

use crate::constants::TIMEBASE;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

const WINDOW_LENGTH_PTS: i64 = 30 * TIMEBASE;

struct MeasurePoint {
    pts: i64,
    size: u64,
}

struct State {
    measure_points: VecDeque<MeasurePoint>,
    last_pts_reported: i64,
    first_pts_this_file: i64,
    total_size: u64,
    last_filename: String,
}

impl Default for State {
    fn default() -> Self {
        Self {
            measure_points: VecDeque::new(),
            last_pts_reported: 0,
            first_pts_this_file: 0,
            total_size: 0,
            last_filename: String::new(),
        }
    }
}

/// One bytes-per-second estimate, reported at most once per output second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskEstimate {
    pub free_bytes: i64,
    pub estimated_seconds_left: f64,
    pub file_length_seconds: f64,
}

pub struct DiskSpaceEstimator {
    state: Mutex<State>,
    metric_disk_free_bytes: AtomicI64,
}

impl Default for DiskSpaceEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSpaceEstimator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            metric_disk_free_bytes: AtomicI64::new(-1),
        }
    }

    pub fn disk_free_bytes(&self) -> i64 {
        self.metric_disk_free_bytes.load(Ordering::Relaxed)
    }

    /// Reports that `bytes` more were just appended to `filename`, without
    /// needing to stat it; used when the writer already knows the byte count
    /// (our own append-only frame files), matching `report_write`.
    pub fn report_write(&self, filename: &Path, bytes: u64, pts: i64) -> Option<DiskEstimate> {
        let mut state = self.state.lock().expect("disk estimator mutex poisoned");
        state.total_size += bytes;
        let file_size = state.total_size;
        self.report_write_internal(&mut state, filename, file_size, pts)
    }

    /// Reports that `filename` was just written to at `pts`, stat'ing it to
    /// find its new size; used when frames are appended by something else
    /// (an external muxer) and we only observe the result, matching
    /// `report_append`.
    pub fn report_append(&self, filename: &Path, pts: i64) -> Option<DiskEstimate> {
        let mut state = self.state.lock().expect("disk estimator mutex poisoned");
        let filename_str = filename.to_string_lossy().to_string();
        if filename_str != state.last_filename {
            state.last_filename = filename_str;
            state.measure_points.clear();
        }
        let file_size = match std::fs::metadata(filename) {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(error = %e, path = %filename.display(), "failed to stat output file");
                return None;
            }
        };
        self.report_write_internal(&mut state, filename, file_size, pts)
    }

    fn report_write_internal(&self, state: &mut State, filename: &Path, file_size: u64, pts: i64) -> Option<DiskEstimate> {
        if state.measure_points.is_empty() {
            state.first_pts_this_file = pts;
        }

        if let Some(back) = state.measure_points.back() {
            if pts <= back.pts {
                return None;
            }
        }

        while state.measure_points.len() > 1 && state.measure_points.front().expect("checked len > 1").pts + WINDOW_LENGTH_PTS < pts {
            state.measure_points.pop_front();
        }

        let free_bytes = match free_bytes_on(filename) {
            Some(bytes) => bytes,
            None => return None,
        };
        self.metric_disk_free_bytes.store(free_bytes, Ordering::Relaxed);

        let result = if let Some(front) = state.measure_points.front() {
            let bytes_per_second = (file_size as f64 - front.size as f64) / (pts - front.pts) as f64 * TIMEBASE as f64;
            let seconds_left = free_bytes as f64 / bytes_per_second;

            if state.last_pts_reported == 0 || pts - state.last_pts_reported >= TIMEBASE {
                state.last_pts_reported = pts;
                Some(DiskEstimate {
                    free_bytes,
                    estimated_seconds_left: seconds_left,
                    file_length_seconds: (pts - state.first_pts_this_file) as f64 / TIMEBASE as f64,
                })
            } else {
                None
            }
        } else {
            None
        };

        state.measure_points.push_back(MeasurePoint { pts, size: file_size });
        result
    }
}

#[cfg(unix)]
fn free_bytes_on(path: &Path) -> Option<i64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let cstr = CString::new(dir.to_string_lossy().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statfs>::uninit();
    let ret = unsafe { libc::statfs(cstr.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        tracing::warn!(path = %dir.display(), "statfs failed");
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    Some((stat.f_bavail as i64).saturating_mul(stat.f_frsize as i64))
}

#[cfg(not(unix))]
fn free_bytes_on(_path: &Path) -> Option<i64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_establishes_baseline_without_a_rate() {
        let estimator = DiskSpaceEstimator::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.bin");
        std::fs::write(&file, b"hello").unwrap();
        let estimate = estimator.report_append(&file, TIMEBASE);
        assert!(estimate.is_none());
    }

    #[test]
    fn out_of_order_pts_is_rejected() {
        let estimator = DiskSpaceEstimator::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.bin");
        std::fs::write(&file, b"hello").unwrap();
        estimator.report_append(&file, TIMEBASE);
        std::fs::write(&file, b"hello world").unwrap();
        let estimate = estimator.report_append(&file, TIMEBASE - 1);
        assert!(estimate.is_none());
    }

    #[test]
    fn second_report_after_a_full_second_yields_an_estimate() {
        let estimator = DiskSpaceEstimator::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.bin");
        std::fs::write(&file, vec![0u8; 1000]).unwrap();
        estimator.report_append(&file, TIMEBASE);
        std::fs::write(&file, vec![0u8; 2000]).unwrap();
        let estimate = estimator.report_append(&file, 2 * TIMEBASE);
        assert!(estimate.is_some());
        assert!(estimate.unwrap().estimated_seconds_left.is_finite() || estimate.unwrap().estimated_seconds_left >= 0.0);
    }
}
