//! End-to-end tests driving [`futatabi::player::Player`] against a real
//! [`futatabi::frame_store::FrameStore`] with no GPU involved: all of these
//! exercise the `video_stream: None` path, where the player shows frames
//! straight through a [`Destination`] callback.

use futatabi::frame_store::FrameStore;
use futatabi::player::{Destination, Player, StreamOutput};
use futatabi::types::{Clip, ClipWithId, FrameRef};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const TIMEBASE: i64 = 12_000_000;

fn new_clip(pts_in: i64, pts_out: i64, stream_idx: u32, speed: f64, fade_time: f64) -> Clip {
    Clip {
        pts_in,
        pts_out,
        stream_idx,
        speed,
        fade_time,
        descriptions: std::array::from_fn(|_| String::new()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Shown {
    Original { stream_idx: u32, frame: FrameRef },
    Faded { primary_stream_idx: u32, primary: FrameRef, secondary: FrameRef, fade_alpha: f32 },
}

#[derive(Default)]
struct RecordingDestination {
    shown: Mutex<Vec<Shown>>,
}

impl Destination for RecordingDestination {
    fn show_original(&self, stream_idx: u32, frame: FrameRef) {
        self.shown.lock().unwrap().push(Shown::Original { stream_idx, frame });
    }

    fn show_faded(&self, primary_stream_idx: u32, primary: FrameRef, secondary: FrameRef, fade_alpha: f32) {
        self.shown
            .lock()
            .unwrap()
            .push(Shown::Faded { primary_stream_idx, primary, secondary, fade_alpha });
    }
}

/// Blocks the calling thread until `done_callback` fires, or panics after a
/// generous timeout so a stuck player thread fails the test instead of
/// hanging the suite.
struct DoneSignal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl DoneSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self { mutex: Mutex::new(false), condvar: Condvar::new() })
    }

    fn mark_done(&self) {
        *self.mutex.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let guard = self.mutex.lock().unwrap();
        let (guard, timed_out) = self
            .condvar
            .wait_timeout_while(guard, Duration::from_secs(10), |done| !*done)
            .unwrap();
        assert!(*guard && !timed_out.timed_out(), "player never finished the playlist");
    }
}

/// Appends `count` frames to `stream_idx` spaced `pts_step` apart, starting
/// at pts 0, and returns their `FrameRef`s in order.
fn populate_stream(store: &FrameStore, stream_idx: u32, count: i64, pts_step: i64) -> Vec<FrameRef> {
    (0..count)
        .map(|i| {
            let pts = i * pts_step;
            store.append(stream_idx, pts, format!("jpeg{i}").as_bytes(), &[]).expect("append")
        })
        .collect()
}

/// Pure passthrough at 100% speed: every frame should come back ORIGINAL,
/// in order, at exactly the source pts values.
#[test]
fn passthrough_at_full_speed_emits_every_frame_as_original() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FrameStore::open(dir.path()).unwrap());
    let fps = 60.0;
    let pts_step = (TIMEBASE as f64 / fps).round() as i64;
    let frames = populate_stream(&store, 0, 10, pts_step);

    let destination = Arc::new(RecordingDestination::default());
    let player = Player::new(store, None, Some(destination.clone()), StreamOutput::None, fps, 10);

    let done = DoneSignal::new();
    {
        let done = done.clone();
        player.set_done_callback(move || done.mark_done());
    }

    let last = frames.last().unwrap();
    player.play(new_clip(0, last.pts + pts_step, 0, 1.0, 0.0));
    done.wait();
    player.stop();

    let shown = destination.shown.lock().unwrap();
    let originals: Vec<FrameRef> = shown
        .iter()
        .map(|s| match s {
            Shown::Original { frame, .. } => *frame,
            Shown::Faded { .. } => panic!("expected only ORIGINAL frames in a single passthrough clip"),
        })
        .collect();

    assert_eq!(originals.len(), frames.len(), "every source frame should be emitted exactly once");
    for (shown, expected) in originals.iter().zip(&frames) {
        assert_eq!(shown.pts, expected.pts);
    }
    assert!(originals.windows(2).all(|w| w[0].pts < w[1].pts), "output_pts must be strictly increasing");
}

/// Head-preserving splice, exercised through the public API: splicing in a
/// new tail while a clip is already playing must not disturb it, and the
/// overall session finishes (rather than hanging) once the spliced-in
/// clips complete.
#[test]
fn splice_while_playing_preserves_the_currently_playing_clip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FrameStore::open(dir.path()).unwrap());
    let fps = 60.0;
    let pts_step = (TIMEBASE as f64 / fps).round() as i64;
    let frames_a = populate_stream(&store, 0, 30, pts_step);
    let frames_b = populate_stream(&store, 1, 10, pts_step);

    let destination = Arc::new(RecordingDestination::default());
    let player = Player::new(store, None, Some(destination.clone()), StreamOutput::None, fps, 10);

    let done = DoneSignal::new();
    {
        let done = done.clone();
        player.set_done_callback(move || done.mark_done());
    }

    let clip_a = new_clip(0, frames_a.last().unwrap().pts + pts_step, 0, 1.0, 0.0);
    let clip_b = new_clip(frames_b[0].pts, frames_b.last().unwrap().pts + pts_step, 1, 1.0, 0.0);

    player.play_playlist(vec![ClipWithId { clip: clip_a.clone(), id: 1 }]);
    std::thread::sleep(Duration::from_millis(100));
    player.splice_play(vec![ClipWithId { clip: clip_a, id: 1 }, ClipWithId { clip: clip_b, id: 2 }]);

    done.wait();
    player.stop();

    let shown = destination.shown.lock().unwrap();
    let stream0_frames: Vec<i64> = shown
        .iter()
        .filter_map(|s| match s {
            Shown::Original { stream_idx: 0, frame } => Some(frame.pts),
            _ => None,
        })
        .collect();
    assert!(!stream0_frames.is_empty(), "frames already playing before the splice must not be recalled");
    assert!(stream0_frames.windows(2).all(|w| w[0] < w[1]), "pts already sent must stay strictly increasing");

    let stream1_frames: Vec<i64> = shown
        .iter()
        .filter_map(|s| match s {
            Shown::Original { stream_idx: 1, frame } => Some(frame.pts),
            _ => None,
        })
        .collect();
    assert!(!stream1_frames.is_empty(), "the spliced-in tail should eventually play");
}

/// Angle override on an idle player displays the nearest still frame on the
/// requested stream without starting playback.
#[test]
fn angle_override_while_idle_shows_a_still_frame() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FrameStore::open(dir.path()).unwrap());
    let fps = 60.0;
    let pts_step = (TIMEBASE as f64 / fps).round() as i64;
    let frames_a = populate_stream(&store, 0, 5, pts_step);
    let frames_b = populate_stream(&store, 1, 5, pts_step);

    let destination = Arc::new(RecordingDestination::default());
    let player = Player::new(store, None, Some(destination.clone()), StreamOutput::None, fps, 10);

    let done = DoneSignal::new();
    {
        let done = done.clone();
        player.set_done_callback(move || done.mark_done());
    }

    player.play(new_clip(0, frames_a.last().unwrap().pts + pts_step, 0, 1.0, 0.0));
    done.wait();
    std::thread::sleep(Duration::from_millis(50));

    destination.shown.lock().unwrap().clear();
    player.override_angle(1);
    std::thread::sleep(Duration::from_millis(50));
    player.stop();

    let shown = destination.shown.lock().unwrap();
    assert_eq!(shown.len(), 1, "an idle override should show exactly one still frame");
    match &shown[0] {
        Shown::Original { stream_idx, frame } => {
            assert_eq!(*stream_idx, 1);
            assert!(frames_b.iter().any(|f| f.pts == frame.pts));
        }
        other => panic!("expected an ORIGINAL still frame, got {other:?}"),
    }
}

/// A frame written through [`FrameStore::append`] reads back byte-identical
/// via a fresh reader.
#[test]
fn frame_store_round_trips_bytes_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let store = FrameStore::open(dir.path()).unwrap();
    let video = b"not actually a jpeg, just payload bytes".to_vec();
    let audio = vec![0u8; 64];
    let frame = store.append(3, 1_000, &video, &audio).unwrap();

    let mut reader = store.new_reader();
    let decoded = store.read(&mut reader, frame, true, true).unwrap();
    assert_eq!(decoded.video, video);
    assert_eq!(decoded.audio, audio);
}

/// Per-stream indices stay strictly increasing by pts, and
/// `last_before`/`first_at_or_after` bracket every query correctly.
#[test]
fn frame_store_index_stays_ordered_and_brackets_queries() {
    let dir = tempfile::tempdir().unwrap();
    let store = FrameStore::open(dir.path()).unwrap();
    let pts_step = 200_000;
    let frames = populate_stream(&store, 2, 20, pts_step);

    assert!(frames.windows(2).all(|w| w[0].pts < w[1].pts));

    for query in [0, pts_step / 2, pts_step * 5, pts_step * 19, pts_step * 19 + 1] {
        let lower = store.last_before(2, query);
        let upper = store.first_at_or_after(2, query);
        if let (Some(lower), Some(upper)) = (lower, upper) {
            assert!(lower.pts <= query && query <= upper.pts);
        }
    }
}
