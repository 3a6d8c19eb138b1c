//! Player (PL): the single thread that walks a playlist, works out what to
//! display for "now", and feeds it either straight to a preview callback or
//! through a [`VideoStream`] for interpolation/encode/mux.

use crate::constants::{EASE_NOMINAL_SECONDS, REFRESH_INTERVAL_MS, TIMEBASE};
use crate::frame_store::FrameStore;
use crate::types::{ClipWithId, FrameRef, Playlist, TimeRemaining};
use crate::video_stream::VideoStream;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Where composited frames ultimately land. A bare preview with no
/// [`VideoStream`] at all is `None`; `Http`/`File` both run frames through
/// one, differing only in how its `Mux`'s `Sink` is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutput {
    None,
    Http,
    File,
}

/// Live-preview sink, called back from the player thread (and, once a frame
/// has gone through a [`VideoStream`], from its encode thread). The UI that
/// actually draws pixels lives outside this crate.
pub trait Destination: Send + Sync {
    fn show_original(&self, stream_idx: u32, frame: FrameRef);
    fn show_faded(&self, primary_stream_idx: u32, primary: FrameRef, secondary: FrameRef, fade_alpha: f32);
}

#[derive(Default)]
struct Metrics {
    dropped_interpolated_frame: AtomicU64,
    dropped_unconditional_frame: AtomicU64,
    faded_frame: AtomicU64,
    faded_snapped_frame: AtomicU64,
    original_frame: AtomicU64,
    original_snapped_frame: AtomicU64,
    refresh_frame: AtomicU64,
    interpolated_frame: AtomicU64,
    interpolated_faded_frame: AtomicU64,
    player_ahead_seconds_bits: AtomicU64,
}

impl Metrics {
    fn record_ahead_seconds(&self, seconds: f64) {
        self.player_ahead_seconds_bits.store(seconds.to_bits(), Ordering::Relaxed);
    }
}

struct QueueState {
    queued_clip_list: Playlist,
    new_clip_ready: bool,
    playing: bool,
    override_stream_idx: Option<u32>,
    last_pts_played: i64,
    splice_ready: bool,
    to_splice_clip_list: Playlist,
    pause_status: String,
    num_queued_frames: usize,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            queued_clip_list: Vec::new(),
            new_clip_ready: false,
            playing: false,
            override_stream_idx: None,
            last_pts_played: -1,
            splice_ready: false,
            to_splice_clip_list: Vec::new(),
            pause_status: "paused".to_string(),
            num_queued_frames: 0,
        }
    }
}

pub struct Player {
    state: Mutex<QueueState>,
    changed: Condvar,
    should_quit: AtomicBool,
    should_skip_to_next: AtomicBool,
    master_speed: Mutex<f64>,
    pending_speed_change: Mutex<Option<f64>>,
    frame_store: Arc<FrameStore>,
    video_stream: Option<Arc<VideoStream>>,
    destination: Option<Arc<dyn Destination>>,
    done_callback: Mutex<Option<Box<dyn Fn() + Send>>>,
    progress_callback: Mutex<Option<Box<dyn Fn(&HashMap<u64, f64>, TimeRemaining) + Send>>>,
    frame_rate: f64,
    max_queued_frames: usize,
    stream_output: StreamOutput,
    metrics: Metrics,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Player {
    pub fn new(
        frame_store: Arc<FrameStore>,
        video_stream: Option<Arc<VideoStream>>,
        destination: Option<Arc<dyn Destination>>,
        stream_output: StreamOutput,
        frame_rate: f64,
        max_queued_frames: usize,
    ) -> Arc<Self> {
        let player = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
            should_quit: AtomicBool::new(false),
            should_skip_to_next: AtomicBool::new(false),
            master_speed: Mutex::new(1.0),
            pending_speed_change: Mutex::new(None),
            frame_store,
            video_stream,
            destination,
            done_callback: Mutex::new(None),
            progress_callback: Mutex::new(None),
            frame_rate,
            max_queued_frames,
            stream_output,
            metrics: Metrics::default(),
            thread: Mutex::new(None),
        });
        let thread_player = player.clone();
        let handle = std::thread::spawn(move || thread_player.run());
        *player.thread.lock().expect("player thread handle mutex poisoned") = Some(handle);
        player
    }

    pub fn stop(&self) {
        self.should_quit.store(true, Ordering::SeqCst);
        self.changed.notify_all();
        if let Some(handle) = self.thread.lock().expect("player thread handle mutex poisoned").take() {
            let _ = handle.join();
        }
        if let Some(vs) = &self.video_stream {
            vs.stop();
        }
    }

    pub fn play(&self, clip: crate::types::Clip) {
        self.play_playlist(vec![ClipWithId { clip, id: 0 }]);
    }

    pub fn play_playlist(&self, clips: Playlist) {
        let mut state = self.state.lock().expect("player queue mutex poisoned");
        state.new_clip_ready = true;
        state.queued_clip_list = clips;
        state.splice_ready = false;
        state.override_stream_idx = None;
        self.changed.notify_all();
    }

    /// Replaces the tail of whatever's currently playing with `clips`,
    /// keeping already-played history; see [`do_splice`].
    pub fn splice_play(&self, clips: Playlist) {
        let mut state = self.state.lock().expect("player queue mutex poisoned");
        if state.new_clip_ready {
            state.queued_clip_list = clips;
            return;
        }
        state.splice_ready = true;
        state.to_splice_clip_list = clips;
    }

    pub fn override_angle(&self, stream_idx: u32) {
        let mut last_pts = None;
        {
            let mut state = self.state.lock().expect("player queue mutex poisoned");
            if state.new_clip_ready {
                if let Some(first) = state.queued_clip_list.first_mut() {
                    first.clip.stream_idx = stream_idx;
                }
                return;
            }
            if state.playing {
                state.override_stream_idx = Some(stream_idx);
                self.changed.notify_all();
                return;
            }
            if state.last_pts_played >= 0 {
                last_pts = Some(state.last_pts_played);
            }
        }
        let Some(last_pts) = last_pts else { return };
        if let Some(frame) = self.frame_store.first_at_or_after(stream_idx, last_pts) {
            if let Some(dest) = &self.destination {
                dest.show_original(stream_idx, frame);
            }
        }
    }

    pub fn set_pause_status(&self, status: impl Into<String>) {
        self.state.lock().expect("player queue mutex poisoned").pause_status = status.into();
    }

    pub fn skip_to_next(&self) {
        self.should_skip_to_next.store(true, Ordering::SeqCst);
    }

    pub fn set_master_speed(&self, speed: f64) {
        *self.master_speed.lock().expect("master speed mutex poisoned") = speed;
        *self.pending_speed_change.lock().expect("speed change mutex poisoned") = Some(speed);
    }

    pub fn set_done_callback(&self, cb: impl Fn() + Send + 'static) {
        *self.done_callback.lock().expect("done callback mutex poisoned") = Some(Box::new(cb));
    }

    pub fn set_progress_callback(&self, cb: impl Fn(&HashMap<u64, f64>, TimeRemaining) + Send + 'static) {
        *self.progress_callback.lock().expect("progress callback mutex poisoned") = Some(Box::new(cb));
    }

    fn take_queue_spot(&self) {
        self.state.lock().expect("player queue mutex poisoned").num_queued_frames += 1;
    }

    fn release_queue_spot(&self) {
        let mut state = self.state.lock().expect("player queue mutex poisoned");
        state.num_queued_frames -= 1;
        self.changed.notify_all();
    }

    fn run(self: Arc<Self>) {
        let mut pts: i64 = 0;
        while !self.should_quit.load(Ordering::SeqCst) {
            self.play_playlist_once(&mut pts);
        }
    }

    fn play_playlist_once(self: &Arc<Self>, pts: &mut i64) {
        let before_sleep = Instant::now();
        let (clip_list, pause_status) = {
            let mut state = self.state.lock().expect("player queue mutex poisoned");
            state.playing = false;
            let (mut state, _timed_out) = self
                .changed
                .wait_timeout_while(state, Duration::from_millis(REFRESH_INTERVAL_MS), |s| {
                    !self.should_quit.load(Ordering::SeqCst) && !s.new_clip_ready
                })
                .expect("player queue mutex poisoned");
            if self.should_quit.load(Ordering::SeqCst) {
                return;
            }
            if state.new_clip_ready {
                state.new_clip_ready = false;
                state.playing = true;
                let clips = std::mem::take(&mut state.queued_clip_list);
                (clips, String::new())
            } else {
                (Vec::new(), state.pause_status.clone())
            }
        };

        let slept = Instant::now() - before_sleep;
        let slept_pts = pts_from_seconds(slept.as_secs_f64());
        if slept_pts > 0 {
            if let Some(vs) = &self.video_stream {
                vs.schedule_silence(Instant::now(), *pts, slept_pts);
            }
            *pts += slept_pts;
        }

        if clip_list.is_empty() {
            if let Some(vs) = &self.video_stream {
                self.metrics.refresh_frame.fetch_add(1, Ordering::Relaxed);
                let subtitle = format!("Futatabi {};PAUSED;0.000;{}", env!("CARGO_PKG_VERSION"), pause_status);
                vs.schedule_refresh(Instant::now(), *pts, &subtitle, || {});
            }
            return;
        }

        self.should_skip_to_next.store(false, Ordering::SeqCst);
        self.play_clip_list(clip_list, pts);
    }

    #[allow(clippy::too_many_lines)]
    fn play_clip_list(self: &Arc<Self>, mut clip_list: Playlist, pts: &mut i64) {
        let origin = Instant::now();
        let master_speed = *self.master_speed.lock().expect("master speed mutex poisoned");
        let mut timeline = TimelineTracker::new(master_speed, *pts);
        timeline.new_clip(origin, clip_list[0].clip.pts_in, clip_list[0].clip.speed, 0);

        let mut clip_idx = 0usize;
        while clip_idx < clip_list.len() {
            let mut stream_idx = clip_list[clip_idx].clip.stream_idx;
            let mut next_clip_fade_time = next_fade_time(&clip_list, clip_idx, &timeline);

            if let Some(frame) = self.frame_store.last_before(stream_idx, timeline.in_pts_origin()) {
                timeline.snap_by(frame.pts - timeline.in_pts_origin());
            }

            let mut next_frame_start = origin;
            let mut frameno: i64 = 0;
            loop {
                if self.should_quit.load(Ordering::SeqCst) {
                    return;
                }
                let instant = timeline.advance_to_frame(frameno, self.frame_rate);
                let mut in_pts = instant.in_pts;
                *pts = instant.out_pts;
                next_frame_start = instant.wallclock_time;
                frameno += 1;

                if let Some(new_speed) = self.pending_speed_change.lock().expect("speed change mutex poisoned").take() {
                    if !timeline.at_master_speed(new_speed) {
                        let ease_length_out_pts = pts_from_seconds(EASE_NOMINAL_SECONDS);
                        let recommended = timeline.find_easing_length(
                            new_speed,
                            ease_length_out_pts,
                            &self.frame_store,
                            clip_list[clip_idx].clip.stream_idx,
                            instant,
                            self.frame_rate,
                        );
                        timeline.start_easing(new_speed, recommended, instant);
                    }
                }

                if self.should_skip_to_next.swap(false, Ordering::SeqCst) {
                    let clip = &mut clip_list[clip_idx].clip;
                    let trimmed = (in_pts as f64 + clip.fade_time * clip.speed * TIMEBASE as f64).round() as i64;
                    if !clip.is_open() {
                        clip.pts_out = clip.pts_out.min(trimmed);
                    } else {
                        clip.pts_out = trimmed;
                    }
                }

                let clip = &clip_list[clip_idx].clip;
                if !clip.is_open() && in_pts >= clip.pts_out {
                    break;
                }

                let play_audio = timeline.playing_at_normal_speed();

                {
                    let mut state = self.state.lock().expect("player queue mutex poisoned");
                    if state.splice_ready {
                        let playing_index2 = if clip_idx + 1 < clip_list.len() { Some(clip_idx + 1) } else { None };
                        do_splice(&state.to_splice_clip_list, clip_idx, playing_index2, &mut clip_list);
                        state.to_splice_clip_list.clear();
                        state.splice_ready = false;
                        next_clip_fade_time = next_fade_time(&clip_list, clip_idx, &timeline);
                    }
                    if let Some(idx) = state.override_stream_idx.take() {
                        stream_idx = idx;
                        clip_list[clip_idx].clip.stream_idx = idx;
                    }
                }
                let clip = clip_list[clip_idx].clip.clone();
                let next_clip = clip_list.get(clip_idx + 1).map(|c| c.clip.clone());

                let time_behind = Instant::now().saturating_duration_since(next_frame_start);
                self.metrics.record_ahead_seconds(-time_behind.as_secs_f64());
                if self.stream_output != StreamOutput::File && time_behind >= Duration::from_millis(200) {
                    tracing::warn!(ms = time_behind.as_millis() as u64, "behind schedule, dropping a frame");
                    self.metrics.dropped_unconditional_frame.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let in_pts_for_progress = in_pts;
                let mut primary_stream_idx = stream_idx;
                let mut secondary_stream_idx = None;
                let mut secondary_frame = None;
                let mut fade_alpha = 0.0f32;
                let mut in_pts_secondary_for_progress = None;
                let time_left_this_clip = (clip.pts_out - in_pts) as f64 / TIMEBASE as f64 / clip.speed;
                if let Some(next) = &next_clip {
                    if time_left_this_clip <= next_clip_fade_time {
                        let mut sec_idx = next.stream_idx;
                        let mut in_pts_secondary = (next.pts_in as f64
                            + (next_clip_fade_time - time_left_this_clip) * TIMEBASE as f64 * clip.speed)
                            .round() as i64;
                        in_pts_secondary_for_progress = Some(in_pts_secondary);
                        let mut alpha = 1.0 - (time_left_this_clip / next_clip_fade_time) as f32;

                        if alpha >= 0.5 {
                            std::mem::swap(&mut primary_stream_idx, &mut sec_idx);
                            std::mem::swap(&mut in_pts, &mut in_pts_secondary);
                            alpha = 1.0 - alpha;
                        }
                        fade_alpha = alpha;

                        if let Some((lower, _upper)) = find_surrounding_frames(&self.frame_store, in_pts_secondary, sec_idx) {
                            secondary_frame = Some(lower);
                            secondary_stream_idx = Some(sec_idx);
                        }
                    }
                }

                let clip_progress = calc_progress(&clip, in_pts_for_progress);
                let mut progress = HashMap::new();
                progress.insert(clip_list[clip_idx].id, clip_progress);
                let time_remaining = if let (Some(next), Some(sec_pts)) = (&next_clip, in_pts_secondary_for_progress) {
                    if time_left_this_clip <= next_clip_fade_time {
                        let next_progress = calc_progress(next, sec_pts);
                        progress.insert(clip_list[clip_idx + 1].id, next_progress);
                        compute_time_left(&clip_list, clip_idx + 1, next_progress)
                    } else {
                        compute_time_left(&clip_list, clip_idx, clip_progress)
                    }
                } else {
                    compute_time_left(&clip_list, clip_idx, clip_progress)
                };
                if let Some(cb) = self.progress_callback.lock().expect("progress callback mutex poisoned").as_ref() {
                    cb(&progress, time_remaining);
                }

                let Some((frame_lower, frame_upper)) = find_surrounding_frames(&self.frame_store, in_pts, primary_stream_idx) else {
                    break;
                };

                if self.wait_for_room_or_event(next_frame_start) {
                    return;
                }
                if self.state.lock().expect("player queue mutex poisoned").new_clip_ready {
                    if let Some(vs) = &self.video_stream {
                        vs.clear_queue();
                    }
                    return;
                }

                let total_seconds = time_remaining.num_infinite as f64 * 86_400.0 + time_remaining.seconds;
                let subtitle = format!(
                    "Futatabi {};PLAYING;{:.3};{} left",
                    env!("CARGO_PKG_VERSION"),
                    total_seconds,
                    time_remaining.format(clip_list.len() - clip_idx)
                );

                let pts_snap_tolerance = 0.01 * TIMEBASE as f64 * clip.speed / self.frame_rate;
                let mut snapped = false;
                for snap_frame in [frame_lower, frame_upper] {
                    if ((snap_frame.pts - in_pts) as f64).abs() < pts_snap_tolerance {
                        self.display_single_frame(
                            primary_stream_idx,
                            snap_frame,
                            secondary_stream_idx,
                            secondary_frame,
                            fade_alpha,
                            next_frame_start,
                            *pts,
                            true,
                            &subtitle,
                            play_audio,
                        );
                        timeline.snap_by(snap_frame.pts - in_pts);
                        snapped = true;
                        break;
                    }
                }
                if snapped {
                    continue;
                }

                if frame_lower.pts == frame_upper.pts || self.video_stream.is_none() {
                    self.display_single_frame(
                        primary_stream_idx,
                        frame_lower,
                        secondary_stream_idx,
                        secondary_frame,
                        fade_alpha,
                        next_frame_start,
                        *pts,
                        false,
                        &subtitle,
                        play_audio,
                    );
                    continue;
                }

                for fraction in [1.0 / 2.0, 1.0 / 3.0, 2.0 / 3.0, 1.0 / 4.0, 3.0 / 4.0, 1.0 / 5.0, 2.0 / 5.0, 3.0 / 5.0, 4.0 / 5.0] {
                    let subsnap_pts = frame_lower.pts as f64 + fraction * (frame_upper.pts - frame_lower.pts) as f64;
                    if (subsnap_pts - in_pts as f64).abs() < pts_snap_tolerance {
                        let rounded = subsnap_pts.round() as i64;
                        timeline.snap_by(rounded - in_pts);
                        in_pts = rounded;
                        break;
                    }
                }

                if self.stream_output != StreamOutput::File && time_behind >= Duration::from_millis(100) {
                    tracing::warn!(ms = time_behind.as_millis() as u64, "behind schedule, dropping an interpolated frame");
                    self.metrics.dropped_interpolated_frame.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let alpha = (in_pts - frame_lower.pts) as f32 / (frame_upper.pts - frame_lower.pts) as f32;
                if secondary_stream_idx.is_none() {
                    self.metrics.interpolated_frame.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.interpolated_faded_frame.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(vs) = &self.video_stream {
                    let destination = self.destination.clone();
                    let me = self.clone();
                    self.take_queue_spot();
                    let display_func = move || {
                        if let Some(dest) = &destination {
                            match secondary_frame {
                                Some(sec) => dest.show_faded(primary_stream_idx, frame_lower, sec, fade_alpha),
                                None => dest.show_original(primary_stream_idx, frame_lower),
                            }
                        }
                        me.release_queue_spot();
                    };
                    vs.schedule_interpolated(
                        next_frame_start,
                        *pts,
                        frame_lower,
                        frame_upper,
                        alpha,
                        secondary_frame,
                        fade_alpha,
                        &subtitle,
                        play_audio,
                        display_func,
                    );
                }
                self.state.lock().expect("player queue mutex poisoned").last_pts_played = in_pts;
            }

            if self.should_quit.load(Ordering::SeqCst) {
                return;
            }

            if let Some(next) = clip_list.get(clip_idx + 1) {
                let offset = (next_clip_fade_time * TIMEBASE as f64 * clip_list[clip_idx].clip.speed).round() as i64;
                timeline.new_clip(next_frame_start, next.clip.pts_in, next.clip.speed, offset);
            }
            clip_idx += 1;
        }

        if let Some(cb) = self.done_callback.lock().expect("done callback mutex poisoned").as_ref() {
            cb();
        }
    }

    /// Blocks until there's room in the video stream's queue (or no video
    /// stream at all, in which case it just waits out the clock), or until
    /// a preempting event fires. Returns `true` if the caller should give up
    /// on this clip entirely (shutdown requested).
    fn wait_for_room_or_event(&self, next_frame_start: Instant) -> bool {
        let state = self.state.lock().expect("player queue mutex poisoned");
        let state = if self.video_stream.is_none() {
            let wait_for = next_frame_start.saturating_duration_since(Instant::now());
            let (state, _timed_out) = self
                .changed
                .wait_timeout_while(state, wait_for, |s| {
                    !(self.should_quit.load(Ordering::SeqCst) || s.new_clip_ready || s.override_stream_idx.is_some())
                })
                .expect("player queue mutex poisoned");
            state
        } else {
            let max_queued = self.max_queued_frames;
            self.changed
                .wait_while(state, |s| {
                    if s.num_queued_frames < max_queued {
                        return false;
                    }
                    !(self.should_quit.load(Ordering::SeqCst) || s.new_clip_ready || s.override_stream_idx.is_some())
                })
                .expect("player queue mutex poisoned")
        };
        drop(state);
        self.should_quit.load(Ordering::SeqCst)
    }

    #[allow(clippy::too_many_arguments)]
    fn display_single_frame(
        self: &Arc<Self>,
        primary_stream_idx: u32,
        primary_frame: FrameRef,
        secondary_stream_idx: Option<u32>,
        secondary_frame: Option<FrameRef>,
        fade_alpha: f32,
        frame_start: Instant,
        pts: i64,
        snapped: bool,
        subtitle: &str,
        play_audio: bool,
    ) {
        self.state.lock().expect("player queue mutex poisoned").last_pts_played = primary_frame.pts;

        let Some(vs) = &self.video_stream else {
            if let Some(dest) = &self.destination {
                match secondary_frame {
                    Some(sec) => dest.show_faded(primary_stream_idx, primary_frame, sec, fade_alpha),
                    None => dest.show_original(primary_stream_idx, primary_frame),
                }
            }
            return;
        };

        let destination = self.destination.clone();
        let me = self.clone();
        self.take_queue_spot();

        match secondary_frame {
            Some(sec) if secondary_stream_idx.is_some() => {
                if snapped {
                    self.metrics.faded_snapped_frame.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.faded_frame.fetch_add(1, Ordering::Relaxed);
                }
                let display_func = move || {
                    if let Some(dest) = &destination {
                        dest.show_faded(primary_stream_idx, primary_frame, sec, fade_alpha);
                    }
                    me.release_queue_spot();
                };
                vs.schedule_faded(frame_start, pts, primary_frame, sec, fade_alpha, subtitle, display_func);
            }
            _ => {
                if snapped {
                    self.metrics.original_snapped_frame.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.metrics.original_frame.fetch_add(1, Ordering::Relaxed);
                }
                let display_func = move || {
                    if let Some(dest) = &destination {
                        dest.show_original(primary_stream_idx, primary_frame);
                    }
                    me.release_queue_spot();
                };
                let _ = vs.schedule_original(frame_start, pts, primary_frame, subtitle, play_audio, display_func);
            }
        }
    }
}

fn pts_from_seconds(seconds: f64) -> i64 {
    (seconds * TIMEBASE as f64).round() as i64
}

fn calc_progress(clip: &crate::types::Clip, pts: i64) -> f64 {
    (pts - clip.pts_in) as f64 / (clip.pts_out - clip.pts_in) as f64
}

fn next_fade_time(clip_list: &Playlist, clip_idx: usize, timeline: &TimelineTracker) -> f64 {
    let Some(next) = clip_list.get(clip_idx + 1) else {
        return -1.0;
    };
    let clip = &clip_list[clip_idx].clip;
    let duration_this_clip = (clip.pts_out - timeline.in_pts_origin()) as f64 / TIMEBASE as f64 / clip.speed;
    let duration_next_clip = (next.clip.pts_out - next.clip.pts_in) as f64 / TIMEBASE as f64 / clip.speed;
    duration_this_clip.min(duration_next_clip).min(clip.fade_time)
}

/// Finds the last frame with `pts <= query` and the first with `pts >=
/// query`, treating a query before the first frame as bracketed by that
/// first frame on both sides (rather than failing). Only fails when `pts`
/// is after the stream's last frame.
fn find_surrounding_frames(frame_store: &FrameStore, pts: i64, stream_idx: u32) -> Option<(FrameRef, FrameRef)> {
    let upper = frame_store.first_at_or_after(stream_idx, pts)?;
    let lower = frame_store.last_before(stream_idx, pts).unwrap_or(upper);
    Some((lower, upper))
}

/// Replaces the tail of `old_list` (from just after whatever's playing)
/// with the tail of `new_list`, using shared clip ids to find the splice
/// point; does nothing if the two lists share no common history.
fn do_splice(new_list: &[ClipWithId], playing_index1: usize, playing_index2: Option<usize>, old_list: &mut Playlist) {
    let mut splice_start_new_list = None;
    for (idx, c) in new_list.iter().enumerate() {
        if c.id == old_list[playing_index1].id {
            splice_start_new_list = Some(idx + 1);
        } else if let Some(pi2) = playing_index2 {
            if c.id == old_list[pi2].id {
                splice_start_new_list = Some(idx + 1);
            }
        }
    }

    let splice_start_new_list = splice_start_new_list.or_else(|| {
        let played_ids: HashSet<u64> = old_list[..playing_index1].iter().map(|c| c.id).collect();
        new_list
            .iter()
            .enumerate()
            .filter(|(_, c)| played_ids.contains(&c.id))
            .map(|(idx, _)| idx + 1)
            .next_back()
    });

    let Some(splice_start_new_list) = splice_start_new_list else {
        return;
    };

    let splice_start_old_list = playing_index2.unwrap_or(playing_index1) + 1;
    old_list.truncate(splice_start_old_list);
    old_list.extend_from_slice(&new_list[splice_start_new_list..]);
}

/// `{num_infinite, seconds}` remaining across `clips[currently_playing_idx..]`,
/// given how far into the currently-playing clip we are.
pub fn compute_time_left(clips: &Playlist, currently_playing_idx: usize, progress_currently_playing: f64) -> TimeRemaining {
    let mut remaining = TimeRemaining::ZERO;
    let mut last_fade_time_seconds = 0.0;
    for (row, entry) in clips.iter().enumerate().skip(currently_playing_idx) {
        let clip = &entry.clip;
        let clip_length = if clip.is_open() {
            f64::INFINITY
        } else {
            (clip.pts_out - clip.pts_in) as f64 / TIMEBASE as f64 / clip.speed
        };
        if clip_length >= 86_400.0 {
            remaining.num_infinite += 1;
        } else if row == currently_playing_idx {
            remaining.seconds = clip_length * (1.0 - progress_currently_playing);
        } else {
            remaining.seconds += (clip_length - last_fade_time_seconds).max(0.0);
        }
        last_fade_time_seconds = clip_length.min(clip.fade_time);
    }
    remaining
}

pub fn compute_total_time(clips: &Playlist) -> TimeRemaining {
    compute_time_left(clips, 0, 0.0)
}

/// Tracks the (wallclock, in_pts, out_pts, frameno) origin a clip is being
/// played from, re-basing it whenever something breaks the linear
/// assumption (a new clip, a completed ease, a snap).
struct TimelineTracker {
    master_speed: f64,
    speed: f64,
    origin: TimelineInstant,
    last_out_pts: i64,
    in_easing: bool,
    ease_started_pts: i64,
    master_speed_ease_target: f64,
    ease_length_out_pts: i64,
}

#[derive(Debug, Clone, Copy)]
struct TimelineInstant {
    wallclock_time: Instant,
    in_pts: i64,
    out_pts: i64,
    frameno: i64,
}

impl TimelineTracker {
    fn new(master_speed: f64, out_pts_origin: i64) -> Self {
        Self {
            master_speed,
            speed: 1.0,
            origin: TimelineInstant {
                wallclock_time: Instant::now(),
                in_pts: 0,
                out_pts: out_pts_origin,
                frameno: 0,
            },
            last_out_pts: out_pts_origin,
            in_easing: false,
            ease_started_pts: 0,
            master_speed_ease_target: master_speed,
            ease_length_out_pts: 0,
        }
    }

    fn new_clip(&mut self, wallclock_origin: Instant, clip_pts_in: i64, clip_speed: f64, start_pts_offset: i64) {
        self.speed = clip_speed;
        self.origin = TimelineInstant {
            wallclock_time: wallclock_origin,
            in_pts: clip_pts_in + start_pts_offset,
            out_pts: self.last_out_pts,
            frameno: 0,
        };
    }

    fn in_pts_origin(&self) -> i64 {
        self.origin.in_pts
    }

    fn playing_at_normal_speed(&self) -> bool {
        if self.in_easing {
            return false;
        }
        let effective_speed = self.speed * self.master_speed;
        (0.999..=1.001).contains(&effective_speed)
    }

    fn snap_by(&mut self, offset: i64) {
        if self.in_easing {
            return;
        }
        self.origin.in_pts += offset;
    }

    fn at_master_speed(&self, speed: f64) -> bool {
        !self.in_easing && (self.master_speed - speed).abs() < 1e-6
    }

    fn advance_to_frame(&mut self, frameno: i64, fps: f64) -> TimelineInstant {
        let delta_frames = (frameno - self.origin.frameno) as f64;
        let mut in_pts_double = self.origin.in_pts as f64 + TIMEBASE as f64 * self.speed * delta_frames * self.master_speed / fps;
        let out_pts_double = self.origin.out_pts as f64 + TIMEBASE as f64 * delta_frames / fps;

        if self.in_easing {
            in_pts_double += self.easing_out_pts_adjustment(out_pts_double) * self.speed;
        }

        let micros = ((out_pts_double - self.origin.out_pts as f64) * 1e6 / TIMEBASE as f64).round();
        let wallclock_time = if micros >= 0.0 {
            self.origin.wallclock_time + Duration::from_micros(micros as u64)
        } else {
            self.origin
                .wallclock_time
                .checked_sub(Duration::from_micros((-micros) as u64))
                .unwrap_or(self.origin.wallclock_time)
        };

        let instant = TimelineInstant {
            in_pts: in_pts_double.round() as i64,
            out_pts: out_pts_double.round() as i64,
            wallclock_time,
            frameno,
        };
        self.last_out_pts = instant.out_pts;

        if self.in_easing && instant.out_pts >= self.ease_started_pts + self.ease_length_out_pts {
            self.origin.out_pts += self.easing_out_pts_adjustment(out_pts_double) as i64;
            self.change_master_speed(self.master_speed_ease_target, instant);
            self.in_easing = false;
        }

        instant
    }

    fn change_master_speed(&mut self, new_master_speed: f64, now: TimelineInstant) {
        self.master_speed = new_master_speed;
        self.origin = now;
    }

    fn start_easing(&mut self, new_master_speed: f64, length_out_pts: i64, now: TimelineInstant) {
        if self.in_easing {
            self.origin.out_pts += self.easing_out_pts_adjustment(now.out_pts as f64) as i64;
            let reached_speed = self.master_speed + (self.master_speed_ease_target - self.master_speed) * self.find_ease_t(now.out_pts as f64);
            self.change_master_speed(reached_speed, now);
        }
        self.in_easing = true;
        self.ease_started_pts = now.out_pts;
        self.master_speed_ease_target = new_master_speed;
        self.ease_length_out_pts = length_out_pts;
    }

    fn find_ease_t(&self, out_pts: f64) -> f64 {
        (out_pts - self.ease_started_pts as f64) / self.ease_length_out_pts as f64
    }

    fn easing_out_pts_adjustment(&self, out_pts: f64) -> f64 {
        let t = self.find_ease_t(out_pts);
        let area_factor = (self.master_speed_ease_target - self.master_speed) * self.ease_length_out_pts as f64;
        let mut val = 0.5 * t.min(1.0) * t.min(1.0) * area_factor;
        if t > 1.0 {
            val += area_factor * (t - 1.0);
        }
        val
    }

    /// Picks an ease length near `desired_length_out_pts` that lands the
    /// ease's end exactly on an original input frame, searching output-frame
    /// offsets in `[-2, 2]` crossed with input-frame offsets in `[-2, 2]`.
    /// Falls back to the nominal length if nothing within 2 seconds works.
    fn find_easing_length(
        &self,
        master_speed_target: f64,
        desired_length_out_pts: i64,
        frame_store: &FrameStore,
        stream_idx: u32,
        now: TimelineInstant,
        frame_rate: f64,
    ) -> i64 {
        let in_pts_length = 0.5 * (master_speed_target + self.master_speed) * desired_length_out_pts as f64 * self.speed;
        let input_frame_num = frame_store.index_at_or_after(stream_idx, (now.in_pts as f64 + in_pts_length).round() as i64);

        let frame_length = TIMEBASE as f64 / frame_rate;
        let length_out_frames = (desired_length_out_pts as f64 / frame_length).round() as i64;

        let mut best_length_out_pts = TIMEBASE * 10;
        for output_frame_offset in -2..=2i64 {
            let aim_length_out_pts = ((length_out_frames + output_frame_offset) as f64 * frame_length).round();
            if aim_length_out_pts < 0.0 {
                continue;
            }
            for input_frame_offset in -2..=2i64 {
                let idx = input_frame_num as i64 + input_frame_offset;
                if idx < 0 {
                    continue;
                }
                let Some(frame) = frame_store.frame_at(stream_idx, idx as usize) else {
                    continue;
                };
                let shorten_by_out_pts = (2.0 * (frame.pts - now.in_pts) as f64 / self.speed
                    - (master_speed_target + self.master_speed) * aim_length_out_pts)
                    / (master_speed_target - self.master_speed);
                let length_out_pts = (aim_length_out_pts - shorten_by_out_pts).round() as i64;

                if length_out_pts >= 0 && (length_out_pts - desired_length_out_pts).abs() < (best_length_out_pts - desired_length_out_pts).abs() {
                    best_length_out_pts = length_out_pts;
                }
            }
        }

        if best_length_out_pts > TIMEBASE * 2 {
            desired_length_out_pts
        } else {
            best_length_out_pts
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Clip;

    fn clip(id: u64, pts_in: i64, pts_out: i64, speed: f64, fade_time: f64) -> ClipWithId {
        ClipWithId {
            clip: Clip {
                pts_in,
                pts_out,
                stream_idx: 0,
                speed,
                fade_time,
                descriptions: Default::default(),
            },
            id,
        }
    }

    #[test]
    fn compute_time_left_sums_remaining_finite_clips() {
        let clips = vec![
            clip(1, 0, TIMEBASE, 1.0, 0.0),
            clip(2, 0, TIMEBASE, 1.0, 0.0),
        ];
        let remaining = compute_time_left(&clips, 0, 0.5);
        assert_eq!(remaining.num_infinite, 0);
        assert!((remaining.seconds - 1.5).abs() < 1e-9);
    }

    #[test]
    fn compute_time_left_counts_open_clips_as_infinite() {
        let clips = vec![clip(1, 0, -1, 1.0, 0.0)];
        let remaining = compute_time_left(&clips, 0, 0.0);
        assert_eq!(remaining.num_infinite, 1);
    }

    #[test]
    fn do_splice_replaces_tail_after_shared_id() {
        let mut old_list = vec![clip(1, 0, 0, 1.0, 0.0), clip(2, 0, 0, 1.0, 0.0), clip(3, 0, 0, 1.0, 0.0)];
        let new_list = vec![clip(2, 0, 0, 1.0, 0.0), clip(4, 0, 0, 1.0, 0.0)];
        do_splice(&new_list, 1, None, &mut old_list);
        let ids: Vec<u64> = old_list.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn do_splice_ignores_disjoint_lists() {
        let mut old_list = vec![clip(1, 0, 0, 1.0, 0.0), clip(2, 0, 0, 1.0, 0.0)];
        let new_list = vec![clip(9, 0, 0, 1.0, 0.0)];
        do_splice(&new_list, 0, None, &mut old_list);
        let ids: Vec<u64> = old_list.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn timeline_advance_moves_in_and_out_pts_by_speed_and_fps() {
        let mut tl = TimelineTracker::new(1.0, 0);
        tl.new_clip(Instant::now(), 0, 1.0, 0);
        let first = tl.advance_to_frame(0, 60.0);
        let second = tl.advance_to_frame(1, 60.0);
        assert_eq!(first.out_pts, 0);
        assert_eq!(second.out_pts, TIMEBASE / 60);
        assert_eq!(second.in_pts, TIMEBASE / 60);
    }

    #[test]
    fn timeline_snap_by_shifts_in_pts_origin_only() {
        let mut tl = TimelineTracker::new(1.0, 0);
        tl.new_clip(Instant::now(), 0, 1.0, 0);
        tl.snap_by(500);
        assert_eq!(tl.in_pts_origin(), 500);
    }
}
