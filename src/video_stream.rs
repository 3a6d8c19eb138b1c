//! Video Stream (VS): owns the encode thread, the bounded pool of
//! interpolated-frame resources, and the packet muxer. The player thread
//! (or a test) drives it purely through the `schedule_*` calls; the encode
//! thread drains `frame_queue` at the pace its `local_pts` timestamps
//! dictate.
//!
//! Pixel composition (fading two frames, running flow + interpolation) is
//! behind the [`FrameCompositor`] trait so this module's concurrency and
//! queueing logic can be tested without a live OpenGL context:
//! [`CpuFadeCompositor`] backs the test suite, while [`GpuFrameCompositor`]
//! is the production implementation, running real DIS flow and splat
//! interpolation on [`crate::gpu`].

use crate::constants::IFR_POOL_SIZE;
use crate::decode::{DecodeCache, MissPolicy};
use crate::error::FutatabiResult;
use crate::frame_store::{FrameReader, FrameStore};
use crate::mux::Mux;
use crate::types::FrameRef;
use glow::HasContext;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Flow-consistency tolerance passed to the splat/blend shaders: flow
/// vectors whose forward/backward disagreement exceeds this (in pixels)
/// fall back to a straight cross-fade at that pixel rather than warping.
const FLOW_CONSISTENCY_TOLERANCE: f32 = 4.0;

/// One composited output frame's planar pixels, ready for chroma
/// subsampling and JPEG encode.
pub struct Composited {
    pub y: Vec<u8>,
    pub cb_full: Vec<u8>,
    pub cr_full: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub exif: Vec<u8>,
}

/// Produces composited pixels for FADED/INTERPOLATED output frames. The
/// queueing/backpressure/ordering logic in [`VideoStream`] never inspects
/// pixels, so any implementation satisfying this trait is a drop-in swap.
pub trait FrameCompositor: Send {
    fn fade(&mut self, frame1: &crate::decode::PlanarFrame, frame2: &crate::decode::PlanarFrame, alpha: f32) -> Composited;

    fn interpolate(
        &mut self,
        frame1: &crate::decode::PlanarFrame,
        frame2: &crate::decode::PlanarFrame,
        alpha: f32,
        secondary: Option<(&crate::decode::PlanarFrame, f32)>,
        reuse_flow: bool,
    ) -> Composited;
}

/// CPU alpha-blend compositor. Used by tests and as a fallback when no GPU
/// context is configured; it skips the DIS flow pass entirely (a plain
/// cross-fade, not motion-compensated interpolation) and exists to keep
/// the queueing logic testable without a real display.
pub struct CpuFadeCompositor;

impl FrameCompositor for CpuFadeCompositor {
    fn fade(&mut self, frame1: &crate::decode::PlanarFrame, frame2: &crate::decode::PlanarFrame, alpha: f32) -> Composited {
        blend(frame1, frame2, alpha)
    }

    fn interpolate(
        &mut self,
        frame1: &crate::decode::PlanarFrame,
        frame2: &crate::decode::PlanarFrame,
        alpha: f32,
        secondary: Option<(&crate::decode::PlanarFrame, f32)>,
        _reuse_flow: bool,
    ) -> Composited {
        let out = blend(frame1, frame2, alpha);
        match secondary {
            Some((secondary_frame, fade_alpha)) => blend_composited(&out, secondary_frame, fade_alpha),
            None => out,
        }
    }
}

fn blend(a: &crate::decode::PlanarFrame, b: &crate::decode::PlanarFrame, alpha: f32) -> Composited {
    let lerp = |x: u8, y: u8| -> u8 { (x as f32 + (y as f32 - x as f32) * alpha).round() as u8 };
    let y = a.y.iter().zip(&b.y).map(|(&x, &yv)| lerp(x, yv)).collect();
    let cb_full = a.cb.iter().zip(&b.cb).map(|(&x, &yv)| lerp(x, yv)).collect();
    let cr_full = a.cr.iter().zip(&b.cr).map(|(&x, &yv)| lerp(x, yv)).collect();
    Composited {
        y,
        cb_full,
        cr_full,
        width: a.width,
        height: a.height,
        exif: b.exif.clone(),
    }
}

/// Fades an already-composited frame (e.g. the output of an alpha
/// interpolation between `frame1`/`frame2`) against a secondary source
/// frame, for `FrameKind::FadedInterpolated` — the interpolated result is
/// what gets faded, not `frame1` on its own.
fn blend_composited(a: &Composited, b: &crate::decode::PlanarFrame, alpha: f32) -> Composited {
    let lerp = |x: u8, y: u8| -> u8 { (x as f32 + (y as f32 - x as f32) * alpha).round() as u8 };
    let y = a.y.iter().zip(&b.y).map(|(&x, &yv)| lerp(x, yv)).collect();
    let cb_full = a.cb_full.iter().zip(&b.cb).map(|(&x, &yv)| lerp(x, yv)).collect();
    let cr_full = a.cr_full.iter().zip(&b.cr).map(|(&x, &yv)| lerp(x, yv)).collect();
    Composited {
        y,
        cb_full,
        cr_full,
        width: a.width,
        height: a.height,
        exif: b.exif.clone(),
    }
}

/// Real GPU-backed compositor: runs DIS flow (reusing the previous frame's
/// flow texture when the input pair is unchanged) and splat-based
/// interpolation, matching the original's `VideoStream::schedule_interpolated_frame`.
pub struct GpuFrameCompositor {
    gl: Arc<glow::Context>,
    pool: crate::gpu::TexturePool,
    flow: crate::gpu::DisFlow,
    interpolate: crate::gpu::Interpolate,
    operating_point: crate::gpu::OperatingPoint,
    last_flow: Option<crate::gpu::TextureHandle>,
}

impl GpuFrameCompositor {
    pub fn new(gl: Arc<glow::Context>, operating_point: crate::gpu::OperatingPoint) -> Result<Self, String> {
        let flow = crate::gpu::DisFlow::new(&gl)?;
        let interpolate = crate::gpu::Interpolate::new(&gl, crate::gpu::interpolate::OutputLayout::SplitYCbCr)?;
        Ok(Self {
            gl,
            pool: crate::gpu::TexturePool::new(),
            flow,
            interpolate,
            operating_point,
            last_flow: None,
        })
    }
}

impl FrameCompositor for GpuFrameCompositor {
    fn fade(&mut self, frame1: &crate::decode::PlanarFrame, frame2: &crate::decode::PlanarFrame, alpha: f32) -> Composited {
        // A plain cross-fade needs no flow computation; delegate to the
        // same linear blend the CPU path uses (movit's MixEffect does the
        // equivalent on the GPU in the original).
        blend(frame1, frame2, alpha)
    }

    fn interpolate(
        &mut self,
        frame1: &crate::decode::PlanarFrame,
        frame2: &crate::decode::PlanarFrame,
        alpha: f32,
        secondary: Option<(&crate::decode::PlanarFrame, f32)>,
        reuse_flow: bool,
    ) -> Composited {
        let gl = self.gl.clone();
        let width = frame1.width;
        let height = frame1.height;

        let sources = self.pool.get(&gl, crate::gpu::TextureFormat::Rgba8, width, height, 2);
        unsafe {
            upload_packed_layer(&gl, sources, 0, width, height, frame1);
            upload_packed_layer(&gl, sources, 1, width, height, frame2);
        }

        let flow = if reuse_flow {
            match self.last_flow.take() {
                Some(cached) => cached,
                None => self.flow.compute(&gl, &self.pool, sources, width, height, self.operating_point, crate::gpu::FlowDirection::Forward),
            }
        } else {
            if let Some(prev) = self.last_flow.take() {
                self.pool.release(prev);
            }
            self.flow.compute(&gl, &self.pool, sources, width, height, self.operating_point, crate::gpu::FlowDirection::Forward)
        };
        self.last_flow = Some(flow);

        let output = self
            .interpolate
            .run(&gl, &self.pool, flow, sources, width, height, alpha, FLOW_CONSISTENCY_TOLERANCE);
        let packed = unsafe { read_back_rgba8(&gl, output, width, height) };
        self.pool.release(output);
        self.pool.release(sources);

        let out = unpack_composited(&packed, width, height, frame2.exif.clone());
        match secondary {
            Some((secondary_frame, fade_alpha)) => blend_composited(&out, secondary_frame, fade_alpha),
            None => out,
        }
    }
}

/// Packs `frame`'s luma and (nearest-neighbor-upsampled) chroma into one
/// RGBA8 layer of a two-layer source array: R=Y, G=Cb, B=Cr, A=255. Both
/// DIS flow and splat interpolation sample this array directly, so no
/// separate grayscale upload is needed — the shaders read its R channel.
unsafe fn upload_packed_layer(
    gl: &glow::Context,
    array: crate::gpu::TextureHandle,
    layer: i32,
    width: u32,
    height: u32,
    frame: &crate::decode::PlanarFrame,
) {
    let cx = frame.cx.max(1);
    let cy = frame.cy.max(1);
    let chroma_width = frame.width.div_ceil(cx).max(1);
    let mut packed = vec![0u8; (width as usize) * (height as usize) * 4];
    for row in 0..height {
        let chroma_row = (row / cy) as usize;
        for col in 0..width {
            let chroma_col = (col / cx) as usize;
            let luma_idx = (row * width + col) as usize;
            let chroma_idx = chroma_row * chroma_width as usize + chroma_col;
            let out_idx = luma_idx * 4;
            packed[out_idx] = frame.y.get(luma_idx).copied().unwrap_or(0);
            packed[out_idx + 1] = frame.cb.get(chroma_idx).copied().unwrap_or(128);
            packed[out_idx + 2] = frame.cr.get(chroma_idx).copied().unwrap_or(128);
            packed[out_idx + 3] = 255;
        }
    }
    let crate::gpu::TextureHandle::Texture(tex) = array else {
        panic!("upload_packed_layer called on a renderbuffer handle");
    };
    gl.bind_texture(glow::TEXTURE_2D_ARRAY, Some(tex));
    gl.tex_sub_image_3d(
        glow::TEXTURE_2D_ARRAY,
        0,
        0,
        0,
        layer,
        width as i32,
        height as i32,
        1,
        glow::RGBA,
        glow::UNSIGNED_BYTE,
        glow::PixelUnpackData::Slice(Some(&packed)),
    );
}

/// Reads an RGBA8 render target back into a packed CPU buffer via a
/// throwaway framebuffer. `GpuFrameCompositor` is driven synchronously
/// (`QueuedFrame` carries no fence), so every interpolated frame pays this
/// readback before `interpolate` returns.
unsafe fn read_back_rgba8(gl: &glow::Context, texture: crate::gpu::TextureHandle, width: u32, height: u32) -> Vec<u8> {
    let mut pixels = vec![0u8; (width as usize) * (height as usize) * 4];
    let fbo = crate::gpu::pool::bind_draw_target(gl, texture, -1, width, height);
    gl.read_pixels(
        0,
        0,
        width as i32,
        height as i32,
        glow::RGBA,
        glow::UNSIGNED_BYTE,
        glow::PixelPackData::Slice(Some(&mut pixels)),
    );
    crate::gpu::pool::unbind_draw_target(gl, fbo);
    pixels
}

/// Splits a packed RGBA8 buffer (R=Y, G=Cb, B=Cr) back into
/// [`Composited`]'s separate planes.
fn unpack_composited(packed: &[u8], width: u32, height: u32, exif: Vec<u8>) -> Composited {
    let pixel_count = (width as usize) * (height as usize);
    let mut y = vec![0u8; pixel_count];
    let mut cb_full = vec![0u8; pixel_count];
    let mut cr_full = vec![0u8; pixel_count];
    for i in 0..pixel_count {
        y[i] = packed[i * 4];
        cb_full[i] = packed[i * 4 + 1];
        cr_full[i] = packed[i * 4 + 2];
    }
    Composited { y, cb_full, cr_full, width, height, exif }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Original,
    Faded,
    Interpolated,
    FadedInterpolated,
    Refresh,
    Silence,
}

struct IfrSlot(usize);

/// RAII handle returned by [`VideoStream`]'s internal IFR pool; dropping it
/// (at the end of the encode thread's processing of a queued item) returns
/// the slot to the free list.
struct BorrowedIfr {
    slot: Option<usize>,
    shared: Arc<Shared>,
}

impl Drop for BorrowedIfr {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.ifr_free.lock().expect("ifr pool mutex poisoned").push_back(IfrSlot(slot));
            self.shared.queue_changed.notify_all();
        }
    }
}

struct QueuedFrame {
    local_pts: Instant,
    output_pts: i64,
    kind: FrameKind,
    frame1: Option<FrameRef>,
    frame2: Option<FrameRef>,
    secondary_frame: Option<FrameRef>,
    alpha: f32,
    fade_alpha: f32,
    subtitle: String,
    include_audio: bool,
    silence_length_pts: i64,
    resources: Option<BorrowedIfr>,
    display_func: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct Metrics {
    dropped_interpolated: AtomicU64,
    dropped_unconditional: AtomicU64,
    faded: AtomicU64,
    interpolated: AtomicU64,
    original: AtomicU64,
    refresh: AtomicU64,
    silence: AtomicU64,
}

struct LastFlowCache {
    frame1: Option<FrameRef>,
    frame2: Option<FrameRef>,
}

struct Shared {
    ifr_free: Mutex<VecDeque<IfrSlot>>,
    frame_queue: Mutex<VecDeque<QueuedFrame>>,
    queue_changed: Condvar,
    queue_generation: AtomicU64,
    should_quit: AtomicBool,
    decode_cache: Arc<DecodeCache>,
    frame_store: Arc<FrameStore>,
    reader: Mutex<FrameReader>,
    mux: Mutex<Mux>,
    last_flow: Mutex<LastFlowCache>,
    last_video_frame: Mutex<Option<Vec<u8>>>,
    metrics: Metrics,
}

pub struct VideoStream {
    shared: Arc<Shared>,
    encode_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VideoStream {
    pub fn new(frame_store: Arc<FrameStore>, decode_cache: Arc<DecodeCache>, mux: Mux) -> Self {
        let reader = frame_store.new_reader();
        let shared = Arc::new(Shared {
            ifr_free: Mutex::new((0..IFR_POOL_SIZE).map(IfrSlot).collect()),
            frame_queue: Mutex::new(VecDeque::new()),
            queue_changed: Condvar::new(),
            queue_generation: AtomicU64::new(0),
            should_quit: AtomicBool::new(false),
            decode_cache,
            frame_store,
            reader: Mutex::new(reader),
            mux: Mutex::new(mux),
            last_flow: Mutex::new(LastFlowCache { frame1: None, frame2: None }),
            last_video_frame: Mutex::new(None),
            metrics: Metrics::default(),
        });
        Self {
            shared,
            encode_thread: Mutex::new(None),
        }
    }

    pub fn start(&self, compositor: Box<dyn FrameCompositor>) {
        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || encode_thread_func(shared, compositor));
        *self.encode_thread.lock().expect("encode thread handle mutex poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.shared.should_quit.store(true, Ordering::SeqCst);
        self.shared.queue_changed.notify_all();
        if let Some(handle) = self.encode_thread.lock().expect("encode thread handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Drops every queued item, returning any borrowed IFR slots. Lingering
    /// GPU resources are released out-of-band via `QueuedFrame`'s `Drop`.
    pub fn clear_queue(&self) {
        let mut queue = self.shared.frame_queue.lock().expect("frame queue mutex poisoned");
        queue.clear();
        self.shared.queue_generation.fetch_add(1, Ordering::SeqCst);
        drop(queue);
        self.shared.queue_changed.notify_all();
    }

    pub fn num_queued_frames(&self) -> usize {
        self.shared.frame_queue.lock().expect("frame queue mutex poisoned").len()
    }

    pub fn schedule_original(
        &self,
        local_pts: Instant,
        output_pts: i64,
        frame: FrameRef,
        subtitle: &str,
        include_audio: bool,
        display_func: impl FnOnce() + Send + 'static,
    ) -> FutatabiResult<()> {
        self.shared.metrics.original.fetch_add(1, Ordering::Relaxed);
        let mut reader = self.shared.reader.lock().expect("frame reader mutex poisoned");
        let decoded = self.shared.frame_store.read(&mut reader, frame, true, include_audio)?;
        drop(reader);

        self.enqueue(QueuedFrame {
            local_pts,
            output_pts,
            kind: FrameKind::Original,
            frame1: Some(frame),
            frame2: None,
            secondary_frame: None,
            alpha: 0.0,
            fade_alpha: 0.0,
            subtitle: subtitle.to_string(),
            include_audio,
            silence_length_pts: 0,
            resources: None,
            display_func: Some(Box::new(display_func)),
        });
        self.stash_original_bytes(decoded.video);
        Ok(())
    }

    pub fn schedule_faded(
        &self,
        local_pts: Instant,
        output_pts: i64,
        frame1: FrameRef,
        frame2: FrameRef,
        alpha: f32,
        subtitle: &str,
        display_func: impl FnOnce() + Send + 'static,
    ) -> bool {
        let Some(slot) = self.take_ifr_slot() else {
            self.shared.metrics.dropped_interpolated.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("too many in transit; dropping one");
            return false;
        };
        self.shared.metrics.faded.fetch_add(1, Ordering::Relaxed);
        self.enqueue(QueuedFrame {
            local_pts,
            output_pts,
            kind: FrameKind::Faded,
            frame1: Some(frame1),
            frame2: Some(frame2),
            secondary_frame: None,
            alpha,
            fade_alpha: 0.0,
            subtitle: subtitle.to_string(),
            include_audio: false,
            silence_length_pts: 0,
            resources: Some(slot),
            display_func: Some(Box::new(display_func)),
        });
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub fn schedule_interpolated(
        &self,
        local_pts: Instant,
        output_pts: i64,
        frame1: FrameRef,
        frame2: FrameRef,
        alpha: f32,
        secondary_frame: Option<FrameRef>,
        fade_alpha: f32,
        subtitle: &str,
        include_audio: bool,
        display_func: impl FnOnce() + Send + 'static,
    ) -> bool {
        let Some(slot) = self.take_ifr_slot() else {
            self.shared.metrics.dropped_interpolated.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("too many in transit; dropping one");
            return false;
        };
        self.shared.metrics.interpolated.fetch_add(1, Ordering::Relaxed);
        let kind = if secondary_frame.is_some() {
            FrameKind::FadedInterpolated
        } else {
            FrameKind::Interpolated
        };
        self.enqueue(QueuedFrame {
            local_pts,
            output_pts,
            kind,
            frame1: Some(frame1),
            frame2: Some(frame2),
            secondary_frame,
            alpha,
            fade_alpha,
            subtitle: subtitle.to_string(),
            include_audio,
            silence_length_pts: 0,
            resources: Some(slot),
            display_func: Some(Box::new(display_func)),
        });
        true
    }

    pub fn schedule_refresh(&self, local_pts: Instant, output_pts: i64, subtitle: &str, display_func: impl FnOnce() + Send + 'static) {
        self.shared.metrics.refresh.fetch_add(1, Ordering::Relaxed);
        self.enqueue(QueuedFrame {
            local_pts,
            output_pts,
            kind: FrameKind::Refresh,
            frame1: None,
            frame2: None,
            secondary_frame: None,
            alpha: 0.0,
            fade_alpha: 0.0,
            subtitle: subtitle.to_string(),
            include_audio: false,
            silence_length_pts: 0,
            resources: None,
            display_func: Some(Box::new(display_func)),
        });
    }

    pub fn schedule_silence(&self, local_pts: Instant, output_pts: i64, length_pts: i64) {
        self.shared.metrics.silence.fetch_add(1, Ordering::Relaxed);
        self.enqueue(QueuedFrame {
            local_pts,
            output_pts,
            kind: FrameKind::Silence,
            frame1: None,
            frame2: None,
            secondary_frame: None,
            alpha: 0.0,
            fade_alpha: 0.0,
            subtitle: String::new(),
            include_audio: false,
            silence_length_pts: length_pts,
            resources: None,
            display_func: None,
        });
    }

    fn take_ifr_slot(&self) -> Option<BorrowedIfr> {
        let mut free = self.shared.ifr_free.lock().expect("ifr pool mutex poisoned");
        let slot = free.pop_front()?.0;
        Some(BorrowedIfr {
            slot: Some(slot),
            shared: self.shared.clone(),
        })
    }

    fn enqueue(&self, frame: QueuedFrame) {
        let mut queue = self.shared.frame_queue.lock().expect("frame queue mutex poisoned");
        queue.push_back(frame);
        drop(queue);
        self.shared.queue_changed.notify_all();
    }

    fn stash_original_bytes(&self, video: Vec<u8>) {
        *self.shared.last_video_frame.lock().expect("last frame mutex poisoned") = Some(video);
    }
}

fn encode_thread_func(shared: Arc<Shared>, mut compositor: Box<dyn FrameCompositor>) {
    loop {
        let frame = match wait_for_next_frame(&shared) {
            Some(frame) => frame,
            None => break,
        };
        process_frame(&shared, &mut *compositor, frame);
    }
}

/// Blocks until the queue has a frame whose `local_pts` has arrived, or
/// until shutdown. Returns `None` only on shutdown with an empty queue.
fn wait_for_next_frame(shared: &Arc<Shared>) -> Option<QueuedFrame> {
    let mut queue = shared.frame_queue.lock().expect("frame queue mutex poisoned");
    loop {
        if shared.should_quit.load(Ordering::SeqCst) && queue.is_empty() {
            return None;
        }
        if queue.is_empty() {
            queue = shared.queue_changed.wait(queue).expect("frame queue mutex poisoned");
            continue;
        }

        let generation_before = shared.queue_generation.load(Ordering::SeqCst);
        let now = Instant::now();
        let target = queue.front().expect("checked non-empty above").local_pts;
        if target <= now {
            return queue.pop_front();
        }

        let (guard, _timeout) = shared
            .queue_changed
            .wait_timeout(queue, target - now)
            .expect("frame queue mutex poisoned");
        queue = guard;
        if shared.queue_generation.load(Ordering::SeqCst) != generation_before {
            // clear_queue() ran while we slept; re-evaluate from scratch
            // instead of trusting the timer we were waiting on.
            continue;
        }
    }
}

fn process_frame(shared: &Arc<Shared>, compositor: &mut dyn FrameCompositor, frame: QueuedFrame) {
    let QueuedFrame {
        output_pts,
        kind,
        frame1,
        frame2,
        secondary_frame,
        alpha,
        fade_alpha,
        subtitle,
        include_audio,
        silence_length_pts,
        resources,
        display_func,
        ..
    } = frame;

    let (video, audio) = match kind {
        FrameKind::Original => {
            let mut reader = shared.reader.lock().expect("frame reader mutex poisoned");
            let decoded = shared
                .frame_store
                .read(&mut reader, frame1.expect("ORIGINAL always carries frame1"), true, include_audio)
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "failed to re-read original frame for encode");
                    crate::frame_store::DecodedFrame { video: Vec::new(), audio: Vec::new() }
                });
            (decoded.video, decoded.audio)
        }
        FrameKind::Faded => {
            let f1 = decode(shared, frame1.expect("FADED always carries frame1"));
            let f2 = decode(shared, frame2.expect("FADED always carries frame2"));
            let composited = compositor.fade(&f1, &f2, alpha);
            (encode(&composited), Vec::new())
        }
        FrameKind::Interpolated | FrameKind::FadedInterpolated => {
            let r1 = frame1.expect("interpolated frames always carry frame1");
            let r2 = frame2.expect("interpolated frames always carry frame2");
            let reuse_flow = {
                let mut cache = shared.last_flow.lock().expect("flow cache mutex poisoned");
                let reuse = cache.frame1 == Some(r1) && cache.frame2 == Some(r2);
                cache.frame1 = Some(r1);
                cache.frame2 = Some(r2);
                reuse
            };
            let f1 = decode(shared, r1);
            let f2 = decode(shared, r2);
            let secondary = secondary_frame.map(|r| decode(shared, r));
            let composited = compositor.interpolate(&f1, &f2, alpha, secondary.as_ref().map(|s| (s.as_ref(), fade_alpha)), reuse_flow);
            let audio = if include_audio {
                let mut reader = shared.reader.lock().expect("frame reader mutex poisoned");
                shared.frame_store.read(&mut reader, r1, false, true).map(|d| d.audio).unwrap_or_default()
            } else {
                Vec::new()
            };
            (encode(&composited), audio)
        }
        FrameKind::Refresh => {
            let video = shared
                .last_video_frame
                .lock()
                .expect("last frame mutex poisoned")
                .clone()
                .unwrap_or_default();
            (video, Vec::new())
        }
        FrameKind::Silence => (Vec::new(), synthesize_silence(silence_length_pts)),
    };

    drop(resources);

    if kind != FrameKind::Silence && !video.is_empty() {
        *shared.last_video_frame.lock().expect("last frame mutex poisoned") = Some(video.clone());
    }

    if kind == FrameKind::Silence {
        shared.mux.lock().expect("mux mutex poisoned").write_frame(output_pts, "", &[], &audio);
    } else {
        shared.mux.lock().expect("mux mutex poisoned").write_frame(output_pts, &subtitle, &video, &audio);
    }

    if let Some(display_func) = display_func {
        display_func();
    }
}

fn decode(shared: &Arc<Shared>, frame_ref: FrameRef) -> Arc<crate::decode::PlanarFrame> {
    let mut reader = shared.reader.lock().expect("frame reader mutex poisoned");
    match shared
        .decode_cache
        .get_or_decode(frame_ref, &shared.frame_store, &mut reader, MissPolicy::DecodeIfMissing)
    {
        Ok(frame) => frame.expect("DecodeIfMissing never returns None"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode frame for composition; substituting a blank frame");
            Arc::new(crate::decode::PlanarFrame {
                width: 1,
                height: 1,
                cx: 1,
                cy: 1,
                y: vec![0],
                cb: vec![128],
                cr: vec![128],
                exif: Vec::new(),
            })
        }
    }
}

fn encode(composited: &Composited) -> Vec<u8> {
    let chroma = futatabi_scale::subsample_422(&composited.cb_full, &composited.cr_full, composited.width, composited.height);
    futatabi_scale::encode_planar(&composited.y, &chroma, composited.width, composited.height, &composited.exif)
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to JPEG-encode composited frame");
            Vec::new()
        })
}

/// 48 kHz stereo s32le silence of `length_pts` ticks.
fn synthesize_silence(length_pts: i64) -> Vec<u8> {
    let seconds = length_pts as f64 / crate::constants::TIMEBASE as f64;
    let samples = (seconds * 48_000.0).round().max(0.0) as usize;
    vec![0u8; samples * 2 * 4]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeCache;
    use crate::frame_store::FrameStore;
    use crate::mux::{PacketKind, Sink, WithSubtitles};
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    struct RecordingSink(StdArc<StdMutex<Vec<(PacketKind, i64)>>>);
    impl Sink for RecordingSink {
        fn write_packet(&mut self, kind: PacketKind, pts: i64, _data: &[u8]) {
            self.0.lock().unwrap().push((kind, pts));
        }
    }

    fn new_stream(dir: &std::path::Path) -> (VideoStream, StdArc<StdMutex<Vec<(PacketKind, i64)>>>) {
        let store = Arc::new(FrameStore::open(dir).unwrap());
        let cache = Arc::new(DecodeCache::new(16 * 1024 * 1024, Box::new(crate::decode::SoftwareJpegBackend)));
        let log = StdArc::new(StdMutex::new(Vec::new()));
        let mux = Mux::new(Box::new(RecordingSink(log.clone())), WithSubtitles::Yes);
        (VideoStream::new(store, cache, mux), log)
    }

    #[test]
    fn schedule_faded_fails_once_ifr_pool_is_exhausted() {
        let dir = tempdir();
        let (vs, _log) = new_stream(dir.path());
        let frame = FrameRef { pts: 0, file_idx: 0, offset: 0, video_size: 0, audio_size: 0 };
        let mut accepted = 0;
        for _ in 0..(IFR_POOL_SIZE + 1) {
            if vs.schedule_faded(Instant::now(), 0, frame, frame, 0.5, "", || {}) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, IFR_POOL_SIZE);
    }

    #[test]
    fn clear_queue_empties_pending_frames() {
        let dir = tempdir();
        let (vs, _log) = new_stream(dir.path());
        let frame = FrameRef { pts: 0, file_idx: 0, offset: 0, video_size: 0, audio_size: 0 };
        vs.schedule_refresh(Instant::now() + Duration::from_secs(10), 0, "", || {});
        assert_eq!(vs.num_queued_frames(), 1);
        vs.clear_queue();
        assert_eq!(vs.num_queued_frames(), 0);
        let _ = frame;
    }

    #[test]
    fn clearing_queue_returns_borrowed_ifr_slots() {
        let dir = tempdir();
        let (vs, _log) = new_stream(dir.path());
        let frame = FrameRef { pts: 0, file_idx: 0, offset: 0, video_size: 0, audio_size: 0 };
        assert!(vs.schedule_faded(Instant::now() + Duration::from_secs(10), 0, frame, frame, 0.5, "", || {}));
        assert_eq!(vs.shared.ifr_free.lock().unwrap().len(), IFR_POOL_SIZE - 1);
        vs.clear_queue();
        assert_eq!(vs.shared.ifr_free.lock().unwrap().len(), IFR_POOL_SIZE);
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn solid_frame(width: u32, height: u32, y_value: u8, chroma_value: u8) -> crate::decode::PlanarFrame {
        let pixels = (width * height) as usize;
        crate::decode::PlanarFrame {
            width,
            height,
            cx: 1,
            cy: 1,
            y: vec![y_value; pixels],
            cb: vec![chroma_value; pixels],
            cr: vec![chroma_value; pixels],
            exif: Vec::new(),
        }
    }

    #[test]
    fn interpolate_without_a_secondary_is_an_alpha_blend_of_both_frames() {
        let frame1 = solid_frame(2, 2, 0, 128);
        let frame2 = solid_frame(2, 2, 100, 128);
        let out = CpuFadeCompositor.interpolate(&frame1, &frame2, 0.25, None, false);
        assert_eq!(out.y, vec![25u8; 4]);
    }

    /// A FADED_INTERPOLATED frame must fade the alpha-interpolated
    /// frame1/frame2 result against the secondary, not fade frame1 directly
    /// and discard frame2/alpha.
    #[test]
    fn faded_interpolated_fades_the_interpolated_frame_not_frame1_directly() {
        let frame1 = solid_frame(2, 2, 0, 128);
        let frame2 = solid_frame(2, 2, 200, 128);
        let secondary = solid_frame(2, 2, 0, 128);

        let out = CpuFadeCompositor.interpolate(&frame1, &frame2, 0.5, Some((&secondary, 0.5)), false);

        // Interpolated y = lerp(0, 200, 0.5) = 100; faded against secondary
        // y=0 at 0.5 gives 50. The discarded-interpolation bug would instead
        // fade frame1 (y=0) directly against secondary (y=0), giving 0.
        assert_eq!(out.y, vec![50u8; 4]);
    }

    #[test]
    fn faded_interpolated_with_zero_fade_alpha_ignores_the_secondary() {
        let frame1 = solid_frame(2, 2, 10, 128);
        let frame2 = solid_frame(2, 2, 90, 128);
        let secondary = solid_frame(2, 2, 250, 128);

        let out = CpuFadeCompositor.interpolate(&frame1, &frame2, 0.5, Some((&secondary, 0.0)), false);

        assert_eq!(out.y, vec![50u8; 4]);
    }
}
