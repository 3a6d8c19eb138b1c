//! Top-level wiring: owns every long-lived component and starts their
//! threads, the way the original's `MainWindow` constructor wires
//! `FrameOnDisk`/`VideoStream`/`Player`/`HTTPD` together. No GUI lives
//! here — that's an external collaborator — so this is the core's
//! equivalent entry point for a launcher (the `futatabi` binary, or a test).

use crate::config::Flags;
use crate::decode::{DecodeCache, SoftwareJpegBackend};
use crate::disk_estimator::DiskSpaceEstimator;
use crate::error::{FutatabiError, FutatabiResult};
use crate::frame_store::FrameStore;
use crate::mux::{Mux, PacketKind, Sink, WithSubtitles};
use crate::player::{Player, StreamOutput};
use crate::video_stream::{CpuFadeCompositor, FrameCompositor, GpuFrameCompositor, VideoStream};
use futatabi_publish::client::DataType;
use futatabi_publish::{Publisher, StreamId};
use std::sync::Arc;

const DECODE_CACHE_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Forwards muxed packets to the HTTP publisher's main multiplexed stream,
/// tagging video packets as keyframes (every JPEG frame here is one) so
/// the backlog's stream-start safety rule is satisfied immediately.
struct PublisherSink {
    publisher: Arc<Publisher>,
}

impl Sink for PublisherSink {
    fn write_packet(&mut self, kind: PacketKind, _pts: i64, data: &[u8]) {
        let data_type = match kind {
            PacketKind::Header => DataType::Header,
            PacketKind::Video => DataType::Keyframe,
            PacketKind::Audio | PacketKind::Subtitle => DataType::Other,
        };
        self.publisher.publish(StreamId::Main, data, data_type);
    }
}

/// Owns every long-lived subsystem for one running server: the frame
/// store, decode cache, optional GPU compositor, video stream encode
/// pipeline, player, HTTP publisher, and disk space estimator.
pub struct CoreContext {
    pub frame_store: Arc<FrameStore>,
    pub decode_cache: Arc<DecodeCache>,
    pub video_stream: Option<Arc<VideoStream>>,
    pub player: Arc<Player>,
    pub publisher: Option<Arc<Publisher>>,
    pub disk_estimator: Arc<DiskSpaceEstimator>,
    pub flags: Flags,
}

impl CoreContext {
    /// Builds every subsystem and starts their threads. `gl` is `Some` when
    /// a real GPU context is available (interpolation_quality > 0);
    /// otherwise the video stream falls back to [`CpuFadeCompositor`], and
    /// with `interpolation_quality == 0` no video stream runs at all and
    /// the player drives `destination` directly.
    pub fn new(flags: Flags, gl: Option<Arc<glow::Context>>) -> FutatabiResult<Arc<Self>> {
        flags.validate().map_err(FutatabiError::fatal_init)?;

        let frame_store = Arc::new(FrameStore::open(&flags.working_directory)?);
        let decode_cache = Arc::new(DecodeCache::new(DECODE_CACHE_BUDGET_BYTES, Box::new(SoftwareJpegBackend)));
        let disk_estimator = Arc::new(DiskSpaceEstimator::new());

        let (video_stream, publisher, stream_output) = if flags.interpolation_quality == 0 {
            (None, None, StreamOutput::None)
        } else {
            let publisher = Publisher::new();
            let sink: Box<dyn Sink> = Box::new(PublisherSink { publisher: publisher.clone() });
            let mux = Mux::new(sink, WithSubtitles::Yes);
            let video_stream = Arc::new(VideoStream::new(frame_store.clone(), decode_cache.clone(), mux));

            let compositor: Box<dyn FrameCompositor> = match gl {
                Some(gl) => {
                    let operating_point = crate::gpu::dis_flow::operating_point_for_quality(flags.interpolation_quality)
                        .ok_or_else(|| FutatabiError::fatal_init(format!("invalid interpolation quality {}", flags.interpolation_quality)))?;
                    Box::new(GpuFrameCompositor::new(gl, operating_point).map_err(FutatabiError::fatal_init)?)
                }
                None => Box::new(CpuFadeCompositor),
            };
            video_stream.start(compositor);

            (Some(video_stream), Some(publisher), StreamOutput::Http)
        };

        let player = Player::new(
            frame_store.clone(),
            video_stream.clone(),
            None,
            stream_output,
            flags.frame_rate.as_f64(),
            crate::constants::DEFAULT_MAX_QUEUED_FRAMES,
        );

        if let Some(publisher) = &publisher {
            let video_stream = video_stream.clone();
            let disk_estimator = disk_estimator.clone();
            publisher.add_endpoint("/queue_status", move || {
                let queued_frames = video_stream.as_ref().map_or(0, |vs| vs.num_queued_frames());
                let body = serde_json::json!({
                    "queued_frames": queued_frames,
                    "disk_free_bytes": disk_estimator.disk_free_bytes(),
                })
                .to_string();
                (body, "application/json".to_string())
            });
        }

        Ok(Arc::new(Self {
            frame_store,
            decode_cache,
            video_stream,
            player,
            publisher,
            disk_estimator,
            flags,
        }))
    }

    pub fn shutdown(&self) {
        self.player.stop();
    }
}
