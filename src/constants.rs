//! Fixed constants shared across the core.

/// Ticks per second of the presentation-timestamp clock. Highly composite
/// so that common frame rates (24, 25, 30, 50, 59.94, 60) divide it exactly.
pub const TIMEBASE: i64 = 12_000_000;

/// Upper bound on the number of simultaneously ingested camera streams.
pub const MAX_STREAMS: usize = 16;

/// Number of frame records a `FrameFile` holds before a new one is started.
pub const FRAMES_PER_FILE: usize = 1000;

/// Magic marker prefixing every on-disk frame record.
pub const FRAME_MAGIC: &[u8; 8] = b"Ftbifrm0";

/// Default HTTP port for the publisher, matching the original's
/// `DEFAULT_HTTPD_PORT`.
pub const DEFAULT_HTTP_PORT: u16 = 9095;

/// Number of preallocated `InterpolatedFrameResources` slots.
pub const IFR_POOL_SIZE: usize = 15;

/// Default cap on in-flight queued frames before the player blocks.
pub const DEFAULT_MAX_QUEUED_FRAMES: usize = 10;

/// Nominal duration of a master-speed ease, before frame-alignment snapping.
pub const EASE_NOMINAL_SECONDS: f64 = 0.2;

/// Per-client HTTP backlog cap, in bytes.
pub const CLIENT_BACKLOG_CAP_BYTES: usize = 1 << 30;

/// How long an idle HTTP client is allowed to go without being read from.
pub const CLIENT_WATCHDOG_SECONDS: u64 = 60;

/// Interval at which a REFRESH frame is scheduled while the playlist is
/// paused or exhausted.
pub const REFRESH_INTERVAL_MS: u64 = 100;
