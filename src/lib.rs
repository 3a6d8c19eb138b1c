//! Core library for the multi-camera instant-replay server: frame store,
//! decode cache, GPU optical-flow interpolation, video stream encode
//! pipeline, and the player that drives it from a playlist.

pub mod config;
pub mod constants;
pub mod context;
pub mod decode;
pub mod disk_estimator;
pub mod error;
pub mod frame_store;
pub mod gpu;
pub mod logging;
pub mod mux;
pub mod player;
pub mod types;
pub mod video_stream;
