//! Co-sited chroma subsampling (CS) and the JPEG encode helper
//! used by the video stream's encode thread.
//!
//! Adapted from the `cap-scale` crate, which did generic CPU image
//! scaling via `fast_image_resize` for VLM token-budget presets.
//! Nothing here needs a general resampler — chroma subsampling is a fixed
//! 2x horizontal (or 2x2) co-sited filter, not an arbitrary resize — so
//! `fast_image_resize` is dropped in favor of the straight-line filter
//! the original's `chroma_subsampler.cpp` specifies verbatim. `anyhow` stays
//! as the crate-level result type.

pub mod chroma;
pub mod jpeg;

pub use chroma::{subsample_422, subsample_420, ChromaPlanes};
pub use jpeg::encode_planar;
