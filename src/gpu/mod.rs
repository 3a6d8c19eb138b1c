//! GPU-side components: texture pool (TP), DIS optical flow (DF), and
//! frame interpolation (IP).
//!
//! Built on `glow`, grounded on the pack's `schwwaaa-shadecore` (the only
//! example repo carrying `glow` as a real compute/render dependency rather
//! than a transitive one): `unsafe { gl.xxx(...) }` call shape, `glow::
//! NativeTexture`/`NativeProgram`/`NativeFramebuffer` handles passed by
//! value, shader compilation via `gl.create_shader`/`gl.shader_source`/
//! `gl.compile_shader`.

pub mod dis_flow;
pub mod interpolate;
pub mod pool;
pub mod shaders;

pub use dis_flow::{DisFlow, OperatingPoint, FlowDirection};
pub use interpolate::Interpolate;
pub use pool::{TextureFormat, TextureHandle, TexturePool};
