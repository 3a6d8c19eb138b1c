//! GPU texture pool. Thread-safe; `get` returns an idle
//! matching entry or allocates, `release` marks idle. Renderbuffers share
//! the pool via the `renderbuffer` flag. Nothing is freed on an individual
//! handle's drop — the whole pool is torn down as a unit at shutdown.
//!
//! Adapted from `core/buffer_pool.rs`'s `Mutex<VecDeque<_>>`
//! free list, get-or-allocate, bounded growth, generalized from raw byte
//! buffers to GL texture objects keyed by `(format, width, height, layers)`.

use glow::HasContext;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rg32f,
    Rgba8,
    R32Ui,
    Rgba32Ui,
    Rgba32f,
    DepthComponent32f,
}

impl TextureFormat {
    fn gl_internal_format(self) -> u32 {
        match self {
            TextureFormat::R8 => glow::R8,
            TextureFormat::Rg32f => glow::RG32F,
            TextureFormat::Rgba8 => glow::RGBA8,
            TextureFormat::R32Ui => glow::R32UI,
            TextureFormat::Rgba32Ui => glow::RGBA32UI,
            TextureFormat::Rgba32f => glow::RGBA32F,
            TextureFormat::DepthComponent32f => glow::DEPTH_COMPONENT32F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    format: TextureFormat,
    width: u32,
    height: u32,
    layers: u32,
    renderbuffer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureHandle {
    Texture(glow::NativeTexture),
    Renderbuffer(glow::NativeRenderbuffer),
}

struct Entry {
    key: PoolKey,
    handle: TextureHandle,
    in_use: bool,
}

pub struct TexturePool {
    entries: Mutex<Vec<Entry>>,
}

impl Default for TexturePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TexturePool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns an idle matching entry, or allocates a new one and marks it
    /// in-use. `layers == 0` means a plain 2-D texture; `layers > 0` means
    /// a 2-D array texture.
    pub fn get(
        &self,
        gl: &glow::Context,
        format: TextureFormat,
        width: u32,
        height: u32,
        layers: u32,
    ) -> TextureHandle {
        self.get_inner(gl, format, width, height, layers, false)
    }

    pub fn get_renderbuffer(
        &self,
        gl: &glow::Context,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> TextureHandle {
        self.get_inner(gl, format, width, height, 0, true)
    }

    fn get_inner(
        &self,
        gl: &glow::Context,
        format: TextureFormat,
        width: u32,
        height: u32,
        layers: u32,
        renderbuffer: bool,
    ) -> TextureHandle {
        let key = PoolKey { format, width, height, layers, renderbuffer };
        let mut entries = self.entries.lock().expect("texture pool mutex poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.key == key && !e.in_use) {
            entry.in_use = true;
            return entry.handle;
        }
        let handle = unsafe { allocate(gl, key) };
        entries.push(Entry { key, handle, in_use: true });
        handle
    }

    pub fn release(&self, handle: TextureHandle) {
        let mut entries = self.entries.lock().expect("texture pool mutex poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.handle == handle) {
            entry.in_use = false;
        }
    }

    /// Count of entries currently lent out, for the conservation invariant
    /// (`#idle + #in-flight == capacity` always holds).
    pub fn in_use_count(&self) -> usize {
        self.entries
            .lock()
            .expect("texture pool mutex poisoned")
            .iter()
            .filter(|e| e.in_use)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().expect("texture pool mutex poisoned").len()
    }
}

/// Binds `handle` as a sampler on texture unit `unit`, as a plain 2-D
/// texture (`layers == 0`) or a 2-D array texture (`layers > 0`) — the
/// caller always knows which, from how it was allocated.
pub unsafe fn bind_sampler(gl: &glow::Context, handle: TextureHandle, unit: u32, layers: u32) {
    let TextureHandle::Texture(tex) = handle else {
        panic!("bind_sampler called on a renderbuffer handle");
    };
    let target = if layers > 0 { glow::TEXTURE_2D_ARRAY } else { glow::TEXTURE_2D };
    gl.active_texture(glow::TEXTURE0 + unit);
    gl.bind_texture(target, Some(tex));
}

/// Points a `sampler*` uniform at the texture unit it was bound to.
pub unsafe fn set_sampler_uniform(gl: &glow::Context, program: glow::NativeProgram, name: &str, unit: u32) {
    if let Some(loc) = gl.get_uniform_location(program, name) {
        gl.uniform_1_i32(Some(&loc), unit as i32);
    }
}

/// Creates a framebuffer targeting `handle` as `COLOR_ATTACHMENT0`, binds it
/// for drawing, and sets the viewport to `(width, height)`. `layer < 0`
/// targets a plain 2-D texture (or a renderbuffer); `layer >= 0` targets
/// that layer of a 2-D array texture via `framebuffer_texture_layer`. The
/// caller must pass the returned framebuffer to [`unbind_draw_target`].
pub unsafe fn bind_draw_target(gl: &glow::Context, handle: TextureHandle, layer: i32, width: u32, height: u32) -> glow::NativeFramebuffer {
    let fbo = gl.create_framebuffer().expect("create_framebuffer failed");
    gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
    match handle {
        TextureHandle::Texture(tex) if layer >= 0 => {
            gl.framebuffer_texture_layer(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, Some(tex), 0, layer);
        }
        TextureHandle::Texture(tex) => {
            gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(tex), 0);
        }
        TextureHandle::Renderbuffer(rb) => {
            gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::RENDERBUFFER, Some(rb));
        }
    }
    gl.viewport(0, 0, width as i32, height as i32);
    fbo
}

/// Attaches `handle` as `DEPTH_ATTACHMENT` on the currently bound
/// framebuffer, for passes (the splat pass) that need a depth test.
pub unsafe fn attach_depth_target(gl: &glow::Context, handle: TextureHandle) {
    match handle {
        TextureHandle::Renderbuffer(rb) => {
            gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, glow::DEPTH_ATTACHMENT, glow::RENDERBUFFER, Some(rb));
        }
        TextureHandle::Texture(tex) => {
            gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::DEPTH_ATTACHMENT, glow::TEXTURE_2D, Some(tex), 0);
        }
    }
}

/// Unbinds and deletes the framebuffer returned by [`bind_draw_target`].
/// The target textures/renderbuffers themselves live in the pool and are
/// untouched.
pub unsafe fn unbind_draw_target(gl: &glow::Context, fbo: glow::NativeFramebuffer) {
    gl.bind_framebuffer(glow::FRAMEBUFFER, None);
    gl.delete_framebuffer(fbo);
}

unsafe fn allocate(gl: &glow::Context, key: PoolKey) -> TextureHandle {
    if key.renderbuffer {
        let rb = gl.create_renderbuffer().expect("create_renderbuffer failed");
        gl.bind_renderbuffer(glow::RENDERBUFFER, Some(rb));
        gl.renderbuffer_storage(
            glow::RENDERBUFFER,
            key.format.gl_internal_format(),
            key.width as i32,
            key.height as i32,
        );
        gl.bind_renderbuffer(glow::RENDERBUFFER, None);
        return TextureHandle::Renderbuffer(rb);
    }

    let tex = gl.create_texture().expect("create_texture failed");
    let target = if key.layers > 0 { glow::TEXTURE_2D_ARRAY } else { glow::TEXTURE_2D };
    gl.bind_texture(target, Some(tex));
    gl.tex_parameter_i32(target, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(target, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
    gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    if key.layers > 0 {
        gl.tex_storage_3d(
            target,
            1,
            key.format.gl_internal_format(),
            key.width as i32,
            key.height as i32,
            key.layers as i32,
        );
    } else {
        gl.tex_storage_2d(target, 1, key.format.gl_internal_format(), key.width as i32, key.height as i32);
    }
    gl.bind_texture(target, None);
    TextureHandle::Texture(tex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_distinguishes_dimensions() {
        let a = PoolKey { format: TextureFormat::Rgba8, width: 64, height: 64, layers: 0, renderbuffer: false };
        let b = PoolKey { format: TextureFormat::Rgba8, width: 128, height: 64, layers: 0, renderbuffer: false };
        assert_ne!(a, b);
    }
}
