//! Interpolate (IP): splat, hole-fill, hole-blend, blend given
//! bidirectional flow and a fractional time alpha. Produces either a single
//! RGBA8 texture or a split Y'/CbCr pair, chosen at construction.

use super::pool::{
    attach_depth_target, bind_draw_target, bind_sampler, set_sampler_uniform, unbind_draw_target, TextureFormat, TextureHandle,
    TexturePool,
};
use super::shaders::{self, BLEND_FS, FULLSCREEN_VS, HOLE_BLEND_FS, HOLE_FILL_FS, SPLAT_FS, SPLAT_VS};
use glow::HasContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    Rgba,
    SplitYCbCr,
}

struct Programs {
    splat: glow::NativeProgram,
    hole_fill: glow::NativeProgram,
    hole_blend: glow::NativeProgram,
    blend: glow::NativeProgram,
}

pub struct Interpolate {
    programs: Programs,
    layout: OutputLayout,
}

const HOLE_FILL_DIRECTIONS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

impl Interpolate {
    pub fn new(gl: &glow::Context, layout: OutputLayout) -> Result<Self, String> {
        unsafe {
            Ok(Self {
                programs: Programs {
                    splat: shaders::compile_program(gl, SPLAT_VS, SPLAT_FS)?,
                    hole_fill: shaders::compile_program(gl, FULLSCREEN_VS, HOLE_FILL_FS)?,
                    hole_blend: shaders::compile_program(gl, FULLSCREEN_VS, HOLE_BLEND_FS)?,
                    blend: shaders::compile_program(gl, FULLSCREEN_VS, BLEND_FS)?,
                },
                layout,
            })
        }
    }

    /// Runs the full splat -> hole-fill x4 -> hole-blend -> blend chain
    /// returning a texture borrowed from `pool`.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        gl: &glow::Context,
        pool: &TexturePool,
        flow: TextureHandle,
        sources: TextureHandle,
        width: u32,
        height: u32,
        alpha: f32,
        flow_consistency_tolerance: f32,
    ) -> TextureHandle {
        let splat_tex = pool.get(gl, TextureFormat::Rgba8, width, height, 0);
        self.run_splat(gl, pool, flow, splat_tex, width, height, alpha);

        let mut direction_fills = Vec::with_capacity(HOLE_FILL_DIRECTIONS.len());
        for (dx, dy) in HOLE_FILL_DIRECTIONS {
            let filled = pool.get(gl, TextureFormat::Rgba8, width, height, 0);
            self.run_hole_fill(gl, splat_tex, filled, dx, dy, width.max(height), width, height);
            direction_fills.push(filled);
        }
        pool.release(splat_tex);

        let blended_holes = pool.get(gl, TextureFormat::Rgba8, width, height, 0);
        self.run_hole_blend(gl, &direction_fills, blended_holes, width, height);
        for fill in direction_fills {
            pool.release(fill);
        }

        let output_format = match self.layout {
            OutputLayout::Rgba => TextureFormat::Rgba8,
            OutputLayout::SplitYCbCr => TextureFormat::Rgba8,
        };
        let output = pool.get(gl, output_format, width, height, 0);
        self.run_blend(gl, blended_holes, sources, output, width, height, alpha, flow_consistency_tolerance);
        pool.release(blended_holes);
        output
    }

    fn run_splat(&self, gl: &glow::Context, pool: &TexturePool, flow: TextureHandle, out: TextureHandle, width: u32, height: u32, alpha: f32) {
        let depth = pool.get_renderbuffer(gl, TextureFormat::DepthComponent32f, width, height);
        unsafe {
            let fbo = bind_draw_target(gl, out, -1, width, height);
            attach_depth_target(gl, depth);
            gl.clear_color(1000.0, 1000.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);
            gl.clear_depth_f32(1.0);
            gl.clear(glow::DEPTH_BUFFER_BIT);
            gl.enable(glow::DEPTH_TEST);
            gl.depth_func(glow::LESS);

            gl.use_program(Some(self.programs.splat));
            bind_sampler(gl, flow, 0, 0);
            set_sampler_uniform(gl, self.programs.splat, "flow_tex", 0);
            if let Some(loc) = gl.get_uniform_location(self.programs.splat, "alpha") {
                gl.uniform_1_f32(Some(&loc), alpha);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.splat, "inv_size") {
                gl.uniform_2_f32(Some(&loc), 1.0 / width as f32, 1.0 / height as f32);
            }
            gl.draw_arrays(glow::POINTS, 0, (width * height) as i32);

            gl.disable(glow::DEPTH_TEST);
            unbind_draw_target(gl, fbo);
        }
        pool.release(depth);
    }

    #[allow(clippy::too_many_arguments)]
    fn run_hole_fill(
        &self,
        gl: &glow::Context,
        splat: TextureHandle,
        out: TextureHandle,
        dx: i32,
        dy: i32,
        max_offset: u32,
        width: u32,
        height: u32,
    ) {
        unsafe {
            gl.use_program(Some(self.programs.hole_fill));
            bind_sampler(gl, splat, 0, 0);
            set_sampler_uniform(gl, self.programs.hole_fill, "splat_tex", 0);
            if let Some(loc) = gl.get_uniform_location(self.programs.hole_fill, "direction") {
                gl.uniform_2_i32(Some(&loc), dx, dy);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.hole_fill, "max_offset") {
                gl.uniform_1_i32(Some(&loc), max_offset as i32);
            }
            let fbo = bind_draw_target(gl, out, -1, width, height);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
    }

    /// Averages the four directional fills where they agree, smoothing
    /// single-pixel holes.
    fn run_hole_blend(&self, gl: &glow::Context, fills: &[TextureHandle], out: TextureHandle, width: u32, height: u32) {
        unsafe {
            gl.use_program(Some(self.programs.hole_blend));
            for (i, &fill) in fills.iter().enumerate() {
                bind_sampler(gl, fill, i as u32, 0);
                set_sampler_uniform(gl, self.programs.hole_blend, &format!("fill{i}"), i as u32);
            }
            let fbo = bind_draw_target(gl, out, -1, width, height);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_blend(
        &self,
        gl: &glow::Context,
        repaired_flow: TextureHandle,
        sources: TextureHandle,
        out: TextureHandle,
        width: u32,
        height: u32,
        alpha: f32,
        tolerance: f32,
    ) {
        unsafe {
            gl.use_program(Some(self.programs.blend));
            bind_sampler(gl, repaired_flow, 0, 0);
            set_sampler_uniform(gl, self.programs.blend, "repaired_flow", 0);
            bind_sampler(gl, sources, 1, 2);
            set_sampler_uniform(gl, self.programs.blend, "source_frames", 1);
            if let Some(loc) = gl.get_uniform_location(self.programs.blend, "alpha") {
                gl.uniform_1_f32(Some(&loc), alpha);
            }
            if let Some(loc) = gl.get_uniform_location(self.programs.blend, "flow_consistency_tolerance") {
                gl.uniform_1_f32(Some(&loc), tolerance);
            }
            let fbo = bind_draw_target(gl, out, -1, width, height);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            unbind_draw_target(gl, fbo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hole_fill_directions_cover_all_four_sweeps() {
        assert_eq!(HOLE_FILL_DIRECTIONS.len(), 4);
        assert!(HOLE_FILL_DIRECTIONS.contains(&(-1, 0)));
        assert!(HOLE_FILL_DIRECTIONS.contains(&(0, 1)));
    }
}
