//! Shader sources and the compile/link helper shared by [`super::dis_flow`]
//! and [`super::interpolate`]. Kept as plain `&'static str` GLSL, matching
//! `presenter.rs`'s inline-string shader sources rather than
//! an embedded-asset crate.

use glow::HasContext;

pub const FULLSCREEN_VS: &str = r#"#version 430
const vec2 POSITIONS[3] = vec2[3](vec2(-1.0, -1.0), vec2(3.0, -1.0), vec2(-1.0, 3.0));
out vec2 v_uv;
void main() {
    vec2 pos = POSITIONS[gl_VertexID];
    v_uv = pos * 0.5 + 0.5;
    gl_Position = vec4(pos, 0.0, 1.0);
}
"#;

/// Sobel gradient over one layer of a two-layer grayscale array, invoked
/// once per layer with `layer` set to select which. Packed RGBA32UI: R,G
/// hold the bit patterns of gx, gy for this layer.
pub const SOBEL_FS: &str = r#"#version 430
in vec2 v_uv;
out uvec4 frag_color;
uniform sampler2DArray tex;
uniform int layer;
void main() {
    ivec3 p = ivec3(ivec2(gl_FragCoord.xy), layer);
    float gx = 0.0, gy = 0.0;
    for (int dy = -1; dy <= 1; dy++) {
        for (int dx = -1; dx <= 1; dx++) {
            float w_x = float(dx) * (dy == 0 ? 2.0 : 1.0);
            float w_y = float(dy) * (dx == 0 ? 2.0 : 1.0);
            float v = texelFetch(tex, p + ivec3(dx, dy, 0), 0).r;
            gx += w_x * v;
            gy += w_y * v;
        }
    }
    frag_color = uvec4(floatBitsToUint(gx), floatBitsToUint(gy), 0u, 0u);
}
"#;

/// Inverse-compositional Gauss-Newton patch motion search: for every patch,
/// accumulates the 2x2 normal-equations system from `grad_tex`'s two layers
/// (previous frame gradient, current frame gradient) over a
/// `patch_size`-pixel window and solves for the flow update each iteration.
pub const MOTION_SEARCH_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 flow_out;
uniform sampler2DArray grad_tex;
uniform sampler2D prev_level_flow;
uniform bool has_prev_flow;
uniform int search_iterations;
uniform int patch_size;
void main() {
    ivec2 grad_size = textureSize(grad_tex, 0).xy;
    ivec2 origin = clamp(
        ivec2(v_uv * vec2(grad_size)) - patch_size / 2,
        ivec2(0), max(grad_size - ivec2(patch_size), ivec2(0)));
    vec2 flow = has_prev_flow ? texture(prev_level_flow, v_uv).xy * 2.0 : vec2(0.0);

    for (int iter = 0; iter < search_iterations; iter++) {
        float gtg00 = 0.0, gtg01 = 0.0, gtg11 = 0.0;
        vec2 gtr = vec2(0.0);
        for (int dy = 0; dy < patch_size; dy++) {
            for (int dx = 0; dx < patch_size; dx++) {
                ivec2 p = clamp(origin + ivec2(dx, dy), ivec2(0), grad_size - ivec2(1));
                ivec2 warped = clamp(p + ivec2(round(flow)), ivec2(0), grad_size - ivec2(1));
                uvec4 g0 = texelFetch(grad_tex, ivec3(p, 0), 0);
                uvec4 g1 = texelFetch(grad_tex, ivec3(warped, 1), 0);
                vec2 grad = vec2(uintBitsToFloat(g0.x), uintBitsToFloat(g0.y));
                float residual = (uintBitsToFloat(g1.x) + uintBitsToFloat(g1.y))
                                - (uintBitsToFloat(g0.x) + uintBitsToFloat(g0.y));
                gtg00 += grad.x * grad.x;
                gtg01 += grad.x * grad.y;
                gtg11 += grad.y * grad.y;
                gtr += grad * residual;
            }
        }
        float det = gtg00 * gtg11 - gtg01 * gtg01;
        if (abs(det) > 1e-6) {
            vec2 delta = vec2(gtg11 * gtr.x - gtg01 * gtr.y, gtg00 * gtr.y - gtg01 * gtr.x) / det;
            flow -= delta;
        }
    }
    flow_out = vec4(flow, 0.0, 1.0);
}
"#;

/// Densifies the patch grid into a per-pixel flow field by bilinear
/// sampling the patch texture — the hardware sampler performs the
/// weighted spread across overlapping patches.
pub const DENSIFY_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 dense_out;
uniform sampler2D patch_flow;
void main() {
    vec2 uv_flow = texture(patch_flow, v_uv).xy;
    dense_out = vec4(uv_flow, 0.0, 1.0);
}
"#;

/// Splat pass: draws one point per source pixel offset by alpha*flow,
/// depth-tested (smaller flow magnitude wins) so the best candidate
/// survives when several source pixels land on the same destination.
pub const SPLAT_VS: &str = r#"#version 430
uniform sampler2D flow_tex;
uniform float alpha;
uniform vec2 inv_size;
out vec2 v_flow;
void main() {
    ivec2 size = textureSize(flow_tex, 0);
    ivec2 coord = ivec2(gl_VertexID % size.x, gl_VertexID / size.x);
    vec2 flow = texelFetch(flow_tex, coord, 0).xy;
    vec2 uv = (vec2(coord) + 0.5) * inv_size;
    vec2 displaced = uv + alpha * flow * inv_size;
    gl_Position = vec4(displaced * 2.0 - 1.0, clamp(length(flow) / float(size.x + size.y), 0.0, 1.0), 1.0);
    gl_PointSize = 1.0;
    v_flow = flow;
}
"#;

pub const SPLAT_FS: &str = r#"#version 430
in vec2 v_flow;
out vec4 frag_color;
void main() {
    frag_color = vec4(v_flow, 0.0, 1.0);
}
"#;

/// Horn-Schunck-style red/black SOR sweep over a differential flow added to
/// `base_flow`: pixels not matching `phase`'s checkerboard parity pass their
/// previous value through unchanged, letting two alternating render passes
/// stand in for the red/black update order.
pub const VARIATIONAL_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 diff_out;
uniform sampler2DArray gray_array;
uniform sampler2D base_flow;
uniform sampler2D prev_diff;
uniform int phase;
uniform float omega;
void main() {
    ivec2 coord = ivec2(gl_FragCoord.xy);
    if ((coord.x + coord.y) % 2 != phase) {
        diff_out = texelFetch(prev_diff, coord, 0);
        return;
    }

    vec2 base = texture(base_flow, v_uv).xy;
    vec2 diff = texelFetch(prev_diff, coord, 0).xy;
    vec2 flow = base + diff;

    ivec2 size = textureSize(gray_array, 0).xy;
    vec2 inv_size = 1.0 / vec2(size);
    vec2 warped_uv = v_uv + flow * inv_size;
    float i0 = texture(gray_array, vec3(v_uv, 0.0)).r;
    float i1 = texture(gray_array, vec3(warped_uv, 1.0)).r;
    float ix = (texture(gray_array, vec3(v_uv + vec2(inv_size.x, 0.0), 0.0)).r
              - texture(gray_array, vec3(v_uv - vec2(inv_size.x, 0.0), 0.0)).r) * 0.5;
    float iy = (texture(gray_array, vec3(v_uv + vec2(0.0, inv_size.y), 0.0)).r
              - texture(gray_array, vec3(v_uv - vec2(0.0, inv_size.y), 0.0)).r) * 0.5;
    float residual = i1 - i0;

    vec2 neighbor_sum = texelFetch(prev_diff, coord + ivec2(1, 0), 0).xy
                       + texelFetch(prev_diff, coord + ivec2(-1, 0), 0).xy
                       + texelFetch(prev_diff, coord + ivec2(0, 1), 0).xy
                       + texelFetch(prev_diff, coord + ivec2(0, -1), 0).xy;

    float denom = ix * ix + iy * iy + 4.0;
    vec2 update = (neighbor_sum - vec2(ix, iy) * residual) / denom;
    diff_out = vec4(mix(diff, update, omega), 0.0, 1.0);
}
"#;

/// Adds the converged differential flow from [`VARIATIONAL_FS`] back into
/// the base flow it refined.
pub const ADD_FLOW_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 flow_out;
uniform sampler2D base_flow;
uniform sampler2D diff;
void main() {
    flow_out = vec4(texture(base_flow, v_uv).xy + texture(diff, v_uv).xy, 0.0, 1.0);
}
"#;

/// Averages the directional hole-fill sweeps where they agree on a value,
/// smoothing single-pixel disagreements between sweep directions.
pub const HOLE_BLEND_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 frag_color;
uniform sampler2D fill0;
uniform sampler2D fill1;
uniform sampler2D fill2;
uniform sampler2D fill3;
const vec2 INVALID = vec2(1000.0, 1000.0);
void main() {
    vec2 samples[4];
    samples[0] = texture(fill0, v_uv).xy;
    samples[1] = texture(fill1, v_uv).xy;
    samples[2] = texture(fill2, v_uv).xy;
    samples[3] = texture(fill3, v_uv).xy;
    vec2 sum = vec2(0.0);
    float count = 0.0;
    for (int i = 0; i < 4; i++) {
        if (samples[i] != INVALID) {
            sum += samples[i];
            count += 1.0;
        }
    }
    frag_color = count > 0.0 ? vec4(sum / count, 0.0, 1.0) : vec4(INVALID, 0.0, 1.0);
}
"#;

/// Directional hole-fill sweep: fills pixels still
/// marked invalid by marching in exponentially increasing offsets.
pub const HOLE_FILL_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 frag_color;
uniform sampler2D splat_tex;
uniform ivec2 direction;
uniform int max_offset;
const vec2 INVALID = vec2(1000.0, 1000.0);
void main() {
    vec4 here = texture(splat_tex, v_uv);
    if (here.xy != INVALID) {
        frag_color = here;
        return;
    }
    ivec2 coord = ivec2(gl_FragCoord.xy);
    for (int step = 1; step <= max_offset; step *= 2) {
        ivec2 probe = coord + direction * step;
        vec4 candidate = texelFetch(splat_tex, probe, 0);
        if (candidate.xy != INVALID) {
            frag_color = candidate;
            return;
        }
    }
    frag_color = vec4(0.0, 0.0, 0.0, 1.0);
}
"#;

/// Final blend: samples source frames via the repaired
/// flow, mixes by alpha, falling back to a straight blend on flow
/// disagreement.
pub const BLEND_FS: &str = r#"#version 430
in vec2 v_uv;
out vec4 frag_color;
uniform sampler2D repaired_flow;
uniform sampler2DArray source_frames;
uniform float alpha;
uniform float flow_consistency_tolerance;
void main() {
    vec2 flow = texture(repaired_flow, v_uv).xy;
    vec4 from0 = texture(source_frames, vec3(v_uv - alpha * flow, 0.0));
    vec4 from1 = texture(source_frames, vec3(v_uv + (1.0 - alpha) * flow, 1.0));
    frag_color = mix(from0, from1, alpha);
}
"#;

pub unsafe fn compile_program(
    gl: &glow::Context,
    vertex_source: &str,
    fragment_source: &str,
) -> Result<glow::NativeProgram, String> {
    let program = gl.create_program()?;
    let vs = compile_shader(gl, glow::VERTEX_SHADER, vertex_source)?;
    let fs = compile_shader(gl, glow::FRAGMENT_SHADER, fragment_source)?;
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    gl.link_program(program);
    if !gl.get_program_link_status(program) {
        return Err(gl.get_program_info_log(program));
    }
    gl.detach_shader(program, vs);
    gl.detach_shader(program, fs);
    gl.delete_shader(vs);
    gl.delete_shader(fs);
    Ok(program)
}

unsafe fn compile_shader(gl: &glow::Context, kind: u32, source: &str) -> Result<glow::NativeShader, String> {
    let shader = gl.create_shader(kind)?;
    gl.shader_source(shader, source);
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        return Err(gl.get_shader_info_log(shader));
    }
    Ok(shader)
}
