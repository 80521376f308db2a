//! GLSL ES 3.1 shader sources for the YUV420 → RGB + keystone pass.
//!
//! The color matrix and offsets are baked in as constants rather than
//! uniforms: ITU-R BT.709, TV range (Y in `[16, 235]`, U/V in `[16,
//! 240]`). There is exactly one shader pair; overlay content is drawn by
//! the external collaborator with its own pipeline.

pub const VERTEX_SHADER: &str = r#"#version 310 es

layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_tex_coord;

uniform mat3 u_keystone;
// Crops the [0,1] quad UV down to the valid (unpadded) region of the
// pool's headroom-padded textures: valid_dims / alloc_dims per axis.
uniform vec2 u_uv_scale;

out vec2 v_tex_coord;

void main() {
    vec3 transformed = u_keystone * vec3(a_position, 1.0);
    gl_Position = vec4(transformed.xy / transformed.z, 0.0, 1.0);
    v_tex_coord = a_tex_coord * u_uv_scale;
}
"#;

pub const FRAGMENT_SHADER: &str = r#"#version 310 es
precision mediump float;

uniform sampler2D u_tex_y;
uniform sampler2D u_tex_u;
uniform sampler2D u_tex_v;

in vec2 v_tex_coord;
out vec4 frag_color;

// ITU-R BT.709, TV range: Y in [16,235], Cb/Cr in [16,240].
const vec3 BT709_OFFSET = vec3(-16.0 / 255.0, -128.0 / 255.0, -128.0 / 255.0);
const mat3 BT709_MATRIX = mat3(
    1.1644, 1.1644, 1.1644,
    0.0,   -0.2132, 2.1124,
    1.7927, -0.5329, 0.0
);

void main() {
    float y = texture(u_tex_y, v_tex_coord).r;
    float u = texture(u_tex_u, v_tex_coord).r;
    float v = texture(u_tex_v, v_tex_coord).r;

    vec3 yuv = vec3(y, u, v) + BT709_OFFSET;
    vec3 rgb = clamp(BT709_MATRIX * yuv, 0.0, 1.0);
    frag_color = vec4(rgb, 1.0);
}
"#;
