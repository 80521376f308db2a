//! GPU context (C7): EGL/GLES plumbing, per-stream YUV textures, the
//! keystone-transformed draw pass.
//!
//! Constructed only once C8 ([`crate::display`]) has produced a GBM
//! device and surface, and torn down before C8 releases them — EGL's
//! context and surface are bound directly to that GBM surface, there is
//! no intermediate windowing system.

pub mod keystone;
pub mod shader;

use std::rc::Rc;

use anyhow::{anyhow, Context as _, Result};
use glow::HasContext;
use khronos_egl as egl;
use log::info;

use keystone::Corners;

/// The three single-channel planes backing one stream's current frame.
pub struct StreamTextures {
    y: glow::Texture,
    u: glow::Texture,
    v: glow::Texture,
    alloc_luma: (u32, u32),
    alloc_chroma: (u32, u32),
    /// Luma (width, height) actually written by the last [`GpuContext::upload_frame`]
    /// call, always `<= alloc_luma`. Defaults to `alloc_luma` (scale 1.0)
    /// before the first frame is uploaded.
    valid_luma: (u32, u32),
}

impl StreamTextures {
    /// `false` once the pool has reallocated to dimensions these
    /// textures no longer cover; the caller must then call
    /// [`GpuContext::create_stream_textures`] again.
    pub fn fits(&self, alloc_luma: (u32, u32), alloc_chroma: (u32, u32)) -> bool {
        self.alloc_luma == alloc_luma && self.alloc_chroma == alloc_chroma
    }

    /// The UV scale that crops the full `[0,1]` quad down to the valid,
    /// unpadded region of the headroom-allocated textures.
    fn uv_scale(&self) -> (f32, f32) {
        (
            self.valid_luma.0 as f32 / self.alloc_luma.0 as f32,
            self.valid_luma.1 as f32 / self.alloc_luma.1 as f32,
        )
    }
}

/// Owns the EGL display/context/surface triple and the GLES program used
/// for every stream's draw pass.
pub struct GpuContext {
    egl: egl::DynamicInstance<egl::EGL1_4>,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    gl: Rc<glow::Context>,
    program: glow::Program,
    vao: glow::VertexArray,
    keystone_uniform: glow::UniformLocation,
    uv_scale_uniform: glow::UniformLocation,
    tex_uniforms: [glow::UniformLocation; 3],
}

// Unit quad: position (x, y), tex coord (u, v). Two triangles, 6 verts.
#[rustfmt::skip]
const QUAD_VERTICES: [f32; 24] = [
    -1.0,  1.0,  0.0, 0.0,
     1.0,  1.0,  1.0, 0.0,
     1.0, -1.0,  1.0, 1.0,
    -1.0,  1.0,  0.0, 0.0,
     1.0, -1.0,  1.0, 1.0,
    -1.0, -1.0,  0.0, 1.0,
];

impl GpuContext {
    /// `gbm_display`/`gbm_surface` are the native handles C8 obtained
    /// from its DRM/GBM device.
    pub fn new(
        gbm_display: egl::NativeDisplayType,
        gbm_surface: egl::NativeWindowType,
    ) -> Result<Self> {
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required() }
            .context("failed to load libEGL")?;

        let display = unsafe { egl.get_display(gbm_display) }
            .ok_or_else(|| anyhow!("eglGetDisplay returned no display"))?;
        egl.initialize(display).context("eglInitialize failed")?;

        let attributes = [
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES3_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &attributes)
            .context("eglChooseConfig failed")?
            .ok_or_else(|| anyhow!("no EGL config matches GLES 3.1 + window surface"))?;

        egl.bind_api(egl::OPENGL_ES_API)
            .context("eglBindAPI(OPENGL_ES_API) failed")?;

        let context_attributes = [egl::CONTEXT_MAJOR_VERSION, 3, egl::CONTEXT_MINOR_VERSION, 1, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attributes)
            .context("eglCreateContext failed")?;

        let surface = unsafe { egl.create_window_surface(display, config, gbm_surface, None) }
            .context("eglCreateWindowSurface failed")?;

        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .context("eglMakeCurrent failed")?;

        let gl = unsafe {
            Rc::new(glow::Context::from_loader_function(|name| {
                egl.get_proc_address(name)
                    .map(|p| p as *const _)
                    .unwrap_or(std::ptr::null())
            }))
        };

        let program = unsafe { link_program(&gl)? };
        let vao = unsafe { build_quad(&gl)? };

        let keystone_uniform = unsafe { gl.get_uniform_location(program, "u_keystone") }
            .ok_or_else(|| anyhow!("shader missing u_keystone uniform"))?;
        let uv_scale_uniform = unsafe { gl.get_uniform_location(program, "u_uv_scale") }
            .ok_or_else(|| anyhow!("shader missing u_uv_scale uniform"))?;
        let tex_uniforms = unsafe {
            [
                gl.get_uniform_location(program, "u_tex_y")
                    .ok_or_else(|| anyhow!("shader missing u_tex_y uniform"))?,
                gl.get_uniform_location(program, "u_tex_u")
                    .ok_or_else(|| anyhow!("shader missing u_tex_u uniform"))?,
                gl.get_uniform_location(program, "u_tex_v")
                    .ok_or_else(|| anyhow!("shader missing u_tex_v uniform"))?,
            ]
        };

        info!("GPU context initialized: GLES 3.1 over EGL, GBM-backed surface");

        Ok(Self {
            egl,
            display,
            context,
            surface,
            gl,
            program,
            vao,
            keystone_uniform,
            uv_scale_uniform,
            tex_uniforms,
        })
    }

    /// Allocate a fresh triple of Y/U/V textures sized for `alloc_luma`
    /// (Y) / `alloc_chroma` (U, V). Storage is allocated once; later
    /// frames only ever `tex_sub_image` into it.
    pub fn create_stream_textures(
        &self,
        alloc_luma: (u32, u32),
        alloc_chroma: (u32, u32),
    ) -> Result<StreamTextures> {
        let gl = &self.gl;
        unsafe {
            let y = new_plane_texture(gl, alloc_luma)?;
            let u = new_plane_texture(gl, alloc_chroma)?;
            let v = new_plane_texture(gl, alloc_chroma)?;
            Ok(StreamTextures {
                y,
                u,
                v,
                alloc_luma,
                alloc_chroma,
                valid_luma: alloc_luma,
            })
        }
    }

    /// Upload one decoded frame's planes, using `row_length` (the source
    /// stride) so the pool's padded buffers can be uploaded without any
    /// CPU-side re-packing. Records the luma plane's valid (width,
    /// height) on `textures` so the next [`GpuContext::draw_stream`] call
    /// samples only the written region, not the headroom padding.
    pub fn upload_frame(
        &self,
        textures: &mut StreamTextures,
        y: (&[u8], u32, u32, u32),
        u: (&[u8], u32, u32, u32),
        v: (&[u8], u32, u32, u32),
    ) {
        let gl = &self.gl;
        unsafe {
            upload_plane(gl, textures.y, y);
            upload_plane(gl, textures.u, u);
            upload_plane(gl, textures.v, v);
        }
        textures.valid_luma = (y.1, y.2);
    }

    /// Clear the framebuffer; call before drawing any stream this frame.
    pub fn begin_frame(&self) {
        unsafe {
            self.gl.clear_color(0.0, 0.0, 0.0, 1.0);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    /// Draw one stream's textured, keystone-transformed quad.
    pub fn draw_stream(&self, textures: &StreamTextures, keystone: &Corners) {
        let gl = &self.gl;
        let matrix = keystone.to_matrix();
        let (scale_x, scale_y) = textures.uv_scale();
        unsafe {
            gl.use_program(Some(self.program));
            gl.bind_vertex_array(Some(self.vao));
            gl.uniform_matrix_3_f32_slice(Some(&self.keystone_uniform), false, &matrix);
            gl.uniform_2_f32(Some(&self.uv_scale_uniform), scale_x, scale_y);

            for (unit, (texture, uniform)) in [textures.y, textures.u, textures.v]
                .iter()
                .zip(self.tex_uniforms.iter())
                .enumerate()
            {
                gl.active_texture(glow::TEXTURE0 + unit as u32);
                gl.bind_texture(glow::TEXTURE_2D, Some(*texture));
                gl.uniform_1_i32(Some(uniform), unit as i32);
            }

            gl.draw_arrays(glow::TRIANGLES, 0, 6);
        }
    }

    /// Present the framebuffer and block until VSync (the page flip
    /// itself happens in C8; this just asks EGL to submit the buffer).
    pub fn swap_buffers(&self) -> Result<()> {
        self.egl
            .swap_buffers(self.display, self.surface)
            .context("eglSwapBuffers failed")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.terminate(self.display);
    }
}

unsafe fn compile_shader(
    gl: &glow::Context,
    kind: u32,
    source: &str,
) -> Result<glow::Shader> {
    let shader = gl.create_shader(kind).map_err(|e| anyhow!(e))?;
    gl.shader_source(shader, source);
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(anyhow!("shader compile failed: {log}"));
    }
    Ok(shader)
}

unsafe fn link_program(gl: &glow::Context) -> Result<glow::Program> {
    let vertex = compile_shader(gl, glow::VERTEX_SHADER, shader::VERTEX_SHADER)?;
    let fragment = compile_shader(gl, glow::FRAGMENT_SHADER, shader::FRAGMENT_SHADER)?;

    let program = gl.create_program().map_err(|e| anyhow!(e))?;
    gl.attach_shader(program, vertex);
    gl.attach_shader(program, fragment);
    gl.link_program(program);

    gl.delete_shader(vertex);
    gl.delete_shader(fragment);

    if !gl.get_program_link_status(program) {
        let log = gl.get_program_info_log(program);
        gl.delete_program(program);
        return Err(anyhow!("program link failed: {log}"));
    }
    Ok(program)
}

unsafe fn build_quad(gl: &glow::Context) -> Result<glow::VertexArray> {
    let vao = gl.create_vertex_array().map_err(|e| anyhow!(e))?;
    let vbo = gl.create_buffer().map_err(|e| anyhow!(e))?;

    gl.bind_vertex_array(Some(vao));
    gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
    gl.buffer_data_u8_slice(
        glow::ARRAY_BUFFER,
        bytemuck::cast_slice(&QUAD_VERTICES),
        glow::STATIC_DRAW,
    );

    let stride = 4 * std::mem::size_of::<f32>() as i32;
    gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
    gl.enable_vertex_attrib_array(0);
    gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 2 * std::mem::size_of::<f32>() as i32);
    gl.enable_vertex_attrib_array(1);

    Ok(vao)
}

unsafe fn new_plane_texture(gl: &glow::Context, dims: (u32, u32)) -> Result<glow::Texture> {
    let texture = gl.create_texture().map_err(|e| anyhow!(e))?;
    gl.bind_texture(glow::TEXTURE_2D, Some(texture));
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    gl.tex_image_2d(
        glow::TEXTURE_2D,
        0,
        glow::R8 as i32,
        dims.0 as i32,
        dims.1 as i32,
        0,
        glow::RED,
        glow::UNSIGNED_BYTE,
        None,
    );
    Ok(texture)
}

/// `(data, width, height, row_length)` of one plane, uploaded with an
/// explicit unpack row length so the pool's padded stride never needs
/// re-packing into a tightly packed buffer first.
unsafe fn upload_plane(gl: &glow::Context, texture: glow::Texture, plane: (&[u8], u32, u32, u32)) {
    let (data, width, height, row_length) = plane;
    gl.bind_texture(glow::TEXTURE_2D, Some(texture));
    gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, row_length as i32);
    gl.tex_sub_image_2d(
        glow::TEXTURE_2D,
        0,
        0,
        0,
        width as i32,
        height as i32,
        glow::RED,
        glow::UNSIGNED_BYTE,
        glow::PixelUnpackData::Slice(data),
    );
    gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_vertices_cover_full_clip_space() {
        let xs: Vec<f32> = QUAD_VERTICES.chunks(4).map(|v| v[0]).collect();
        assert!(xs.contains(&-1.0));
        assert!(xs.contains(&1.0));
    }
}
