//! GL-style global state shared by the bundled backends.
//!
//! Both the software and the null backend must answer the snapshot queries exactly, so the
//! binding and fixed-function state lives here and is validated the same way for both.

use bitflags::bitflags;

use super::{gl, BackendError, BlendState, PixelBox};
use crate::types::ColorMask;

pub(super) const TEXTURE_UNITS: u32 = 8;
pub(super) const VERTEX_SLOTS: u32 = 16;

bitflags! {
    /// Enabled capabilities (`glEnable`/`glDisable`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(super) struct Caps: u16 {
        const BLEND = 1 << 0;
        const SCISSOR_TEST = 1 << 1;
        const CULL_FACE = 1 << 2;
        const DEPTH_TEST = 1 << 3;
        const STENCIL_TEST = 1 << 4;
        const SAMPLE_COVERAGE = 1 << 5;
        const SAMPLE_ALPHA_TO_ONE = 1 << 6;
        const SAMPLE_ALPHA_TO_COVERAGE = 1 << 7;
        const POLYGON_OFFSET_FILL = 1 << 8;
        const LINE_SMOOTH = 1 << 9;
        const MULTISAMPLE = 1 << 10;
        const DITHER = 1 << 11;
    }
}

impl Caps {
    fn from_gl(cap: u32) -> Option<Self> {
        Some(match cap {
            gl::BLEND => Caps::BLEND,
            gl::SCISSOR_TEST => Caps::SCISSOR_TEST,
            gl::CULL_FACE => Caps::CULL_FACE,
            gl::DEPTH_TEST => Caps::DEPTH_TEST,
            gl::STENCIL_TEST => Caps::STENCIL_TEST,
            gl::SAMPLE_COVERAGE => Caps::SAMPLE_COVERAGE,
            gl::SAMPLE_ALPHA_TO_ONE => Caps::SAMPLE_ALPHA_TO_ONE,
            gl::SAMPLE_ALPHA_TO_COVERAGE => Caps::SAMPLE_ALPHA_TO_COVERAGE,
            gl::POLYGON_OFFSET_FILL => Caps::POLYGON_OFFSET_FILL,
            gl::LINE_SMOOTH => Caps::LINE_SMOOTH,
            gl::MULTISAMPLE => Caps::MULTISAMPLE,
            gl::DITHER => Caps::DITHER,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct StencilFace {
    pub fail: u32,
    pub depth_fail: u32,
    pub pass: u32,
    pub func: u32,
    pub reference: i32,
    pub mask: u32,
    pub write_mask: u32,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            fail: gl::KEEP,
            depth_fail: gl::KEEP,
            pass: gl::KEEP,
            func: gl::ALWAYS,
            reference: 0,
            mask: u32::MAX,
            write_mask: u32::MAX,
        }
    }
}

pub(super) fn is_primitive_mode(mode: u32) -> bool {
    mode <= gl::TRIANGLE_FAN
}

pub(super) fn index_size(index_type: u32) -> Option<u32> {
    match index_type {
        gl::UNSIGNED_BYTE => Some(1),
        gl::UNSIGNED_SHORT => Some(2),
        gl::UNSIGNED_INT => Some(4),
        _ => None,
    }
}

fn is_blend_equation(eq: u32) -> bool {
    matches!(
        eq,
        gl::FUNC_ADD | gl::FUNC_SUBTRACT | gl::FUNC_REVERSE_SUBTRACT
    )
}

fn is_blend_factor(factor: u32) -> bool {
    matches!(factor, gl::ZERO | gl::ONE) || (gl::SRC_COLOR..=gl::SRC_ALPHA_SATURATE).contains(&factor)
}

fn is_compare_func(func: u32) -> bool {
    (gl::NEVER..=gl::ALWAYS).contains(&func)
}

fn is_stencil_op(op: u32) -> bool {
    matches!(
        op,
        gl::ZERO
            | gl::KEEP
            | gl::REPLACE
            | gl::INCR
            | gl::DECR
            | gl::INVERT
            | gl::INCR_WRAP
            | gl::DECR_WRAP
    )
}

#[derive(Clone, Debug)]
pub(super) struct TrackedState {
    pub program: u32,
    pub active_unit: u32,
    pub textures: [u32; TEXTURE_UNITS as usize],
    pub array_buffer: u32,
    pub element_buffer: u32,
    pub vertex_buffers: [(u32, u32); VERTEX_SLOTS as usize],
    pub input_layout: u32,
    pub framebuffer: u32,
    pub blend: BlendState,
    pub caps: Caps,
    pub viewport: PixelBox,
    pub scissor: PixelBox,
    pub stencil_front: StencilFace,
    pub stencil_back: StencilFace,
    pub depth_write: bool,
    pub depth_func: u32,
    pub cull_face: u32,
    pub front_face: u32,
    pub color_mask: ColorMask,
    pub line_width: f32,
    pub point_size: f32,
    pub polygon_offset: (f32, f32),
}

impl TrackedState {
    pub fn new(width: u32, height: u32) -> Self {
        let full = PixelBox::new(0, 0, clamp_dim(width), clamp_dim(height));
        Self {
            program: 0,
            active_unit: 0,
            textures: [0; TEXTURE_UNITS as usize],
            array_buffer: 0,
            element_buffer: 0,
            vertex_buffers: [(0, 0); VERTEX_SLOTS as usize],
            input_layout: 0,
            framebuffer: 0,
            blend: BlendState::default(),
            caps: Caps::DITHER,
            viewport: full,
            scissor: full,
            stencil_front: StencilFace::default(),
            stencil_back: StencilFace::default(),
            depth_write: true,
            depth_func: gl::LESS,
            cull_face: gl::BACK,
            front_face: gl::CCW,
            color_mask: ColorMask::all(),
            line_width: 1.0,
            point_size: 1.0,
            polygon_offset: (0.0, 0.0),
        }
    }

    pub fn set_enabled(&mut self, cap: u32, enabled: bool) -> Result<(), BackendError> {
        let flag = Caps::from_gl(cap).ok_or(BackendError::Unsupported("capability"))?;
        self.caps.set(flag, enabled);
        Ok(())
    }

    pub fn is_enabled(&self, cap: u32) -> bool {
        Caps::from_gl(cap).is_some_and(|flag| self.caps.contains(flag))
    }

    pub fn active_texture(&mut self, unit: u32) -> Result<(), BackendError> {
        if unit >= TEXTURE_UNITS {
            return Err(BackendError::OutOfBounds);
        }
        self.active_unit = unit;
        Ok(())
    }

    pub fn bound_texture(&self, unit: u32) -> u32 {
        self.textures.get(unit as usize).copied().unwrap_or(0)
    }

    pub fn bind_texture(&mut self, texture: u32) {
        self.textures[self.active_unit as usize] = texture;
    }

    pub fn bind_buffer(&mut self, target: u32, buffer: u32) -> Result<(), BackendError> {
        match target {
            gl::ARRAY_BUFFER => self.array_buffer = buffer,
            gl::ELEMENT_ARRAY_BUFFER => self.element_buffer = buffer,
            _ => return Err(BackendError::Unsupported("buffer target")),
        }
        Ok(())
    }

    pub fn bound_buffer(&self, target: u32) -> u32 {
        match target {
            gl::ARRAY_BUFFER => self.array_buffer,
            gl::ELEMENT_ARRAY_BUFFER => self.element_buffer,
            _ => 0,
        }
    }

    pub fn bind_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: u32,
        offset: u32,
    ) -> Result<(), BackendError> {
        let entry = self
            .vertex_buffers
            .get_mut(slot as usize)
            .ok_or(BackendError::OutOfBounds)?;
        *entry = (buffer, offset);
        Ok(())
    }

    pub fn blend_equation(&mut self, rgb: u32, alpha: u32) -> Result<(), BackendError> {
        if !is_blend_equation(rgb) || !is_blend_equation(alpha) {
            return Err(BackendError::Unsupported("blend equation"));
        }
        self.blend.equation_rgb = rgb;
        self.blend.equation_alpha = alpha;
        Ok(())
    }

    pub fn blend_func(
        &mut self,
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    ) -> Result<(), BackendError> {
        if ![src_rgb, dst_rgb, src_alpha, dst_alpha]
            .into_iter()
            .all(is_blend_factor)
        {
            return Err(BackendError::Unsupported("blend factor"));
        }
        self.blend.src_rgb = src_rgb;
        self.blend.dst_rgb = dst_rgb;
        self.blend.src_alpha = src_alpha;
        self.blend.dst_alpha = dst_alpha;
        Ok(())
    }

    pub fn viewport(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        if rect.width < 0 || rect.height < 0 {
            return Err(BackendError::InvalidState("negative viewport size"));
        }
        self.viewport = rect;
        Ok(())
    }

    pub fn scissor(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        if rect.width < 0 || rect.height < 0 {
            return Err(BackendError::InvalidState("negative scissor size"));
        }
        self.scissor = rect;
        Ok(())
    }

    fn stencil_faces(
        &mut self,
        face: u32,
        mut apply: impl FnMut(&mut StencilFace),
    ) -> Result<(), BackendError> {
        match face {
            gl::FRONT => apply(&mut self.stencil_front),
            gl::BACK => apply(&mut self.stencil_back),
            gl::FRONT_AND_BACK => {
                apply(&mut self.stencil_front);
                apply(&mut self.stencil_back);
            }
            _ => return Err(BackendError::Unsupported("stencil face")),
        }
        Ok(())
    }

    pub fn stencil_op(
        &mut self,
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    ) -> Result<(), BackendError> {
        if ![fail, depth_fail, pass].into_iter().all(is_stencil_op) {
            return Err(BackendError::Unsupported("stencil action"));
        }
        self.stencil_faces(face, |s| {
            s.fail = fail;
            s.depth_fail = depth_fail;
            s.pass = pass;
        })
    }

    pub fn stencil_func(
        &mut self,
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    ) -> Result<(), BackendError> {
        if !is_compare_func(func) {
            return Err(BackendError::Unsupported("stencil function"));
        }
        self.stencil_faces(face, |s| {
            s.func = func;
            s.reference = reference;
            s.mask = mask;
        })
    }

    pub fn stencil_mask(&mut self, face: u32, mask: u32) -> Result<(), BackendError> {
        self.stencil_faces(face, |s| s.write_mask = mask)
    }

    pub fn depth_func(&mut self, func: u32) -> Result<(), BackendError> {
        if !is_compare_func(func) {
            return Err(BackendError::Unsupported("depth function"));
        }
        self.depth_func = func;
        Ok(())
    }

    pub fn cull_face(&mut self, face: u32) -> Result<(), BackendError> {
        if !matches!(face, gl::FRONT | gl::BACK | gl::FRONT_AND_BACK) {
            return Err(BackendError::Unsupported("cull face"));
        }
        self.cull_face = face;
        Ok(())
    }

    pub fn front_face(&mut self, rule: u32) -> Result<(), BackendError> {
        if !matches!(rule, gl::CW | gl::CCW) {
            return Err(BackendError::Unsupported("front face rule"));
        }
        self.front_face = rule;
        Ok(())
    }

    pub fn point_size(&mut self, size: f32) -> Result<(), BackendError> {
        if size.is_nan() || size <= 0.0 {
            return Err(BackendError::InvalidState("point size must be positive"));
        }
        self.point_size = size;
        Ok(())
    }

    /// Drops every binding of a deleted texture, including the render target.
    pub fn forget_texture(&mut self, texture: u32) {
        for bound in &mut self.textures {
            if *bound == texture {
                *bound = 0;
            }
        }
        if self.framebuffer == texture {
            self.framebuffer = 0;
        }
    }

    pub fn forget_buffer(&mut self, buffer: u32) {
        if self.array_buffer == buffer {
            self.array_buffer = 0;
        }
        if self.element_buffer == buffer {
            self.element_buffer = 0;
        }
        for slot in &mut self.vertex_buffers {
            if slot.0 == buffer {
                *slot = (0, 0);
            }
        }
    }

    pub fn forget_program(&mut self, program: u32) {
        if self.program == program {
            self.program = 0;
        }
    }

    pub fn forget_input_layout(&mut self, layout: u32) {
        if self.input_layout == layout {
            self.input_layout = 0;
        }
    }
}

/// Surface dimensions as signed coordinates.
pub(super) fn clamp_dim(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
