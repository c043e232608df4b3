//! Native graphics backend abstraction.
//!
//! The dispatcher is backend-agnostic: it decodes commands, translates portable enumerations
//! through [`GraphicsBackend::enums`] and calls into this trait. The trait is modeled on a
//! GL-style state machine (object names are `u32`, name `0` means "nothing bound") because
//! that is the lowest common denominator the emulated drawing API expects. A deterministic
//! software backend is provided for tests and headless runs.

pub mod gl;
mod native;
mod null;
mod soft;
mod state;

use core::fmt;
use core::str::FromStr;

use serde::Deserialize;

pub use native::NativeEnums;
pub use null::NullBackend;
pub use soft::{BackendCall, CallTrace, SoftBackend};

use crate::types::{BitmapDrawFlags, ClearBits, Color, ColorMask, Point, UniformType, VertexAttrib};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PresentedFrame {
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major, origin top-left.
    pub rgba8: Vec<u8>,
}

/// Integer rectangle in backend (bottom-left origin) or 2D (top-left origin) coordinates,
/// depending on the call it is passed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelBox {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Separate RGB/alpha blend configuration, in native enum space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub equation_rgb: u32,
    pub equation_alpha: u32,
    pub src_rgb: u32,
    pub dst_rgb: u32,
    pub src_alpha: u32,
    pub dst_alpha: u32,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            equation_rgb: gl::FUNC_ADD,
            equation_alpha: gl::FUNC_ADD,
            src_rgb: gl::ONE,
            dst_rgb: gl::ZERO,
            src_alpha: gl::ONE,
            dst_alpha: gl::ZERO,
        }
    }
}

/// How a texture is copied onto the current render target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlitOptions {
    /// Multiplied into every sampled texel.
    pub tint: Option<Color>,
    pub flags: BitmapDrawFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("invalid resource name {0}")]
    InvalidResource(u32),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("out of bounds")]
    OutOfBounds,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Soft,
    Null,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Soft => "soft",
            BackendKind::Null => "null",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backend {0:?} (expected `soft` or `null`)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" | "software" => Ok(BackendKind::Soft),
            "null" | "none" => Ok(BackendKind::Null),
            _ => Err(UnknownBackend(s.to_owned())),
        }
    }
}

/// Builds a backend of the given kind with a `width`x`height` presentation surface.
pub fn create_backend(kind: BackendKind, width: u32, height: u32) -> Box<dyn GraphicsBackend> {
    match kind {
        BackendKind::Soft => Box::new(SoftBackend::new(width, height)),
        BackendKind::Null => Box::new(NullBackend::new(width, height)),
    }
}

/// Operations the dispatcher needs from a native graphics API.
///
/// All enum-typed parameters are already in the backend's native space (see [`NativeEnums`]).
/// Implementations live on the dispatcher thread only.
pub trait GraphicsBackend {
    fn kind(&self) -> BackendKind;
    fn enums(&self) -> &'static NativeEnums;

    // Resources. Creation returns the new object's native name.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
        pixels: Option<&[u8]>,
    ) -> Result<u32, BackendError>;
    /// `region` uses top-left origin texel coordinates.
    fn update_texture(
        &mut self,
        texture: u32,
        region: PixelBox,
        pixels: &[u8],
    ) -> Result<(), BackendError>;
    fn set_texture_filter(&mut self, texture: u32, min: u32, mag: u32)
        -> Result<(), BackendError>;
    fn destroy_texture(&mut self, texture: u32) -> Result<(), BackendError>;
    fn create_buffer(
        &mut self,
        size: u32,
        usage: u32,
        data: Option<&[u8]>,
    ) -> Result<u32, BackendError>;
    fn update_buffer(&mut self, buffer: u32, offset: u32, data: &[u8])
        -> Result<(), BackendError>;
    fn destroy_buffer(&mut self, buffer: u32) -> Result<(), BackendError>;
    fn create_program(&mut self, vertex: &[u8], fragment: &[u8]) -> Result<u32, BackendError>;
    fn destroy_program(&mut self, program: u32) -> Result<(), BackendError>;
    fn create_input_layout(&mut self, attribs: &[VertexAttrib]) -> Result<u32, BackendError>;
    fn destroy_input_layout(&mut self, layout: u32) -> Result<(), BackendError>;

    // Binding and fixed-function state.
    fn use_program(&mut self, program: u32) -> Result<(), BackendError>;
    fn active_texture(&mut self, unit: u32) -> Result<(), BackendError>;
    /// Binds `texture` to the active unit.
    fn bind_texture(&mut self, texture: u32) -> Result<(), BackendError>;
    fn bind_buffer(&mut self, target: u32, buffer: u32) -> Result<(), BackendError>;
    fn bind_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: u32,
        offset: u32,
    ) -> Result<(), BackendError>;
    fn bind_input_layout(&mut self, layout: u32) -> Result<(), BackendError>;
    /// Redirects drawing into `texture`, or back to the presentation surface for `0`.
    fn bind_framebuffer(&mut self, texture: u32) -> Result<(), BackendError>;
    fn blend_equation_separate(&mut self, rgb: u32, alpha: u32) -> Result<(), BackendError>;
    fn blend_func_separate(
        &mut self,
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    ) -> Result<(), BackendError>;
    fn set_enabled(&mut self, cap: u32, enabled: bool) -> Result<(), BackendError>;
    /// Bottom-left origin.
    fn viewport(&mut self, rect: PixelBox) -> Result<(), BackendError>;
    /// Bottom-left origin.
    fn scissor(&mut self, rect: PixelBox) -> Result<(), BackendError>;
    fn stencil_op_separate(
        &mut self,
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    ) -> Result<(), BackendError>;
    fn stencil_func_separate(
        &mut self,
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    ) -> Result<(), BackendError>;
    fn stencil_mask_separate(&mut self, face: u32, mask: u32) -> Result<(), BackendError>;
    fn depth_mask(&mut self, write: bool) -> Result<(), BackendError>;
    fn depth_func(&mut self, func: u32) -> Result<(), BackendError>;
    fn cull_face(&mut self, face: u32) -> Result<(), BackendError>;
    fn front_face(&mut self, rule: u32) -> Result<(), BackendError>;
    fn color_mask(&mut self, mask: ColorMask) -> Result<(), BackendError>;
    /// Fails with [`BackendError::Unsupported`] when wide lines are not available and with
    /// [`BackendError::OutOfBounds`] when `width` exceeds the supported range.
    fn line_width(&mut self, width: f32) -> Result<(), BackendError>;
    fn point_size(&mut self, size: f32) -> Result<(), BackendError>;
    fn polygon_offset(&mut self, factor: f32, units: f32) -> Result<(), BackendError>;
    /// Sets a uniform of the current program. `data` holds one or more packed values of `ty`.
    fn set_uniform(
        &mut self,
        location: i32,
        ty: UniformType,
        data: &[u8],
    ) -> Result<(), BackendError>;

    // Drawing.
    fn clear(
        &mut self,
        bits: ClearBits,
        color: Color,
        depth: f32,
        stencil: i32,
    ) -> Result<(), BackendError>;
    /// `offset` is a byte offset into the bound element buffer.
    fn draw_elements(
        &mut self,
        mode: u32,
        count: u32,
        index_type: u32,
        offset: u32,
    ) -> Result<(), BackendError>;
    fn draw_arrays(&mut self, mode: u32, first: u32, count: u32) -> Result<(), BackendError>;
    /// Top-left origin.
    fn fill_rect(&mut self, rect: PixelBox, color: Color) -> Result<(), BackendError>;
    /// Connected line strip through `points` (top-left origin), closed into a loop if
    /// `closed`. Pixels whose stipple bit is clear are skipped.
    fn draw_lines(
        &mut self,
        points: &[Point],
        color: Color,
        stipple: u16,
        closed: bool,
    ) -> Result<(), BackendError>;
    /// Copies `source` texels of `texture` into `dest` (both top-left origin), scaling with
    /// nearest sampling.
    fn blit(
        &mut self,
        texture: u32,
        dest: PixelBox,
        source: PixelBox,
        options: BlitOptions,
    ) -> Result<(), BackendError>;

    // Queries used by state snapshots.
    fn bound_program(&self) -> u32;
    fn active_texture_unit(&self) -> u32;
    fn texture_units(&self) -> u32;
    fn bound_texture(&self, unit: u32) -> u32;
    fn bound_buffer(&self, target: u32) -> u32;
    fn bound_input_layout(&self) -> u32;
    fn bound_framebuffer(&self) -> u32;
    fn blend_state(&self) -> BlendState;
    fn viewport_box(&self) -> PixelBox;
    fn scissor_box(&self) -> PixelBox;
    fn is_enabled(&self, cap: u32) -> bool;

    // Presentation surface.
    fn present(&mut self) -> Result<(), BackendError>;
    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), BackendError>;
    fn surface_size(&self) -> (u32, u32);
}
