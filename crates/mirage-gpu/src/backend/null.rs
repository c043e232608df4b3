use super::state::{self, TrackedState, TEXTURE_UNITS};
use super::{
    gl, BackendError, BackendKind, BlendState, BlitOptions, GraphicsBackend, NativeEnums,
    PixelBox,
};
use crate::types::{ClearBits, Color, ColorMask, Point, UniformType, VertexAttrib};

/// Backend that accepts every call and draws nothing.
///
/// Only the state visible through the snapshot queries is tracked, which is enough to run an
/// emulator headless without a graphics device.
#[derive(Debug)]
pub struct NullBackend {
    state: TrackedState,
    next_name: u32,
    surface: (u32, u32),
    presents: u64,
}

impl NullBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: TrackedState::new(width, height),
            next_name: 1,
            surface: (width, height),
            presents: 0,
        }
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    fn alloc_name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name = self.next_name.wrapping_add(1).max(1);
        name
    }
}

impl GraphicsBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn enums(&self) -> &'static NativeEnums {
        &gl::GL_ENUMS
    }

    fn create_texture(
        &mut self,
        _width: u32,
        _height: u32,
        _format: u32,
        _pixels: Option<&[u8]>,
    ) -> Result<u32, BackendError> {
        Ok(self.alloc_name())
    }

    fn update_texture(&mut self, _: u32, _: PixelBox, _: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_texture_filter(&mut self, _: u32, _: u32, _: u32) -> Result<(), BackendError> {
        Ok(())
    }

    fn destroy_texture(&mut self, texture: u32) -> Result<(), BackendError> {
        self.state.forget_texture(texture);
        Ok(())
    }

    fn create_buffer(&mut self, _: u32, _: u32, _: Option<&[u8]>) -> Result<u32, BackendError> {
        Ok(self.alloc_name())
    }

    fn update_buffer(&mut self, _: u32, _: u32, _: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: u32) -> Result<(), BackendError> {
        self.state.forget_buffer(buffer);
        Ok(())
    }

    fn create_program(&mut self, _: &[u8], _: &[u8]) -> Result<u32, BackendError> {
        Ok(self.alloc_name())
    }

    fn destroy_program(&mut self, program: u32) -> Result<(), BackendError> {
        self.state.forget_program(program);
        Ok(())
    }

    fn create_input_layout(&mut self, _: &[VertexAttrib]) -> Result<u32, BackendError> {
        Ok(self.alloc_name())
    }

    fn destroy_input_layout(&mut self, layout: u32) -> Result<(), BackendError> {
        self.state.forget_input_layout(layout);
        Ok(())
    }

    fn use_program(&mut self, program: u32) -> Result<(), BackendError> {
        self.state.program = program;
        Ok(())
    }

    fn active_texture(&mut self, unit: u32) -> Result<(), BackendError> {
        self.state.active_texture(unit)
    }

    fn bind_texture(&mut self, texture: u32) -> Result<(), BackendError> {
        self.state.bind_texture(texture);
        Ok(())
    }

    fn bind_buffer(&mut self, target: u32, buffer: u32) -> Result<(), BackendError> {
        self.state.bind_buffer(target, buffer)
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: u32, offset: u32) -> Result<(), BackendError> {
        self.state.bind_vertex_buffer(slot, buffer, offset)
    }

    fn bind_input_layout(&mut self, layout: u32) -> Result<(), BackendError> {
        self.state.input_layout = layout;
        Ok(())
    }

    fn bind_framebuffer(&mut self, texture: u32) -> Result<(), BackendError> {
        self.state.framebuffer = texture;
        Ok(())
    }

    fn blend_equation_separate(&mut self, rgb: u32, alpha: u32) -> Result<(), BackendError> {
        self.state.blend_equation(rgb, alpha)
    }

    fn blend_func_separate(
        &mut self,
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    ) -> Result<(), BackendError> {
        self.state
            .blend_func(src_rgb, dst_rgb, src_alpha, dst_alpha)
    }

    fn set_enabled(&mut self, cap: u32, enabled: bool) -> Result<(), BackendError> {
        self.state.set_enabled(cap, enabled)
    }

    fn viewport(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        self.state.viewport(rect)
    }

    fn scissor(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        self.state.scissor(rect)
    }

    fn stencil_op_separate(
        &mut self,
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    ) -> Result<(), BackendError> {
        self.state.stencil_op(face, fail, depth_fail, pass)
    }

    fn stencil_func_separate(
        &mut self,
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    ) -> Result<(), BackendError> {
        self.state.stencil_func(face, func, reference, mask)
    }

    fn stencil_mask_separate(&mut self, face: u32, mask: u32) -> Result<(), BackendError> {
        self.state.stencil_mask(face, mask)
    }

    fn depth_mask(&mut self, write: bool) -> Result<(), BackendError> {
        self.state.depth_write = write;
        Ok(())
    }

    fn depth_func(&mut self, func: u32) -> Result<(), BackendError> {
        self.state.depth_func(func)
    }

    fn cull_face(&mut self, face: u32) -> Result<(), BackendError> {
        self.state.cull_face(face)
    }

    fn front_face(&mut self, rule: u32) -> Result<(), BackendError> {
        self.state.front_face(rule)
    }

    fn color_mask(&mut self, mask: ColorMask) -> Result<(), BackendError> {
        self.state.color_mask = mask;
        Ok(())
    }

    fn line_width(&mut self, width: f32) -> Result<(), BackendError> {
        self.state.line_width = width;
        Ok(())
    }

    fn point_size(&mut self, size: f32) -> Result<(), BackendError> {
        self.state.point_size(size)
    }

    fn polygon_offset(&mut self, factor: f32, units: f32) -> Result<(), BackendError> {
        self.state.polygon_offset = (factor, units);
        Ok(())
    }

    fn set_uniform(&mut self, _: i32, _: UniformType, _: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn clear(&mut self, _: ClearBits, _: Color, _: f32, _: i32) -> Result<(), BackendError> {
        Ok(())
    }

    fn draw_elements(
        &mut self,
        mode: u32,
        _count: u32,
        index_type: u32,
        _offset: u32,
    ) -> Result<(), BackendError> {
        if !state::is_primitive_mode(mode) {
            return Err(BackendError::Unsupported("primitive mode"));
        }
        state::index_size(index_type).ok_or(BackendError::Unsupported("index type"))?;
        Ok(())
    }

    fn draw_arrays(&mut self, mode: u32, _: u32, _: u32) -> Result<(), BackendError> {
        if !state::is_primitive_mode(mode) {
            return Err(BackendError::Unsupported("primitive mode"));
        }
        Ok(())
    }

    fn fill_rect(&mut self, _: PixelBox, _: Color) -> Result<(), BackendError> {
        Ok(())
    }

    fn draw_lines(&mut self, _: &[Point], _: Color, _: u16, _: bool) -> Result<(), BackendError> {
        Ok(())
    }

    fn blit(&mut self, _: u32, _: PixelBox, _: PixelBox, _: BlitOptions) -> Result<(), BackendError> {
        Ok(())
    }

    fn bound_program(&self) -> u32 {
        self.state.program
    }

    fn active_texture_unit(&self) -> u32 {
        self.state.active_unit
    }

    fn texture_units(&self) -> u32 {
        TEXTURE_UNITS
    }

    fn bound_texture(&self, unit: u32) -> u32 {
        self.state.bound_texture(unit)
    }

    fn bound_buffer(&self, target: u32) -> u32 {
        self.state.bound_buffer(target)
    }

    fn bound_input_layout(&self) -> u32 {
        self.state.input_layout
    }

    fn bound_framebuffer(&self) -> u32 {
        self.state.framebuffer
    }

    fn blend_state(&self) -> BlendState {
        self.state.blend
    }

    fn viewport_box(&self) -> PixelBox {
        self.state.viewport
    }

    fn scissor_box(&self) -> PixelBox {
        self.state.scissor
    }

    fn is_enabled(&self, cap: u32) -> bool {
        self.state.is_enabled(cap)
    }

    fn present(&mut self) -> Result<(), BackendError> {
        self.presents += 1;
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        self.surface = (width, height);
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_bindings_are_tracked() {
        let mut b = NullBackend::new(8, 8);
        let t = b.create_texture(1, 1, gl::RGBA, None).unwrap();
        let buf = b.create_buffer(4, gl::STATIC_DRAW, None).unwrap();
        assert_ne!(t, buf);

        b.active_texture(2).unwrap();
        b.bind_texture(t).unwrap();
        b.bind_buffer(gl::ELEMENT_ARRAY_BUFFER, buf).unwrap();
        b.set_enabled(gl::CULL_FACE, true).unwrap();
        assert_eq!(b.bound_texture(2), t);
        assert_eq!(b.bound_buffer(gl::ELEMENT_ARRAY_BUFFER), buf);
        assert!(b.is_enabled(gl::CULL_FACE));

        b.destroy_buffer(buf).unwrap();
        assert_eq!(b.bound_buffer(gl::ELEMENT_ARRAY_BUFFER), 0);
        b.present().unwrap();
        assert_eq!(b.presents(), 1);
    }
}
