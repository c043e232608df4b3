//! Producer-side recording API.
//!
//! Every method appends exactly one command record and returns immediately; nothing reaches the
//! backend until the finished list has been submitted and the dispatcher gets to it. Argument
//! layouts written here are read back field for field by `dispatch`.

use std::sync::Arc;

use bytemuck::Pod;

use crate::cmd::{ArgBuffer, CommandList, Opcode};
use crate::fence::{DisplayFences, PresentError};
use crate::handle::{Handle, HandleAllocator};
use crate::types::{
    BitmapDrawFlags, BlendEquation, BlendFactor, BufferUsage, ClearBits, Color, ColorMask,
    ConditionFunc, Feature, FilterMode, FrontFaceRule, IndexFormat, PenStyle, Point,
    PrimitiveMode, Rect, RenderingFace, StencilAction, TextureFormat, UniformType, VertexAttrib,
};

/// Records typed drawing and state calls into a [`CommandList`].
#[derive(Debug)]
pub struct CommandBuilder {
    list: CommandList,
    handles: HandleAllocator,
    fences: Arc<DisplayFences>,
}

impl CommandBuilder {
    pub fn new(handles: HandleAllocator, fences: Arc<DisplayFences>) -> Self {
        Self {
            list: CommandList::new(),
            handles,
            fences,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Hands over the recorded list and starts a new, empty one.
    pub fn finish(&mut self) -> CommandList {
        core::mem::take(&mut self.list)
    }

    pub fn into_list(mut self) -> CommandList {
        self.finish()
    }

    fn record(&mut self, opcode: Opcode, args: ArgBuffer) -> &mut Self {
        self.list.push(opcode, args);
        self
    }

    fn record_with(&mut self, opcode: Opcode, fill: impl FnOnce(&mut ArgBuffer)) -> &mut Self {
        let mut args = ArgBuffer::new();
        fill(&mut args);
        self.record(opcode, args)
    }

    /// Appends a record of a command set layered on top of this one.
    pub fn push_raw(&mut self, opcode: u16, args: ArgBuffer) -> &mut Self {
        self.list.push_raw(opcode, args);
        self
    }

    // Resources.

    /// `pixels` may be empty to leave the texture contents zeroed.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        pixels: &[u8],
    ) -> Handle {
        let handle = self.handles.allocate();
        self.record_with(Opcode::CreateTexture, |a| {
            a.push(handle)
                .push(width)
                .push(height)
                .push(format.to_raw())
                .push_slice(pixels);
        });
        handle
    }

    pub fn update_texture(&mut self, texture: Handle, region: Rect, pixels: &[u8]) -> &mut Self {
        self.record_with(Opcode::UpdateTexture, |a| {
            a.push(texture).push(region).push_slice(pixels);
        })
    }

    pub fn set_texture_filter(
        &mut self,
        texture: Handle,
        min: FilterMode,
        mag: FilterMode,
    ) -> &mut Self {
        self.record_with(Opcode::SetTextureFilter, |a| {
            a.push(texture).push(min.to_raw()).push(mag.to_raw());
        })
    }

    /// `data` may be shorter than `size`; the rest is zeroed.
    pub fn create_buffer(&mut self, size: u32, usage: BufferUsage, data: &[u8]) -> Handle {
        let handle = self.handles.allocate();
        self.record_with(Opcode::CreateBuffer, |a| {
            a.push(handle)
                .push(size)
                .push(usage.to_raw())
                .push_slice(data);
        });
        handle
    }

    pub fn update_buffer(&mut self, buffer: Handle, offset: u32, data: &[u8]) -> &mut Self {
        self.record_with(Opcode::UpdateBuffer, |a| {
            a.push(buffer).push(offset).push_slice(data);
        })
    }

    pub fn create_program(&mut self, vertex: &[u8], fragment: &[u8]) -> Handle {
        let handle = self.handles.allocate();
        self.record_with(Opcode::CreateProgram, |a| {
            a.push(handle).push_slice(vertex).push_slice(fragment);
        });
        handle
    }

    pub fn create_input_layout(&mut self, attribs: &[VertexAttrib]) -> Handle {
        let handle = self.handles.allocate();
        self.record_with(Opcode::CreateInputLayout, |a| {
            a.push(handle).push_slice(attribs);
        });
        handle
    }

    /// Creates an off-screen bitmap that can be bound as render target and drawn from.
    pub fn create_bitmap(&mut self, width: u32, height: u32) -> Handle {
        let handle = self.handles.allocate();
        self.record_with(Opcode::CreateBitmap, |a| {
            a.push(handle).push(width).push(height);
        });
        handle
    }

    pub fn destroy(&mut self, resource: Handle) -> &mut Self {
        self.record_with(Opcode::DestroyResource, |a| {
            a.push(resource);
        })
    }

    // Fixed-function state.

    /// Top-left origin, in pixels of the current render target.
    pub fn set_viewport(&mut self, rect: Rect) -> &mut Self {
        self.record_with(Opcode::SetViewport, |a| {
            a.push(rect);
        })
    }

    /// Top-left origin. Takes effect while [`Feature::Clipping`] is enabled.
    pub fn clip_rect(&mut self, rect: Rect) -> &mut Self {
        self.record_with(Opcode::ClipRect, |a| {
            a.push(rect);
        })
    }

    pub fn set_feature(&mut self, feature: Feature, enabled: bool) -> &mut Self {
        self.record_with(Opcode::SetFeature, |a| {
            a.push(feature.to_raw()).push_bool(enabled);
        })
    }

    pub fn blend_formula(
        &mut self,
        rgb_equation: BlendEquation,
        alpha_equation: BlendEquation,
        src_rgb: BlendFactor,
        dst_rgb: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    ) -> &mut Self {
        self.record_with(Opcode::BlendFormula, |a| {
            a.push(rgb_equation.to_raw())
                .push(alpha_equation.to_raw())
                .push(src_rgb.to_raw())
                .push(dst_rgb.to_raw())
                .push(src_alpha.to_raw())
                .push(dst_alpha.to_raw());
        })
    }

    pub fn set_stencil_action(
        &mut self,
        face: RenderingFace,
        on_stencil_fail: StencilAction,
        on_depth_fail: StencilAction,
        on_pass: StencilAction,
    ) -> &mut Self {
        self.record_with(Opcode::StencilAction, |a| {
            a.push(face.to_raw())
                .push(on_stencil_fail.to_raw())
                .push(on_depth_fail.to_raw())
                .push(on_pass.to_raw());
        })
    }

    pub fn set_stencil_pass_condition(
        &mut self,
        face: RenderingFace,
        func: ConditionFunc,
        reference: i32,
        mask: u32,
    ) -> &mut Self {
        self.record_with(Opcode::StencilPassCondition, |a| {
            a.push(face.to_raw())
                .push(func.to_raw())
                .push(reference)
                .push(mask);
        })
    }

    pub fn set_stencil_mask(&mut self, face: RenderingFace, mask: u32) -> &mut Self {
        self.record_with(Opcode::StencilMask, |a| {
            a.push(face.to_raw()).push(mask);
        })
    }

    pub fn set_depth_mask(&mut self, write: bool) -> &mut Self {
        self.record_with(Opcode::DepthMask, |a| {
            a.push_bool(write);
        })
    }

    pub fn set_depth_func(&mut self, func: ConditionFunc) -> &mut Self {
        self.record_with(Opcode::DepthFunc, |a| {
            a.push(func.to_raw());
        })
    }

    pub fn set_cull_face(&mut self, face: RenderingFace) -> &mut Self {
        self.record_with(Opcode::CullFace, |a| {
            a.push(face.to_raw());
        })
    }

    pub fn set_front_face_rule(&mut self, rule: FrontFaceRule) -> &mut Self {
        self.record_with(Opcode::FrontFaceRule, |a| {
            a.push(rule.to_raw());
        })
    }

    pub fn set_color_mask(&mut self, mask: ColorMask) -> &mut Self {
        self.record_with(Opcode::ColorMask, |a| {
            a.push(mask.bits());
        })
    }

    pub fn set_line_width(&mut self, width: f32) -> &mut Self {
        self.record_with(Opcode::LineWidth, |a| {
            a.push(width);
        })
    }

    pub fn set_depth_bias(&mut self, factor: f32, units: f32) -> &mut Self {
        self.record_with(Opcode::DepthBias, |a| {
            a.push(factor).push(units);
        })
    }

    pub fn set_point_size(&mut self, size: f32) -> &mut Self {
        self.record_with(Opcode::PointSize, |a| {
            a.push(size);
        })
    }

    pub fn set_pen_style(&mut self, style: PenStyle) -> &mut Self {
        self.record_with(Opcode::PenStyle, |a| {
            a.push(style.to_raw());
        })
    }

    pub fn set_brush_color(&mut self, color: Color) -> &mut Self {
        self.record_with(Opcode::BrushColor, |a| {
            a.push(color);
        })
    }

    // Bindings.

    /// [`Handle::NULL`] unbinds.
    pub fn use_program(&mut self, program: Handle) -> &mut Self {
        self.record_with(Opcode::UseProgram, |a| {
            a.push(program);
        })
    }

    /// Binds a texture or bitmap to `unit`. [`Handle::NULL`] unbinds.
    pub fn bind_texture(&mut self, unit: u32, texture: Handle) -> &mut Self {
        self.record_with(Opcode::BindTexture, |a| {
            a.push(unit).push(texture);
        })
    }

    /// Sets a uniform of the current program from raw packed values.
    pub fn set_uniform(&mut self, location: i32, ty: UniformType, data: &[u8]) -> &mut Self {
        self.record_with(Opcode::SetUniform, |a| {
            a.push(location).push(ty.to_raw()).push_slice(data);
        })
    }

    pub fn set_uniform_values<T: Pod>(
        &mut self,
        location: i32,
        ty: UniformType,
        values: &[T],
    ) -> &mut Self {
        self.set_uniform(location, ty, bytemuck::cast_slice(values))
    }

    /// Binds `texture` to `unit` and points the sampler uniform at `location` to it.
    pub fn set_texture_for_shader(&mut self, unit: u32, location: i32, texture: Handle) -> &mut Self {
        self.record_with(Opcode::SetTextureForShader, |a| {
            a.push(unit).push(location).push(texture);
        })
    }

    /// Binds `buffers[i]` at byte `offsets[i]` to vertex slot `first_slot + i`.
    pub fn bind_vertex_buffers(
        &mut self,
        first_slot: u32,
        buffers: &[Handle],
        offsets: &[u32],
    ) -> &mut Self {
        self.record_with(Opcode::BindVertexBuffers, |a| {
            a.push(first_slot).push_slice(buffers).push_slice(offsets);
        })
    }

    pub fn bind_index_buffer(&mut self, buffer: Handle) -> &mut Self {
        self.record_with(Opcode::BindIndexBuffer, |a| {
            a.push(buffer);
        })
    }

    pub fn bind_input_layout(&mut self, layout: Handle) -> &mut Self {
        self.record_with(Opcode::BindInputLayout, |a| {
            a.push(layout);
        })
    }

    /// Redirects drawing into a bitmap; [`Handle::NULL`] returns to the swapchain surface.
    pub fn bind_bitmap(&mut self, bitmap: Handle) -> &mut Self {
        self.record_with(Opcode::BindBitmap, |a| {
            a.push(bitmap);
        })
    }

    pub fn set_swapchain_size(&mut self, width: u32, height: u32) -> &mut Self {
        self.record_with(Opcode::SetSwapchainSize, |a| {
            a.push(width).push(height);
        })
    }

    // Drawing.

    pub fn clear(&mut self, color: Color, depth: f32, stencil: i32, bits: ClearBits) -> &mut Self {
        self.record_with(Opcode::Clear, |a| {
            a.push(color).push(depth).push(stencil).push(bits.bits());
        })
    }

    /// `offset` is a byte offset into the bound index buffer.
    pub fn draw_indexed(
        &mut self,
        mode: PrimitiveMode,
        count: u32,
        format: IndexFormat,
        offset: u32,
    ) -> &mut Self {
        self.record_with(Opcode::DrawIndexed, |a| {
            a.push(mode.to_raw())
                .push(count)
                .push(format.to_raw())
                .push(offset);
        })
    }

    pub fn draw_array(&mut self, mode: PrimitiveMode, first: u32, count: u32) -> &mut Self {
        self.record_with(Opcode::DrawArray, |a| {
            a.push(mode.to_raw()).push(first).push(count);
        })
    }

    /// Fills `rect` with the brush color.
    pub fn draw_rectangle(&mut self, rect: Rect) -> &mut Self {
        self.record_with(Opcode::DrawRectangle, |a| {
            a.push(rect);
        })
    }

    /// Strokes a segment with the brush color and pen style.
    pub fn draw_line(&mut self, start: Point, end: Point) -> &mut Self {
        self.record_with(Opcode::DrawLine, |a| {
            a.push(start).push(end);
        })
    }

    /// Strokes the closed outline through `points`.
    pub fn draw_polygon(&mut self, points: &[Point]) -> &mut Self {
        self.record_with(Opcode::DrawPolygon, |a| {
            a.push_slice(points);
        })
    }

    /// Copies `source` of `bitmap` into `dest`. A zero-sized `source` means the whole bitmap,
    /// a zero-sized `dest` means the source size.
    pub fn draw_bitmap(
        &mut self,
        bitmap: Handle,
        dest: Rect,
        source: Rect,
        flags: BitmapDrawFlags,
    ) -> &mut Self {
        self.record_with(Opcode::DrawBitmap, |a| {
            a.push(bitmap).push(dest).push(source).push(flags.bits());
        })
    }

    // Synchronization.

    /// Saves the backend state into the single backup slot.
    pub fn backup_state(&mut self) -> &mut Self {
        self.record(Opcode::BackupState, ArgBuffer::new())
    }

    pub fn restore_state(&mut self) -> &mut Self {
        self.record(Opcode::RestoreState, ArgBuffer::new())
    }

    /// Presents the frame. The returned fence completes once the present call has returned.
    pub fn display(&mut self) -> u64 {
        let fence = self.fences.issue();
        self.record_with(Opcode::Display, |a| {
            a.push(fence);
        });
        fence
    }
}

impl Drop for CommandBuilder {
    /// Display fences recorded into a list that is never finished can no longer be signaled.
    fn drop(&mut self) {
        let retired = self
            .fences
            .retire_list(&self.list, &PresentError::Discarded);
        if retired > 0 {
            tracing::debug!(retired, "dropped builder retired unsubmitted display fences");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Command;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(HandleAllocator::new(), Arc::new(DisplayFences::new()))
    }

    #[test]
    fn each_call_appends_one_record_in_order() {
        let mut b = builder();
        b.clear(Color::BLACK, 1.0, 0, ClearBits::COLOR)
            .draw_indexed(PrimitiveMode::Triangles, 6, IndexFormat::U16, 0);
        let fence = b.display();
        assert_eq!(fence, 1);

        let list = b.finish();
        assert!(b.is_empty());
        let ops: Vec<_> = list.iter().filter_map(Command::opcode).collect();
        assert_eq!(
            ops,
            vec![Opcode::Clear, Opcode::DrawIndexed, Opcode::Display]
        );
    }

    #[test]
    fn handles_are_issued_at_record_time() {
        let mut b = builder();
        let tex = b.create_texture(2, 2, TextureFormat::Rgba8, &[]);
        let buf = b.create_buffer(16, BufferUsage::Static, &[1, 2, 3]);
        assert_ne!(tex, buf);
        b.bind_texture(0, tex).destroy(tex);

        let list = b.into_list();
        let first = list.iter().next().unwrap();
        let mut r = first.args().reader();
        assert_eq!(r.pop::<Handle>().unwrap(), tex);
        assert_eq!(r.pop::<u32>().unwrap(), 2);
        assert_eq!(r.pop::<u32>().unwrap(), 2);
        assert_eq!(r.pop::<u8>().unwrap(), TextureFormat::Rgba8.to_raw());
        assert!(r.pop_bytes().unwrap().is_empty());
        r.finish().unwrap();
    }

    #[test]
    fn uniform_values_are_packed_as_bytes() {
        let mut b = builder();
        b.set_uniform_values(3, UniformType::Vec4, &[1.0f32, 0.5, 0.25, 0.0]);
        let list = b.into_list();
        let mut r = list.iter().next().unwrap().args().reader();
        assert_eq!(r.pop::<i32>().unwrap(), 3);
        assert_eq!(r.pop::<u8>().unwrap(), UniformType::Vec4.to_raw());
        assert_eq!(r.pop_bytes().unwrap().len(), 16);
        r.finish().unwrap();
    }

    #[test]
    fn dropping_an_unfinished_builder_retires_its_display_fences() {
        let fences = Arc::new(DisplayFences::new());
        let mut b = CommandBuilder::new(HandleAllocator::new(), fences.clone());
        let submitted = b.display();
        let list = b.finish();
        let dropped = b.display();
        drop(b);

        assert_eq!(fences.wait(dropped), Err(PresentError::Discarded));
        assert!(!fences.is_complete(submitted), "finished lists keep their fences");
        drop(list);
    }
}
