//! Consumer side of the pipeline: replays command lists against a [`GraphicsBackend`].
//!
//! The dispatcher owns everything that may only be touched on the rendering thread: the
//! backend, the handle table, the state backup slot and the small amount of 2D drawing state
//! (brush, pen, render target size) that the emulated drawing API keeps outside the backend.
//!
//! Per-command failures (unresolved handles, unsupported enumeration values, backend errors)
//! are logged and the command is skipped. A broken list chain or arguments that do not decode
//! are fatal: the loop stops and reports [`DispatchError`].

use std::sync::Arc;

use crate::backend::{BackendError, BlitOptions, GraphicsBackend, NativeEnums, PixelBox};
use crate::cmd::{ArgReader, Command, CommandList, DecodeError, ListCorrupted, Opcode};
use crate::fence::DisplayFences;
use crate::handle::{Handle, HandleError, HandleTable};
use crate::queue::SubmissionQueue;
use crate::snapshot::StateSnapshot;
use crate::stats::DispatchStats;
use crate::types::{
    BitmapDrawFlags, ClearBits, Color, ColorMask, PenStyle, Point, Rect, TextureFormat,
    UniformType, VertexAttrib,
};

/// Vertex buffer slots addressable by `BindVertexBuffers`.
pub const MAX_VERTEX_BUFFER_SLOTS: u32 = 16;

/// Backend object a handle resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendResource {
    Texture { name: u32, width: u32, height: u32 },
    /// Texture that can also be bound as render target.
    Bitmap { name: u32, width: u32, height: u32 },
    Buffer { name: u32, size: u32 },
    Program { name: u32 },
    InputLayout { name: u32 },
}

impl BackendResource {
    pub fn kind_name(&self) -> &'static str {
        match self {
            BackendResource::Texture { .. } => "texture",
            BackendResource::Bitmap { .. } => "bitmap",
            BackendResource::Buffer { .. } => "buffer",
            BackendResource::Program { .. } => "program",
            BackendResource::InputLayout { .. } => "input layout",
        }
    }

    pub fn native_name(&self) -> u32 {
        match *self {
            BackendResource::Texture { name, .. }
            | BackendResource::Bitmap { name, .. }
            | BackendResource::Buffer { name, .. }
            | BackendResource::Program { name }
            | BackendResource::InputLayout { name } => name,
        }
    }
}

/// Why a single command was skipped.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed arguments: {0}")]
    Decode(#[from] DecodeError),
    #[error("handle {0} does not name a live resource")]
    Unresolved(Handle),
    #[error("handle {handle} is a {actual}, expected {expected}")]
    WrongKind {
        handle: Handle,
        expected: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("unsupported {what} value {raw}")]
    Unsupported { what: &'static str, raw: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("state restore requested without a backup")]
    NoBackup,
    #[error("unknown opcode 0x{0:04X}")]
    UnknownOpcode(u16),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Conditions that stop the dispatcher loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    ListCorrupted(#[from] ListCorrupted),
    #[error("malformed arguments for opcode 0x{opcode:04X}: {source}")]
    Decode {
        opcode: u16,
        #[source]
        source: DecodeError,
    },
}

/// Counters for one [`Dispatcher::run`] invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub lists_executed: u64,
    pub commands_executed: u64,
    pub commands_skipped: u64,
    pub lists_discarded: u64,
}

/// Handler for opcodes the core dispatcher does not know, typically a command set layered on
/// top of this one that shares the queue.
pub trait CommandExtension<B: ?Sized> {
    /// Returns `Ok(false)` if the opcode is unknown to the extension as well.
    fn execute(
        &mut self,
        opcode: u16,
        args: &mut ArgReader<'_>,
        backend: &mut B,
    ) -> Result<bool, CommandError>;
}

#[derive(Clone, Copy, Debug)]
struct DrawState {
    brush: Color,
    pen: PenStyle,
    point_size: f32,
    /// Bitmap currently bound as render target, or `NULL` for the swapchain surface.
    target: Handle,
    target_size: (u32, u32),
    swapchain_size: (u32, u32),
    line_width_supported: bool,
}

#[derive(Clone, Debug)]
struct Backup {
    state: StateSnapshot,
    target: Handle,
    target_size: (u32, u32),
}

fn checked(native: u32, raw: u8, what: &'static str) -> Result<u32, CommandError> {
    if native == NativeEnums::INVALID {
        Err(CommandError::Unsupported {
            what,
            raw: raw.into(),
        })
    } else {
        Ok(native)
    }
}

fn to_box(rect: Rect) -> PixelBox {
    PixelBox::new(rect.top.x, rect.top.y, rect.size.x, rect.size.y)
}

fn dim(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Bottom edge of `rect` measured from the bottom of a target `height` pixels tall.
fn flipped_y(height: u32, rect: Rect) -> Result<i32, CommandError> {
    rect.top
        .y
        .checked_add(rect.size.y)
        .and_then(|bottom| dim(height).checked_sub(bottom))
        .ok_or(CommandError::InvalidArgument("rectangle outside the coordinate range"))
}

pub struct Dispatcher<B: GraphicsBackend + ?Sized> {
    backend: Box<B>,
    resources: HandleTable<BackendResource>,
    backup: Option<Backup>,
    draw: DrawState,
    fences: Arc<DisplayFences>,
    stats: Arc<DispatchStats>,
    extension: Option<Box<dyn CommandExtension<B>>>,
    display_hook: Option<Box<dyn FnMut(&mut B)>>,
}

impl<B: GraphicsBackend + ?Sized> core::fmt::Debug for Dispatcher<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.kind())
            .field("live_resources", &self.resources.len())
            .field("has_backup", &self.backup.is_some())
            .field("draw", &self.draw)
            .finish_non_exhaustive()
    }
}

impl<B: GraphicsBackend + ?Sized> Dispatcher<B> {
    pub fn new(backend: Box<B>) -> Self {
        Self::with_shared(
            backend,
            Arc::new(DisplayFences::new()),
            Arc::new(DispatchStats::new()),
        )
    }

    /// Builds a dispatcher that signals `fences` and counts into `stats`, both shared with the
    /// producer side.
    pub fn with_shared(
        backend: Box<B>,
        fences: Arc<DisplayFences>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        let surface = backend.surface_size();
        Self {
            backend,
            resources: HandleTable::new(),
            backup: None,
            draw: DrawState {
                brush: Color::BLACK,
                pen: PenStyle::Solid,
                point_size: 1.0,
                target: Handle::NULL,
                target_size: surface,
                swapchain_size: surface,
                line_width_supported: true,
            },
            fences,
            stats,
            extension: None,
            display_hook: None,
        }
    }

    pub fn set_extension(&mut self, extension: Box<dyn CommandExtension<B>>) {
        self.extension = Some(extension);
    }

    /// Runs after every successful present, before the display fence is signaled.
    pub fn set_display_hook(&mut self, hook: impl FnMut(&mut B) + 'static) {
        self.display_hook = Some(Box::new(hook));
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> Box<B> {
        self.backend
    }

    pub fn fences(&self) -> &Arc<DisplayFences> {
        &self.fences
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn resources(&self) -> &HandleTable<BackendResource> {
        &self.resources
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    pub fn brush_color(&self) -> Color {
        self.draw.brush
    }

    pub fn pen_style(&self) -> PenStyle {
        self.draw.pen
    }

    pub fn point_size(&self) -> f32 {
        self.draw.point_size
    }

    /// Size of the current render target (bitmap or swapchain surface).
    pub fn target_size(&self) -> (u32, u32) {
        self.draw.target_size
    }

    pub fn line_width_supported(&self) -> bool {
        self.draw.line_width_supported
    }

    /// Consumes lists from `queue` until it is aborted.
    ///
    /// On a fatal error the queue is aborted too, so blocked producers return.
    pub fn run(&mut self, queue: &SubmissionQueue) -> Result<RunSummary, DispatchError> {
        let start = self.stats.snapshot();
        tracing::debug!(capacity = queue.capacity(), "dispatcher loop started");

        while let Some(list) = queue.pop() {
            if let Err(err) = self.execute_list(list) {
                tracing::error!(error = %err, "corrupted command list, halting dispatcher");
                let dropped = queue.abort();
                self.stats.add_lists_discarded(dropped as u64);
                self.fences.abort();
                return Err(err);
            }
        }

        let discarded = queue.discarded();
        self.stats.add_lists_discarded(discarded);
        self.fences.abort();
        let end = self.stats.snapshot();
        let summary = RunSummary {
            lists_executed: end.lists_executed - start.lists_executed,
            commands_executed: end.commands_executed - start.commands_executed,
            commands_skipped: end.commands_skipped - start.commands_skipped,
            lists_discarded: discarded,
        };
        tracing::debug!(?summary, "dispatcher loop finished");
        Ok(summary)
    }

    /// Executes every record of `list` in order, releasing each one after it ran.
    pub fn execute_list(&mut self, mut list: CommandList) -> Result<(), DispatchError> {
        let _span = tracing::trace_span!("command_list", len = list.len()).entered();
        while let Some(cmd) = list.take_front()? {
            self.execute(&cmd)?;
        }
        self.stats.inc_lists_executed();
        Ok(())
    }

    pub fn execute(&mut self, cmd: &Command) -> Result<(), DispatchError> {
        let opcode = cmd.raw_opcode();
        let mut args = cmd.args().reader();
        match self.apply(opcode, &mut args) {
            Ok(()) => {
                self.stats.inc_commands_executed();
                Ok(())
            }
            Err(CommandError::Decode(source)) => {
                tracing::error!(opcode, %source, "undecodable command arguments");
                Err(DispatchError::Decode { opcode, source })
            }
            Err(err) => {
                tracing::warn!(opcode, error = %err, "command skipped");
                self.stats.inc_commands_skipped();
                Ok(())
            }
        }
    }

    /// Destroys every live resource, e.g. before the backend is torn down. Returns how many
    /// were released.
    pub fn release_all(&mut self) -> usize {
        let live = self.resources.drain_live();
        let n = live.len();
        for (handle, resource) in live {
            if let Err(err) = self.destroy_native(&resource) {
                tracing::warn!(%handle, error = %err, "failed to destroy resource");
            }
        }
        self.draw.target = Handle::NULL;
        self.draw.target_size = self.draw.swapchain_size;
        n
    }

    fn resolve(&self, handle: Handle) -> Result<&BackendResource, CommandError> {
        self.resources
            .resolve(handle)
            .ok_or(CommandError::Unresolved(handle))
    }

    fn wrong_kind(handle: Handle, expected: &'static str, actual: &BackendResource) -> CommandError {
        CommandError::WrongKind {
            handle,
            expected,
            actual: actual.kind_name(),
        }
    }

    /// Texture or bitmap: `(name, width, height)`.
    fn texture_info(&self, handle: Handle) -> Result<(u32, u32, u32), CommandError> {
        match *self.resolve(handle)? {
            BackendResource::Texture {
                name,
                width,
                height,
            }
            | BackendResource::Bitmap {
                name,
                width,
                height,
            } => Ok((name, width, height)),
            ref other => Err(Self::wrong_kind(handle, "a texture", other)),
        }
    }

    /// Like `texture_info` but `NULL` resolves to name `0`.
    fn texture_name(&self, handle: Handle) -> Result<u32, CommandError> {
        if handle.is_null() {
            return Ok(0);
        }
        Ok(self.texture_info(handle)?.0)
    }

    fn buffer_name(&self, handle: Handle) -> Result<u32, CommandError> {
        if handle.is_null() {
            return Ok(0);
        }
        match *self.resolve(handle)? {
            BackendResource::Buffer { name, .. } => Ok(name),
            ref other => Err(Self::wrong_kind(handle, "a buffer", other)),
        }
    }

    fn program_name(&self, handle: Handle) -> Result<u32, CommandError> {
        if handle.is_null() {
            return Ok(0);
        }
        match *self.resolve(handle)? {
            BackendResource::Program { name } => Ok(name),
            ref other => Err(Self::wrong_kind(handle, "a program", other)),
        }
    }

    fn input_layout_name(&self, handle: Handle) -> Result<u32, CommandError> {
        if handle.is_null() {
            return Ok(0);
        }
        match *self.resolve(handle)? {
            BackendResource::InputLayout { name } => Ok(name),
            ref other => Err(Self::wrong_kind(handle, "an input layout", other)),
        }
    }

    /// Records a freshly created backend object under `handle`, destroying it again if the
    /// handle cannot be bound.
    fn adopt(&mut self, handle: Handle, resource: BackendResource) -> Result<(), CommandError> {
        if let Err(err) = self.resources.bind(handle, resource.clone()) {
            if let Err(destroy_err) = self.destroy_native(&resource) {
                tracing::warn!(%handle, error = %destroy_err, "failed to destroy orphaned resource");
            }
            return Err(err.into());
        }
        tracing::trace!(%handle, kind = resource.kind_name(), "resource created");
        Ok(())
    }

    fn destroy_native(&mut self, resource: &BackendResource) -> Result<(), BackendError> {
        match *resource {
            BackendResource::Texture { name, .. } | BackendResource::Bitmap { name, .. } => {
                self.backend.destroy_texture(name)
            }
            BackendResource::Buffer { name, .. } => self.backend.destroy_buffer(name),
            BackendResource::Program { name } => self.backend.destroy_program(name),
            BackendResource::InputLayout { name } => self.backend.destroy_input_layout(name),
        }
    }

    fn apply(&mut self, raw: u16, r: &mut ArgReader<'_>) -> Result<(), CommandError> {
        let Some(opcode) = Opcode::from_raw(raw) else {
            return self.apply_extension(raw, r);
        };
        let enums = self.backend.enums();

        match opcode {
            Opcode::CreateTexture => {
                let handle: Handle = r.pop()?;
                let (width, height, format_raw) = (r.pop::<u32>()?, r.pop::<u32>()?, r.pop::<u8>()?);
                let pixels = r.pop_bytes()?;
                r.finish()?;
                let format = checked(enums.texture_format(format_raw), format_raw, "texture format")?;
                let initial = (!pixels.is_empty()).then_some(pixels);
                let name = self.backend.create_texture(width, height, format, initial)?;
                self.adopt(
                    handle,
                    BackendResource::Texture {
                        name,
                        width,
                        height,
                    },
                )?;
            }
            Opcode::UpdateTexture => {
                let (handle, region): (Handle, Rect) = (r.pop()?, r.pop()?);
                let pixels = r.pop_bytes()?;
                r.finish()?;
                let (name, _, _) = self.texture_info(handle)?;
                self.backend.update_texture(name, to_box(region), pixels)?;
            }
            Opcode::SetTextureFilter => {
                let (handle, min_raw, mag_raw) = (r.pop::<Handle>()?, r.pop::<u8>()?, r.pop::<u8>()?);
                r.finish()?;
                let min = checked(enums.filter(min_raw), min_raw, "filter")?;
                let mag = checked(enums.filter(mag_raw), mag_raw, "filter")?;
                let (name, _, _) = self.texture_info(handle)?;
                self.backend.set_texture_filter(name, min, mag)?;
            }
            Opcode::CreateBuffer => {
                let (handle, size, usage_raw) = (r.pop::<Handle>()?, r.pop::<u32>()?, r.pop::<u8>()?);
                let data = r.pop_bytes()?;
                r.finish()?;
                let usage = checked(enums.buffer_usage(usage_raw), usage_raw, "buffer usage")?;
                let initial = (!data.is_empty()).then_some(data);
                let name = self.backend.create_buffer(size, usage, initial)?;
                self.adopt(handle, BackendResource::Buffer { name, size })?;
            }
            Opcode::UpdateBuffer => {
                let (handle, offset) = (r.pop::<Handle>()?, r.pop::<u32>()?);
                let data = r.pop_bytes()?;
                r.finish()?;
                if handle.is_null() {
                    return Err(CommandError::Unresolved(handle));
                }
                let name = self.buffer_name(handle)?;
                self.backend.update_buffer(name, offset, data)?;
            }
            Opcode::CreateProgram => {
                let handle: Handle = r.pop()?;
                let (vertex, fragment) = (r.pop_bytes()?, r.pop_bytes()?);
                r.finish()?;
                let name = self.backend.create_program(vertex, fragment)?;
                self.adopt(handle, BackendResource::Program { name })?;
            }
            Opcode::CreateInputLayout => {
                let handle: Handle = r.pop()?;
                let attribs = r.pop_vec::<VertexAttrib>()?;
                r.finish()?;
                let name = self.backend.create_input_layout(&attribs)?;
                self.adopt(handle, BackendResource::InputLayout { name })?;
            }
            Opcode::CreateBitmap => {
                let (handle, width, height) = (r.pop::<Handle>()?, r.pop::<u32>()?, r.pop::<u32>()?);
                r.finish()?;
                let rgba = TextureFormat::Rgba8.to_raw();
                let format = checked(enums.texture_format(rgba), rgba, "texture format")?;
                let name = self.backend.create_texture(width, height, format, None)?;
                self.adopt(
                    handle,
                    BackendResource::Bitmap {
                        name,
                        width,
                        height,
                    },
                )?;
            }
            Opcode::DestroyResource => {
                let handle: Handle = r.pop()?;
                r.finish()?;
                let resource = self.resources.release(handle)?;
                if handle == self.draw.target {
                    self.draw.target = Handle::NULL;
                    self.draw.target_size = self.draw.swapchain_size;
                }
                self.destroy_native(&resource)?;
            }

            Opcode::SetViewport => {
                let rect: Rect = r.pop()?;
                r.finish()?;
                // Bottom-left origin on the backend side.
                let y = flipped_y(self.draw.target_size.1, rect)?;
                self.backend
                    .viewport(PixelBox::new(rect.top.x, y, rect.size.x, rect.size.y))?;
            }
            Opcode::ClipRect => {
                let rect: Rect = r.pop()?;
                r.finish()?;
                let y = if rect.size.y > 0 {
                    flipped_y(self.draw.target_size.1, rect)?
                } else {
                    rect.top.y
                };
                self.backend
                    .scissor(PixelBox::new(rect.top.x, y, rect.size.x, rect.size.y))?;
            }
            Opcode::SetFeature => {
                let (raw_feature, enabled) = (r.pop::<u8>()?, r.pop_bool()?);
                r.finish()?;
                let cap = checked(enums.feature(raw_feature), raw_feature, "feature")?;
                self.backend.set_enabled(cap, enabled)?;
            }
            Opcode::BlendFormula => {
                let mut raw = [0u8; 6];
                for v in &mut raw {
                    *v = r.pop()?;
                }
                r.finish()?;
                let eq_rgb = checked(enums.blend_equation(raw[0]), raw[0], "blend equation")?;
                let eq_alpha = checked(enums.blend_equation(raw[1]), raw[1], "blend equation")?;
                let mut factors = [0u32; 4];
                for (f, &v) in factors.iter_mut().zip(&raw[2..]) {
                    *f = checked(enums.blend_factor(v), v, "blend factor")?;
                }
                self.backend.blend_equation_separate(eq_rgb, eq_alpha)?;
                self.backend
                    .blend_func_separate(factors[0], factors[1], factors[2], factors[3])?;
            }
            Opcode::StencilAction => {
                let mut raw = [0u8; 4];
                for v in &mut raw {
                    *v = r.pop()?;
                }
                r.finish()?;
                self.backend.stencil_op_separate(
                    enums.face(raw[0]),
                    enums.stencil_action(raw[1]),
                    enums.stencil_action(raw[2]),
                    enums.stencil_action(raw[3]),
                )?;
            }
            Opcode::StencilPassCondition => {
                let (face, func) = (r.pop::<u8>()?, r.pop::<u8>()?);
                let (reference, mask) = (r.pop::<i32>()?, r.pop::<u32>()?);
                r.finish()?;
                self.backend.stencil_func_separate(
                    enums.face(face),
                    enums.condition_func(func),
                    reference,
                    mask,
                )?;
            }
            Opcode::StencilMask => {
                let (face, mask) = (r.pop::<u8>()?, r.pop::<u32>()?);
                r.finish()?;
                self.backend.stencil_mask_separate(enums.face(face), mask)?;
            }
            Opcode::DepthMask => {
                let write = r.pop_bool()?;
                r.finish()?;
                self.backend.depth_mask(write)?;
            }
            Opcode::DepthFunc => {
                let func: u8 = r.pop()?;
                r.finish()?;
                self.backend.depth_func(enums.condition_func(func))?;
            }
            Opcode::CullFace => {
                let face: u8 = r.pop()?;
                r.finish()?;
                self.backend.cull_face(enums.face(face))?;
            }
            Opcode::FrontFaceRule => {
                let rule: u8 = r.pop()?;
                r.finish()?;
                let native = checked(enums.front_face_rule(rule), rule, "front face rule")?;
                self.backend.front_face(native)?;
            }
            Opcode::ColorMask => {
                let bits: u8 = r.pop()?;
                r.finish()?;
                let mask = ColorMask::from_bits(bits).ok_or(CommandError::Unsupported {
                    what: "color mask",
                    raw: bits.into(),
                })?;
                self.backend.color_mask(mask)?;
            }
            Opcode::LineWidth => {
                let width: f32 = r.pop()?;
                r.finish()?;
                self.set_line_width(width)?;
            }
            Opcode::DepthBias => {
                let (factor, units) = (r.pop::<f32>()?, r.pop::<f32>()?);
                r.finish()?;
                self.backend.polygon_offset(factor, units)?;
            }
            Opcode::PointSize => {
                let size: f32 = r.pop()?;
                r.finish()?;
                self.backend.point_size(size)?;
                self.draw.point_size = size;
            }
            Opcode::PenStyle => {
                let raw_style: u8 = r.pop()?;
                r.finish()?;
                self.draw.pen = PenStyle::from_raw(raw_style).ok_or(CommandError::Unsupported {
                    what: "pen style",
                    raw: raw_style.into(),
                })?;
            }
            Opcode::BrushColor => {
                let color: Color = r.pop()?;
                r.finish()?;
                self.draw.brush = color;
            }
            Opcode::UseProgram => {
                let handle: Handle = r.pop()?;
                r.finish()?;
                let name = self.program_name(handle)?;
                self.backend.use_program(name)?;
            }
            Opcode::BindTexture => {
                let (unit, handle) = (r.pop::<u32>()?, r.pop::<Handle>()?);
                r.finish()?;
                let name = self.texture_name(handle)?;
                self.backend.active_texture(unit)?;
                self.backend.bind_texture(name)?;
            }
            Opcode::SetUniform => {
                let (location, ty_raw) = (r.pop::<i32>()?, r.pop::<u8>()?);
                let data = r.pop_bytes()?;
                r.finish()?;
                let ty = UniformType::from_raw(ty_raw).ok_or(CommandError::Unsupported {
                    what: "uniform type",
                    raw: ty_raw.into(),
                })?;
                self.backend.set_uniform(location, ty, data)?;
            }
            Opcode::SetTextureForShader => {
                let (unit, location, handle) = (r.pop::<u32>()?, r.pop::<i32>()?, r.pop::<Handle>()?);
                r.finish()?;
                let name = self.texture_name(handle)?;
                let sampler = i32::try_from(unit)
                    .map_err(|_| CommandError::InvalidArgument("texture unit out of range"))?;
                self.backend.active_texture(unit)?;
                self.backend.bind_texture(name)?;
                self.backend
                    .set_uniform(location, UniformType::Int, &sampler.to_ne_bytes())?;
            }
            Opcode::BindVertexBuffers => {
                let first_slot: u32 = r.pop()?;
                let buffers = r.pop_vec::<Handle>()?;
                let offsets = r.pop_vec::<u32>()?;
                r.finish()?;
                self.bind_vertex_buffers(first_slot, &buffers, &offsets)?;
            }
            Opcode::BindIndexBuffer => {
                let handle: Handle = r.pop()?;
                r.finish()?;
                let name = self.buffer_name(handle)?;
                self.backend.bind_buffer(enums.element_array_buffer, name)?;
            }
            Opcode::BindInputLayout => {
                let handle: Handle = r.pop()?;
                r.finish()?;
                let name = self.input_layout_name(handle)?;
                self.backend.bind_input_layout(name)?;
            }
            Opcode::BindBitmap => {
                let handle: Handle = r.pop()?;
                r.finish()?;
                self.bind_bitmap(handle)?;
            }
            Opcode::SetSwapchainSize => {
                let (width, height) = (r.pop::<u32>()?, r.pop::<u32>()?);
                r.finish()?;
                self.backend.resize_surface(width, height)?;
                self.draw.swapchain_size = (width, height);
                if self.draw.target.is_null() {
                    self.draw.target_size = (width, height);
                }
            }

            Opcode::Clear => {
                let color: Color = r.pop()?;
                let (depth, stencil, bits) = (r.pop::<f32>()?, r.pop::<i32>()?, r.pop::<u8>()?);
                r.finish()?;
                let bits = ClearBits::from_bits(bits).ok_or(CommandError::Unsupported {
                    what: "clear bits",
                    raw: bits.into(),
                })?;
                self.backend.clear(bits, color, depth, stencil)?;
            }
            Opcode::DrawIndexed => {
                let (mode, count) = (r.pop::<u8>()?, r.pop::<u32>()?);
                let (format, offset) = (r.pop::<u8>()?, r.pop::<u32>()?);
                r.finish()?;
                let mode = checked(enums.primitive_mode(mode), mode, "primitive mode")?;
                let index_type = checked(enums.index_format(format), format, "index format")?;
                self.backend.draw_elements(mode, count, index_type, offset)?;
                self.stats.inc_draw_calls();
            }
            Opcode::DrawArray => {
                let (mode, first, count) = (r.pop::<u8>()?, r.pop::<u32>()?, r.pop::<u32>()?);
                r.finish()?;
                let mode = checked(enums.primitive_mode(mode), mode, "primitive mode")?;
                self.backend.draw_arrays(mode, first, count)?;
                self.stats.inc_draw_calls();
            }
            Opcode::DrawRectangle => {
                let rect: Rect = r.pop()?;
                r.finish()?;
                self.backend.fill_rect(to_box(rect), self.draw.brush)?;
                self.stats.inc_draw_calls();
            }
            Opcode::DrawLine => {
                let (start, end) = (r.pop::<Point>()?, r.pop::<Point>()?);
                r.finish()?;
                self.stroke(&[start, end], false)?;
            }
            Opcode::DrawPolygon => {
                let points = r.pop_vec::<Point>()?;
                r.finish()?;
                if points.len() < 2 {
                    return Err(CommandError::InvalidArgument("polygon needs at least two points"));
                }
                self.stroke(&points, true)?;
            }
            Opcode::DrawBitmap => {
                let handle: Handle = r.pop()?;
                let (dest, source, flags) = (r.pop::<Rect>()?, r.pop::<Rect>()?, r.pop::<u32>()?);
                r.finish()?;
                self.draw_bitmap(handle, dest, source, flags)?;
            }

            Opcode::BackupState => {
                r.finish()?;
                let previous = self.backup.replace(Backup {
                    state: StateSnapshot::capture(&*self.backend),
                    target: self.draw.target,
                    target_size: self.draw.target_size,
                });
                if previous.is_some() {
                    tracing::debug!("state backup slot overwritten");
                }
            }
            Opcode::RestoreState => {
                r.finish()?;
                let backup = self.backup.as_ref().ok_or(CommandError::NoBackup)?;
                self.draw.target = backup.target;
                self.draw.target_size = backup.target_size;
                backup.state.load(&mut *self.backend)?;
            }
            Opcode::Display => {
                let fence: u64 = r.pop()?;
                r.finish()?;
                self.display(fence)?;
            }
        }
        Ok(())
    }

    fn apply_extension(&mut self, raw: u16, r: &mut ArgReader<'_>) -> Result<(), CommandError> {
        if let Some(extension) = self.extension.as_mut() {
            if extension.execute(raw, r, &mut *self.backend)? {
                return Ok(());
            }
        }
        Err(CommandError::UnknownOpcode(raw))
    }

    fn set_line_width(&mut self, width: f32) -> Result<(), CommandError> {
        if !self.draw.line_width_supported {
            tracing::trace!(width, "line width ignored, backend has no adjustable width");
            return Ok(());
        }
        match self.backend.line_width(width) {
            Err(err @ BackendError::Unsupported(_)) => {
                self.draw.line_width_supported = false;
                tracing::info!("adjustable line width unavailable, disabling for this session");
                Err(err.into())
            }
            Err(BackendError::OutOfBounds) => {
                tracing::trace!(width, "line width outside the backend range, ignored");
                Ok(())
            }
            other => other.map_err(CommandError::from),
        }
    }

    fn bind_vertex_buffers(
        &mut self,
        first_slot: u32,
        buffers: &[Handle],
        offsets: &[u32],
    ) -> Result<(), CommandError> {
        if buffers.len() != offsets.len() {
            return Err(CommandError::InvalidArgument(
                "vertex buffer and offset counts differ",
            ));
        }
        if u64::from(first_slot) + buffers.len() as u64 >= u64::from(MAX_VERTEX_BUFFER_SLOTS) {
            return Err(CommandError::InvalidArgument("vertex buffer slots out of range"));
        }
        for ((slot, &handle), &offset) in (first_slot..).zip(buffers).zip(offsets) {
            let bound = self.buffer_name(handle).and_then(|name| {
                self.backend
                    .bind_vertex_buffer(slot, name, offset)
                    .map_err(CommandError::from)
            });
            if let Err(err) = bound {
                tracing::warn!(slot, %handle, error = %err, "vertex buffer binding skipped");
            }
        }
        Ok(())
    }

    fn bind_bitmap(&mut self, handle: Handle) -> Result<(), CommandError> {
        if handle.is_null() {
            self.backend.bind_framebuffer(0)?;
            self.draw.target = Handle::NULL;
            self.draw.target_size = self.draw.swapchain_size;
            return Ok(());
        }
        let (name, width, height) = match *self.resolve(handle)? {
            BackendResource::Bitmap {
                name,
                width,
                height,
            } => (name, width, height),
            ref other => return Err(Self::wrong_kind(handle, "a bitmap", other)),
        };
        self.backend.bind_framebuffer(name)?;
        self.draw.target = handle;
        self.draw.target_size = (width, height);
        Ok(())
    }

    fn stroke(&mut self, points: &[Point], closed: bool) -> Result<(), CommandError> {
        let Some(stipple) = self.draw.pen.stipple_pattern() else {
            return Ok(());
        };
        self.backend
            .draw_lines(points, self.draw.brush, stipple, closed)?;
        self.stats.inc_draw_calls();
        Ok(())
    }

    fn draw_bitmap(
        &mut self,
        handle: Handle,
        dest: Rect,
        source: Rect,
        flags: u32,
    ) -> Result<(), CommandError> {
        let flags = BitmapDrawFlags::from_bits(flags).ok_or(CommandError::Unsupported {
            what: "bitmap draw flags",
            raw: flags,
        })?;
        let (name, width, height) = self.texture_info(handle)?;
        let source = if source.is_empty() {
            PixelBox::new(0, 0, dim(width), dim(height))
        } else {
            to_box(source)
        };
        let dest = if dest.is_empty() {
            PixelBox::new(dest.top.x, dest.top.y, source.width, source.height)
        } else {
            to_box(dest)
        };
        let options = BlitOptions {
            tint: flags
                .contains(BitmapDrawFlags::USE_BRUSH)
                .then_some(self.draw.brush),
            flags,
        };
        self.backend.blit(name, dest, source, options)?;
        self.stats.inc_draw_calls();
        Ok(())
    }

    fn display(&mut self, fence: u64) -> Result<(), CommandError> {
        let result = self.backend.present();
        if result.is_ok() {
            self.stats.inc_presents();
            if let Some(hook) = self.display_hook.as_mut() {
                hook(&mut *self.backend);
            }
        }
        if !self.fences.signal(fence, result.clone()) {
            tracing::warn!(fence, "display fence was not outstanding");
        }
        result.map_err(CommandError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{gl, BackendCall, SoftBackend};
    use crate::builder::CommandBuilder;
    use crate::cmd::ArgBuffer;
    use crate::handle::HandleAllocator;
    use crate::types::{Feature, IndexFormat, PrimitiveMode};
    use std::cell::Cell;
    use std::rc::Rc;

    fn setup() -> (Dispatcher<SoftBackend>, CommandBuilder) {
        let dispatcher = Dispatcher::new(Box::new(SoftBackend::new(64, 32)));
        let builder = CommandBuilder::new(HandleAllocator::new(), dispatcher.fences().clone());
        (dispatcher, builder)
    }

    #[test]
    fn unresolved_handles_skip_only_the_offending_command() {
        let (mut d, mut b) = setup();
        b.use_program(Handle(77)).set_feature(Feature::Blend, true);
        d.execute_list(b.finish()).unwrap();

        assert!(d.backend().is_enabled(gl::BLEND));
        let stats = d.stats().snapshot();
        assert_eq!(stats.commands_skipped, 1);
        assert_eq!(stats.commands_executed, 1);
    }

    #[test]
    fn unknown_opcodes_go_to_the_extension() {
        struct Counter(Rc<Cell<u32>>);
        impl CommandExtension<SoftBackend> for Counter {
            fn execute(
                &mut self,
                opcode: u16,
                args: &mut ArgReader<'_>,
                _backend: &mut SoftBackend,
            ) -> Result<bool, CommandError> {
                if opcode != 0x8001 {
                    return Ok(false);
                }
                self.0.set(self.0.get() + args.pop::<u32>()?);
                Ok(true)
            }
        }

        let (mut d, mut b) = setup();
        let seen = Rc::new(Cell::new(0));
        d.set_extension(Box::new(Counter(seen.clone())));
        let mut args = ArgBuffer::new();
        args.push(5u32);
        b.push_raw(0x8001, args).push_raw(0x8002, ArgBuffer::new());
        d.execute_list(b.finish()).unwrap();

        assert_eq!(seen.get(), 5);
        assert_eq!(d.stats().snapshot().commands_skipped, 1);
    }

    #[test]
    fn truncated_arguments_are_fatal() {
        let (mut d, mut b) = setup();
        let mut args = ArgBuffer::new();
        args.push(1u8);
        b.push_raw(Opcode::SetViewport.raw(), args);
        let err = d.execute_list(b.finish()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Decode {
                opcode: 0x0100,
                ..
            }
        ));
    }

    #[test]
    fn broken_list_chain_is_fatal() {
        let (mut d, mut b) = setup();
        b.set_feature(Feature::Blend, true);
        let mut list = b.finish();
        list.set_len_for_test(3);
        assert!(matches!(
            d.execute_list(list),
            Err(DispatchError::ListCorrupted(_))
        ));
        assert!(d.backend().is_enabled(gl::BLEND), "records before the break ran");
    }

    #[test]
    fn line_width_is_disabled_after_first_unsupported() {
        let (mut d, mut b) = setup();
        d.backend_mut().set_max_line_width(None);
        b.set_line_width(2.0).set_line_width(3.0);
        d.execute_list(b.finish()).unwrap();

        assert!(!d.line_width_supported());
        let stats = d.stats().snapshot();
        assert_eq!(stats.commands_skipped, 1);
        assert_eq!(stats.commands_executed, 1);
    }

    #[test]
    fn oversized_line_width_keeps_later_widths_working() {
        let (mut d, mut b) = setup();
        d.backend_mut().set_max_line_width(Some(4.0));
        b.set_line_width(8.0).set_line_width(2.0);
        d.execute_list(b.finish()).unwrap();

        assert!(d.line_width_supported());
        assert_eq!(d.backend().line_width_value(), 2.0);
        assert_eq!(d.stats().snapshot().commands_skipped, 0);
    }

    #[test]
    fn extreme_rectangles_are_skipped_not_wrapped() {
        let (mut d, mut b) = setup();
        b.set_viewport(Rect::new(0, i32::MAX, 4, 4))
            .clip_rect(Rect::new(0, i32::MIN, 4, 4))
            .set_viewport(Rect::new(0, 0, 4, 4));
        d.execute_list(b.finish()).unwrap();

        assert_eq!(d.stats().snapshot().commands_skipped, 2);
        assert_eq!(
            d.backend_mut().take_calls(),
            vec![BackendCall::Viewport(PixelBox::new(0, 28, 4, 4))]
        );
    }

    #[test]
    fn viewport_and_clip_rect_flip_to_bottom_left_origin() {
        let (mut d, mut b) = setup();
        b.set_viewport(Rect::new(0, 2, 10, 8))
            .clip_rect(Rect::new(4, 4, 8, 8))
            .clip_rect(Rect::new(1, 1, 0, 0));
        d.execute_list(b.finish()).unwrap();

        let calls = d.backend_mut().take_calls();
        assert_eq!(
            calls,
            vec![
                BackendCall::Viewport(PixelBox::new(0, 22, 10, 8)),
                BackendCall::Scissor(PixelBox::new(4, 20, 8, 8)),
                BackendCall::Scissor(PixelBox::new(1, 1, 0, 0)),
            ]
        );
    }

    #[test]
    fn vertex_buffer_range_hits_the_slot_limit() {
        let (mut d, mut b) = setup();
        let vb = b.create_buffer(64, crate::types::BufferUsage::Static, &[]);
        b.bind_vertex_buffers(14, &[vb, vb], &[0, 16])
            .bind_vertex_buffers(0, &[vb, Handle(999)], &[0, 0]);
        d.execute_list(b.finish()).unwrap();

        let stats = d.stats().snapshot();
        assert_eq!(stats.commands_skipped, 1, "14 + 2 reaches the limit");
        let binds: Vec<_> = d
            .backend_mut()
            .take_calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::BindVertexBuffer { .. }))
            .collect();
        assert_eq!(binds.len(), 1, "unresolved buffer skipped individually");
    }

    #[test]
    fn restore_without_backup_is_skipped() {
        let (mut d, mut b) = setup();
        b.restore_state();
        d.execute_list(b.finish()).unwrap();
        assert_eq!(d.stats().snapshot().commands_skipped, 1);
        assert!(!d.has_backup());
    }

    #[test]
    fn display_presents_runs_hook_and_signals_once() {
        let (mut d, mut b) = setup();
        let hooked = Rc::new(Cell::new(0));
        let h = hooked.clone();
        d.set_display_hook(move |backend: &mut SoftBackend| {
            assert_eq!(backend.presents(), 1);
            h.set(h.get() + 1);
        });

        b.clear(Color::BLACK, 1.0, 0, ClearBits::COLOR);
        let fence = b.display();
        d.execute_list(b.finish()).unwrap();

        assert_eq!(hooked.get(), 1);
        assert_eq!(d.fences().signal_count(), 1);
        d.fences().wait(fence).unwrap();
        assert_eq!(d.stats().snapshot().presents, 1);
    }

    #[test]
    fn destroying_a_resource_invalidates_its_handle() {
        let (mut d, mut b) = setup();
        let prog = b.create_program(b"vs", b"fs");
        b.use_program(prog).destroy(prog).use_program(prog);
        d.execute_list(b.finish()).unwrap();

        assert!(d.resources().resolve(prog).is_none());
        assert_eq!(d.backend().bound_program(), 0);
        assert_eq!(d.stats().snapshot().commands_skipped, 1);
        assert_eq!(d.backend().live_objects(), 0);
    }

    #[test]
    fn bitmaps_become_render_targets() {
        let (mut d, mut b) = setup();
        let bmp = b.create_bitmap(8, 4);
        b.bind_bitmap(bmp)
            .set_brush_color(Color::WHITE)
            .draw_rectangle(Rect::new(0, 0, 2, 2))
            .bind_bitmap(Handle::NULL)
            .draw_bitmap(bmp, Rect::new(10, 10, 0, 0), Rect::default(), BitmapDrawFlags::empty());
        let name = {
            d.execute_list(b.finish()).unwrap();
            d.resources().resolve(bmp).unwrap().native_name()
        };

        assert_eq!(d.target_size(), (64, 32));
        assert_eq!(d.backend().texture_pixel(name, 1, 1), Some([0xFF; 4]));
        assert_eq!(d.backend().surface_pixel(11, 11), Some([0xFF; 4]));
        assert_eq!(d.backend().surface_pixel(12, 12), Some([0; 4]));
        assert_eq!(d.stats().snapshot().commands_skipped, 0);
    }

    #[test]
    fn unsupported_enum_values_are_skipped() {
        let (mut d, mut b) = setup();
        let mut args = ArgBuffer::new();
        args.push(42u8).push(6u32).push(IndexFormat::U16.to_raw()).push(0u32);
        b.push_raw(Opcode::DrawIndexed.raw(), args);
        b.draw_array(PrimitiveMode::Points, 0, 1);
        d.execute_list(b.finish()).unwrap();
        // Both skipped: the first for its primitive mode, the second for lacking a program.
        assert_eq!(d.stats().snapshot().commands_skipped, 2);
        assert_eq!(d.backend().draw_calls(), 0);
    }
}
