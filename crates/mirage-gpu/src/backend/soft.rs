use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::state::{self, clamp_dim, TrackedState, TEXTURE_UNITS, VERTEX_SLOTS};
use super::{
    gl, BackendError, BackendKind, BlendState, BlitOptions, GraphicsBackend, NativeEnums,
    PixelBox, PresentedFrame,
};
use crate::types::{
    BitmapDrawFlags, ClearBits, Color, ColorMask, Point, UniformType, VertexAttrib,
};

/// One successful backend call, as recorded by [`SoftBackend`].
#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    CreateTexture {
        name: u32,
        width: u32,
        height: u32,
        format: u32,
    },
    UpdateTexture {
        texture: u32,
        region: PixelBox,
    },
    SetTextureFilter {
        texture: u32,
        min: u32,
        mag: u32,
    },
    DestroyTexture(u32),
    CreateBuffer {
        name: u32,
        size: u32,
        usage: u32,
    },
    UpdateBuffer {
        buffer: u32,
        offset: u32,
        len: usize,
    },
    DestroyBuffer(u32),
    CreateProgram(u32),
    DestroyProgram(u32),
    CreateInputLayout {
        name: u32,
        attribs: usize,
    },
    DestroyInputLayout(u32),
    UseProgram(u32),
    ActiveTexture(u32),
    BindTexture(u32),
    BindBuffer {
        target: u32,
        buffer: u32,
    },
    BindVertexBuffer {
        slot: u32,
        buffer: u32,
        offset: u32,
    },
    BindInputLayout(u32),
    BindFramebuffer(u32),
    BlendEquation {
        rgb: u32,
        alpha: u32,
    },
    BlendFunc {
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    },
    SetEnabled {
        cap: u32,
        enabled: bool,
    },
    Viewport(PixelBox),
    Scissor(PixelBox),
    StencilOp {
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    },
    StencilFunc {
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    },
    StencilMask {
        face: u32,
        mask: u32,
    },
    DepthMask(bool),
    DepthFunc(u32),
    CullFace(u32),
    FrontFace(u32),
    ColorMask(ColorMask),
    LineWidth(f32),
    PointSize(f32),
    PolygonOffset {
        factor: f32,
        units: f32,
    },
    SetUniform {
        location: i32,
        ty: UniformType,
        len: usize,
    },
    Clear {
        bits: ClearBits,
        color: Color,
        depth: f32,
        stencil: i32,
    },
    DrawElements {
        mode: u32,
        count: u32,
        index_type: u32,
        offset: u32,
    },
    DrawArrays {
        mode: u32,
        first: u32,
        count: u32,
    },
    FillRect {
        rect: PixelBox,
        color: Color,
    },
    DrawLines {
        points: Vec<Point>,
        stipple: u16,
        closed: bool,
    },
    Blit {
        texture: u32,
        dest: PixelBox,
        source: PixelBox,
    },
    Present,
    ResizeSurface {
        width: u32,
        height: u32,
    },
}

/// Shared, cloneable call log.
///
/// Clones observe the same log, so a handle kept by a test stays valid after the backend has
/// been moved onto the dispatcher thread.
#[derive(Clone, Debug, Default)]
pub struct CallTrace {
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: BackendCall) {
        self.lock().push(call);
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<BackendCall> {
        core::mem::take(&mut *self.lock())
    }

    pub fn snapshot(&self) -> Vec<BackendCall> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Clone, Debug)]
struct SoftTexture {
    width: u32,
    height: u32,
    format: u32,
    min_filter: u32,
    mag_filter: u32,
    /// Always stored as RGBA8, row-major, top-left origin.
    rgba: Vec<u8>,
}

impl SoftTexture {
    fn blank(width: u32, height: u32, format: u32) -> Self {
        Self {
            width,
            height,
            format,
            min_filter: gl::LINEAR,
            mag_filter: gl::LINEAR,
            rgba: vec![0; width as usize * height as usize * 4],
        }
    }

    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let p = &self.rgba[i..i + 4];
        [p[0], p[1], p[2], p[3]].map(|c| f32::from(c) / 255.0)
    }
}

fn format_bpp(format: u32) -> Option<usize> {
    match format {
        gl::RED => Some(1),
        gl::RGB => Some(3),
        gl::RGBA => Some(4),
        _ => None,
    }
}

/// Expands `src` texels of `format` into RGBA8.
fn expand_to_rgba(format: u32, src: &[u8], dst: &mut [u8]) {
    let bpp = format_bpp(format).unwrap_or(4);
    for (s, d) in src.chunks_exact(bpp).zip(dst.chunks_exact_mut(4)) {
        match bpp {
            1 => d.copy_from_slice(&[s[0], 0, 0, 0xFF]),
            3 => d.copy_from_slice(&[s[0], s[1], s[2], 0xFF]),
            _ => d.copy_from_slice(s),
        }
    }
}

#[derive(Clone, Debug)]
struct SoftBuffer {
    usage: u32,
    data: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
struct SoftProgram {
    uniforms: HashMap<i32, (UniformType, Vec<u8>)>,
}

fn blend_factor(factor: u32, src: [f32; 4], dst: [f32; 4], channel: usize) -> f32 {
    match factor {
        gl::ZERO => 0.0,
        gl::ONE => 1.0,
        gl::SRC_COLOR => src[channel],
        gl::ONE_MINUS_SRC_COLOR => 1.0 - src[channel],
        gl::SRC_ALPHA => src[3],
        gl::ONE_MINUS_SRC_ALPHA => 1.0 - src[3],
        gl::DST_ALPHA => dst[3],
        gl::ONE_MINUS_DST_ALPHA => 1.0 - dst[3],
        gl::DST_COLOR => dst[channel],
        gl::ONE_MINUS_DST_COLOR => 1.0 - dst[channel],
        gl::SRC_ALPHA_SATURATE if channel == 3 => 1.0,
        gl::SRC_ALPHA_SATURATE => src[3].min(1.0 - dst[3]),
        _ => 0.0,
    }
}

fn blend(state: &BlendState, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (i, o) in out.iter_mut().enumerate() {
        let (eq, sf, df) = if i < 3 {
            (state.equation_rgb, state.src_rgb, state.dst_rgb)
        } else {
            (state.equation_alpha, state.src_alpha, state.dst_alpha)
        };
        let s = src[i] * blend_factor(sf, src, dst, i);
        let d = dst[i] * blend_factor(df, src, dst, i);
        *o = match eq {
            gl::FUNC_SUBTRACT => s - d,
            gl::FUNC_REVERSE_SUBTRACT => d - s,
            _ => s + d,
        }
        .clamp(0.0, 1.0);
    }
    out
}

/// Mutable view of the current render target with clipping, masking and blending applied.
struct Canvas<'a> {
    rgba: &'a mut [u8],
    width: i32,
    /// Clip rectangle `[x0, x1) x [y0, y1)` in top-left coordinates.
    clip: (i32, i32, i32, i32),
    mask: ColorMask,
    blend: Option<BlendState>,
}

impl Canvas<'_> {
    fn contains(&self, x: i32, y: i32) -> bool {
        let (x0, y0, x1, y1) = self.clip;
        x >= x0 && x < x1 && y >= y0 && y < y1
    }

    fn plot(&mut self, x: i32, y: i32, color: [f32; 4], blended: bool) {
        if !self.contains(x, y) {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = &mut self.rgba[i..i + 4];
        let dst = [px[0], px[1], px[2], px[3]].map(|c| f32::from(c) / 255.0);
        let out = match (&self.blend, blended) {
            (Some(state), true) => blend(state, color, dst),
            _ => color,
        };
        let out = Color(out).to_rgba8();
        for (c, bit) in [ColorMask::R, ColorMask::G, ColorMask::B, ColorMask::A]
            .into_iter()
            .enumerate()
        {
            if self.mask.contains(bit) {
                px[c] = out[c];
            }
        }
    }

    fn fill(&mut self, rect: PixelBox, color: [f32; 4], blended: bool) {
        let (x0, y0, x1, y1) = self.clip;
        let xs = rect.x.max(x0)..rect.x.saturating_add(rect.width).min(x1);
        let ys = rect.y.max(y0)..rect.y.saturating_add(rect.height).min(y1);
        for y in ys {
            for x in xs.clone() {
                self.plot(x, y, color, blended);
            }
        }
    }

    /// Line from `a` to `b` inclusive; the stipple counter carries across calls through
    /// `counter`.
    ///
    /// Only the steps whose pixels can land inside the clip rectangle are walked, so the cost
    /// is bounded by the clip size rather than the line length. Skipped steps still advance the
    /// stipple phase.
    fn line(
        &mut self,
        a: Point,
        b: Point,
        color: [f32; 4],
        stipple: u16,
        counter: &mut u32,
        skip_first: bool,
    ) {
        let (ax, ay) = (i64::from(a.x), i64::from(a.y));
        let (dx, dy) = (i64::from(b.x) - ax, i64::from(b.y) - ay);
        let steps = dx.abs().max(dy.abs());
        let first = i64::from(skip_first);
        let counted = steps + 1 - i64::from(skip_first);

        let (x0, y0, x1, y1) = self.clip;
        let visible = axis_steps(ax, dx, steps, x0.into(), x1.into())
            .zip(axis_steps(ay, dy, steps, y0.into(), y1.into()))
            .map(|((xa, xb), (ya, yb))| (xa.max(ya).max(first), xb.min(yb)));
        if let Some((from, to)) = visible {
            for t in from..=to {
                let phase = (i64::from(*counter) + t - i64::from(skip_first)).rem_euclid(16);
                if stipple & (1 << phase) == 0 {
                    continue;
                }
                let x = ax + step_offset(dx, t, steps);
                let y = ay + step_offset(dy, t, steps);
                if let (Ok(x), Ok(y)) = (i32::try_from(x), i32::try_from(y)) {
                    self.plot(x, y, color, true);
                }
            }
        }
        *counter = (i64::from(*counter) + counted).rem_euclid(16) as u32;
    }
}

/// Offset along one axis after `t` of `steps` line steps, rounded to the nearest pixel.
fn step_offset(delta: i64, t: i64, steps: i64) -> i64 {
    if steps == 0 {
        return 0;
    }
    let (n, d) = (i128::from(delta) * i128::from(t), i128::from(steps));
    ((2 * n + d).div_euclid(2 * d)) as i64
}

/// Range of steps for which a line coordinate `start + delta * t / steps` can round into
/// `[lo, hi)`. Conservative by one pixel on both sides.
fn axis_steps(start: i64, delta: i64, steps: i64, lo: i64, hi: i64) -> Option<(i64, i64)> {
    if lo >= hi {
        return None;
    }
    if delta == 0 {
        return (lo..hi).contains(&start).then_some((0, steps));
    }
    let scaled = |v: i64| i128::from(v - start) * i128::from(delta.signum()) * i128::from(steps);
    let (p, q) = (scaled(lo - 1), scaled(hi + 1));
    let d = i128::from(delta.abs());
    let from = p.min(q).div_euclid(d).max(0);
    let to = (-(-p.max(q)).div_euclid(d)).min(i128::from(steps));
    (from <= to).then(|| (from as i64, to as i64))
}

/// Deterministic software implementation of [`GraphicsBackend`].
///
/// Fixed-function 2D operations (`clear`, `fill_rect`, `draw_lines`, `blit`) are rasterized
/// into RGBA8 targets; programmable draws are validated and counted but not shaded.
#[derive(Debug)]
pub struct SoftBackend {
    state: TrackedState,
    next_name: u32,
    textures: HashMap<u32, SoftTexture>,
    buffers: HashMap<u32, SoftBuffer>,
    programs: HashMap<u32, SoftProgram>,
    layouts: HashMap<u32, Vec<VertexAttrib>>,
    surface: SoftTexture,
    presented: Option<PresentedFrame>,
    max_line_width: Option<f32>,
    present_failure: Option<BackendError>,
    draw_calls: u64,
    presents: u64,
    trace: CallTrace,
}

impl SoftBackend {
    pub const DEFAULT_MAX_LINE_WIDTH: f32 = 16.0;

    pub fn new(width: u32, height: u32) -> Self {
        Self::with_trace(width, height, CallTrace::new())
    }

    /// Builds a backend that records into an existing trace.
    pub fn with_trace(width: u32, height: u32, trace: CallTrace) -> Self {
        Self {
            state: TrackedState::new(width, height),
            next_name: 1,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            layouts: HashMap::new(),
            surface: SoftTexture::blank(width, height, gl::RGBA),
            presented: None,
            max_line_width: Some(Self::DEFAULT_MAX_LINE_WIDTH),
            present_failure: None,
            draw_calls: 0,
            presents: 0,
            trace,
        }
    }

    /// `None` makes every `line_width` call fail as unsupported.
    pub fn set_max_line_width(&mut self, max: Option<f32>) {
        self.max_line_width = max;
    }

    /// While set, every `present` fails with `error` and nothing is captured.
    pub fn set_present_failure(&mut self, error: Option<BackendError>) {
        self.present_failure = error;
    }

    pub fn trace(&self) -> CallTrace {
        self.trace.clone()
    }

    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        self.trace.take()
    }

    pub fn take_presented_frame(&mut self) -> Option<PresentedFrame> {
        self.presented.take()
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }

    /// Number of live textures, buffers, programs and input layouts.
    pub fn live_objects(&self) -> usize {
        self.textures.len() + self.buffers.len() + self.programs.len() + self.layouts.len()
    }

    /// Reads one pixel of the presentation surface (top-left origin).
    pub fn surface_pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        pixel_of(&self.surface, x, y)
    }

    pub fn texture_pixel(&self, texture: u32, x: u32, y: u32) -> Option<[u8; 4]> {
        pixel_of(self.textures.get(&texture)?, x, y)
    }

    pub fn texture_filter(&self, texture: u32) -> Option<(u32, u32)> {
        let t = self.textures.get(&texture)?;
        Some((t.min_filter, t.mag_filter))
    }

    pub fn buffer_contents(&self, buffer: u32) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn input_layout(&self, layout: u32) -> Option<&[VertexAttrib]> {
        self.layouts.get(&layout).map(Vec::as_slice)
    }

    pub fn uniform(&self, program: u32, location: i32) -> Option<(UniformType, &[u8])> {
        let (ty, data) = self.programs.get(&program)?.uniforms.get(&location)?;
        Some((*ty, data.as_slice()))
    }

    pub fn line_width_value(&self) -> f32 {
        self.state.line_width
    }

    pub fn stencil_write_mask(&self, front: bool) -> u32 {
        if front {
            self.state.stencil_front.write_mask
        } else {
            self.state.stencil_back.write_mask
        }
    }

    fn alloc_name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    fn done(&self, call: BackendCall) -> Result<(), BackendError> {
        self.trace.record(call);
        Ok(())
    }

    fn require_texture(&self, texture: u32) -> Result<(), BackendError> {
        if texture == 0 || self.textures.contains_key(&texture) {
            Ok(())
        } else {
            Err(BackendError::InvalidResource(texture))
        }
    }

    fn require_buffer(&self, buffer: u32) -> Result<(), BackendError> {
        if buffer == 0 || self.buffers.contains_key(&buffer) {
            Ok(())
        } else {
            Err(BackendError::InvalidResource(buffer))
        }
    }

    fn canvas(&mut self) -> Result<Canvas<'_>, BackendError> {
        let state = &self.state;
        let target = match state.framebuffer {
            0 => &mut self.surface,
            name => self
                .textures
                .get_mut(&name)
                .ok_or(BackendError::InvalidResource(name))?,
        };
        let (width, height) = (clamp_dim(target.width), clamp_dim(target.height));
        let mut clip = (0, 0, width, height);
        if state.is_enabled(gl::SCISSOR_TEST) {
            // Scissor boxes use a bottom-left origin.
            let s = state.scissor;
            let top = i64::from(height) - (i64::from(s.y) + i64::from(s.height));
            let narrow = |v: i64| v.clamp(i32::MIN.into(), i32::MAX.into()) as i32;
            clip = (
                clip.0.max(s.x),
                clip.1.max(narrow(top)),
                clip.2.min(s.x.saturating_add(s.width)),
                clip.3.min(narrow(top + i64::from(s.height))),
            );
        }
        Ok(Canvas {
            rgba: &mut target.rgba,
            width,
            clip,
            mask: state.color_mask,
            blend: state.is_enabled(gl::BLEND).then_some(state.blend),
        })
    }

    fn blit_from(
        &mut self,
        src: &SoftTexture,
        dest: PixelBox,
        source: PixelBox,
        options: BlitOptions,
    ) -> Result<(), BackendError> {
        let (sw, sh) = (clamp_dim(src.width), clamp_dim(src.height));
        if source.x < 0
            || source.y < 0
            || source.width <= 0
            || source.height <= 0
            || source.x.saturating_add(source.width) > sw
            || source.y.saturating_add(source.height) > sh
        {
            return Err(BackendError::OutOfBounds);
        }
        if dest.width <= 0 || dest.height <= 0 {
            return Ok(());
        }
        let flags = options.flags;
        let blended = !flags.contains(BitmapDrawFlags::FLAT_BLENDING);
        let mut canvas = self.canvas()?;
        let (x0, y0, x1, y1) = canvas.clip;
        let rows = (y0.saturating_sub(dest.y).max(0))..(y1.saturating_sub(dest.y).min(dest.height));
        let cols = (x0.saturating_sub(dest.x).max(0))..(x1.saturating_sub(dest.x).min(dest.width));
        for dy in rows {
            let mut sy = i64::from(dy) * i64::from(source.height) / i64::from(dest.height);
            if flags.contains(BitmapDrawFlags::FLIP_VERTICAL) {
                sy = i64::from(source.height) - 1 - sy;
            }
            let sy = source.y as u32 + sy as u32;
            for dx in cols.clone() {
                let sx = i64::from(dx) * i64::from(source.width) / i64::from(dest.width);
                let sx = source.x as u32 + sx as u32;
                let mut texel = src.texel(sx, sy);
                if flags.contains(BitmapDrawFlags::INVERT_MASK) {
                    texel[3] = 1.0 - texel[3];
                }
                if let Some(Color(tint)) = options.tint {
                    for (t, k) in texel.iter_mut().zip(tint) {
                        *t *= k;
                    }
                }
                canvas.plot(dest.x + dx, dest.y + dy, texel, blended);
            }
        }
        Ok(())
    }
}

fn pixel_of(tex: &SoftTexture, x: u32, y: u32) -> Option<[u8; 4]> {
    if x >= tex.width || y >= tex.height {
        return None;
    }
    let i = (y as usize * tex.width as usize + x as usize) * 4;
    let p = &tex.rgba[i..i + 4];
    Some([p[0], p[1], p[2], p[3]])
}

impl GraphicsBackend for SoftBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Soft
    }

    fn enums(&self) -> &'static NativeEnums {
        &gl::GL_ENUMS
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
        pixels: Option<&[u8]>,
    ) -> Result<u32, BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::InvalidState("empty texture"));
        }
        let bpp = format_bpp(format).ok_or(BackendError::Unsupported("texture format"))?;
        let mut tex = SoftTexture::blank(width, height, format);
        if let Some(pixels) = pixels {
            if pixels.len() != width as usize * height as usize * bpp {
                return Err(BackendError::OutOfBounds);
            }
            expand_to_rgba(format, pixels, &mut tex.rgba);
        }
        let name = self.alloc_name();
        self.textures.insert(name, tex);
        self.done(BackendCall::CreateTexture {
            name,
            width,
            height,
            format,
        })?;
        Ok(name)
    }

    fn update_texture(
        &mut self,
        texture: u32,
        region: PixelBox,
        pixels: &[u8],
    ) -> Result<(), BackendError> {
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or(BackendError::InvalidResource(texture))?;
        let (tw, th) = (clamp_dim(tex.width), clamp_dim(tex.height));
        if region.x < 0
            || region.y < 0
            || region.width < 0
            || region.height < 0
            || region.x.saturating_add(region.width) > tw
            || region.y.saturating_add(region.height) > th
        {
            return Err(BackendError::OutOfBounds);
        }
        let bpp = format_bpp(tex.format).unwrap_or(4);
        let row_bytes = region.width as usize * bpp;
        if pixels.len() != row_bytes * region.height as usize {
            return Err(BackendError::OutOfBounds);
        }
        for (row, src) in pixels.chunks_exact(row_bytes.max(1)).enumerate() {
            let start = ((region.y as usize + row) * tex.width as usize + region.x as usize) * 4;
            let end = start + region.width as usize * 4;
            expand_to_rgba(tex.format, src, &mut tex.rgba[start..end]);
        }
        self.done(BackendCall::UpdateTexture { texture, region })
    }

    fn set_texture_filter(
        &mut self,
        texture: u32,
        min: u32,
        mag: u32,
    ) -> Result<(), BackendError> {
        if ![min, mag].iter().all(|f| matches!(*f, gl::NEAREST | gl::LINEAR)) {
            return Err(BackendError::Unsupported("texture filter"));
        }
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or(BackendError::InvalidResource(texture))?;
        tex.min_filter = min;
        tex.mag_filter = mag;
        self.done(BackendCall::SetTextureFilter { texture, min, mag })
    }

    fn destroy_texture(&mut self, texture: u32) -> Result<(), BackendError> {
        self.textures
            .remove(&texture)
            .ok_or(BackendError::InvalidResource(texture))?;
        self.state.forget_texture(texture);
        self.done(BackendCall::DestroyTexture(texture))
    }

    fn create_buffer(
        &mut self,
        size: u32,
        usage: u32,
        data: Option<&[u8]>,
    ) -> Result<u32, BackendError> {
        if !matches!(usage, gl::STATIC_DRAW | gl::DYNAMIC_DRAW | gl::STREAM_DRAW) {
            return Err(BackendError::Unsupported("buffer usage"));
        }
        let mut contents = vec![0; size as usize];
        if let Some(data) = data {
            contents
                .get_mut(..data.len())
                .ok_or(BackendError::OutOfBounds)?
                .copy_from_slice(data);
        }
        let name = self.alloc_name();
        self.buffers.insert(
            name,
            SoftBuffer {
                usage,
                data: contents,
            },
        );
        self.done(BackendCall::CreateBuffer { name, size, usage })?;
        Ok(name)
    }

    fn update_buffer(&mut self, buffer: u32, offset: u32, data: &[u8]) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::InvalidResource(buffer))?;
        let start = offset as usize;
        buf.data
            .get_mut(start..start + data.len())
            .ok_or(BackendError::OutOfBounds)?
            .copy_from_slice(data);
        tracing::trace!(buffer, usage = buf.usage, len = data.len(), "soft buffer update");
        self.done(BackendCall::UpdateBuffer {
            buffer,
            offset,
            len: data.len(),
        })
    }

    fn destroy_buffer(&mut self, buffer: u32) -> Result<(), BackendError> {
        self.buffers
            .remove(&buffer)
            .ok_or(BackendError::InvalidResource(buffer))?;
        self.state.forget_buffer(buffer);
        self.done(BackendCall::DestroyBuffer(buffer))
    }

    fn create_program(&mut self, vertex: &[u8], fragment: &[u8]) -> Result<u32, BackendError> {
        if vertex.is_empty() || fragment.is_empty() {
            return Err(BackendError::InvalidState("empty shader source"));
        }
        let name = self.alloc_name();
        self.programs.insert(name, SoftProgram::default());
        self.done(BackendCall::CreateProgram(name))?;
        Ok(name)
    }

    fn destroy_program(&mut self, program: u32) -> Result<(), BackendError> {
        self.programs
            .remove(&program)
            .ok_or(BackendError::InvalidResource(program))?;
        self.state.forget_program(program);
        self.done(BackendCall::DestroyProgram(program))
    }

    fn create_input_layout(&mut self, attribs: &[VertexAttrib]) -> Result<u32, BackendError> {
        for attrib in attribs {
            if !(1..=4).contains(&attrib.components) {
                return Err(BackendError::InvalidState("attribute component count"));
            }
            if attrib.slot >= VERTEX_SLOTS {
                return Err(BackendError::OutOfBounds);
            }
        }
        let name = self.alloc_name();
        self.layouts.insert(name, attribs.to_vec());
        self.done(BackendCall::CreateInputLayout {
            name,
            attribs: attribs.len(),
        })?;
        Ok(name)
    }

    fn destroy_input_layout(&mut self, layout: u32) -> Result<(), BackendError> {
        self.layouts
            .remove(&layout)
            .ok_or(BackendError::InvalidResource(layout))?;
        self.state.forget_input_layout(layout);
        self.done(BackendCall::DestroyInputLayout(layout))
    }

    fn use_program(&mut self, program: u32) -> Result<(), BackendError> {
        if program != 0 && !self.programs.contains_key(&program) {
            return Err(BackendError::InvalidResource(program));
        }
        self.state.program = program;
        self.done(BackendCall::UseProgram(program))
    }

    fn active_texture(&mut self, unit: u32) -> Result<(), BackendError> {
        self.state.active_texture(unit)?;
        self.done(BackendCall::ActiveTexture(unit))
    }

    fn bind_texture(&mut self, texture: u32) -> Result<(), BackendError> {
        self.require_texture(texture)?;
        self.state.bind_texture(texture);
        self.done(BackendCall::BindTexture(texture))
    }

    fn bind_buffer(&mut self, target: u32, buffer: u32) -> Result<(), BackendError> {
        self.require_buffer(buffer)?;
        self.state.bind_buffer(target, buffer)?;
        self.done(BackendCall::BindBuffer { target, buffer })
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: u32, offset: u32) -> Result<(), BackendError> {
        self.require_buffer(buffer)?;
        self.state.bind_vertex_buffer(slot, buffer, offset)?;
        self.done(BackendCall::BindVertexBuffer {
            slot,
            buffer,
            offset,
        })
    }

    fn bind_input_layout(&mut self, layout: u32) -> Result<(), BackendError> {
        if layout != 0 && !self.layouts.contains_key(&layout) {
            return Err(BackendError::InvalidResource(layout));
        }
        self.state.input_layout = layout;
        self.done(BackendCall::BindInputLayout(layout))
    }

    fn bind_framebuffer(&mut self, texture: u32) -> Result<(), BackendError> {
        self.require_texture(texture)?;
        self.state.framebuffer = texture;
        self.done(BackendCall::BindFramebuffer(texture))
    }

    fn blend_equation_separate(&mut self, rgb: u32, alpha: u32) -> Result<(), BackendError> {
        self.state.blend_equation(rgb, alpha)?;
        self.done(BackendCall::BlendEquation { rgb, alpha })
    }

    fn blend_func_separate(
        &mut self,
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    ) -> Result<(), BackendError> {
        self.state
            .blend_func(src_rgb, dst_rgb, src_alpha, dst_alpha)?;
        self.done(BackendCall::BlendFunc {
            src_rgb,
            dst_rgb,
            src_alpha,
            dst_alpha,
        })
    }

    fn set_enabled(&mut self, cap: u32, enabled: bool) -> Result<(), BackendError> {
        self.state.set_enabled(cap, enabled)?;
        self.done(BackendCall::SetEnabled { cap, enabled })
    }

    fn viewport(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        self.state.viewport(rect)?;
        self.done(BackendCall::Viewport(rect))
    }

    fn scissor(&mut self, rect: PixelBox) -> Result<(), BackendError> {
        self.state.scissor(rect)?;
        self.done(BackendCall::Scissor(rect))
    }

    fn stencil_op_separate(
        &mut self,
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    ) -> Result<(), BackendError> {
        self.state.stencil_op(face, fail, depth_fail, pass)?;
        self.done(BackendCall::StencilOp {
            face,
            fail,
            depth_fail,
            pass,
        })
    }

    fn stencil_func_separate(
        &mut self,
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    ) -> Result<(), BackendError> {
        self.state.stencil_func(face, func, reference, mask)?;
        self.done(BackendCall::StencilFunc {
            face,
            func,
            reference,
            mask,
        })
    }

    fn stencil_mask_separate(&mut self, face: u32, mask: u32) -> Result<(), BackendError> {
        self.state.stencil_mask(face, mask)?;
        self.done(BackendCall::StencilMask { face, mask })
    }

    fn depth_mask(&mut self, write: bool) -> Result<(), BackendError> {
        self.state.depth_write = write;
        self.done(BackendCall::DepthMask(write))
    }

    fn depth_func(&mut self, func: u32) -> Result<(), BackendError> {
        self.state.depth_func(func)?;
        self.done(BackendCall::DepthFunc(func))
    }

    fn cull_face(&mut self, face: u32) -> Result<(), BackendError> {
        self.state.cull_face(face)?;
        self.done(BackendCall::CullFace(face))
    }

    fn front_face(&mut self, rule: u32) -> Result<(), BackendError> {
        self.state.front_face(rule)?;
        self.done(BackendCall::FrontFace(rule))
    }

    fn color_mask(&mut self, mask: ColorMask) -> Result<(), BackendError> {
        self.state.color_mask = mask;
        self.done(BackendCall::ColorMask(mask))
    }

    fn line_width(&mut self, width: f32) -> Result<(), BackendError> {
        let max = self
            .max_line_width
            .ok_or(BackendError::Unsupported("line width"))?;
        if width.is_nan() || width <= 0.0 {
            return Err(BackendError::InvalidState("line width must be positive"));
        }
        if width > max {
            return Err(BackendError::OutOfBounds);
        }
        self.state.line_width = width;
        self.done(BackendCall::LineWidth(width))
    }

    fn point_size(&mut self, size: f32) -> Result<(), BackendError> {
        self.state.point_size(size)?;
        self.done(BackendCall::PointSize(size))
    }

    fn polygon_offset(&mut self, factor: f32, units: f32) -> Result<(), BackendError> {
        self.state.polygon_offset = (factor, units);
        self.done(BackendCall::PolygonOffset { factor, units })
    }

    fn set_uniform(&mut self, location: i32, ty: UniformType, data: &[u8]) -> Result<(), BackendError> {
        let program = self
            .programs
            .get_mut(&self.state.program)
            .ok_or(BackendError::InvalidState("no program bound"))?;
        if data.is_empty() || data.len() % ty.size_bytes() != 0 {
            return Err(BackendError::InvalidState("uniform payload size"));
        }
        program.uniforms.insert(location, (ty, data.to_vec()));
        self.done(BackendCall::SetUniform {
            location,
            ty,
            len: data.len(),
        })
    }

    fn clear(
        &mut self,
        bits: ClearBits,
        color: Color,
        depth: f32,
        stencil: i32,
    ) -> Result<(), BackendError> {
        if bits.contains(ClearBits::COLOR) {
            let mut canvas = self.canvas()?;
            let full = PixelBox::new(0, 0, i32::MAX, i32::MAX);
            canvas.fill(full, color.0, false);
        }
        self.done(BackendCall::Clear {
            bits,
            color,
            depth,
            stencil,
        })
    }

    fn draw_elements(
        &mut self,
        mode: u32,
        count: u32,
        index_type: u32,
        offset: u32,
    ) -> Result<(), BackendError> {
        if !state::is_primitive_mode(mode) {
            return Err(BackendError::Unsupported("primitive mode"));
        }
        let size = state::index_size(index_type).ok_or(BackendError::Unsupported("index type"))?;
        if self.state.program == 0 {
            return Err(BackendError::InvalidState("no program bound"));
        }
        let indices = self
            .buffers
            .get(&self.state.element_buffer)
            .ok_or(BackendError::InvalidState("no element buffer bound"))?;
        let end = u64::from(offset) + u64::from(count) * u64::from(size);
        if end > indices.data.len() as u64 {
            return Err(BackendError::OutOfBounds);
        }
        self.draw_calls += 1;
        self.done(BackendCall::DrawElements {
            mode,
            count,
            index_type,
            offset,
        })
    }

    fn draw_arrays(&mut self, mode: u32, first: u32, count: u32) -> Result<(), BackendError> {
        if !state::is_primitive_mode(mode) {
            return Err(BackendError::Unsupported("primitive mode"));
        }
        if self.state.program == 0 {
            return Err(BackendError::InvalidState("no program bound"));
        }
        self.draw_calls += 1;
        self.done(BackendCall::DrawArrays { mode, first, count })
    }

    fn fill_rect(&mut self, rect: PixelBox, color: Color) -> Result<(), BackendError> {
        self.canvas()?.fill(rect, color.0, true);
        self.draw_calls += 1;
        self.done(BackendCall::FillRect { rect, color })
    }

    fn draw_lines(
        &mut self,
        points: &[Point],
        color: Color,
        stipple: u16,
        closed: bool,
    ) -> Result<(), BackendError> {
        if points.len() < 2 {
            return Err(BackendError::InvalidState("line needs two points"));
        }
        let mut canvas = self.canvas()?;
        let mut counter = 0;
        for (i, pair) in points.windows(2).enumerate() {
            canvas.line(pair[0], pair[1], color.0, stipple, &mut counter, i > 0);
        }
        if closed && points.len() > 2 {
            let (last, first) = (points[points.len() - 1], points[0]);
            canvas.line(last, first, color.0, stipple, &mut counter, true);
        }
        self.draw_calls += 1;
        self.done(BackendCall::DrawLines {
            points: points.to_vec(),
            stipple,
            closed,
        })
    }

    fn blit(
        &mut self,
        texture: u32,
        dest: PixelBox,
        source: PixelBox,
        options: BlitOptions,
    ) -> Result<(), BackendError> {
        if texture == self.state.framebuffer {
            return Err(BackendError::InvalidState("blit source is the render target"));
        }
        let src = self
            .textures
            .remove(&texture)
            .ok_or(BackendError::InvalidResource(texture))?;
        let result = self.blit_from(&src, dest, source, options);
        self.textures.insert(texture, src);
        result?;
        self.draw_calls += 1;
        self.done(BackendCall::Blit {
            texture,
            dest,
            source,
        })
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
        if let Some(err) = &self.present_failure {
            return Err(err.clone());
        }
        self.presented = Some(PresentedFrame {
            width: self.surface.width,
            height: self.surface.height,
            rgba8: self.surface.rgba.clone(),
        });
        self.presents += 1;
        self.done(BackendCall::Present)
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        if width == 0 || height == 0 {
            return Err(BackendError::InvalidState("empty surface"));
        }
        self.surface = SoftTexture::blank(width, height, gl::RGBA);
        self.done(BackendCall::ResizeSurface { width, height })
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Color = Color([1.0, 0.0, 0.0, 1.0]);

    #[test]
    fn clear_respects_scissor_and_color_mask() {
        let mut b = SoftBackend::new(4, 4);
        b.clear(ClearBits::COLOR, Color::WHITE, 1.0, 0).unwrap();

        b.set_enabled(gl::SCISSOR_TEST, true).unwrap();
        // Bottom-left 2x2 quadrant in GL coordinates is the bottom-left in the top-left image.
        b.scissor(PixelBox::new(0, 0, 2, 2)).unwrap();
        b.color_mask(ColorMask::G | ColorMask::B | ColorMask::A)
            .unwrap();
        b.clear(ClearBits::COLOR, Color::BLACK, 1.0, 0).unwrap();

        assert_eq!(b.surface_pixel(0, 3), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(0, 0), Some([0xFF; 4]));
        assert_eq!(b.surface_pixel(3, 3), Some([0xFF; 4]));
    }

    #[test]
    fn fill_rect_blends_with_source_alpha() {
        let mut b = SoftBackend::new(2, 1);
        b.clear(ClearBits::COLOR, Color::BLACK, 1.0, 0).unwrap();
        b.set_enabled(gl::BLEND, true).unwrap();
        b.blend_func_separate(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA, gl::ONE, gl::ZERO)
            .unwrap();
        b.fill_rect(PixelBox::new(0, 0, 1, 1), Color([1.0, 1.0, 1.0, 0.5]))
            .unwrap();
        assert_eq!(b.surface_pixel(0, 0), Some([0x80, 0x80, 0x80, 0x80]));
        assert_eq!(b.surface_pixel(1, 0), Some([0, 0, 0, 0xFF]));
    }

    #[test]
    fn stippled_lines_skip_cleared_bits() {
        let mut b = SoftBackend::new(16, 1);
        b.draw_lines(&[Point::new(0, 0), Point::new(15, 0)], RED, 0x00FF, false)
            .unwrap();
        assert_eq!(b.surface_pixel(0, 0), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(7, 0), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(8, 0), Some([0; 4]));
        assert_eq!(b.surface_pixel(15, 0), Some([0; 4]));
    }

    #[test]
    fn clipped_lines_keep_their_stipple_phase() {
        let mut b = SoftBackend::new(16, 1);
        b.draw_lines(&[Point::new(-4, 0), Point::new(15, 0)], RED, 0x00FF, false)
            .unwrap();
        assert_eq!(b.surface_pixel(0, 0), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(3, 0), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(4, 0), Some([0; 4]));
        assert_eq!(b.surface_pixel(12, 0), Some([0xFF, 0, 0, 0xFF]));
    }

    #[test]
    fn lines_across_the_whole_coordinate_range_only_touch_the_target() {
        let mut b = SoftBackend::new(4, 2);
        let started = std::time::Instant::now();
        b.draw_lines(
            &[Point::new(i32::MIN, 0), Point::new(i32::MAX, 0)],
            RED,
            0xFFFF,
            false,
        )
        .unwrap();
        b.draw_lines(
            &[Point::new(0, 1), Point::new(1_000_000_000, 1)],
            RED,
            0xFFFF,
            false,
        )
        .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        for x in 0..4 {
            assert_eq!(b.surface_pixel(x, 0), Some([0xFF, 0, 0, 0xFF]));
            assert_eq!(b.surface_pixel(x, 1), Some([0xFF, 0, 0, 0xFF]));
        }
    }

    #[test]
    fn huge_blit_destinations_iterate_only_the_clip() {
        let mut b = SoftBackend::new(4, 2);
        let tex = b
            .create_texture(1, 1, gl::RGB, Some(&[0, 0xFF, 0]))
            .unwrap();
        let opts = BlitOptions {
            tint: None,
            flags: BitmapDrawFlags::empty(),
        };
        let started = std::time::Instant::now();
        b.blit(
            tex,
            PixelBox::new(-500_000, -500_000, 1_000_000, 1_000_000),
            PixelBox::new(0, 0, 1, 1),
            opts,
        )
        .unwrap();
        b.blit(
            tex,
            PixelBox::new(i32::MAX - 1, 0, i32::MAX, i32::MAX),
            PixelBox::new(0, 0, 1, 1),
            opts,
        )
        .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(b.surface_pixel(0, 0), Some([0, 0xFF, 0, 0xFF]));
        assert_eq!(b.surface_pixel(3, 1), Some([0, 0xFF, 0, 0xFF]));
    }

    #[test]
    fn scissor_boxes_at_the_coordinate_limits_do_not_wrap() {
        let mut b = SoftBackend::new(2, 2);
        b.set_enabled(gl::SCISSOR_TEST, true).unwrap();
        b.scissor(PixelBox::new(0, i32::MAX, 2, i32::MAX)).unwrap();
        b.fill_rect(PixelBox::new(0, 0, 2, 2), RED).unwrap();
        assert_eq!(b.surface_pixel(0, 0), Some([0; 4]));
        assert_eq!(b.surface_pixel(1, 1), Some([0; 4]));
    }

    #[test]
    fn blit_scales_flips_and_tints() {
        let mut b = SoftBackend::new(2, 4);
        // 1x2 texture: red on top, blue below.
        let tex = b
            .create_texture(1, 2, gl::RGB, Some(&[0xFF, 0, 0, 0, 0, 0xFF]))
            .unwrap();
        let opts = BlitOptions {
            tint: None,
            flags: BitmapDrawFlags::empty(),
        };
        b.blit(tex, PixelBox::new(0, 0, 1, 4), PixelBox::new(0, 0, 1, 2), opts)
            .unwrap();
        assert_eq!(b.surface_pixel(0, 1), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(0, 2), Some([0, 0, 0xFF, 0xFF]));

        let flipped = BlitOptions {
            tint: Some(Color([0.0, 1.0, 1.0, 1.0])),
            flags: BitmapDrawFlags::FLIP_VERTICAL,
        };
        b.blit(tex, PixelBox::new(1, 0, 1, 2), PixelBox::new(0, 0, 1, 2), flipped)
            .unwrap();
        assert_eq!(b.surface_pixel(1, 0), Some([0, 0, 0xFF, 0xFF]));
        assert_eq!(b.surface_pixel(1, 1), Some([0, 0, 0, 0xFF]));
    }

    #[test]
    fn render_to_texture_redirects_drawing() {
        let mut b = SoftBackend::new(2, 2);
        let target = b.create_texture(2, 2, gl::RGBA, None).unwrap();
        b.bind_framebuffer(target).unwrap();
        b.clear(ClearBits::COLOR, RED, 1.0, 0).unwrap();
        assert_eq!(b.texture_pixel(target, 1, 1), Some([0xFF, 0, 0, 0xFF]));
        assert_eq!(b.surface_pixel(1, 1), Some([0; 4]));

        assert!(matches!(
            b.blit(target, PixelBox::new(0, 0, 1, 1), PixelBox::new(0, 0, 1, 1), BlitOptions {
                tint: None,
                flags: BitmapDrawFlags::empty(),
            }),
            Err(BackendError::InvalidState(_))
        ));

        b.destroy_texture(target).unwrap();
        assert_eq!(b.bound_framebuffer(), 0);
    }

    #[test]
    fn draw_elements_validates_bindings() {
        let mut b = SoftBackend::new(1, 1);
        assert_eq!(
            b.draw_elements(gl::TRIANGLES, 6, gl::UNSIGNED_SHORT, 0),
            Err(BackendError::InvalidState("no program bound"))
        );
        let program = b.create_program(b"vs", b"fs").unwrap();
        b.use_program(program).unwrap();
        let ib = b.create_buffer(12, gl::STATIC_DRAW, None).unwrap();
        b.bind_buffer(gl::ELEMENT_ARRAY_BUFFER, ib).unwrap();
        b.draw_elements(gl::TRIANGLES, 6, gl::UNSIGNED_SHORT, 0)
            .unwrap();
        assert_eq!(
            b.draw_elements(gl::TRIANGLES, 6, gl::UNSIGNED_SHORT, 2),
            Err(BackendError::OutOfBounds)
        );
        assert_eq!(b.draw_calls(), 1);
    }

    #[test]
    fn line_width_limit_is_configurable() {
        let mut b = SoftBackend::new(1, 1);
        b.line_width(2.0).unwrap();
        b.set_max_line_width(None);
        assert_eq!(
            b.line_width(1.0),
            Err(BackendError::Unsupported("line width"))
        );
        assert_eq!(b.line_width_value(), 2.0);
    }

    #[test]
    fn line_width_above_maximum_is_out_of_bounds() {
        let mut b = SoftBackend::new(1, 1);
        b.set_max_line_width(Some(4.0));
        assert_eq!(b.line_width(8.0), Err(BackendError::OutOfBounds));
        b.line_width(2.0).unwrap();
        assert_eq!(b.line_width_value(), 2.0);
    }

    #[test]
    fn trace_is_shared_between_clones() {
        let trace = CallTrace::new();
        let mut b = SoftBackend::with_trace(1, 1, trace.clone());
        b.present().unwrap();
        assert_eq!(trace.snapshot(), vec![BackendCall::Present]);
        assert_eq!(b.take_calls(), vec![BackendCall::Present]);
        assert!(trace.is_empty());
        assert_eq!(b.take_presented_frame().map(|f| f.rgba8.len()), Some(4));
    }
}
