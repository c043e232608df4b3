//! Portable enumerations and geometry shared by the producer and the dispatcher.
//!
//! Enumerations travel through command arguments as their `u8` discriminant. The consumer side
//! converts them back with `from_raw`, which yields `None` for values it does not know about.
//! Backend-facing enumerations are translated straight from the raw value through the
//! backend's native table instead (see [`crate::backend::NativeEnums`]).

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

macro_rules! portable_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn from_raw(raw: u8) -> Option<Self> {
                match raw {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn to_raw(self) -> u8 {
                self as u8
            }
        }
    };
}

portable_enum! {
    pub enum PrimitiveMode {
        Points = 0,
        Lines = 1,
        LineLoop = 2,
        LineStrip = 3,
        Triangles = 4,
        TriangleStrip = 5,
        TriangleFan = 6,
    }
}

portable_enum! {
    /// Element type of an index buffer.
    pub enum IndexFormat {
        U8 = 0,
        U16 = 1,
        U32 = 2,
    }
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::U8 => 1,
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

portable_enum! {
    pub enum BlendEquation {
        Add = 0,
        Subtract = 1,
        ReverseSubtract = 2,
    }
}

portable_enum! {
    /// Blend factors. `Src*` refers to the fragment output, `Dst*` to the current
    /// framebuffer content.
    pub enum BlendFactor {
        Zero = 0,
        One = 1,
        SrcAlpha = 2,
        OneMinusSrcAlpha = 3,
        DstAlpha = 4,
        OneMinusDstAlpha = 5,
        SrcColor = 6,
        OneMinusSrcColor = 7,
        DstColor = 8,
        OneMinusDstColor = 9,
        SrcAlphaSaturate = 10,
    }
}

portable_enum! {
    pub enum StencilAction {
        Keep = 0,
        Replace = 1,
        Zero = 2,
        Invert = 3,
        Decrement = 4,
        DecrementWrap = 5,
        Increment = 6,
        IncrementWrap = 7,
    }
}

portable_enum! {
    pub enum ConditionFunc {
        Never = 0,
        Always = 1,
        Equal = 2,
        NotEqual = 3,
        Less = 4,
        LessOrEqual = 5,
        Greater = 6,
        GreaterOrEqual = 7,
    }
}

portable_enum! {
    pub enum RenderingFace {
        Back = 0,
        Front = 1,
        BackAndFront = 2,
    }
}

portable_enum! {
    /// Winding that decides which face of a polygon is the front.
    pub enum FrontFaceRule {
        CounterClockwise = 0,
        Clockwise = 1,
    }
}

portable_enum! {
    /// Toggleable fixed-function features.
    pub enum Feature {
        Blend = 0,
        Clipping = 1,
        Cull = 2,
        DepthTest = 3,
        StencilTest = 4,
        SampleCoverage = 5,
        SampleAlphaToOne = 6,
        SampleAlphaToCoverage = 7,
        PolygonOffsetFill = 8,
        LineSmooth = 9,
        Multisample = 10,
        Dither = 11,
    }
}

portable_enum! {
    pub enum PenStyle {
        None = 0,
        Solid = 1,
        Dotted = 2,
        Dashed = 3,
        DashedDot = 4,
        DashedDotDot = 5,
    }
}

impl PenStyle {
    /// 16-bit stipple pattern used when rasterizing lines, or `None` when nothing is drawn.
    pub fn stipple_pattern(self) -> Option<u16> {
        match self {
            PenStyle::None => None,
            PenStyle::Solid => Some(0xFFFF),
            PenStyle::Dotted => Some(0x6666),
            PenStyle::Dashed => Some(0x3F3F),
            PenStyle::DashedDot => Some(0xFF18),
            PenStyle::DashedDotDot => Some(0x7E66),
        }
    }
}

portable_enum! {
    pub enum UniformType {
        Int = 0,
        Float = 1,
        Vec3 = 2,
        Vec4 = 3,
        Mat4 = 4,
    }
}

impl UniformType {
    /// Payload size in bytes for one value of this type.
    pub fn size_bytes(self) -> usize {
        match self {
            UniformType::Int | UniformType::Float => 4,
            UniformType::Vec3 => 12,
            UniformType::Vec4 => 16,
            UniformType::Mat4 => 64,
        }
    }
}

portable_enum! {
    pub enum TextureFormat {
        R8 = 0,
        Rgb8 = 1,
        Rgba8 = 2,
    }
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgb8 => 3,
            TextureFormat::Rgba8 => 4,
        }
    }
}

portable_enum! {
    pub enum FilterMode {
        Nearest = 0,
        Linear = 1,
    }
}

portable_enum! {
    pub enum BufferUsage {
        Static = 0,
        Dynamic = 1,
        Stream = 2,
    }
}

portable_enum! {
    pub enum ShaderStage {
        Vertex = 0,
        Fragment = 1,
    }
}

bitflags! {
    /// Framebuffer attachments affected by a clear.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ClearBits: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

bitflags! {
    /// Per-channel color write mask (`R`, `G`, `B`, `A` in bit order).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        ColorMask::all()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BitmapDrawFlags: u32 {
        /// Modulate the sampled color with the current brush color.
        const USE_BRUSH = 1 << 0;
        /// Use one minus the source alpha as coverage.
        const INVERT_MASK = 1 << 1;
        /// Source rows are stored bottom-up (render target content); flip while sampling.
        const FLIP_VERTICAL = 1 << 2;
        const FLAT_BLENDING = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vec2f {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned rectangle described by its top-left corner and size.
///
/// A zero size means "use the natural size" for the commands that accept one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Rect {
    pub top: Point,
    pub size: Point,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            top: Point::new(x, y),
            size: Point::new(width, height),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.x == 0 || self.size.y == 0
    }
}

/// One vertex attribute of an input layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct VertexAttrib {
    pub location: u32,
    /// Vertex buffer slot the attribute is fetched from.
    pub slot: u32,
    pub offset: u32,
    pub stride: u32,
    /// Number of `f32` components (1..=4).
    pub components: u32,
}

/// Normalized RGBA color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Color(pub [f32; 4]);

impl Color {
    pub const BLACK: Self = Self([0.0, 0.0, 0.0, 1.0]);
    pub const WHITE: Self = Self([1.0, 1.0, 1.0, 1.0]);
    pub const TRANSPARENT: Self = Self([0.0, 0.0, 0.0, 0.0]);

    /// Builds a color from 8-bit channels.
    pub fn from_rgba8(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
            f32::from(a) / 255.0,
        ])
    }

    pub fn to_rgba8(self) -> [u8; 4] {
        self.0.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
    }
}
