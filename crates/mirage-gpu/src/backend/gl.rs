//! OpenGL (ES 2/3 subset) numeric enumerations and the matching translation table.

use super::native::NativeEnums;

pub const ZERO: u32 = 0;
pub const ONE: u32 = 1;

pub const POINTS: u32 = 0x0000;
pub const LINES: u32 = 0x0001;
pub const LINE_LOOP: u32 = 0x0002;
pub const LINE_STRIP: u32 = 0x0003;
pub const TRIANGLES: u32 = 0x0004;
pub const TRIANGLE_STRIP: u32 = 0x0005;
pub const TRIANGLE_FAN: u32 = 0x0006;

pub const UNSIGNED_BYTE: u32 = 0x1401;
pub const UNSIGNED_SHORT: u32 = 0x1403;
pub const UNSIGNED_INT: u32 = 0x1405;

pub const FUNC_ADD: u32 = 0x8006;
pub const FUNC_SUBTRACT: u32 = 0x800A;
pub const FUNC_REVERSE_SUBTRACT: u32 = 0x800B;

pub const SRC_COLOR: u32 = 0x0300;
pub const ONE_MINUS_SRC_COLOR: u32 = 0x0301;
pub const SRC_ALPHA: u32 = 0x0302;
pub const ONE_MINUS_SRC_ALPHA: u32 = 0x0303;
pub const DST_ALPHA: u32 = 0x0304;
pub const ONE_MINUS_DST_ALPHA: u32 = 0x0305;
pub const DST_COLOR: u32 = 0x0306;
pub const ONE_MINUS_DST_COLOR: u32 = 0x0307;
pub const SRC_ALPHA_SATURATE: u32 = 0x0308;

pub const KEEP: u32 = 0x1E00;
pub const REPLACE: u32 = 0x1E01;
pub const INCR: u32 = 0x1E02;
pub const DECR: u32 = 0x1E03;
pub const INVERT: u32 = 0x150A;
pub const INCR_WRAP: u32 = 0x8507;
pub const DECR_WRAP: u32 = 0x8508;

pub const NEVER: u32 = 0x0200;
pub const LESS: u32 = 0x0201;
pub const EQUAL: u32 = 0x0202;
pub const LEQUAL: u32 = 0x0203;
pub const GREATER: u32 = 0x0204;
pub const NOTEQUAL: u32 = 0x0205;
pub const GEQUAL: u32 = 0x0206;
pub const ALWAYS: u32 = 0x0207;

pub const FRONT: u32 = 0x0404;
pub const BACK: u32 = 0x0405;
pub const FRONT_AND_BACK: u32 = 0x0408;

pub const CW: u32 = 0x0900;
pub const CCW: u32 = 0x0901;

pub const CULL_FACE: u32 = 0x0B44;
pub const DEPTH_TEST: u32 = 0x0B71;
pub const STENCIL_TEST: u32 = 0x0B90;
pub const DITHER: u32 = 0x0BD0;
pub const BLEND: u32 = 0x0BE2;
pub const SCISSOR_TEST: u32 = 0x0C11;
pub const LINE_SMOOTH: u32 = 0x0B20;
pub const POLYGON_OFFSET_FILL: u32 = 0x8037;
pub const MULTISAMPLE: u32 = 0x809D;
pub const SAMPLE_ALPHA_TO_COVERAGE: u32 = 0x809E;
pub const SAMPLE_ALPHA_TO_ONE: u32 = 0x809F;
pub const SAMPLE_COVERAGE: u32 = 0x80A0;

pub const RED: u32 = 0x1903;
pub const RGB: u32 = 0x1907;
pub const RGBA: u32 = 0x1908;

pub const NEAREST: u32 = 0x2600;
pub const LINEAR: u32 = 0x2601;

pub const STREAM_DRAW: u32 = 0x88E0;
pub const STATIC_DRAW: u32 = 0x88E4;
pub const DYNAMIC_DRAW: u32 = 0x88E8;

pub const ARRAY_BUFFER: u32 = 0x8892;
pub const ELEMENT_ARRAY_BUFFER: u32 = 0x8893;

pub static GL_ENUMS: NativeEnums = NativeEnums {
    primitive_modes: [
        POINTS,
        LINES,
        LINE_LOOP,
        LINE_STRIP,
        TRIANGLES,
        TRIANGLE_STRIP,
        TRIANGLE_FAN,
    ],
    index_formats: [UNSIGNED_BYTE, UNSIGNED_SHORT, UNSIGNED_INT],
    blend_equations: [FUNC_ADD, FUNC_SUBTRACT, FUNC_REVERSE_SUBTRACT],
    blend_factors: [
        ZERO,
        ONE,
        SRC_ALPHA,
        ONE_MINUS_SRC_ALPHA,
        DST_ALPHA,
        ONE_MINUS_DST_ALPHA,
        SRC_COLOR,
        ONE_MINUS_SRC_COLOR,
        DST_COLOR,
        ONE_MINUS_DST_COLOR,
        SRC_ALPHA_SATURATE,
    ],
    stencil_actions: [KEEP, REPLACE, ZERO, INVERT, DECR, DECR_WRAP, INCR, INCR_WRAP],
    condition_funcs: [NEVER, ALWAYS, EQUAL, NOTEQUAL, LESS, LEQUAL, GREATER, GEQUAL],
    faces: [BACK, FRONT, FRONT_AND_BACK],
    front_face_rules: [CCW, CW],
    features: [
        BLEND,
        SCISSOR_TEST,
        CULL_FACE,
        DEPTH_TEST,
        STENCIL_TEST,
        SAMPLE_COVERAGE,
        SAMPLE_ALPHA_TO_ONE,
        SAMPLE_ALPHA_TO_COVERAGE,
        POLYGON_OFFSET_FILL,
        LINE_SMOOTH,
        MULTISAMPLE,
        DITHER,
    ],
    texture_formats: [RED, RGB, RGBA],
    filters: [NEAREST, LINEAR],
    buffer_usages: [STATIC_DRAW, DYNAMIC_DRAW, STREAM_DRAW],

    stencil_action_fallback: KEEP,
    condition_func_fallback: NEVER,
    face_fallback: FRONT_AND_BACK,

    array_buffer: ARRAY_BUFFER,
    element_array_buffer: ELEMENT_ARRAY_BUFFER,
};
