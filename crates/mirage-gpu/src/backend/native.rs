//! Portable → native enumeration translation.
//!
//! Commands carry portable enumerations as raw `u8` discriminants. Each backend publishes one
//! fixed [`NativeEnums`] table that maps them into its own numeric space. Values that have no
//! mapping translate to [`NativeEnums::INVALID`] and the command using them is skipped; stencil
//! actions, condition functions and faces instead fall back to a per-table default.

use crate::types::{
    BlendEquation, BlendFactor, BufferUsage, ConditionFunc, Feature, FilterMode, FrontFaceRule,
    IndexFormat, PrimitiveMode, RenderingFace, StencilAction, TextureFormat,
};

#[derive(Debug)]
pub struct NativeEnums {
    /// Indexed by [`PrimitiveMode`] discriminant.
    pub primitive_modes: [u32; PrimitiveMode::ALL.len()],
    pub index_formats: [u32; IndexFormat::ALL.len()],
    pub blend_equations: [u32; BlendEquation::ALL.len()],
    pub blend_factors: [u32; BlendFactor::ALL.len()],
    pub stencil_actions: [u32; StencilAction::ALL.len()],
    pub condition_funcs: [u32; ConditionFunc::ALL.len()],
    pub faces: [u32; RenderingFace::ALL.len()],
    pub front_face_rules: [u32; FrontFaceRule::ALL.len()],
    pub features: [u32; Feature::ALL.len()],
    pub texture_formats: [u32; TextureFormat::ALL.len()],
    pub filters: [u32; FilterMode::ALL.len()],
    pub buffer_usages: [u32; BufferUsage::ALL.len()],

    pub stencil_action_fallback: u32,
    pub condition_func_fallback: u32,
    pub face_fallback: u32,

    /// Buffer binding targets.
    pub array_buffer: u32,
    pub element_array_buffer: u32,
}

fn lookup(table: &[u32], raw: u8, fallback: u32) -> u32 {
    table.get(usize::from(raw)).copied().unwrap_or(fallback)
}

impl NativeEnums {
    pub const INVALID: u32 = u32::MAX;

    pub fn primitive_mode(&self, raw: u8) -> u32 {
        lookup(&self.primitive_modes, raw, Self::INVALID)
    }

    pub fn index_format(&self, raw: u8) -> u32 {
        lookup(&self.index_formats, raw, Self::INVALID)
    }

    pub fn blend_equation(&self, raw: u8) -> u32 {
        lookup(&self.blend_equations, raw, Self::INVALID)
    }

    pub fn blend_factor(&self, raw: u8) -> u32 {
        lookup(&self.blend_factors, raw, Self::INVALID)
    }

    pub fn stencil_action(&self, raw: u8) -> u32 {
        lookup(&self.stencil_actions, raw, self.stencil_action_fallback)
    }

    pub fn condition_func(&self, raw: u8) -> u32 {
        lookup(&self.condition_funcs, raw, self.condition_func_fallback)
    }

    pub fn face(&self, raw: u8) -> u32 {
        lookup(&self.faces, raw, self.face_fallback)
    }

    pub fn front_face_rule(&self, raw: u8) -> u32 {
        lookup(&self.front_face_rules, raw, Self::INVALID)
    }

    pub fn feature(&self, raw: u8) -> u32 {
        lookup(&self.features, raw, Self::INVALID)
    }

    pub fn texture_format(&self, raw: u8) -> u32 {
        lookup(&self.texture_formats, raw, Self::INVALID)
    }

    pub fn filter(&self, raw: u8) -> u32 {
        lookup(&self.filters, raw, Self::INVALID)
    }

    pub fn buffer_usage(&self, raw: u8) -> u32 {
        lookup(&self.buffer_usages, raw, Self::INVALID)
    }
}
