//! Backup and restore of backend global state.
//!
//! The host UI overlay draws into the same native context as the emulator. Around every batch
//! of emulator drawing the dispatcher captures a [`StateSnapshot`] and loads it back afterwards,
//! so the overlay finds the context exactly as it left it. There is one backup slot; a second
//! backup overwrites the first.

use crate::backend::{BackendError, BlendState, GraphicsBackend, NativeEnums, PixelBox};
use crate::types::Feature;

/// Features saved and restored with a snapshot.
const SAVED_FEATURES: [Feature; 5] = [
    Feature::Blend,
    Feature::Cull,
    Feature::DepthTest,
    Feature::Clipping,
    Feature::StencilTest,
];

/// Native capability of each saved feature, or `None` where the backend has no equivalent.
fn saved_caps(enums: &NativeEnums) -> [Option<u32>; SAVED_FEATURES.len()] {
    SAVED_FEATURES.map(|feature| {
        let cap = enums.feature(feature.to_raw());
        (cap != NativeEnums::INVALID).then_some(cap)
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub program: u32,
    pub active_texture_unit: u32,
    /// Texture bound on each unit, indexed by unit.
    pub textures: Vec<u32>,
    pub array_buffer: u32,
    pub element_buffer: u32,
    pub input_layout: u32,
    pub framebuffer: u32,
    pub blend: BlendState,
    pub viewport: PixelBox,
    pub scissor: PixelBox,
    /// Enable state of each feature in `SAVED_FEATURES` order.
    pub enabled: [bool; SAVED_FEATURES.len()],
}

impl StateSnapshot {
    pub fn capture<B: GraphicsBackend + ?Sized>(backend: &B) -> Self {
        let enums = backend.enums();
        Self {
            program: backend.bound_program(),
            active_texture_unit: backend.active_texture_unit(),
            textures: (0..backend.texture_units())
                .map(|unit| backend.bound_texture(unit))
                .collect(),
            array_buffer: backend.bound_buffer(enums.array_buffer),
            element_buffer: backend.bound_buffer(enums.element_array_buffer),
            input_layout: backend.bound_input_layout(),
            framebuffer: backend.bound_framebuffer(),
            blend: backend.blend_state(),
            viewport: backend.viewport_box(),
            scissor: backend.scissor_box(),
            enabled: saved_caps(enums).map(|cap| cap.is_some_and(|cap| backend.is_enabled(cap))),
        }
    }

    /// Writes every saved field back.
    ///
    /// A field that fails to restore (typically a binding to an object destroyed in the
    /// meantime) does not stop the others; the first error is returned after all were tried.
    pub fn load<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) -> Result<(), BackendError> {
        let enums = backend.enums();
        let mut first_err = None;
        let mut note = |res: Result<(), BackendError>| {
            if let Err(err) = res {
                first_err.get_or_insert(err);
            }
        };

        for (unit, &texture) in (0u32..).zip(&self.textures) {
            if backend.bound_texture(unit) == texture {
                continue;
            }
            note(backend.active_texture(unit));
            note(backend.bind_texture(texture));
        }
        note(backend.active_texture(self.active_texture_unit));
        note(backend.use_program(self.program));
        note(backend.bind_buffer(enums.array_buffer, self.array_buffer));
        note(backend.bind_buffer(enums.element_array_buffer, self.element_buffer));
        note(backend.bind_input_layout(self.input_layout));
        note(backend.bind_framebuffer(self.framebuffer));
        note(backend.blend_equation_separate(self.blend.equation_rgb, self.blend.equation_alpha));
        note(backend.blend_func_separate(
            self.blend.src_rgb,
            self.blend.dst_rgb,
            self.blend.src_alpha,
            self.blend.dst_alpha,
        ));
        note(backend.viewport(self.viewport));
        note(backend.scissor(self.scissor));
        for (cap, enabled) in saved_caps(enums).into_iter().zip(self.enabled) {
            if let Some(cap) = cap {
                note(backend.set_enabled(cap, enabled));
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
