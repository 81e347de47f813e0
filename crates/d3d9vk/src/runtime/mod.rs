//! Runtime device state, shader constant slots, and the driver seam the
//! render manager draws through.
//!
//! The [`GpuDriver`] trait is the boundary between state tracking and the
//! Vulkan backend: everything above it (caching, fingerprinting, fallback
//! selection, count clamping) is plain data manipulation and unit-testable
//! with a mock driver.

pub mod render;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::sm::lower::{
    SPEC_BOOL_COUNT, SPEC_FLOAT_COUNT, SPEC_ID_BOOL_BASE, SPEC_ID_FLOAT_BASE, SPEC_ID_INT_BASE,
    SPEC_INT_COUNT,
};
use crate::sm::translate::{TranslateError, TranslatedShader};
use crate::state::{PrimitiveType, RenderStateBlock, SamplerStateBlock, TextureAddress, TextureFilter};
use crate::vertex::{DeclarationError, Fvf, VertexDeclaration, VertexLayout};

pub use render::RenderManager;

pub const MAX_SAMPLER_SLOTS: usize = 16;
pub const MAX_STREAM_SOURCES: usize = 16;
pub const MAX_LIGHTS: usize = 8;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
    #[error("no vertex stream bound for draw")]
    MissingStreamSource,
    #[error("no index buffer bound for indexed draw")]
    MissingIndexBuffer,
    #[error("driver error: {message}")]
    Driver { message: String },
}

/// Opaque backend handles. The driver owns the underlying objects; the
/// caches only track identity and age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// The full shader constant register file for one stage, laid out exactly as
/// the translator's specialization-constant ids expect: booleans, then the
/// integer registers, then the float registers.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ShaderConstantSlots {
    pub boolean: [u32; SPEC_BOOL_COUNT as usize],
    pub integer: [i32; SPEC_INT_COUNT as usize * 4],
    pub float: [f32; SPEC_FLOAT_COUNT as usize * 4],
}

impl Default for ShaderConstantSlots {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl ShaderConstantSlots {
    pub fn set_bool(&mut self, register: usize, value: bool) {
        if let Some(slot) = self.boolean.get_mut(register) {
            *slot = value as u32;
        }
    }

    pub fn set_int(&mut self, register: usize, value: [i32; 4]) {
        if let Some(slots) = self.integer.get_mut(register * 4..register * 4 + 4) {
            slots.copy_from_slice(&value);
        }
    }

    pub fn set_float(&mut self, register: usize, value: [f32; 4]) {
        if let Some(slots) = self.float.get_mut(register * 4..register * 4 + 4) {
            slots.copy_from_slice(&value);
        }
    }

    /// Specialization data words, one per specialization id. Word `i` is the
    /// value for spec id `i`, so map entries are the identity mapping.
    pub fn spec_words(&self) -> Vec<u32> {
        debug_assert_eq!(SPEC_ID_INT_BASE as usize, self.boolean.len());
        debug_assert_eq!(
            SPEC_ID_FLOAT_BASE as usize,
            self.boolean.len() + self.integer.len()
        );
        let mut words =
            Vec::with_capacity(self.boolean.len() + self.integer.len() + self.float.len());
        words.extend_from_slice(&self.boolean);
        words.extend_from_slice(bytemuck::cast_slice(&self.integer));
        words.extend_from_slice(bytemuck::cast_slice(&self.float));
        words
    }
}

/// `D3DLIGHT9`, laid out std140-compatible for direct buffer upload.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Light {
    /// 1 point, 2 spot, 3 directional.
    pub light_type: u32,
    pub enabled: u32,
    pub _reserved: [u32; 2],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub ambient: [f32; 4],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    pub range: f32,
    pub falloff: f32,
    pub attenuation0: f32,
    pub attenuation1: f32,
    pub attenuation2: f32,
    pub theta: f32,
    pub phi: f32,
    pub _reserved2: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// `D3DMATERIAL9`, padded to 16-byte rows for direct buffer upload.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Material {
    pub diffuse: [f32; 4],
    pub ambient: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub power: f32,
    pub _reserved: [f32; 3],
}

impl Default for Material {
    /// D3D9 device default: opaque white diffuse, everything else zero.
    fn default() -> Self {
        Self {
            diffuse: [1.0, 1.0, 1.0, 1.0],
            ..Self::zeroed()
        }
    }
}

/// One bound vertex stream. The stride is the app-supplied binding stride,
/// which can legally differ from what the FVF or declaration implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSource {
    pub buffer: BufferHandle,
    pub stride: u32,
    pub vertex_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuffer {
    pub buffer: BufferHandle,
    pub index_count: u32,
}

/// Everything the device tracks between draws that the render manager reads.
#[derive(Default)]
pub struct DeviceState {
    pub vertex_shader: Option<Arc<TranslatedShader>>,
    pub pixel_shader: Option<Arc<TranslatedShader>>,
    pub fvf: Fvf,
    pub declaration: Option<VertexDeclaration>,
    pub render_state: RenderStateBlock,
    pub samplers: [SamplerStateBlock; MAX_SAMPLER_SLOTS],
    pub textures: [Option<TextureHandle>; MAX_SAMPLER_SLOTS],
    pub material: Material,
    pub lights: [Light; MAX_LIGHTS],
    pub vertex_constants: ShaderConstantSlots,
    pub pixel_constants: ShaderConstantSlots,
    /// Column-major 4x4 transforms.
    pub world: [f32; 16],
    pub view: [f32; 16],
    pub projection: [f32; 16],
    pub streams: [Option<StreamSource>; MAX_STREAM_SOURCES],
    pub index_buffer: Option<IndexBuffer>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            world: IDENTITY_MATRIX,
            view: IDENTITY_MATRIX,
            projection: IDENTITY_MATRIX,
            material: Material::default(),
            ..Self::default()
        }
    }

    /// The combined model-view-projection matrix pushed to the vertex stage
    /// on fixed-function draws.
    pub fn mvp(&self) -> [f32; 16] {
        multiply_matrices(&self.projection, &multiply_matrices(&self.view, &self.world))
    }

    /// The app-supplied `c0..c3` block, pushed verbatim when a programmable
    /// vertex shader is bound.
    pub fn vertex_push_constants(&self) -> [f32; 16] {
        let mut block = [0.0f32; 16];
        block.copy_from_slice(&self.vertex_constants.float[..16]);
        block
    }

    /// One past the highest bound stream slot.
    pub fn stream_count(&self) -> u32 {
        self.streams
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |slot| slot as u32 + 1)
    }

    /// Bound textures in contiguous slots starting at 0; a gap ends the run,
    /// matching how the fixed-function stage counts active textures.
    pub fn active_texture_count(&self) -> u32 {
        self.textures
            .iter()
            .take_while(|slot| slot.is_some())
            .count() as u32
    }
}

pub const IDENTITY_MATRIX: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Column-major product `a * b`.
pub fn multiply_matrices(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for column in 0..4 {
        for row in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[k * 4 + row] * b[column * 4 + k];
            }
            out[column * 4 + row] = sum;
        }
    }
    out
}

/// Vulkan-facing sampler parameters, post state normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescription {
    pub mag_filter: TextureFilter,
    pub min_filter: TextureFilter,
    pub mipmap_linear: bool,
    pub address_u: TextureAddress,
    pub address_v: TextureAddress,
    pub address_w: TextureAddress,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub mip_lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
}

/// Everything a graphics pipeline bakes in.
pub struct PipelineDescription<'a> {
    pub topology: PrimitiveType,
    /// Attribute locations, offsets and formats. The binding strides come
    /// from `stream_strides`, not from the layout.
    pub vertex_layout: &'a VertexLayout,
    /// Binding stride per bound stream slot, in slot order.
    pub stream_strides: &'a [u32],
    pub vertex_spirv: &'a [u32],
    pub pixel_spirv: &'a [u32],
    pub render_state: &'a RenderStateBlock,
    pub vertex_spec_data: &'a [u32],
    pub pixel_spec_data: &'a [u32],
}

/// The backend seam. A production implementation wraps a Vulkan device and
/// command buffer; tests substitute a recording mock.
pub trait GpuDriver {
    fn create_pipeline(
        &mut self,
        description: &PipelineDescription<'_>,
    ) -> Result<PipelineHandle, RuntimeError>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
    fn create_sampler(
        &mut self,
        description: &SamplerDescription,
    ) -> Result<SamplerHandle, RuntimeError>;
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn bind_pipeline(&mut self, pipeline: PipelineHandle);
    fn bind_sampler(&mut self, binding: u32, sampler: SamplerHandle);
    /// Write the combined image-sampler descriptor for one binding.
    fn bind_texture(&mut self, binding: u32, texture: TextureHandle);
    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle);
    fn bind_index_buffer(&mut self, buffer: BufferHandle);
    /// Upload the model-view-projection matrix to the push-constant block.
    fn push_transform(&mut self, matrix: &[f32; 16]);
    /// Upload the material and light uniform buffers. Called outside a render
    /// pass, and only when the blocks actually changed.
    fn update_lighting(&mut self, material: &Material, lights: &[Light]);

    fn draw(&mut self, vertex_count: u32, first_vertex: u32);
    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spec_words_follow_the_id_layout() {
        let mut slots = ShaderConstantSlots::default();
        slots.set_bool(1, true);
        slots.set_int(0, [7, 8, 9, 10]);
        slots.set_float(2, [1.0, 2.0, 3.0, 4.0]);

        let words = slots.spec_words();
        assert_eq!(words.len(), 16 + 64 + 1024);
        assert_eq!(words[SPEC_ID_BOOL_BASE as usize + 1], 1);
        assert_eq!(words[SPEC_ID_INT_BASE as usize], 7);
        assert_eq!(words[SPEC_ID_INT_BASE as usize + 3], 10);
        assert_eq!(
            words[SPEC_ID_FLOAT_BASE as usize + 8],
            1.0f32.to_bits()
        );

        // Out-of-range writes are dropped, not panics.
        slots.set_float(4096, [1.0; 4]);
        slots.set_bool(99, true);
    }

    #[test]
    fn texture_count_stops_at_the_first_gap() {
        let mut state = DeviceState::new();
        assert_eq!(state.active_texture_count(), 0);

        state.textures[0] = Some(TextureHandle(1));
        state.textures[1] = Some(TextureHandle(2));
        assert_eq!(state.active_texture_count(), 2);

        // A slot-3 binding beyond a gap does not extend the run.
        state.textures[3] = Some(TextureHandle(3));
        assert_eq!(state.active_texture_count(), 2);
    }

    #[test]
    fn stream_count_covers_the_highest_bound_slot() {
        let mut state = DeviceState::new();
        assert_eq!(state.stream_count(), 0);
        state.streams[0] = Some(StreamSource {
            buffer: BufferHandle(1),
            stride: 16,
            vertex_count: 4,
        });
        state.streams[2] = Some(StreamSource {
            buffer: BufferHandle(2),
            stride: 8,
            vertex_count: 4,
        });
        assert_eq!(state.stream_count(), 3);
    }

    #[test]
    fn matrix_multiply_against_identity() {
        let m: [f32; 16] = core::array::from_fn(|i| i as f32);
        assert_eq!(multiply_matrices(&IDENTITY_MATRIX, &m), m);
        assert_eq!(multiply_matrices(&m, &IDENTITY_MATRIX), m);
    }

    #[test]
    fn mvp_composes_world_then_view_then_projection() {
        let mut state = DeviceState::new();
        // Scale by 2 in world, translate x+1 in view.
        state.world[0] = 2.0;
        state.world[5] = 2.0;
        state.world[10] = 2.0;
        state.view[12] = 1.0;
        let mvp = state.mvp();
        // Column 0 scaled, translation column preserved.
        assert_eq!(mvp[0], 2.0);
        assert_eq!(mvp[12], 1.0);
    }
}
