//! End-to-end draw path through the public API: bytecode in, driver calls
//! out, with a recording driver standing in for the Vulkan backend.

use std::sync::Arc;

use d3d9vk::runtime::{
    BufferHandle, Light, Material, PipelineDescription, PipelineHandle, SamplerDescription,
    SamplerHandle, StreamSource, TextureHandle,
};
use d3d9vk::{DeviceState, Fvf, GpuDriver, PrimitiveType, RenderManager, RuntimeError, ShaderStage};
use pretty_assertions::assert_eq;

#[derive(Default)]
struct RecordingDriver {
    next_handle: u64,
    pipelines: usize,
    samplers: usize,
    bound_textures: Vec<(u32, TextureHandle)>,
    bound_vertex_buffers: Vec<(u32, BufferHandle)>,
    draws: Vec<(u32, u32)>,
    transforms: usize,
}

impl GpuDriver for RecordingDriver {
    fn create_pipeline(
        &mut self,
        description: &PipelineDescription<'_>,
    ) -> Result<PipelineHandle, RuntimeError> {
        assert!(!description.vertex_spirv.is_empty());
        assert!(!description.pixel_spirv.is_empty());
        self.next_handle += 1;
        self.pipelines += 1;
        Ok(PipelineHandle(self.next_handle))
    }

    fn destroy_pipeline(&mut self, _pipeline: PipelineHandle) {}

    fn create_sampler(
        &mut self,
        _description: &SamplerDescription,
    ) -> Result<SamplerHandle, RuntimeError> {
        self.next_handle += 1;
        self.samplers += 1;
        Ok(SamplerHandle(self.next_handle))
    }

    fn destroy_sampler(&mut self, _sampler: SamplerHandle) {}

    fn bind_pipeline(&mut self, _pipeline: PipelineHandle) {}

    fn bind_sampler(&mut self, _binding: u32, _sampler: SamplerHandle) {}

    fn bind_texture(&mut self, binding: u32, texture: TextureHandle) {
        self.bound_textures.push((binding, texture));
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        self.bound_vertex_buffers.push((slot, buffer));
    }

    fn bind_index_buffer(&mut self, _buffer: BufferHandle) {}

    fn push_transform(&mut self, _matrix: &[f32; 16]) {
        self.transforms += 1;
    }

    fn update_lighting(&mut self, _material: &Material, _lights: &[Light]) {}

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.draws.push((vertex_count, first_vertex));
    }

    fn draw_indexed(&mut self, _index_count: u32, _first_index: u32, _base_vertex: i32) {}
}

fn bytes(tokens: &[u32]) -> Vec<u8> {
    tokens.iter().flat_map(|t| t.to_le_bytes()).collect()
}

// vs_2_0: dcl_position v0; m4x4 oPos, v0, c0
const VS_TOKENS: &[u32] = &[
    0xFFFE_0200,
    0x0200_001F,
    0x8000_0000,
    0x900F_0000,
    0x0300_0014,
    0xC00F_0000,
    0x90E4_0000,
    0xA0E4_0000,
    0x0000_FFFF,
];

// ps_2_0: dcl t0; dcl_2d s0; texld r0, t0, s0; mov oC0, r0
const PS_TOKENS: &[u32] = &[
    0xFFFF_0200,
    0x0200_001F,
    0x8000_0005,
    0xB00F_0000,
    0x0200_001F,
    0x9000_0000,
    0xA00F_0800,
    0x0300_0042,
    0x800F_0000,
    0xB0E4_0000,
    0xA0E4_0800,
    0x0200_0001,
    0x800F_0800,
    0x80E4_0000,
    0x0000_FFFF,
];

#[test]
fn user_shader_draw_reaches_the_driver() {
    let mut manager = RenderManager::new();
    let mut driver = RecordingDriver::default();

    let vertex = manager.shaders().get_or_translate(&bytes(VS_TOKENS)).unwrap();
    let pixel = manager.shaders().get_or_translate(&bytes(PS_TOKENS)).unwrap();
    assert_eq!(vertex.stage(), ShaderStage::Vertex);
    assert_eq!(pixel.stage(), ShaderStage::Pixel);
    assert_eq!(pixel.sampler_bindings.len(), 1);

    let mut state = DeviceState::new();
    state.vertex_shader = Some(Arc::clone(&vertex));
    state.pixel_shader = Some(pixel);
    // XYZ | TEX1, matching the shader's position + texcoord inputs.
    state.fvf = Fvf::from_bits_retain(0x0002 | 0x0100);
    state.streams[0] = Some(StreamSource {
        buffer: BufferHandle(42),
        stride: 20,
        vertex_count: 60,
    });
    state.textures[0] = Some(TextureHandle(9));

    manager
        .draw(&mut driver, &state, PrimitiveType::TriangleList, 20, 0)
        .unwrap();
    manager
        .draw(&mut driver, &state, PrimitiveType::TriangleList, 20, 0)
        .unwrap();

    assert_eq!(driver.pipelines, 1);
    assert_eq!(driver.samplers, 1);
    assert_eq!(driver.draws, vec![(60, 0), (60, 0)]);
    assert_eq!(driver.transforms, 2);
    assert_eq!(driver.bound_textures, vec![(0, TextureHandle(9)), (0, TextureHandle(9))]);
    assert_eq!(driver.bound_vertex_buffers.len(), 2);

    // Re-creating the same bytecode hits the shader cache.
    let again = manager.shaders().get_or_translate(&bytes(VS_TOKENS)).unwrap();
    assert!(Arc::ptr_eq(&vertex, &again));
}

#[test]
fn fixed_function_draw_needs_no_shaders() {
    let mut manager = RenderManager::new();
    let mut driver = RecordingDriver::default();

    let mut state = DeviceState::new();
    // XYZ | DIFFUSE
    state.fvf = Fvf::from_bits_retain(0x0002 | 0x0040);
    state.streams[0] = Some(StreamSource {
        buffer: BufferHandle(1),
        stride: 16,
        vertex_count: 3,
    });

    manager
        .draw(&mut driver, &state, PrimitiveType::TriangleList, 1, 0)
        .unwrap();
    assert_eq!(driver.pipelines, 1);
    assert_eq!(driver.draws, vec![(3, 0)]);
}
