//! The render manager: pipeline and sampler caching, fixed-function fallback
//! selection, transform upload and draw-count clamping.
//!
//! Both caches are linear scans over fingerprinted keys. Hit rates are high
//! because games settle into a small working set of state combinations; a
//! scan over a few dozen entries beats hashing multi-kilobyte keys every
//! draw. Entries refresh a last-used stamp on every hit and are swept at
//! present time once they exceed the configured age.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::fixed_function::{FixedFunctionCache, FixedFunctionKey};
use crate::sm::translate::ShaderCache;
use crate::state::{PrimitiveType, RenderStateBlock, SamplerStateBlock, TextureFilter};
use crate::vertex::{layout_from_declaration, layout_from_fvf, VertexLayout};

use super::{
    DeviceState, GpuDriver, PipelineDescription, PipelineHandle, RuntimeError,
    SamplerDescription, SamplerHandle, ShaderConstantSlots, MAX_STREAM_SOURCES,
};

/// How long an unused pipeline or sampler survives across presents.
const DEFAULT_CACHE_AGE: Duration = Duration::from_secs(60);

/// Vulkan's "no clamp" LOD sentinel.
const LOD_CLAMP_NONE: f32 = 1000.0;

/// Everything that distinguishes one baked pipeline from another. Two draws
/// with equal keys can share a pipeline object.
#[derive(PartialEq)]
struct PipelineKey {
    topology: PrimitiveType,
    vertex_fingerprint: u64,
    pixel_fingerprint: u64,
    layout: VertexLayout,
    // The app-supplied binding strides, which can differ from what the
    // layout implies; a stride change must rebuild the pipeline.
    stream_count: u32,
    stream_strides: [u32; MAX_STREAM_SOURCES],
    render_state: RenderStateBlock,
    // Specialization data is baked into the pipeline, so the constant slots
    // are part of its identity.
    vertex_constants: ShaderConstantSlots,
    pixel_constants: ShaderConstantSlots,
}

struct CachedPipeline {
    key: PipelineKey,
    handle: PipelineHandle,
    last_used: Instant,
}

struct CachedSampler {
    description: SamplerDescription,
    handle: SamplerHandle,
    last_used: Instant,
}

pub struct RenderManager {
    shaders: ShaderCache,
    fixed_function: FixedFunctionCache,
    pipelines: Vec<CachedPipeline>,
    samplers: Vec<CachedSampler>,
    /// Hash of the last-uploaded material + light blocks.
    lighting_fingerprint: Option<u64>,
    max_age: Duration,
    pipeline_hits: u64,
    pipeline_misses: u64,
    sampler_hits: u64,
    sampler_misses: u64,
}

impl RenderManager {
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_CACHE_AGE)
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            shaders: ShaderCache::new(),
            fixed_function: FixedFunctionCache::new(),
            pipelines: Vec::new(),
            samplers: Vec::new(),
            lighting_fingerprint: None,
            max_age,
            pipeline_hits: 0,
            pipeline_misses: 0,
            sampler_hits: 0,
            sampler_misses: 0,
        }
    }

    /// The bytecode-to-SPIR-V cache, for the device's shader creation path.
    pub fn shaders(&mut self) -> &mut ShaderCache {
        &mut self.shaders
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn pipeline_hits(&self) -> u64 {
        self.pipeline_hits
    }

    pub fn pipeline_misses(&self) -> u64 {
        self.pipeline_misses
    }

    /// Bind everything a draw needs: pipeline (cached or freshly built),
    /// samplers for every stage binding, and the push-constant transform.
    pub fn begin_draw(
        &mut self,
        driver: &mut dyn GpuDriver,
        state: &DeviceState,
        topology: PrimitiveType,
    ) -> Result<(), RuntimeError> {
        let (vertex, pixel, fallback_key) = match (&state.vertex_shader, &state.pixel_shader) {
            (Some(vertex), Some(pixel)) => (Arc::clone(vertex), Arc::clone(pixel), None),
            (vertex, pixel) => {
                let mut key = FixedFunctionKey::from_fvf(state.fvf);
                // The fallback only samples textures that are actually bound.
                key.texture_count = key.texture_count.min(state.active_texture_count() as u8);
                let pair = self.fixed_function.get_or_build(key)?;
                (
                    vertex.clone().unwrap_or_else(|| Arc::clone(&pair.vertex)),
                    pixel.clone().unwrap_or_else(|| Arc::clone(&pair.pixel)),
                    Some(key),
                )
            }
        };

        let layout = match &state.declaration {
            Some(declaration) => layout_from_declaration(declaration, &vertex.attributes)?,
            None => {
                // A user vertex shader reads the full FVF layout; only the
                // fallback shaders are limited to the folded key's subset.
                let fvf = if state.vertex_shader.is_some() {
                    state.fvf
                } else {
                    fallback_key.map(|key| key.to_fvf()).unwrap_or(state.fvf)
                };
                let layout = layout_from_fvf(fvf);
                if layout.attributes.len() < vertex.attributes.len() {
                    warn!(
                        fvf_attributes = layout.attributes.len(),
                        shader_inputs = vertex.attributes.len(),
                        "FVF supplies fewer attributes than the vertex shader reads"
                    );
                }
                layout
            }
        };

        // Depth bias only applies to filled primitives with depth testing on;
        // zero it out of the key so line and point draws share pipelines.
        let mut render_state = state.render_state;
        if !(topology.is_triangle() && render_state.z_enable) {
            render_state.depth_bias = 0.0;
            render_state.slope_scale_depth_bias = 0.0;
        }

        let mut stream_strides = [0u32; MAX_STREAM_SOURCES];
        for (slot, stream) in state.streams.iter().enumerate() {
            if let Some(stream) = stream {
                stream_strides[slot] = stream.stride;
            }
        }

        let key = PipelineKey {
            topology,
            vertex_fingerprint: vertex.fingerprint,
            pixel_fingerprint: pixel.fingerprint,
            layout,
            stream_count: state.stream_count(),
            stream_strides,
            render_state,
            vertex_constants: state.vertex_constants,
            pixel_constants: state.pixel_constants,
        };
        let now = Instant::now();
        let handle = match self.pipelines.iter().position(|entry| entry.key == key) {
            Some(index) => {
                self.pipelines[index].last_used = now;
                self.pipeline_hits += 1;
                self.pipelines[index].handle
            }
            None => {
                let vertex_spec = key.vertex_constants.spec_words();
                let pixel_spec = key.pixel_constants.spec_words();
                let description = PipelineDescription {
                    topology,
                    vertex_layout: &key.layout,
                    stream_strides: &key.stream_strides[..key.stream_count as usize],
                    vertex_spirv: &vertex.words,
                    pixel_spirv: &pixel.words,
                    render_state: &key.render_state,
                    vertex_spec_data: &vertex_spec,
                    pixel_spec_data: &pixel_spec,
                };
                let handle = driver.create_pipeline(&description)?;
                self.pipeline_misses += 1;
                debug!(
                    pipelines = self.pipelines.len() + 1,
                    ?topology,
                    "created graphics pipeline"
                );
                self.pipelines.push(CachedPipeline {
                    key,
                    handle,
                    last_used: now,
                });
                handle
            }
        };
        driver.bind_pipeline(handle);

        for (slot, stream) in state.streams.iter().enumerate() {
            if let Some(stream) = stream {
                driver.bind_vertex_buffer(slot as u32, stream.buffer);
            }
        }

        for binding in vertex.sampler_bindings.iter().chain(&pixel.sampler_bindings) {
            let slot = state
                .samplers
                .get(binding.binding as usize)
                .copied()
                .unwrap_or_default();
            let description = normalize_sampler(&slot);
            let handle = match self
                .samplers
                .iter()
                .position(|entry| entry.description == description)
            {
                Some(index) => {
                    self.samplers[index].last_used = now;
                    self.sampler_hits += 1;
                    self.samplers[index].handle
                }
                None => {
                    let handle = driver.create_sampler(&description)?;
                    self.sampler_misses += 1;
                    self.samplers.push(CachedSampler {
                        description,
                        handle,
                        last_used: now,
                    });
                    handle
                }
            };
            driver.bind_sampler(binding.binding, handle);

            match state.textures.get(binding.binding as usize).copied().flatten() {
                Some(texture) => driver.bind_texture(binding.binding, texture),
                None => warn!(
                    binding = binding.binding,
                    "shader samples a texture slot with no texture bound"
                ),
            }
        }

        // Fixed-function draws consume the material/light uniform buffers;
        // upload lazily, outside the render pass, only when they changed.
        if fallback_key.is_some() {
            let mut bytes = Vec::with_capacity(
                core::mem::size_of_val(&state.material) + core::mem::size_of_val(&state.lights),
            );
            bytes.extend_from_slice(bytemuck::bytes_of(&state.material));
            bytes.extend_from_slice(bytemuck::cast_slice(&state.lights));
            let fingerprint = xxh3_64(&bytes);
            if self.lighting_fingerprint != Some(fingerprint) {
                driver.update_lighting(&state.material, &state.lights);
                self.lighting_fingerprint = Some(fingerprint);
            }
        }

        // Programmable draws get the app's own c0..c3 block verbatim; only
        // fixed-function draws derive the matrix from SetTransform state.
        let transform = if state.vertex_shader.is_some() {
            state.vertex_push_constants()
        } else {
            state.mvp()
        };
        driver.push_transform(&transform);
        Ok(())
    }

    /// Non-indexed draw. The vertex count implied by the primitive count is
    /// clamped to what the bound streams can actually supply; a draw that
    /// would read past a buffer shrinks instead of faulting.
    pub fn draw(
        &mut self,
        driver: &mut dyn GpuDriver,
        state: &DeviceState,
        topology: PrimitiveType,
        primitive_count: u32,
        start_vertex: u32,
    ) -> Result<(), RuntimeError> {
        let capacity = stream_capacity(state)?;
        self.begin_draw(driver, state, topology)?;
        let requested = topology.vertex_count(primitive_count);
        let available = capacity.saturating_sub(start_vertex);
        let count = requested.min(available);
        if count < requested {
            warn!(requested, available, "clamping draw to the bound vertex buffer");
        }
        if count == 0 {
            return Ok(());
        }
        driver.draw(count, start_vertex);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        driver: &mut dyn GpuDriver,
        state: &DeviceState,
        topology: PrimitiveType,
        primitive_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) -> Result<(), RuntimeError> {
        stream_capacity(state)?;
        let indices = state.index_buffer.ok_or(RuntimeError::MissingIndexBuffer)?;
        self.begin_draw(driver, state, topology)?;
        driver.bind_index_buffer(indices.buffer);
        let requested = topology.vertex_count(primitive_count);
        let available = indices.index_count.saturating_sub(first_index);
        let count = requested.min(available);
        if count < requested {
            warn!(requested, available, "clamping draw to the bound index buffer");
        }
        if count == 0 {
            return Ok(());
        }
        driver.draw_indexed(count, first_index, base_vertex);
        Ok(())
    }

    /// End-of-frame sweep: destroy pipelines and samplers that have not been
    /// used within the configured age.
    pub fn present(&mut self, driver: &mut dyn GpuDriver) {
        let now = Instant::now();
        let max_age = self.max_age;
        self.pipelines.retain(|entry| {
            if now.duration_since(entry.last_used) >= max_age {
                driver.destroy_pipeline(entry.handle);
                false
            } else {
                true
            }
        });
        self.samplers.retain(|entry| {
            if now.duration_since(entry.last_used) >= max_age {
                driver.destroy_sampler(entry.handle);
                false
            } else {
                true
            }
        });
        debug!(
            pipelines = self.pipelines.len(),
            samplers = self.samplers.len(),
            "cache sweep after present"
        );
    }
}

impl Default for RenderManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest vertex capacity across the bound streams; stream 0 must be bound.
fn stream_capacity(state: &DeviceState) -> Result<u32, RuntimeError> {
    state.streams[0].ok_or(RuntimeError::MissingStreamSource)?;
    Ok(state
        .streams
        .iter()
        .flatten()
        .map(|stream| stream.vertex_count)
        .min()
        .unwrap_or(0))
}

/// D3D sampler state to Vulkan sampler parameters.
///
/// Anisotropy is only honored when a filter asks for it, clamped to the
/// widest commonly supported ratio. A mip filter of NONE pins sampling to the
/// base level instead of disabling mips structurally.
fn normalize_sampler(slot: &SamplerStateBlock) -> SamplerDescription {
    let anisotropy_enable = slot.mag_filter == TextureFilter::Anisotropic
        || slot.min_filter == TextureFilter::Anisotropic;
    let max_anisotropy = if anisotropy_enable {
        slot.max_anisotropy.clamp(1, 16) as f32
    } else {
        1.0
    };
    let (mipmap_linear, max_lod) = match slot.mip_filter {
        TextureFilter::None => (false, 0.0),
        TextureFilter::Linear => (true, LOD_CLAMP_NONE),
        TextureFilter::Point | TextureFilter::Anisotropic => (false, LOD_CLAMP_NONE),
    };
    SamplerDescription {
        mag_filter: slot.mag_filter,
        min_filter: slot.min_filter,
        mipmap_linear,
        address_u: slot.address_u,
        address_v: slot.address_v,
        address_w: slot.address_w,
        anisotropy_enable,
        max_anisotropy,
        mip_lod_bias: slot.mip_lod_bias,
        min_lod: slot.max_mip_level as f32,
        max_lod,
    }
}
