//! Fixed-function fallback shaders.
//!
//! Draws issued without bound shaders get a generated vertex/pixel shader
//! pair synthesized from the FVF's feature set. The generator emits ordinary
//! vs_2_0/ps_2_0 token streams and runs them through the regular translator,
//! so the fallback path exercises exactly the same lowering, caching and
//! interface plumbing as game shaders.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::sm::translate::{translate_tokens, TranslateError, TranslatedShader};
use crate::vertex::Fvf;

/// Feature set a fallback shader pair is generated (and cached) for.
///
/// Point size and specular color are not modeled; FVFs carrying them fold
/// onto the nearest supported combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedFunctionKey {
    pub has_position: bool,
    pub has_color: bool,
    pub has_normal: bool,
    pub texture_count: u8,
    /// `D3DFVF_XYZRHW`: positions are pre-transformed, skip the MVP multiply.
    pub transformed: bool,
}

impl FixedFunctionKey {
    pub fn from_fvf(fvf: Fvf) -> Self {
        if fvf.intersects(Fvf::PSIZE | Fvf::SPECULAR) {
            warn!(
                fvf = format_args!("0x{:04x}", fvf.bits()),
                "point size / specular FVF components are not modeled by the fallback shaders"
            );
        }
        let texture_count = fvf.texture_count().min(2) as u8;
        if fvf.texture_count() > 2 {
            warn!(
                requested = fvf.texture_count(),
                "fallback shaders support at most 2 texture stages"
            );
        }
        Self {
            has_position: fvf.has_position(),
            has_color: fvf.contains(Fvf::DIFFUSE),
            has_normal: fvf.contains(Fvf::NORMAL),
            texture_count,
            transformed: fvf.is_transformed(),
        }
    }

    /// The FVF this key models, for deriving the matching vertex layout.
    pub fn to_fvf(&self) -> Fvf {
        let mut bits = 0u32;
        if self.has_position {
            bits |= if self.transformed { 0x0004 } else { 0x0002 };
        }
        if self.has_normal {
            bits |= 0x0010;
        }
        if self.has_color {
            bits |= 0x0040;
        }
        bits |= (self.texture_count as u32) << 8;
        Fvf::from_bits_retain(bits)
    }
}

/// A generated vertex/pixel module pair.
#[derive(Debug)]
pub struct ShaderPair {
    pub vertex: Arc<TranslatedShader>,
    pub pixel: Arc<TranslatedShader>,
}

#[derive(Default)]
pub struct FixedFunctionCache {
    entries: HashMap<FixedFunctionKey, Arc<ShaderPair>>,
    hits: u64,
    misses: u64,
}

impl FixedFunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &mut self,
        key: FixedFunctionKey,
    ) -> Result<Arc<ShaderPair>, TranslateError> {
        if let Some(pair) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(Arc::clone(pair));
        }
        let pair = Arc::new(ShaderPair {
            vertex: Arc::new(translate_tokens(&generate_vertex_tokens(&key))?),
            pixel: Arc::new(translate_tokens(&generate_pixel_tokens(&key))?),
        });
        self.misses += 1;
        debug!(?key, cached = self.entries.len() + 1, "built fixed-function shader pair");
        self.entries.insert(key, Arc::clone(&pair));
        Ok(pair)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

// Register file encodings for generated parameter tokens
// (D3DSHADER_PARAM_REGISTER_TYPE low/high bit split).
const FILE_TEMP: u32 = 0;
const FILE_INPUT: u32 = 1;
const FILE_CONST: u32 = 2;
const FILE_TEXTURE: u32 = 3;
const FILE_RASTOUT: u32 = 4;
const FILE_ATTROUT: u32 = 5;
const FILE_TEXCOORDOUT: u32 = 6;
const FILE_COLOROUT: u32 = 8;
const FILE_SAMPLER: u32 = 10;

const VS_2_0: u32 = 0xFFFE_0200;
const PS_2_0: u32 = 0xFFFF_0200;
const END: u32 = 0x0000_FFFF;

const OP_MOV: u32 = 0x0200_0001;
const OP_M4X4: u32 = 0x0300_0014;
const OP_MUL: u32 = 0x0300_0005;
const OP_TEXLD: u32 = 0x0300_0042;
const OP_DCL: u32 = 0x0200_001F;
const OP_DEF: u32 = 0x0500_0051;

const USAGE_POSITION: u32 = 0;
const USAGE_NORMAL: u32 = 3;
const USAGE_TEXCOORD: u32 = 5;
const USAGE_COLOR: u32 = 10;

fn dst_token(file: u32, index: u32) -> u32 {
    0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (0xF << 16) | index
}

fn src_token(file: u32, index: u32) -> u32 {
    // Identity swizzle.
    0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (0xE4 << 16) | index
}

fn usage_token(usage: u32, usage_index: u32) -> u32 {
    0x8000_0000 | usage | (usage_index << 16)
}

fn sampler_dcl_token(texture_type: u32) -> u32 {
    0x8000_0000 | (texture_type << 27)
}

fn dcl(tokens: &mut Vec<u32>, usage: u32, usage_index: u32, dst: u32) {
    tokens.push(OP_DCL);
    tokens.push(usage_token(usage, usage_index));
    tokens.push(dst);
}

/// Input registers follow the FVF element order (position, normal, diffuse,
/// texcoords), which keeps shader locations aligned with
/// `layout_from_fvf(key.to_fvf())`.
fn generate_vertex_tokens(key: &FixedFunctionKey) -> Vec<u32> {
    let mut tokens = vec![VS_2_0];
    let mut register = 0u32;

    let position_register = key.has_position.then(|| {
        let r = register;
        dcl(&mut tokens, USAGE_POSITION, 0, dst_token(FILE_INPUT, r));
        register += 1;
        r
    });
    if key.has_normal {
        // Declared so the vertex layout stays aligned; unlit, so unread.
        dcl(&mut tokens, USAGE_NORMAL, 0, dst_token(FILE_INPUT, register));
        register += 1;
    }
    let color_register = key.has_color.then(|| {
        let r = register;
        dcl(&mut tokens, USAGE_COLOR, 0, dst_token(FILE_INPUT, r));
        register += 1;
        r
    });
    let first_texcoord = register;
    for stage in 0..key.texture_count as u32 {
        dcl(
            &mut tokens,
            USAGE_TEXCOORD,
            stage,
            dst_token(FILE_INPUT, register),
        );
        register += 1;
    }

    if let Some(position) = position_register {
        if key.transformed {
            tokens.push(OP_MOV);
            tokens.push(dst_token(FILE_RASTOUT, 0));
            tokens.push(src_token(FILE_INPUT, position));
        } else {
            // c0..c3 carry the push-constant MVP.
            tokens.push(OP_M4X4);
            tokens.push(dst_token(FILE_RASTOUT, 0));
            tokens.push(src_token(FILE_INPUT, position));
            tokens.push(src_token(FILE_CONST, 0));
        }
    }

    match color_register {
        Some(color) => {
            tokens.push(OP_MOV);
            tokens.push(dst_token(FILE_ATTROUT, 0));
            tokens.push(src_token(FILE_INPUT, color));
        }
        None => {
            // No vertex color: pass opaque white.
            tokens.push(OP_DEF);
            tokens.push(dst_token(FILE_CONST, 4));
            tokens.extend([1.0f32.to_bits(); 4]);
            tokens.push(OP_MOV);
            tokens.push(dst_token(FILE_ATTROUT, 0));
            tokens.push(src_token(FILE_CONST, 4));
        }
    }

    for stage in 0..key.texture_count as u32 {
        tokens.push(OP_MOV);
        tokens.push(dst_token(FILE_TEXCOORDOUT, stage));
        tokens.push(src_token(FILE_INPUT, first_texcoord + stage));
    }

    tokens.push(END);
    tokens
}

/// Diffuse color modulated by each bound texture stage.
fn generate_pixel_tokens(key: &FixedFunctionKey) -> Vec<u32> {
    let mut tokens = vec![PS_2_0];

    dcl(&mut tokens, USAGE_COLOR, 0, dst_token(FILE_INPUT, 0));
    for stage in 0..key.texture_count as u32 {
        dcl(
            &mut tokens,
            USAGE_TEXCOORD,
            stage,
            dst_token(FILE_TEXTURE, stage),
        );
        tokens.push(OP_DCL);
        tokens.push(sampler_dcl_token(2)); // 2D
        tokens.push(dst_token(FILE_SAMPLER, stage));
    }

    // r0 accumulates the color.
    tokens.push(OP_MOV);
    tokens.push(dst_token(FILE_TEMP, 0));
    tokens.push(src_token(FILE_INPUT, 0));

    for stage in 0..key.texture_count as u32 {
        tokens.push(OP_TEXLD);
        tokens.push(dst_token(FILE_TEMP, 1));
        tokens.push(src_token(FILE_TEXTURE, stage));
        tokens.push(src_token(FILE_SAMPLER, stage));

        tokens.push(OP_MUL);
        tokens.push(dst_token(FILE_TEMP, 0));
        tokens.push(src_token(FILE_TEMP, 0));
        tokens.push(src_token(FILE_TEMP, 1));
    }

    tokens.push(OP_MOV);
    tokens.push(dst_token(FILE_COLOROUT, 0));
    tokens.push(src_token(FILE_TEMP, 0));

    tokens.push(END);
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::types::ShaderStage;
    use pretty_assertions::assert_eq;

    fn key(color: bool, normal: bool, textures: u8, transformed: bool) -> FixedFunctionKey {
        FixedFunctionKey {
            has_position: true,
            has_color: color,
            has_normal: normal,
            texture_count: textures,
            transformed,
        }
    }

    #[test]
    fn generated_pairs_translate() {
        let mut cache = FixedFunctionCache::new();
        for &k in &[
            key(true, false, 0, false),
            key(true, true, 1, false),
            key(false, false, 2, false),
            key(true, false, 1, true),
        ] {
            let pair = cache.get_or_build(k).unwrap();
            assert_eq!(pair.vertex.stage(), ShaderStage::Vertex);
            assert_eq!(pair.pixel.stage(), ShaderStage::Pixel);
            assert_eq!(pair.pixel.sampler_bindings.len(), k.texture_count as usize);
        }
        assert_eq!(cache.misses(), 4);
    }

    #[test]
    fn vertex_inputs_align_with_the_fvf_layout() {
        let mut cache = FixedFunctionCache::new();
        let k = key(true, true, 1, false);
        let pair = cache.get_or_build(k).unwrap();
        let layout = crate::vertex::layout_from_fvf(k.to_fvf());
        assert_eq!(pair.vertex.attributes.len(), layout.attributes.len());
        for (shader, element) in pair.vertex.attributes.iter().zip(&layout.attributes) {
            assert_eq!(shader.location, element.location);
        }
    }

    #[test]
    fn cache_reuses_built_pairs() {
        let mut cache = FixedFunctionCache::new();
        let k = key(true, false, 0, false);
        let first = cache.get_or_build(k).unwrap();
        let second = cache.get_or_build(k).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_fold_unsupported_fvf_bits() {
        // XYZ | PSIZE | TEX4
        let fvf = Fvf::from_bits_retain(0x0002 | 0x0020 | 0x0400);
        let k = FixedFunctionKey::from_fvf(fvf);
        assert!(k.has_position);
        assert!(!k.has_color);
        assert_eq!(k.texture_count, 2);
        assert!(!k.transformed);
    }
}
