//! End-to-end shader translation: D3D9 bytecode in, SPIR-V words out.
//!
//! [`translate`] decodes a token stream and lowers every instruction into a
//! single `main` function. [`ShaderCache`] memoizes translation keyed on a
//! blake3 hash of the bytecode, so re-creating the same shader across device
//! resets costs a hash instead of a full lowering pass.

use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::sm::decode::{self, DecodeError, DecodedShader};
use crate::sm::lower::Lowerer;
use crate::sm::model::{SamplerBinding, ShaderInputAttribute};
use crate::sm::types::{ShaderStage, ShaderVersion};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A register that should have been bound (constants, declared inputs)
    /// had no binding. Never silently substituted with a zero id.
    #[error("unresolved register {register} at token {token_index}")]
    UnresolvedRegister { register: String, token_index: usize },
    /// An id was used as an operand without a recorded result type.
    #[error("no recorded type for id %{id}")]
    UnresolvedId { id: u32 },
    #[error("unsupported register {register} at token {token_index}")]
    UnsupportedRegister { register: String, token_index: usize },
    #[error("cannot lower `{opcode}` at token {token_index}: {message}")]
    Lower {
        opcode: &'static str,
        token_index: usize,
        message: String,
    },
    #[error("control flow error at token {token_index}: {message}")]
    ControlFlow { token_index: usize, message: String },
}

/// A lowered shader plus the interface metadata the pipeline builder needs.
#[derive(Debug, Clone)]
pub struct TranslatedShader {
    pub version: ShaderVersion,
    pub words: Vec<u32>,
    /// Vertex input attributes, in declaration order. Empty for pixel
    /// shaders.
    pub attributes: Vec<ShaderInputAttribute>,
    /// Combined image-sampler bindings referenced by the shader.
    pub sampler_bindings: Vec<SamplerBinding>,
    /// Content hash of the module words, used in pipeline cache keys.
    pub fingerprint: u64,
}

impl TranslatedShader {
    pub fn stage(&self) -> ShaderStage {
        self.version.stage
    }

    /// The module as bytes, as Vulkan's shader-module creation wants it.
    pub fn spirv_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }
}

/// Translate D3D9 shader bytecode (little-endian bytes) to SPIR-V.
pub fn translate(bytecode: &[u8]) -> Result<TranslatedShader, TranslateError> {
    let decoded = decode::decode_u8_le_bytes(bytecode)?;
    translate_decoded(&decoded)
}

/// Translate an already-tokenized stream.
pub fn translate_tokens(tokens: &[u32]) -> Result<TranslatedShader, TranslateError> {
    let decoded = decode::decode_tokens(tokens)?;
    translate_decoded(&decoded)
}

fn translate_decoded(decoded: &DecodedShader) -> Result<TranslatedShader, TranslateError> {
    let mut lowerer = Lowerer::new(decoded.version)?;
    for instruction in &decoded.instructions {
        lowerer.lower_instruction(instruction)?;
    }
    let module = lowerer.finish()?;
    debug!(
        version = %decoded.version,
        instructions = decoded.instructions.len(),
        words = module.words.len(),
        "lowered shader module"
    );
    let fingerprint = xxh3_64(bytemuck::cast_slice(&module.words));
    Ok(TranslatedShader {
        version: decoded.version,
        words: module.words,
        attributes: module.attributes,
        sampler_bindings: module.sampler_bindings,
        fingerprint,
    })
}

/// Content-addressed cache of translated shaders.
#[derive(Default)]
pub struct ShaderCache {
    entries: HashMap<blake3::Hash, Arc<TranslatedShader>>,
    hits: u64,
    misses: u64,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate `bytecode`, or return the cached module for byte-identical
    /// bytecode. Failed translations are not cached; a later retry with the
    /// same bytes fails the same way.
    pub fn get_or_translate(
        &mut self,
        bytecode: &[u8],
    ) -> Result<Arc<TranslatedShader>, TranslateError> {
        let key = blake3::hash(bytecode);
        if let Some(shader) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(Arc::clone(shader));
        }
        let shader = Arc::new(translate(bytecode)?);
        self.misses += 1;
        debug!(
            version = %shader.version,
            words = shader.words.len(),
            cached = self.entries.len() + 1,
            "translated and cached shader"
        );
        self.entries.insert(key, Arc::clone(&shader));
        Ok(shader)
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

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::{self, op};
    use pretty_assertions::assert_eq;

    const VS_2_0: u32 = 0xFFFE_0200;
    const PS_2_0: u32 = 0xFFFF_0200;
    const END: u32 = 0x0000_FFFF;

    fn dst_token(file: u32, index: u32, mask: u32) -> u32 {
        0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (mask << 16) | index
    }

    fn src_token(file: u32, index: u32, swizzle: u32) -> u32 {
        0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (swizzle << 16) | index
    }

    fn tokens_to_bytes(tokens: &[u32]) -> Vec<u8> {
        tokens.iter().flat_map(|t| t.to_le_bytes()).collect()
    }

    /// Walk the instruction stream and collect opcodes, validating that the
    /// embedded word counts tile the module exactly.
    fn opcodes(words: &[u32]) -> Vec<u16> {
        assert_eq!(words[0], spirv::MAGIC_NUMBER);
        let mut out = Vec::new();
        let mut index = 5;
        while index < words.len() {
            let word = words[index];
            let count = (word >> 16) as usize;
            assert!(count > 0, "zero-length instruction at word {index}");
            out.push((word & 0xFFFF) as u16);
            index += count;
        }
        assert_eq!(index, words.len());
        out
    }

    fn simple_vs() -> Vec<u32> {
        // vs_2_0: mov oPos, v0
        vec![
            VS_2_0,
            0x0200_0001,
            dst_token(4, 0, 0xF),
            src_token(1, 0, 0xE4),
            END,
        ]
    }

    #[test]
    fn vertex_passthrough_translates() {
        let shader = translate_tokens(&simple_vs()).unwrap();
        assert_eq!(shader.stage(), ShaderStage::Vertex);
        assert_eq!(shader.attributes.len(), 1);
        assert_eq!(shader.attributes[0].location, 0);
        assert!(shader.sampler_bindings.is_empty());

        let ops = opcodes(&shader.words);
        assert_eq!(ops[0], op::CAPABILITY);
        assert!(ops.contains(&op::ENTRY_POINT));
        assert!(ops.contains(&op::FUNCTION_END));
        // The y-flip multiplies the final position.
        assert!(ops.contains(&op::F_MUL));
        // Id bound covers every allocated id.
        assert!(shader.words[3] > 1);
    }

    #[test]
    fn pixel_texld_surfaces_sampler_binding() {
        // ps_2_0: dcl_2d s0; dcl t0; texld r0, t0, s0; mov oC0, r0
        let tokens = vec![
            PS_2_0,
            0x0200_001F, // dcl sampler, texture type 2 (2D) in bits 27..30
            0x8000_0000 | (2 << 27),
            dst_token(10, 0, 0xF),
            0x0200_001F, // dcl t0 (texcoord usage 5)
            0x8000_0005,
            dst_token(3, 0, 0xF),
            0x0300_0042, // texld
            dst_token(0, 0, 0xF),
            src_token(3, 0, 0xE4),
            src_token(10, 0, 0xE4),
            0x0200_0001, // mov oC0, r0
            dst_token(8, 0, 0xF),
            src_token(0, 0, 0xE4),
            END,
        ];
        let shader = translate_tokens(&tokens).unwrap();
        assert_eq!(shader.stage(), ShaderStage::Pixel);
        assert_eq!(shader.sampler_bindings.len(), 1);
        assert_eq!(shader.sampler_bindings[0].binding, 0);
        assert_eq!(shader.sampler_bindings[0].stage, ShaderStage::Pixel);

        let ops = opcodes(&shader.words);
        assert!(ops.contains(&op::IMAGE_SAMPLE_IMPLICIT_LOD));
        assert!(ops.contains(&op::EXECUTION_MODE));
    }

    #[test]
    fn conditional_blocks_emit_structured_branches() {
        // ps_2_0: ifc_gt c0.x, c1.x ... else ... endif
        let ifc = 0x0200_0029 | (1 << 16);
        let tokens = vec![
            PS_2_0,
            ifc,
            src_token(2, 0, 0x00),
            src_token(2, 1, 0x00),
            0x0000_002A, // else
            0x0000_002B, // endif
            0x0200_0001, // mov oC0, c2
            dst_token(8, 0, 0xF),
            src_token(2, 2, 0xE4),
            END,
        ];
        let shader = translate_tokens(&tokens).unwrap();
        let ops = opcodes(&shader.words);
        assert!(ops.contains(&op::SELECTION_MERGE));
        assert!(ops.contains(&op::BRANCH_CONDITIONAL));
        assert!(ops.contains(&op::F_ORD_GREATER_THAN));
    }

    /// Instruction words grouped per instruction, for operand checks.
    fn instructions(words: &[u32]) -> Vec<&[u32]> {
        let mut out = Vec::new();
        let mut index = 5;
        while index < words.len() {
            let count = (words[index] >> 16) as usize;
            out.push(&words[index..index + count]);
            index += count;
        }
        out
    }

    #[test]
    fn sm3_declared_output_has_a_minimal_interface() {
        // vs_3_0: dcl_position v0; dcl_position o0; mov o0, v0
        let tokens = vec![
            0xFFFE_0300,
            0x0200_001F,
            0x8000_0000,
            dst_token(1, 0, 0xF),
            0x0200_001F,
            0x8000_0000,
            dst_token(6, 0, 0xF),
            0x0200_0001,
            dst_token(6, 0, 0xF),
            src_token(1, 0, 0xE4),
            END,
        ];
        let shader = translate_tokens(&tokens).unwrap();
        let instructions = instructions(&shader.words);

        // OpEntryPoint: model, entry id, "main" (2 words), then exactly one
        // input and one output in the interface.
        let entry = instructions
            .iter()
            .find(|inst| (inst[0] & 0xFFFF) as u16 == op::ENTRY_POINT)
            .unwrap();
        assert_eq!(entry.len() - 5, 2);

        // The declared output carries BuiltIn Position.
        assert!(instructions.iter().any(|inst| {
            (inst[0] & 0xFFFF) as u16 == op::DECORATE
                && inst[2] == spirv::decoration::BUILT_IN
                && inst[3] == spirv::BUILTIN_POSITION
        }));
    }

    #[test]
    fn integer_color_output_converts_unsigned() {
        // ps_2_0: defi i0, 255, 0, 0, 255; mov oC0, i0
        let tokens = vec![
            PS_2_0,
            0x0500_0030,
            dst_token(7, 0, 0xF),
            255,
            0,
            0,
            255,
            0x0200_0001,
            dst_token(8, 0, 0xF),
            src_token(7, 0, 0xE4),
            END,
        ];
        let shader = translate_tokens(&tokens).unwrap();
        let ops = opcodes(&shader.words);
        assert!(ops.contains(&op::CONVERT_U_TO_F));
        assert!(ops.contains(&op::F_DIV));
        assert!(!ops.contains(&op::CONVERT_S_TO_F));
    }

    #[test]
    fn out_of_range_constant_fails_closed() {
        // vs_2_0: mov r0, i20 (beyond the declared integer constant block)
        let tokens = vec![
            VS_2_0,
            0x0200_0001,
            dst_token(0, 0, 0xF),
            src_token(7, 20, 0xE4),
            END,
        ];
        let err = translate_tokens(&tokens).unwrap_err();
        assert!(matches!(err, TranslateError::UnresolvedRegister { .. }));
    }

    #[test]
    fn cache_reuses_identical_bytecode() {
        let bytes = tokens_to_bytes(&simple_vs());
        let mut cache = ShaderCache::new();

        let first = cache.get_or_translate(&bytes).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (0, 1));

        let second = cache.get_or_translate(&bytes).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        // A different shader misses.
        let mut other = simple_vs();
        other[2] = dst_token(4, 0, 0x7);
        cache.get_or_translate(&tokens_to_bytes(&other)).unwrap();
        assert_eq!((cache.hits(), cache.misses()), (1, 2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn translation_failures_are_not_cached() {
        let mut cache = ShaderCache::new();
        let bad = tokens_to_bytes(&[0xFFFE_0900, END]);
        assert!(cache.get_or_translate(&bad).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 0);
    }
}
