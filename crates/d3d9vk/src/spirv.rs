//! Word-level SPIR-V module construction.
//!
//! Instructions are appended to per-section buffers as they are generated (the
//! lowering engine discovers types, constants and decorations in source order,
//! not section order) and concatenated into the fixed section layout the
//! SPIR-V spec mandates when the module is assembled.

pub const MAGIC_NUMBER: u32 = 0x0723_0203;
pub const VERSION_1_0: u32 = 0x0001_0000;
/// Registered generator magic is overkill for a shim; zero is explicitly
/// reserved for "no generator".
pub const GENERATOR: u32 = 0;

// Opcodes, from the SPIR-V 1.0 instruction index.
pub mod op {
    pub const NAME: u16 = 5;
    pub const MEMBER_NAME: u16 = 6;
    pub const EXTENSION: u16 = 10;
    pub const EXT_INST_IMPORT: u16 = 11;
    pub const EXT_INST: u16 = 12;
    pub const MEMORY_MODEL: u16 = 14;
    pub const ENTRY_POINT: u16 = 15;
    pub const EXECUTION_MODE: u16 = 16;
    pub const CAPABILITY: u16 = 17;
    pub const TYPE_VOID: u16 = 19;
    pub const TYPE_BOOL: u16 = 20;
    pub const TYPE_INT: u16 = 21;
    pub const TYPE_FLOAT: u16 = 22;
    pub const TYPE_VECTOR: u16 = 23;
    pub const TYPE_MATRIX: u16 = 24;
    pub const TYPE_IMAGE: u16 = 25;
    pub const TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const TYPE_FUNCTION: u16 = 33;
    pub const CONSTANT_TRUE: u16 = 41;
    pub const CONSTANT_FALSE: u16 = 42;
    pub const CONSTANT: u16 = 43;
    pub const CONSTANT_COMPOSITE: u16 = 44;
    pub const SPEC_CONSTANT_TRUE: u16 = 48;
    pub const SPEC_CONSTANT_FALSE: u16 = 49;
    pub const SPEC_CONSTANT: u16 = 50;
    pub const SPEC_CONSTANT_COMPOSITE: u16 = 51;
    pub const FUNCTION: u16 = 54;
    pub const FUNCTION_END: u16 = 56;
    pub const VARIABLE: u16 = 59;
    pub const LOAD: u16 = 61;
    pub const STORE: u16 = 62;
    pub const ACCESS_CHAIN: u16 = 65;
    pub const DECORATE: u16 = 71;
    pub const MEMBER_DECORATE: u16 = 72;
    pub const VECTOR_SHUFFLE: u16 = 79;
    pub const COMPOSITE_CONSTRUCT: u16 = 80;
    pub const COMPOSITE_EXTRACT: u16 = 81;
    pub const IMAGE_SAMPLE_IMPLICIT_LOD: u16 = 87;
    pub const CONVERT_F_TO_S: u16 = 110;
    pub const CONVERT_S_TO_F: u16 = 111;
    pub const CONVERT_U_TO_F: u16 = 112;
    pub const BITCAST: u16 = 124;
    pub const LOGICAL_NOT: u16 = 168;
    pub const S_NEGATE: u16 = 126;
    pub const F_NEGATE: u16 = 127;
    pub const I_ADD: u16 = 128;
    pub const F_ADD: u16 = 129;
    pub const I_SUB: u16 = 130;
    pub const F_SUB: u16 = 131;
    pub const I_MUL: u16 = 132;
    pub const F_MUL: u16 = 133;
    pub const F_DIV: u16 = 136;
    pub const VECTOR_TIMES_MATRIX: u16 = 144;
    pub const DOT: u16 = 148;
    pub const F_ORD_EQUAL: u16 = 180;
    pub const F_ORD_NOT_EQUAL: u16 = 182;
    pub const F_ORD_LESS_THAN: u16 = 184;
    pub const F_ORD_GREATER_THAN: u16 = 186;
    pub const F_ORD_LESS_THAN_EQUAL: u16 = 188;
    pub const F_ORD_GREATER_THAN_EQUAL: u16 = 190;
    pub const SELECTION_MERGE: u16 = 247;
    pub const LABEL: u16 = 248;
    pub const BRANCH: u16 = 249;
    pub const BRANCH_CONDITIONAL: u16 = 250;
    pub const RETURN: u16 = 253;
}

/// GLSL.std.450 extended instruction numbers used by the lowering engine.
pub mod glsl450 {
    pub const F_ABS: u32 = 4;
    pub const FRACT: u32 = 10;
    pub const POW: u32 = 26;
    pub const EXP2: u32 = 29;
    pub const LOG2: u32 = 30;
    pub const INVERSE_SQRT: u32 = 32;
    pub const F_MIN: u32 = 37;
    pub const F_MAX: u32 = 40;
    pub const F_CLAMP: u32 = 43;
    pub const CROSS: u32 = 68;
    pub const NORMALIZE: u32 = 69;
}

pub const CAPABILITY_SHADER: u32 = 1;
pub const ADDRESSING_MODEL_LOGICAL: u32 = 0;
pub const MEMORY_MODEL_GLSL450: u32 = 1;
pub const EXECUTION_MODEL_VERTEX: u32 = 0;
pub const EXECUTION_MODEL_FRAGMENT: u32 = 4;
pub const EXECUTION_MODE_ORIGIN_UPPER_LEFT: u32 = 7;

pub mod storage_class {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const OUTPUT: u32 = 3;
    pub const PRIVATE: u32 = 6;
    pub const FUNCTION: u32 = 7;
    pub const PUSH_CONSTANT: u32 = 9;
}

pub mod decoration {
    pub const BLOCK: u32 = 2;
    pub const COL_MAJOR: u32 = 5;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BUILT_IN: u32 = 11;
    pub const LOCATION: u32 = 30;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
    pub const SPEC_ID: u32 = 1;
}

pub const BUILTIN_POSITION: u32 = 0;

/// Pack a word count and opcode into the leading instruction word.
pub fn pack(word_count: u16, opcode: u16) -> u32 {
    ((word_count as u32) << 16) | opcode as u32
}

/// Append a SPIR-V string literal: UTF-8 bytes, NUL terminated, padded to a
/// word boundary, little-endian within each word.
pub fn push_string(words: &mut Vec<u32>, s: &str) {
    let bytes = s.as_bytes();
    let mut word = 0u32;
    let mut shift = 0;
    for &b in bytes {
        word |= (b as u32) << shift;
        shift += 8;
        if shift == 32 {
            words.push(word);
            word = 0;
            shift = 0;
        }
    }
    // The terminating NUL always fits: either the current word has room, or
    // shift just wrapped to 0 and a fresh zero word is pushed below.
    words.push(word);
}

pub fn string_word_count(s: &str) -> u16 {
    (s.len() / 4 + 1) as u16
}

/// Per-section instruction buffers, concatenated in the logical-layout order
/// a valid module requires by [`ModuleBuilder::assemble`].
#[derive(Default)]
pub struct ModuleBuilder {
    pub capabilities: Vec<u32>,
    pub extensions: Vec<u32>,
    pub ext_inst_imports: Vec<u32>,
    pub memory_model: Vec<u32>,
    pub entry_points: Vec<u32>,
    pub execution_modes: Vec<u32>,
    pub debug: Vec<u32>,
    pub names: Vec<u32>,
    pub decorations: Vec<u32>,
    /// Types, constants and global variable declarations.
    pub globals: Vec<u32>,
    pub functions: Vec<u32>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assemble(&self, id_bound: u32) -> Vec<u32> {
        let body_len = self.capabilities.len()
            + self.extensions.len()
            + self.ext_inst_imports.len()
            + self.memory_model.len()
            + self.entry_points.len()
            + self.execution_modes.len()
            + self.debug.len()
            + self.names.len()
            + self.decorations.len()
            + self.globals.len()
            + self.functions.len();
        let mut words = Vec::with_capacity(5 + body_len);
        words.push(MAGIC_NUMBER);
        words.push(VERSION_1_0);
        words.push(GENERATOR);
        words.push(id_bound);
        words.push(0); // reserved schema word
        words.extend_from_slice(&self.capabilities);
        words.extend_from_slice(&self.extensions);
        words.extend_from_slice(&self.ext_inst_imports);
        words.extend_from_slice(&self.memory_model);
        words.extend_from_slice(&self.entry_points);
        words.extend_from_slice(&self.execution_modes);
        words.extend_from_slice(&self.debug);
        words.extend_from_slice(&self.names);
        words.extend_from_slice(&self.decorations);
        words.extend_from_slice(&self.globals);
        words.extend_from_slice(&self.functions);
        words
    }
}

/// Append one instruction with fixed-size operands to `section`.
pub fn inst(section: &mut Vec<u32>, opcode: u16, operands: &[u32]) {
    section.push(pack(operands.len() as u16 + 1, opcode));
    section.extend_from_slice(operands);
}

/// `OpName` for an id.
pub fn name(section: &mut Vec<u32>, id: u32, text: &str) {
    section.push(pack(2 + string_word_count(text), op::NAME));
    section.push(id);
    push_string(section, text);
}

/// `OpMemberName` for a struct member.
pub fn member_name(section: &mut Vec<u32>, struct_id: u32, member: u32, text: &str) {
    section.push(pack(3 + string_word_count(text), op::MEMBER_NAME));
    section.push(struct_id);
    section.push(member);
    push_string(section, text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pack_places_word_count_high() {
        assert_eq!(pack(2, op::TYPE_VOID), 0x0002_0013);
    }

    #[test]
    fn strings_are_nul_terminated_and_padded() {
        let mut words = Vec::new();
        push_string(&mut words, "main");
        // "main" fills one word exactly; the NUL needs a second.
        assert_eq!(words, vec![u32::from_le_bytes(*b"main"), 0]);

        let mut words = Vec::new();
        push_string(&mut words, "abc");
        assert_eq!(words, vec![u32::from_le_bytes([b'a', b'b', b'c', 0])]);

        assert_eq!(string_word_count("main"), 2);
        assert_eq!(string_word_count("abc"), 1);
    }

    #[test]
    fn assemble_orders_sections_and_sets_bound() {
        let mut builder = ModuleBuilder::new();
        inst(&mut builder.capabilities, op::CAPABILITY, &[CAPABILITY_SHADER]);
        inst(
            &mut builder.memory_model,
            op::MEMORY_MODEL,
            &[ADDRESSING_MODEL_LOGICAL, MEMORY_MODEL_GLSL450],
        );
        inst(&mut builder.globals, op::TYPE_VOID, &[1]);
        let words = builder.assemble(2);

        assert_eq!(words[0], MAGIC_NUMBER);
        assert_eq!(words[1], VERSION_1_0);
        assert_eq!(words[3], 2);
        assert_eq!(words[4], 0);
        // Capability first, then memory model, then types.
        assert_eq!(words[5], pack(2, op::CAPABILITY));
        assert_eq!(words[7], pack(3, op::MEMORY_MODEL));
        assert_eq!(words[10], pack(2, op::TYPE_VOID));
    }
}
