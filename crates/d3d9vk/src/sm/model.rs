//! Type and register model for the lowering engine.
//!
//! Two pieces of shared state back every lowered instruction:
//!
//! - [`ModuleState`]: id allocation, the structurally-memoized type cache
//!   (type description -> id and id -> type description, both directions), and
//!   scalar constant interning.
//! - [`RegisterBank`]: the `(register file, register number)` -> current
//!   SPIR-V id map. Registers are bound to pointer ids (variables) or value
//!   ids (SSA results, defined constants); writes rebind under SSA
//!   discipline. First use of a register synthesizes its `OpVariable` in the
//!   storage class the file dictates.
//!
//! Resolution failures are hard errors. The translator never substitutes a
//! zero id for a register or type it cannot resolve.

use hashbrown::HashMap;

use crate::sm::decode::{DclUsage, RegisterFile, RegisterRef, TextureType};
use crate::sm::translate::TranslateError;
use crate::sm::types::{ShaderStage, ShaderVersion};
use crate::spirv::{self, decoration, op, storage_class, ModuleBuilder};

pub const BUILTIN_FRAG_DEPTH: u32 = 22;

/// Index-space folding for the constant register files: all constants live in
/// one logical space so the register map never confuses `c7` with `i7`.
pub const CONST_INT_OFFSET: u32 = 2048;
pub const CONST_BOOL_OFFSET: u32 = 4096;
pub const CONST_LOOP_OFFSET: u32 = 6144;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Int,
    Float,
    Vector,
    Matrix,
    Pointer,
    Image,
    SampledImage,
}

/// Structural description of a SPIR-V type, three kinds deep.
///
/// A pointer to a vector of floats is `{Pointer, Vector, Float}`; loading
/// through it shifts the kinds down one level to `{Vector, Float, Void}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescription {
    pub primary: TypeKind,
    pub secondary: TypeKind,
    pub ternary: TypeKind,
    pub component_count: u32,
    pub storage_class: u32,
}

impl TypeDescription {
    pub fn scalar(kind: TypeKind) -> Self {
        Self {
            primary: kind,
            secondary: TypeKind::Void,
            ternary: TypeKind::Void,
            component_count: 1,
            storage_class: 0,
        }
    }

    pub fn vector(kind: TypeKind, component_count: u32) -> Self {
        Self {
            primary: TypeKind::Vector,
            secondary: kind,
            ternary: TypeKind::Void,
            component_count,
            storage_class: 0,
        }
    }

    /// Column-major matrix with `columns` columns of float vectors of
    /// `column_size` components.
    pub fn matrix(columns: u32, column_size: u32) -> Self {
        debug_assert!(column_size <= 4);
        Self {
            primary: TypeKind::Matrix,
            secondary: TypeKind::Float,
            ternary: TypeKind::Void,
            // The column vector size is recovered from the ternary slot being
            // unused: store columns here and the column size below.
            component_count: (columns << 8) | column_size,
            storage_class: 0,
        }
    }

    pub fn pointer_to(value: TypeDescription, storage: u32) -> Self {
        Self {
            primary: TypeKind::Pointer,
            secondary: value.primary,
            ternary: value.secondary,
            component_count: value.component_count,
            storage_class: storage,
        }
    }

    /// The type obtained by loading through this pointer: primary takes the
    /// secondary kind, secondary the ternary, and ternary becomes void.
    pub fn dereference(&self) -> Self {
        Self {
            primary: self.secondary,
            secondary: self.ternary,
            ternary: TypeKind::Void,
            component_count: self.component_count,
            storage_class: 0,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.primary == TypeKind::Pointer
    }

    /// The scalar kind at the bottom of a scalar or vector type.
    pub fn scalar_kind(&self) -> TypeKind {
        match self.primary {
            TypeKind::Vector => self.secondary,
            other => other,
        }
    }

    /// Component count as seen by swizzles and write masks (1 for scalars).
    pub fn vector_components(&self) -> u32 {
        match self.primary {
            TypeKind::Vector => self.component_count,
            _ => 1,
        }
    }
}

/// Module-wide id allocation, type memoization and constant interning.
pub struct ModuleState {
    pub version: ShaderVersion,
    pub builder: ModuleBuilder,
    next_id: u32,
    type_ids: HashMap<TypeDescription, u32>,
    id_types: HashMap<u32, TypeDescription>,
    constants: HashMap<(u32, [u32; 4]), u32>,
}

impl ModuleState {
    pub fn new(version: ShaderVersion) -> Self {
        Self {
            version,
            builder: ModuleBuilder::new(),
            next_id: 1,
            type_ids: HashMap::new(),
            id_types: HashMap::new(),
            constants: HashMap::new(),
        }
    }

    /// Fresh result id. Ids are handed out strictly monotonically; a register
    /// write always observes a larger id than the value it replaces.
    pub fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn id_bound(&self) -> u32 {
        self.next_id
    }

    /// Record the result type of a value id so later instructions can resolve
    /// operand types.
    pub fn record_value(&mut self, id: u32, desc: TypeDescription) {
        self.id_types.insert(id, desc);
    }

    pub fn type_of(&self, id: u32) -> Result<TypeDescription, TranslateError> {
        self.id_types
            .get(&id)
            .copied()
            .ok_or(TranslateError::UnresolvedId { id })
    }

    /// Id for a type description, emitting the declaration on first request.
    ///
    /// Structural equality: the same description always maps to the same id.
    pub fn type_id(&mut self, desc: TypeDescription) -> Result<u32, TranslateError> {
        if let Some(&id) = self.type_ids.get(&desc) {
            return Ok(id);
        }
        let id = match desc.primary {
            TypeKind::Void => {
                let id = self.alloc_id();
                spirv::inst(&mut self.builder.globals, op::TYPE_VOID, &[id]);
                id
            }
            TypeKind::Bool => {
                let id = self.alloc_id();
                spirv::inst(&mut self.builder.globals, op::TYPE_BOOL, &[id]);
                id
            }
            TypeKind::Int => {
                let id = self.alloc_id();
                spirv::inst(&mut self.builder.globals, op::TYPE_INT, &[id, 32, 1]);
                id
            }
            TypeKind::Float => {
                let id = self.alloc_id();
                spirv::inst(&mut self.builder.globals, op::TYPE_FLOAT, &[id, 32]);
                id
            }
            TypeKind::Vector => {
                let component = self.type_id(TypeDescription::scalar(desc.secondary))?;
                let id = self.alloc_id();
                spirv::inst(
                    &mut self.builder.globals,
                    op::TYPE_VECTOR,
                    &[id, component, desc.component_count],
                );
                id
            }
            TypeKind::Matrix => {
                let columns = desc.component_count >> 8;
                let column_size = desc.component_count & 0xFF;
                let column =
                    self.type_id(TypeDescription::vector(TypeKind::Float, column_size))?;
                let id = self.alloc_id();
                spirv::inst(
                    &mut self.builder.globals,
                    op::TYPE_MATRIX,
                    &[id, column, columns],
                );
                id
            }
            TypeKind::Pointer => {
                let pointee = self.type_id(desc.dereference())?;
                let id = self.alloc_id();
                spirv::inst(
                    &mut self.builder.globals,
                    op::TYPE_POINTER,
                    &[id, desc.storage_class, pointee],
                );
                id
            }
            TypeKind::Image => {
                let sampled = self.type_id(TypeDescription::scalar(TypeKind::Float))?;
                let id = self.alloc_id();
                // Dim is carried in component_count: 1 = 2D, 3 = Cube, 2 = 3D.
                spirv::inst(
                    &mut self.builder.globals,
                    op::TYPE_IMAGE,
                    &[id, sampled, desc.component_count, 0, 0, 0, 1, 0],
                );
                id
            }
            TypeKind::SampledImage => {
                // Registering a sampled image allocates two ids: the image
                // type and the combined sampled-image type.
                let image = self.type_id(TypeDescription {
                    primary: TypeKind::Image,
                    ..desc
                })?;
                let id = self.alloc_id();
                spirv::inst(
                    &mut self.builder.globals,
                    op::TYPE_SAMPLED_IMAGE,
                    &[id, image],
                );
                id
            }
        };
        self.type_ids.insert(desc, id);
        self.id_types.insert(id, desc);
        Ok(id)
    }

    /// Interned 32-bit float constant.
    pub fn const_f32(&mut self, value: f32) -> Result<u32, TranslateError> {
        let ty = self.type_id(TypeDescription::scalar(TypeKind::Float))?;
        self.interned_constant(ty, [value.to_bits(), 0, 0, 0], |b, id, tyid, words| {
            spirv::inst(&mut b.globals, op::CONSTANT, &[tyid, id, words[0]]);
        })
    }

    /// Interned 32-bit signed int constant.
    pub fn const_i32(&mut self, value: i32) -> Result<u32, TranslateError> {
        let ty = self.type_id(TypeDescription::scalar(TypeKind::Int))?;
        self.interned_constant(ty, [value as u32, 0, 0, 0], |b, id, tyid, words| {
            spirv::inst(&mut b.globals, op::CONSTANT, &[tyid, id, words[0]]);
        })
    }

    /// Interned boolean constant.
    pub fn const_bool(&mut self, value: bool) -> Result<u32, TranslateError> {
        let ty = self.type_id(TypeDescription::scalar(TypeKind::Bool))?;
        self.interned_constant(ty, [value as u32, 0, 0, 0], |b, id, tyid, _| {
            let opcode = if value {
                op::CONSTANT_TRUE
            } else {
                op::CONSTANT_FALSE
            };
            spirv::inst(&mut b.globals, opcode, &[tyid, id]);
        })
    }

    /// Interned `OpConstantComposite` of up to four scalar constituent ids.
    pub fn const_composite(
        &mut self,
        ty: TypeDescription,
        constituents: &[u32],
    ) -> Result<u32, TranslateError> {
        debug_assert!(constituents.len() <= 4);
        let tyid = self.type_id(ty)?;
        let mut key = [0u32; 4];
        key[..constituents.len()].copy_from_slice(constituents);
        let count = constituents.len();
        self.interned_constant(tyid, key, |b, id, tyid, words| {
            let mut ops = Vec::with_capacity(2 + count);
            ops.push(tyid);
            ops.push(id);
            ops.extend_from_slice(&words[..count]);
            spirv::inst(&mut b.globals, op::CONSTANT_COMPOSITE, &ops);
        })
    }

    fn interned_constant(
        &mut self,
        type_id: u32,
        key_words: [u32; 4],
        emit: impl FnOnce(&mut ModuleBuilder, u32, u32, [u32; 4]),
    ) -> Result<u32, TranslateError> {
        if let Some(&id) = self.constants.get(&(type_id, key_words)) {
            return Ok(id);
        }
        let id = self.alloc_id();
        emit(&mut self.builder, id, type_id, key_words);
        self.constants.insert((type_id, key_words), id);
        let desc = self.type_of(type_id)?;
        self.record_value(id, desc);
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RegisterKey {
    class: u8,
    index: u32,
}

fn register_key(reg: RegisterRef) -> RegisterKey {
    // The constant files fold into one index space with fixed offsets; every
    // other file gets its own class discriminant.
    match reg.file {
        RegisterFile::Const => RegisterKey {
            class: 0,
            index: reg.index,
        },
        RegisterFile::ConstInt => RegisterKey {
            class: 0,
            index: CONST_INT_OFFSET + reg.index,
        },
        RegisterFile::ConstBool => RegisterKey {
            class: 0,
            index: CONST_BOOL_OFFSET + reg.index,
        },
        RegisterFile::Loop => RegisterKey {
            class: 0,
            index: CONST_LOOP_OFFSET + reg.index,
        },
        RegisterFile::Temp => RegisterKey {
            class: 1,
            index: reg.index,
        },
        RegisterFile::Input => RegisterKey {
            class: 2,
            index: reg.index,
        },
        RegisterFile::Addr => RegisterKey {
            class: 3,
            index: reg.index,
        },
        RegisterFile::Texture => RegisterKey {
            class: 4,
            index: reg.index,
        },
        RegisterFile::RastOut => RegisterKey {
            class: 5,
            index: reg.index,
        },
        RegisterFile::AttrOut => RegisterKey {
            class: 6,
            index: reg.index,
        },
        RegisterFile::TexCoordOut => RegisterKey {
            class: 7,
            index: reg.index,
        },
        RegisterFile::Output => RegisterKey {
            class: 8,
            index: reg.index,
        },
        RegisterFile::ColorOut => RegisterKey {
            class: 9,
            index: reg.index,
        },
        RegisterFile::DepthOut => RegisterKey {
            class: 10,
            index: reg.index,
        },
        RegisterFile::Sampler => RegisterKey {
            class: 11,
            index: reg.index,
        },
        RegisterFile::ConstMatrix => RegisterKey {
            class: 12,
            index: reg.index,
        },
        RegisterFile::Predicate | RegisterFile::MiscType | RegisterFile::Unknown(_) => {
            RegisterKey {
                class: 255,
                index: reg.index,
            }
        }
    }
}

/// Vertex input attribute surfaced to the pipeline builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderInputAttribute {
    pub register: u32,
    pub location: u32,
    /// Usage from the register's `dcl`, used to pair the attribute with a
    /// vertex declaration element.
    pub usage: Option<DclUsageInfo>,
}

/// Combined image-sampler binding surfaced to the descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerBinding {
    pub binding: u32,
    pub stage: ShaderStage,
}

pub struct RegisterBank {
    ids: HashMap<RegisterKey, u32>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub attributes: Vec<ShaderInputAttribute>,
    pub sampler_bindings: Vec<SamplerBinding>,
    /// Texture dimensionality per sampler register, filled in by `dcl`.
    sampler_kinds: HashMap<u32, TextureType>,
    position_id: Option<u32>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: Vec::new(),
            sampler_bindings: Vec::new(),
            sampler_kinds: HashMap::new(),
            position_id: None,
        }
    }

    /// The vertex position output variable, if one was synthesized.
    pub fn position_id(&self) -> Option<u32> {
        self.position_id
    }

    pub fn set_position_id(&mut self, id: u32) {
        self.position_id = Some(id);
    }

    pub fn declare_sampler_kind(&mut self, index: u32, kind: TextureType) {
        self.sampler_kinds.insert(index, kind);
    }

    /// Rebind a register to a new value id (SSA write).
    pub fn bind(&mut self, reg: RegisterRef, id: u32) {
        self.ids.insert(register_key(reg), id);
    }

    pub fn lookup(&self, reg: RegisterRef) -> Option<u32> {
        self.ids.get(&register_key(reg)).copied()
    }

    /// Current id for a register, synthesizing the backing variable on first
    /// use. Fails closed for register files the translator does not model.
    pub fn resolve(
        &mut self,
        state: &mut ModuleState,
        reg: RegisterRef,
        usage: Option<&DclUsageInfo>,
        token_index: usize,
    ) -> Result<u32, TranslateError> {
        if let Some(id) = self.lookup(reg) {
            return Ok(id);
        }
        let id = self.synthesize(state, reg, usage, token_index)?;
        self.bind(reg, id);
        Ok(id)
    }

    fn synthesize(
        &mut self,
        state: &mut ModuleState,
        reg: RegisterRef,
        usage: Option<&DclUsageInfo>,
        token_index: usize,
    ) -> Result<u32, TranslateError> {
        let stage = state.version.stage;
        let vec4f = TypeDescription::vector(TypeKind::Float, 4);
        match reg.file {
            RegisterFile::Temp => {
                if stage == ShaderStage::Pixel && state.version.is_sm1() && reg.index == 0 {
                    // ps_1_x has no oC#: r0 is the color output.
                    let id = self.output_variable(state, vec4f, &format!("r{}", reg.index))?;
                    self.decorate_location(state, id, 0);
                    return Ok(id);
                }
                self.private_variable(state, vec4f, &format!("r{}", reg.index))
            }
            RegisterFile::Input => {
                let id = self.input_variable(state, vec4f, &format!("v{}", reg.index))?;
                match stage {
                    ShaderStage::Vertex => {
                        let location = reg.index;
                        self.decorate_location(state, id, location);
                        self.attributes.push(ShaderInputAttribute {
                            register: reg.index,
                            location,
                            usage: usage.copied(),
                        });
                    }
                    ShaderStage::Pixel => {
                        let location = pixel_input_location(reg.index, usage);
                        self.decorate_location(state, id, location);
                    }
                }
                Ok(id)
            }
            RegisterFile::Texture => {
                // Pixel-shader texture coordinate registers are varyings.
                let id = self.input_variable(state, vec4f, &format!("t{}", reg.index))?;
                self.decorate_location(state, id, reg.index + 4);
                Ok(id)
            }
            RegisterFile::Addr => {
                let int4 = TypeDescription::vector(TypeKind::Int, 4);
                self.private_variable(state, int4, "a0")
            }
            RegisterFile::RastOut => match reg.index {
                0 => {
                    let id = self.output_variable(state, vec4f, "oPos")?;
                    spirv::inst(
                        &mut state.builder.decorations,
                        op::DECORATE,
                        &[id, decoration::BUILT_IN, spirv::BUILTIN_POSITION],
                    );
                    self.position_id = Some(id);
                    Ok(id)
                }
                1 => {
                    let id = self.output_variable(state, vec4f, "oFog")?;
                    self.decorate_location(state, id, 0);
                    Ok(id)
                }
                2 => {
                    let id = self.output_variable(state, vec4f, "oPts")?;
                    self.decorate_location(state, id, 1);
                    Ok(id)
                }
                _ => Err(TranslateError::UnsupportedRegister {
                    register: reg.to_string(),
                    token_index,
                }),
            },
            RegisterFile::AttrOut => {
                let id = self.output_variable(state, vec4f, &format!("oD{}", reg.index))?;
                self.decorate_location(state, id, reg.index + 2);
                Ok(id)
            }
            RegisterFile::TexCoordOut => {
                let id = self.output_variable(state, vec4f, &format!("oT{}", reg.index))?;
                self.decorate_location(state, id, reg.index + 4);
                Ok(id)
            }
            RegisterFile::Output => {
                // vs_3_0 generic output register: the dcl decides whether this
                // is the position or a numbered varying.
                if matches!(usage.map(|u| u.usage), Some(DclUsage::Position)) {
                    let id = self.output_variable(state, vec4f, &format!("o{}", reg.index))?;
                    spirv::inst(
                        &mut state.builder.decorations,
                        op::DECORATE,
                        &[id, decoration::BUILT_IN, spirv::BUILTIN_POSITION],
                    );
                    self.position_id = Some(id);
                    Ok(id)
                } else {
                    let id = self.output_variable(state, vec4f, &format!("o{}", reg.index))?;
                    self.decorate_location(state, id, reg.index);
                    Ok(id)
                }
            }
            RegisterFile::ColorOut => {
                let id = self.output_variable(state, vec4f, &format!("oC{}", reg.index))?;
                self.decorate_location(state, id, reg.index);
                Ok(id)
            }
            RegisterFile::DepthOut => {
                let float = TypeDescription::scalar(TypeKind::Float);
                let id = self.output_variable(state, float, "oDepth")?;
                spirv::inst(
                    &mut state.builder.decorations,
                    op::DECORATE,
                    &[id, decoration::BUILT_IN, BUILTIN_FRAG_DEPTH],
                );
                Ok(id)
            }
            RegisterFile::Sampler => {
                let dim = match self.sampler_kinds.get(&reg.index) {
                    Some(TextureType::TextureCube) => 3,
                    Some(TextureType::Texture3D) => 2,
                    _ => 1, // default 2D
                };
                let sampled = TypeDescription {
                    primary: TypeKind::SampledImage,
                    secondary: TypeKind::Void,
                    ternary: TypeKind::Void,
                    component_count: dim,
                    storage_class: 0,
                };
                let ptr = TypeDescription::pointer_to(sampled, storage_class::UNIFORM_CONSTANT);
                let ptr_ty = state.type_id(ptr)?;
                let id = state.alloc_id();
                spirv::inst(
                    &mut state.builder.globals,
                    op::VARIABLE,
                    &[ptr_ty, id, storage_class::UNIFORM_CONSTANT],
                );
                state.record_value(id, ptr);
                spirv::name(&mut state.builder.names, id, &format!("s{}", reg.index));
                spirv::inst(
                    &mut state.builder.decorations,
                    op::DECORATE,
                    &[id, decoration::BINDING, reg.index],
                );
                spirv::inst(
                    &mut state.builder.decorations,
                    op::DECORATE,
                    &[id, decoration::DESCRIPTOR_SET, 0],
                );
                self.sampler_bindings.push(SamplerBinding {
                    binding: reg.index,
                    stage: state.version.stage,
                });
                Ok(id)
            }
            RegisterFile::Const
            | RegisterFile::ConstInt
            | RegisterFile::ConstBool
            | RegisterFile::ConstMatrix => {
                // Constants are bound eagerly by the spec-constant block (and
                // rebound by def/defi/defb and the push-constant preload). An
                // unresolved lookup here means the register is outside the
                // declared block.
                Err(TranslateError::UnresolvedRegister {
                    register: reg.to_string(),
                    token_index,
                })
            }
            RegisterFile::Loop
            | RegisterFile::Predicate
            | RegisterFile::MiscType
            | RegisterFile::Unknown(_) => Err(TranslateError::UnsupportedRegister {
                register: reg.to_string(),
                token_index,
            }),
        }
    }

    fn variable(
        &mut self,
        state: &mut ModuleState,
        value: TypeDescription,
        storage: u32,
        name: &str,
    ) -> Result<u32, TranslateError> {
        let ptr = TypeDescription::pointer_to(value, storage);
        let ptr_ty = state.type_id(ptr)?;
        let id = state.alloc_id();
        spirv::inst(
            &mut state.builder.globals,
            op::VARIABLE,
            &[ptr_ty, id, storage],
        );
        state.record_value(id, ptr);
        spirv::name(&mut state.builder.names, id, name);
        Ok(id)
    }

    fn private_variable(
        &mut self,
        state: &mut ModuleState,
        value: TypeDescription,
        name: &str,
    ) -> Result<u32, TranslateError> {
        self.variable(state, value, storage_class::PRIVATE, name)
    }

    fn input_variable(
        &mut self,
        state: &mut ModuleState,
        value: TypeDescription,
        name: &str,
    ) -> Result<u32, TranslateError> {
        let id = self.variable(state, value, storage_class::INPUT, name)?;
        self.inputs.push(id);
        Ok(id)
    }

    fn output_variable(
        &mut self,
        state: &mut ModuleState,
        value: TypeDescription,
        name: &str,
    ) -> Result<u32, TranslateError> {
        let id = self.variable(state, value, storage_class::OUTPUT, name)?;
        self.outputs.push(id);
        Ok(id)
    }

    fn decorate_location(&mut self, state: &mut ModuleState, id: u32, location: u32) {
        spirv::inst(
            &mut state.builder.decorations,
            op::DECORATE,
            &[id, decoration::LOCATION, location],
        );
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage attached to a register by its `dcl`, consulted during synthesis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DclUsageInfo {
    pub usage: DclUsage,
    pub usage_index: u8,
}

/// Interpolator location for a pixel-shader input register.
///
/// Color inputs land at `register + 2` to pair with the vertex side's `oD#`
/// outputs; everything else lands at `register + 4` alongside `oT#`.
fn pixel_input_location(register: u32, usage: Option<&DclUsageInfo>) -> u32 {
    match usage.map(|u| u.usage) {
        Some(DclUsage::Color) | None => register + 2,
        Some(_) => register + 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::types::{ShaderStage, ShaderVersion};
    use pretty_assertions::assert_eq;

    fn vs_3_0() -> ShaderVersion {
        ShaderVersion {
            stage: ShaderStage::Vertex,
            major: 3,
            minor: 0,
        }
    }

    #[test]
    fn type_ids_are_memoized_both_ways() {
        let mut state = ModuleState::new(vs_3_0());
        let vec4 = TypeDescription::vector(TypeKind::Float, 4);
        let a = state.type_id(vec4).unwrap();
        let b = state.type_id(vec4).unwrap();
        assert_eq!(a, b);
        assert_eq!(state.type_of(a).unwrap(), vec4);

        // A structurally different type gets a different id.
        let vec3 = TypeDescription::vector(TypeKind::Float, 3);
        assert_ne!(state.type_id(vec3).unwrap(), a);
    }

    #[test]
    fn sampled_image_allocates_image_and_sampled_ids() {
        let mut state = ModuleState::new(vs_3_0());
        let before = state.id_bound();
        let sampled = TypeDescription {
            primary: TypeKind::SampledImage,
            secondary: TypeKind::Void,
            ternary: TypeKind::Void,
            component_count: 1,
            storage_class: 0,
        };
        state.type_id(sampled).unwrap();
        // float scalar + image + sampled image = 3 new ids.
        assert_eq!(state.id_bound() - before, 3);
    }

    #[test]
    fn pointer_dereference_shifts_kinds_down() {
        let vec4 = TypeDescription::vector(TypeKind::Float, 4);
        let ptr = TypeDescription::pointer_to(vec4, storage_class::PRIVATE);
        assert_eq!(ptr.primary, TypeKind::Pointer);
        assert_eq!(ptr.secondary, TypeKind::Vector);
        assert_eq!(ptr.ternary, TypeKind::Float);
        assert_eq!(ptr.dereference(), vec4);
    }

    #[test]
    fn constant_register_files_do_not_collide() {
        let c = register_key(RegisterRef {
            file: RegisterFile::Const,
            index: 7,
        });
        let i = register_key(RegisterRef {
            file: RegisterFile::ConstInt,
            index: 7,
        });
        let b = register_key(RegisterRef {
            file: RegisterFile::ConstBool,
            index: 7,
        });
        assert_eq!(c.class, i.class);
        assert_ne!(c.index, i.index);
        assert_ne!(i.index, b.index);
    }

    #[test]
    fn scalar_constants_are_interned() {
        let mut state = ModuleState::new(vs_3_0());
        let a = state.const_f32(255.0).unwrap();
        let b = state.const_f32(255.0).unwrap();
        let c = state.const_f32(1.0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn write_rebinds_register_to_fresh_id() {
        let mut state = ModuleState::new(vs_3_0());
        let mut bank = RegisterBank::new();
        let r0 = RegisterRef {
            file: RegisterFile::Temp,
            index: 0,
        };
        let first = bank.resolve(&mut state, r0, None, 0).unwrap();
        let value = state.alloc_id();
        bank.bind(r0, value);
        assert_eq!(bank.lookup(r0), Some(value));
        assert!(value > first);
    }

    #[test]
    fn unknown_register_file_fails_closed() {
        let mut state = ModuleState::new(vs_3_0());
        let mut bank = RegisterBank::new();
        let err = bank
            .resolve(
                &mut state,
                RegisterRef {
                    file: RegisterFile::Predicate,
                    index: 0,
                },
                None,
                42,
            )
            .unwrap_err();
        match err {
            TranslateError::UnsupportedRegister { token_index, .. } => {
                assert_eq!(token_index, 42)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
