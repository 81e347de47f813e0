//! Instruction lowering: decoded D3D9 instructions to SPIR-V function body.
//!
//! The lowerer keeps one [`ModuleState`] and one [`RegisterBank`] for the
//! whole shader. Each instruction loads its sources (dereferencing pointers,
//! applying swizzles and modifiers), emits the arithmetic, and writes the
//! result back through the destination's write mask. Structured control flow
//! is tracked on an explicit frame stack so `else`/`endif` always close the
//! selection construct they opened.
//!
//! Anything the lowerer cannot resolve (a register outside the modeled files,
//! an id with no recorded type) is a hard error. Unimplemented *instructions*
//! degrade instead: they are skipped with a warning so a shader using an
//! exotic opcode still renders everything else.

use hashbrown::HashMap;
use tracing::warn;

use crate::shader_limits::MAX_CONTROL_FLOW_NESTING;
use crate::sm::decode::{
    DecodedInstruction, DstOperand, Opcode, RegisterFile, RegisterRef, SrcModifier, Swizzle,
};
use crate::sm::model::{
    DclUsageInfo, ModuleState, RegisterBank, SamplerBinding, ShaderInputAttribute,
    TypeDescription, TypeKind,
};
use crate::sm::translate::TranslateError;
use crate::sm::types::{ShaderStage, ShaderVersion};
use crate::spirv::{self, decoration, glsl450, op, storage_class};

/// Specialization-constant id layout shared with the runtime's constant
/// upload path: booleans first, then the int registers (four scalars each),
/// then the float registers.
pub const SPEC_BOOL_COUNT: u32 = 16;
pub const SPEC_INT_COUNT: u32 = 16;
pub const SPEC_FLOAT_COUNT: u32 = 256;
pub const SPEC_ID_BOOL_BASE: u32 = 0;
pub const SPEC_ID_INT_BASE: u32 = SPEC_ID_BOOL_BASE + SPEC_BOOL_COUNT;
pub const SPEC_ID_FLOAT_BASE: u32 = SPEC_ID_INT_BASE + SPEC_INT_COUNT * 4;

/// Open `if`/`ifc` construct awaiting its `else`/`endif`.
struct IfFrame {
    false_label: u32,
    merge_label: u32,
    seen_else: bool,
}

/// Assembled output of a fully lowered shader.
#[derive(Debug)]
pub struct LoweredModule {
    pub words: Vec<u32>,
    pub attributes: Vec<ShaderInputAttribute>,
    pub sampler_bindings: Vec<SamplerBinding>,
}

pub struct Lowerer {
    pub state: ModuleState,
    pub bank: RegisterBank,
    glsl_ext: u32,
    main_id: u32,
    if_stack: Vec<IfFrame>,
    dcl_usages: HashMap<RegisterRef, DclUsageInfo>,
}

impl Lowerer {
    pub fn new(version: ShaderVersion) -> Result<Self, TranslateError> {
        let mut state = ModuleState::new(version);

        spirv::inst(
            &mut state.builder.capabilities,
            op::CAPABILITY,
            &[spirv::CAPABILITY_SHADER],
        );

        let glsl_ext = state.alloc_id();
        let imports = &mut state.builder.ext_inst_imports;
        imports.push(spirv::pack(
            2 + spirv::string_word_count("GLSL.std.450"),
            op::EXT_INST_IMPORT,
        ));
        imports.push(glsl_ext);
        spirv::push_string(imports, "GLSL.std.450");

        spirv::inst(
            &mut state.builder.memory_model,
            op::MEMORY_MODEL,
            &[
                spirv::ADDRESSING_MODEL_LOGICAL,
                spirv::MEMORY_MODEL_GLSL450,
            ],
        );

        // void main() { ... } skeleton; the instruction loop appends into it.
        let void_ty = state.type_id(TypeDescription::scalar(TypeKind::Void))?;
        let fn_ty = state.alloc_id();
        spirv::inst(&mut state.builder.globals, op::TYPE_FUNCTION, &[fn_ty, void_ty]);
        let main_id = state.alloc_id();
        spirv::name(&mut state.builder.names, main_id, "main");
        spirv::inst(
            &mut state.builder.functions,
            op::FUNCTION,
            &[void_ty, main_id, 0, fn_ty],
        );
        let entry_label = state.alloc_id();
        spirv::inst(&mut state.builder.functions, op::LABEL, &[entry_label]);

        let mut lowerer = Self {
            state,
            bank: RegisterBank::new(),
            glsl_ext,
            main_id,
            if_stack: Vec::new(),
            dcl_usages: HashMap::new(),
        };
        lowerer.emit_spec_constant_block()?;
        if version.stage == ShaderStage::Vertex {
            lowerer.emit_transform_block()?;
        }
        Ok(lowerer)
    }

    /// Declare the whole constant register set as specialization constants so
    /// the runtime can patch constant values at pipeline-build time without
    /// recompiling the module. `def`/`defi`/`defb` later rebind individual
    /// registers over these defaults.
    fn emit_spec_constant_block(&mut self) -> Result<(), TranslateError> {
        let bool_desc = TypeDescription::scalar(TypeKind::Bool);
        let bool_ty = self.state.type_id(bool_desc)?;
        for reg in 0..SPEC_BOOL_COUNT {
            let id = self.state.alloc_id();
            spirv::inst(
                &mut self.state.builder.globals,
                op::SPEC_CONSTANT_FALSE,
                &[bool_ty, id],
            );
            self.decorate_spec_id(id, SPEC_ID_BOOL_BASE + reg);
            self.state.record_value(id, bool_desc);
            self.bank.bind(
                RegisterRef {
                    file: RegisterFile::ConstBool,
                    index: reg,
                },
                id,
            );
        }

        let int_desc = TypeDescription::scalar(TypeKind::Int);
        let int_ty = self.state.type_id(int_desc)?;
        let int4_desc = TypeDescription::vector(TypeKind::Int, 4);
        let int4_ty = self.state.type_id(int4_desc)?;
        for reg in 0..SPEC_INT_COUNT {
            let mut comps = [0u32; 4];
            for (c, comp) in comps.iter_mut().enumerate() {
                let id = self.state.alloc_id();
                spirv::inst(
                    &mut self.state.builder.globals,
                    op::SPEC_CONSTANT,
                    &[int_ty, id, 0],
                );
                self.decorate_spec_id(id, SPEC_ID_INT_BASE + reg * 4 + c as u32);
                self.state.record_value(id, int_desc);
                *comp = id;
            }
            let id = self.state.alloc_id();
            spirv::inst(
                &mut self.state.builder.globals,
                op::SPEC_CONSTANT_COMPOSITE,
                &[int4_ty, id, comps[0], comps[1], comps[2], comps[3]],
            );
            self.state.record_value(id, int4_desc);
            self.bank.bind(
                RegisterRef {
                    file: RegisterFile::ConstInt,
                    index: reg,
                },
                id,
            );
        }

        let float_desc = TypeDescription::scalar(TypeKind::Float);
        let float_ty = self.state.type_id(float_desc)?;
        let vec4_desc = TypeDescription::vector(TypeKind::Float, 4);
        let vec4_ty = self.state.type_id(vec4_desc)?;
        for reg in 0..SPEC_FLOAT_COUNT {
            let mut comps = [0u32; 4];
            for (c, comp) in comps.iter_mut().enumerate() {
                let id = self.state.alloc_id();
                spirv::inst(
                    &mut self.state.builder.globals,
                    op::SPEC_CONSTANT,
                    &[float_ty, id, 0],
                );
                self.decorate_spec_id(id, SPEC_ID_FLOAT_BASE + reg * 4 + c as u32);
                self.state.record_value(id, float_desc);
                *comp = id;
            }
            let id = self.state.alloc_id();
            spirv::inst(
                &mut self.state.builder.globals,
                op::SPEC_CONSTANT_COMPOSITE,
                &[vec4_ty, id, comps[0], comps[1], comps[2], comps[3]],
            );
            self.state.record_value(id, vec4_desc);
            self.bank.bind(
                RegisterRef {
                    file: RegisterFile::Const,
                    index: reg,
                },
                id,
            );
        }
        Ok(())
    }

    fn decorate_spec_id(&mut self, id: u32, spec_id: u32) {
        spirv::inst(
            &mut self.state.builder.decorations,
            op::DECORATE,
            &[id, decoration::SPEC_ID, spec_id],
        );
    }

    /// Vertex shaders get the combined model-view-projection matrix as a push
    /// constant. The matrix is preloaded column by column over `c0`..`c3` so
    /// `m4x4 oPos, v0, c0` reads the live transform instead of the
    /// specialization defaults.
    fn emit_transform_block(&mut self) -> Result<(), TranslateError> {
        let mat4 = TypeDescription::matrix(4, 4);
        let mat_ty = self.state.type_id(mat4)?;
        let struct_id = self.state.alloc_id();
        spirv::inst(
            &mut self.state.builder.globals,
            op::TYPE_STRUCT,
            &[struct_id, mat_ty],
        );
        spirv::name(&mut self.state.builder.names, struct_id, "TransformBlock");
        spirv::member_name(&mut self.state.builder.names, struct_id, 0, "mvp");
        spirv::inst(
            &mut self.state.builder.decorations,
            op::DECORATE,
            &[struct_id, decoration::BLOCK],
        );
        spirv::inst(
            &mut self.state.builder.decorations,
            op::MEMBER_DECORATE,
            &[struct_id, 0, decoration::COL_MAJOR],
        );
        spirv::inst(
            &mut self.state.builder.decorations,
            op::MEMBER_DECORATE,
            &[struct_id, 0, decoration::OFFSET, 0],
        );
        spirv::inst(
            &mut self.state.builder.decorations,
            op::MEMBER_DECORATE,
            &[struct_id, 0, decoration::MATRIX_STRIDE, 16],
        );

        let ptr_struct = self.state.alloc_id();
        spirv::inst(
            &mut self.state.builder.globals,
            op::TYPE_POINTER,
            &[ptr_struct, storage_class::PUSH_CONSTANT, struct_id],
        );
        let var = self.state.alloc_id();
        spirv::inst(
            &mut self.state.builder.globals,
            op::VARIABLE,
            &[ptr_struct, var, storage_class::PUSH_CONSTANT],
        );
        spirv::name(&mut self.state.builder.names, var, "transforms");

        let vec4f = TypeDescription::vector(TypeKind::Float, 4);
        let ptr_vec4 = TypeDescription::pointer_to(vec4f, storage_class::PUSH_CONSTANT);
        let zero = self.state.const_i32(0)?;
        for column in 0..4i32 {
            let index = self.state.const_i32(column)?;
            let chain = self.emit_value(op::ACCESS_CHAIN, ptr_vec4, &[var, zero, index])?;
            let loaded = self.emit_value(op::LOAD, vec4f, &[chain])?;
            self.bank.bind(
                RegisterRef {
                    file: RegisterFile::Const,
                    index: column as u32,
                },
                loaded,
            );
        }
        Ok(())
    }

    pub fn lower_instruction(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        match inst.opcode {
            Opcode::Nop | Opcode::Ret | Opcode::End | Opcode::Comment => Ok(()),
            Opcode::Dcl => self.lower_dcl(inst),
            Opcode::Def | Opcode::DefI => self.lower_def(inst),
            Opcode::DefB => self.lower_defb(inst),
            Opcode::Mov | Opcode::Mova => self.lower_mov(inst),
            Opcode::Add => self.lower_binary(inst, op::F_ADD, op::I_ADD),
            Opcode::Sub => self.lower_binary(inst, op::F_SUB, op::I_SUB),
            Opcode::Mul => self.lower_binary(inst, op::F_MUL, op::I_MUL),
            Opcode::Mad => self.lower_mad(inst),
            Opcode::Dp3 => self.lower_dot(inst, 3),
            Opcode::Dp4 => self.lower_dot(inst, 4),
            Opcode::Min => self.lower_ext_binary(inst, glsl450::F_MIN),
            Opcode::Max => self.lower_ext_binary(inst, glsl450::F_MAX),
            Opcode::Pow => self.lower_ext_binary(inst, glsl450::POW),
            Opcode::Rsq => self.lower_ext_unary(inst, glsl450::INVERSE_SQRT),
            Opcode::Frc => self.lower_ext_unary(inst, glsl450::FRACT),
            Opcode::Exp => self.lower_ext_unary(inst, glsl450::EXP2),
            Opcode::Log => self.lower_ext_unary(inst, glsl450::LOG2),
            Opcode::Abs => self.lower_ext_unary(inst, glsl450::F_ABS),
            Opcode::Nrm => self.lower_ext_unary(inst, glsl450::NORMALIZE),
            Opcode::Crs => self.lower_crs(inst),
            Opcode::Dst => self.lower_distance(inst),
            Opcode::M4x4 => self.lower_matrix_multiply(inst, 4, 4),
            Opcode::M4x3 => self.lower_matrix_multiply(inst, 3, 4),
            Opcode::M3x4 => self.lower_matrix_multiply(inst, 4, 3),
            Opcode::M3x3 => self.lower_matrix_multiply(inst, 3, 3),
            Opcode::M3x2 => self.lower_matrix_multiply(inst, 2, 3),
            Opcode::If => self.lower_if(inst),
            Opcode::Ifc => self.lower_ifc(inst),
            Opcode::Else => self.lower_else(inst),
            Opcode::EndIf => self.lower_endif(inst),
            Opcode::Tex => self.lower_tex(inst),
            Opcode::TexCoord => self.lower_texcoord(inst),
            other => {
                warn!(
                    opcode = other.name(),
                    token = inst.token_index,
                    "skipping unimplemented instruction"
                );
                Ok(())
            }
        }
    }

    /// Close out the function and assemble the module.
    pub fn finish(mut self) -> Result<LoweredModule, TranslateError> {
        if let Some(frame) = self.if_stack.last() {
            return Err(TranslateError::ControlFlow {
                token_index: 0,
                message: format!(
                    "shader ended with {} unterminated conditional block(s), merge id {}",
                    self.if_stack.len(),
                    frame.merge_label
                ),
            });
        }

        // D3D clip space is y-down relative to Vulkan; flip the final position
        // rather than patching every shader's math.
        if self.state.version.stage == ShaderStage::Vertex {
            if let Some(position) = self.bank.position_id() {
                let vec4f = TypeDescription::vector(TypeKind::Float, 4);
                let value = self.emit_value(op::LOAD, vec4f, &[position])?;
                let one = self.state.const_f32(1.0)?;
                let neg_one = self.state.const_f32(-1.0)?;
                let flip = self
                    .state
                    .const_composite(vec4f, &[one, neg_one, one, one])?;
                let flipped = self.emit_value(op::F_MUL, vec4f, &[value, flip])?;
                self.emit(op::STORE, &[position, flipped]);
            }
        }
        self.emit(op::RETURN, &[]);
        self.emit(op::FUNCTION_END, &[]);

        let execution_model = match self.state.version.stage {
            ShaderStage::Vertex => spirv::EXECUTION_MODEL_VERTEX,
            ShaderStage::Pixel => spirv::EXECUTION_MODEL_FRAGMENT,
        };
        let interface: Vec<u32> = self
            .bank
            .inputs
            .iter()
            .chain(self.bank.outputs.iter())
            .copied()
            .collect();
        let entry = &mut self.state.builder.entry_points;
        entry.push(spirv::pack(
            3 + spirv::string_word_count("main") + interface.len() as u16,
            op::ENTRY_POINT,
        ));
        entry.push(execution_model);
        entry.push(self.main_id);
        spirv::push_string(entry, "main");
        entry.extend_from_slice(&interface);

        if self.state.version.stage == ShaderStage::Pixel {
            spirv::inst(
                &mut self.state.builder.execution_modes,
                op::EXECUTION_MODE,
                &[self.main_id, spirv::EXECUTION_MODE_ORIGIN_UPPER_LEFT],
            );
        }

        let words = self.state.builder.assemble(self.state.id_bound());
        Ok(LoweredModule {
            words,
            attributes: self.bank.attributes,
            sampler_bindings: self.bank.sampler_bindings,
        })
    }

    // ---- instruction handlers ----

    fn lower_dcl(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = self.dst_of(inst)?;
        let dcl = inst
            .dcl
            .ok_or_else(|| lower_err(inst, "dcl carries no usage payload"))?;
        if let Some(texture) = dcl.texture {
            self.bank.declare_sampler_kind(dst.reg.index, texture);
            return Ok(());
        }
        let info = DclUsageInfo {
            usage: dcl.usage,
            usage_index: dcl.usage_index,
        };
        self.dcl_usages.insert(dst.reg, info);
        // Materialize declared interface registers up front so attribute and
        // varying records follow declaration order.
        match dst.reg.file {
            RegisterFile::Input | RegisterFile::Texture | RegisterFile::Output => {
                self.bank
                    .resolve(&mut self.state, dst.reg, Some(&info), inst.token_index)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn lower_def(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = self.dst_of(inst)?;
        let data = inst
            .def_data
            .ok_or_else(|| lower_err(inst, "def carries no immediate payload"))?;
        let composite = match dst.reg.file {
            RegisterFile::Const => {
                let mut comps = [0u32; 4];
                for (comp, &word) in comps.iter_mut().zip(&data) {
                    *comp = self.state.const_f32(f32::from_bits(word))?;
                }
                self.state
                    .const_composite(TypeDescription::vector(TypeKind::Float, 4), &comps)?
            }
            RegisterFile::ConstInt => {
                let mut comps = [0u32; 4];
                for (comp, &word) in comps.iter_mut().zip(&data) {
                    *comp = self.state.const_i32(word as i32)?;
                }
                self.state
                    .const_composite(TypeDescription::vector(TypeKind::Int, 4), &comps)?
            }
            _ => {
                return Err(lower_err(
                    inst,
                    format!("def targets unexpected register {}", dst.reg),
                ))
            }
        };
        self.bank.bind(dst.reg, composite);
        Ok(())
    }

    fn lower_defb(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = self.dst_of(inst)?;
        let data = inst
            .def_data
            .ok_or_else(|| lower_err(inst, "defb carries no immediate payload"))?;
        if dst.reg.file != RegisterFile::ConstBool {
            return Err(lower_err(
                inst,
                format!("defb targets unexpected register {}", dst.reg),
            ));
        }
        let value = self.state.const_bool(data[0] != 0)?;
        self.bank.bind(dst.reg, value);
        Ok(())
    }

    fn lower_mov(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let src = *self.src_of(inst, 0)?;
        let value = self.load_src(inst, &src)?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_binary(
        &mut self,
        inst: &DecodedInstruction,
        float_op: u16,
        int_op: u16,
    ) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            self.load_src(inst, &src)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            self.load_src(inst, &src)?
        };
        let (a, b, shape) = self.align_pair(inst, a, b)?;
        let opcode = match shape.scalar_kind() {
            TypeKind::Float => float_op,
            TypeKind::Int => int_op,
            other => {
                return Err(lower_err(
                    inst,
                    format!("arithmetic on non-numeric operands ({other:?})"),
                ))
            }
        };
        let value = self.emit_value(opcode, shape, &[a, b])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_mad(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            self.load_src(inst, &src)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            self.load_src(inst, &src)?
        };
        let c = {
            let src = *self.src_of(inst, 2)?;
            self.load_src(inst, &src)?
        };
        let (a, b, shape) = self.align_pair(inst, a, b)?;
        let (mul_op, add_op) = match shape.scalar_kind() {
            TypeKind::Float => (op::F_MUL, op::F_ADD),
            TypeKind::Int => (op::I_MUL, op::I_ADD),
            other => {
                return Err(lower_err(
                    inst,
                    format!("arithmetic on non-numeric operands ({other:?})"),
                ))
            }
        };
        let product = self.emit_value(mul_op, shape, &[a, b])?;
        let (product, c, shape) = self.align_pair(inst, product, c)?;
        let value = self.emit_value(add_op, shape, &[product, c])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_dot(&mut self, inst: &DecodedInstruction, width: u32) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            let id = self.load_src(inst, &src)?;
            self.shrink_vector(inst, id, width)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            let id = self.load_src(inst, &src)?;
            self.shrink_vector(inst, id, width)?
        };
        let value = self.emit_value(op::DOT, TypeDescription::scalar(TypeKind::Float), &[a, b])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_ext_unary(
        &mut self,
        inst: &DecodedInstruction,
        ext_op: u32,
    ) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let src = *self.src_of(inst, 0)?;
        let value = self.load_src(inst, &src)?;
        let shape = self.state.type_of(value)?;
        if shape.scalar_kind() != TypeKind::Float {
            return Err(lower_err(inst, "operand is not a float"));
        }
        let value = self.emit_ext(ext_op, shape, &[value])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_ext_binary(
        &mut self,
        inst: &DecodedInstruction,
        ext_op: u32,
    ) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            self.load_src(inst, &src)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            self.load_src(inst, &src)?
        };
        let (a, b, shape) = self.align_pair(inst, a, b)?;
        if shape.scalar_kind() != TypeKind::Float {
            return Err(lower_err(inst, "operand is not a float"));
        }
        let value = self.emit_ext(ext_op, shape, &[a, b])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_crs(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            let id = self.load_src(inst, &src)?;
            self.shrink_vector(inst, id, 3)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            let id = self.load_src(inst, &src)?;
            self.shrink_vector(inst, id, 3)?
        };
        let vec3f = TypeDescription::vector(TypeKind::Float, 3);
        let value = self.emit_ext(glsl450::CROSS, vec3f, &[a, b])?;
        self.store_dst(inst, &dst, value)
    }

    /// `dst`: (1, s0.y * s1.y, s0.z, s1.w).
    fn lower_distance(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let a = {
            let src = *self.src_of(inst, 0)?;
            self.load_src(inst, &src)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            self.load_src(inst, &src)?
        };
        let float = TypeDescription::scalar(TypeKind::Float);
        let one = self.state.const_f32(1.0)?;
        let ay = self.extract_component(inst, a, 1)?;
        let by = self.extract_component(inst, b, 1)?;
        let y = self.emit_value(op::F_MUL, float, &[ay, by])?;
        let z = self.extract_component(inst, a, 2)?;
        let w = self.extract_component(inst, b, 3)?;
        let vec4f = TypeDescription::vector(TypeKind::Float, 4);
        let value = self.emit_value(op::COMPOSITE_CONSTRUCT, vec4f, &[one, y, z, w])?;
        self.store_dst(inst, &dst, value)
    }

    fn lower_matrix_multiply(
        &mut self,
        inst: &DecodedInstruction,
        columns: u32,
        column_size: u32,
    ) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let vector = {
            let src = *self.src_of(inst, 0)?;
            let id = self.load_src(inst, &src)?;
            self.shrink_vector(inst, id, column_size)?
        };
        let matrix_src = *self.src_of(inst, 1)?;
        if matrix_src.reg.file != RegisterFile::Const {
            return Err(lower_err(
                inst,
                format!(
                    "matrix operand must be a float constant register, got {}",
                    matrix_src.reg
                ),
            ));
        }
        let matrix = self.matrix_operand(inst, matrix_src.reg, columns, column_size)?;
        let value = self.emit_value(
            op::VECTOR_TIMES_MATRIX,
            TypeDescription::vector(TypeKind::Float, columns),
            &[vector, matrix],
        )?;
        self.store_dst(inst, &dst, value)
    }

    /// Construct (and cache) a matrix value from consecutive `c#` registers
    /// starting at `base`. `OpVectorTimesMatrix` dots the vector against each
    /// column, which matches the per-row dot products of the `m4x4` family
    /// when each source register becomes one column.
    fn matrix_operand(
        &mut self,
        inst: &DecodedInstruction,
        base: RegisterRef,
        columns: u32,
        column_size: u32,
    ) -> Result<u32, TranslateError> {
        let key = RegisterRef {
            file: RegisterFile::ConstMatrix,
            index: base.index,
        };
        if let Some(id) = self.bank.lookup(key) {
            return Ok(id);
        }
        let mut cols = [0u32; 4];
        for column in 0..columns {
            let reg = RegisterRef {
                file: RegisterFile::Const,
                index: base.index + column,
            };
            let id = self
                .bank
                .resolve(&mut self.state, reg, None, inst.token_index)?;
            let id = self.load_if_pointer(id)?;
            cols[column as usize] = self.shrink_vector(inst, id, column_size)?;
        }
        let desc = TypeDescription::matrix(columns, column_size);
        let id = self.emit_value(op::COMPOSITE_CONSTRUCT, desc, &cols[..columns as usize])?;
        self.bank.bind(key, id);
        Ok(id)
    }

    fn lower_if(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let src = *self.src_of(inst, 0)?;
        let cond = self.load_src(inst, &src)?;
        let desc = self.state.type_of(cond)?;
        if desc.primary != TypeKind::Bool {
            return Err(lower_err(inst, "if condition is not boolean"));
        }
        self.begin_conditional(inst, cond)
    }

    fn lower_ifc(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let a = {
            let src = *self.src_of(inst, 0)?;
            let id = self.load_src(inst, &src)?;
            self.scalarize(inst, id)?
        };
        let b = {
            let src = *self.src_of(inst, 1)?;
            let id = self.load_src(inst, &src)?;
            self.scalarize(inst, id)?
        };
        if self.state.type_of(a)?.scalar_kind() != TypeKind::Float
            || self.state.type_of(b)?.scalar_kind() != TypeKind::Float
        {
            return Err(lower_err(inst, "ifc compares non-float operands"));
        }
        // Comparison code in the opcode token's control bits, per
        // D3DSHADER_COMPARISON.
        let compare = match inst.control & 0x7 {
            1 => op::F_ORD_GREATER_THAN,
            2 => op::F_ORD_EQUAL,
            3 => op::F_ORD_GREATER_THAN_EQUAL,
            4 => op::F_ORD_LESS_THAN,
            5 => op::F_ORD_NOT_EQUAL,
            6 => op::F_ORD_LESS_THAN_EQUAL,
            other => {
                return Err(TranslateError::ControlFlow {
                    token_index: inst.token_index,
                    message: format!("unknown ifc comparison code {other}"),
                })
            }
        };
        let cond = self.emit_value(compare, TypeDescription::scalar(TypeKind::Bool), &[a, b])?;
        self.begin_conditional(inst, cond)
    }

    fn begin_conditional(
        &mut self,
        inst: &DecodedInstruction,
        condition: u32,
    ) -> Result<(), TranslateError> {
        if self.if_stack.len() >= MAX_CONTROL_FLOW_NESTING {
            return Err(TranslateError::ControlFlow {
                token_index: inst.token_index,
                message: format!(
                    "conditional nesting exceeds maximum depth {MAX_CONTROL_FLOW_NESTING}"
                ),
            });
        }
        let true_label = self.state.alloc_id();
        let false_label = self.state.alloc_id();
        let merge_label = self.state.alloc_id();
        self.emit(op::SELECTION_MERGE, &[merge_label, 0]);
        self.emit(
            op::BRANCH_CONDITIONAL,
            &[condition, true_label, false_label],
        );
        self.emit(op::LABEL, &[true_label]);
        self.if_stack.push(IfFrame {
            false_label,
            merge_label,
            seen_else: false,
        });
        Ok(())
    }

    fn lower_else(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let frame = self
            .if_stack
            .last_mut()
            .ok_or_else(|| TranslateError::ControlFlow {
                token_index: inst.token_index,
                message: "else without an open if".to_owned(),
            })?;
        if frame.seen_else {
            return Err(TranslateError::ControlFlow {
                token_index: inst.token_index,
                message: "duplicate else in conditional block".to_owned(),
            });
        }
        frame.seen_else = true;
        let merge_label = frame.merge_label;
        let false_label = frame.false_label;
        self.emit(op::BRANCH, &[merge_label]);
        self.emit(op::LABEL, &[false_label]);
        Ok(())
    }

    fn lower_endif(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let frame = self
            .if_stack
            .pop()
            .ok_or_else(|| TranslateError::ControlFlow {
                token_index: inst.token_index,
                message: "endif without an open if".to_owned(),
            })?;
        if !frame.seen_else {
            // Synthesize the empty else branch so the false label still
            // reaches the merge block.
            self.emit(op::BRANCH, &[frame.merge_label]);
            self.emit(op::LABEL, &[frame.false_label]);
        }
        self.emit(op::BRANCH, &[frame.merge_label]);
        self.emit(op::LABEL, &[frame.merge_label]);
        Ok(())
    }

    fn lower_tex(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        let version = self.state.version;
        let (coordinate, sampler_index) = if version.major >= 2 {
            let coord_src = *self.src_of(inst, 0)?;
            let coord = self.load_src(inst, &coord_src)?;
            let sampler_src = *self.src_of(inst, 1)?;
            if sampler_src.reg.file != RegisterFile::Sampler {
                return Err(lower_err(
                    inst,
                    format!("texld sampler operand is {}", sampler_src.reg),
                ));
            }
            (coord, sampler_src.reg.index)
        } else if version.is_ps_1_4() {
            let coord_src = *self.src_of(inst, 0)?;
            let coord = self.load_src(inst, &coord_src)?;
            (coord, dst.reg.index)
        } else {
            // ps <= 1.3: the destination texture register names both the
            // coordinate varying and the sampler stage.
            let id = self
                .bank
                .resolve(&mut self.state, dst.reg, None, inst.token_index)?;
            let coord = self.load_if_pointer(id)?;
            (coord, dst.reg.index)
        };

        let sampler_reg = RegisterRef {
            file: RegisterFile::Sampler,
            index: sampler_index,
        };
        let sampler_ptr = self
            .bank
            .resolve(&mut self.state, sampler_reg, None, inst.token_index)?;
        let sampled = self.load_if_pointer(sampler_ptr)?;
        let sampled_desc = self.state.type_of(sampled)?;
        // Dim 2D wants a vec2 coordinate; cube and 3D want vec3.
        let coord_width = if sampled_desc.component_count == 1 { 2 } else { 3 };
        let coordinate = self.shrink_vector(inst, coordinate, coord_width)?;

        let vec4f = TypeDescription::vector(TypeKind::Float, 4);
        let result = self.emit_value(
            op::IMAGE_SAMPLE_IMPLICIT_LOD,
            vec4f,
            &[sampled, coordinate],
        )?;
        if dst.reg.file == RegisterFile::Texture {
            // SM1 texture registers become the sampled color for the rest of
            // the shader.
            self.bank.bind(dst.reg, result);
            Ok(())
        } else {
            self.store_dst(inst, &dst, result)
        }
    }

    fn lower_texcoord(&mut self, inst: &DecodedInstruction) -> Result<(), TranslateError> {
        let dst = *self.dst_of(inst)?;
        if self.state.version.is_ps_1_4() {
            // texcrd dst, t#: copy the coordinate into a temp.
            let src = *self.src_of(inst, 0)?;
            let value = self.load_src(inst, &src)?;
            self.store_dst(inst, &dst, value)
        } else {
            // texcoord t#: the register becomes its interpolated coordinate.
            let id = self
                .bank
                .resolve(&mut self.state, dst.reg, None, inst.token_index)?;
            let value = self.load_if_pointer(id)?;
            self.bank.bind(dst.reg, value);
            Ok(())
        }
    }

    // ---- operand plumbing ----

    fn dst_of<'i>(&self, inst: &'i DecodedInstruction) -> Result<&'i DstOperand, TranslateError> {
        inst.dst
            .as_ref()
            .ok_or_else(|| lower_err(inst, "missing destination operand"))
    }

    fn src_of<'i>(
        &self,
        inst: &'i DecodedInstruction,
        index: usize,
    ) -> Result<&'i crate::sm::decode::SrcOperand, TranslateError> {
        inst.srcs
            .get(index)
            .ok_or_else(|| lower_err(inst, format!("missing source operand {index}")))
    }

    fn load_src(
        &mut self,
        inst: &DecodedInstruction,
        src: &crate::sm::decode::SrcOperand,
    ) -> Result<u32, TranslateError> {
        if src.relative {
            warn!(
                opcode = inst.opcode.name(),
                register = %src.reg,
                "relative addressing is not applied; reading the base register"
            );
        }
        let usage = self.dcl_usages.get(&src.reg).copied();
        let id = self
            .bank
            .resolve(&mut self.state, src.reg, usage.as_ref(), inst.token_index)?;
        let id = self.load_if_pointer(id)?;
        let id = self.apply_swizzle(inst, id, src.swizzle)?;
        self.apply_src_modifier(inst, id, src.modifier)
    }

    fn load_if_pointer(&mut self, id: u32) -> Result<u32, TranslateError> {
        let desc = self.state.type_of(id)?;
        if !desc.is_pointer() {
            return Ok(id);
        }
        self.emit_value(op::LOAD, desc.dereference(), &[id])
    }

    fn apply_swizzle(
        &mut self,
        inst: &DecodedInstruction,
        id: u32,
        swizzle: Swizzle,
    ) -> Result<u32, TranslateError> {
        // Scalars have nothing to select from, and the identity swizzle must
        // not cost an instruction.
        if swizzle.is_identity() {
            return Ok(id);
        }
        let desc = self.state.type_of(id)?;
        if desc.primary != TypeKind::Vector {
            return Ok(id);
        }
        let components = desc.component_count;
        if let Some(selector) = swizzle.uniform_selector() {
            if selector >= components {
                return Err(lower_err(
                    inst,
                    format!("swizzle selects component {selector} of a {components}-vector"),
                ));
            }
            return self.emit_value(
                op::COMPOSITE_EXTRACT,
                TypeDescription::scalar(desc.secondary),
                &[id, selector],
            );
        }
        let mut operands = vec![id, id];
        for component in 0..4 {
            let selector = swizzle.selector(component);
            if selector >= components {
                return Err(lower_err(
                    inst,
                    format!("swizzle selects component {selector} of a {components}-vector"),
                ));
            }
            operands.push(selector);
        }
        self.emit_value(
            op::VECTOR_SHUFFLE,
            TypeDescription::vector(desc.secondary, 4),
            &operands,
        )
    }

    fn apply_src_modifier(
        &mut self,
        inst: &DecodedInstruction,
        id: u32,
        modifier: SrcModifier,
    ) -> Result<u32, TranslateError> {
        match modifier {
            SrcModifier::None => Ok(id),
            SrcModifier::Negate => self.negate(inst, id),
            SrcModifier::Abs => {
                let desc = self.state.type_of(id)?;
                self.emit_ext(glsl450::F_ABS, desc, &[id])
            }
            SrcModifier::AbsNegate => {
                let desc = self.state.type_of(id)?;
                let abs = self.emit_ext(glsl450::F_ABS, desc, &[id])?;
                self.negate(inst, abs)
            }
            SrcModifier::Not => {
                let desc = self.state.type_of(id)?;
                if desc.primary != TypeKind::Bool {
                    return Err(lower_err(inst, "logical not on non-boolean operand"));
                }
                self.emit_value(op::LOGICAL_NOT, desc, &[id])
            }
            other => {
                warn!(
                    opcode = inst.opcode.name(),
                    modifier = ?other,
                    "ignoring unsupported source modifier"
                );
                Ok(id)
            }
        }
    }

    fn negate(&mut self, inst: &DecodedInstruction, id: u32) -> Result<u32, TranslateError> {
        let desc = self.state.type_of(id)?;
        let opcode = match desc.scalar_kind() {
            TypeKind::Float => op::F_NEGATE,
            TypeKind::Int => op::S_NEGATE,
            other => {
                return Err(lower_err(
                    inst,
                    format!("cannot negate operand of kind {other:?}"),
                ))
            }
        };
        self.emit_value(opcode, desc, &[id])
    }

    /// Write `value` through the destination operand: result modifiers first,
    /// then either a store through the register's pointer (full or per-masked-
    /// component) or an SSA rebind (with a merge shuffle for partial masks).
    fn store_dst(
        &mut self,
        inst: &DecodedInstruction,
        dst: &DstOperand,
        mut value: u32,
    ) -> Result<(), TranslateError> {
        let mut value_desc = self.state.type_of(value)?;

        // ps_1_x power-of-two result shift.
        if dst.modifier.shift != 0 && value_desc.scalar_kind() == TypeKind::Float {
            let factor = (dst.modifier.shift as f32).exp2();
            let splat = self.splat_f32(factor, value_desc)?;
            value = self.emit_value(op::F_MUL, value_desc, &[value, splat])?;
        }

        if dst.modifier.saturate && value_desc.scalar_kind() == TypeKind::Float {
            let zero = self.splat_f32(0.0, value_desc)?;
            let one = self.splat_f32(1.0, value_desc)?;
            value = self.emit_ext(glsl450::F_CLAMP, value_desc, &[value, zero, one])?;
        }

        // Integer color results carry D3DCOLOR bytes; normalize to [0, 1].
        if dst.reg.file == RegisterFile::ColorOut && value_desc.scalar_kind() == TypeKind::Int {
            value = self.byte_color_to_float(inst, value)?;
            value_desc = self.state.type_of(value)?;
        }

        let usage = self.dcl_usages.get(&dst.reg).copied();
        let target = self
            .bank
            .resolve(&mut self.state, dst.reg, usage.as_ref(), inst.token_index)?;
        let target_desc = self.state.type_of(target)?;

        if target_desc.is_pointer() {
            let slot = target_desc.dereference();

            // mova writes a float result into the integer address register.
            if slot.scalar_kind() == TypeKind::Int && value_desc.scalar_kind() == TypeKind::Float {
                let converted = if value_desc.primary == TypeKind::Vector {
                    TypeDescription::vector(TypeKind::Int, value_desc.component_count)
                } else {
                    TypeDescription::scalar(TypeKind::Int)
                };
                value = self.emit_value(op::CONVERT_F_TO_S, converted, &[value])?;
                value_desc = converted;
            }

            // Scalar results replicate across the masked components.
            if value_desc.vector_components() == 1 && slot.vector_components() > 1 {
                value = self.splat_value(value, value_desc, slot.vector_components())?;
                value_desc = self.state.type_of(value)?;
            }

            if dst.mask.is_full() {
                let value = self.conform_store(inst, value, value_desc, slot)?;
                self.emit(op::STORE, &[target, value]);
            } else {
                let scalar = TypeDescription::scalar(slot.scalar_kind());
                let pointer_scalar =
                    TypeDescription::pointer_to(scalar, target_desc.storage_class);
                for component in dst.mask.components() {
                    if component >= slot.vector_components()
                        || component >= value_desc.vector_components()
                    {
                        return Err(lower_err(
                            inst,
                            format!("write mask selects component {component} out of range"),
                        ));
                    }
                    let index = self.state.const_i32(component as i32)?;
                    let chain =
                        self.emit_value(op::ACCESS_CHAIN, pointer_scalar, &[target, index])?;
                    let part = self.extract_component(inst, value, component)?;
                    self.emit(op::STORE, &[chain, part]);
                }
            }
            Ok(())
        } else {
            // Value-bound register: a write is a rebind.
            if dst.mask.is_full() {
                self.bank.bind(dst.reg, value);
                return Ok(());
            }
            let old_desc = target_desc;
            if old_desc.primary != TypeKind::Vector {
                return Err(lower_err(inst, "partial write to a scalar-bound register"));
            }
            let old_components = old_desc.component_count;
            if value_desc.vector_components() == 1 {
                value = self.splat_value(value, value_desc, old_components)?;
                value_desc = self.state.type_of(value)?;
            }
            let new_components = value_desc.vector_components();
            // Shuffle over the concatenation (old 0..n-1, new n..): masked
            // components come from the new value, the rest are preserved.
            let mut operands = vec![target, value];
            for component in 0..old_components {
                if dst.mask.contains(component as usize) {
                    if component >= new_components {
                        return Err(lower_err(
                            inst,
                            format!("write mask selects component {component} out of range"),
                        ));
                    }
                    operands.push(old_components + component);
                } else {
                    operands.push(component);
                }
            }
            let merged = self.emit_value(op::VECTOR_SHUFFLE, old_desc, &operands)?;
            self.bank.bind(dst.reg, merged);
            Ok(())
        }
    }

    /// Fit a full-mask store value to the shape of the destination slot.
    fn conform_store(
        &mut self,
        inst: &DecodedInstruction,
        value: u32,
        value_desc: TypeDescription,
        slot: TypeDescription,
    ) -> Result<u32, TranslateError> {
        let have = value_desc.vector_components();
        let want = slot.vector_components();
        if have == want {
            return Ok(value);
        }
        if want == 1 {
            return self.extract_component(inst, value, 0);
        }
        if have > want {
            return self.shrink_vector(inst, value, want);
        }
        Err(lower_err(
            inst,
            format!("cannot store a {have}-component value into a {want}-component register"),
        ))
    }

    /// D3DCOLOR channel bytes to normalized floats: extract, convert, divide
    /// by 255. Channel bytes are unsigned, so the conversion is `OpConvertUToF`
    /// even though the register type carries signedness.
    fn byte_color_to_float(
        &mut self,
        inst: &DecodedInstruction,
        value: u32,
    ) -> Result<u32, TranslateError> {
        let desc = self.state.type_of(value)?;
        let float = TypeDescription::scalar(TypeKind::Float);
        let max = self.state.const_f32(255.0)?;
        let components = desc.vector_components();
        let mut parts = [0u32; 4];
        for component in 0..components {
            let raw = self.extract_component(inst, value, component)?;
            let converted = self.emit_value(op::CONVERT_U_TO_F, float, &[raw])?;
            parts[component as usize] = self.emit_value(op::F_DIV, float, &[converted, max])?;
        }
        if components == 1 {
            return Ok(parts[0]);
        }
        self.emit_value(
            op::COMPOSITE_CONSTRUCT,
            TypeDescription::vector(TypeKind::Float, components),
            &parts[..components as usize],
        )
    }

    /// Broadcast `a` or `b` so both sides share a shape.
    fn align_pair(
        &mut self,
        inst: &DecodedInstruction,
        a: u32,
        b: u32,
    ) -> Result<(u32, u32, TypeDescription), TranslateError> {
        let a_desc = self.state.type_of(a)?;
        let b_desc = self.state.type_of(b)?;
        if a_desc == b_desc {
            return Ok((a, b, a_desc));
        }
        let a_n = a_desc.vector_components();
        let b_n = b_desc.vector_components();
        if a_n == 1 && b_n > 1 {
            let a = self.splat_value(a, a_desc, b_n)?;
            return Ok((a, b, b_desc));
        }
        if b_n == 1 && a_n > 1 {
            let b = self.splat_value(b, b_desc, a_n)?;
            return Ok((a, b, a_desc));
        }
        if a_n > b_n {
            let a = self.shrink_vector(inst, a, b_n)?;
            return Ok((a, b, b_desc));
        }
        if b_n > a_n {
            let b = self.shrink_vector(inst, b, a_n)?;
            return Ok((a, b, a_desc));
        }
        Err(lower_err(
            inst,
            format!(
                "operand kinds do not match ({:?} vs {:?})",
                a_desc.scalar_kind(),
                b_desc.scalar_kind()
            ),
        ))
    }

    fn splat_value(
        &mut self,
        value: u32,
        value_desc: TypeDescription,
        components: u32,
    ) -> Result<u32, TranslateError> {
        let kind = value_desc.scalar_kind();
        let desc = TypeDescription::vector(kind, components);
        let parts = [value; 4];
        self.emit_value(op::COMPOSITE_CONSTRUCT, desc, &parts[..components as usize])
    }

    /// Constant with the same shape as `shape`, every component `value`.
    fn splat_f32(
        &mut self,
        value: f32,
        shape: TypeDescription,
    ) -> Result<u32, TranslateError> {
        let scalar = self.state.const_f32(value)?;
        if shape.primary != TypeKind::Vector {
            return Ok(scalar);
        }
        let parts = [scalar; 4];
        self.state
            .const_composite(shape, &parts[..shape.component_count as usize])
    }

    fn shrink_vector(
        &mut self,
        inst: &DecodedInstruction,
        value: u32,
        components: u32,
    ) -> Result<u32, TranslateError> {
        let desc = self.state.type_of(value)?;
        let have = desc.vector_components();
        if have == components {
            return Ok(value);
        }
        if have < components {
            return Err(lower_err(
                inst,
                format!("operand has {have} components, needs {components}"),
            ));
        }
        if components == 1 {
            return self.extract_component(inst, value, 0);
        }
        let mut operands = vec![value, value];
        operands.extend(0..components);
        self.emit_value(
            op::VECTOR_SHUFFLE,
            TypeDescription::vector(desc.scalar_kind(), components),
            &operands,
        )
    }

    fn extract_component(
        &mut self,
        inst: &DecodedInstruction,
        value: u32,
        component: u32,
    ) -> Result<u32, TranslateError> {
        let desc = self.state.type_of(value)?;
        if desc.primary != TypeKind::Vector {
            if component == 0 {
                return Ok(value);
            }
            return Err(lower_err(
                inst,
                format!("component {component} of a scalar value"),
            ));
        }
        if component >= desc.component_count {
            return Err(lower_err(
                inst,
                format!(
                    "component {component} of a {}-vector",
                    desc.component_count
                ),
            ));
        }
        self.emit_value(
            op::COMPOSITE_EXTRACT,
            TypeDescription::scalar(desc.secondary),
            &[value, component],
        )
    }

    fn scalarize(
        &mut self,
        inst: &DecodedInstruction,
        value: u32,
    ) -> Result<u32, TranslateError> {
        self.extract_component(inst, value, 0)
    }

    // ---- emission ----

    fn emit(&mut self, opcode: u16, operands: &[u32]) {
        spirv::inst(&mut self.state.builder.functions, opcode, operands);
    }

    fn emit_value(
        &mut self,
        opcode: u16,
        ty: TypeDescription,
        operands: &[u32],
    ) -> Result<u32, TranslateError> {
        let type_id = self.state.type_id(ty)?;
        let id = self.state.alloc_id();
        let mut words = Vec::with_capacity(2 + operands.len());
        words.push(type_id);
        words.push(id);
        words.extend_from_slice(operands);
        spirv::inst(&mut self.state.builder.functions, opcode, &words);
        self.state.record_value(id, ty);
        Ok(id)
    }

    fn emit_ext(
        &mut self,
        ext_op: u32,
        ty: TypeDescription,
        args: &[u32],
    ) -> Result<u32, TranslateError> {
        let type_id = self.state.type_id(ty)?;
        let id = self.state.alloc_id();
        let mut words = Vec::with_capacity(4 + args.len());
        words.push(type_id);
        words.push(id);
        words.push(self.glsl_ext);
        words.push(ext_op);
        words.extend_from_slice(args);
        spirv::inst(&mut self.state.builder.functions, op::EXT_INST, &words);
        self.state.record_value(id, ty);
        Ok(id)
    }
}

fn lower_err(inst: &DecodedInstruction, message: impl Into<String>) -> TranslateError {
    TranslateError::Lower {
        opcode: inst.opcode.name(),
        token_index: inst.token_index,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::decode::{DstOperand, ResultModifier, SrcOperand, WriteMask};
    use pretty_assertions::assert_eq;

    fn vs_2_0() -> ShaderVersion {
        ShaderVersion {
            stage: ShaderStage::Vertex,
            major: 2,
            minor: 0,
        }
    }

    fn ps_2_0() -> ShaderVersion {
        ShaderVersion {
            stage: ShaderStage::Pixel,
            major: 2,
            minor: 0,
        }
    }

    fn reg(file: RegisterFile, index: u32) -> RegisterRef {
        RegisterRef { file, index }
    }

    fn dst(file: RegisterFile, index: u32, mask: u8) -> DstOperand {
        DstOperand {
            reg: reg(file, index),
            mask: WriteMask(mask),
            modifier: ResultModifier::default(),
        }
    }

    fn src(file: RegisterFile, index: u32) -> SrcOperand {
        SrcOperand {
            reg: reg(file, index),
            swizzle: Swizzle::IDENTITY,
            modifier: SrcModifier::None,
            relative: false,
        }
    }

    fn instruction(opcode: Opcode, dst: Option<DstOperand>, srcs: Vec<SrcOperand>) -> DecodedInstruction {
        DecodedInstruction {
            token_index: 0,
            opcode,
            control: 0,
            dst,
            srcs,
            dcl: None,
            def_data: None,
        }
    }

    #[test]
    fn identity_swizzle_is_free() {
        let mut lowerer = Lowerer::new(vs_2_0()).unwrap();
        let value = lowerer
            .bank
            .lookup(reg(RegisterFile::Const, 10))
            .unwrap();
        let inst = instruction(Opcode::Mov, None, vec![]);
        let same = lowerer
            .apply_swizzle(&inst, value, Swizzle::IDENTITY)
            .unwrap();
        assert_eq!(same, value);

        // A replicate swizzle extracts a scalar instead.
        let scalar = lowerer.apply_swizzle(&inst, value, Swizzle(0xFF)).unwrap();
        assert_ne!(scalar, value);
        let desc = lowerer.state.type_of(scalar).unwrap();
        assert_eq!(desc.vector_components(), 1);
    }

    #[test]
    fn partial_write_to_value_register_merges_components() {
        let mut lowerer = Lowerer::new(vs_2_0()).unwrap();
        // def c4, <one constant>; then write c4.xy from c5 by abusing the
        // value-bind path the way texture registers do.
        let c4 = reg(RegisterFile::Const, 4);
        let before = lowerer.bank.lookup(c4).unwrap();
        let source = lowerer.bank.lookup(reg(RegisterFile::Const, 5)).unwrap();
        let inst = instruction(Opcode::Mov, Some(dst(RegisterFile::Const, 4, 0b0011)), vec![]);
        lowerer
            .store_dst(&inst, &inst.dst.unwrap(), source)
            .unwrap();
        let after = lowerer.bank.lookup(c4).unwrap();
        assert_ne!(after, before);
        // The merge result is a fresh vec4 value, not a pointer.
        let desc = lowerer.state.type_of(after).unwrap();
        assert!(!desc.is_pointer());
        assert_eq!(desc.vector_components(), 4);
    }

    #[test]
    fn zero_mask_writes_every_component() {
        let mut lowerer = Lowerer::new(vs_2_0()).unwrap();
        // Some assemblers encode "no mask" as 0; it means a full write, so
        // the register rebinds straight to the source with no merge shuffle.
        let c4 = reg(RegisterFile::Const, 4);
        let source = lowerer.bank.lookup(reg(RegisterFile::Const, 5)).unwrap();
        let inst = instruction(Opcode::Mov, Some(dst(RegisterFile::Const, 4, 0)), vec![]);
        lowerer
            .store_dst(&inst, &inst.dst.unwrap(), source)
            .unwrap();
        assert_eq!(lowerer.bank.lookup(c4).unwrap(), source);
    }

    #[test]
    fn temp_registers_are_stored_through_pointers() {
        let mut lowerer = Lowerer::new(vs_2_0()).unwrap();
        let mov = instruction(
            Opcode::Mov,
            Some(dst(RegisterFile::Temp, 0, 0xF)),
            vec![src(RegisterFile::Const, 7)],
        );
        lowerer.lower_instruction(&mov).unwrap();
        let r0 = lowerer.bank.lookup(reg(RegisterFile::Temp, 0)).unwrap();
        assert!(lowerer.state.type_of(r0).unwrap().is_pointer());
    }

    #[test]
    fn endif_without_if_is_a_control_flow_error() {
        let mut lowerer = Lowerer::new(ps_2_0()).unwrap();
        let endif = instruction(Opcode::EndIf, None, vec![]);
        let err = lowerer.lower_instruction(&endif).unwrap_err();
        assert!(matches!(err, TranslateError::ControlFlow { .. }));
    }

    #[test]
    fn unterminated_if_fails_at_finish() {
        let mut lowerer = Lowerer::new(ps_2_0()).unwrap();
        let mut open = instruction(Opcode::Ifc, None, vec![
            src(RegisterFile::Const, 0),
            src(RegisterFile::Const, 1),
        ]);
        open.control = 1; // greater-than
        lowerer.lower_instruction(&open).unwrap();
        let err = lowerer.finish().unwrap_err();
        assert!(matches!(err, TranslateError::ControlFlow { .. }));
    }

    #[test]
    fn unknown_comparison_code_is_rejected() {
        let mut lowerer = Lowerer::new(ps_2_0()).unwrap();
        let mut bad = instruction(Opcode::Ifc, None, vec![
            src(RegisterFile::Const, 0),
            src(RegisterFile::Const, 1),
        ]);
        bad.control = 7;
        let err = lowerer.lower_instruction(&bad).unwrap_err();
        assert!(matches!(err, TranslateError::ControlFlow { .. }));
    }

    #[test]
    fn vertex_modules_preload_the_transform_columns() {
        let lowerer = Lowerer::new(vs_2_0()).unwrap();
        // c0..c3 are bound to loaded push-constant columns, not the
        // specialization defaults.
        for column in 0..4 {
            let id = lowerer.bank.lookup(reg(RegisterFile::Const, column)).unwrap();
            let desc = lowerer.state.type_of(id).unwrap();
            assert!(!desc.is_pointer());
            assert_eq!(desc.vector_components(), 4);
        }
    }
}
