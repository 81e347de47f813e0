//! Token-level decoding of D3D9 shader bytecode (vs/ps 1.x through 3.0).
//!
//! The shader is a stream of little-endian DWORD tokens: a version token, then
//! instructions, then the end token `0x0000FFFF`. Every instruction token
//! carries the opcode in its low 16 bits and (from SM2 onward) the parameter
//! token count in bits 24..27. Parameter tokens encode the register file split
//! across bits 28..30 and 11..12, the register number in bits 0..10, and
//! either a write mask (destinations, bits 16..19) or a swizzle (sources, bits
//! 16..23).

use tracing::warn;

use crate::shader_limits::{
    MAX_SHADER_BYTECODE_BYTES, MAX_SHADER_REGISTER_INDEX, MAX_SHADER_TOKEN_COUNT,
};
use crate::sm::types::{ShaderStage, ShaderVersion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub token_index: usize,
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shader decode error at token {}: {}",
            self.token_index, self.message
        )
    }
}

impl std::error::Error for DecodeError {}

pub(crate) const END_TOKEN: u32 = 0x0000_FFFF;
const OPCODE_MASK: u32 = 0x0000_FFFF;
const PARAM_COUNT_SHIFT: u32 = 24;
const PARAM_COUNT_MASK: u32 = 0x0F;
const PREDICATED: u32 = 0x1000_0000;
const RELATIVE_ADDRESSING: u32 = 0x0000_2000;

/// Sequential cursor over the raw token stream.
///
/// Every read is bounds-checked; running off the end mid-instruction is a
/// decode error carrying the offending token index.
pub struct TokenReader<'a> {
    tokens: &'a [u32],
    index: usize,
}

impl<'a> TokenReader<'a> {
    pub fn new(tokens: &'a [u32]) -> Self {
        Self { tokens, index: 0 }
    }

    pub fn position(&self) -> usize {
        self.index
    }

    pub fn is_at_end(&self) -> bool {
        self.index >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<u32> {
        self.tokens.get(self.index).copied()
    }

    pub fn next(&mut self) -> Result<u32, DecodeError> {
        let token = self.tokens.get(self.index).copied().ok_or_else(|| DecodeError {
            token_index: self.index,
            message: "token stream truncated mid-instruction".to_owned(),
        })?;
        self.index += 1;
        Ok(token)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        let end = self.index.checked_add(count).ok_or_else(|| DecodeError {
            token_index: self.index,
            message: "token skip overflow".to_owned(),
        })?;
        if end > self.tokens.len() {
            return Err(DecodeError {
                token_index: self.index,
                message: format!(
                    "cannot skip {count} tokens, only {} remain",
                    self.tokens.len() - self.index
                ),
            });
        }
        self.index = end;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Mov,
    Mova,
    Add,
    Sub,
    Mul,
    Mad,
    Dp3,
    Dp4,
    Min,
    Max,
    Rsq,
    Frc,
    Exp,
    Log,
    Pow,
    Abs,
    Nrm,
    Crs,
    Dst,
    M4x4,
    M4x3,
    M3x4,
    M3x3,
    M3x2,
    If,
    Ifc,
    Else,
    EndIf,
    Tex,
    TexCoord,
    Dcl,
    Def,
    DefI,
    DefB,
    // Decoded but not lowered; the translator skips these with a warning.
    Rcp,
    Slt,
    Sge,
    Lrp,
    Cmp,
    Cnd,
    Dp2Add,
    Sgn,
    Lit,
    SinCos,
    TexKill,
    TexLdd,
    TexLdl,
    Ret,
    Comment,
    End,
    Unknown(u16),
}

impl Opcode {
    pub fn from_raw(op: u16) -> Self {
        match op {
            0 => Self::Nop,
            1 => Self::Mov,
            2 => Self::Add,
            3 => Self::Sub,
            4 => Self::Mad,
            5 => Self::Mul,
            6 => Self::Rcp,
            7 => Self::Rsq,
            8 => Self::Dp3,
            9 => Self::Dp4,
            10 => Self::Min,
            11 => Self::Max,
            12 => Self::Slt,
            13 => Self::Sge,
            14 => Self::Exp,
            15 => Self::Log,
            16 => Self::Lit,
            17 => Self::Dst,
            18 => Self::Lrp,
            19 => Self::Frc,
            20 => Self::M4x4,
            21 => Self::M4x3,
            22 => Self::M3x4,
            23 => Self::M3x3,
            24 => Self::M3x2,
            28 => Self::Ret,
            31 => Self::Dcl,
            32 => Self::Pow,
            33 => Self::Crs,
            34 => Self::Sgn,
            35 => Self::Abs,
            36 => Self::Nrm,
            37 => Self::SinCos,
            40 => Self::If,
            41 => Self::Ifc,
            42 => Self::Else,
            43 => Self::EndIf,
            46 => Self::Mova,
            47 => Self::DefB,
            48 => Self::DefI,
            64 => Self::TexCoord, // texcoord / texcrd
            65 => Self::TexKill,
            66 => Self::Tex, // tex / texld
            80 => Self::Cnd,
            81 => Self::Def,
            88 => Self::Cmp,
            90 => Self::Dp2Add,
            93 => Self::TexLdd,
            95 => Self::TexLdl,
            0xFFFE => Self::Comment,
            0xFFFF => Self::End,
            other => Self::Unknown(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Mov => "mov",
            Self::Mova => "mova",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Mad => "mad",
            Self::Dp3 => "dp3",
            Self::Dp4 => "dp4",
            Self::Min => "min",
            Self::Max => "max",
            Self::Rsq => "rsq",
            Self::Frc => "frc",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Pow => "pow",
            Self::Abs => "abs",
            Self::Nrm => "nrm",
            Self::Crs => "crs",
            Self::Dst => "dst",
            Self::M4x4 => "m4x4",
            Self::M4x3 => "m4x3",
            Self::M3x4 => "m3x4",
            Self::M3x3 => "m3x3",
            Self::M3x2 => "m3x2",
            Self::If => "if",
            Self::Ifc => "ifc",
            Self::Else => "else",
            Self::EndIf => "endif",
            Self::Tex => "tex",
            Self::TexCoord => "texcoord",
            Self::Dcl => "dcl",
            Self::Def => "def",
            Self::DefI => "defi",
            Self::DefB => "defb",
            Self::Rcp => "rcp",
            Self::Slt => "slt",
            Self::Sge => "sge",
            Self::Lrp => "lrp",
            Self::Cmp => "cmp",
            Self::Cnd => "cnd",
            Self::Dp2Add => "dp2add",
            Self::Sgn => "sgn",
            Self::Lit => "lit",
            Self::SinCos => "sincos",
            Self::TexKill => "texkill",
            Self::TexLdd => "texldd",
            Self::TexLdl => "texldl",
            Self::Ret => "ret",
            Self::Comment => "comment",
            Self::End => "end",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Operand shape: `(has_destination, source_count)`.
    ///
    /// Used both to decode operands and to skip instructions whose parameter
    /// count field is zero (pre-SM2 toolchains did not fill it in).
    fn signature(&self, version: &ShaderVersion) -> Option<(bool, usize)> {
        Some(match self {
            Self::Nop | Self::Else | Self::EndIf | Self::Ret | Self::End => (false, 0),
            Self::Mov | Self::Mova | Self::Rsq | Self::Frc | Self::Exp | Self::Log
            | Self::Abs | Self::Nrm | Self::Rcp | Self::Sgn | Self::Lit => (true, 1),
            Self::Add | Self::Sub | Self::Mul | Self::Dp3 | Self::Dp4 | Self::Min
            | Self::Max | Self::Pow | Self::Crs | Self::Dst | Self::Slt | Self::Sge
            | Self::M4x4 | Self::M4x3 | Self::M3x4 | Self::M3x3 | Self::M3x2 => (true, 2),
            Self::Mad | Self::Lrp | Self::Cmp | Self::Cnd | Self::Dp2Add => (true, 3),
            Self::SinCos => {
                if version.major >= 3 {
                    (true, 1)
                } else {
                    // SM2 sincos takes two extra Taylor-series constant operands.
                    (true, 3)
                }
            }
            Self::If => (false, 1),
            Self::Ifc => (false, 2),
            Self::TexKill => (true, 0),
            Self::Tex => {
                if version.major >= 2 {
                    (true, 2)
                } else if version.is_ps_1_4() {
                    (true, 1)
                } else {
                    // ps <= 1.3: the destination register doubles as the coordinate.
                    (true, 0)
                }
            }
            Self::TexCoord => {
                if version.is_ps_1_4() {
                    (true, 1)
                } else {
                    (true, 0)
                }
            }
            Self::TexLdd => (true, 4),
            Self::TexLdl => (true, 2),
            // dcl/def* have dedicated decode paths.
            Self::Dcl => (true, 0),
            Self::Def | Self::DefI => (true, 0),
            Self::DefB => (true, 0),
            Self::Comment | Self::Unknown(_) => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterFile {
    Temp,
    Input,
    Const,
    Addr,
    Texture,
    RastOut,
    AttrOut,
    TexCoordOut,
    Output,
    ConstInt,
    ColorOut,
    DepthOut,
    Sampler,
    ConstBool,
    Loop,
    Predicate,
    MiscType,
    /// Pseudo-file used by the `m4x4` family: the operand names a float
    /// constant register that is the first row of a matrix.
    ConstMatrix,
    Unknown(u8),
}

impl RegisterFile {
    fn from_raw(raw: u8, stage: ShaderStage, major: u8) -> Self {
        // Register type values follow `D3DSHADER_PARAM_REGISTER_TYPE`. Some
        // encodings are stage-dependent: type 3 is `a#` (vertex) or `t#`
        // (pixel), type 8 is `o#` (vertex) or `oC#` (pixel).
        match raw {
            0 => Self::Temp,
            1 => Self::Input,
            2 => Self::Const,
            3 => match stage {
                ShaderStage::Vertex => Self::Addr,
                ShaderStage::Pixel => Self::Texture,
            },
            4 => Self::RastOut,
            5 => Self::AttrOut,
            6 => {
                if stage == ShaderStage::Vertex && major >= 3 {
                    Self::Output
                } else {
                    Self::TexCoordOut
                }
            }
            7 => Self::ConstInt,
            8 => match stage {
                ShaderStage::Vertex => Self::Output,
                ShaderStage::Pixel => Self::ColorOut,
            },
            9 => Self::DepthOut,
            10 => Self::Sampler,
            11..=13 => Self::Const,
            14 => Self::ConstBool,
            15 => Self::Loop,
            17 => Self::MiscType,
            19 => Self::Predicate,
            other => Self::Unknown(other),
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Temp => "r",
            Self::Input => "v",
            Self::Const => "c",
            Self::Addr => "a",
            Self::Texture => "t",
            Self::RastOut => "oPos",
            Self::AttrOut => "oD",
            Self::TexCoordOut => "oT",
            Self::Output => "o",
            Self::ConstInt => "i",
            Self::ColorOut => "oC",
            Self::DepthOut => "oDepth",
            Self::Sampler => "s",
            Self::ConstBool => "b",
            Self::Loop => "aL",
            Self::Predicate => "p",
            Self::MiscType => "misc",
            Self::ConstMatrix => "cm",
            Self::Unknown(_) => "?",
        }
    }
}

/// Destination write mask, bits 16..19 of the destination token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteMask(pub u8);

impl WriteMask {
    pub const ALL: WriteMask = WriteMask(0xF);

    pub fn is_full(&self) -> bool {
        self.0 == 0xF || self.0 == 0
    }

    pub fn contains(&self, component: usize) -> bool {
        debug_assert!(component < 4);
        self.0 & (1 << component) != 0
    }

    pub fn components(&self) -> impl Iterator<Item = u32> + '_ {
        (0..4u32).filter(move |&c| self.0 & (1 << c) != 0)
    }

    pub fn count(&self) -> u32 {
        (self.0 & 0xF).count_ones()
    }
}

/// Source swizzle, bits 16..23 of the source token, two bits per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(pub u8);

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle(0xE4); // .xyzw

    pub fn selector(&self, component: usize) -> u32 {
        debug_assert!(component < 4);
        ((self.0 >> (component * 2)) & 0x3) as u32
    }

    pub fn is_identity(&self) -> bool {
        self.0 == 0xE4
    }

    /// Returns the common selector when all four components read the same
    /// source component (e.g. `.wwww`).
    pub fn uniform_selector(&self) -> Option<u32> {
        let first = self.selector(0);
        (1..4).all(|c| self.selector(c) == first).then_some(first)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcModifier {
    None,
    Negate,
    Bias,
    BiasNegate,
    Sign,
    SignNegate,
    Comp,
    X2,
    X2Negate,
    Dz,
    Dw,
    Abs,
    AbsNegate,
    Not,
    Unknown(u8),
}

impl SrcModifier {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Negate,
            2 => Self::Bias,
            3 => Self::BiasNegate,
            4 => Self::Sign,
            5 => Self::SignNegate,
            6 => Self::Comp,
            7 => Self::X2,
            8 => Self::X2Negate,
            9 => Self::Dz,
            10 => Self::Dw,
            11 => Self::Abs,
            12 => Self::AbsNegate,
            13 => Self::Not,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultModifier {
    pub saturate: bool,
    /// Power-of-two result shift, ps_1_x only. Positive multiplies, negative
    /// divides.
    pub shift: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterRef {
    pub file: RegisterFile,
    pub index: u32,
}

impl std::fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.file.short_name(), self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstOperand {
    pub reg: RegisterRef,
    pub mask: WriteMask,
    pub modifier: ResultModifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcOperand {
    pub reg: RegisterRef,
    pub swizzle: Swizzle,
    pub modifier: SrcModifier,
    /// The operand used relative addressing; the address token (SM2+) has
    /// already been consumed.
    pub relative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DclUsage {
    Position,
    BlendWeight,
    BlendIndices,
    Normal,
    PointSize,
    TexCoord,
    Tangent,
    Binormal,
    TessFactor,
    PositionT,
    Color,
    Fog,
    Depth,
    Sample,
    Unknown(u8),
}

impl DclUsage {
    /// `D3DDECLUSAGE` value, shared between shader `dcl` tokens and vertex
    /// declaration elements.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Position,
            1 => Self::BlendWeight,
            2 => Self::BlendIndices,
            3 => Self::Normal,
            4 => Self::PointSize,
            5 => Self::TexCoord,
            6 => Self::Tangent,
            7 => Self::Binormal,
            8 => Self::TessFactor,
            9 => Self::PositionT,
            10 => Self::Color,
            11 => Self::Fog,
            12 => Self::Depth,
            13 => Self::Sample,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureType {
    Texture2D,
    TextureCube,
    Texture3D,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DclInfo {
    pub usage: DclUsage,
    pub usage_index: u8,
    /// Set for sampler declarations.
    pub texture: Option<TextureType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInstruction {
    pub token_index: usize,
    pub opcode: Opcode,
    /// Opcode-specific control bits (token bits 16..23); `ifc` keeps its
    /// comparison code here.
    pub control: u8,
    pub dst: Option<DstOperand>,
    pub srcs: Vec<SrcOperand>,
    pub dcl: Option<DclInfo>,
    /// Raw immediate payload of `def`/`defi` (four words) or `defb` (one word,
    /// replicated).
    pub def_data: Option<[u32; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedShader {
    pub version: ShaderVersion,
    pub instructions: Vec<DecodedInstruction>,
}

pub fn decode_u8_le_bytes(bytes: &[u8]) -> Result<DecodedShader, DecodeError> {
    if bytes.len() > MAX_SHADER_BYTECODE_BYTES {
        return Err(DecodeError {
            token_index: 0,
            message: format!(
                "bytecode length {} exceeds maximum {} bytes",
                bytes.len(),
                MAX_SHADER_BYTECODE_BYTES
            ),
        });
    }
    if bytes.len() % 4 != 0 {
        return Err(DecodeError {
            token_index: 0,
            message: format!("bytecode length {} is not a multiple of 4", bytes.len()),
        });
    }
    let tokens: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    decode_tokens(&tokens)
}

pub fn decode_version_token(token: u32) -> Option<(ShaderStage, u8, u8)> {
    let stage = match token >> 16 {
        0xFFFE => ShaderStage::Vertex,
        0xFFFF => ShaderStage::Pixel,
        _ => return None,
    };
    let major = ((token >> 8) & 0xFF) as u8;
    let minor = (token & 0xFF) as u8;
    Some((stage, major, minor))
}

pub fn decode_tokens(tokens: &[u32]) -> Result<DecodedShader, DecodeError> {
    if tokens.len() > MAX_SHADER_TOKEN_COUNT {
        return Err(DecodeError {
            token_index: 0,
            message: format!(
                "token count {} exceeds maximum {}",
                tokens.len(),
                MAX_SHADER_TOKEN_COUNT
            ),
        });
    }
    let mut reader = TokenReader::new(tokens);

    let version_token = reader.next().map_err(|_| DecodeError {
        token_index: 0,
        message: "empty token stream".to_owned(),
    })?;
    let (stage, major, minor) =
        decode_version_token(version_token).ok_or_else(|| DecodeError {
            token_index: 0,
            message: format!("unknown shader version token 0x{version_token:08x}"),
        })?;
    let supported = match (stage, major) {
        (_, 1) => minor <= 4,
        (_, 2) => minor <= 1,
        (_, 3) => minor == 0,
        _ => false,
    };
    if !supported {
        return Err(DecodeError {
            token_index: 0,
            message: format!("unsupported shader model {major}.{minor}"),
        });
    }
    let version = ShaderVersion {
        stage,
        major,
        minor,
    };

    let mut instructions = Vec::new();

    while !reader.is_at_end() {
        let token_index = reader.position();
        let opcode_token = reader.next()?;
        let opcode = Opcode::from_raw((opcode_token & OPCODE_MASK) as u16);

        match opcode {
            Opcode::End => break,
            Opcode::Comment => {
                // Comment length lives in bits 16..30 of the comment token.
                let comment_len = ((opcode_token >> 16) & 0x7FFF) as usize;
                reader.skip(comment_len)?;
                continue;
            }
            Opcode::Nop => continue,
            _ => {}
        }

        let param_count = ((opcode_token >> PARAM_COUNT_SHIFT) & PARAM_COUNT_MASK) as usize;
        let predicated = opcode_token & PREDICATED != 0;
        let control = ((opcode_token >> 16) & 0xFF) as u8;

        let inst = match opcode {
            Opcode::Dcl => decode_dcl(&mut reader, &version, token_index)?,
            Opcode::Def | Opcode::DefI => decode_def(&mut reader, &version, opcode, token_index)?,
            Opcode::DefB => decode_defb(&mut reader, &version, token_index)?,
            _ => match opcode.signature(&version) {
                Some((has_dst, src_count)) => decode_operands(
                    &mut reader,
                    &version,
                    opcode,
                    token_index,
                    control,
                    has_dst,
                    src_count,
                    predicated,
                )?,
                None => {
                    // Unknown opcode: skip it using the embedded parameter
                    // count and keep going. Pre-SM2 streams do not carry that
                    // count, so there we have to give up.
                    if major < 2 && param_count == 0 {
                        return Err(DecodeError {
                            token_index,
                            message: format!(
                                "unknown opcode 0x{:04x} in SM1 stream",
                                opcode_token & OPCODE_MASK
                            ),
                        });
                    }
                    warn!(
                        raw = opcode_token & OPCODE_MASK,
                        params = param_count,
                        "skipping unknown opcode"
                    );
                    reader.skip(param_count)?;
                    continue;
                }
            },
        };
        instructions.push(inst);
    }

    Ok(DecodedShader {
        version,
        instructions,
    })
}

fn register_from_token(
    token: u32,
    version: &ShaderVersion,
    token_index: usize,
) -> Result<RegisterRef, DecodeError> {
    let raw_type = (((token >> 28) & 0x7) | ((token >> 8) & 0x18)) as u8;
    let file = RegisterFile::from_raw(raw_type, version.stage, version.major);
    let index = token & 0x7FF;
    if index > MAX_SHADER_REGISTER_INDEX {
        return Err(DecodeError {
            token_index,
            message: format!(
                "register index {index} exceeds maximum {MAX_SHADER_REGISTER_INDEX}"
            ),
        });
    }
    Ok(RegisterRef { file, index })
}

fn decode_dst(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
) -> Result<DstOperand, DecodeError> {
    let token_index = reader.position();
    let token = reader.next()?;
    let reg = register_from_token(token, version, token_index)?;
    let mask = WriteMask(((token >> 16) & 0xF) as u8);
    let saturate = token & 0x0010_0000 != 0;
    let shift_raw = ((token >> 24) & 0xF) as u8;
    // The shift field is a signed 4-bit power of two.
    let shift = if shift_raw >= 8 {
        shift_raw as i8 - 16
    } else {
        shift_raw as i8
    };
    Ok(DstOperand {
        reg,
        mask,
        modifier: ResultModifier { saturate, shift },
    })
}

fn decode_src(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
) -> Result<SrcOperand, DecodeError> {
    let token_index = reader.position();
    let token = reader.next()?;
    let reg = register_from_token(token, version, token_index)?;
    let swizzle = Swizzle(((token >> 16) & 0xFF) as u8);
    let modifier = SrcModifier::from_raw(((token >> 24) & 0xF) as u8);
    let relative = token & RELATIVE_ADDRESSING != 0;
    if relative && version.major >= 2 {
        // SM2+ relative addressing appends an explicit address token.
        reader.next()?;
    }
    Ok(SrcOperand {
        reg,
        swizzle,
        modifier,
        relative,
    })
}

#[allow(clippy::too_many_arguments)]
fn decode_operands(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
    opcode: Opcode,
    token_index: usize,
    control: u8,
    has_dst: bool,
    src_count: usize,
    predicated: bool,
) -> Result<DecodedInstruction, DecodeError> {
    let dst = if has_dst {
        Some(decode_dst(reader, version)?)
    } else {
        None
    };
    if predicated {
        // Predicate token sits between the destination and the sources. The
        // lowering engine does not implement predication; drop it here so the
        // operand decode below stays aligned.
        warn!(opcode = opcode.name(), "ignoring predicate on instruction");
        reader.next()?;
    }
    let mut srcs = Vec::with_capacity(src_count);
    for _ in 0..src_count {
        srcs.push(decode_src(reader, version)?);
    }
    Ok(DecodedInstruction {
        token_index,
        opcode,
        control,
        dst,
        srcs,
        dcl: None,
        def_data: None,
    })
}

fn decode_dcl(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
    token_index: usize,
) -> Result<DecodedInstruction, DecodeError> {
    let usage_token = reader.next()?;
    let dst = decode_dst(reader, version)?;

    let dcl = if dst.reg.file == RegisterFile::Sampler {
        let texture = match (usage_token >> 27) & 0xF {
            2 => TextureType::Texture2D,
            3 => TextureType::TextureCube,
            4 => TextureType::Texture3D,
            other => TextureType::Unknown(other as u8),
        };
        DclInfo {
            usage: DclUsage::Unknown(0),
            usage_index: 0,
            texture: Some(texture),
        }
    } else {
        DclInfo {
            usage: DclUsage::from_raw((usage_token & 0x1F) as u8),
            usage_index: ((usage_token >> 16) & 0xF) as u8,
            texture: None,
        }
    };

    Ok(DecodedInstruction {
        token_index,
        opcode: Opcode::Dcl,
        control: 0,
        dst: Some(dst),
        srcs: Vec::new(),
        dcl: Some(dcl),
        def_data: None,
    })
}

fn decode_def(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
    opcode: Opcode,
    token_index: usize,
) -> Result<DecodedInstruction, DecodeError> {
    let dst = decode_dst(reader, version)?;
    let mut data = [0u32; 4];
    for word in &mut data {
        *word = reader.next()?;
    }
    Ok(DecodedInstruction {
        token_index,
        opcode,
        control: 0,
        dst: Some(dst),
        srcs: Vec::new(),
        dcl: None,
        def_data: Some(data),
    })
}

fn decode_defb(
    reader: &mut TokenReader<'_>,
    version: &ShaderVersion,
    token_index: usize,
) -> Result<DecodedInstruction, DecodeError> {
    let dst = decode_dst(reader, version)?;
    let value = reader.next()?;
    Ok(DecodedInstruction {
        token_index,
        opcode: Opcode::DefB,
        control: 0,
        dst: Some(dst),
        srcs: Vec::new(),
        dcl: None,
        def_data: Some([value; 4]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VS_2_0: u32 = 0xFFFE_0200;
    const PS_2_0: u32 = 0xFFFF_0200;

    fn dst_token(file: u32, index: u32, mask: u32) -> u32 {
        0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (mask << 16) | index
    }

    fn src_token(file: u32, index: u32, swizzle: u32) -> u32 {
        0x8000_0000 | ((file & 7) << 28) | (((file >> 3) & 3) << 11) | (swizzle << 16) | index
    }

    #[test]
    fn decodes_simple_vertex_shader() {
        // vs_2_0: mov oPos, v0
        let tokens = [
            VS_2_0,
            0x0200_0001, // mov, 2 params
            dst_token(4, 0, 0xF),
            src_token(1, 0, 0xE4),
            END_TOKEN,
        ];
        let decoded = decode_tokens(&tokens).unwrap();
        assert_eq!(decoded.version.stage, ShaderStage::Vertex);
        assert_eq!(decoded.version.major, 2);
        assert_eq!(decoded.instructions.len(), 1);

        let mov = &decoded.instructions[0];
        assert_eq!(mov.opcode, Opcode::Mov);
        let dst = mov.dst.unwrap();
        assert_eq!(dst.reg.file, RegisterFile::RastOut);
        assert!(dst.mask.is_full());
        assert_eq!(mov.srcs[0].reg.file, RegisterFile::Input);
        assert!(mov.srcs[0].swizzle.is_identity());
    }

    #[test]
    fn register_type_is_stage_dependent() {
        // Type 8 is `o#` for vertex shaders and `oC#` for pixel shaders.
        let vs = decode_tokens(&[
            0xFFFE_0300,
            0x0200_0001,
            dst_token(8, 0, 0xF),
            src_token(1, 0, 0xE4),
            END_TOKEN,
        ])
        .unwrap();
        assert_eq!(vs.instructions[0].dst.unwrap().reg.file, RegisterFile::Output);

        let ps = decode_tokens(&[
            PS_2_0,
            0x0200_0001,
            dst_token(8, 0, 0xF),
            src_token(0, 0, 0xE4),
            END_TOKEN,
        ])
        .unwrap();
        assert_eq!(
            ps.instructions[0].dst.unwrap().reg.file,
            RegisterFile::ColorOut
        );
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let tokens = [VS_2_0, 0x0200_0001, dst_token(4, 0, 0xF)];
        let err = decode_tokens(&tokens).unwrap_err();
        assert_eq!(err.token_index, 3);
    }

    #[test]
    fn unknown_opcode_is_skipped_via_param_count() {
        let tokens = [
            VS_2_0,
            0x0200_0063, // opcode 0x63 does not exist; 2 params
            0xDEAD_BEEF,
            0xDEAD_BEEF,
            0x0200_0001,
            dst_token(4, 0, 0xF),
            src_token(1, 0, 0xE4),
            END_TOKEN,
        ];
        let decoded = decode_tokens(&tokens).unwrap();
        assert_eq!(decoded.instructions.len(), 1);
        assert_eq!(decoded.instructions[0].opcode, Opcode::Mov);
    }

    #[test]
    fn def_carries_four_words() {
        let tokens = [
            PS_2_0,
            0x0500_0051, // def, 5 params
            dst_token(2, 7, 0xF),
            1.0f32.to_bits(),
            0.5f32.to_bits(),
            0.25f32.to_bits(),
            2.0f32.to_bits(),
            END_TOKEN,
        ];
        let decoded = decode_tokens(&tokens).unwrap();
        let def = &decoded.instructions[0];
        assert_eq!(def.opcode, Opcode::Def);
        assert_eq!(def.dst.unwrap().reg.index, 7);
        assert_eq!(def.def_data.unwrap()[1], 0.5f32.to_bits());
    }

    #[test]
    fn swizzle_helpers() {
        assert!(Swizzle(0xE4).is_identity());
        assert_eq!(Swizzle(0xFF).uniform_selector(), Some(3)); // .wwww
        assert_eq!(Swizzle(0x00).uniform_selector(), Some(0)); // .xxxx
        assert_eq!(Swizzle(0xE4).uniform_selector(), None);
        let s = Swizzle(0x1B); // .wzyx
        assert_eq!(
            (0..4).map(|c| s.selector(c)).collect::<Vec<_>>(),
            vec![3, 2, 1, 0]
        );
    }

    #[test]
    fn unsupported_shader_model_is_rejected() {
        let err = decode_tokens(&[0xFFFE_0400, END_TOKEN]).unwrap_err();
        assert!(err.message.contains("unsupported shader model"));
    }
}
