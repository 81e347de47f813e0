//! Centralized limits for D3D9 shader decoding.
//!
//! Guest-provided shader bytecode is untrusted input. These limits bound memory usage and prevent
//! pathological blobs from triggering large allocations during decoding and lowering.

/// Maximum accepted D3D9 shader bytecode length in bytes.
///
/// The decoder allocates a temporary `Vec<u32>` sized to the incoming bytecode. Real-world SM1-SM3
/// shaders are a few KiB at most.
pub(crate) const MAX_SHADER_BYTECODE_BYTES: usize = 256 * 1024; // 256 KiB

/// Maximum accepted D3D9 shader token count (DWORDs / `u32`s).
pub(crate) const MAX_SHADER_TOKEN_COUNT: usize = MAX_SHADER_BYTECODE_BYTES / 4;

/// Maximum tolerated register index for any register file (r#/c#/v#/t#/etc).
///
/// The token encoding can represent indices up to 2047, but only 256 float constant registers (and
/// far fewer of everything else) exist in any supported shader model. Capping early keeps hostile
/// inputs from inflating the emitted module.
pub(crate) const MAX_SHADER_REGISTER_INDEX: u32 = 255;

/// Maximum `if`/`ifc` nesting depth accepted by the lowering engine.
pub(crate) const MAX_CONTROL_FLOW_NESTING: usize = 16;
