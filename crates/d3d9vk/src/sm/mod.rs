//! Shader Model 1.x-3.x (D3D9) bytecode decoding and SPIR-V lowering.

pub mod decode;
pub mod lower;
pub mod model;
pub mod translate;
pub mod types;

pub use decode::{decode_tokens, decode_u8_le_bytes, DecodedShader};
pub use translate::{translate, TranslateError, TranslatedShader};
pub use types::{ShaderStage, ShaderVersion};
