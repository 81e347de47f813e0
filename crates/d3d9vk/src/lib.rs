//! D3D9 compatibility core: legacy shader translation and draw-state caching.
//!
//! The crate has two halves:
//!
//! - [`sm`] decodes vs/ps 1.x-3.x token streams and lowers them to SPIR-V
//!   binary modules, word by word, with no external assembler.
//! - [`runtime`] owns the draw path: linear-scan pipeline and sampler caches,
//!   fixed-function fallback shaders, descriptor/push-constant plumbing and
//!   timestamp-based eviction after present. GPU object creation goes through
//!   the [`runtime::GpuDriver`] trait so the whole path is testable without a
//!   live device.

pub mod fixed_function;
pub mod runtime;
pub mod shader_limits;
pub mod sm;
pub mod spirv;
pub mod state;
pub mod vertex;

pub use runtime::{DeviceState, GpuDriver, RenderManager, RuntimeError};
pub use sm::translate::{translate, ShaderCache, TranslateError, TranslatedShader};
pub use sm::types::{ShaderStage, ShaderVersion};
pub use state::PrimitiveType;
pub use vertex::Fvf;
