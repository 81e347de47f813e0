//! Device state blocks: the D3D9 render and sampler state the pipeline and
//! sampler caches fingerprint.
//!
//! Only the states that actually feed pipeline or sampler creation live here;
//! the rest of the D3D9 state vector never makes it past the API layer.

pub mod topology;

pub use topology::PrimitiveType;

/// `D3DTEXTUREFILTERTYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    #[default]
    None,
    Point,
    Linear,
    Anisotropic,
}

impl TextureFilter {
    pub fn from_d3d(value: u32) -> Self {
        match value {
            1 => Self::Point,
            2 => Self::Linear,
            3 => Self::Anisotropic,
            _ => Self::None,
        }
    }
}

/// `D3DTEXTUREADDRESS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureAddress {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
    MirrorOnce,
}

impl TextureAddress {
    pub fn from_d3d(value: u32) -> Self {
        match value {
            2 => Self::Mirror,
            3 => Self::Clamp,
            4 => Self::Border,
            5 => Self::MirrorOnce,
            _ => Self::Wrap,
        }
    }
}

/// `D3DCMPFUNC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    pub fn from_d3d(value: u32) -> Self {
        match value {
            1 => Self::Never,
            2 => Self::Less,
            3 => Self::Equal,
            4 => Self::LessEqual,
            5 => Self::Greater,
            6 => Self::NotEqual,
            7 => Self::GreaterEqual,
            _ => Self::Always,
        }
    }
}

/// `D3DCULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Clockwise,
    CounterClockwise,
}

impl CullMode {
    pub fn from_d3d(value: u32) -> Self {
        match value {
            2 => Self::Clockwise,
            3 => Self::CounterClockwise,
            _ => Self::None,
        }
    }
}

/// `D3DBLEND`, the subset games actually use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
}

impl BlendFactor {
    pub fn from_d3d(value: u32) -> Self {
        match value {
            1 => Self::Zero,
            3 => Self::SrcColor,
            4 => Self::InvSrcColor,
            5 => Self::SrcAlpha,
            6 => Self::InvSrcAlpha,
            7 => Self::DstAlpha,
            8 => Self::InvDstAlpha,
            9 => Self::DstColor,
            10 => Self::InvDstColor,
            _ => Self::One,
        }
    }
}

/// The render states that are baked into a graphics pipeline. Two draws with
/// equal blocks (and equal shaders, format and topology) can share a
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderStateBlock {
    pub z_enable: bool,
    pub z_write_enable: bool,
    pub z_func: CompareFunc,
    pub cull_mode: CullMode,
    pub alpha_blend_enable: bool,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
    pub alpha_test_enable: bool,
    pub alpha_func: CompareFunc,
    pub alpha_ref: u8,
    pub color_write_mask: u8,
    pub depth_bias: f32,
    pub slope_scale_depth_bias: f32,
}

impl Default for RenderStateBlock {
    /// D3D9 device defaults.
    fn default() -> Self {
        Self {
            z_enable: true,
            z_write_enable: true,
            z_func: CompareFunc::LessEqual,
            cull_mode: CullMode::CounterClockwise,
            alpha_blend_enable: false,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::Zero,
            alpha_test_enable: false,
            alpha_func: CompareFunc::Always,
            alpha_ref: 0,
            color_write_mask: 0xF,
            depth_bias: 0.0,
            slope_scale_depth_bias: 0.0,
        }
    }
}

/// Per-sampler filtering and addressing state, the full fingerprint of a
/// Vulkan sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerStateBlock {
    pub mag_filter: TextureFilter,
    pub min_filter: TextureFilter,
    pub mip_filter: TextureFilter,
    pub address_u: TextureAddress,
    pub address_v: TextureAddress,
    pub address_w: TextureAddress,
    pub max_anisotropy: u32,
    pub mip_lod_bias: f32,
    pub max_mip_level: u32,
}

impl Default for SamplerStateBlock {
    fn default() -> Self {
        Self {
            mag_filter: TextureFilter::Point,
            min_filter: TextureFilter::Point,
            mip_filter: TextureFilter::None,
            address_u: TextureAddress::Wrap,
            address_v: TextureAddress::Wrap,
            address_w: TextureAddress::Wrap,
            max_anisotropy: 1,
            mip_lod_bias: 0.0,
            max_mip_level: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_d3d_values_fall_back_to_safe_defaults() {
        assert_eq!(TextureFilter::from_d3d(99), TextureFilter::None);
        assert_eq!(TextureAddress::from_d3d(99), TextureAddress::Wrap);
        assert_eq!(CompareFunc::from_d3d(0), CompareFunc::Always);
        assert_eq!(CullMode::from_d3d(0), CullMode::None);
        assert_eq!(BlendFactor::from_d3d(2), BlendFactor::One);
    }

    #[test]
    fn equal_state_blocks_compare_equal() {
        let a = RenderStateBlock::default();
        let mut b = RenderStateBlock::default();
        assert_eq!(a, b);
        b.cull_mode = CullMode::Clockwise;
        assert_ne!(a, b);
    }
}
