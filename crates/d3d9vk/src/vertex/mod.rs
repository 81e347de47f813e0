//! Vertex formats: FVF codes and programmable vertex declarations.

pub mod format_map;

use bitflags::bitflags;

pub use format_map::{
    layout_from_declaration, layout_from_fvf, parse_declaration, DeclarationError, DeclaredUsage,
    VertexAttribute, VertexDeclaration, VertexElement, VertexFormat, VertexLayout,
};

bitflags! {
    /// `D3DFVF` flexible vertex format code.
    ///
    /// Not a pure bitmask: the texture coordinate count is a 4-bit field at
    /// bits 8..11, so unknown bits are retained and read through
    /// [`Fvf::texture_count`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Fvf: u32 {
        const XYZ = 0x0002;
        const XYZRHW = 0x0004;
        const NORMAL = 0x0010;
        const PSIZE = 0x0020;
        const DIFFUSE = 0x0040;
        const SPECULAR = 0x0080;
        const _ = !0;
    }
}

impl Fvf {
    pub fn has_position(&self) -> bool {
        self.intersects(Fvf::XYZ | Fvf::XYZRHW)
    }

    /// Pre-transformed vertices (`D3DFVF_XYZRHW`): the position is already in
    /// screen space and the vertex pipeline must not transform it again.
    pub fn is_transformed(&self) -> bool {
        self.contains(Fvf::XYZRHW)
    }

    pub fn texture_count(&self) -> u32 {
        (self.bits() >> 8) & 0xF
    }
}
