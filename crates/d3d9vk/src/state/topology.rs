//! D3D9 primitive topologies and the primitive-count arithmetic around them.
//!
//! D3D9 draw calls take a primitive count; Vulkan takes a vertex count. The
//! conversion depends on the topology, as does whether fixed-function depth
//! bias applies at all.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveType {
    /// From a `D3DPRIMITIVETYPE` value.
    pub fn from_d3d(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::PointList,
            2 => Self::LineList,
            3 => Self::LineStrip,
            4 => Self::TriangleList,
            5 => Self::TriangleStrip,
            6 => Self::TriangleFan,
            _ => return None,
        })
    }

    /// Vertices consumed by `primitive_count` primitives.
    pub fn vertex_count(&self, primitive_count: u32) -> u32 {
        if primitive_count == 0 {
            return 0;
        }
        match self {
            Self::PointList => primitive_count,
            Self::LineList => primitive_count * 2,
            Self::LineStrip => primitive_count + 1,
            Self::TriangleList => primitive_count * 3,
            Self::TriangleStrip | Self::TriangleFan => primitive_count + 2,
        }
    }

    /// Depth bias and face culling only make sense for filled primitives.
    pub fn is_triangle(&self) -> bool {
        matches!(
            self,
            Self::TriangleList | Self::TriangleStrip | Self::TriangleFan
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn vertex_counts_per_topology() {
        assert_eq!(PrimitiveType::PointList.vertex_count(5), 5);
        assert_eq!(PrimitiveType::LineList.vertex_count(5), 10);
        assert_eq!(PrimitiveType::LineStrip.vertex_count(5), 6);
        assert_eq!(PrimitiveType::TriangleList.vertex_count(5), 15);
        assert_eq!(PrimitiveType::TriangleStrip.vertex_count(5), 7);
        assert_eq!(PrimitiveType::TriangleFan.vertex_count(5), 7);
    }

    #[test]
    fn zero_primitives_draw_nothing() {
        assert_eq!(PrimitiveType::LineStrip.vertex_count(0), 0);
        assert_eq!(PrimitiveType::TriangleStrip.vertex_count(0), 0);
    }

    #[test]
    fn d3d_values_round_trip() {
        for value in 1..=6 {
            assert!(PrimitiveType::from_d3d(value).is_some());
        }
        assert_eq!(PrimitiveType::from_d3d(0), None);
        assert_eq!(PrimitiveType::from_d3d(7), None);
        assert_eq!(PrimitiveType::from_d3d(4), Some(PrimitiveType::TriangleList));
    }
}
