//! Mapping FVF codes and `D3DVERTEXELEMENT9` declarations to pipeline vertex
//! input layouts.
//!
//! FVF layouts are positional: attributes appear in the fixed FVF order and
//! take sequential locations, which is also the order the fixed-function
//! shaders declare their inputs. Declaration layouts are matched to the bound
//! vertex shader by usage, the way the runtime pairs `D3DDECLUSAGE_*` with
//! the shader's `dcl` statements.

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::sm::model::ShaderInputAttribute;
use crate::vertex::Fvf;

pub use crate::sm::decode::DclUsage as DeclaredUsage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("vertex declaration error at byte {offset}: {message}")]
pub struct DeclarationError {
    pub offset: usize,
    pub message: String,
}

/// `D3DDECLTYPE`, the subset with a direct Vulkan format equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    /// BGRA bytes, expanded to a normalized vec4 by the input assembler.
    D3dColor,
    UByte4,
    Short2,
    Short4,
}

impl VertexFormat {
    fn from_decl_type(value: u8, offset: usize) -> Result<Self, DeclarationError> {
        Ok(match value {
            0 => Self::Float1,
            1 => Self::Float2,
            2 => Self::Float3,
            3 => Self::Float4,
            4 => Self::D3dColor,
            5 => Self::UByte4,
            6 => Self::Short2,
            7 => Self::Short4,
            other => {
                return Err(DeclarationError {
                    offset,
                    message: format!("unsupported declaration type {other}"),
                })
            }
        })
    }

    pub fn byte_size(&self) -> u32 {
        match self {
            Self::Float1 => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
            Self::D3dColor | Self::UByte4 | Self::Short2 => 4,
            Self::Short4 => 8,
        }
    }
}

/// One attribute of the pipeline's vertex input state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub offset: u32,
    pub format: VertexFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// One parsed `D3DVERTEXELEMENT9`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexElement {
    pub stream: u16,
    pub offset: u16,
    pub format: VertexFormat,
    pub usage: DeclaredUsage,
    pub usage_index: u8,
}

/// A parsed vertex declaration plus a content fingerprint for pipeline keys.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexDeclaration {
    pub elements: Vec<VertexElement>,
    pub fingerprint: u64,
}

impl VertexDeclaration {
    /// Stride of stream 0, from the furthest element extent.
    pub fn stride(&self) -> u32 {
        self.elements
            .iter()
            .filter(|element| element.stream == 0)
            .map(|element| element.offset as u32 + element.format.byte_size())
            .max()
            .unwrap_or(0)
    }
}

const END_MARKER_STREAM: u16 = 0xFF;
const DECL_TYPE_UNUSED: u8 = 17;

/// Parse a `D3DVERTEXELEMENT9` array, terminated by `D3DDECL_END()`.
pub fn parse_declaration(bytes: &[u8]) -> Result<VertexDeclaration, DeclarationError> {
    let mut elements = Vec::new();
    let mut offset = 0;
    loop {
        let record = bytes.get(offset..offset + 8).ok_or_else(|| DeclarationError {
            offset,
            message: "declaration missing end marker".to_owned(),
        })?;
        let stream = u16::from_le_bytes([record[0], record[1]]);
        if stream == END_MARKER_STREAM {
            break;
        }
        let element_offset = u16::from_le_bytes([record[2], record[3]]);
        let decl_type = record[4];
        if decl_type == DECL_TYPE_UNUSED {
            offset += 8;
            continue;
        }
        elements.push(VertexElement {
            stream,
            offset: element_offset,
            format: VertexFormat::from_decl_type(decl_type, offset)?,
            usage: DeclaredUsage::from_raw(record[6]),
            usage_index: record[7],
        });
        offset += 8;
    }
    Ok(VertexDeclaration {
        elements,
        fingerprint: xxh3_64(&bytes[..offset + 8]),
    })
}

/// Attribute layout implied by an FVF code: position, normal, point size,
/// diffuse, specular, then texture coordinates, packed back to back with
/// sequential locations.
pub fn layout_from_fvf(fvf: Fvf) -> VertexLayout {
    let mut attributes = Vec::new();
    let mut offset = 0;
    let mut location = 0;
    let mut push = |format: VertexFormat, offset: &mut u32, location: &mut u32| {
        attributes.push(VertexAttribute {
            location: *location,
            offset: *offset,
            format,
        });
        *offset += format.byte_size();
        *location += 1;
    };

    if fvf.has_position() {
        let format = if fvf.is_transformed() {
            VertexFormat::Float4
        } else {
            VertexFormat::Float3
        };
        push(format, &mut offset, &mut location);
    }
    if fvf.contains(Fvf::NORMAL) {
        push(VertexFormat::Float3, &mut offset, &mut location);
    }
    if fvf.contains(Fvf::PSIZE) {
        push(VertexFormat::Float1, &mut offset, &mut location);
    }
    if fvf.contains(Fvf::DIFFUSE) {
        push(VertexFormat::D3dColor, &mut offset, &mut location);
    }
    if fvf.contains(Fvf::SPECULAR) {
        push(VertexFormat::D3dColor, &mut offset, &mut location);
    }
    for _ in 0..fvf.texture_count() {
        push(VertexFormat::Float2, &mut offset, &mut location);
    }

    VertexLayout {
        stride: offset,
        attributes,
    }
}

/// Pair a declaration's elements with a shader's input attributes by usage.
///
/// Every shader input must find a declaration element; a shader reading an
/// attribute the declaration does not supply is an error, not a zero-filled
/// input.
pub fn layout_from_declaration(
    declaration: &VertexDeclaration,
    shader_inputs: &[ShaderInputAttribute],
) -> Result<VertexLayout, DeclarationError> {
    let mut attributes = Vec::with_capacity(shader_inputs.len());
    for input in shader_inputs {
        let element = match input.usage {
            Some(info) => declaration.elements.iter().find(|element| {
                element.usage == info.usage && element.usage_index == info.usage_index
            }),
            // Undeclared inputs pair positionally.
            None => declaration.elements.get(input.register as usize),
        };
        let element = element.ok_or_else(|| DeclarationError {
            offset: 0,
            message: format!(
                "no declaration element for shader input v{} ({:?})",
                input.register,
                input.usage.map(|u| u.usage)
            ),
        })?;
        attributes.push(VertexAttribute {
            location: input.location,
            offset: element.offset as u32,
            format: element.format,
        });
    }
    Ok(VertexLayout {
        stride: declaration.stride(),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::model::DclUsageInfo;
    use pretty_assertions::assert_eq;

    fn element_bytes(stream: u16, offset: u16, decl_type: u8, usage: u8, index: u8) -> [u8; 8] {
        let s = stream.to_le_bytes();
        let o = offset.to_le_bytes();
        [s[0], s[1], o[0], o[1], decl_type, 0, usage, index]
    }

    fn end_marker() -> [u8; 8] {
        element_bytes(0xFF, 0, DECL_TYPE_UNUSED, 0, 0)
    }

    #[test]
    fn fvf_layout_is_packed_in_order() {
        // XYZ | NORMAL | DIFFUSE | TEX1
        let fvf = Fvf::from_bits_retain(0x0002 | 0x0010 | 0x0040 | 0x0100);
        let layout = layout_from_fvf(fvf);
        assert_eq!(layout.stride, 12 + 12 + 4 + 8);
        assert_eq!(layout.attributes.len(), 4);
        assert_eq!(layout.attributes[0].format, VertexFormat::Float3);
        assert_eq!(layout.attributes[2].offset, 24);
        assert_eq!(layout.attributes[2].format, VertexFormat::D3dColor);
        assert_eq!(layout.attributes[3].format, VertexFormat::Float2);
        // Locations are sequential.
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2, 3]);
    }

    #[test]
    fn transformed_position_is_four_floats() {
        let layout = layout_from_fvf(Fvf::from_bits_retain(0x0004));
        assert_eq!(layout.attributes[0].format, VertexFormat::Float4);
        assert_eq!(layout.stride, 16);
    }

    #[test]
    fn declaration_parses_until_end_marker() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&element_bytes(0, 0, 2, 0, 0)); // position, float3
        bytes.extend_from_slice(&element_bytes(0, 12, 4, 10, 0)); // color0, d3dcolor
        bytes.extend_from_slice(&end_marker());
        let declaration = parse_declaration(&bytes).unwrap();
        assert_eq!(declaration.elements.len(), 2);
        assert_eq!(declaration.stride(), 16);
        assert_eq!(declaration.elements[1].usage, DeclaredUsage::Color);

        // Byte-identical declarations fingerprint identically.
        let again = parse_declaration(&bytes).unwrap();
        assert_eq!(declaration.fingerprint, again.fingerprint);
    }

    #[test]
    fn declaration_without_end_marker_is_an_error() {
        let bytes = element_bytes(0, 0, 2, 0, 0);
        let err = parse_declaration(&bytes).unwrap_err();
        assert!(err.message.contains("end marker"));
    }

    #[test]
    fn shader_inputs_pair_with_elements_by_usage() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&element_bytes(0, 0, 2, 0, 0)); // position
        bytes.extend_from_slice(&element_bytes(0, 12, 1, 5, 0)); // texcoord0, float2
        bytes.extend_from_slice(&end_marker());
        let declaration = parse_declaration(&bytes).unwrap();

        // Shader declares texcoord in v1 and position in v0, reversed from
        // how a positional pairing would land.
        let inputs = [
            ShaderInputAttribute {
                register: 0,
                location: 0,
                usage: Some(DclUsageInfo {
                    usage: DeclaredUsage::TexCoord,
                    usage_index: 0,
                }),
            },
            ShaderInputAttribute {
                register: 1,
                location: 1,
                usage: Some(DclUsageInfo {
                    usage: DeclaredUsage::Position,
                    usage_index: 0,
                }),
            },
        ];
        let layout = layout_from_declaration(&declaration, &inputs).unwrap();
        assert_eq!(layout.attributes[0].offset, 12);
        assert_eq!(layout.attributes[1].offset, 0);

        // A shader input the declaration does not supply fails the build.
        let missing = [ShaderInputAttribute {
            register: 0,
            location: 0,
            usage: Some(DclUsageInfo {
                usage: DeclaredUsage::Normal,
                usage_index: 0,
            }),
        }];
        assert!(layout_from_declaration(&declaration, &missing).is_err());
    }
}
