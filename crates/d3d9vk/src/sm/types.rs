#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderVersion {
    pub stage: ShaderStage,
    pub major: u8,
    pub minor: u8,
}

impl ShaderVersion {
    pub fn is_sm1(&self) -> bool {
        self.major == 1
    }

    pub fn is_sm3(&self) -> bool {
        self.major == 3
    }

    /// ps_1_4 changed several instruction encodings (notably `texld`) without
    /// bumping the major version.
    pub fn is_ps_1_4(&self) -> bool {
        self.stage == ShaderStage::Pixel && self.major == 1 && self.minor == 4
    }
}

impl std::fmt::Display for ShaderVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self.stage {
            ShaderStage::Vertex => "vs",
            ShaderStage::Pixel => "ps",
        };
        write!(f, "{}_{}_{}", stage, self.major, self.minor)
    }
}
