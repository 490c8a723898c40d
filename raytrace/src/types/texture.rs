//! Texture types and descriptors.

/// Pixel formats a shadow render target can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderTargetFormat {
    Ru8,
    RGu8,
    RGBAu8,
    Rf16,
    RGf16,
    RGBAf16,
    #[default]
    Rf32,
    RGf32,
    RGBAf32,
}

impl RenderTargetFormat {
    /// Number of channels per texel.
    pub fn channels(self) -> u32 {
        match self {
            Self::Ru8 | Self::Rf16 | Self::Rf32 => 1,
            Self::RGu8 | Self::RGf16 | Self::RGf32 => 2,
            Self::RGBAu8 | Self::RGBAf16 | Self::RGBAf32 => 4,
        }
    }

    /// Size in bytes of one channel.
    pub fn channel_size(self) -> u32 {
        match self {
            Self::Ru8 | Self::RGu8 | Self::RGBAu8 => 1,
            Self::Rf16 | Self::RGf16 | Self::RGBAf16 => 2,
            Self::Rf32 | Self::RGf32 | Self::RGBAf32 => 4,
        }
    }

    /// Size in bytes of one texel.
    pub fn bytes_per_pixel(self) -> u32 {
        self.channels() * self.channel_size()
    }

    /// Encodes one channel value into the format's little-endian byte layout.
    pub fn encode_channel(self, value: f32, out: &mut Vec<u8>) {
        match self.channel_size() {
            1 => out.push((value.clamp(0.0, 1.0) * 255.0).round() as u8),
            2 => out.extend_from_slice(&half::f16::from_f32(value).to_le_bytes()),
            _ => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Decodes one channel value from the format's little-endian byte layout.
    pub fn decode_channel(self, bytes: &[u8]) -> f32 {
        match self.channel_size() {
            1 => bytes[0] as f32 / 255.0,
            2 => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            _ => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Descriptor for creating a storage texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: RenderTargetFormat,
}

impl TextureDescriptor {
    pub fn new(width: u32, height: u32, format: RenderTargetFormat) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Size in bytes of the tightly packed texel data.
    pub fn data_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

/// Access state a texture is in between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Readable by copies and shaders, shareable with the host.
    #[default]
    Common,
    /// Read/write access from ray programs.
    UnorderedAccess,
}
