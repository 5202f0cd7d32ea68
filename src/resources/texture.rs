//! CPU-side texture data

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Decoded RGBA8 pixels ready for upload
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Wrap decoded pixels, checking that the byte count matches the size.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>, name: &str) -> RenderResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(RenderError::InvalidArgument(format!(
                "texture '{name}' is {width}x{height} but has {} bytes (expected {expected})",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format: vk::Format::R8G8B8A8_SRGB,
            data,
            name: name.to_string(),
        })
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: vk::Format::R8G8B8A8_SRGB,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture with 8x8 cells
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            width: size,
            height: size,
            format: vk::Format::R8G8B8A8_SRGB,
            data,
            name: "checkerboard".to_string(),
        }
    }

    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_size() {
        let err = TextureData::from_rgba8(2, 2, vec![0; 15], "bad").unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));
        assert!(TextureData::from_rgba8(2, 2, vec![0; 16], "ok").is_ok());
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let tex = TextureData::checkerboard(16, [255; 4], [0, 0, 0, 255]);
        assert_eq!(tex.data.len(), 16 * 16 * 4);
        assert_eq!(&tex.data[0..4], &[255; 4]);
        let second_cell = 8 * 4;
        assert_eq!(&tex.data[second_cell..second_cell + 4], &[0, 0, 0, 255]);
    }
}
