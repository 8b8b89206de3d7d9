//! Image payloads delivered by the camera collaborator.

/// Represents a single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`).
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, Little Endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (e.g., 8, 12, 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,

    /// Hardware frame counter, when the camera reports one.
    ///
    /// Used only to detect dropped or duplicated frames; mode assignment never
    /// depends on it.
    pub frame_number: Option<u64>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    ///
    /// Copies the data into a byte vector.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
            frame_number: None,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
            frame_number: None,
        }
    }

    /// Attach a hardware frame counter.
    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = Some(frame_number);
        self
    }

    /// Number of bytes a well-formed frame of this geometry occupies.
    pub fn expected_len(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        if self.bit_depth > 8 {
            pixels * 2
        } else {
            pixels
        }
    }

    /// Get pixel value at (x, y) as u32 (handling bit depth conversion).
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = (y * self.width + x) as usize;

        match self.bit_depth {
            8 => self.data.get(idx).map(|&v| v as u32),
            12 | 16 => {
                let bytes = self.data.get(idx * 2..idx * 2 + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)
            }
            _ => None,
        }
    }

    /// Decode 12/16-bit pixel data into native `u16` values.
    ///
    /// Returns `None` for 8-bit frames or an odd byte count.
    pub fn to_u16_pixels(&self) -> Option<Vec<u16>> {
        if self.bit_depth <= 8 || self.data.len() % 2 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
                .collect(),
        )
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        match self.bit_depth {
            8 => {
                if self.data.is_empty() {
                    return 0.0;
                }
                let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
                sum as f64 / self.data.len() as f64
            }
            12 | 16 => {
                let pixels = self.to_u16_pixels().unwrap_or_default();
                if pixels.is_empty() {
                    return 0.0;
                }
                let sum: u64 = pixels.iter().map(|&v| v as u64).sum();
                sum as f64 / pixels.len() as f64
            }
            _ => 0.0,
        }
    }
}
