//! Synthetic tissue images for mock camera frames.
//!
//! Frames taken without illumination look like a dim bioluminescence
//! image: low background with a few glowing spots. Frames taken while an
//! illumination line is high look like a fluorescence image whose
//! brightness and texture depend on which line was lit, so stacks for
//! different modes are distinguishable at a glance.

/// glibc-style LCG, reproducible across platforms.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Dark level of the sensor in counts.
pub const DARK_LEVEL: u16 = 100;

/// Mean background for an illumination mask.
///
/// `0` is the unlit level; otherwise the lowest set line picks the level.
pub fn background_level(illumination_mask: u32) -> u16 {
    match illumination_mask {
        0 => 400,
        mask => match mask.trailing_zeros() {
            0 | 1 => 12_000,
            2 => 20_000,
            _ => 28_000,
        },
    }
}

/// Generate a `width * height` 16-bit frame.
///
/// Pixel noise depends on `frame_num`, the spatial structure only on the
/// illumination mask.
pub fn tissue_pattern(width: u32, height: u32, frame_num: u64, illumination_mask: u32) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];
    if w == 0 || h == 0 {
        return buffer;
    }

    let base = f64::from(background_level(illumination_mask));
    // Texture wavelength differs per line so channels do not look alike
    let wavelength = 6.0 + f64::from(illumination_mask.count_ones() * 3 + illumination_mask.trailing_zeros());
    let frame_seed = frame_num.wrapping_mul(2654435761);
    let spots = glow_spots(w, h);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let mut value = if illumination_mask == 0 {
                base + spot_intensity(&spots, x, y)
            } else {
                let texture = ((x as f64 / wavelength).sin() * (y as f64 / wavelength).cos() + 1.0) / 2.0;
                base * (0.6 + 0.4 * texture)
            };
            let noise = (prng(frame_seed ^ idx as u64) & 0xFF) as f64 - 128.0;
            value += noise;
            buffer[idx] = value.clamp(f64::from(DARK_LEVEL), f64::from(u16::MAX)) as u16;
        }
    }
    buffer
}

/// Three fixed spots placed relative to the frame size.
fn glow_spots(w: usize, h: usize) -> [(f64, f64, f64); 3] {
    let sigma = (w.min(h) as f64 / 12.0).max(1.0);
    [
        (w as f64 * 0.3, h as f64 * 0.35, sigma),
        (w as f64 * 0.65, h as f64 * 0.6, sigma * 1.5),
        (w as f64 * 0.5, h as f64 * 0.8, sigma * 0.7),
    ]
}

fn spot_intensity(spots: &[(f64, f64, f64)], x: usize, y: usize) -> f64 {
    spots
        .iter()
        .map(|&(cx, cy, sigma)| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            3_000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
        .sum()
}
