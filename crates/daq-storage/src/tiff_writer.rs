//! TIFF persistence for per-mode frame stacks.
//!
//! A run's frames are written one stack per mode into the save directory.
//! The `image` crate encodes single pages only, so a stack of `n > 1` frames
//! becomes a numbered series:
//!
//! ```text
//! excitation_a_20240131_142501_0000.tiff
//! excitation_a_20240131_142501_0001.tiff
//! ...
//! unlit_20240131_142501.tiff          (single frame)
//! metadata_20240131_142503.txt
//! ```
//!
//! 8-bit frames are written as 8-bit grayscale, everything deeper as 16-bit
//! grayscale.

use anyhow::{anyhow, bail, Context, Result};
use daq_core::capabilities::{FrameSink, SaveReport};
use daq_core::data::Frame;
use daq_core::mode::Mode;
use image::{GrayImage, ImageBuffer, ImageFormat, Luma};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// File-name timestamp, local time, second resolution.
fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Single-frame and stack encoding.
pub struct TiffWriter;

impl TiffWriter {
    /// Encode one frame to `path`, creating or truncating the file.
    pub fn write_frame<P: AsRef<Path>>(frame: &Frame, path: P) -> Result<()> {
        let path = path.as_ref();
        if frame.data.len() != frame.expected_len() {
            bail!(
                "Frame data size mismatch: {}x{} {}-bit needs {} bytes, got {}",
                frame.width,
                frame.height,
                frame.bit_depth,
                frame.expected_len(),
                frame.data.len()
            );
        }

        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut writer = BufWriter::new(file);
        let encoded = if frame.bit_depth <= 8 {
            let img: GrayImage = ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(|| anyhow!("Frame does not fit an 8-bit image buffer"))?;
            img.write_to(&mut writer, ImageFormat::Tiff)
        } else {
            let pixels = frame
                .to_u16_pixels()
                .ok_or_else(|| anyhow!("Frame data is not 16-bit aligned"))?;
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(frame.width, frame.height, pixels)
                    .ok_or_else(|| anyhow!("Frame does not fit a 16-bit image buffer"))?;
            img.write_to(&mut writer, ImageFormat::Tiff)
        };
        encoded.with_context(|| format!("Failed to encode TIFF to {:?}", path))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", path))?;

        tracing::debug!(
            path = ?path,
            dimensions = format!("{}x{}", frame.width, frame.height),
            bit_depth = frame.bit_depth,
            "Wrote TIFF"
        );
        Ok(())
    }

    /// Write `frames` as a stack based on `path`; returns every file written.
    ///
    /// All frames must share dimensions and bit depth. If a page fails, the
    /// pages already written for this stack are removed again.
    pub fn write_stack<P: AsRef<Path>>(frames: &[Frame], path: P) -> Result<Vec<PathBuf>> {
        let path = path.as_ref();
        let Some(first) = frames.first() else {
            bail!("Cannot write empty frame stack");
        };
        if let Some((i, odd)) = frames.iter().enumerate().find(|(_, f)| {
            (f.width, f.height, f.bit_depth) != (first.width, first.height, first.bit_depth)
        }) {
            bail!(
                "Frame {} is {}x{} {}-bit, stack is {}x{} {}-bit",
                i,
                odd.width,
                odd.height,
                odd.bit_depth,
                first.width,
                first.height,
                first.bit_depth
            );
        }

        if frames.len() == 1 {
            Self::write_frame(first, path)?;
            return Ok(vec![path.to_path_buf()]);
        }

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("stack");
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("tiff");
        let mut written = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            let page = path.with_file_name(format!("{stem}_{i:04}.{extension}"));
            if let Err(e) = Self::write_frame(frame, &page) {
                written.push(page);
                remove_pages(&written);
                return Err(e).with_context(|| format!("Failed to write frame {} of {:?}", i, path));
            }
            written.push(page);
        }
        Ok(written)
    }
}

/// Best-effort removal of a partially written stack.
fn remove_pages(pages: &[PathBuf]) {
    for page in pages {
        match std::fs::remove_file(page) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = ?page, error = %e, "Could not remove partial stack page"),
        }
    }
}

/// [`FrameSink`] writing per-mode TIFF stacks and a metadata text file.
#[derive(Debug, Clone)]
pub struct TiffStackWriter {
    dir: PathBuf,
}

impl TiffStackWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create save directory {:?}", self.dir))
    }
}

impl FrameSink for TiffStackWriter {
    fn save_stacks(&self, stacks: &BTreeMap<Mode, Vec<Frame>>) -> Result<SaveReport> {
        if stacks.is_empty() {
            bail!("No stacks provided to save");
        }
        self.ensure_dir()?;

        let stamp = timestamp();
        let mut report = SaveReport::default();
        for (&mode, frames) in stacks {
            if frames.is_empty() {
                tracing::warn!(mode = %mode, "No frames to save for mode");
                report.skipped.push(mode);
                continue;
            }

            let path = self.dir.join(format!("{mode}_{stamp}.tiff"));
            // One mode failing must not stop the others
            match TiffWriter::write_stack(frames, &path) {
                Ok(files) => {
                    tracing::info!(
                        mode = %mode,
                        frames = frames.len(),
                        path = ?path,
                        "Saved mode stack"
                    );
                    report.written.extend(files);
                }
                Err(e) => {
                    tracing::error!(mode = %mode, error = %format!("{e:#}"), "Failed to save mode stack");
                    report.failed.push((mode, format!("{e:#}")));
                }
            }
        }
        Ok(report)
    }

    fn save_metadata(&self, metadata: &BTreeMap<String, String>) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.dir.join(format!("metadata_{}.txt", timestamp()));
        let body: String = metadata
            .iter()
            .map(|(key, value)| format!("{key}: {value}\n"))
            .collect();
        std::fs::write(&path, body).with_context(|| format!("Failed to write {:?}", path))?;
        tracing::info!(path = ?path, entries = metadata.len(), "Saved run metadata");
        Ok(path)
    }
}
