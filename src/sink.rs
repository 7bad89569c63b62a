/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

use std::fs;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use log::{debug, info};

use crate::image::Frame;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Consumer of acquired frames.
pub trait FrameSink {
    /// Handle one frame captured while the swept parameter was `tagged_value`.
    fn process(&mut self, frame: &Frame<'_>, tagged_value: f64) -> Result<(), SinkError>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn process(&mut self, frame: &Frame<'_>, tagged_value: f64) -> Result<(), SinkError> {
        (**self).process(frame, tagged_value)
    }
}

/// Significant digits kept in file names.
const NAME_DIGITS: i32 = 12;

/// File name for a frame tagged with `tagged_value`.
///
/// The value is rounded to twelve significant digits first, so arithmetic
/// noise from fractional steps does not leak into the name.
///
/// ```
/// assert_eq!(exposweep::sink::file_name(500000.0), "500000.bmp");
/// assert_eq!(exposweep::sink::file_name(12.5), "12.5.bmp");
/// assert_eq!(exposweep::sink::file_name(0.1 * 3.0), "0.3.bmp");
/// ```
pub fn file_name(tagged_value: f64) -> String {
    format!("{}.bmp", round_significant(tagged_value))
}

fn round_significant(value: f64) -> f64 {
    if value == 0.0 {
        // no "-0.bmp"
        return 0.0;
    }
    if !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let shift = NAME_DIGITS - 1 - magnitude;
    if shift <= 0 {
        return value;
    }
    let scale = 10f64.powi(shift);
    (value * scale).round() / scale
}

/// Writes every frame as an RGB bitmap named after its tag.
///
/// Frames are stored at the resolution they were grabbed with, line padding
/// removed. Frames with a repeated tag overwrite the earlier file.
pub struct BmpSink {
    dir: PathBuf,
    written: u32,
}

impl BmpSink {
    /// Create a sink writing into `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| SinkError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        info!("saving frames to {}", dir.display());
        Ok(BmpSink { dir, written: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a frame tagged with `tagged_value` is written to.
    pub fn path_for(&self, tagged_value: f64) -> PathBuf {
        self.dir.join(file_name(tagged_value))
    }

    /// Number of files written so far
    pub fn written(&self) -> u32 {
        self.written
    }
}

impl FrameSink for BmpSink {
    fn process(&mut self, frame: &Frame<'_>, tagged_value: f64) -> Result<(), SinkError> {
        let path = self.path_for(tagged_value);
        frame
            .to_rgb8()
            .save_with_format(&path, ImageFormat::Bmp)
            .map_err(|source| SinkError::Write {
                path: path.clone(),
                source,
            })?;
        self.written += 1;
        debug!("wrote {}", path.display());
        Ok(())
    }
}
