/*
 * Copyright (c) 2024. XIMEA GmbH - All Rights Reserved
 */

use image::{Rgb, RgbImage};

/// Layout of the pixels in a [Frame] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
    /// 16 bit little endian samples
    Mono16,
    Rgb8,
    Bgr8,
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Bgr8 => 3,
            PixelFormat::Bgra8 => 4,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("buffer holds {actual} bytes but {expected} are required")]
    BufferTooSmall { expected: usize, actual: usize },
}

/// A frame as it is delivered by the device.
///
/// The pixel data is borrowed from the device's buffer pool and is only valid
/// until the next retrieval.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    width: u32,
    height: u32,
    padding_x: u32,
    format: PixelFormat,
    data: &'a [u8],
    frame_number: u32,
    exposure_us: Option<f64>,
}

impl<'a> Frame<'a> {
    /// Wrap a raw pixel buffer.
    ///
    /// # Arguments
    ///
    /// * `padding_x`: Number of extra bytes at the end of each line.
    ///
    /// returns: an error if `data` cannot hold `height` rows of the given layout.
    pub fn from_raw(
        width: u32,
        height: u32,
        padding_x: u32,
        format: PixelFormat,
        data: &'a [u8],
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let stride = width as usize * format.bytes_per_pixel() + padding_x as usize;
        // The last line does not need its padding.
        let expected = stride * (height as usize - 1) + width as usize * format.bytes_per_pixel();
        if data.len() < expected {
            return Err(FrameError::BufferTooSmall {
                expected,
                actual: data.len(),
            });
        }
        Ok(Frame {
            width,
            height,
            padding_x,
            format,
            data,
            frame_number: 0,
            exposure_us: None,
        })
    }

    pub fn with_frame_number(mut self, frame_number: u32) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn with_exposure_us(mut self, exposure_us: f64) -> Self {
        self.exposure_us = Some(exposure_us);
        self
    }

    /// Get the width of this frame in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Get the height of this frame
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Frame number as counted by the device
    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    /// Exposure time the device reports for this frame, if it reports one.
    pub fn exposure_us(&self) -> Option<f64> {
        self.exposure_us
    }

    /// Total length of a row in bytes
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel() + self.padding_x as usize
    }

    /// Raw bytes of the frame, including line padding.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Get the bytes of a single pixel.
    ///
    /// # Arguments
    ///
    /// * `x`: Horizontal coordinate of the requested pixel.
    /// * `y`: Vertical coordinate of the requested pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&'a [u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = self.stride() * y as usize + x as usize * bpp;
        self.data.get(offset..offset + bpp)
    }

    /// Intensity of the first pixel, reduced to 8 bits.
    pub fn first_pixel_value(&self) -> Option<u8> {
        self.pixel(0, 0).map(|px| to_rgb(self.format, px)[0])
    }

    /// Convert to a packed RGB8 buffer suitable for display and encoding.
    pub fn to_rgb8(&self) -> RgbImage {
        RgbImage::from(self)
    }
}

fn to_rgb(format: PixelFormat, px: &[u8]) -> [u8; 3] {
    match format {
        PixelFormat::Mono8 => [px[0]; 3],
        // keep the most significant byte
        PixelFormat::Mono16 => [px[1]; 3],
        PixelFormat::Rgb8 => [px[0], px[1], px[2]],
        PixelFormat::Bgr8 | PixelFormat::Bgra8 => [px[2], px[1], px[0]],
    }
}

impl From<&Frame<'_>> for RgbImage {
    /// Converts the frame to an [RgbImage], dropping line padding and alpha.
    fn from(frame: &Frame<'_>) -> Self {
        RgbImage::from_fn(frame.width, frame.height, |x, y| match frame.pixel(x, y) {
            Some(px) => Rgb(to_rgb(frame.format, px)),
            None => Rgb([0, 0, 0]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffer() {
        let data = [0u8; 5];
        let err = Frame::from_raw(3, 2, 0, PixelFormat::Mono8, &data).unwrap_err();
        assert_eq!(
            err,
            FrameError::BufferTooSmall {
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn rejects_empty_frame() {
        let err = Frame::from_raw(0, 4, 0, PixelFormat::Mono8, &[]).unwrap_err();
        assert_eq!(err, FrameError::Empty { width: 0, height: 4 });
    }

    #[test]
    fn pixel_honours_padding() {
        // two rows of two mono pixels, one padding byte per line
        let data = [1u8, 2, 0xff, 3, 4];
        let frame = Frame::from_raw(2, 2, 1, PixelFormat::Mono8, &data).unwrap();
        assert_eq!(frame.stride(), 3);
        assert_eq!(frame.pixel(1, 0), Some(&[2u8][..]));
        assert_eq!(frame.pixel(0, 1), Some(&[3u8][..]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.pixel(0, 2), None);
    }

    #[test]
    fn converts_bgr_to_rgb() {
        let data = [10u8, 20, 30, 40, 50, 60];
        let frame = Frame::from_raw(2, 1, 0, PixelFormat::Bgr8, &data).unwrap();
        let rgb = frame.to_rgb8();
        assert_eq!(rgb.dimensions(), (2, 1));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([30, 20, 10]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([60, 50, 40]));
    }

    #[test]
    fn converts_bgra_and_mono16() {
        let bgra = [1u8, 2, 3, 255];
        let frame = Frame::from_raw(1, 1, 0, PixelFormat::Bgra8, &bgra).unwrap();
        assert_eq!(frame.to_rgb8().get_pixel(0, 0), &Rgb([3, 2, 1]));

        let mono16 = 0x1234u16.to_le_bytes();
        let frame = Frame::from_raw(1, 1, 0, PixelFormat::Mono16, &mono16).unwrap();
        assert_eq!(frame.to_rgb8().get_pixel(0, 0), &Rgb([0x12; 3]));
        assert_eq!(frame.first_pixel_value(), Some(0x12));
    }

    #[test]
    fn metadata_builders() {
        let data = [0u8; 4];
        let frame = Frame::from_raw(2, 2, 0, PixelFormat::Mono8, &data)
            .unwrap()
            .with_frame_number(7)
            .with_exposure_us(1500.0);
        assert_eq!(frame.frame_number(), 7);
        assert_eq!(frame.exposure_us(), Some(1500.0));
    }
}
