//! Radiance images and floating-point image output.

use std::path::Path;

use glam::Vec3;
use image::{ImageBuffer, ImageFormat, Rgb};

use crate::error::{MeshtraceError, Result};

/// Linear RGB radiance, row-major from the top-left pixel, no padding.
#[derive(Debug, Clone, PartialEq)]
pub struct RadianceImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl RadianceImage {
    /// Wraps `width * height * 3` floats.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(MeshtraceError::ImageSize {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The raw floats.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Radiance of pixel `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Vec3 {
        let base = 3 * (y as usize * self.width as usize + x as usize);
        Vec3::from_slice(&self.data[base..base + 3])
    }

    /// Consumes the image, returning the raw floats.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Encodes `image` by the extension of `path`: `.hdr` (Radiance RGBE) or
/// `.exr` (OpenEXR).
pub fn write_image(path: impl AsRef<Path>, image: &RadianceImage) -> Result<()> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let format = match extension.as_str() {
        "hdr" => ImageFormat::Hdr,
        "exr" => ImageFormat::OpenExr,
        _ => return Err(MeshtraceError::UnsupportedFormat(extension)),
    };

    let buffer: ImageBuffer<Rgb<f32>, Vec<f32>> =
        ImageBuffer::from_raw(image.width, image.height, image.data.clone()).ok_or(
            MeshtraceError::ImageSize {
                width: image.width,
                height: image.height,
                expected: image.width as usize * image.height as usize * 3,
                actual: image.data.len(),
            },
        )?;
    buffer.save_with_format(path, format)?;
    log::info!(
        "wrote {}x{} image to {}",
        image.width,
        image.height,
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RadianceImage {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as f32 / width as f32, y as f32 / height as f32, 0.5]);
            }
        }
        RadianceImage::new(width, height, data).unwrap()
    }

    #[test]
    fn test_size_mismatch() {
        let err = RadianceImage::new(2, 2, vec![0.0; 11]).unwrap_err();
        assert!(matches!(err, MeshtraceError::ImageSize { expected: 12, actual: 11, .. }));
    }

    #[test]
    fn test_pixel_addressing() {
        let image = gradient(4, 2);
        assert_eq!(image.pixel(0, 0), Vec3::new(0.0, 0.0, 0.5));
        assert_eq!(image.pixel(3, 1), Vec3::new(0.75, 0.5, 0.5));
    }

    #[test]
    fn test_write_hdr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hdr");
        write_image(&path, &gradient(16, 8)).unwrap();

        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        let rgb = decoded.to_rgb32f();
        // RGBE keeps about 8 bits of mantissa.
        let p = rgb.get_pixel(12, 4);
        assert!((p[0] - 0.75).abs() < 0.01);
        assert!((p[1] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_write_exr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.EXR");
        write_image(&path, &gradient(8, 8)).unwrap();
        let decoded = image::open(&path).unwrap().to_rgb32f();
        assert_eq!(decoded.get_pixel(4, 2)[0], 0.5);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_image(dir.path().join("out.png"), &gradient(2, 2)).unwrap_err();
        assert!(matches!(err, MeshtraceError::UnsupportedFormat(ref e) if e == "png"));
        assert!(!dir.path().join("out.png").exists());
    }
}
