use crate::error::SetupError;
use image::RgbaImage;
use std::path::Path;

/// Immutable input raster for one session.
#[derive(Debug, Clone)]
pub struct TargetImage {
    image: RgbaImage,
}

impl TargetImage {
    pub fn open(path: &Path) -> Result<Self, SetupError> {
        if !path.exists() {
            return Err(SetupError::TargetMissing(path.display().to_string()));
        }
        let decoded = image::open(path).map_err(|err| SetupError::TargetUnreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_image(decoded.to_rgba8())
    }

    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, SetupError> {
        let expected = (width as usize) * (height as usize) * 4;
        if width == 0 || height == 0 {
            return Err(SetupError::TargetDimensions { width, height });
        }
        if pixels.len() != expected {
            return Err(SetupError::PixelBuffer {
                expected,
                actual: pixels.len(),
            });
        }
        let image = RgbaImage::from_raw(width, height, pixels).ok_or(SetupError::PixelBuffer {
            expected,
            actual: 0,
        })?;
        Self::from_image(image)
    }

    pub fn from_image(image: RgbaImage) -> Result<Self, SetupError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SetupError::TargetDimensions { width, height });
        }
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}
