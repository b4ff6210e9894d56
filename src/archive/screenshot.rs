use std::io::BufWriter;
use std::path::Path;

use image::{ImageEncoder, Rgba, RgbaImage};
use serde::Serialize;

use crate::error::ArchiveError;

/// Compares a captured screenshot with its baseline.
pub trait ImageComparator: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when either image cannot be read.
    fn compare(&self, expected: &Path, actual: &Path) -> Result<ImageDiff, ArchiveError>;
}

/// Outcome of a comparison: the number of differing pixels and an image
/// highlighting them.
#[derive(Debug, Clone)]
pub struct ImageDiff {
    pub diff_count: u64,
    image: RgbaImage,
}

impl ImageDiff {
    #[must_use]
    pub const fn new(diff_count: u64, image: RgbaImage) -> Self {
        Self { diff_count, image }
    }

    /// # Errors
    ///
    /// Returns an error when the diff image cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ArchiveError> {
        let file = std::fs::File::create(path).map_err(|source| ArchiveError::Io {
            context: "writing diff image",
            path: path.to_path_buf(),
            source,
        })?;
        let encoder = image::codecs::png::PngEncoder::new(BufWriter::new(file));
        encoder
            .write_image(
                self.image.as_raw(),
                self.image.width(),
                self.image.height(),
                image::ExtendedColorType::Rgba8,
            )
            .map_err(|source| ArchiveError::Image {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Result value returned to the browser for a saved screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotOutcome {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_count: Option<u64>,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Pixel-exact comparator. Pixels outside the overlap of differently sized
/// images count as different.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelComparator {
    tolerance: u32,
}

impl PixelComparator {
    #[must_use]
    pub const fn with_tolerance(tolerance: u32) -> Self {
        Self { tolerance }
    }
}

impl ImageComparator for PixelComparator {
    fn compare(&self, expected: &Path, actual: &Path) -> Result<ImageDiff, ArchiveError> {
        let expected_image = open(expected)?;
        let actual_image = open(actual)?;
        let (width, height) = actual_image.dimensions();
        let (exp_width, exp_height) = expected_image.dimensions();
        let out_width = width.max(exp_width);
        let out_height = height.max(exp_height);

        let mut diff_image = RgbaImage::new(out_width, out_height);
        let mut diff_count = 0_u64;
        for y in 0..out_height {
            for x in 0..out_width {
                let pair = (
                    actual_image.get_pixel_checked(x, y),
                    expected_image.get_pixel_checked(x, y),
                );
                let marked = match pair {
                    (Some(actual_pixel), Some(expected_pixel)) => {
                        if pixel_diff(*actual_pixel, *expected_pixel) > self.tolerance {
                            None
                        } else {
                            let Rgba([r, g, b, _]) = *actual_pixel;
                            Some(Rgba([r / 2, g / 2, b / 2, 128]))
                        }
                    }
                    (Some(_), None) | (None, Some(_)) | (None, None) => None,
                };
                match marked {
                    Some(pixel) => diff_image.put_pixel(x, y, pixel),
                    None => {
                        diff_count = diff_count.saturating_add(1);
                        diff_image.put_pixel(x, y, Rgba([255, 0, 0, 255]));
                    }
                }
            }
        }
        Ok(ImageDiff::new(diff_count, diff_image))
    }
}

fn open(path: &Path) -> Result<RgbaImage, ArchiveError> {
    image::open(path)
        .map(|image| image.to_rgba8())
        .map_err(|source| ArchiveError::Image {
            path: path.to_path_buf(),
            source,
        })
}

fn pixel_diff(a: Rgba<u8>, b: Rgba<u8>) -> u32 {
    let Rgba([r1, g1, b1, a1]) = a;
    let Rgba([r2, g2, b2, a2]) = b;
    u32::from(r1.abs_diff(r2))
        .saturating_add(u32::from(g1.abs_diff(g2)))
        .saturating_add(u32::from(b1.abs_diff(b2)))
        .saturating_add(u32::from(a1.abs_diff(a2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn write_png(path: &Path, image: &RgbaImage) -> Result<(), String> {
        image.save(path).map_err(|err| err.to_string())
    }

    #[test]
    fn identical_images_have_no_diff() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
        let image = RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 255]));
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        write_png(&expected, &image)?;
        write_png(&actual, &image)?;
        let diff = PixelComparator::default()
            .compare(&expected, &actual)
            .map_err(|err| err.to_string())?;
        if diff.diff_count != 0 {
            return Err(format!("Expected no diff, got {}", diff.diff_count));
        }
        Ok(())
    }

    #[test]
    fn changed_and_missing_pixels_are_counted() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
        let expected_image = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        let mut actual_image = RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255]));
        actual_image.put_pixel(0, 0, Rgba([255, 255, 255, 255]));
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        write_png(&expected, &expected_image)?;
        write_png(&actual, &actual_image)?;

        let diff = PixelComparator::default()
            .compare(&expected, &actual)
            .map_err(|err| err.to_string())?;
        if diff.diff_count != 3 {
            return Err(format!("Expected 3 differing pixels, got {}", diff.diff_count));
        }
        let diff_path = dir.path().join("diff.png");
        diff.save(&diff_path).map_err(|err| err.to_string())?;
        let saved = image::open(&diff_path).map_err(|err| err.to_string())?;
        if saved.dimensions() != (3, 2) {
            return Err(format!("Unexpected diff size {:?}", saved.dimensions()));
        }
        Ok(())
    }

    #[test]
    fn tolerance_absorbs_small_changes() -> Result<(), String> {
        let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        write_png(&expected, &RgbaImage::from_pixel(1, 1, Rgba([100, 100, 100, 255])))?;
        write_png(&actual, &RgbaImage::from_pixel(1, 1, Rgba([101, 100, 100, 255])))?;
        let diff = PixelComparator::with_tolerance(2)
            .compare(&expected, &actual)
            .map_err(|err| err.to_string())?;
        if diff.diff_count != 0 {
            return Err("Tolerance should hide a one-step change".to_owned());
        }
        Ok(())
    }
}
