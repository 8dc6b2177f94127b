use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};

/// Frame every layout coordinate is expressed in
pub const CANONICAL_WIDTH: u32 = 600;
pub const CANONICAL_HEIGHT: u32 = 800;

/// Resize a decoded sheet into the canonical frame, ignoring aspect ratio
pub fn to_canonical(img: &DynamicImage) -> RgbImage {
    let rgb = img.to_rgb8();
    if rgb.dimensions() == (CANONICAL_WIDTH, CANONICAL_HEIGHT) {
        return rgb;
    }
    imageops::resize(&rgb, CANONICAL_WIDTH, CANONICAL_HEIGHT, FilterType::Triangle)
}

/// Binarize with an Otsu threshold so that ink becomes 255 and paper 0
pub fn binarize(img: &RgbImage) -> GrayImage {
    let gray = imageops::grayscale(img);
    let level = otsu_level(&gray);
    tracing::debug!("Otsu level: {}", level);
    threshold(&gray, level, ThresholdType::BinaryInverted)
}
