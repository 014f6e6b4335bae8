use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use std::io::Cursor;
use thiserror::Error;

/// Recognition quality drops sharply below this size.
const MIN_WIDTH: u32 = 800;
const MIN_HEIGHT: u32 = 600;
/// Upscaling never pushes the longer side past this.
const MAX_UPSCALED_SIDE: u32 = 2800;

/// Fraction of the histogram discarded at each end when stretching contrast.
const CONTRAST_CLIP: f64 = 0.01;
/// Pixels brighter than this fraction of full scale become white.
const THRESHOLD_LEVEL: f64 = 0.60;
const MAX_DESKEW_DEGREES: f32 = 40.0;
/// Skew below this is left alone; rotating would only blur the glyphs.
const MIN_DESKEW_DEGREES: f32 = 0.5;
/// Skew estimation runs on a copy no larger than this on either side.
const SKEW_ESTIMATE_MAX_SIDE: u32 = 800;
const INK_LEVEL: u8 = 128;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to load image: {0}")]
    Load(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
    #[error("Deskew failed: {0}")]
    Deskew(String),
}

/// Which path produced a [`NormalizedImage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Advanced,
    Basic,
    /// Both pipelines failed; the input bytes are passed through untouched.
    Original,
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub strategy: Strategy,
}

/// Turns a photographed bill into a recognition-ready bitmap.
///
/// Failures never escape: the advanced pipeline falls back to the basic one,
/// and the basic one falls back to the original bytes.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    advanced: bool,
}

impl Normalizer {
    pub fn new(advanced: bool) -> Self {
        Self { advanced }
    }

    pub fn normalize(&self, data: &[u8]) -> NormalizedImage {
        if self.advanced {
            match prepare_advanced(data) {
                Ok(bytes) => {
                    tracing::debug!("Advanced preprocessing completed, output size: {} bytes", bytes.len());
                    return NormalizedImage { bytes, strategy: Strategy::Advanced };
                }
                Err(e) => tracing::warn!("Advanced preprocessing failed, falling back to basic: {e}"),
            }
        }

        match prepare_basic(data) {
            Ok(bytes) => NormalizedImage { bytes, strategy: Strategy::Basic },
            Err(e) => {
                tracing::warn!("Basic preprocessing failed, using original image: {e}");
                NormalizedImage { bytes: data.to_vec(), strategy: Strategy::Original }
            }
        }
    }
}

/// Orientation, grayscale, contrast stretch, deskew, upscale, threshold → PNG.
pub fn prepare_advanced(data: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let img = image::load_from_memory(data)?;
    let img = auto_orient(data, img);

    let gray = stretch_contrast(&img.to_luma8(), CONTRAST_CLIP);

    let gray = match deskew(&gray, MAX_DESKEW_DEGREES) {
        Ok(Some(straightened)) => straightened,
        Ok(None) => gray,
        Err(e) => {
            tracing::debug!("{e}, continuing without skew correction");
            gray
        }
    };

    let gray = upscale_to_minimum(DynamicImage::ImageLuma8(gray), FilterType::CatmullRom).to_luma8();
    let binary = threshold(&gray, THRESHOLD_LEVEL);
    encode_as_png(DynamicImage::ImageLuma8(binary))
}

/// Grayscale + minimum-size upscale → PNG.
pub fn prepare_basic(data: &[u8]) -> Result<Vec<u8>, PreprocessError> {
    let img = image::load_from_memory(data)?;
    let gray = DynamicImage::ImageLuma8(img.to_luma8());
    encode_as_png(upscale_to_minimum(gray, FilterType::Triangle))
}

fn encode_as_png(img: DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

// ── Orientation ───────────────────────────────────────────────────────────────

/// EXIF orientation tag, 1 (upright) when absent.
fn read_exif_orientation(data: &[u8]) -> u32 {
    let mut cursor = Cursor::new(data);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|reader| {
            reader
                .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
        })
        .unwrap_or(1)
}

fn auto_orient(data: &[u8], img: DynamicImage) -> DynamicImage {
    match read_exif_orientation(data) {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ── Contrast ──────────────────────────────────────────────────────────────────

/// Linear stretch that maps the `clip` and `1 - clip` histogram quantiles to
/// black and white.
fn stretch_contrast(gray: &GrayImage, clip: f64) -> GrayImage {
    let mut histogram = [0u64; 256];
    for p in gray.pixels() {
        histogram[p[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    let cut = total as f64 * clip;

    let mut low = 0u8;
    let mut seen = 0u64;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen as f64 > cut {
            low = value as u8;
            break;
        }
    }

    let mut high = 255u8;
    seen = 0;
    for (value, count) in histogram.iter().enumerate().rev() {
        seen += count;
        if seen as f64 > cut {
            high = value as u8;
            break;
        }
    }

    if high <= low {
        // Uniform image.
        return gray.clone();
    }

    let range = (high - low) as u32;
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let p = gray.get_pixel(x, y)[0].clamp(low, high);
        Luma([((p - low) as u32 * 255 / range) as u8])
    })
}

// ── Deskew ────────────────────────────────────────────────────────────────────

/// Straighten text lines tilted by up to `max_degrees`. `Ok(None)` means the
/// page is already straight.
fn deskew(gray: &GrayImage, max_degrees: f32) -> Result<Option<GrayImage>, PreprocessError> {
    let angle = estimate_skew(gray, max_degrees)?;
    if angle.abs() < MIN_DESKEW_DEGREES {
        return Ok(None);
    }
    tracing::debug!("Correcting skew of {angle:.1} degrees");
    Ok(Some(rotate_about_center(
        gray,
        -angle.to_radians(),
        Interpolation::Bilinear,
        Luma([255u8]),
    )))
}

/// Angle (degrees, clockwise positive) of the dominant text lines, found by
/// maximizing the sharpness of the horizontal ink projection.
fn estimate_skew(gray: &GrayImage, max_degrees: f32) -> Result<f32, PreprocessError> {
    let (w, h) = gray.dimensions();
    if w < 16 || h < 16 {
        return Err(PreprocessError::Deskew(format!("image too small ({w}x{h})")));
    }

    let sample = if w.max(h) > SKEW_ESTIMATE_MAX_SIDE {
        image::imageops::resize(
            gray,
            (w * SKEW_ESTIMATE_MAX_SIDE / w.max(h)).max(1),
            (h * SKEW_ESTIMATE_MAX_SIDE / w.max(h)).max(1),
            FilterType::Triangle,
        )
    } else {
        gray.clone()
    };

    let ink: Vec<(f32, f32)> = sample
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] < INK_LEVEL)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect();
    let area = (sample.width() * sample.height()) as usize;
    if ink.len() * 200 < area {
        return Err(PreprocessError::Deskew("not enough ink to measure skew".into()));
    }

    let diagonal = ((sample.width().pow(2) + sample.height().pow(2)) as f32).sqrt();
    let score = |degrees: f32| projection_sharpness(&ink, degrees, diagonal);

    // Coarse pass in whole degrees, then refine around the best.
    let coarse = best_angle(-max_degrees, max_degrees, 1.0, score);
    let fine = best_angle(
        (coarse - 1.0).max(-max_degrees),
        (coarse + 1.0).min(max_degrees),
        0.1,
        score,
    );
    Ok(fine)
}

fn best_angle(from: f32, to: f32, step: f32, score: impl Fn(f32) -> f64) -> f32 {
    let steps = ((to - from) / step).round() as i32;
    let mut best = (0.0f32, f64::NEG_INFINITY);
    for i in 0..=steps {
        let angle = from + i as f32 * step;
        let s = score(angle);
        // Prefer the smaller rotation on ties.
        if s > best.1 || (s == best.1 && angle.abs() < best.0.abs()) {
            best = (angle, s);
        }
    }
    best.0
}

/// Sum of squared row counts after projecting ink onto lines tilted by
/// `degrees`. Peaks when the projection lines follow the text lines.
fn projection_sharpness(ink: &[(f32, f32)], degrees: f32, diagonal: f32) -> f64 {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let offset = diagonal;
    let mut rows = vec![0u32; (2.0 * diagonal) as usize + 2];
    for &(x, y) in ink {
        let r = (y * cos - x * sin + offset) as usize;
        if let Some(slot) = rows.get_mut(r) {
            *slot += 1;
        }
    }
    rows.iter().map(|&c| (c as f64) * (c as f64)).sum()
}

// ── Size and threshold ────────────────────────────────────────────────────────

/// Upscale, preserving aspect ratio, until both minimum dimensions hold or
/// the longer side reaches [`MAX_UPSCALED_SIDE`].
fn upscale_to_minimum(img: DynamicImage, filter: FilterType) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 || (w >= MIN_WIDTH && h >= MIN_HEIGHT) {
        return img;
    }
    let scale = (MIN_WIDTH as f64 / w as f64)
        .max(MIN_HEIGHT as f64 / h as f64)
        .min(MAX_UPSCALED_SIDE as f64 / w.max(h) as f64);
    if scale <= 1.0 {
        return img;
    }
    let new_w = ((w as f64 * scale).ceil() as u32).min(MAX_UPSCALED_SIDE);
    let new_h = ((h as f64 * scale).ceil() as u32).min(MAX_UPSCALED_SIDE);
    tracing::debug!("Resized image by factor {scale:.2} to {new_w}x{new_h}");
    img.resize_exact(new_w, new_h, filter)
}

fn threshold(gray: &GrayImage, level: f64) -> GrayImage {
    let cutoff = (level * 255.0).round() as u8;
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > cutoff {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_gray(width: u32, height: u32, value: u8) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |_, _| Luma([value]));
        DynamicImage::ImageLuma8(img)
    }

    fn gradient_gray(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, _| Luma([(x * 255 / (width - 1)) as u8]))
    }

    /// White page with dark horizontal bars standing in for text lines.
    fn ruled_page(width: u32, height: u32) -> GrayImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            let in_margin = x < width / 8 || x > width - width / 8;
            if !in_margin && y > 20 && y < height - 20 && y % 20 < 4 {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        })
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        buf
    }

    fn decode(bytes: &[u8]) -> DynamicImage {
        image::load_from_memory(bytes).unwrap()
    }

    #[test]
    fn stretch_uniform_image_returns_same() {
        let img = solid_gray(10, 10, 128).to_luma8();
        let out = stretch_contrast(&img, CONTRAST_CLIP);
        assert!(out.pixels().all(|p| p[0] == 128));
    }

    #[test]
    fn stretch_gradient_reaches_full_range() {
        let out = stretch_contrast(&gradient_gray(256, 1), CONTRAST_CLIP);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn stretch_ignores_rare_outliers() {
        // 1000 mid-gray pixels spread over 100..=150, plus 5 pure black/white.
        let mut img: GrayImage = ImageBuffer::from_fn(1005, 1, |x, _| Luma([100 + (x % 51) as u8]));
        img.put_pixel(1000, 0, Luma([0]));
        img.put_pixel(1001, 0, Luma([0]));
        img.put_pixel(1002, 0, Luma([255]));
        img.put_pixel(1003, 0, Luma([255]));
        img.put_pixel(1004, 0, Luma([255]));

        let out = stretch_contrast(&img, CONTRAST_CLIP);
        // Mid-range content now spans (nearly) the full scale.
        let darkest_content = (0..1000).map(|x| out.get_pixel(x, 0)[0]).min().unwrap();
        let brightest_content = (0..1000).map(|x| out.get_pixel(x, 0)[0]).max().unwrap();
        assert!(darkest_content < 10, "got {darkest_content}");
        assert!(brightest_content > 245, "got {brightest_content}");
    }

    #[test]
    fn threshold_splits_at_sixty_percent() {
        let out = threshold(&gradient_gray(256, 1), THRESHOLD_LEVEL);
        assert_eq!(out.get_pixel(153, 0)[0], 0);
        assert_eq!(out.get_pixel(154, 0)[0], 255);
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn upscale_meets_both_minimums_and_keeps_aspect() {
        let out = upscale_to_minimum(solid_gray(400, 100, 200), FilterType::Triangle);
        assert!(out.width() >= MIN_WIDTH && out.height() >= MIN_HEIGHT);
        // Height is the binding constraint: factor 6.
        assert_eq!((out.width(), out.height()), (2400, 600));
    }

    #[test]
    fn thin_sliver_upscale_is_capped() {
        let out = upscale_to_minimum(solid_gray(1, 2000, 200), FilterType::Triangle);
        assert_eq!(out.height(), MAX_UPSCALED_SIDE);
        assert!(out.width() <= 2);

        // Already at the cap on the long side: left alone.
        let out = upscale_to_minimum(solid_gray(10, 3000, 200), FilterType::Triangle);
        assert_eq!((out.width(), out.height()), (10, 3000));
    }

    #[test]
    fn large_enough_image_is_not_resized() {
        let out = upscale_to_minimum(solid_gray(1000, 700, 200), FilterType::Triangle);
        assert_eq!((out.width(), out.height()), (1000, 700));
    }

    #[test]
    fn straight_page_needs_no_deskew() {
        let page = ruled_page(400, 300);
        let angle = estimate_skew(&page, MAX_DESKEW_DEGREES).unwrap();
        assert!(angle.abs() < MIN_DESKEW_DEGREES, "estimated {angle}");
        assert!(deskew(&page, MAX_DESKEW_DEGREES).unwrap().is_none());
    }

    #[test]
    fn tilted_page_skew_is_measured() {
        let tilted = rotate_about_center(
            &ruled_page(400, 300),
            6.0f32.to_radians(),
            Interpolation::Bilinear,
            Luma([255u8]),
        );
        let angle = estimate_skew(&tilted, MAX_DESKEW_DEGREES).unwrap();
        assert!((angle.abs() - 6.0).abs() < 1.0, "estimated {angle}");

        let straightened = deskew(&tilted, MAX_DESKEW_DEGREES).unwrap().unwrap();
        let residual = estimate_skew(&straightened, MAX_DESKEW_DEGREES).unwrap();
        assert!(residual.abs() < 1.0, "residual skew {residual}");
    }

    #[test]
    fn blank_page_deskew_is_a_soft_error() {
        let blank = solid_gray(400, 300, 255).to_luma8();
        assert!(matches!(deskew(&blank, MAX_DESKEW_DEGREES), Err(PreprocessError::Deskew(_))));
        // ...and the advanced pipeline still succeeds without it.
        let bytes = png_bytes(&DynamicImage::ImageLuma8(blank));
        assert!(prepare_advanced(&bytes).is_ok());
    }

    #[test]
    fn advanced_output_is_binary_png_at_minimum_size() {
        let bytes = png_bytes(&DynamicImage::ImageLuma8(ruled_page(200, 150)));
        let out = prepare_advanced(&bytes).unwrap();
        assert_eq!(&out[..4], b"\x89PNG");

        let img = decode(&out).to_luma8();
        assert!(img.width() >= MIN_WIDTH && img.height() >= MIN_HEIGHT);
        assert!(img.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn basic_output_is_gray_and_upscaled() {
        let rgb = DynamicImage::ImageRgb8(ImageBuffer::from_fn(100, 100, |x, _| {
            image::Rgb([x as u8, 100, 200])
        }));
        let out = decode(&prepare_basic(&png_bytes(&rgb)).unwrap());
        assert_eq!(out.color(), image::ColorType::L8);
        assert_eq!((out.width(), out.height()), (800, 800));
    }

    #[test]
    fn normalizer_uses_advanced_when_enabled() {
        let bytes = png_bytes(&solid_gray(900, 700, 220));
        assert_eq!(Normalizer::new(true).normalize(&bytes).strategy, Strategy::Advanced);
    }

    #[test]
    fn normalizer_uses_basic_when_disabled() {
        let bytes = png_bytes(&solid_gray(900, 700, 220));
        let out = Normalizer::new(false).normalize(&bytes);
        assert_eq!(out.strategy, Strategy::Basic);
        assert_eq!(&out.bytes[..4], b"\x89PNG");
    }

    #[test]
    fn undecodable_input_passes_through_untouched() {
        let junk = b"definitely not an image".to_vec();
        let out = Normalizer::new(true).normalize(&junk);
        assert_eq!(out.strategy, Strategy::Original);
        assert_eq!(out.bytes, junk);
    }

    #[test]
    fn missing_exif_means_upright() {
        let bytes = png_bytes(&solid_gray(4, 4, 100));
        assert_eq!(read_exif_orientation(&bytes), 1);
        let img = auto_orient(&bytes, solid_gray(4, 2, 100));
        assert_eq!((img.width(), img.height()), (4, 2));
    }
}
