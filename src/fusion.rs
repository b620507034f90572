use image::{DynamicImage, GrayImage, Luma, RgbImage};
use ndarray::Array2;

use crate::cam;
use crate::classifier::LeafClassifier;
use crate::detector::Detector;
use crate::error::PipelineError;
use crate::preprocess;

/// Detect diseased regions, explain each region with the CAM engine, and
/// fuse the per-region heatmaps into one overlay on the source image.
///
/// Returns `None` when the detector finds nothing; that is an ordinary
/// empty outcome, not an error. Region heatmaps are each max-normalized by
/// the CAM engine, then summed at their box offsets (overlaps add) and
/// re-normalized once by the global maximum, so the boxes' relative
/// intensities stay coupled. The final blend is an even 50/50 with the
/// grayscale heatmap, unlike the single-image jet overlay.
pub fn explain_detections(
    detector: &Detector,
    classifier: &LeafClassifier,
    image: &DynamicImage,
) -> Result<Option<RgbImage>, PipelineError> {
    let detections = detector.detect(image)?;
    if detections.is_empty() {
        return Ok(None);
    }

    let rgb = preprocess::flatten_to_rgb(image);
    let (width, height) = rgb.dimensions();

    let mut regions = Vec::with_capacity(detections.len());
    for detection in &detections {
        let (x, y, w, h) = detection.pixel_rect();
        let crop = image.crop_imm(x, y, w, h);
        let (_, region_heat) = cam::activation_heatmap(classifier, &crop)?;
        regions.push((x, y, region_heat));
    }

    let accumulated = accumulate_regions(width, height, &regions);
    let heat = normalize_global(&accumulated);
    Ok(Some(blend_gray(&rgb, &heat)))
}

/// Sums region heatmaps into an image-sized float buffer at their offsets.
/// Overlapping regions accumulate; nothing is normalized here.
pub(crate) fn accumulate_regions(
    width: u32,
    height: u32,
    regions: &[(u32, u32, GrayImage)],
) -> Array2<f32> {
    let mut acc = Array2::<f32>::zeros((height as usize, width as usize));
    for (x_off, y_off, heat) in regions {
        for (x, y, pixel) in heat.enumerate_pixels() {
            let gx = (x_off + x) as usize;
            let gy = (y_off + y) as usize;
            if gx < width as usize && gy < height as usize {
                acc[[gy, gx]] += pixel.0[0] as f32;
            }
        }
    }
    acc
}

/// One global divide-by-maximum over the accumulated buffer, scaled to
/// [0, 255]. An all-zero buffer stays all-zero.
pub(crate) fn normalize_global(acc: &Array2<f32>) -> GrayImage {
    let max = acc.iter().cloned().fold(0f32, f32::max);
    let (height, width) = (acc.shape()[0] as u32, acc.shape()[1] as u32);
    GrayImage::from_fn(width, height, |x, y| {
        let v = acc[[y as usize, x as usize]];
        if max > 0.0 {
            Luma([(v / max * 255.0).round() as u8])
        } else {
            Luma([0])
        }
    })
}

fn blend_gray(base: &RgbImage, heat: &GrayImage) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y).0;
        let h = heat.get_pixel(x, y).0[0];
        let mix = |c: u8| ((c as f32 + h as f32) / 2.0).round() as u8;
        image::Rgb([mix(b[0]), mix(b[1]), mix(b[2])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_regions_accumulate_then_normalize_globally() {
        // Two non-overlapping regions with different peak intensities. With
        // accumulate-then-normalize, only the global maximum reaches 255 and
        // the weaker region scales relative to it; normalize-then-accumulate
        // would bring both to 255.
        let strong = GrayImage::from_pixel(2, 2, Luma([200]));
        let weak = GrayImage::from_pixel(2, 2, Luma([100]));
        let acc = accumulate_regions(8, 8, &[(0, 0, strong), (4, 4, weak)]);

        let heat = normalize_global(&acc);
        assert_eq!(heat.get_pixel(0, 0).0[0], 255);
        assert_eq!(heat.get_pixel(4, 4).0[0], 128);
        assert_eq!(heat.get_pixel(2, 2).0[0], 0);
    }

    #[test]
    fn overlapping_regions_sum_before_normalization() {
        let a = GrayImage::from_pixel(2, 2, Luma([100]));
        let b = GrayImage::from_pixel(2, 2, Luma([100]));
        // Overlap on the single pixel (1, 1).
        let acc = accumulate_regions(4, 4, &[(0, 0, a), (1, 1, b)]);

        assert_eq!(acc[[1, 1]], 200.0);
        let heat = normalize_global(&acc);
        assert_eq!(heat.get_pixel(1, 1).0[0], 255);
        assert_eq!(heat.get_pixel(0, 0).0[0], 128);
    }

    #[test]
    fn regions_are_clipped_at_the_image_edge() {
        let region = GrayImage::from_pixel(4, 4, Luma([255]));
        let acc = accumulate_regions(5, 5, &[(3, 3, region)]);
        assert_eq!(acc[[4, 4]], 255.0);
        assert_eq!(acc.shape(), &[5, 5]);
    }

    #[test]
    fn empty_accumulator_normalizes_to_black() {
        let acc = Array2::<f32>::zeros((4, 4));
        let heat = normalize_global(&acc);
        assert!(heat.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn gray_blend_is_an_even_split() {
        let base = RgbImage::from_pixel(1, 1, image::Rgb([200, 100, 0]));
        let heat = GrayImage::from_pixel(1, 1, Luma([100]));
        let out = blend_gray(&base, &heat);
        assert_eq!(out.get_pixel(0, 0).0, [150, 100, 50]);
    }
}
