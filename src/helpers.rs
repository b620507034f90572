use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detector::Detection;
use crate::error::PipelineError;
use crate::mapping;

const OUTLINE_PX: u32 = 2;

/// Draws each detection as a hollow rectangle in its class color.
pub fn draw_detections(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    for detection in detections {
        let (x, y, w, h) = detection.pixel_rect();
        let color = mapping::class_color(detection.class_id);
        for inset in 0..OUTLINE_PX {
            if w > 2 * inset && h > 2 * inset {
                let rect =
                    Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w - 2 * inset, h - 2 * inset);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }
    }
    canvas
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, 90);
    image
        .write_with_encoder(encoder)
        .map_err(|e| PipelineError::Image(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn detection(bbox: [f32; 4], class_id: usize) -> Detection {
        Detection {
            bbox,
            class_id,
            class_name: mapping::class_name(class_id).unwrap().to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn boxes_are_drawn_in_the_class_color() {
        let image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let annotated = draw_detections(&image, &[detection([10.0, 10.0, 30.0, 30.0], 0)]);
        assert_eq!(*annotated.get_pixel(10, 10), mapping::class_color(0));
        // Interior stays untouched.
        assert_eq!(*annotated.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn jpeg_round_trips_dimensions() {
        let image = RgbImage::from_pixel(48, 32, Rgb([12, 200, 66]));
        let bytes = encode_jpeg(&image).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (48, 32));
    }
}
