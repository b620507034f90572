use image::Rgb;

use crate::error::PipelineError;

/// The diseases both models are trained on, indexed by class id.
pub const LABELS: [&str; 5] = [
    "Brown_Spot",
    "Bacterial_Blight",
    "Leaf_Blight",
    "Sheath_Blight",
    "Tungro",
];

/// Display colors for annotated detector output, by class id.
const COLORS: [Rgb<u8>; 5] = [
    Rgb([255, 0, 0]),   // Brown_Spot
    Rgb([0, 255, 0]),   // Bacterial_Blight
    Rgb([0, 0, 255]),   // Leaf_Blight
    Rgb([255, 255, 0]), // Sheath_Blight
    Rgb([255, 0, 255]), // Tungro
];

/// Resolves a class id to its label. An id outside the table is a model
/// defect and is reported as an error, never relabeled "Unknown".
pub fn class_name(class_id: usize) -> Result<&'static str, PipelineError> {
    LABELS
        .get(class_id)
        .copied()
        .ok_or(PipelineError::UnknownClass(class_id))
}

pub fn class_color(class_id: usize) -> Rgb<u8> {
    COLORS.get(class_id).copied().unwrap_or(Rgb([255, 255, 255]))
}
