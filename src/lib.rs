pub mod cam;
pub mod classifier;
pub mod cli;
pub mod detector;
pub mod error;
pub mod fusion;
pub mod helpers;
pub mod mapping;
pub mod model;
pub mod preprocess;
pub mod service;

pub use crate::cam::{ActivationCapture, CamExplanation};
pub use crate::classifier::{Classification, ClassifierConfig, LeafClassifier};
pub use crate::cli::Args;
pub use crate::detector::{Detection, Detector, DetectorConfig};
pub use crate::error::PipelineError;
pub use crate::model::{ModelKind, ModelRegistry, RegistryConfig};
pub use crate::preprocess::PreprocessConfig;
pub use crate::service::{AppState, build_router, start_server};
