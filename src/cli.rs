use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Detector weights (ONNX)
    #[arg(long, default_value = "models/detector.onnx")]
    pub detector_model: String,

    /// Classifier weights (safetensors)
    #[arg(long, default_value = "models/classifier.safetensors")]
    pub classifier_model: String,

    /// Run the detector on the CUDA execution provider
    #[arg(long, default_value_t = false)]
    pub cuda: bool,

    #[arg(long, default_value_t = 4000)]
    pub port: u16,

    /// Per-request processing budget in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}
