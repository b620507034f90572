use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info, warn};

use crate::classifier::{ClassifierConfig, LeafClassifier};
use crate::detector::Detector;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Detector,
    Classifier,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Detector => write!(f, "detector"),
            ModelKind::Classifier => write!(f, "classifier"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub detector_path: PathBuf,
    pub classifier_path: PathBuf,
    pub cuda: bool,
}

type Slot<T> = OnceCell<Result<Arc<Mutex<T>>, String>>;

/// Lazily loads and memoizes one instance of each model for the process
/// lifetime.
///
/// `get_or_init` guarantees a single load per kind under concurrent first
/// use; no second caller can observe a partially constructed handle. The
/// outcome is memoized either way: once a load has failed, later callers
/// fail fast with `ModelUnavailable` instead of retrying. The mutex around
/// each handle serializes inference, and for the classifier it is also the
/// exclusion window the CAM engine relies on.
pub struct ModelRegistry {
    config: RegistryConfig,
    detector: Slot<Detector>,
    classifier: Slot<LeafClassifier>,
}

impl ModelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            detector: OnceCell::new(),
            classifier: OnceCell::new(),
        }
    }

    pub async fn detector(&self) -> Result<Arc<Mutex<Detector>>, PipelineError> {
        let mut loaded_now = false;
        let slot = self
            .detector
            .get_or_init(|| {
                loaded_now = true;
                let path = self.config.detector_path.clone();
                let cuda = self.config.cuda;
                async move {
                    let started = Instant::now();
                    match tokio::task::spawn_blocking(move || Detector::load(&path, cuda)).await {
                        Ok(Ok(model)) => {
                            info!(elapsed = ?started.elapsed(), "detector model loaded");
                            Ok(Arc::new(Mutex::new(model)))
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "failed to load detector model");
                            Err(e.to_string())
                        }
                        Err(e) => {
                            error!(error = %e, "detector load task failed");
                            Err(e.to_string())
                        }
                    }
                }
            })
            .await;

        resolve(slot, ModelKind::Detector, loaded_now)
    }

    pub async fn classifier(&self) -> Result<Arc<Mutex<LeafClassifier>>, PipelineError> {
        let mut loaded_now = false;
        let slot = self
            .classifier
            .get_or_init(|| {
                loaded_now = true;
                let path = self.config.classifier_path.clone();
                async move {
                    let started = Instant::now();
                    let load = move || {
                        LeafClassifier::load(&path, &ClassifierConfig::default(), &Device::Cpu)
                    };
                    match tokio::task::spawn_blocking(load).await {
                        Ok(Ok(model)) => {
                            info!(elapsed = ?started.elapsed(), "classifier model loaded");
                            Ok(Arc::new(Mutex::new(model)))
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "failed to load classifier model");
                            Err(e.to_string())
                        }
                        Err(e) => {
                            error!(error = %e, "classifier load task failed");
                            Err(e.to_string())
                        }
                    }
                }
            })
            .await;

        resolve(slot, ModelKind::Classifier, loaded_now)
    }

    /// Eagerly populates every slot at startup. Failures are logged and the
    /// process stays up; affected endpoints fail per-request instead.
    pub async fn warmup(&self) {
        if let Err(e) = self.detector().await {
            warn!(error = %e, "detector warmup failed");
        }
        if let Err(e) = self.classifier().await {
            warn!(error = %e, "classifier warmup failed");
        }
    }
}

fn resolve<T>(
    slot: &Result<Arc<Mutex<T>>, String>,
    kind: ModelKind,
    loaded_now: bool,
) -> Result<Arc<Mutex<T>>, PipelineError> {
    match slot {
        Ok(handle) => Ok(handle.clone()),
        Err(reason) if loaded_now => Err(PipelineError::ModelLoad {
            kind,
            reason: reason.clone(),
        }),
        Err(reason) => Err(PipelineError::ModelUnavailable {
            kind,
            reason: reason.clone(),
        }),
    }
}
