use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: &'static str, reason: String },
    #[error("camera access failed: {0}")]
    CameraAccess(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("models are not loaded")]
    ModelsNotReady,
    #[error("detection is already running")]
    AlreadyRunning,
}

impl DetectError {
    pub fn model_load(model: &'static str, reason: impl ToString) -> Self {
        Self::ModelLoad {
            model,
            reason: reason.to_string(),
        }
    }

    pub fn inference(reason: impl ToString) -> Self {
        Self::Inference(reason.to_string())
    }
}
