//! Loading of the five networks before any detection can run.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use reqwest::Client;

use crate::{
    nn::{AgeGenderModel, ExpressionModel, FaceNets, LandmarkModel, SsdModel, UltrafaceModel},
    session::Detectors,
    utils::{download_file, join_url},
    DetectError,
};

/// The networks the detection loop needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModelKind {
    FaceDetector,
    FaceLandmark68,
    AgeGender,
    FaceExpression,
    ObjectDetector,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::FaceDetector,
        ModelKind::FaceLandmark68,
        ModelKind::AgeGender,
        ModelKind::FaceExpression,
        ModelKind::ObjectDetector,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::FaceDetector => "face_detector",
            ModelKind::FaceLandmark68 => "face_landmark_68",
            ModelKind::AgeGender => "age_gender",
            ModelKind::FaceExpression => "face_expression",
            ModelKind::ObjectDetector => "object_detector",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.name())
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the model files come from.
#[derive(Clone, Debug)]
pub enum ModelSource {
    /// Files served below a base URL, downloaded once into a cache directory.
    Remote { base_url: String, cache_dir: PathBuf },
    /// Files in a local directory.
    Local(PathBuf),
}

impl ModelSource {
    /// Platform cache directory for downloaded models.
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("facecam").join("models"))
    }
}

/// Detection thresholds of the face detector and the object detector.
#[derive(Clone, Debug)]
pub struct Thresholds {
    pub face_min_confidence: f32,
    pub face_max_iou: f32,
    pub object_min_score: f32,
    pub object_max_iou: f32,
    pub object_max_detections: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            face_min_confidence: 0.5,
            face_max_iou: 0.3,
            object_min_score: 0.5,
            object_max_iou: 0.5,
            object_max_detections: 20,
        }
    }
}

/// Make sure all model files are present locally and return the directory holding them.
pub async fn resolve_model_dir(source: &ModelSource) -> Result<PathBuf, DetectError> {
    match source {
        ModelSource::Local(dir) => {
            for kind in ModelKind::ALL {
                let path = dir.join(kind.file_name());
                if !path.is_file() {
                    return Err(DetectError::model_load(
                        kind.name(),
                        format!("{} not found", path.display()),
                    ));
                }
            }
            Ok(dir.clone())
        }
        ModelSource::Remote {
            base_url,
            cache_dir,
        } => {
            std::fs::create_dir_all(cache_dir).map_err(|e| {
                DetectError::model_load(ModelKind::ALL[0].name(), format!("cache directory: {e}"))
            })?;

            let client = Client::new();
            for kind in ModelKind::ALL {
                let path = cache_dir.join(kind.file_name());
                if path.is_file() {
                    log::debug!("Using cached model {}", path.display());
                    continue;
                }

                let url = join_url(base_url, &kind.file_name());
                log::info!("Downloading model {kind} from {url}");
                download_file(&client, &url, &path)
                    .await
                    .map_err(|e| DetectError::model_load(kind.name(), e))?;
            }
            Ok(cache_dir.clone())
        }
    }
}

/// All five networks, ready to run.
pub struct ModelSet {
    pub faces: FaceNets,
    pub objects: SsdModel,
}

impl ModelSet {
    /// Fetch and initialize all models. Fails on the first model that cannot be loaded.
    pub async fn load(source: &ModelSource, thresholds: &Thresholds) -> Result<Self, DetectError> {
        let dir = resolve_model_dir(source).await?;
        let thresholds = thresholds.clone();

        tokio::task::spawn_blocking(move || Self::from_dir(&dir, &thresholds))
            .await
            .map_err(|e| DetectError::model_load("all", e))?
    }

    /// Initialize all models from files in `dir`.
    pub fn from_dir(dir: &Path, thresholds: &Thresholds) -> Result<Self, DetectError> {
        let path = |kind: ModelKind| dir.join(kind.file_name());

        let detector = UltrafaceModel::new(
            &path(ModelKind::FaceDetector),
            thresholds.face_max_iou,
            thresholds.face_min_confidence,
        )
        .map_err(load_failed(ModelKind::FaceDetector))?;
        let landmarks = LandmarkModel::new(&path(ModelKind::FaceLandmark68))
            .map_err(load_failed(ModelKind::FaceLandmark68))?;
        let age_gender = AgeGenderModel::new(&path(ModelKind::AgeGender))
            .map_err(load_failed(ModelKind::AgeGender))?;
        let expression = ExpressionModel::new(&path(ModelKind::FaceExpression))
            .map_err(load_failed(ModelKind::FaceExpression))?;
        let objects = SsdModel::new(
            &path(ModelKind::ObjectDetector),
            thresholds.object_min_score,
            thresholds.object_max_iou,
            thresholds.object_max_detections,
        )
        .map_err(load_failed(ModelKind::ObjectDetector))?;

        Ok(Self {
            faces: FaceNets {
                detector,
                landmarks,
                age_gender,
                expression,
            },
            objects,
        })
    }
}

fn load_failed(kind: ModelKind) -> impl FnOnce(anyhow::Error) -> DetectError {
    move |e| DetectError::model_load(kind.name(), e)
}

impl From<ModelSet> for Detectors {
    fn from(models: ModelSet) -> Self {
        Detectors {
            faces: Arc::new(models.faces),
            objects: Arc::new(models.objects),
        }
    }
}
