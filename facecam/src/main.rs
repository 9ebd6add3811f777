//! Facecam binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use clap::Parser;
use env_logger::TimestampPrecision;
use facecam::{
    endpoints::{
        click, dismiss_export, export, healthcheck, index, overlay_png, start, state, stop, video,
    },
    meter::spawn_meter_logger,
    models::{ModelSet, ModelSource, Thresholds},
    render::Renderer,
    sensors::{CaptureRequest, V4lCameraProvider},
    session::{Controller, Detectors},
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the page on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Base URL to download the model files from
    #[clap(long)]
    model_base_url: Option<String>,

    /// Directory with the model files, used without a base URL
    #[clap(long, default_value = "models")]
    model_dir: PathBuf,

    /// Download cache for models fetched from the base URL
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// TTF font for labels, a system font is used otherwise
    #[clap(long)]
    font: Option<PathBuf>,

    #[clap(long, default_value_t = 0.5)]
    face_min_confidence: f32,

    #[clap(long, default_value_t = 0.3)]
    face_max_iou: f32,

    #[clap(long, default_value_t = 0.5)]
    object_min_score: f32,

    #[clap(long, default_value_t = 0.5)]
    object_max_iou: f32,

    #[clap(long, default_value_t = 20)]
    object_max_detections: usize,
}

impl Args {
    fn model_source(&self) -> Result<ModelSource> {
        match &self.model_base_url {
            Some(base_url) => {
                let cache_dir = match &self.cache_dir {
                    Some(dir) => dir.clone(),
                    None => ModelSource::default_cache_dir()
                        .ok_or_else(|| anyhow::anyhow!("no cache directory, pass --cache-dir"))?,
                };
                Ok(ModelSource::Remote {
                    base_url: base_url.clone(),
                    cache_dir,
                })
            }
            None => Ok(ModelSource::Local(self.model_dir.clone())),
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            face_min_confidence: self.face_min_confidence,
            face_max_iou: self.face_max_iou,
            object_min_score: self.object_min_score,
            object_max_iou: self.object_max_iou,
            object_max_detections: self.object_max_detections,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let renderer = match &args.font {
        Some(path) => Renderer::from_font_file(path)?,
        None => Renderer::with_system_font(),
    };
    let controller = Arc::new(Controller::new(
        Arc::new(V4lCameraProvider),
        CaptureRequest::new(&args.device),
        renderer,
    ));

    // Load models in the background, the page shows the loading status meanwhile
    {
        let controller = Arc::clone(&controller);
        let source = args.model_source()?;
        let thresholds = args.thresholds();
        tokio::spawn(async move {
            let result = ModelSet::load(&source, &thresholds).await;
            controller.models_loaded(result.map(Detectors::from));
        });
    }

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/state", get(state))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/click", post(click))
        .route("/overlay.png", get(overlay_png))
        .route("/video", get(video))
        .route("/export", get(export).delete(dismiss_export))
        .layer(Extension(controller));

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
