//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use common::protocol::{ClickReq, ClickResp, StateMsg, StopResp};
use futures::{future, StreamExt};
use tokio_stream::wrappers::BroadcastStream;

use crate::{session::Controller, DetectError, EXPORT_FILENAME};

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = match &self {
            DetectError::ModelsNotReady => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::AlreadyRunning => StatusCode::CONFLICT,
            DetectError::CameraAccess(_)
            | DetectError::ModelLoad { .. }
            | DetectError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// The page with video, overlay, status line, results and controls.
pub async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

pub async fn state(Extension(controller): Extension<Arc<Controller>>) -> Json<StateMsg> {
    Json(controller.state_msg())
}

pub async fn start(
    Extension(controller): Extension<Arc<Controller>>,
) -> Result<Json<StateMsg>, DetectError> {
    controller.start().await?;
    Ok(Json(controller.state_msg()))
}

pub async fn stop(Extension(controller): Extension<Arc<Controller>>) -> Json<StopResp> {
    Json(controller.stop().await)
}

pub async fn click(
    Extension(controller): Extension<Arc<Controller>>,
    Json(click): Json<ClickReq>,
) -> Json<ClickResp> {
    Json(controller.click(&click))
}

/// Most recent overlay as PNG, `204 No Content` before the first render.
pub async fn overlay_png(Extension(controller): Extension<Arc<Controller>>) -> Response {
    match controller.overlay_png() {
        Some(png) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            png,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Camera video as MJPEG stream. Ends when the session stops.
pub async fn video(Extension(controller): Extension<Arc<Controller>>) -> Response {
    let Some(rx) = controller.video_receiver().await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no video session").into_response();
    };
    log::info!("Video stream requested");

    // A lagging listener skips frames instead of ending the stream
    let stream = BroadcastStream::new(rx)
        .filter_map(|item| future::ready(item.ok()))
        .map(Ok::<_, Infallible>);

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body).into_response()
}

/// Download the offered result of the last session. The offer is consumed.
pub async fn export(Extension(controller): Extension<Arc<Controller>>) -> Response {
    match controller.take_export() {
        Some(text) => {
            log::info!("Exporting last detection result");
            let disposition = format!("attachment; filename=\"{EXPORT_FILENAME}\"");
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_owned()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                text,
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "no result to export").into_response(),
    }
}

/// Decline the export offer.
pub async fn dismiss_export(Extension(controller): Extension<Arc<Controller>>) -> StatusCode {
    match controller.dismiss_export() {
        true => StatusCode::NO_CONTENT,
        false => StatusCode::NOT_FOUND,
    }
}
