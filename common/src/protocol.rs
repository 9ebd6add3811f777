//! Messages exchanged between the server and the page.
//!
use serde::{Deserialize, Serialize};

use crate::detection::FaceBox;

/// Snapshot of everything the page shows besides the video.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StateMsg {
    pub status: String,
    pub results: String,
    pub start_enabled: bool,
    pub stop_enabled: bool,
    pub session_active: bool,
    /// Number of completed ticks in the current session.
    pub ticks: u64,
    pub overlay_width: u32,
    pub overlay_height: u32,
    pub face_boxes: Vec<FaceBox>,
}

/// Pointer click on the overlay, in client coordinates plus the overlay's bounding rectangle.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClickReq {
    pub client_x: f32,
    pub client_y: f32,
    pub rect_left: f32,
    pub rect_top: f32,
}

/// Outcome of a click on the overlay.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClickResp {
    pub hit: bool,
    pub face_box: Option<FaceBox>,
    pub message: Option<String>,
}

impl ClickResp {
    pub fn miss() -> Self {
        Self {
            hit: false,
            face_box: None,
            message: None,
        }
    }

    pub fn hit(face_box: FaceBox, message: &str) -> Self {
        Self {
            hit: true,
            face_box: Some(face_box),
            message: Some(message.to_owned()),
        }
    }
}

/// Outcome of stopping a session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StopResp {
    pub status: String,
    /// Whether the last detection result can be downloaded as a text file.
    pub export_available: bool,
}
