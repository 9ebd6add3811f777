//! Webcam face analysis and object detection, served to the browser.
use std::time::Duration;

pub mod endpoints;
pub mod error;
pub mod interaction;
pub mod meter;
pub mod models;
pub mod nn;
pub mod render;
pub mod sensors;
pub mod session;
pub mod utils;

pub use error::DetectError;

/// Period of the detection loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Resolution requested from the camera. The device may negotiate a different one.
pub const PREFERRED_RESOLUTION: (u32, u32) = (640, 480);

/// File name of the exported last detection result.
pub const EXPORT_FILENAME: &str = "last-detection-result.txt";
