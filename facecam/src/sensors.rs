//! Sensors module.
//!
//! Opens the camera, keeps the latest frame for the detection loop and fans every frame out to
//! the video streams of the page.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use image::RgbImage;
use rscam::{Camera, Config};
use simple_error::simple_error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{meter::METER, DetectError};

/// Number of video stream items buffered per listener.
const VIDEO_CHANNEL_CAPACITY: usize = 4;

/// Consecutive capture failures after which the camera is considered gone.
const MAX_CAPTURE_FAILURES: u32 = 50;

/// A single JPEG-compressed camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(jpeg: Bytes, width: u32, height: u32) -> Self {
        Self {
            jpeg,
            width,
            height,
        }
    }

    /// Decompress the frame to RGB.
    pub fn decode(&self) -> Result<RgbImage, DetectError> {
        turbojpeg::decompress_image(&self.jpeg).map_err(DetectError::inference)
    }

    /// Wrap the frame as one part of a `multipart/x-mixed-replace` stream.
    pub fn as_jpeg_stream_item(&self) -> Bytes {
        Bytes::copy_from_slice(
            &[
                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
                &self.jpeg[..],
                "\r\n\r\n".as_bytes(),
            ]
            .concat(),
        )
    }
}

/// What to ask the camera for.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub device: String,
    pub format: String,
    pub resolution: (u32, u32),
}

impl CaptureRequest {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_owned(),
            format: "MJPG".to_owned(),
            resolution: crate::PREFERRED_RESOLUTION,
        }
    }
}

/// An opened camera delivering JPEG frames.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame, DetectError>;

    /// Stop the device. Further captures fail.
    fn stop(&mut self);
}

/// Opens cameras.
pub trait CameraProvider: Send + Sync {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>, DetectError>;
}

/// Video4Linux cameras.
#[derive(Debug, Default)]
pub struct V4lCameraProvider;

impl CameraProvider for V4lCameraProvider {
    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn FrameSource>, DetectError> {
        let camera = open_v4l_camera(request)
            .map_err(|e| DetectError::CameraAccess(format!("{}: {e}", request.device)))?;
        Ok(Box::new(camera))
    }
}

struct V4lCamera {
    cam: Camera,
    running: bool,
}

impl FrameSource for V4lCamera {
    fn capture(&mut self) -> Result<Frame, DetectError> {
        if !self.running {
            return Err(DetectError::CameraAccess("camera stopped".into()));
        }
        let frame = self
            .cam
            .capture()
            .map_err(|e| DetectError::CameraAccess(e.to_string()))?;
        let (width, height) = frame.resolution;

        Ok(Frame::new(Bytes::copy_from_slice(&frame[..]), width, height))
    }

    fn stop(&mut self) {
        if self.running {
            if let Err(e) = self.cam.stop() {
                log::warn!("Failed to stop camera: {e}");
            }
            self.running = false;
        }
    }
}

fn open_v4l_camera(request: &CaptureRequest) -> Result<V4lCamera, common::Error> {
    let mut cam = Camera::new(&request.device)?;
    log_supported_formats(&cam, &request.format);
    let format = request.format.as_bytes();

    let resolution = get_closest_resolution(&cam, format, request.resolution)?;
    let frame_rate = get_max_frame_rate(&cam, format, resolution)?;

    log::info!(
        "Using camera {} at {}x{} (requested {}x{})",
        &request.device,
        resolution.0,
        resolution.1,
        request.resolution.0,
        request.resolution.1
    );

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format,
        ..Default::default()
    })?;

    Ok(V4lCamera { cam, running: true })
}

/// Get the supported resolution closest to the requested one in terms of number of pixels.
fn get_closest_resolution(
    cam: &Camera,
    format: &[u8],
    requested: (u32, u32),
) -> Result<(u32, u32), common::Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => {
            closest_resolution(&resolutions, requested)
        }
        rscam::ResolutionInfo::Stepwise { min, max, step: _ } => Some((
            requested.0.clamp(min.0, max.0),
            requested.1.clamp(min.1, max.1),
        )),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Pick the resolution whose pixel count is closest to the requested one.
pub fn closest_resolution(resolutions: &[(u32, u32)], requested: (u32, u32)) -> Option<(u32, u32)> {
    let requested_pixels = requested.0 as i64 * requested.1 as i64;
    resolutions
        .iter()
        .min_by_key(|res| (res.0 as i64 * res.1 as i64 - requested_pixels).abs())
        .copied()
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), common::Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            // Intervals are (numerator, denominator) seconds per frame
            .max_by(|a, b| (a.1 as f32 / a.0 as f32).total_cmp(&(b.1 as f32 / b.0 as f32)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, max: _, step: _ } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

/// A running camera with its capture task.
pub struct VideoCapture {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    video_tx: broadcast::Sender<Bytes>,
    dimensions: (u32, u32),
}

impl VideoCapture {
    /// Open the camera, capture a first frame to learn the negotiated resolution and keep
    /// capturing in the background.
    pub async fn start(
        provider: Arc<dyn CameraProvider>,
        request: CaptureRequest,
    ) -> Result<Self, DetectError> {
        let (source, first_frame, dimensions) = tokio::task::spawn_blocking(move || {
            let mut source = provider.open(&request)?;
            let first_frame = match source.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    source.stop();
                    return Err(e);
                }
            };
            let decoded = match first_frame.decode() {
                Ok(decoded) => decoded,
                Err(e) => {
                    source.stop();
                    return Err(DetectError::CameraAccess(format!(
                        "undecodable first frame: {e}"
                    )));
                }
            };
            Ok((source, first_frame, decoded.dimensions()))
        })
        .await
        .map_err(|e| DetectError::CameraAccess(e.to_string()))??;

        log::info!("Video started at {}x{}", dimensions.0, dimensions.1);

        let (video_tx, _) = broadcast::channel(VIDEO_CHANNEL_CAPACITY);
        let (frames_tx, frames) = watch::channel(Some(Arc::new(first_frame)));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            let video_tx = video_tx.clone();
            tokio::task::spawn_blocking(move || capture_loop(source, frames_tx, video_tx, cancel))
        };

        Ok(Self {
            cancel,
            handle,
            frames,
            video_tx,
            dimensions,
        })
    }

    /// Decoded dimensions of the first frame.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    /// Receiver of the most recent frame. Holds `None` once the camera stopped.
    pub fn frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frames.clone()
    }

    /// Subscribe to the multipart video stream items.
    pub fn subscribe_video(&self) -> broadcast::Receiver<Bytes> {
        self.video_tx.subscribe()
    }

    /// Stop the camera and wait for the capture task to finish. Video streams end afterwards.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("Capture task ended abnormally: {e}");
        }
        log::info!("Video stopped");
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    frames_tx: watch::Sender<Option<Arc<Frame>>>,
    video_tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut failures = 0;

    while !cancel.is_cancelled() {
        match source.capture() {
            Ok(frame) => {
                failures = 0;
                log::debug!("Captured frame ({} bytes)", frame.jpeg.len());
                METER.tick_video_frame();
                // No listener is fine, the page might not show the video yet
                video_tx.send(frame.as_jpeg_stream_item()).ok();
                frames_tx.send_replace(Some(Arc::new(frame)));
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CAPTURE_FAILURES {
                    log::error!("Giving up on camera after {failures} failed captures: {e}");
                    break;
                }
                log::warn!("Unable to capture frame, trying again... ({e})");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    source.stop();
    frames_tx.send_replace(None);
}
