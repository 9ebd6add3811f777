//! Detection session: capture, the periodic detection loop, click handling and teardown.
//!
//! A single [`Controller`] owns all session state. The page talks to it through the endpoints.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use common::{
    detection::{DetectedObject, FaceAnnotation, FaceBox},
    protocol::{ClickReq, ClickResp, StateMsg, StopResp},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    interaction::{hit_test, to_overlay_coords, FACE_CLICKED},
    meter::METER,
    nn::{FaceAnalyzer, ObjectDetector},
    render::{local_time_of_day, status_line, summarize, timestamped, Overlay, Renderer},
    sensors::{CameraProvider, CaptureRequest, Frame, VideoCapture},
    DetectError, TICK_INTERVAL,
};

pub const STATUS_LOADING: &str = "Loading models…";
pub const STATUS_READY: &str = "Models loaded. Click “Start Detection” to begin.";
pub const STATUS_STARTING: &str = "Starting video…";
pub const STATUS_STOPPED: &str = "Detection stopped";

/// The two inference capabilities a tick runs.
#[derive(Clone)]
pub struct Detectors {
    pub faces: Arc<dyn FaceAnalyzer>,
    pub objects: Arc<dyn ObjectDetector>,
}

enum ModelState {
    Loading,
    Ready(Detectors),
    Failed,
}

/// Everything one tick produced.
pub struct TickOutput {
    pub faces: Vec<FaceAnnotation>,
    pub objects: Vec<DetectedObject>,
    pub overlay: Overlay,
    pub overlay_png: Bytes,
}

/// Page texts and the results of the most recent tick.
#[derive(Default)]
pub struct TickState {
    pub status: String,
    pub results: String,
    /// Face boxes of the most recently rendered tick, used for hit-testing.
    pub face_boxes: Vec<FaceBox>,
    /// Timestamped summary of the most recent tick.
    pub last_result: String,
    pub ticks: u64,
    pub session_active: bool,
    overlay: Option<Overlay>,
    overlay_png: Option<Bytes>,
}

impl TickState {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_owned(),
            ..Default::default()
        }
    }

    /// Replace the results of the previous tick with `output`.
    pub fn commit(&mut self, output: TickOutput, time_of_day: &str) {
        let summary = summarize(&output.faces, &output.objects);

        self.face_boxes = output.faces.iter().map(|face| face.bbox).collect();
        self.status = status_line(output.faces.len(), output.objects.len());
        self.last_result = timestamped(&summary, time_of_day);
        self.results = summary;
        self.overlay = Some(output.overlay);
        self.overlay_png = Some(output.overlay_png);
        self.ticks += 1;
    }

    /// Start over with a cleared overlay of the given size.
    fn reset(&mut self, dimensions: (u32, u32)) {
        self.face_boxes.clear();
        self.results.clear();
        self.last_result.clear();
        self.ticks = 0;
        self.overlay = Some(Overlay::new(dimensions.0, dimensions.1));
        self.overlay_png = None;
    }
}

fn camera_error_status(e: &DetectError) -> String {
    format!("Camera error: {e}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DetectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Session {
    capture: Option<VideoCapture>,
    detection: Option<DetectionTask>,
}

/// Owner of the models, the camera session and the results shown on the page.
pub struct Controller {
    camera_provider: Arc<dyn CameraProvider>,
    capture_request: CaptureRequest,
    renderer: Arc<Renderer>,
    models: Mutex<ModelState>,
    state: Arc<Mutex<TickState>>,
    session: tokio::sync::Mutex<Session>,
    pending_export: Mutex<Option<String>>,
}

impl Controller {
    pub fn new(
        camera_provider: Arc<dyn CameraProvider>,
        capture_request: CaptureRequest,
        renderer: Renderer,
    ) -> Self {
        Self {
            camera_provider,
            capture_request,
            renderer: Arc::new(renderer),
            models: Mutex::new(ModelState::Loading),
            state: Arc::new(Mutex::new(TickState::new(STATUS_LOADING))),
            session: tokio::sync::Mutex::new(Session::default()),
            pending_export: Mutex::new(None),
        }
    }

    /// Report the outcome of model loading. Detection can only start after a successful load.
    pub fn models_loaded(&self, result: Result<Detectors, DetectError>) {
        let status = match result {
            Ok(detectors) => {
                log::info!("Models loaded");
                *lock(&self.models) = ModelState::Ready(detectors);
                STATUS_READY.to_owned()
            }
            Err(e) => {
                log::error!("Loading models failed: {e}");
                *lock(&self.models) = ModelState::Failed;
                format!("Failed to load models: {e}")
            }
        };
        lock(&self.state).status = status;
    }

    fn ready_detectors(&self) -> Result<Detectors, DetectError> {
        match &*lock(&self.models) {
            ModelState::Ready(detectors) => Ok(detectors.clone()),
            ModelState::Loading | ModelState::Failed => Err(DetectError::ModelsNotReady),
        }
    }

    /// Start the camera and the detection loop.
    pub async fn start(&self) -> Result<(), DetectError> {
        let detectors = self.ready_detectors()?;

        let mut session = self.session.lock().await;
        if session.detection.is_some() {
            return Err(DetectError::AlreadyRunning);
        }
        *lock(&self.pending_export) = None;
        {
            let mut state = lock(&self.state);
            state.status = STATUS_STARTING.to_owned();
            state.session_active = true;
        }

        let capture = match VideoCapture::start(
            Arc::clone(&self.camera_provider),
            self.capture_request.clone(),
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                log::error!("Starting video failed: {e}");
                let mut state = lock(&self.state);
                state.status = camera_error_status(&e);
                state.session_active = false;
                return Err(e);
            }
        };
        lock(&self.state).reset(capture.dimensions());

        let cancel = CancellationToken::new();
        let ctx = TickContext {
            detectors,
            renderer: Arc::clone(&self.renderer),
            frames: capture.frames(),
            state: Arc::clone(&self.state),
        };
        let handle = tokio::spawn(detection_loop(ctx, cancel.clone()));

        session.capture = Some(capture);
        session.detection = Some(DetectionTask { cancel, handle });
        log::info!("Detection started");

        Ok(())
    }

    /// Stop detection and the camera. Safe to call without a running session.
    ///
    /// A non-blank last result becomes a pending export, see [`Controller::take_export`].
    pub async fn stop(&self) -> StopResp {
        let mut session = self.session.lock().await;

        if let Some(detection) = session.detection.take() {
            detection.cancel.cancel();
            // Wait for the loop so no tick writes results after teardown
            if let Err(e) = detection.handle.await {
                log::warn!("Detection loop ended abnormally: {e}");
            }
        }
        lock(&self.state).status = STATUS_STOPPED.to_owned();

        if let Some(capture) = session.capture.take() {
            capture.stop().await;
        }

        let last_result = {
            let mut state = lock(&self.state);
            state.session_active = false;
            state.face_boxes.clear();
            std::mem::take(&mut state.last_result)
        };

        let export_available = !last_result.trim().is_empty();
        if export_available {
            *lock(&self.pending_export) = Some(last_result);
        }
        log::info!("Detection stopped (export available: {export_available})");

        StopResp {
            status: STATUS_STOPPED.to_owned(),
            export_available,
        }
    }

    /// Highlight the first face box under the click.
    pub fn click(&self, click: &ClickReq) -> ClickResp {
        let (x, y) = to_overlay_coords(click);

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let Some(index) = hit_test(&state.face_boxes, x, y) else {
            return ClickResp::miss();
        };
        let face_box = state.face_boxes[index];

        if let Some(overlay) = state.overlay.as_mut() {
            self.renderer.highlight(overlay, &face_box);
            match overlay.encode_png() {
                Ok(png) => state.overlay_png = Some(Bytes::from(png)),
                Err(e) => log::warn!("Failed to encode highlighted overlay: {e}"),
            }
        }
        log::info!("Face clicked at ({x:.0}, {y:.0})");

        ClickResp::hit(face_box, FACE_CLICKED)
    }

    /// Snapshot of the page state.
    pub fn state_msg(&self) -> StateMsg {
        let models_ready = matches!(*lock(&self.models), ModelState::Ready(_));
        let state = lock(&self.state);
        let (overlay_width, overlay_height) = state
            .overlay
            .as_ref()
            .map_or((0, 0), |overlay| overlay.dimensions());

        StateMsg {
            status: state.status.clone(),
            results: state.results.clone(),
            start_enabled: models_ready && !state.session_active,
            stop_enabled: state.session_active,
            session_active: state.session_active,
            ticks: state.ticks,
            overlay_width,
            overlay_height,
            face_boxes: state.face_boxes.clone(),
        }
    }

    /// PNG of the most recently rendered overlay.
    pub fn overlay_png(&self) -> Option<Bytes> {
        lock(&self.state).overlay_png.clone()
    }

    /// Subscribe to the video of the running session.
    pub async fn video_receiver(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.session
            .lock()
            .await
            .capture
            .as_ref()
            .map(|capture| capture.subscribe_video())
    }

    /// Consume the pending export offer.
    pub fn take_export(&self) -> Option<String> {
        lock(&self.pending_export).take()
    }

    /// Decline the pending export offer. Returns whether there was one.
    pub fn dismiss_export(&self) -> bool {
        lock(&self.pending_export).take().is_some()
    }
}

struct TickContext {
    detectors: Detectors,
    renderer: Arc<Renderer>,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    state: Arc<Mutex<TickState>>,
}

/// Run a tick every [`TICK_INTERVAL`] until cancelled.
///
/// The next tick is only awaited after the current one finished, so ticks never overlap. A failed
/// tick leaves the previous results in place.
async fn detection_loop(ctx: TickContext, cancel: CancellationToken) {
    let mut tick_interval = interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick_interval.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = run_tick(&ctx) => result,
        };

        match result {
            Ok(output) => {
                METER.tick_detection();
                log::debug!(
                    "Tick: {} face(s), {} object(s)",
                    output.faces.len(),
                    output.objects.len()
                );
                lock(&ctx.state).commit(output, &local_time_of_day());
            }
            Err(e @ DetectError::CameraAccess(_)) => {
                METER.tick_failed();
                log::error!("Detection tick without camera: {e}");
                lock(&ctx.state).status = camera_error_status(&e);
            }
            Err(e) => {
                METER.tick_failed();
                log::warn!("Detection tick failed: {e}");
            }
        }
    }

    log::debug!("Detection loop ended");
}

async fn run_tick(ctx: &TickContext) -> Result<TickOutput, DetectError> {
    // The capture task publishes `None` once it gave up on the camera
    let frame = ctx
        .frames
        .borrow()
        .clone()
        .ok_or_else(|| DetectError::CameraAccess("camera stopped delivering frames".into()))?;
    let detectors = ctx.detectors.clone();
    let renderer = Arc::clone(&ctx.renderer);

    tokio::task::spawn_blocking(move || analyze_frame(&frame, &detectors, &renderer))
        .await
        .map_err(DetectError::inference)?
}

/// Decode a frame, run face analysis then object detection and render the results.
pub fn analyze_frame(
    frame: &Frame,
    detectors: &Detectors,
    renderer: &Renderer,
) -> Result<TickOutput, DetectError> {
    let image = frame.decode()?;

    let faces = detectors.faces.analyze(&image)?;
    let objects = detectors.objects.detect(&image)?;

    let overlay = renderer.render(image.dimensions(), &faces, &objects);
    let overlay_png = overlay.encode_png().map_err(DetectError::inference)?;

    Ok(TickOutput {
        faces,
        objects,
        overlay,
        overlay_png: Bytes::from(overlay_png),
    })
}
