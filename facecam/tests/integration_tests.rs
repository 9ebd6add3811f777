use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use common::{
    detection::{BBox, DetectedObject, Expressions, FaceAnnotation, Gender},
    protocol::ClickReq,
};
use facecam::{
    nn::{FaceAnalyzer, ObjectDetector},
    render::Renderer,
    sensors::{CameraProvider, CaptureRequest, Frame, FrameSource},
    session::{Controller, Detectors, STATUS_READY, STATUS_STARTING, STATUS_STOPPED},
    DetectError,
};
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn test_jpeg() -> Bytes {
    let image = RgbImage::from_pixel(WIDTH, HEIGHT, image::Rgb([90, 90, 90]));
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, 80)
        .encode(image.as_raw(), WIDTH, HEIGHT, ColorType::Rgb8)
        .unwrap();
    Bytes::from(buf.into_inner())
}

struct StillCamera {
    jpeg: Bytes,
    stops: Arc<AtomicUsize>,
}

impl FrameSource for StillCamera {
    fn capture(&mut self) -> Result<Frame, DetectError> {
        std::thread::sleep(Duration::from_millis(20));
        Ok(Frame::new(self.jpeg.clone(), WIDTH, HEIGHT))
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct StillCameraProvider {
    opens: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl CameraProvider for StillCameraProvider {
    fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn FrameSource>, DetectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StillCamera {
            jpeg: test_jpeg(),
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Delivers the first frame, then fails every capture as if unplugged.
struct UnpluggedCamera {
    first_frame: Option<Bytes>,
}

impl FrameSource for UnpluggedCamera {
    fn capture(&mut self) -> Result<Frame, DetectError> {
        match self.first_frame.take() {
            Some(jpeg) => Ok(Frame::new(jpeg, WIDTH, HEIGHT)),
            None => {
                std::thread::sleep(Duration::from_millis(5));
                Err(DetectError::CameraAccess("device unplugged".into()))
            }
        }
    }

    fn stop(&mut self) {}
}

struct UnpluggedCameraProvider;

impl CameraProvider for UnpluggedCameraProvider {
    fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn FrameSource>, DetectError> {
        Ok(Box::new(UnpluggedCamera {
            first_frame: Some(test_jpeg()),
        }))
    }
}

struct DeniedCameraProvider;

impl CameraProvider for DeniedCameraProvider {
    fn open(&self, _request: &CaptureRequest) -> Result<Box<dyn FrameSource>, DetectError> {
        Err(DetectError::CameraAccess("permission denied".into()))
    }
}

struct FixedFaces {
    faces: Vec<FaceAnnotation>,
    delay: Duration,
}

impl FaceAnalyzer for FixedFaces {
    fn analyze(&self, _frame: &RgbImage) -> Result<Vec<FaceAnnotation>, DetectError> {
        std::thread::sleep(self.delay);
        Ok(self.faces.clone())
    }
}

/// Fails on the first frame and finds the given faces on every later one.
struct FailsOnceFaces {
    faces: Vec<FaceAnnotation>,
    calls: AtomicUsize,
}

impl FaceAnalyzer for FailsOnceFaces {
    fn analyze(&self, _frame: &RgbImage) -> Result<Vec<FaceAnnotation>, DetectError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(DetectError::inference("landmark network returned garbage")),
            _ => Ok(self.faces.clone()),
        }
    }
}

struct FixedObjects(Vec<DetectedObject>);

impl ObjectDetector for FixedObjects {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<DetectedObject>, DetectError> {
        Ok(self.0.clone())
    }
}

fn happy_male(bbox: BBox) -> FaceAnnotation {
    FaceAnnotation {
        bbox,
        age: 23.4,
        gender: Gender::Male,
        gender_probability: 0.9,
        expressions: Expressions::from_scores(&[0.1, 0.8, 0.0, 0.0, 0.0, 0.0, 0.1]),
        landmarks: vec![],
    }
}

fn cup() -> DetectedObject {
    DetectedObject {
        class: "cup".into(),
        score: 0.876,
        bbox: BBox::new(40.0, 20.0, 10.0, 10.0),
    }
}

fn detectors(faces: Vec<FaceAnnotation>, objects: Vec<DetectedObject>, delay: Duration) -> Detectors {
    Detectors {
        faces: Arc::new(FixedFaces { faces, delay }),
        objects: Arc::new(FixedObjects(objects)),
    }
}

fn controller_with(provider: Arc<dyn CameraProvider>, detectors: Option<Detectors>) -> Controller {
    let controller = Controller::new(provider, CaptureRequest::new("/dev/video0"), Renderer::new(None));
    if let Some(detectors) = detectors {
        controller.models_loaded(Ok(detectors));
    }
    controller
}

async fn wait_for_ticks(controller: &Controller, ticks: u64) {
    for _ in 0..100 {
        if controller.state_msg().ticks >= ticks {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no tick within 5s");
}

#[tokio::test]
async fn status_reports_counts_of_last_tick() {
    let provider = Arc::new(StillCameraProvider::default());
    let controller = controller_with(
        provider.clone(),
        Some(detectors(
            vec![
                happy_male(BBox::new(8.0, 8.0, 20.0, 20.0)),
                happy_male(BBox::new(30.0, 8.0, 10.0, 10.0)),
            ],
            vec![cup()],
            Duration::ZERO,
        )),
    );

    controller.start().await.unwrap();
    let state = controller.state_msg();
    assert!(state.session_active);
    assert!(!state.start_enabled);
    assert!(state.stop_enabled);
    assert_eq!((state.overlay_width, state.overlay_height), (WIDTH, HEIGHT));

    wait_for_ticks(&controller, 1).await;
    let state = controller.state_msg();
    assert_eq!(state.status, "2 face(s), 1 object(s) detected");
    assert_eq!(
        state.results,
        "Face: male (23 yrs), happy\nFace: male (23 yrs), happy\nObject: cup (88%)\n"
    );
    assert_eq!(state.face_boxes.len(), 2);
    assert!(controller.overlay_png().is_some());

    controller.stop().await;
    assert_eq!(provider.opens.load(Ordering::SeqCst), 1);
    assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_scene_still_offers_export() {
    let controller = controller_with(
        Arc::new(StillCameraProvider::default()),
        Some(detectors(vec![], vec![], Duration::ZERO)),
    );

    controller.start().await.unwrap();
    wait_for_ticks(&controller, 1).await;
    let state = controller.state_msg();
    assert_eq!(state.status, "0 face(s), 0 object(s) detected");
    assert_eq!(state.results, "");

    let resp = controller.stop().await;
    assert!(resp.export_available);
    let text = controller.take_export().unwrap();
    assert!(text.starts_with('[') && text.ends_with("]\n"), "{text:?}");
}

#[tokio::test]
async fn clicking_a_face_highlights_only_that_face() {
    let left = BBox::new(4.0, 8.0, 20.0, 20.0);
    let right = BBox::new(36.0, 8.0, 20.0, 20.0);
    let controller = controller_with(
        Arc::new(StillCameraProvider::default()),
        Some(detectors(
            vec![happy_male(left), happy_male(right)],
            vec![],
            Duration::ZERO,
        )),
    );
    controller.start().await.unwrap();
    wait_for_ticks(&controller, 1).await;

    let outside = controller.click(&ClickReq {
        client_x: 130.0,
        client_y: 140.0,
        rect_left: 100.0,
        rect_top: 100.0,
    });
    assert!(!outside.hit);
    assert_eq!(outside.message, None);

    let inside = controller.click(&ClickReq {
        client_x: 145.0,
        client_y: 115.0,
        rect_left: 100.0,
        rect_top: 100.0,
    });
    assert!(inside.hit);
    assert_eq!(inside.face_box, Some(right));
    assert_eq!(inside.message.as_deref(), Some("Face clicked!"));

    let png = controller.overlay_png().unwrap();
    let overlay = image::load_from_memory(&png).unwrap().to_rgba8();
    let red = [255, 0, 0, 255];
    assert_eq!(overlay.get_pixel(36, 8).0, red);
    assert_ne!(overlay.get_pixel(4, 8).0, red);
    assert_ne!(overlay.get_pixel(24, 28).0, red);

    controller.stop().await;
}

#[tokio::test]
async fn stop_offers_last_result_exactly_once() {
    let controller = controller_with(
        Arc::new(StillCameraProvider::default()),
        Some(detectors(
            vec![happy_male(BBox::new(8.0, 8.0, 20.0, 20.0))],
            vec![cup()],
            Duration::ZERO,
        )),
    );
    controller.start().await.unwrap();
    assert!(controller.video_receiver().await.is_some());
    wait_for_ticks(&controller, 1).await;

    let resp = controller.stop().await;
    assert_eq!(resp.status, STATUS_STOPPED);
    assert!(resp.export_available);

    let state = controller.state_msg();
    assert_eq!(state.status, STATUS_STOPPED);
    assert!(state.face_boxes.is_empty());
    assert!(state.start_enabled);
    assert!(!state.stop_enabled);
    assert!(controller.video_receiver().await.is_none());

    let text = controller.take_export().unwrap();
    let (timestamp, summary) = text.split_once('\n').unwrap();
    assert_eq!(timestamp.len(), "[12:34:56]".len());
    assert!(timestamp.starts_with('[') && timestamp.ends_with(']'));
    assert_eq!(summary, "Face: male (23 yrs), happy\nObject: cup (88%)\n");
    assert_eq!(controller.take_export(), None);

    // The result was cleared, a second stop has nothing to offer
    assert!(!controller.stop().await.export_available);
}

#[tokio::test]
async fn stop_without_session_only_updates_status() {
    let provider = Arc::new(StillCameraProvider::default());
    let controller = controller_with(
        provider.clone(),
        Some(detectors(vec![], vec![], Duration::ZERO)),
    );
    assert_eq!(controller.state_msg().status, STATUS_READY);

    let resp = controller.stop().await;
    assert_eq!(resp.status, STATUS_STOPPED);
    assert!(!resp.export_available);
    assert_eq!(provider.opens.load(Ordering::SeqCst), 0);
    assert_eq!(provider.stops.load(Ordering::SeqCst), 0);
    assert!(!controller.dismiss_export());
}

#[tokio::test]
async fn stop_discards_tick_in_flight() {
    let controller = controller_with(
        Arc::new(StillCameraProvider::default()),
        Some(detectors(
            vec![happy_male(BBox::new(8.0, 8.0, 20.0, 20.0))],
            vec![],
            Duration::from_millis(1500),
        )),
    );
    controller.start().await.unwrap();

    // First tick starts after one interval and is still running here
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let resp = controller.stop().await;
    assert!(!resp.export_available);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let state = controller.state_msg();
    assert_eq!(state.ticks, 0);
    assert_eq!(state.status, STATUS_STOPPED);
    assert!(state.face_boxes.is_empty());
    assert_eq!(state.results, "");
}

#[tokio::test]
async fn start_requires_loaded_models() {
    let controller = controller_with(Arc::new(StillCameraProvider::default()), None);
    assert!(!controller.state_msg().start_enabled);
    assert!(matches!(
        controller.start().await,
        Err(DetectError::ModelsNotReady)
    ));

    controller.models_loaded(Err(DetectError::model_load("age_gender", "corrupt")));
    assert!(controller.state_msg().status.contains("age_gender"));
    assert!(matches!(
        controller.start().await,
        Err(DetectError::ModelsNotReady)
    ));
}

#[tokio::test]
async fn second_start_is_rejected() {
    let provider = Arc::new(StillCameraProvider::default());
    let controller = controller_with(
        provider.clone(),
        Some(detectors(vec![], vec![], Duration::ZERO)),
    );

    controller.start().await.unwrap();
    assert!(matches!(
        controller.start().await,
        Err(DetectError::AlreadyRunning)
    ));
    assert_eq!(provider.opens.load(Ordering::SeqCst), 1);

    controller.stop().await;
    controller.start().await.unwrap();
    assert_eq!(provider.opens.load(Ordering::SeqCst), 2);
    controller.stop().await;
}

#[tokio::test]
async fn denied_camera_returns_to_idle() {
    let controller = controller_with(
        Arc::new(DeniedCameraProvider),
        Some(detectors(vec![], vec![], Duration::ZERO)),
    );

    let result = controller.start().await;
    assert!(matches!(result, Err(DetectError::CameraAccess(_))));

    let state = controller.state_msg();
    assert!(state.status.contains("permission denied"));
    assert!(!state.session_active);
    assert!(state.start_enabled);
    assert!(!state.stop_enabled);
}

#[tokio::test]
async fn failed_tick_keeps_previous_state_and_loop_continues() {
    let controller = controller_with(
        Arc::new(StillCameraProvider::default()),
        Some(Detectors {
            faces: Arc::new(FailsOnceFaces {
                faces: vec![happy_male(BBox::new(8.0, 8.0, 20.0, 20.0))],
                calls: AtomicUsize::new(0),
            }),
            objects: Arc::new(FixedObjects(vec![])),
        }),
    );
    controller.start().await.unwrap();
    assert_eq!(controller.state_msg().status, STATUS_STARTING);

    // The first tick ran and failed
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let state = controller.state_msg();
    assert_eq!(state.ticks, 0);
    assert_eq!(state.status, STATUS_STARTING);
    assert!(state.face_boxes.is_empty());
    assert!(state.session_active);

    wait_for_ticks(&controller, 1).await;
    let state = controller.state_msg();
    assert_eq!(state.status, "1 face(s), 0 object(s) detected");
    assert_eq!(state.face_boxes.len(), 1);

    controller.stop().await;
}

#[tokio::test]
async fn lost_camera_shows_in_status() {
    let controller = controller_with(
        Arc::new(UnpluggedCameraProvider),
        Some(detectors(vec![], vec![], Duration::ZERO)),
    );
    controller.start().await.unwrap();

    let mut status = String::new();
    for _ in 0..100 {
        status = controller.state_msg().status;
        if status.starts_with("Camera error") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(status.contains("camera stopped delivering frames"), "{status:?}");
    assert!(controller.state_msg().stop_enabled);

    assert_eq!(controller.stop().await.status, STATUS_STOPPED);
}
