//! Neural networks behind the face analysis and the object detection.
//!
//! All networks are ONNX files run with `tract`. Input and output layouts:
//!
//! | network           | input                         | outputs                                   |
//! |-------------------|-------------------------------|-------------------------------------------|
//! | face detector     | `1x3x240x320`, mean/std norm  | scores `1xNx2`, corner boxes `1xNx4` (0..1) |
//! | face landmarks    | `1x3x112x112`, `0..1`         | `1x136`, `(x, y)` pairs relative to crop   |
//! | age and gender    | `1x3x112x112`, `0..1`         | age `1x1` in years, gender `1x2` (m, f)    |
//! | face expression   | `1x1x48x48` grayscale, `0..1` | `1x7` logits, `Expression::ALL` order   |
//! | object detector   | `1x3x320x320`, `0..1`         | corner boxes `1xNx4` (0..1), scores `1xNx80` |
use common::detection::{BBox, DetectedObject, Expressions, FaceAnnotation, Gender, Point};
use image::{imageops::FilterType, RgbImage};
use itertools::Itertools;
use ndarray::s;
use std::path::Path;
use tract_onnx::prelude::*;

use crate::DetectError;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Number of landmarks of the landmark network.
pub const NUM_LANDMARKS: usize = 68;

/// Class labels of the object detector, COCO order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Detects faces in a frame and derives landmarks, age, gender and expressions for each.
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, frame: &RgbImage) -> Result<Vec<FaceAnnotation>, DetectError>;
}

/// Detects objects in a frame.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<DetectedObject>, DetectError>;
}

/// Load an ONNX file and optimize it for a fixed NCHW input shape.
fn load_onnx(path: &Path, shape: [usize; 4]) -> TractResult<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(shape[0], shape[1], shape[2], shape[3]),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Resize an RGB image and lay it out as a `1x3xHxW` tensor, normalizing every channel value.
fn rgb_tensor(
    input: &RgbImage,
    width: u32,
    height: u32,
    normalize: impl Fn(usize, u8) -> f32,
) -> Tensor {
    let resized: RgbImage = image::imageops::resize(input, width, height, FilterType::Triangle);

    tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| normalize(c, resized[(x as _, y as _)][c]),
    )
    .into()
}

/// Cut the (already clipped) box out of the frame.
fn crop(frame: &RgbImage, bbox: &BBox) -> RgbImage {
    image::imageops::crop_imm(
        frame,
        bbox.x as u32,
        bbox.y as u32,
        bbox.width as u32,
        bbox.height as u32,
    )
    .to_image()
}

/// Face detector of the Ultra-Light-Fast-Generic-Face-Detector family.
pub struct UltrafaceModel {
    model: NnModel,
    width: u32,
    height: u32,
    max_iou: f32,
    min_confidence: f32,
}

impl UltrafaceModel {
    pub fn new(path: &Path, max_iou: f32, min_confidence: f32) -> TractResult<Self> {
        let (width, height) = (320, 240);
        let model = load_onnx(path, [1, 3, height as usize, width as usize])?;
        Ok(Self {
            model,
            width,
            height,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        rgb_tensor(input, self.width, self.height, |c, value| {
            // Note: Mean/std are from MobileNet, not from Ultraface, but work well
            let mean = [0.485, 0.456, 0.406][c];
            let std = [0.229, 0.224, 0.225][c];
            (value as f32 / 255.0 - mean) / std
        })
    }

    /// Run the detector and return face boxes in frame pixel coordinates with confidences.
    pub fn run(&self, frame: &RgbImage) -> TractResult<Vec<(BBox, f32)>> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(frame).into()))?;

        // Output 0: background/face confidence per anchor, output 1: corner boxes per anchor
        let confidences = raw_nn_out[0]
            .to_array_view::<f32>()?
            .slice(s![0, .., 1])
            .to_vec();
        let bboxes: Vec<f32> = raw_nn_out[1]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();
        let bboxes: Vec<[f32; 4]> = bboxes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();

        let (width, height) = (frame.width() as f32, frame.height() as f32);
        Ok(
            postproc_ultraface(&confidences, &bboxes, self.min_confidence, self.max_iou)
                .into_iter()
                .map(|(bbox, confidence)| {
                    let corners = [
                        bbox[0] * width,
                        bbox[1] * height,
                        bbox[2] * width,
                        bbox[3] * height,
                    ];
                    (BBox::from_corners(corners), confidence)
                })
                .collect(),
        )
    }
}

/// Filter anchors by confidence and suppress overlapping boxes.
///
/// Boxes stay in normalized corner form `[x_tl, y_tl, x_br, y_br]`. The result is sorted by
/// descending confidence.
pub fn postproc_ultraface(
    confidences: &[f32],
    bboxes: &[[f32; 4]],
    min_confidence: f32,
    max_iou: f32,
) -> Vec<([f32; 4], f32)> {
    let mut confidences_with_bboxes: Vec<_> = confidences
        .iter()
        .zip(bboxes.iter())
        .filter(|(confidence, bbox)| **confidence > min_confidence && is_finite_bbox(bbox))
        .collect();

    confidences_with_bboxes.sort_by(|a, b| a.0.total_cmp(b.0));

    non_maximum_suppression(confidences_with_bboxes, max_iou)
        .into_iter()
        .map(|(confidence, bbox)| (bbox, confidence))
        .collect()
}

/// Network estimating 68 facial landmarks on a face crop.
pub struct LandmarkModel {
    model: NnModel,
    size: u32,
}

impl LandmarkModel {
    pub fn new(path: &Path) -> TractResult<Self> {
        let size = 112;
        let model = load_onnx(path, [1, 3, size as usize, size as usize])?;
        Ok(Self { model, size })
    }

    /// Estimate the landmarks of the face in `face_crop`, which was cut out of the frame at `bbox`.
    pub fn run(&self, face_crop: &RgbImage, bbox: &BBox) -> TractResult<Vec<Point>> {
        let input = rgb_tensor(face_crop, self.size, self.size, |_, v| v as f32 / 255.0);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let coords: Vec<f32> = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();

        Ok(landmarks_to_frame(&coords, bbox))
    }
}

/// Map crop-relative `(x, y)` pairs to frame pixel coordinates.
pub fn landmarks_to_frame(coords: &[f32], bbox: &BBox) -> Vec<Point> {
    coords
        .chunks_exact(2)
        .take(NUM_LANDMARKS)
        .map(|xy| Point::new(bbox.x + xy[0] * bbox.width, bbox.y + xy[1] * bbox.height))
        .collect()
}

/// Network estimating age and gender on a face crop.
pub struct AgeGenderModel {
    model: NnModel,
    size: u32,
}

impl AgeGenderModel {
    pub fn new(path: &Path) -> TractResult<Self> {
        let size = 112;
        let model = load_onnx(path, [1, 3, size as usize, size as usize])?;
        Ok(Self { model, size })
    }

    /// Returns the age in years, the more probable gender and its probability.
    pub fn run(&self, face_crop: &RgbImage) -> TractResult<(f32, Gender, f32)> {
        let input = rgb_tensor(face_crop, self.size, self.size, |_, v| v as f32 / 255.0);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        let age = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);
        let gender_probs: Vec<f32> = raw_nn_out[1]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();
        let (gender, probability) = pick_gender(&gender_probs);

        Ok((age, gender, probability))
    }
}

/// Pick the gender from `[p_male, p_female]`. Equal probabilities count as male.
pub fn pick_gender(probs: &[f32]) -> (Gender, f32) {
    let p_male = probs.first().copied().unwrap_or(0.0);
    let p_female = probs.get(1).copied().unwrap_or(0.0);
    if p_female > p_male {
        (Gender::Female, p_female)
    } else {
        (Gender::Male, p_male)
    }
}

/// Network classifying the facial expression on a face crop.
pub struct ExpressionModel {
    model: NnModel,
    size: u32,
}

impl ExpressionModel {
    pub fn new(path: &Path) -> TractResult<Self> {
        let size = 48;
        let model = load_onnx(path, [1, 1, size as usize, size as usize])?;
        Ok(Self { model, size })
    }

    pub fn run(&self, face_crop: &RgbImage) -> TractResult<Expressions> {
        let gray = image::imageops::grayscale(face_crop);
        let resized = image::imageops::resize(&gray, self.size, self.size, FilterType::Triangle);
        let input: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 1, self.size as usize, self.size as usize),
            |(_, _, y, x)| resized[(x as _, y as _)][0] as f32 / 255.0,
        )
        .into();

        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        let logits: Vec<f32> = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();

        Ok(Expressions::from_scores(&softmax(&logits)))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / (sum + EPS)).collect()
}

/// Single-shot object detector trained on COCO.
pub struct SsdModel {
    model: NnModel,
    size: u32,
    min_score: f32,
    max_iou: f32,
    max_detections: usize,
}

impl SsdModel {
    pub fn new(
        path: &Path,
        min_score: f32,
        max_iou: f32,
        max_detections: usize,
    ) -> TractResult<Self> {
        let size = 320;
        let model = load_onnx(path, [1, 3, size as usize, size as usize])?;
        Ok(Self {
            model,
            size,
            min_score,
            max_iou,
            max_detections,
        })
    }

    pub fn run(&self, frame: &RgbImage) -> TractResult<Vec<DetectedObject>> {
        let input = rgb_tensor(frame, self.size, self.size, |_, v| v as f32 / 255.0);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        let bboxes: Vec<f32> = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();
        let bboxes: Vec<[f32; 4]> = bboxes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        let scores: Vec<f32> = raw_nn_out[1]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();

        let (width, height) = (frame.width() as f32, frame.height() as f32);
        Ok(postproc_ssd(
            &bboxes,
            &scores,
            COCO_CLASSES.len(),
            self.min_score,
            self.max_iou,
            self.max_detections,
        )
        .into_iter()
        .map(|(class, score, bbox)| DetectedObject {
            class: COCO_CLASSES[class].to_owned(),
            score,
            bbox: BBox::from_corners([
                bbox[0] * width,
                bbox[1] * height,
                bbox[2] * width,
                bbox[3] * height,
            ]),
        })
        .collect())
    }
}

/// Pick the best class per box, drop weak boxes and suppress overlaps within each class.
///
/// Returns at most `max_detections` `(class, score, corners)` triples by descending score.
pub fn postproc_ssd(
    bboxes: &[[f32; 4]],
    scores: &[f32],
    num_classes: usize,
    min_score: f32,
    max_iou: f32,
    max_detections: usize,
) -> Vec<(usize, f32, [f32; 4])> {
    let candidates = bboxes
        .iter()
        .zip(scores.chunks_exact(num_classes))
        .filter(|(bbox, _)| is_finite_bbox(bbox))
        .filter_map(|(bbox, class_scores)| {
            class_scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .filter(|(_, score)| **score >= min_score)
                .map(|(class, score)| (class, *score, *bbox))
        })
        .sorted_by(|a, b| b.1.total_cmp(&a.1));

    let mut selected: Vec<(usize, f32, [f32; 4])> = Vec::new();
    for candidate in candidates {
        if selected.len() >= max_detections {
            break;
        }
        let overlaps = selected
            .iter()
            .any(|chosen| chosen.0 == candidate.0 && iou(&chosen.2, &candidate.2) > max_iou);
        if !overlaps {
            selected.push(candidate);
        }
    }

    selected
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not have a maximum IoU `max_iou` with already chosen bounding boxes.
fn non_maximum_suppression(
    mut sorted_bboxes_with_confidences: Vec<(&f32, &[f32; 4])>,
    max_iou: f32,
) -> Vec<(f32, [f32; 4])> {
    let mut selected: Vec<(f32, [f32; 4])> = vec![];
    'candidates: loop {
        // Get next most confident bbox from the back of ascending-sorted vector.
        // All boxes fulfill the minimum confidence criterium.
        match sorted_bboxes_with_confidences.pop() {
            Some((confidence, bbox)) => {
                // Check for overlap with any of the selected bboxes
                for (_, selected_bbox) in selected.iter() {
                    if iou(bbox, selected_bbox) > max_iou {
                        continue 'candidates;
                    }
                }

                // bbox has no large overlap with any of the selected ones, add it
                selected.push((*confidence, *bbox))
            }
            None => break 'candidates,
        }
    }

    selected
}

fn is_finite_bbox(bbox: &[f32; 4]) -> bool {
    bbox.iter().all(|v| v.is_finite())
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are ill defined, i.e. the
    // top left corner lies below/right of the bottom right one. Its area is zero then.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

/// Face analysis combining detector, landmark, age/gender and expression networks.
pub struct FaceNets {
    pub detector: UltrafaceModel,
    pub landmarks: LandmarkModel,
    pub age_gender: AgeGenderModel,
    pub expression: ExpressionModel,
}

impl FaceAnalyzer for FaceNets {
    fn analyze(&self, frame: &RgbImage) -> Result<Vec<FaceAnnotation>, DetectError> {
        let faces = self.detector.run(frame).map_err(DetectError::inference)?;
        log::debug!("Detected {} face(s)", faces.len());

        let mut annotations = Vec::with_capacity(faces.len());
        for (bbox, _confidence) in faces {
            let Some(clipped) = bbox.clipped(frame.width(), frame.height()) else {
                continue;
            };
            let face_crop = crop(frame, &clipped);

            let landmarks = self
                .landmarks
                .run(&face_crop, &clipped)
                .map_err(DetectError::inference)?;
            let (age, gender, gender_probability) = self
                .age_gender
                .run(&face_crop)
                .map_err(DetectError::inference)?;
            let expressions = self
                .expression
                .run(&face_crop)
                .map_err(DetectError::inference)?;

            annotations.push(FaceAnnotation {
                bbox,
                age,
                gender,
                gender_probability,
                expressions,
                landmarks,
            });
        }

        Ok(annotations)
    }
}

impl ObjectDetector for SsdModel {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<DetectedObject>, DetectError> {
        let objects = self.run(frame).map_err(DetectError::inference)?;
        log::debug!("Detected {} object(s)", objects.len());
        Ok(objects)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::detection::Expression;

    #[test]
    fn test_iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 1.0, 1.0];
        let b = [2.0, 2.0, 3.0, 3.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-4);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_ultraface_postproc_suppresses_overlaps() {
        let confidences = [0.9, 0.8, 0.3, 0.7];
        let bboxes = [
            [0.1, 0.1, 0.3, 0.3],
            [0.11, 0.11, 0.31, 0.31],
            [0.5, 0.5, 0.6, 0.6],
            [0.6, 0.1, 0.8, 0.3],
        ];

        let selected = postproc_ultraface(&confidences, &bboxes, 0.5, 0.3);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], ([0.1, 0.1, 0.3, 0.3], 0.9));
        assert_eq!(selected[1], ([0.6, 0.1, 0.8, 0.3], 0.7));
    }

    #[test]
    fn test_ssd_postproc_per_class_suppression_and_cap() {
        // Three classes, four boxes
        let bboxes = [
            [0.0, 0.0, 0.5, 0.5],
            [0.01, 0.01, 0.5, 0.5],
            [0.01, 0.01, 0.5, 0.5],
            [0.6, 0.6, 0.9, 0.9],
        ];
        #[rustfmt::skip]
        let scores = [
            0.1, 0.9, 0.0,
            0.1, 0.8, 0.0,
            0.7, 0.1, 0.0,
            0.0, 0.0, 0.4,
        ];

        let selected = postproc_ssd(&bboxes, &scores, 3, 0.5, 0.5, 20);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].0, 1);
        assert_eq!(selected[1].0, 0);

        let capped = postproc_ssd(&bboxes, &scores, 3, 0.5, 0.5, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].1, 0.9);
    }

    #[test]
    fn test_postproc_drops_non_finite_boxes() {
        let bboxes = [[0.1, 0.1, f32::NAN, 0.3], [0.6, 0.1, 0.8, f32::INFINITY], [0.2, 0.2, 0.4, 0.4]];

        let faces = postproc_ultraface(&[0.9, 0.9, 0.8], &bboxes, 0.5, 0.3);
        assert_eq!(faces, vec![([0.2, 0.2, 0.4, 0.4], 0.8)]);

        let objects = postproc_ssd(&bboxes, &[0.9, 0.9, 0.8], 1, 0.5, 0.5, 20);
        assert_eq!(objects, vec![(0, 0.8, [0.2, 0.2, 0.4, 0.4])]);
    }

    #[test]
    fn test_landmarks_map_into_frame() {
        let bbox = BBox::new(100.0, 50.0, 40.0, 20.0);
        let points = landmarks_to_frame(&[0.0, 0.0, 0.5, 0.5, 1.0, 1.0], &bbox);
        assert_eq!(
            points,
            vec![
                Point::new(100.0, 50.0),
                Point::new(120.0, 60.0),
                Point::new(140.0, 70.0)
            ]
        );
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_gender_pick() {
        assert_eq!(pick_gender(&[0.2, 0.8]), (Gender::Female, 0.8));
        assert_eq!(pick_gender(&[0.5, 0.5]), (Gender::Male, 0.5));
        assert_eq!(Expressions::from_scores(&softmax(&[0.0; 7])).0.len(), Expression::ALL.len());
    }
}
