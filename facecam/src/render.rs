//! Drawing of detection results onto the overlay and their textual summary.
use std::{io::Cursor, path::Path};

use common::{
    detection::{BBox, DetectedObject, FaceAnnotation, Point},
    round_half_up,
};
use image::{ImageOutputFormat, Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut},
    rect::Rect,
};
use itertools::Itertools;
use lazy_static::lazy_static;
use rusttype::{Font, Scale};

pub const FACE_COLOR: Rgba<u8> = Rgba([0, 0, 255, 255]);
pub const OBJECT_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
pub const LANDMARK_COLOR: Rgba<u8> = Rgba([0, 255, 255, 255]);
pub const HIGHLIGHT_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

pub const BOX_LINE_WIDTH: u32 = 2;
pub const HIGHLIGHT_LINE_WIDTH: u32 = 3;

/// Labels closer than this to the top edge are pinned to it.
const LABEL_MIN_Y: f32 = 10.0;
/// Distance between a label's baseline and the top of its box.
const LABEL_OFFSET: f32 = 5.0;
const LABEL_SCALE: f32 = 14.0;

/// Point indices of the 68-landmark contours and whether each one is closed.
const LANDMARK_CONTOURS: [(usize, usize, bool); 8] = [
    (0, 17, false),  // jaw
    (17, 22, false), // right brow
    (22, 27, false), // left brow
    (27, 36, false), // nose
    (36, 42, true),  // right eye
    (42, 48, true),  // left eye
    (48, 60, true),  // outer lips
    (60, 68, true),  // inner lips
];

const FONT_CANDIDATES: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
];

lazy_static! {
    static ref SYSTEM_FONT: Option<Font<'static>> = FONT_CANDIDATES.iter().find_map(|path| {
        let font_data = std::fs::read(path).ok()?;
        Font::try_from_vec(font_data)
    });
}

/// Label of a face, e.g. `male (23 yrs), happy`.
pub fn face_label(face: &FaceAnnotation) -> String {
    let expression = face
        .expressions
        .top()
        .map_or("unknown", |expression| expression.as_str());
    format!(
        "{} ({} yrs), {}",
        face.gender,
        round_half_up(face.age),
        expression
    )
}

/// Label of an object, e.g. `cup (88%)`.
pub fn object_label(object: &DetectedObject) -> String {
    format!(
        "{} ({}%)",
        object.class,
        round_half_up(object.score * 100.0)
    )
}

/// Baseline origin of a box label: just above the box, but never closer to the top edge than
/// [`LABEL_MIN_Y`].
pub fn label_origin(bbox: &BBox) -> (f32, f32) {
    let y = if bbox.y > LABEL_MIN_Y {
        bbox.y - LABEL_OFFSET
    } else {
        LABEL_MIN_Y
    };
    (bbox.x, y)
}

/// Status line with the number of detections.
pub fn status_line(num_faces: usize, num_objects: usize) -> String {
    format!("{num_faces} face(s), {num_objects} object(s) detected")
}

/// One line per face followed by one line per object.
pub fn summarize(faces: &[FaceAnnotation], objects: &[DetectedObject]) -> String {
    let face_lines = faces
        .iter()
        .map(|face| format!("Face: {}\n", face_label(face)));
    let object_lines = objects
        .iter()
        .map(|object| format!("Object: {}\n", object_label(object)));

    face_lines.chain(object_lines).collect()
}

/// Prefix a summary with a timestamp line.
pub fn timestamped(summary: &str, time_of_day: &str) -> String {
    format!("[{time_of_day}]\n{summary}")
}

/// Current local wall-clock time of day.
pub fn local_time_of_day() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Transparent drawing surface stacked over the video.
#[derive(Clone, Debug)]
pub struct Overlay {
    image: RgbaImage,
}

impl Overlay {
    /// A cleared overlay of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Stroke the outline of a box, centering the line on the box edges.
    ///
    /// Boxes with non-finite coordinates are skipped. Edges far outside the overlay are pulled in
    /// to just beyond its border, where they stay invisible.
    pub fn stroke_rect(&mut self, bbox: &BBox, color: Rgba<u8>, line_width: u32) {
        let corners = [bbox.x, bbox.y, bbox.right(), bbox.bottom()];
        if !corners.iter().all(|v| v.is_finite()) {
            log::debug!("Skipping box with non-finite coordinates {bbox:?}");
            return;
        }
        let (overlay_width, overlay_height) = self.image.dimensions();
        let margin = line_width as f32 + 1.0;
        let clamp_x = |v: f32| v.clamp(-margin, overlay_width as f32 + margin).round() as i32;
        let clamp_y = |v: f32| v.clamp(-margin, overlay_height as f32 + margin).round() as i32;

        let (x, y) = (clamp_x(corners[0]), clamp_y(corners[1]));
        let width = clamp_x(corners[2]) - x;
        let height = clamp_y(corners[3]) - y;

        let first = -((line_width / 2) as i32);
        for offset in first..first + line_width as i32 {
            let (w, h) = (width + 2 * offset + 1, height + 2 * offset + 1);
            if w <= 0 || h <= 0 {
                continue;
            }
            let rect = Rect::at(x - offset, y - offset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut self.image, rect, color);
        }
    }

    /// Draw the landmark points and connect them along the face contours.
    pub fn draw_landmarks(&mut self, points: &[Point], color: Rgba<u8>) {
        for &(start, end, closed) in LANDMARK_CONTOURS.iter() {
            let Some(contour) = points.get(start..end) else {
                continue;
            };
            for (a, b) in contour.iter().tuple_windows() {
                draw_line_segment_mut(&mut self.image, (a.x, a.y), (b.x, b.y), color);
            }
            if closed {
                if let (Some(first), Some(last)) = (contour.first(), contour.last()) {
                    draw_line_segment_mut(
                        &mut self.image,
                        (last.x, last.y),
                        (first.x, first.y),
                        color,
                    );
                }
            }
        }

        for point in points {
            draw_filled_circle_mut(
                &mut self.image,
                (point.x.round() as i32, point.y.round() as i32),
                1,
                color,
            );
        }
    }

    /// Draw text with its baseline starting at `origin`.
    pub fn draw_label(&mut self, font: &Font, text: &str, origin: (f32, f32), color: Rgba<u8>) {
        let scale = Scale::uniform(LABEL_SCALE);
        let ascent = font.v_metrics(scale).ascent;
        draw_text_mut(
            &mut self.image,
            color,
            origin.0.round() as i32,
            (origin.1 - ascent).round() as i32,
            scale,
            font,
            text,
        );
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    }
}

/// Draws faces and objects onto fresh overlays.
pub struct Renderer {
    font: Option<Font<'static>>,
}

impl Renderer {
    /// Renderer with the given font. Without a font, boxes and landmarks are drawn but no labels.
    pub fn new(font: Option<Font<'static>>) -> Self {
        if font.is_none() {
            log::warn!("No font available, labels will not be drawn");
        }
        Self { font }
    }

    /// Renderer with DejaVu Sans Mono from the usual system locations.
    pub fn with_system_font() -> Self {
        Self::new(SYSTEM_FONT.clone())
    }

    /// Renderer with a TrueType font file.
    pub fn from_font_file(path: &Path) -> anyhow::Result<Self> {
        let font_data = std::fs::read(path)?;
        let font = Font::try_from_vec(font_data)
            .ok_or_else(|| anyhow::anyhow!("invalid font file {}", path.display()))?;
        Ok(Self::new(Some(font)))
    }

    /// Draw all detections of one tick onto a cleared overlay of the given size.
    pub fn render(
        &self,
        dimensions: (u32, u32),
        faces: &[FaceAnnotation],
        objects: &[DetectedObject],
    ) -> Overlay {
        let mut overlay = Overlay::new(dimensions.0, dimensions.1);

        for face in faces {
            overlay.stroke_rect(&face.bbox, FACE_COLOR, BOX_LINE_WIDTH);
            if let Some(font) = &self.font {
                overlay.draw_label(font, &face_label(face), label_origin(&face.bbox), FACE_COLOR);
            }
            overlay.draw_landmarks(&face.landmarks, LANDMARK_COLOR);
        }

        for object in objects {
            overlay.stroke_rect(&object.bbox, OBJECT_COLOR, BOX_LINE_WIDTH);
            if let Some(font) = &self.font {
                overlay.draw_label(
                    font,
                    &object_label(object),
                    label_origin(&object.bbox),
                    OBJECT_COLOR,
                );
            }
        }

        overlay
    }

    /// Redraw a clicked face box in the highlight style.
    pub fn highlight(&self, overlay: &mut Overlay, bbox: &BBox) {
        overlay.stroke_rect(bbox, HIGHLIGHT_COLOR, HIGHLIGHT_LINE_WIDTH);
    }
}
