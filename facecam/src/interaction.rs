//! Mapping of pointer clicks on the overlay to detected faces.
use common::{detection::FaceBox, protocol::ClickReq};

/// Acknowledgment shown when a face was clicked.
pub const FACE_CLICKED: &str = "Face clicked!";

/// Translate client coordinates to overlay-local coordinates.
pub fn to_overlay_coords(click: &ClickReq) -> (f32, f32) {
    (click.client_x - click.rect_left, click.client_y - click.rect_top)
}

/// Index of the first face box containing the point, edges included.
///
/// Boxes may overlap, the earliest one in detection order wins.
pub fn hit_test(face_boxes: &[FaceBox], x: f32, y: f32) -> Option<usize> {
    face_boxes.iter().position(|face_box| face_box.contains(x, y))
}
