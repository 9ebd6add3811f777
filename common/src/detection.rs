//! Detection results of a single tick.
//!
//! Everything in here lives for exactly one tick and is replaced by the results of the next one.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in video pixel coordinates.
///
/// The origin is the top-left corner of the video frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Rectangle of a detected face, used for rendering and click hit-testing.
pub type FaceBox = BBox;

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from two corner points `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
    pub fn from_corners(corners: [f32; 4]) -> Self {
        Self {
            x: corners[0],
            y: corners[1],
            width: corners[2] - corners[0],
            height: corners[3] - corners[1],
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Whether the point lies inside the box. All four edges count as inside.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }

    /// Clip the box to an image of the given size. Returns `None` if nothing is left.
    pub fn clipped(&self, width: u32, height: u32) -> Option<BBox> {
        let x0 = self.x.max(0.0);
        let y0 = self.y.max(0.0);
        let x1 = self.right().min(width as f32);
        let y1 = self.bottom().min(height as f32);
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }

        Some(BBox::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Estimated gender of a face.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facial expressions in the order the expression network reports them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expression confidences of one face, kept in network order.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Expressions(pub Vec<(Expression, f32)>);

impl Expressions {
    /// Pair the raw scores with [`Expression::ALL`]. Surplus scores are ignored.
    pub fn from_scores(scores: &[f32]) -> Self {
        Self(Expression::ALL.iter().copied().zip(scores.iter().copied()).collect())
    }

    /// The expression with the highest confidence.
    ///
    /// On equal confidences the expression that comes first in network order wins.
    pub fn top(&self) -> Option<Expression> {
        self.0
            .iter()
            .fold(None, |best: Option<&(Expression, f32)>, candidate| match best {
                Some(best) if candidate.1 <= best.1 => Some(best),
                _ => Some(candidate),
            })
            .map(|(expression, _)| *expression)
    }
}

/// A point in video pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A detected face with everything the face networks derived from it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FaceAnnotation {
    pub bbox: FaceBox,
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
    pub expressions: Expressions,
    /// 68 facial landmarks (iBUG 300-W layout), empty if none were estimated.
    pub landmarks: Vec<Point>,
}

/// A detected object.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectedObject {
    pub class: String,
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub bbox: BBox,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contains_is_inclusive() {
        let bbox = BBox::new(10.0, 20.0, 30.0, 40.0);
        assert!(bbox.contains(10.0, 20.0));
        assert!(bbox.contains(40.0, 60.0));
        assert!(bbox.contains(25.0, 30.0));
        assert!(!bbox.contains(9.9, 30.0));
        assert!(!bbox.contains(25.0, 60.1));
    }

    #[test]
    fn clipping_to_image() {
        let bbox = BBox::new(-10.0, 5.0, 30.0, 100.0);
        assert_eq!(
            bbox.clipped(100, 50),
            Some(BBox::new(0.0, 5.0, 20.0, 45.0))
        );
        assert_eq!(BBox::new(120.0, 0.0, 10.0, 10.0).clipped(100, 50), None);
    }

    #[test]
    fn top_expression_prefers_highest() {
        let expressions = Expressions::from_scores(&[0.1, 0.7, 0.05, 0.05, 0.04, 0.03, 0.03]);
        assert_eq!(expressions.top(), Some(Expression::Happy));
    }

    #[test]
    fn top_expression_ties_go_to_first() {
        let expressions = Expressions::from_scores(&[0.1, 0.4, 0.1, 0.4, 0.0, 0.0, 0.0]);
        assert_eq!(expressions.top(), Some(Expression::Happy));
        assert_eq!(Expressions::default().top(), None);
    }
}
