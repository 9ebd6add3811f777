//! Common code shared between the `facecam` server and its page.
pub mod detection;
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;

/// Round half up, the way the page rounds percentages and ages.
pub fn round_half_up(value: f32) -> i64 {
    (value + 0.5).floor() as i64
}
