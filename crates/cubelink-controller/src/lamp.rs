//! Color policy for button-triggered lamp broadcasts.

use cubelink_types::LampColor;

/// Golden angle in degrees; consecutive hues stay far apart.
const HUE_STEP_DEG: f32 = 137.507_77;

/// Deterministic walk around the HSV hue wheel at full saturation and value.
#[derive(Debug, Clone, Default)]
pub struct LampCycle {
    hue: f32,
}

impl LampCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the walk and return the next color.
    pub fn next_color(&mut self) -> LampColor {
        self.hue = (self.hue + HUE_STEP_DEG) % 360.0;
        hue_to_rgb(self.hue)
    }
}

fn hue_to_rgb(hue: f32) -> LampColor {
    let sector = hue / 60.0;
    let x = 1.0 - ((sector % 2.0) - 1.0).abs();
    let (r, g, b) = match sector as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let channel = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    LampColor::new(channel(r), channel(g), channel(b))
}
