//! Telemetry sample carried through the pipeline.

use serde::{Deserialize, Serialize};

/// One control point reported by the monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: f64,
}

impl Sample {
    /// Placeholder recorded for lines that carried no control point.
    pub const NULL: Sample = Sample {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        intensity: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64, intensity: f64) -> Self {
        Self { x, y, z, intensity }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}
