// Push message protocol using JSON serialization
use crate::sample::Sample;
use serde::{Deserialize, Serialize};

/// Message pushed to every subscriber for each published sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub x: f64,
    pub y: f64,
    pub z: f64,

    /// Only present when intensity forwarding is enabled
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub intensity: Option<f64>,
}

impl PushMessage {
    pub fn from_sample(sample: &Sample, include_intensity: bool) -> Self {
        Self {
            x: sample.x,
            y: sample.y,
            z: sample.z,
            intensity: include_intensity.then_some(sample.intensity),
        }
    }

    /// Serialize to the text frame sent over the socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
