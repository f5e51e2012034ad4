use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::FansError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpindleProfile {
    pub name: String,
    /// Output claimed as the spindle's enable line.
    #[serde(default)]
    pub enable_port: Option<u8>,
}

/// Simulated board the plugin runs on, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardProfile {
    #[serde(default = "default_digital_outputs")]
    pub digital_outputs: u8,
    #[serde(default = "default_nvs_size")]
    pub nvs_size: usize,
    /// Number of fans the plugin drives (1..=4).
    #[serde(default = "default_fans")]
    pub fans: usize,
    /// The first spindle is the active one.
    #[serde(default = "default_spindles")]
    pub spindles: Vec<SpindleProfile>,
}

fn default_digital_outputs() -> u8 { 8 }
fn default_nvs_size() -> usize { 1024 }
fn default_fans() -> usize { 2 }
fn default_spindles() -> Vec<SpindleProfile> {
    vec![SpindleProfile {
        name: "PWM spindle".to_string(),
        enable_port: None,
    }]
}

impl Default for BoardProfile {
    fn default() -> Self {
        Self {
            digital_outputs: default_digital_outputs(),
            nvs_size: default_nvs_size(),
            fans: default_fans(),
            spindles: default_spindles(),
        }
    }
}

impl BoardProfile {
    pub fn load(path: &Path) -> Result<Self, FansError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
