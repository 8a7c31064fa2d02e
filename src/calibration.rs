use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::tracker::{CameraAlignment, RigidBodyModel};

/// トラッカーモデルとカメラ間アライメントの保存形式
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    #[serde(default)]
    pub trackers: Vec<RigidBodyModel>,
    #[serde(default)]
    pub alignments: Vec<CameraAlignment>,
}

impl CalibrationFile {
    pub fn tracker(&self, tracker_id: usize) -> Option<&RigidBodyModel> {
        self.trackers.iter().find(|m| m.tracker_id == tracker_id)
    }

    /// 同じ tracker_id があれば置き換え
    pub fn upsert_tracker(&mut self, model: RigidBodyModel) {
        match self.trackers.iter_mut().find(|m| m.tracker_id == model.tracker_id) {
            Some(slot) => *slot = model,
            None => {
                self.trackers.push(model);
                self.trackers.sort_by_key(|m| m.tracker_id);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for model in &self.trackers {
            model.validate()?;
        }
        for (i, m) in self.trackers.iter().enumerate() {
            if self.trackers[..i].iter().any(|o| o.tracker_id == m.tracker_id) {
                bail!("Duplicate tracker {} in calibration file", m.tracker_id);
            }
        }
        Ok(())
    }
}

pub fn save_calibration(path: impl AsRef<Path>, cal: &CalibrationFile) -> Result<()> {
    let path = path.as_ref();
    cal.validate()?;
    let json = serde_json::to_string_pretty(cal)?;
    fs::write(path, json).with_context(|| format!("Failed to write calibration file: {}", path.display()))?;
    tracing::info!(path = %path.display(), trackers = cal.trackers.len(), "calibration saved");
    Ok(())
}

/// 壊れたモデル（ルート欠落など）を含むファイルは読み込まない
pub fn load_calibration(path: impl AsRef<Path>) -> Result<CalibrationFile> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read calibration file: {}", path.display()))?;
    let cal: CalibrationFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse calibration file: {}", path.display()))?;
    cal.validate()
        .with_context(|| format!("Malformed calibration file: {}", path.display()))?;
    Ok(cal)
}
