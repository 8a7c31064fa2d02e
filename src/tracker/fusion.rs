use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::config::MultiCamConfig;
use crate::geometry::{average_quaternions, fit_rigid, weighted_mean, PoseSample};

/// アライメントに必要な最低ペア数
pub const MIN_ALIGNMENT_PAIRS: usize = 3;
/// トラッカー座標軸上の点（アライメント用）
const AXIS_LENGTH: f64 = 0.1;

/// カメラ座標系 → 基準カメラ座標系
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraAlignment {
    pub camera_id: usize,
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl CameraAlignment {
    pub fn identity(camera_id: usize) -> Self {
        Self {
            camera_id,
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_isometry(camera_id: usize, iso: &Isometry3<f64>) -> Self {
        Self {
            camera_id,
            rotation: iso.rotation,
            translation: iso.translation.vector,
        }
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AlignmentError {
    #[error("camera {0} is the primary camera")]
    PrimaryCamera(usize),
    #[error("unknown camera {0}")]
    UnknownCamera(usize),
    #[error("camera {camera}: {have} alignment samples, need {need}")]
    NotEnoughPairs { camera: usize, have: usize, need: usize },
    #[error("camera {0}: alignment samples are degenerate")]
    Degenerate(usize),
}

/// 全カメラのアライメント（読み取りはコピー、更新は丸ごと置き換え）
#[derive(Debug)]
pub struct AlignmentTable {
    inner: RwLock<Vec<CameraAlignment>>,
}

impl AlignmentTable {
    pub fn new(camera_count: usize) -> Self {
        Self {
            inner: RwLock::new((0..camera_count).map(CameraAlignment::identity).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, camera_id: usize) -> Option<CameraAlignment> {
        self.inner.read().get(camera_id).copied()
    }

    pub fn set(&self, alignment: CameraAlignment) -> Result<(), AlignmentError> {
        let mut table = self.inner.write();
        let slot = table
            .get_mut(alignment.camera_id)
            .ok_or(AlignmentError::UnknownCamera(alignment.camera_id))?;
        *slot = alignment;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<CameraAlignment> {
        self.inner.read().clone()
    }

    /// 保存済みの値で置き換え（範囲外のカメラは無視）
    pub fn load(&self, alignments: &[CameraAlignment]) {
        let mut table = self.inner.write();
        for a in alignments {
            if let Some(slot) = table.get_mut(a.camera_id) {
                *slot = *a;
            }
        }
    }
}

/// 1カメラ分の観測（カメラ座標系）
#[derive(Debug, Clone, Copy)]
pub struct CameraObservation {
    pub camera_id: usize,
    pub sample: PoseSample,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct PosePair {
    /// トラッカー → 基準カメラ
    primary: Isometry3<f64>,
    /// トラッカー → このカメラ
    secondary: Isometry3<f64>,
}

/// 複数カメラの推定結果を基準カメラ座標系で統合する
pub struct MultiCameraFuser {
    primary: usize,
    pair_window: f64,
    min_confidence: f64,
    max_pairs: usize,
    alignments: AlignmentTable,
    pairs: Mutex<Vec<VecDeque<PosePair>>>,
}

impl MultiCameraFuser {
    pub fn new(camera_count: usize, config: &MultiCamConfig) -> Self {
        Self {
            primary: config.primary.min(camera_count.saturating_sub(1)),
            pair_window: config.pair_window,
            min_confidence: config.min_confidence,
            max_pairs: config.max_pairs.max(MIN_ALIGNMENT_PAIRS),
            alignments: AlignmentTable::new(camera_count),
            pairs: Mutex::new(vec![VecDeque::new(); camera_count]),
        }
    }

    pub fn primary(&self) -> usize {
        self.primary
    }

    pub fn alignments(&self) -> &AlignmentTable {
        &self.alignments
    }

    /// 基準カメラ座標系へ移す
    pub fn to_common(&self, obs: &CameraObservation) -> Option<PoseSample> {
        let a = self.alignments.get(obs.camera_id)?;
        Some(obs.sample.transformed(&a.isometry()))
    }

    /// 1台ならアライメント後そのまま、複数なら信頼度で重み付け平均
    pub fn fuse(&self, observations: &[CameraObservation]) -> Option<PoseSample> {
        let aligned: Vec<(PoseSample, f64)> = observations
            .iter()
            .filter(|o| o.sample.valid)
            .filter_map(|o| Some((self.to_common(o)?, o.confidence)))
            .collect();

        match aligned.as_slice() {
            [] => None,
            [(only, _)] => Some(*only),
            many => {
                let timestamp = many.iter().map(|(s, _)| s.timestamp).fold(f64::NEG_INFINITY, f64::max);
                // 信頼度が全て0なら等重み
                let all_zero = many.iter().all(|(_, c)| *c <= 0.0);
                let weight = |c: f64| if all_zero { 1.0 } else { c.max(0.0) };
                let positions: Vec<_> = many.iter().map(|(s, c)| (s.position, weight(*c))).collect();
                let rotations: Vec<_> = many.iter().map(|(s, c)| (s.orientation, weight(*c))).collect();
                Some(PoseSample::new(
                    timestamp,
                    weighted_mean(&positions)?,
                    average_quaternions(&rotations)?,
                ))
            }
        }
    }

    /// 基準カメラと他カメラが同じトラッカーを同時に捉えたら記録
    pub fn record_pair(&self, primary: &CameraObservation, secondary: &CameraObservation) -> bool {
        if primary.camera_id != self.primary || secondary.camera_id == self.primary {
            return false;
        }
        if !primary.sample.valid || !secondary.sample.valid {
            return false;
        }
        if (primary.sample.timestamp - secondary.sample.timestamp).abs() > self.pair_window {
            return false;
        }
        if primary.confidence < self.min_confidence || secondary.confidence < self.min_confidence {
            return false;
        }

        let mut pairs = self.pairs.lock();
        let Some(queue) = pairs.get_mut(secondary.camera_id) else {
            return false;
        };
        queue.push_back(PosePair {
            primary: primary.sample.isometry(),
            secondary: secondary.sample.isometry(),
        });
        while queue.len() > self.max_pairs {
            queue.pop_front();
        }
        true
    }

    pub fn pair_count(&self, camera_id: usize) -> usize {
        self.pairs.lock().get(camera_id).map_or(0, VecDeque::len)
    }

    pub fn clear_pairs(&self, camera_id: usize) {
        if let Some(q) = self.pairs.lock().get_mut(camera_id) {
            q.clear();
        }
    }

    /// 蓄積したペアからカメラ間の剛体変換を最小二乗で求め、置き換える
    ///
    /// 各ペアのトラッカー原点と座標軸上の3点を対応点とする。
    pub fn refine(&self, camera_id: usize) -> Result<CameraAlignment, AlignmentError> {
        if camera_id == self.primary {
            return Err(AlignmentError::PrimaryCamera(camera_id));
        }
        let pairs: Vec<PosePair> = {
            let all = self.pairs.lock();
            let queue = all.get(camera_id).ok_or(AlignmentError::UnknownCamera(camera_id))?;
            queue.iter().copied().collect()
        };
        if pairs.len() < MIN_ALIGNMENT_PAIRS {
            return Err(AlignmentError::NotEnoughPairs {
                camera: camera_id,
                have: pairs.len(),
                need: MIN_ALIGNMENT_PAIRS,
            });
        }

        let probes = [
            Point3::origin(),
            Point3::new(AXIS_LENGTH, 0.0, 0.0),
            Point3::new(0.0, AXIS_LENGTH, 0.0),
            Point3::new(0.0, 0.0, AXIS_LENGTH),
        ];
        let mut src = Vec::with_capacity(pairs.len() * probes.len());
        let mut dst = Vec::with_capacity(pairs.len() * probes.len());
        for pair in &pairs {
            for p in &probes {
                src.push(pair.secondary * p);
                dst.push(pair.primary * p);
            }
        }

        let fit = fit_rigid(&src, &dst).ok_or(AlignmentError::Degenerate(camera_id))?;
        let alignment = CameraAlignment::from_isometry(camera_id, &fit);
        self.alignments.set(alignment)?;
        tracing::info!(
            camera = camera_id,
            pairs = pairs.len(),
            x = alignment.translation.x,
            y = alignment.translation.y,
            z = alignment.translation.z,
            "camera alignment refined"
        );
        Ok(alignment)
    }
}
