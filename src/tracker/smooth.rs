use nalgebra::{UnitQuaternion, Vector3};
use std::collections::VecDeque;
use thiserror::Error;

use crate::config::SmoothingConfig;
use crate::geometry::{average_quaternions, nlerp, weighted_mean, PoseSample};

/// ウィンドウ内にサンプルがない
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no pose sample inside the smoothing window")]
pub struct Stale;

/// 時間窓による重み付き平均
///
/// 重みはウィンドウ先頭で `min_weight`、末尾（最新）で 1 の線形。
/// 回転は固有値分解による平均、位置は加重算術平均。
pub fn window_blend(
    samples: &VecDeque<PoseSample>,
    t: f64,
    window: f64,
    min_weight: f64,
) -> Option<PoseSample> {
    if window <= 0.0 {
        let newest = samples.iter().rev().find(|s| s.timestamp <= t)?;
        return Some(PoseSample { timestamp: t, ..*newest });
    }

    let start = t - window;
    let mut positions: Vec<(Vector3<f64>, f64)> = Vec::new();
    let mut rotations: Vec<(UnitQuaternion<f64>, f64)> = Vec::new();
    for s in samples.iter().filter(|s| s.timestamp >= start && s.timestamp <= t) {
        let ramp = ((s.timestamp - start) / window).clamp(0.0, 1.0);
        let w = min_weight + (1.0 - min_weight) * ramp;
        positions.push((s.position, w));
        rotations.push((s.orientation, w));
    }
    if positions.is_empty() {
        return None;
    }

    Some(PoseSample::new(
        t,
        weighted_mean(&positions)?,
        average_quaternions(&rotations)?,
    ))
}

/// 奥行き（カメラ z）方向だけの指数平滑
#[derive(Debug, Clone, Default)]
pub struct DepthDamper {
    factor: f64,
    prev: Option<f64>,
}

impl DepthDamper {
    pub fn new(factor: f64) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.99),
            prev: None,
        }
    }

    pub fn apply(&mut self, mut sample: PoseSample) -> PoseSample {
        let z = match self.prev {
            Some(prev) => prev + (sample.position.z - prev) * (1.0 - self.factor),
            None => sample.position.z,
        };
        self.prev = Some(z);
        sample.position.z = z;
        sample
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// 出力全体の追加平滑化: output = lerp(prev, blend, 1 - factor)
#[derive(Debug, Clone, Default)]
pub struct ExtraSmoother {
    factor: f64,
    prev: Option<PoseSample>,
}

impl ExtraSmoother {
    pub fn new(factor: f64) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.99),
            prev: None,
        }
    }

    pub fn apply(&mut self, sample: PoseSample) -> PoseSample {
        let out = match self.prev {
            Some(prev) => {
                let a = 1.0 - self.factor;
                PoseSample {
                    position: prev.position + (sample.position - prev.position) * a,
                    orientation: nlerp(&prev.orientation, &sample.orientation, a),
                    ..sample
                }
            }
            None => sample,
        };
        self.prev = Some(out);
        out
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// 1トラッカー・1カメラ分の時間方向平滑化
///
/// window blend → depth damping → extra smoothing の順。
/// サンプルはカメラ座標系のまま入れる（奥行き = z）。
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    window: f64,
    latency: f64,
    min_weight: f64,
    samples: VecDeque<PoseSample>,
    depth: DepthDamper,
    extra: ExtraSmoother,
}

impl TemporalSmoother {
    pub fn new(window: f64, latency: f64) -> Self {
        Self {
            window: window.max(0.0),
            latency: latency.max(0.0),
            min_weight: 0.1,
            samples: VecDeque::new(),
            depth: DepthDamper::new(0.0),
            extra: ExtraSmoother::new(0.0),
        }
    }

    pub fn from_config(config: &SmoothingConfig, latency: f64) -> Self {
        Self::new(config.window, latency)
            .with_min_weight(config.min_weight)
            .with_depth(config.depth)
            .with_additional(config.additional)
    }

    pub fn with_min_weight(mut self, min_weight: f64) -> Self {
        self.min_weight = min_weight.clamp(0.0, 1.0);
        self
    }

    pub fn with_depth(mut self, factor: f64) -> Self {
        self.depth = DepthDamper::new(factor);
        self
    }

    pub fn with_additional(mut self, factor: f64) -> Self {
        self.extra = ExtraSmoother::new(factor);
        self
    }

    /// 無効サンプル・時刻が戻ったサンプルは捨てる（戻り値 false）
    pub fn push(&mut self, sample: PoseSample) -> bool {
        if !sample.valid {
            return false;
        }
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                tracing::trace!(
                    last = last.timestamp,
                    sample = sample.timestamp,
                    "out-of-order pose sample dropped"
                );
                return false;
            }
        }
        self.samples.push_back(sample);

        let horizon = sample.timestamp - self.window - self.latency;
        while self.samples.front().is_some_and(|s| s.timestamp < horizon) {
            self.samples.pop_front();
        }
        true
    }

    pub fn get_smoothed(&mut self, query_time: f64) -> Result<PoseSample, Stale> {
        let t = query_time - self.latency;
        let Some(blend) = window_blend(&self.samples, t, self.window, self.min_weight) else {
            self.depth.reset();
            self.extra.reset();
            return Err(Stale);
        };
        let damped = self.depth.apply(blend);
        let mut out = self.extra.apply(damped);
        out.timestamp = query_time;
        Ok(out)
    }

    pub fn latest_timestamp(&self) -> Option<f64> {
        self.samples.back().map(|s| s.timestamp)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.depth.reset();
        self.extra.reset();
    }
}
