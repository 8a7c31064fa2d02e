use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

use super::estimator::{EstimateError, PoseEstimator};
use super::model::{CalibrationState, RigidBodyModel};
use super::refine::{refine_model, FrameObservation, RefineReport};
use crate::camera::CameraIntrinsics;
use crate::config::CalibrationConfig;
use crate::geometry::{average_quaternions, weighted_mean};
use crate::marker::{MarkerDetection, MarkerId, MarkerLayout};

/// 連続でこの回数外れたら、マーカーが動いたとみなしてやり直す
const MAX_CONSECUTIVE_OUTLIERS: usize = 3;

/// これ以上見えない時間が空いたら蓄積をやり直す（秒）
const MAX_OBSERVATION_GAP: f64 = 0.25;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalibrationError {
    #[error("tracker {tracker}: no marker was calibrated in this run")]
    InsufficientSamples { tracker: usize },
    #[error("marker {id} belongs to tracker {owner}, not tracker {tracker}")]
    ForeignMarker { id: MarkerId, owner: usize, tracker: usize },
}

/// フレームごとの各マーカーの状況
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkerStatus {
    /// 既に校正済み（アンカーとして使用）
    Anchor,
    /// サンプル蓄積中
    Calibrating { samples: usize, elapsed: f64 },
    /// 今フレームで校正完了
    Calibrated,
    /// カメラから遠すぎる
    TooFar { distance: f64 },
    /// 校正済みマーカーが同時に写っていない
    NoAnchorVisible,
    /// 別マーカーを校正中なので保留
    Waiting,
    /// 姿勢が曖昧・推定失敗のため今フレームは不採用
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerProgress {
    pub id: MarkerId,
    pub status: MarkerStatus,
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationReport {
    pub progress: Vec<MarkerProgress>,
    pub newly_calibrated: Vec<MarkerId>,
    pub refined: Option<RefineReport>,
    /// 蓄積中のマーカー
    pub active: Option<MarkerId>,
}

impl CalibrationReport {
    pub fn status_of(&self, id: MarkerId) -> Option<MarkerStatus> {
        self.progress.iter().find(|p| p.id == id).map(|p| p.status)
    }
}

#[derive(Debug)]
struct Accumulator {
    first_seen: f64,
    last_seen: f64,
    samples: Vec<Isometry3<f64>>,
    outliers: usize,
}

impl Accumulator {
    fn new(t: f64, sample: Isometry3<f64>) -> Self {
        Self {
            first_seen: t,
            last_seen: t,
            samples: vec![sample],
            outliers: 0,
        }
    }

    fn mean(&self) -> Option<Isometry3<f64>> {
        let positions: Vec<(Vector3<f64>, f64)> = self
            .samples
            .iter()
            .map(|s| (s.translation.vector, 1.0))
            .collect();
        let rotations: Vec<(UnitQuaternion<f64>, f64)> =
            self.samples.iter().map(|s| (s.rotation, 1.0)).collect();
        Some(Isometry3::from_parts(
            Translation3::from(weighted_mean(&positions)?),
            average_quaternions(&rotations)?,
        ))
    }
}

/// 1トラッカーのマーカーオフセットを観測から構築する
///
/// ルート（恒等オフセット）から始め、校正済みマーカーと同時に写った
/// マーカーの相対姿勢を蓄積・平均して1つずつ追加する。
pub struct TrackerCalibrator {
    model: RigidBodyModel,
    layout: MarkerLayout,
    estimator: PoseEstimator,
    config: CalibrationConfig,
    accumulators: BTreeMap<MarkerId, Accumulator>,
    active: Option<MarkerId>,
    observations: VecDeque<FrameObservation>,
    last_refine: Option<f64>,
    calibrated_in_run: usize,
    root_changed: bool,
}

impl TrackerCalibrator {
    /// model: 既存モデル（追加校正）または空のモデル
    pub fn new(model: RigidBodyModel, layout: MarkerLayout, config: CalibrationConfig, marker_size: f64) -> Self {
        Self {
            model,
            layout,
            estimator: PoseEstimator::new(marker_size),
            config,
            accumulators: BTreeMap::new(),
            active: None,
            observations: VecDeque::new(),
            last_refine: None,
            calibrated_in_run: 0,
            root_changed: false,
        }
    }

    pub fn tracker_id(&self) -> usize {
        self.model.tracker_id
    }

    /// 現在の作業中モデル
    pub fn model(&self) -> &RigidBodyModel {
        &self.model
    }

    pub fn active_marker(&self) -> Option<MarkerId> {
        self.active
    }

    /// ルートマーカーを指定（明示的なトリガー）
    pub fn designate_root(&mut self, id: MarkerId) -> Result<(), CalibrationError> {
        let tracker = self.model.tracker_id;
        let owner = self.layout.tracker_of(id);
        if owner != tracker {
            return Err(CalibrationError::ForeignMarker { id, owner, tracker });
        }
        if self.model.root != Some(id) {
            self.model.set_root(id);
            self.accumulators.clear();
            self.active = None;
            self.observations.clear();
            self.root_changed = true;
            tracing::info!(tracker, root = id, "root marker designated");
        }
        Ok(())
    }

    /// 1フレーム分の検出結果を取り込む
    pub fn observe(
        &mut self,
        camera: &CameraIntrinsics,
        detections: &[MarkerDetection],
        timestamp: f64,
    ) -> CalibrationReport {
        let tracker = self.model.tracker_id;
        let own: Vec<MarkerDetection> = detections
            .iter()
            .filter(|d| self.layout.owns(tracker, d.id))
            .cloned()
            .collect();

        let mut report = CalibrationReport::default();
        if own.is_empty() || self.model.root.is_none() {
            report.active = self.active;
            return report;
        }

        if own.len() >= 2 {
            self.observations.push_back(FrameObservation {
                camera: *camera,
                detections: own.clone(),
            });
            while self.observations.len() > self.config.max_observations {
                self.observations.pop_front();
            }
        }

        let tracker_pose = match self.estimator.estimate(&own, &self.model, camera, None) {
            Ok(est) => Some(est.pose),
            Err(EstimateError::NoMarkersMatched) => None,
            Err(e) => {
                tracing::warn!(tracker, "calibration frame skipped: {e}");
                None
            }
        };

        // 1度に1マーカーのみ。蓄積中のマーカーが見えていればそれを優先
        let mut claimed = self.active.filter(|id| own.iter().any(|d| d.id == *id));

        for det in &own {
            if self.model.is_calibrated(det.id) {
                report.progress.push(MarkerProgress {
                    id: det.id,
                    status: MarkerStatus::Anchor,
                });
                continue;
            }
            let status = match tracker_pose {
                None => MarkerStatus::NoAnchorVisible,
                Some(tracker_pose) if claimed.map_or(true, |id| id == det.id) => {
                    let status = self.accumulate(det, camera, &tracker_pose, timestamp, &mut report);
                    if matches!(status, MarkerStatus::Calibrating { .. } | MarkerStatus::Calibrated) {
                        claimed = Some(det.id);
                    }
                    status
                }
                Some(_) => MarkerStatus::Waiting,
            };
            report.progress.push(MarkerProgress { id: det.id, status });
        }

        let due = self
            .last_refine
            .map_or(true, |t| timestamp - t >= self.config.refine_interval);
        if !report.newly_calibrated.is_empty() || due {
            report.refined = self.refine();
            self.last_refine = Some(timestamp);
        }

        report.active = self.active;
        report
    }

    fn accumulate(
        &mut self,
        det: &MarkerDetection,
        camera: &CameraIntrinsics,
        tracker_pose: &Isometry3<f64>,
        timestamp: f64,
        report: &mut CalibrationReport,
    ) -> MarkerStatus {
        let tracker = self.model.tracker_id;
        let marker = match self.estimator.estimate_marker(det, camera) {
            Ok(est) if !est.ambiguous => est,
            _ => return MarkerStatus::Rejected,
        };

        let distance = marker.pose.translation.vector.norm();
        if distance > self.config.distance_threshold {
            return MarkerStatus::TooFar { distance };
        }

        let sample = tracker_pose.inverse() * marker.pose;
        let id = det.id;
        self.active = Some(id);

        let acc = match self.accumulators.get_mut(&id) {
            Some(acc) => acc,
            None => {
                self.accumulators.insert(id, Accumulator::new(timestamp, sample));
                self.model.set_state(id, CalibrationState::Calibrating);
                tracing::debug!(tracker, marker = id, "calibrating marker");
                return MarkerStatus::Calibrating {
                    samples: 1,
                    elapsed: 0.0,
                };
            }
        };

        // 途切れた観測は連続とみなさない
        if timestamp - acc.last_seen > MAX_OBSERVATION_GAP {
            tracing::debug!(tracker, marker = id, gap = timestamp - acc.last_seen, "marker reappeared, restarting");
            *acc = Accumulator::new(timestamp, sample);
            return MarkerStatus::Calibrating {
                samples: 1,
                elapsed: 0.0,
            };
        }
        acc.last_seen = timestamp;

        let Some(mean) = acc.mean() else {
            return MarkerStatus::Rejected;
        };
        let d_pos = (sample.translation.vector - mean.translation.vector).norm();
        let d_rot = sample.rotation.angle_to(&mean.rotation).to_degrees();
        if d_pos > self.config.position_tolerance || d_rot > self.config.angle_tolerance_deg {
            acc.outliers += 1;
            if acc.outliers >= MAX_CONSECUTIVE_OUTLIERS {
                tracing::debug!(tracker, marker = id, d_pos, d_rot, "marker unstable, restarting");
                *acc = Accumulator::new(timestamp, sample);
            }
            return MarkerStatus::Calibrating {
                samples: acc.samples.len(),
                elapsed: timestamp - acc.first_seen,
            };
        }

        acc.outliers = 0;
        acc.samples.push(sample);
        let elapsed = timestamp - acc.first_seen;
        let samples = acc.samples.len();
        if elapsed < self.config.min_duration || samples < self.config.min_samples {
            return MarkerStatus::Calibrating { samples, elapsed };
        }

        let Some(offset) = acc.mean() else {
            return MarkerStatus::Rejected;
        };
        self.model.insert_calibrated(id, &offset);
        self.accumulators.remove(&id);
        self.active = None;
        self.calibrated_in_run += 1;
        report.newly_calibrated.push(id);
        tracing::info!(
            tracker,
            marker = id,
            samples,
            x = offset.translation.vector.x,
            y = offset.translation.vector.y,
            z = offset.translation.vector.z,
            "marker calibrated"
        );
        MarkerStatus::Calibrated
    }

    /// 蓄積した観測で全体最適化
    pub fn refine(&mut self) -> Option<RefineReport> {
        if self.model.calibrated_count() < 2 {
            return None;
        }
        let observations: Vec<FrameObservation> = self.observations.iter().cloned().collect();
        refine_model(
            &mut self.model,
            &observations,
            &self.estimator,
            self.config.max_refine_frames,
        )
    }

    /// 校正を終了してモデルを返す
    ///
    /// 途中のマーカーは破棄。何も校正できていなければ InsufficientSamples。
    pub fn finish(mut self) -> Result<RigidBodyModel, CalibrationError> {
        let tracker = self.model.tracker_id;
        self.model.drop_in_progress();
        if self.calibrated_in_run == 0 && !self.root_changed {
            tracing::warn!(tracker, "calibration finished without new markers");
            return Err(CalibrationError::InsufficientSamples { tracker });
        }
        if let Some(r) = self.refine() {
            tracing::info!(tracker, final_rms = r.final_rms, "final refinement");
        }
        tracing::info!(tracker, markers = self.model.calibrated_count(), "calibration finished");
        Ok(self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{render_detections, render_detections_with, uniform_noise, SyntheticCamera};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const MARKER_SIZE: f64 = 0.05;
    const FPS: f64 = 30.0;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480)
    }

    fn camera() -> SyntheticCamera {
        SyntheticCamera::new(0, intrinsics(), Isometry3::identity())
    }

    fn truth() -> RigidBodyModel {
        let mut m = RigidBodyModel::new(0);
        m.set_root(0);
        m.insert_calibrated(1, &Isometry3::new(Vector3::new(0.075, 0.0, -0.015), Vector3::new(0.0, 0.55, 0.0)));
        m.insert_calibrated(2, &Isometry3::new(Vector3::new(-0.075, 0.005, -0.015), Vector3::new(0.0, -0.55, 0.0)));
        m
    }

    /// 傾けたトラッカーをゆっくり揺らす
    fn tracker_pose(t: f64, z: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.01 * (t * 1.3).sin(), -0.01, z),
            UnitQuaternion::from_euler_angles(
                std::f64::consts::PI + 0.35,
                0.25 * (t * 0.9).sin(),
                0.1,
            ),
        )
    }

    fn calibrator() -> TrackerCalibrator {
        let mut cal = TrackerCalibrator::new(
            RigidBodyModel::new(0),
            MarkerLayout::default(),
            CalibrationConfig::default(),
            MARKER_SIZE,
        );
        cal.designate_root(0).unwrap();
        cal
    }

    #[test]
    fn test_calibration_converges_on_noisy_samples() {
        let gt = truth();
        let mut cal = calibrator();
        let mut rng = StdRng::seed_from_u64(7);

        let mut calibrated = Vec::new();
        for i in 0..(8.0 * FPS) as usize {
            let t = i as f64 / FPS;
            let dets = render_detections_with(&camera(), &tracker_pose(t, 0.35), &gt, MARKER_SIZE, |_| {
                uniform_noise(&mut rng, 0.3)
            });
            let report = cal.observe(&intrinsics(), &dets, t);
            calibrated.extend(report.newly_calibrated);
        }
        calibrated.sort();
        assert_eq!(calibrated, vec![1, 2]);

        let model = cal.finish().unwrap();
        assert_eq!(model.validate(), Ok(()));
        for id in [1, 2] {
            let est = model.marker_pose(id).unwrap();
            let want = gt.marker_pose(id).unwrap();
            let dp = (est.translation.vector - want.translation.vector).norm();
            let dr = est.rotation.angle_to(&want.rotation).to_degrees();
            assert!(dp < 0.01, "marker {id}: position error {dp}");
            assert!(dr < 3.0, "marker {id}: rotation error {dr}");
        }
    }

    #[test]
    fn test_one_marker_at_a_time() {
        let gt = truth();
        let mut cal = calibrator();
        let dets = render_detections(&camera(), &tracker_pose(0.0, 0.35), &gt, MARKER_SIZE);
        assert_eq!(dets.len(), 3);
        let report = cal.observe(&intrinsics(), &dets, 0.0);
        assert_eq!(report.status_of(0), Some(MarkerStatus::Anchor));
        let calibrating = report
            .progress
            .iter()
            .filter(|p| matches!(p.status, MarkerStatus::Calibrating { .. }))
            .count();
        let waiting = report
            .progress
            .iter()
            .filter(|p| p.status == MarkerStatus::Waiting)
            .count();
        assert_eq!(calibrating, 1);
        assert_eq!(waiting, 1);
        assert!(report.active.is_some());
    }

    #[test]
    fn test_marker_too_far() {
        let gt = truth();
        let mut cal = calibrator();
        let dets = render_detections(&camera(), &tracker_pose(0.0, 0.7), &gt, MARKER_SIZE);
        let report = cal.observe(&intrinsics(), &dets, 0.0);
        assert!(report
            .progress
            .iter()
            .any(|p| matches!(p.status, MarkerStatus::TooFar { distance } if distance > 0.5)));
        assert!(report.active.is_none());
    }

    #[test]
    fn test_no_anchor_visible() {
        let gt = truth();
        let mut cal = calibrator();
        let dets: Vec<_> = render_detections(&camera(), &tracker_pose(0.0, 0.35), &gt, MARKER_SIZE)
            .into_iter()
            .filter(|d| d.id != 0)
            .collect();
        let report = cal.observe(&intrinsics(), &dets, 0.0);
        assert_eq!(report.status_of(1), Some(MarkerStatus::NoAnchorVisible));
        assert_eq!(report.status_of(2), Some(MarkerStatus::NoAnchorVisible));
    }

    #[test]
    fn test_requires_min_duration() {
        let gt = truth();
        let mut cal = calibrator();
        // 1秒未満ではサンプルが多くても確定しない
        for i in 0..25 {
            let t = i as f64 * 0.02;
            let dets = render_detections(&camera(), &tracker_pose(t, 0.35), &gt, MARKER_SIZE);
            let report = cal.observe(&intrinsics(), &dets, t);
            assert!(report.newly_calibrated.is_empty());
        }
    }

    #[test]
    fn test_occlusion_restarts_duration() {
        let mut gt = truth();
        gt.markers.remove(&2);
        let mut cal = calibrator();

        for i in 0..3 {
            let t = i as f64 / FPS;
            let dets = render_detections(&camera(), &tracker_pose(t, 0.35), &gt, MARKER_SIZE);
            cal.observe(&intrinsics(), &dets, t);
        }

        // 5秒隠れた後に再び見える
        let resume = 5.0;
        let mut calibrated_at = None;
        for i in 0..(3.0 * FPS) as usize {
            let t = resume + i as f64 / FPS;
            let dets = render_detections(&camera(), &tracker_pose(t, 0.35), &gt, MARKER_SIZE);
            let report = cal.observe(&intrinsics(), &dets, t);
            if i == 0 {
                assert_eq!(
                    report.status_of(1),
                    Some(MarkerStatus::Calibrating {
                        samples: 1,
                        elapsed: 0.0
                    })
                );
            }
            if report.newly_calibrated.contains(&1) {
                calibrated_at = Some(t);
                break;
            }
        }
        let calibrated_at = calibrated_at.expect("marker 1 never calibrated");
        assert!(
            calibrated_at - resume >= 1.0 - 1e-9,
            "calibrated after {} s of continuous observation",
            calibrated_at - resume
        );
    }

    #[test]
    fn test_finish_without_samples_is_insufficient() {
        let mut cal = TrackerCalibrator::new(truth(), MarkerLayout::default(), CalibrationConfig::default(), MARKER_SIZE);
        cal.designate_root(0).unwrap();
        let err = cal.finish().unwrap_err();
        assert_eq!(err, CalibrationError::InsufficientSamples { tracker: 0 });
    }

    #[test]
    fn test_finish_drops_in_progress_markers() {
        let gt = truth();
        let mut cal = calibrator();
        let dets = render_detections(&camera(), &tracker_pose(0.0, 0.35), &gt, MARKER_SIZE);
        cal.observe(&intrinsics(), &dets, 0.0);
        let model = cal.finish().unwrap();
        assert_eq!(model.calibrated_ids(), vec![0]);
        assert!(model
            .markers
            .values()
            .all(|m| m.state == CalibrationState::Calibrated));
    }

    #[test]
    fn test_foreign_root_rejected() {
        let mut cal = calibrator();
        let err = cal.designate_root(50).unwrap_err();
        assert_eq!(
            err,
            CalibrationError::ForeignMarker {
                id: 50,
                owner: 1,
                tracker: 0
            }
        );
    }

    #[test]
    fn test_other_trackers_markers_ignored() {
        let mut other = RigidBodyModel::new(1);
        other.set_root(45);
        let mut cal = calibrator();
        let dets = render_detections(&camera(), &tracker_pose(0.0, 0.35), &other, MARKER_SIZE);
        assert_eq!(dets.len(), 1);
        let report = cal.observe(&intrinsics(), &dets, 0.0);
        assert!(report.progress.is_empty());
    }
}
