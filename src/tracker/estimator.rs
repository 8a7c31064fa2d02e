use nalgebra::{DVector, Isometry3, Point2, Point3, Translation3, UnitQuaternion, Vector3};
use thiserror::Error;

use super::model::{ModelError, RigidBodyModel};
use crate::camera::CameraIntrinsics;
use crate::geometry::{decompose_planar, dlt_homography};
use crate::marker::{marker_corners, MarkerDetection};
use crate::solver::{self, NllsProblem, SolveOptions};

/// 2候補の再投影誤差がこの比以内なら曖昧とみなす
const AMBIGUITY_RATIO: f64 = 1.2;
/// 別解とみなす最小の回転差（度）
const AMBIGUITY_MIN_ANGLE_DEG: f64 = 5.0;
/// カメラ後方に落ちた点の残差（ピクセル）
const BEHIND_CAMERA_PENALTY: f64 = 1e3;

#[derive(Debug, Error, PartialEq)]
pub enum EstimateError {
    #[error("no calibrated marker of this tracker is visible")]
    NoMarkersMatched,
    #[error("malformed tracker model: {0}")]
    MalformedModel(#[from] ModelError),
    #[error("pose solve failed")]
    SolveFailed,
}

/// 1フレーム分の推定結果
#[derive(Debug, Clone, Copy)]
pub struct PoseEstimate {
    /// トラッカー座標系 → カメラ座標系
    pub pose: Isometry3<f64>,
    /// 再投影誤差RMS（ピクセル）
    pub rms_error: f64,
    pub confidence: f64,
    pub markers_used: usize,
    /// 平面の表裏反転解がほぼ同じ誤差で存在した
    pub ambiguous: bool,
}

/// 検出結果 + モデル + 内部パラメータ → トラッカー姿勢
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    marker_size: f64,
    options: SolveOptions,
}

impl PoseEstimator {
    pub fn new(marker_size: f64) -> Self {
        Self {
            marker_size,
            options: SolveOptions {
                ftol: 1e-10,
                xtol: 1e-10,
                gtol: 1e-10,
                patience: 30,
            },
        }
    }

    pub fn marker_size(&self) -> f64 {
        self.marker_size
    }

    /// モデル内の校正済みマーカー全てを1つのPnPとして解く
    ///
    /// prior: 前フレームの姿勢（あれば初期値候補に加える）
    pub fn estimate(
        &self,
        detections: &[MarkerDetection],
        model: &RigidBodyModel,
        camera: &CameraIntrinsics,
        prior: Option<&Isometry3<f64>>,
    ) -> Result<PoseEstimate, EstimateError> {
        if let Err(e) = model.validate() {
            tracing::error!(tracker = model.tracker_id, "refusing to estimate: {e}");
            return Err(e.into());
        }

        let mut object = Vec::new();
        let mut image = Vec::new();
        let mut markers_used = 0;
        // 初期値は画像上で最も大きいマーカーから
        let mut seed: Option<(&MarkerDetection, Isometry3<f64>, f64)> = None;

        for det in detections {
            let Some(offset) = model.marker_pose(det.id) else {
                continue;
            };
            let corners = marker_corners(self.marker_size);
            for (c, px) in corners.iter().zip(&det.corners) {
                object.push(offset * c);
                image.push(*px);
            }
            markers_used += 1;

            let perimeter = det.perimeter();
            if seed.map_or(true, |(_, _, p)| perimeter > p) {
                seed = Some((det, offset, perimeter));
            }
        }

        let Some((seed_det, seed_offset, _)) = seed else {
            return Err(EstimateError::NoMarkersMatched);
        };

        let marker_to_tracker = seed_offset.inverse();
        let mut candidates: Vec<Isometry3<f64>> = self
            .marker_candidates(seed_det, camera)
            .into_iter()
            .map(|t| t * marker_to_tracker)
            .collect();
        if let Some(p) = prior {
            candidates.push(*p);
        }

        let mut estimate = self.solve(&object, &image, camera, &candidates)?;
        estimate.markers_used = markers_used;
        estimate.confidence = markers_used as f64 / (1.0 + estimate.rms_error);
        if estimate.ambiguous {
            tracing::debug!(
                tracker = model.tracker_id,
                rms = estimate.rms_error,
                "ambiguous pose resolved by reprojection error"
            );
        }
        Ok(estimate)
    }

    /// 単一マーカーの姿勢（マーカー座標系 → カメラ座標系）
    pub fn estimate_marker(
        &self,
        detection: &MarkerDetection,
        camera: &CameraIntrinsics,
    ) -> Result<PoseEstimate, EstimateError> {
        let object = marker_corners(self.marker_size);
        let candidates = self.marker_candidates(detection, camera);
        let mut estimate = self.solve(&object, &detection.corners, camera, &candidates)?;
        estimate.markers_used = 1;
        estimate.confidence = 1.0 / (1.0 + estimate.rms_error);
        Ok(estimate)
    }

    /// ホモグラフィ分解による初期姿勢（マーカー → カメラ）
    fn marker_candidates(&self, det: &MarkerDetection, camera: &CameraIntrinsics) -> Vec<Isometry3<f64>> {
        let plane: Vec<Point2<f64>> = marker_corners(self.marker_size)
            .iter()
            .map(|c| Point2::new(c.x, c.y))
            .collect();
        let normalized: Vec<Point2<f64>> = det.corners.iter().map(|p| camera.normalize_point(p)).collect();

        let Some(candidates) = dlt_homography(&plane, &normalized).and_then(|h| decompose_planar(&h)) else {
            return Vec::new();
        };
        std::iter::once(candidates.primary)
            .chain(candidates.flipped)
            .collect()
    }

    /// 各候補からLMで再投影誤差を最小化し、最良の解を返す
    fn solve(
        &self,
        object: &[Point3<f64>],
        image: &[Point2<f64>],
        camera: &CameraIntrinsics,
        candidates: &[Isometry3<f64>],
    ) -> Result<PoseEstimate, EstimateError> {
        let mut solved: Vec<(Isometry3<f64>, f64)> = Vec::with_capacity(candidates.len());
        for init in candidates {
            let problem = ReprojectionProblem {
                object,
                image,
                camera,
                base: *init,
            };
            let (x, report) = solver::solve(&problem, DVector::zeros(6), &self.options);
            if !report.final_cost.is_finite() {
                continue;
            }
            let pose = problem.pose_at(&x);
            if let Some(rms) = reprojection_rms(&pose, object, image, camera) {
                solved.push((pose, rms));
            }
        }

        solved.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (pose, rms_error) = *solved.first().ok_or(EstimateError::SolveFailed)?;

        let ambiguous = solved.iter().skip(1).any(|(other, err)| {
            *err <= rms_error.max(1e-6) * AMBIGUITY_RATIO
                && other.rotation.angle_to(&pose.rotation) > AMBIGUITY_MIN_ANGLE_DEG.to_radians()
        });

        Ok(PoseEstimate {
            pose,
            rms_error,
            confidence: 1.0 / (1.0 + rms_error),
            markers_used: 0,
            ambiguous,
        })
    }
}

/// 全点がカメラ前方にあるときのみ RMS を返す
pub fn reprojection_rms(
    pose: &Isometry3<f64>,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    camera: &CameraIntrinsics,
) -> Option<f64> {
    if object.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    for (o, px) in object.iter().zip(image) {
        let proj = camera.project(&(pose * o))?;
        sum += (proj - px).norm_squared();
    }
    Some((sum / object.len() as f64).sqrt())
}

/// 6自由度: [回転ベクトル(3), 並進差分(3)] を base に左から掛ける
struct ReprojectionProblem<'a> {
    object: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
    camera: &'a CameraIntrinsics,
    base: Isometry3<f64>,
}

impl ReprojectionProblem<'_> {
    fn pose_at(&self, x: &DVector<f64>) -> Isometry3<f64> {
        perturb(&self.base, &x.as_slice()[..6])
    }
}

impl NllsProblem for ReprojectionProblem<'_> {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let pose = self.pose_at(x);
        let mut r = DVector::zeros(self.object.len() * 2);
        for (i, (o, px)) in self.object.iter().zip(self.image).enumerate() {
            match self.camera.project(&(pose * o)) {
                Some(p) => {
                    r[2 * i] = p.x - px.x;
                    r[2 * i + 1] = p.y - px.y;
                }
                None => {
                    r[2 * i] = BEHIND_CAMERA_PENALTY;
                    r[2 * i + 1] = BEHIND_CAMERA_PENALTY;
                }
            }
        }
        r
    }
}

/// 姿勢の局所摂動 [ω, δt]
pub(crate) fn perturb(base: &Isometry3<f64>, d: &[f64]) -> Isometry3<f64> {
    let dr = UnitQuaternion::from_scaled_axis(Vector3::new(d[0], d[1], d[2]));
    Isometry3::from_parts(
        Translation3::from(base.translation.vector + Vector3::new(d[3], d[4], d[5])),
        dr * base.rotation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{render_detections, render_detections_with, uniform_noise, SyntheticCamera};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const MARKER_SIZE: f64 = 0.05;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480)
            .with_distortion([-0.1, 0.02, 0.0005, -0.0003, 0.0])
    }

    fn facing(translation: Vector3<f64>, tilt: Vector3<f64>) -> Isometry3<f64> {
        // x軸周り180°で正面向き
        Isometry3::from_parts(
            Translation3::from(translation),
            UnitQuaternion::from_scaled_axis(tilt) * UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0),
        )
    }

    fn two_marker_model() -> RigidBodyModel {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(
            1,
            &Isometry3::new(Vector3::new(0.08, 0.0, -0.02), Vector3::new(0.0, 0.6, 0.0)),
        );
        model
    }

    fn detect(model: &RigidBodyModel, pose: &Isometry3<f64>) -> Vec<MarkerDetection> {
        let cam = SyntheticCamera::new(0, camera(), Isometry3::identity());
        render_detections(&cam, pose, model, MARKER_SIZE)
    }

    #[test]
    fn test_single_marker_noiseless_recovery() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        let gt = facing(Vector3::new(0.05, -0.03, 0.6), Vector3::new(0.3, -0.2, 0.1));
        let dets = detect(&model, &gt);
        assert_eq!(dets.len(), 1);

        let est = PoseEstimator::new(MARKER_SIZE)
            .estimate(&dets, &model, &camera(), None)
            .unwrap();
        assert!((est.pose.translation.vector - gt.translation.vector).norm() < 1e-3);
        assert!(est.pose.rotation.angle_to(&gt.rotation).to_degrees() < 0.1);
        assert!(est.rms_error < 1e-3);
        assert_eq!(est.markers_used, 1);
    }

    #[test]
    fn test_multi_marker_matches_each_marker_alone() {
        let model = two_marker_model();
        let gt = facing(Vector3::new(-0.02, 0.01, 0.7), Vector3::new(0.1, 0.25, 0.0));
        let dets = detect(&model, &gt);
        assert_eq!(dets.len(), 2);

        let estimator = PoseEstimator::new(MARKER_SIZE);
        let both = estimator.estimate(&dets, &model, &camera(), None).unwrap();
        assert_eq!(both.markers_used, 2);
        for d in &dets {
            let alone = estimator
                .estimate(std::slice::from_ref(d), &model, &camera(), None)
                .unwrap();
            assert!((alone.pose.translation.vector - both.pose.translation.vector).norm() < 1e-3);
            assert!(alone.pose.rotation.angle_to(&both.pose.rotation).to_degrees() < 0.1);
        }
    }

    #[test]
    fn test_uncalibrated_markers_ignored() {
        let mut model = two_marker_model();
        let gt = facing(Vector3::new(0.0, 0.0, 0.6), Vector3::zeros());
        let dets = detect(&model, &gt);
        assert_eq!(dets.len(), 2);
        model.set_state(1, crate::tracker::CalibrationState::Calibrating);
        let est = PoseEstimator::new(MARKER_SIZE)
            .estimate(&dets, &model, &camera(), None)
            .unwrap();
        assert_eq!(est.markers_used, 1);
    }

    #[test]
    fn test_no_markers_matched() {
        let model = two_marker_model();
        let stranger = MarkerDetection::new(
            77,
            [
                Point2::new(100.0, 100.0),
                Point2::new(140.0, 100.0),
                Point2::new(140.0, 140.0),
                Point2::new(100.0, 140.0),
            ],
        );
        let err = PoseEstimator::new(MARKER_SIZE)
            .estimate(&[stranger], &model, &camera(), None)
            .unwrap_err();
        assert_eq!(err, EstimateError::NoMarkersMatched);
        let err = PoseEstimator::new(MARKER_SIZE)
            .estimate(&[], &model, &camera(), None)
            .unwrap_err();
        assert_eq!(err, EstimateError::NoMarkersMatched);
    }

    #[test]
    fn test_malformed_model_fails_loudly() {
        let mut model = two_marker_model();
        model.root = None;
        let gt = facing(Vector3::new(0.0, 0.0, 0.6), Vector3::zeros());
        let dets = detect(&two_marker_model(), &gt);
        let err = PoseEstimator::new(MARKER_SIZE)
            .estimate(&dets, &model, &camera(), None)
            .unwrap_err();
        assert!(matches!(err, EstimateError::MalformedModel(ModelError::MissingRoot { .. })));
    }

    #[test]
    fn test_prior_candidate_is_used() {
        let model = two_marker_model();
        let gt = facing(Vector3::new(0.03, 0.0, 0.8), Vector3::new(-0.2, 0.1, 0.0));
        let dets = detect(&model, &gt);
        let est = PoseEstimator::new(MARKER_SIZE)
            .estimate(&dets, &model, &camera(), Some(&gt))
            .unwrap();
        assert!((est.pose.translation.vector - gt.translation.vector).norm() < 1e-3);
    }

    fn root_only() -> RigidBodyModel {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model
    }

    #[test]
    fn test_small_far_marker_is_ambiguous() {
        let model = root_only();
        let cam = SyntheticCamera::new(0, camera(), Isometry3::identity());
        let gt = facing(Vector3::new(0.02, -0.01, 2.5), Vector3::new(0.2, 0.0, 0.0));
        let mut rng = StdRng::seed_from_u64(5);
        let dets = render_detections_with(&cam, &gt, &model, MARKER_SIZE, |_| uniform_noise(&mut rng, 0.3));
        assert_eq!(dets.len(), 1);

        let estimator = PoseEstimator::new(MARKER_SIZE);
        let est = estimator.estimate(&dets, &model, &camera(), None).unwrap();
        assert!(est.ambiguous);

        // 2つの初期値それぞれの収束先
        let object = marker_corners(MARKER_SIZE);
        let seeds = estimator.marker_candidates(&dets[0], &camera());
        assert_eq!(seeds.len(), 2);
        let solved: Vec<PoseEstimate> = seeds
            .iter()
            .map(|s| estimator.solve(&object, &dets[0].corners, &camera(), &[*s]).unwrap())
            .collect();
        assert!(solved[0].pose.rotation.angle_to(&solved[1].pose.rotation).to_degrees() > 5.0);

        let best = solved
            .iter()
            .min_by(|a, b| a.rms_error.total_cmp(&b.rms_error))
            .unwrap();
        assert!(est.rms_error <= best.rms_error + 1e-9);
        assert!(est.pose.rotation.angle_to(&best.pose.rotation) < 1e-4);
    }

    #[test]
    fn test_flipped_prior_does_not_win() {
        let model = root_only();
        let gt = facing(Vector3::new(0.03, 0.02, 0.4), Vector3::new(0.45, 0.0, 0.0));
        let dets = detect(&model, &gt);
        let estimator = PoseEstimator::new(MARKER_SIZE);

        let seeds = estimator.marker_candidates(&dets[0], &camera());
        assert_eq!(seeds.len(), 2);
        let flipped = seeds[1];
        assert!(flipped.rotation.angle_to(&gt.rotation).to_degrees() > 5.0);

        let est = estimator.estimate(&dets, &model, &camera(), Some(&flipped)).unwrap();
        assert!(!est.ambiguous);
        assert!((est.pose.translation.vector - gt.translation.vector).norm() < 1e-3);
        assert!(est.pose.rotation.angle_to(&gt.rotation).to_degrees() < 0.5);
    }

    #[test]
    fn test_estimate_marker_pose() {
        let model = {
            let mut m = RigidBodyModel::new(0);
            m.set_root(0);
            m
        };
        let gt = facing(Vector3::new(0.1, 0.05, 0.5), Vector3::new(0.0, -0.4, 0.0));
        let dets = detect(&model, &gt);
        let est = PoseEstimator::new(MARKER_SIZE)
            .estimate_marker(&dets[0], &camera())
            .unwrap();
        assert!((est.pose.translation.vector - gt.translation.vector).norm() < 1e-3);
        assert!(est.confidence > 0.99);
    }
}
