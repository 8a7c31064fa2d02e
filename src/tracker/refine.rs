//! マーカーオフセットの全体最適化（バンドル調整）
//!
//! パラメータ: 各フレームのトラッカー姿勢 + ルート以外の各マーカーオフセット。
//! ルートは固定（ゲージ）。最小化するのは全コーナーの再投影誤差の二乗和。

use nalgebra::{DMatrix, DVector, Isometry3, Point2};
use std::collections::BTreeMap;

use super::estimator::{perturb, PoseEstimator};
use super::model::RigidBodyModel;
use crate::camera::CameraIntrinsics;
use crate::marker::{marker_corners, MarkerDetection, MarkerId};
use crate::solver::{self, NllsProblem, SolveOptions};

const BEHIND_CAMERA_PENALTY: f64 = 1e3;

/// 1フレーム分の観測（このトラッカーのマーカーのみ）
#[derive(Debug, Clone)]
pub struct FrameObservation {
    pub camera: CameraIntrinsics,
    pub detections: Vec<MarkerDetection>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineReport {
    pub frames: usize,
    pub markers: usize,
    /// ピクセル
    pub initial_rms: f64,
    pub final_rms: f64,
    /// 誤差が下がりモデルに反映された
    pub applied: bool,
}

/// 校正済みマーカーが2つ以上写ったフレームでオフセットを最適化する
///
/// 誤差が下がらなければモデルは変更しない。
pub fn refine_model(
    model: &mut RigidBodyModel,
    observations: &[FrameObservation],
    estimator: &PoseEstimator,
    max_frames: usize,
) -> Option<RefineReport> {
    let root = model.root?;
    let usable: Vec<&FrameObservation> = observations
        .iter()
        .filter(|o| o.detections.iter().filter(|d| model.is_calibrated(d.id)).count() >= 2)
        .collect();
    if usable.is_empty() {
        return None;
    }
    let selected = subsample(&usable, max_frames.max(1));

    let mut frames = Vec::new();
    for obs in selected {
        let Ok(est) = estimator.estimate(&obs.detections, model, &obs.camera, None) else {
            continue;
        };
        let detections: Vec<MarkerDetection> = obs
            .detections
            .iter()
            .filter(|d| model.is_calibrated(d.id))
            .cloned()
            .collect();
        frames.push(BaFrame {
            camera: obs.camera,
            pose: est.pose,
            detections,
        });
    }
    if frames.is_empty() {
        return None;
    }

    // 最適化対象のマーカー（ルート以外で観測されたもの）
    let mut marker_index: BTreeMap<MarkerId, usize> = BTreeMap::new();
    let mut marker_init = Vec::new();
    for f in &frames {
        for d in &f.detections {
            if d.id == root || marker_index.contains_key(&d.id) {
                continue;
            }
            if let Some(pose) = model.marker_pose(d.id) {
                marker_index.insert(d.id, marker_init.len());
                marker_init.push(pose);
            }
        }
    }
    if marker_init.is_empty() {
        return None;
    }

    let problem = BundleProblem::new(frames, marker_init, &marker_index, root, estimator.marker_size());
    let x0 = DVector::zeros(problem.param_count());
    let initial_cost = solver::cost(&problem, &x0);
    let (x, report) = solver::solve(&problem, x0, &SolveOptions::default());
    let final_cost = if report.final_cost.is_finite() {
        solver::cost(&problem, &x)
    } else {
        f64::INFINITY
    };

    let n_points = problem.point_count() as f64;
    let rms = |cost: f64| (2.0 * cost / n_points).sqrt();
    let applied = final_cost <= initial_cost;
    if applied {
        for (id, k) in &marker_index {
            model.insert_calibrated(*id, &problem.marker_at(&x, *k));
        }
    }

    let out = RefineReport {
        frames: problem.frames.len(),
        markers: marker_index.len(),
        initial_rms: rms(initial_cost),
        final_rms: rms(final_cost),
        applied,
    };
    tracing::debug!(
        tracker = model.tracker_id,
        frames = out.frames,
        markers = out.markers,
        initial_rms = out.initial_rms,
        final_rms = out.final_rms,
        applied,
        "bundle adjustment"
    );
    Some(out)
}

/// 等間隔に最大 n 個取り出す
fn subsample<'a, T>(items: &[&'a T], n: usize) -> Vec<&'a T> {
    if items.len() <= n {
        return items.to_vec();
    }
    (0..n).map(|i| items[i * items.len() / n]).collect()
}

struct BaFrame {
    camera: CameraIntrinsics,
    pose: Isometry3<f64>,
    detections: Vec<MarkerDetection>,
}

/// 1マーカー観測 = 8残差
struct Term {
    frame: usize,
    /// None ならルート
    marker: Option<usize>,
    corners: [Point2<f64>; 4],
    row: usize,
}

struct BundleProblem {
    frames: Vec<BaFrame>,
    marker_init: Vec<Isometry3<f64>>,
    terms: Vec<Term>,
    terms_of_frame: Vec<Vec<usize>>,
    terms_of_marker: Vec<Vec<usize>>,
    marker_size: f64,
}

impl BundleProblem {
    fn new(
        frames: Vec<BaFrame>,
        marker_init: Vec<Isometry3<f64>>,
        marker_index: &BTreeMap<MarkerId, usize>,
        root: MarkerId,
        marker_size: f64,
    ) -> Self {
        let mut terms = Vec::new();
        let mut terms_of_frame = vec![Vec::new(); frames.len()];
        let mut terms_of_marker = vec![Vec::new(); marker_init.len()];
        for (fi, f) in frames.iter().enumerate() {
            for d in &f.detections {
                let marker = if d.id == root {
                    None
                } else {
                    match marker_index.get(&d.id) {
                        Some(k) => Some(*k),
                        None => continue,
                    }
                };
                let t = terms.len();
                terms_of_frame[fi].push(t);
                if let Some(k) = marker {
                    terms_of_marker[k].push(t);
                }
                terms.push(Term {
                    frame: fi,
                    marker,
                    corners: d.corners,
                    row: t * 8,
                });
            }
        }
        Self {
            frames,
            marker_init,
            terms,
            terms_of_frame,
            terms_of_marker,
            marker_size,
        }
    }

    fn param_count(&self) -> usize {
        6 * (self.frames.len() + self.marker_init.len())
    }

    fn point_count(&self) -> usize {
        self.terms.len() * 4
    }

    fn frame_at(&self, x: &DVector<f64>, f: usize) -> Isometry3<f64> {
        perturb(&self.frames[f].pose, &x.as_slice()[6 * f..6 * f + 6])
    }

    fn marker_at(&self, x: &DVector<f64>, k: usize) -> Isometry3<f64> {
        let o = 6 * (self.frames.len() + k);
        perturb(&self.marker_init[k], &x.as_slice()[o..o + 6])
    }

    fn term_residual(&self, x: &DVector<f64>, term: &Term) -> [f64; 8] {
        let frame = self.frame_at(x, term.frame);
        let offset = match term.marker {
            Some(k) => self.marker_at(x, k),
            None => Isometry3::identity(),
        };
        let camera_from_marker = frame * offset;
        let camera = &self.frames[term.frame].camera;
        let mut r = [0.0; 8];
        for (i, c) in marker_corners(self.marker_size).iter().enumerate() {
            match camera.project(&(camera_from_marker * c)) {
                Some(p) => {
                    r[2 * i] = p.x - term.corners[i].x;
                    r[2 * i + 1] = p.y - term.corners[i].y;
                }
                None => {
                    r[2 * i] = BEHIND_CAMERA_PENALTY;
                    r[2 * i + 1] = BEHIND_CAMERA_PENALTY;
                }
            }
        }
        r
    }

    /// ブロックごとの中心差分（影響する残差行だけ再計算）
    fn block_columns(&self, x: &DVector<f64>, col0: usize, terms: &[usize], jac: &mut DMatrix<f64>) {
        let mut xp = x.clone();
        for j in 0..6 {
            let col = col0 + j;
            let h = 1e-6;
            let orig = xp[col];
            xp[col] = orig + h;
            let plus: Vec<[f64; 8]> = terms.iter().map(|t| self.term_residual(&xp, &self.terms[*t])).collect();
            xp[col] = orig - h;
            let minus: Vec<[f64; 8]> = terms.iter().map(|t| self.term_residual(&xp, &self.terms[*t])).collect();
            xp[col] = orig;
            for ((t, p), m) in terms.iter().zip(&plus).zip(&minus) {
                let row = self.terms[*t].row;
                for i in 0..8 {
                    jac[(row + i, col)] = (p[i] - m[i]) / (2.0 * h);
                }
            }
        }
    }
}

impl NllsProblem for BundleProblem {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut r = DVector::zeros(self.terms.len() * 8);
        for term in &self.terms {
            let tr = self.term_residual(x, term);
            r.rows_mut(term.row, 8).copy_from_slice(&tr);
        }
        r
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.terms.len() * 8, self.param_count());
        for (f, terms) in self.terms_of_frame.iter().enumerate() {
            self.block_columns(x, 6 * f, terms, &mut jac);
        }
        let base = 6 * self.frames.len();
        for (k, terms) in self.terms_of_marker.iter().enumerate() {
            self.block_columns(x, base + 6 * k, terms, &mut jac);
        }
        jac
    }
}
