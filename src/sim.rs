//! 合成シーン（カメラなしでの動作確認・テスト用）

use anyhow::Result;
use nalgebra::{Isometry3, Point2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::camera::{CameraIntrinsics, FrameSource};
use crate::marker::{marker_corners, MarkerDetection, MarkerDetector};
use crate::tracker::RigidBodyModel;

/// これ以上斜めのマーカーは検出されない
const MAX_VIEW_ANGLE_DEG: f64 = 75.0;

/// 仮想カメラ
#[derive(Debug, Clone, Copy)]
pub struct SyntheticCamera {
    pub id: usize,
    pub intrinsics: CameraIntrinsics,
    /// カメラ座標系 → ワールド座標系
    pub pose: Isometry3<f64>,
}

impl SyntheticCamera {
    pub fn new(id: usize, intrinsics: CameraIntrinsics, pose: Isometry3<f64>) -> Self {
        Self { id, intrinsics, pose }
    }
}

/// トラッカー（ワールド姿勢 `tracker_pose`）の校正済みマーカーを描画して検出結果を作る
pub fn render_detections(
    camera: &SyntheticCamera,
    tracker_pose: &Isometry3<f64>,
    model: &RigidBodyModel,
    marker_size: f64,
) -> Vec<MarkerDetection> {
    render_detections_with(camera, tracker_pose, model, marker_size, |_| Point2::origin())
}

/// 各コーナーに `noise` の返すピクセルずれを加える
pub fn render_detections_with<F>(
    camera: &SyntheticCamera,
    tracker_pose: &Isometry3<f64>,
    model: &RigidBodyModel,
    marker_size: f64,
    mut noise: F,
) -> Vec<MarkerDetection>
where
    F: FnMut(usize) -> Point2<f64>,
{
    let camera_from_tracker = camera.pose.inverse() * tracker_pose;
    let corners = marker_corners(marker_size);
    let cos_limit = MAX_VIEW_ANGLE_DEG.to_radians().cos();

    let mut out = Vec::new();
    for id in model.calibrated_ids() {
        let Some(offset) = model.marker_pose(id) else {
            continue;
        };
        let marker = camera_from_tracker * offset;
        let centre = marker.translation.vector;
        let normal = marker.rotation * Vector3::z();
        // 表面がカメラを向いているか
        let Some(view) = (-centre).try_normalize(1e-12) else {
            continue;
        };
        if normal.dot(&view) < cos_limit {
            continue;
        }

        let mut px = [Point2::origin(); 4];
        let mut visible = true;
        for (i, c) in corners.iter().enumerate() {
            match camera.intrinsics.project(&(marker * c)) {
                Some(p) if camera.intrinsics.contains(&p) => {
                    let n = noise(i);
                    px[i] = Point2::new(p.x + n.x, p.y + n.y);
                }
                _ => {
                    visible = false;
                    break;
                }
            }
        }
        if visible {
            out.push(MarkerDetection::new(id, px));
        }
    }
    out
}

/// 一様ノイズ ±amplitude ピクセル
pub fn uniform_noise(rng: &mut StdRng, amplitude: f64) -> Point2<f64> {
    if amplitude <= 0.0 {
        return Point2::origin();
    }
    Point2::new(
        rng.gen_range(-amplitude..amplitude),
        rng.gen_range(-amplitude..amplitude),
    )
}

/// 検出結果をそのまま返す検出器（画像 = 描画済み検出結果）
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDetector;

impl MarkerDetector for SyntheticDetector {
    type Image = Vec<MarkerDetection>;

    fn detect(&mut self, image: &Vec<MarkerDetection>) -> Result<Vec<MarkerDetection>> {
        Ok(image.clone())
    }
}

/// 時刻 → 各トラッカーのワールド姿勢
pub type Motion = dyn Fn(f64) -> Vec<Isometry3<f64>> + Send + Sync;

/// 真値モデルと動きを持つ合成シーン
pub struct Scene {
    pub truth: Vec<RigidBodyModel>,
    pub marker_size: f64,
    pub motion: Box<Motion>,
}

impl Scene {
    pub fn render(&self, camera: &SyntheticCamera, t: f64, rng: &mut StdRng, noise_px: f64) -> Vec<MarkerDetection> {
        let poses = (self.motion)(t);
        let mut out = Vec::new();
        for (model, pose) in self.truth.iter().zip(&poses) {
            out.extend(render_detections_with(camera, pose, model, self.marker_size, |_| {
                uniform_noise(rng, noise_px)
            }));
        }
        out
    }
}

/// 一定間隔で合成シーンを描画するフレーム供給源
pub struct SyntheticSource {
    camera: SyntheticCamera,
    scene: Arc<Scene>,
    start: Instant,
    interval: Duration,
    noise_px: f64,
    rng: StdRng,
    next: Instant,
}

impl SyntheticSource {
    pub fn new(camera: SyntheticCamera, scene: Arc<Scene>, start: Instant, fps: u32, noise_px: f64, seed: u64) -> Self {
        let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        Self {
            camera,
            scene,
            start,
            interval,
            noise_px,
            rng: StdRng::seed_from_u64(seed),
            next: Instant::now(),
        }
    }
}

impl FrameSource for SyntheticSource {
    type Image = Vec<MarkerDetection>;

    fn read_frame(&mut self) -> Result<Vec<MarkerDetection>> {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        }
        self.next += self.interval;
        let t = self.start.elapsed().as_secs_f64();
        Ok(self.scene.render(&self.camera, t, &mut self.rng, self.noise_px))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    fn camera() -> SyntheticCamera {
        SyntheticCamera::new(0, CameraIntrinsics::from_fov(60.0, 640, 480), Isometry3::identity())
    }

    fn model() -> RigidBodyModel {
        let mut m = RigidBodyModel::new(0);
        m.set_root(0);
        m
    }

    fn facing(z: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.0, 0.0, z),
            UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0),
        )
    }

    #[test]
    fn test_front_facing_marker_visible() {
        let dets = render_detections(&camera(), &facing(0.5), &model(), 0.05);
        assert_eq!(dets.len(), 1);
        // 左上 → 右上 で x が増える
        assert!(dets[0].corners[1].x > dets[0].corners[0].x);
        assert!(dets[0].corners[3].y > dets[0].corners[0].y);
    }

    #[test]
    fn test_back_facing_marker_hidden() {
        let pose = Isometry3::translation(0.0, 0.0, 0.5);
        assert!(render_detections(&camera(), &pose, &model(), 0.05).is_empty());
    }

    #[test]
    fn test_out_of_frame_marker_hidden() {
        let mut pose = facing(0.5);
        pose.translation.vector.x = 2.0;
        assert!(render_detections(&camera(), &pose, &model(), 0.05).is_empty());
    }

    #[test]
    fn test_scene_render_with_noise_is_seeded() {
        let scene = Scene {
            truth: vec![model()],
            marker_size: 0.05,
            motion: Box::new(|_| vec![facing(0.5)]),
        };
        let a = scene.render(&camera(), 0.0, &mut StdRng::seed_from_u64(3), 0.5);
        let b = scene.render(&camera(), 0.0, &mut StdRng::seed_from_u64(3), 0.5);
        assert_eq!(a, b);
    }
}
