mod align;
mod average;
mod homography;

pub use align::fit_rigid;
pub use average::{average_quaternions, weighted_mean};
pub use homography::{decompose_planar, dlt_homography, PlanarCandidates};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

/// タイムスタンプ付きポーズ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    /// 秒
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub valid: bool,
}

impl PoseSample {
    pub fn new(timestamp: f64, position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self {
            timestamp,
            position,
            orientation,
            valid: true,
        }
    }

    pub fn from_isometry(timestamp: f64, pose: &Isometry3<f64>) -> Self {
        Self::new(timestamp, pose.translation.vector, pose.rotation)
    }

    /// 検出失敗フレームを表すサンプル
    pub fn invalid(timestamp: f64) -> Self {
        Self {
            timestamp,
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            valid: false,
        }
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }

    /// 剛体変換を適用（位置・回転とも）
    pub fn transformed(&self, t: &Isometry3<f64>) -> Self {
        Self {
            position: t.transform_vector(&self.position) + t.translation.vector,
            orientation: t.rotation * self.orientation,
            ..*self
        }
    }
}

/// NLERP（符号を揃えてから線形補間し正規化）
pub fn nlerp(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>, t: f64) -> UnitQuaternion<f64> {
    let qa = a.quaternion();
    let mut qb = *b.quaternion();
    if qa.dot(&qb) < 0.0 {
        qb = -qb;
    }
    let q = qa * (1.0 - t) + qb * t;
    if q.norm() < 1e-12 {
        return *b;
    }
    UnitQuaternion::from_quaternion(q)
}
