use nalgebra::{Rotation3, UnitQuaternion, Vector3};

use crate::config::PlayspaceConfig;
use crate::geometry::PoseSample;

/// カメラ座標系 (OpenCV: x右, y下, z前) → ルーム座標系 (OpenVR: x右, y上, z後)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Playspace {
    pub rotation: UnitQuaternion<f64>,
    pub position: Vector3<f64>,
    pub scale: f64,
}

impl Playspace {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            position: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn from_config(config: &PlayspaceConfig) -> Self {
        let [rx, ry, rz] = config.rotation_deg.map(f64::to_radians);
        // Euler XYZ: R = Rz * Ry * Rx
        let r = Rotation3::from_axis_angle(&Vector3::z_axis(), rz)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), ry)
            * Rotation3::from_axis_angle(&Vector3::x_axis(), rx);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&r),
            position: Vector3::from(config.position),
            scale: config.scale,
        }
    }

    /// y, z 反転（x軸周り180°）
    fn axis_flip() -> UnitQuaternion<f64> {
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    }

    pub fn apply(&self, sample: &PoseSample) -> PoseSample {
        let r = self.rotation * Self::axis_flip();
        PoseSample {
            position: self.position + r * (sample.position * self.scale),
            orientation: r * sample.orientation,
            ..*sample
        }
    }
}

impl Default for Playspace {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(p: Vector3<f64>) -> PoseSample {
        PoseSample::new(0.0, p, UnitQuaternion::identity())
    }

    #[test]
    fn test_opencv_to_openvr_axes() {
        let ps = Playspace::identity();
        let fwd = ps.apply(&at(Vector3::new(0.0, 0.0, 1.0)));
        assert!((fwd.position - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-12);
        let down = ps.apply(&at(Vector3::new(0.0, 1.0, 0.0)));
        assert!((down.position - Vector3::new(0.0, -1.0, 0.0)).norm() < 1e-12);
        let right = ps.apply(&at(Vector3::new(1.0, 0.0, 0.0)));
        assert!((right.position - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_position_scale_and_yaw() {
        let config = PlayspaceConfig {
            position: [0.0, 1.5, 0.0],
            rotation_deg: [0.0, 90.0, 0.0],
            scale: 2.0,
        };
        let ps = Playspace::from_config(&config);
        let out = ps.apply(&at(Vector3::new(0.0, 0.0, 1.0)));
        // flip → (0,0,-2)、Y軸90° → (-2,0,0)、+位置
        assert!((out.position - Vector3::new(-2.0, 1.5, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn test_orientation_follows_flip() {
        let ps = Playspace::identity();
        let out = ps.apply(&at(Vector3::zeros()));
        // カメラを向いたマーカー (x軸180°) はルームで正立
        let facing = PoseSample::new(
            0.0,
            Vector3::zeros(),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
        );
        let upright = ps.apply(&facing);
        assert!(upright.orientation.angle() < 1e-9);
        assert!((out.orientation.angle() - std::f64::consts::PI).abs() < 1e-9);
    }
}
