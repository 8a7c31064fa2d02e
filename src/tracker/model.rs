use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::marker::{marker_corners, MarkerId};

/// マーカーごとのキャリブレーション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    Uncalibrated,
    Calibrating,
    Calibrated,
}

/// トラッカー座標系（ルートマーカー基準）でのマーカー姿勢
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerOffset {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub state: CalibrationState,
}

impl MarkerOffset {
    pub fn calibrated(pose: &Isometry3<f64>) -> Self {
        Self {
            position: pose.translation.vector,
            orientation: pose.rotation,
            state: CalibrationState::Calibrated,
        }
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("tracker {tracker}: calibrated markers present but no root marker")]
    MissingRoot { tracker: usize },
    #[error("tracker {tracker}: root marker {root} is not in the model")]
    RootAbsent { tracker: usize, root: MarkerId },
    #[error("tracker {tracker}: root marker {root} offset is not identity")]
    RootNotIdentity { tracker: usize, root: MarkerId },
    #[error("tracker {tracker}: root marker {root} is not calibrated")]
    RootNotCalibrated { tracker: usize, root: MarkerId },
    #[error("tracker {tracker}: marker {id} has a non-finite offset")]
    NonFinite { tracker: usize, id: MarkerId },
}

/// 1トラッカーの剛体モデル（マーカーID → オフセット）
///
/// ルートマーカーは恒等オフセット、他は全てルート基準。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBodyModel {
    pub tracker_id: usize,
    pub root: Option<MarkerId>,
    pub markers: BTreeMap<MarkerId, MarkerOffset>,
}

impl RigidBodyModel {
    pub fn new(tracker_id: usize) -> Self {
        Self {
            tracker_id,
            root: None,
            markers: BTreeMap::new(),
        }
    }

    /// ルートマーカーを指定
    ///
    /// 既に校正済みのマーカーなら既存オフセットを新ルート基準に付け替える。
    /// 未校正なら他のマーカーは全て破棄してやり直し。
    pub fn set_root(&mut self, id: MarkerId) {
        match self.markers.get(&id) {
            Some(offset) if offset.state == CalibrationState::Calibrated => {
                let to_new_root = offset.isometry().inverse();
                for m in self.markers.values_mut() {
                    if m.state == CalibrationState::Calibrated {
                        let rebased = to_new_root * m.isometry();
                        m.position = rebased.translation.vector;
                        m.orientation = rebased.rotation;
                    }
                }
            }
            _ => self.markers.clear(),
        }
        self.markers
            .insert(id, MarkerOffset::calibrated(&Isometry3::identity()));
        self.root = Some(id);
    }

    pub fn insert_calibrated(&mut self, id: MarkerId, pose: &Isometry3<f64>) {
        self.markers.insert(id, MarkerOffset::calibrated(pose));
    }

    /// 状態のみ変更。未登録のマーカーは恒等オフセットで追加
    pub fn set_state(&mut self, id: MarkerId, state: CalibrationState) {
        self.markers
            .entry(id)
            .and_modify(|m| m.state = state)
            .or_insert(MarkerOffset {
                position: Vector3::zeros(),
                orientation: UnitQuaternion::identity(),
                state,
            });
    }

    pub fn state(&self, id: MarkerId) -> CalibrationState {
        self.markers
            .get(&id)
            .map(|m| m.state)
            .unwrap_or(CalibrationState::Uncalibrated)
    }

    pub fn is_calibrated(&self, id: MarkerId) -> bool {
        self.state(id) == CalibrationState::Calibrated
    }

    /// 校正済みマーカーのトラッカー座標系での姿勢
    pub fn marker_pose(&self, id: MarkerId) -> Option<Isometry3<f64>> {
        self.markers
            .get(&id)
            .filter(|m| m.state == CalibrationState::Calibrated)
            .map(MarkerOffset::isometry)
    }

    /// 校正済みマーカーの4コーナー（トラッカー座標系）
    pub fn object_corners(&self, id: MarkerId, marker_size: f64) -> Option<[Point3<f64>; 4]> {
        let pose = self.marker_pose(id)?;
        Some(marker_corners(marker_size).map(|c| pose * c))
    }

    pub fn calibrated_ids(&self) -> Vec<MarkerId> {
        self.markers
            .iter()
            .filter(|(_, m)| m.state == CalibrationState::Calibrated)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn calibrated_count(&self) -> usize {
        self.markers
            .values()
            .filter(|m| m.state == CalibrationState::Calibrated)
            .count()
    }

    /// 校正済み全コーナーの重心（= 各マーカー中心の平均）
    pub fn centroid(&self) -> Option<Vector3<f64>> {
        let ids = self.calibrated_ids();
        if ids.is_empty() {
            return None;
        }
        let sum = ids
            .iter()
            .filter_map(|id| self.markers.get(id))
            .fold(Vector3::zeros(), |acc, m| acc + m.position);
        Some(sum / ids.len() as f64)
    }

    /// Calibrating のマーカーを Uncalibrated に戻す
    pub fn drop_in_progress(&mut self) {
        self.markers
            .retain(|_, m| m.state != CalibrationState::Calibrating);
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let tracker = self.tracker_id;
        for (id, m) in &self.markers {
            let finite = m.position.iter().all(|v| v.is_finite())
                && m.orientation.coords.iter().all(|v| v.is_finite());
            if !finite {
                return Err(ModelError::NonFinite { tracker, id: *id });
            }
        }

        let Some(root) = self.root else {
            if self.calibrated_count() > 0 {
                return Err(ModelError::MissingRoot { tracker });
            }
            return Ok(());
        };

        let offset = self
            .markers
            .get(&root)
            .ok_or(ModelError::RootAbsent { tracker, root })?;
        if offset.state != CalibrationState::Calibrated {
            return Err(ModelError::RootNotCalibrated { tracker, root });
        }
        if offset.position.norm() > 1e-9 || offset.orientation.angle() > 1e-9 {
            return Err(ModelError::RootNotIdentity { tracker, root });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn offset(x: f64, yaw: f64) -> Isometry3<f64> {
        Isometry3::new(Vector3::new(x, 0.0, 0.0), Vector3::new(0.0, yaw, 0.0))
    }

    #[test]
    fn test_empty_model_is_valid() {
        let model = RigidBodyModel::new(0);
        assert_eq!(model.validate(), Ok(()));
        assert!(model.centroid().is_none());
    }

    #[test]
    fn test_root_is_identity() {
        let mut model = RigidBodyModel::new(1);
        model.set_root(45);
        assert_eq!(model.root, Some(45));
        assert!(model.is_calibrated(45));
        assert_eq!(model.marker_pose(45), Some(Isometry3::identity()));
        assert_eq!(model.validate(), Ok(()));
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let mut model = RigidBodyModel::new(2);
        model.insert_calibrated(91, &offset(0.05, 0.0));
        assert_eq!(model.validate(), Err(ModelError::MissingRoot { tracker: 2 }));
    }

    #[test]
    fn test_root_not_identity_is_rejected() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(0, &offset(0.01, 0.0));
        assert_eq!(
            model.validate(),
            Err(ModelError::RootNotIdentity { tracker: 0, root: 0 })
        );
    }

    #[test]
    fn test_set_root_rebases_offsets() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(1, &offset(0.1, 0.5));
        model.insert_calibrated(2, &offset(-0.1, -0.5));
        let before = model.marker_pose(1).unwrap().inverse() * model.marker_pose(2).unwrap();

        model.set_root(1);
        assert_eq!(model.validate(), Ok(()));
        let after = model.marker_pose(2).unwrap();
        assert!((after.translation.vector - before.translation.vector).norm() < 1e-12);
        assert!(after.rotation.angle_to(&before.rotation) < 1e-12);
        // 旧ルートも残る
        assert!(model.is_calibrated(0));
    }

    #[test]
    fn test_set_root_on_unknown_marker_resets() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(1, &offset(0.1, 0.0));
        model.set_root(5);
        assert_eq!(model.calibrated_ids(), vec![5]);
    }

    #[test]
    fn test_object_corners_follow_offset() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(1, &offset(0.1, 0.0));
        let c = model.object_corners(1, 0.04).unwrap();
        assert!(approx_eq(c[0].x, 0.08, 1e-12));
        assert!(approx_eq(c[1].x, 0.12, 1e-12));
        assert!(model.object_corners(7, 0.04).is_none());
    }

    #[test]
    fn test_calibrating_markers_are_not_used() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.set_state(3, CalibrationState::Calibrating);
        assert!(model.marker_pose(3).is_none());
        assert_eq!(model.calibrated_count(), 1);
        model.drop_in_progress();
        assert_eq!(model.state(3), CalibrationState::Uncalibrated);
    }

    #[test]
    fn test_centroid() {
        let mut model = RigidBodyModel::new(0);
        model.set_root(0);
        model.insert_calibrated(1, &offset(0.1, 0.0));
        let c = model.centroid().unwrap();
        assert!(approx_eq(c.x, 0.05, 1e-12));
    }

    #[test]
    fn test_json_roundtrip_keeps_states() {
        let mut model = RigidBodyModel::new(3);
        model.set_root(135);
        model.insert_calibrated(136, &offset(0.07, 0.3));
        let json = serde_json::to_string(&model).unwrap();
        let back: RigidBodyModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root, Some(135));
        assert_eq!(back.calibrated_ids(), vec![135, 136]);
    }
}
