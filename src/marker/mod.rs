#[cfg(feature = "camera")]
pub mod aruco;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

pub type MarkerId = u32;

/// 1フレーム分の1マーカー検出結果
///
/// corners: 左上, 右上, 右下, 左下（画像上、マーカー正面から見た順）
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDetection {
    pub id: MarkerId,
    pub corners: [Point2<f64>; 4],
}

impl MarkerDetection {
    pub fn new(id: MarkerId, corners: [Point2<f64>; 4]) -> Self {
        Self { id, corners }
    }

    /// 画像上の外周長（ピクセル）
    pub fn perimeter(&self) -> f64 {
        (0..4)
            .map(|i| (self.corners[(i + 1) % 4] - self.corners[i]).norm())
            .sum()
    }
}

/// 画像 → マーカー検出結果
pub trait MarkerDetector: Send {
    type Image;

    fn detect(&mut self, image: &Self::Image) -> anyhow::Result<Vec<MarkerDetection>>;
}

/// マーカー座標系でのコーナー位置（検出結果のコーナー順と対応）
pub fn marker_corners(size: f64) -> [Point3<f64>; 4] {
    let h = size / 2.0;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// トラッカーごとのマーカーID割り当て
///
/// トラッカー i は `[i * markers_per_tracker, (i + 1) * markers_per_tracker)` を持つ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerLayout {
    pub markers_per_tracker: u32,
}

impl MarkerLayout {
    pub fn new(markers_per_tracker: u32) -> Self {
        Self {
            markers_per_tracker: markers_per_tracker.max(1),
        }
    }

    pub fn tracker_of(&self, id: MarkerId) -> usize {
        (id / self.markers_per_tracker) as usize
    }

    /// デフォルトのルートマーカー
    pub fn root_id(&self, tracker: usize) -> MarkerId {
        tracker as u32 * self.markers_per_tracker
    }

    pub fn owns(&self, tracker: usize, id: MarkerId) -> bool {
        self.tracker_of(id) == tracker
    }
}

impl Default for MarkerLayout {
    fn default() -> Self {
        Self::new(45)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_ranges() {
        let layout = MarkerLayout::default();
        assert_eq!(layout.tracker_of(0), 0);
        assert_eq!(layout.tracker_of(44), 0);
        assert_eq!(layout.tracker_of(45), 1);
        assert_eq!(layout.root_id(2), 90);
        assert!(layout.owns(1, 89));
        assert!(!layout.owns(1, 90));
    }

    #[test]
    fn test_zero_markers_per_tracker_clamped() {
        let layout = MarkerLayout::new(0);
        assert_eq!(layout.markers_per_tracker, 1);
        assert_eq!(layout.tracker_of(3), 3);
    }

    #[test]
    fn test_marker_corners_winding() {
        let c = marker_corners(0.1);
        assert_eq!(c[0], Point3::new(-0.05, 0.05, 0.0));
        assert_eq!(c[2], Point3::new(0.05, -0.05, 0.0));
        // 中心は原点
        let sum = c.iter().fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords);
        assert!(sum.norm() < 1e-12);
    }

    #[test]
    fn test_perimeter() {
        let d = MarkerDetection::new(
            0,
            [
                Point2::new(0.0, 0.0),
                Point2::new(10.0, 0.0),
                Point2::new(10.0, 10.0),
                Point2::new(0.0, 10.0),
            ],
        );
        assert!((d.perimeter() - 40.0).abs() < 1e-12);
    }
}
