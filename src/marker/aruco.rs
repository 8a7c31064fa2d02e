use anyhow::{Context, Result};
use nalgebra::Point2;
use opencv::{
    core::{Mat, Point2f, Vector},
    imgproc,
    objdetect::{
        self, ArucoDetector, DetectorParameters, DetectorParametersTrait, Dictionary,
        PredefinedDictionaryType, RefineParameters,
    },
    prelude::*,
};

use super::{MarkerDetection, MarkerDetector, MarkerId};

/// 辞書名 → OpenCV定義済み辞書
pub fn parse_dictionary(name: &str) -> Result<Dictionary> {
    let dict_type = match name {
        "DICT_4X4_50" => PredefinedDictionaryType::DICT_4X4_50,
        "DICT_4X4_100" => PredefinedDictionaryType::DICT_4X4_100,
        "DICT_4X4_250" => PredefinedDictionaryType::DICT_4X4_250,
        "DICT_4X4_1000" => PredefinedDictionaryType::DICT_4X4_1000,
        "DICT_5X5_50" => PredefinedDictionaryType::DICT_5X5_50,
        "DICT_5X5_100" => PredefinedDictionaryType::DICT_5X5_100,
        "DICT_5X5_250" => PredefinedDictionaryType::DICT_5X5_250,
        "DICT_5X5_1000" => PredefinedDictionaryType::DICT_5X5_1000,
        "DICT_ARUCO_ORIGINAL" => PredefinedDictionaryType::DICT_ARUCO_ORIGINAL,
        "DICT_APRILTAG_16h5" => PredefinedDictionaryType::DICT_APRILTAG_16h5,
        "DICT_APRILTAG_25h9" => PredefinedDictionaryType::DICT_APRILTAG_25h9,
        "DICT_APRILTAG_36h10" => PredefinedDictionaryType::DICT_APRILTAG_36h10,
        "DICT_APRILTAG_36h11" => PredefinedDictionaryType::DICT_APRILTAG_36h11,
        _ => anyhow::bail!("Unknown dictionary: {}", name),
    };
    objdetect::get_predefined_dictionary(dict_type).context("Failed to get predefined dictionary")
}

/// OpenCV ArucoDetector によるマーカー検出
pub struct ArucoMarkerDetector {
    detector: ArucoDetector,
    gray: Mat,
}

impl ArucoMarkerDetector {
    pub fn new(dictionary: &str) -> Result<Self> {
        let dict = parse_dictionary(dictionary)?;

        let mut params = DetectorParameters::default()?;
        // 斜めから見たマーカーを受け入れる（デフォルト0.03）
        params.set_polygonal_approx_accuracy_rate(0.05);
        params.set_corner_refinement_method(objdetect::CornerRefineMethod::CORNER_REFINE_SUBPIX as i32);
        // 白黒反転マーカーも検出
        params.set_detect_inverted_marker(true);

        let refine = RefineParameters::new(10.0, 3.0, true)?;
        let detector = ArucoDetector::new(&dict, &params, refine)
            .context("Failed to create ArucoDetector")?;

        Ok(Self {
            detector,
            gray: Mat::default(),
        })
    }
}

impl MarkerDetector for ArucoMarkerDetector {
    type Image = Mat;

    fn detect(&mut self, image: &Mat) -> Result<Vec<MarkerDetection>> {
        let input = if image.channels() == 1 {
            image
        } else {
            imgproc::cvt_color_def(image, &mut self.gray, imgproc::COLOR_BGR2GRAY)?;
            &self.gray
        };

        let mut corners: Vector<Vector<Point2f>> = Vector::new();
        let mut ids: Vector<i32> = Vector::new();
        self.detector
            .detect_markers_def(input, &mut corners, &mut ids)
            .context("detect_markers failed")?;

        let mut out = Vec::with_capacity(ids.len());
        for (id, quad) in ids.iter().zip(corners.iter()) {
            if id < 0 || quad.len() != 4 {
                continue;
            }
            let mut pts = [Point2::origin(); 4];
            for (dst, p) in pts.iter_mut().zip(quad.iter()) {
                *dst = Point2::new(p.x as f64, p.y as f64);
            }
            out.push(MarkerDetection::new(id as MarkerId, pts));
        }
        Ok(out)
    }
}
