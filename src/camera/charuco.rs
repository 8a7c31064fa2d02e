//! ChArUco ボードによるカメラ内部パラメータ校正（OpenCV）

use anyhow::{bail, Context, Result};
use opencv::{
    calib3d,
    core::{Mat, Size, TermCriteria, TermCriteria_Type, Vector},
    objdetect::{
        CharucoBoard, CharucoDetector, CharucoParameters, DetectorParameters, DetectorParametersTrait,
        RefineParameters,
    },
    prelude::*,
};

use super::calibration::worst_view;
use crate::config::{CharucoConfig, IntrinsicsConfig};
use crate::marker::aruco::parse_dictionary;

/// worst_view を適用し始めるフレーム数
const MIN_VIEWS_FOR_PRUNING: usize = 10;

pub fn create_board(config: &CharucoConfig) -> Result<CharucoBoard> {
    let dict = parse_dictionary(&config.dictionary)?;
    let size = Size::new(config.squares_x, config.squares_y);
    CharucoBoard::new_def(size, config.square_length as f32, config.marker_length as f32, &dict)
        .context("Failed to create CharucoBoard")
}

/// 広角・斜めでも検出できるように緩めたパラメータ
pub fn create_detector(board: &CharucoBoard) -> Result<CharucoDetector> {
    let mut det_params = DetectorParameters::default()?;
    det_params.set_polygonal_approx_accuracy_rate(0.08);
    det_params.set_perspective_remove_pixel_per_cell(8);
    det_params.set_adaptive_thresh_win_size_max(53);

    let charuco_params = CharucoParameters::default()?;
    let refine_params = RefineParameters::new(10.0, 3.0, true)?;
    CharucoDetector::new(board, &charuco_params, &det_params, refine_params)
        .context("Failed to create CharucoDetector")
}

/// 1フレーム分の 3D-2D 対応
pub struct CharucoView {
    object: Mat,
    image: Mat,
}

impl CharucoView {
    pub fn corners(&self) -> i32 {
        self.object.rows()
    }
}

/// コーナーを検出してボード座標と対応付ける（検出なしは None）
pub fn detect_view(detector: &CharucoDetector, board: &CharucoBoard, frame: &Mat) -> Result<Option<CharucoView>> {
    let mut corners = Mat::default();
    let mut ids = Mat::default();
    detector
        .detect_board_def(frame, &mut corners, &mut ids)
        .context("detect_board failed")?;
    if ids.rows() == 0 {
        return Ok(None);
    }

    let mut object = Mat::default();
    let mut image = Mat::default();
    board
        .match_image_points(&corners, &ids, &mut object, &mut image)
        .context("match_image_points failed")?;
    Ok(Some(CharucoView { object, image }))
}

#[derive(Debug, Clone)]
pub struct CharucoCalibration {
    pub intrinsics: IntrinsicsConfig,
    /// 全体の再投影誤差RMS（ピクセル）
    pub rms: f64,
    pub per_view_errors: Vec<f64>,
}

pub fn calibrate(views: &[CharucoView], image_size: Size) -> Result<CharucoCalibration> {
    if views.len() < 3 {
        bail!("Not enough calibration frames (got {}, need >= 3)", views.len());
    }

    let mut object_points = Vector::<Mat>::new();
    let mut image_points = Vector::<Mat>::new();
    for v in views {
        object_points.push(v.object.try_clone()?);
        image_points.push(v.image.try_clone()?);
    }

    let mut camera_matrix = Mat::default();
    let mut dist_coeffs = Mat::default();
    let mut rvecs = Mat::default();
    let mut tvecs = Mat::default();
    let mut std_intrinsics = Mat::default();
    let mut std_extrinsics = Mat::default();
    let mut per_view = Mat::default();
    let criteria = TermCriteria::new(
        TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
        100,
        1e-6,
    )?;

    let rms = calib3d::calibrate_camera_extended(
        &object_points,
        &image_points,
        image_size,
        &mut camera_matrix,
        &mut dist_coeffs,
        &mut rvecs,
        &mut tvecs,
        &mut std_intrinsics,
        &mut std_extrinsics,
        &mut per_view,
        calib3d::CALIB_USE_LU,
        criteria,
    )
    .context("calibrate_camera failed")?;

    Ok(CharucoCalibration {
        intrinsics: IntrinsicsConfig {
            matrix: mat3x3_to_array(&camera_matrix)?,
            dist_coeffs: mat_to_vec(&dist_coeffs)?.into_iter().take(5).collect(),
        },
        rms,
        per_view_errors: mat_to_vec(&per_view)?,
    })
}

/// 校正し、誤差の大きいフレームを1枚捨てて再校正する
///
/// 捨てたフレームは `views` からも取り除く。
pub fn calibrate_pruned(
    views: &mut Vec<CharucoView>,
    image_size: Size,
    max_view_error: f64,
) -> Result<CharucoCalibration> {
    let result = calibrate(views, image_size)?;
    match worst_view(&result.per_view_errors, MIN_VIEWS_FOR_PRUNING, max_view_error) {
        Some(idx) if idx < views.len() => {
            tracing::info!(
                frame = idx,
                error = result.per_view_errors[idx],
                "dropping calibration frame with high reprojection error"
            );
            views.remove(idx);
            calibrate(views, image_size)
        }
        _ => Ok(result),
    }
}

/// 3x3 Mat (f64) → row-major
fn mat3x3_to_array(mat: &Mat) -> Result<[f64; 9]> {
    if mat.rows() != 3 || mat.cols() != 3 {
        bail!("Expected 3x3 matrix, got {}x{}", mat.rows(), mat.cols());
    }
    let mut arr = [0.0f64; 9];
    for r in 0..3 {
        for c in 0..3 {
            arr[r * 3 + c] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(arr)
}

/// Nx1 / 1xN の Mat (f64)
fn mat_to_vec(mat: &Mat) -> Result<Vec<f64>> {
    let n = mat.rows().max(mat.cols());
    let is_row = mat.rows() == 1;
    (0..n)
        .map(|i| {
            let v = if is_row { mat.at_2d::<f64>(0, i)? } else { mat.at_2d::<f64>(i, 0)? };
            Ok(*v)
        })
        .collect()
}
