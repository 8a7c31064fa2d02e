use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::CameraIntrinsics;
use crate::config::{CameraConfig, IntrinsicsConfig};

/// 1台分の内部パラメータ校正結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsCalibration {
    pub camera_index: i32,
    /// 校正時の解像度
    pub width: u32,
    pub height: u32,
    pub intrinsics: IntrinsicsConfig,
    /// ピクセル
    pub reprojection_error: f64,
    pub views: usize,
}

impl IntrinsicsCalibration {
    /// 解像度が校正時と違えば K をスケールする
    pub fn intrinsics_at(&self, width: u32, height: u32) -> CameraIntrinsics {
        let mut k = self.intrinsics.matrix;
        if (width, height) != (self.width, self.height) && self.width > 0 && self.height > 0 {
            let sx = width as f64 / self.width as f64;
            let sy = height as f64 / self.height as f64;
            k[0] *= sx;
            k[2] *= sx;
            k[4] *= sy;
            k[5] *= sy;
        }
        CameraIntrinsics::from_calibration(&k, &self.intrinsics.dist_coeffs, width, height)
    }

    fn validate(&self) -> Result<()> {
        let k = &self.intrinsics.matrix;
        if !k.iter().all(|v| v.is_finite()) || !(k[0] > 0.0 && k[4] > 0.0) {
            bail!("Camera {}: invalid camera matrix {:?}", self.camera_index, k);
        }
        if self.intrinsics.dist_coeffs.len() > 5 {
            bail!(
                "Camera {}: expected at most 5 distortion coefficients, got {}",
                self.camera_index,
                self.intrinsics.dist_coeffs.len()
            );
        }
        Ok(())
    }
}

/// カメラ内部パラメータの保存形式
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsFile {
    #[serde(default)]
    pub cameras: Vec<IntrinsicsCalibration>,
}

impl IntrinsicsFile {
    pub fn camera(&self, index: i32) -> Option<&IntrinsicsCalibration> {
        self.cameras.iter().find(|c| c.camera_index == index)
    }

    pub fn upsert(&mut self, cal: IntrinsicsCalibration) {
        match self.cameras.iter_mut().find(|c| c.camera_index == cal.camera_index) {
            Some(slot) => *slot = cal,
            None => {
                self.cameras.push(cal);
                self.cameras.sort_by_key(|c| c.camera_index);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (i, c) in self.cameras.iter().enumerate() {
            c.validate()?;
            if self.cameras[..i].iter().any(|o| o.camera_index == c.camera_index) {
                bail!("Duplicate camera {} in intrinsics file", c.camera_index);
            }
        }
        Ok(())
    }
}

pub fn save_intrinsics(path: impl AsRef<Path>, file: &IntrinsicsFile) -> Result<()> {
    let path = path.as_ref();
    file.validate()?;
    let json = serde_json::to_string_pretty(file)?;
    fs::write(path, json).with_context(|| format!("Failed to write intrinsics file: {}", path.display()))?;
    tracing::info!(path = %path.display(), cameras = file.cameras.len(), "camera intrinsics saved");
    Ok(())
}

pub fn load_intrinsics(path: impl AsRef<Path>) -> Result<IntrinsicsFile> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read intrinsics file: {}", path.display()))?;
    let file: IntrinsicsFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse intrinsics file: {}", path.display()))?;
    file.validate()
        .with_context(|| format!("Malformed intrinsics file: {}", path.display()))?;
    Ok(file)
}

/// config.toml の `[cameras.intrinsics]` にそのまま貼れる形
pub fn intrinsics_snippet(intrinsics: &IntrinsicsConfig) -> Result<String> {
    #[derive(Serialize)]
    struct Snippet<'a> {
        intrinsics: &'a IntrinsicsConfig,
    }
    let body = toml::to_string(&Snippet { intrinsics })?;
    Ok(body.replacen("[intrinsics]", "[cameras.intrinsics]", 1))
}

/// 設定の intrinsics > 保存済み校正結果 > fov_v の順
pub fn resolve_intrinsics(
    camera: &CameraConfig,
    saved: Option<&IntrinsicsFile>,
    width: u32,
    height: u32,
) -> CameraIntrinsics {
    if let Some(i) = &camera.intrinsics {
        return CameraIntrinsics::from_calibration(&i.matrix, &i.dist_coeffs, width, height);
    }
    if let Some(cal) = saved.and_then(|f| f.camera(camera.index)) {
        if (cal.width, cal.height) != (width, height) {
            tracing::info!(
                camera = camera.index,
                calibrated = ?(cal.width, cal.height),
                actual = ?(width, height),
                "scaling saved intrinsics to the capture resolution"
            );
        }
        return cal.intrinsics_at(width, height);
    }
    tracing::warn!(camera = camera.index, "no intrinsics configured, using fov_v = {}", camera.fov_v);
    CameraIntrinsics::from_fov(camera.fov_v, width, height)
}

/// 取り除くべき最悪フレーム
///
/// フレームが `min_views` より多く、最大誤差が `max_error` を超えるときのみ。
pub fn worst_view(per_view_errors: &[f64], min_views: usize, max_error: f64) -> Option<usize> {
    if per_view_errors.len() <= min_views {
        return None;
    }
    let (idx, err) = per_view_errors
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    (*err > max_error).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibration(index: i32) -> IntrinsicsCalibration {
        IntrinsicsCalibration {
            camera_index: index,
            width: 1280,
            height: 960,
            intrinsics: IntrinsicsConfig {
                matrix: [900.0, 0.0, 640.0, 0.0, 905.0, 480.0, 0.0, 0.0, 1.0],
                dist_coeffs: vec![-0.12, 0.03, 0.001, -0.0005, 0.0],
            },
            reprojection_error: 0.31,
            views: 20,
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("marker_tracker_intrinsics_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_save_load() {
        let mut file = IntrinsicsFile::default();
        file.upsert(calibration(2));
        file.upsert(calibration(0));
        let path = temp_path("roundtrip");
        save_intrinsics(&path, &file).unwrap();
        let loaded = load_intrinsics(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded.cameras[0].camera_index, 0);
        assert_eq!(loaded.camera(2), Some(&calibration(2)));
    }

    #[test]
    fn test_rejects_broken_matrix() {
        let mut cal = calibration(0);
        cal.intrinsics.matrix[0] = f64::NAN;
        let file = IntrinsicsFile { cameras: vec![cal] };
        assert!(save_intrinsics(temp_path("never"), &file).is_err());

        let path = temp_path("broken");
        fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();
        let err = load_intrinsics(&path);
        let _ = fs::remove_file(&path);
        assert!(err.is_err());
    }

    #[test]
    fn test_scaled_to_half_resolution() {
        let intr = calibration(0).intrinsics_at(640, 480);
        assert_eq!(intr.fx, 450.0);
        assert_eq!(intr.fy, 452.5);
        assert_eq!(intr.cx, 320.0);
        assert_eq!(intr.cy, 240.0);
        assert_eq!(intr.dist_coeffs[0], -0.12);
        assert_eq!((intr.width, intr.height), (640, 480));
    }

    #[test]
    fn test_resolve_order() {
        let mut file = IntrinsicsFile::default();
        file.upsert(calibration(0));
        let mut cam = CameraConfig::default();

        let from_file = resolve_intrinsics(&cam, Some(&file), 1280, 960);
        assert_eq!(from_file.fx, 900.0);

        let fallback = resolve_intrinsics(&CameraConfig { index: 1, ..cam.clone() }, Some(&file), 640, 480);
        assert_eq!(fallback, CameraIntrinsics::from_fov(cam.fov_v, 640, 480));

        cam.intrinsics = Some(IntrinsicsConfig {
            matrix: [600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0],
            dist_coeffs: vec![],
        });
        assert_eq!(resolve_intrinsics(&cam, Some(&file), 640, 480).fx, 600.0);
    }

    #[test]
    fn test_snippet_parses_as_camera_config() {
        let snippet = intrinsics_snippet(&calibration(0).intrinsics).unwrap();
        let src = format!("[[cameras]]\nindex = 0\n\n{snippet}");
        let config: crate::config::Config = toml::from_str(&src).unwrap();
        let parsed = config.cameras[0].intrinsics.as_ref().unwrap();
        assert_eq!(parsed.matrix, calibration(0).intrinsics.matrix);
        assert_eq!(parsed.dist_coeffs, calibration(0).intrinsics.dist_coeffs);
    }

    #[test]
    fn test_worst_view() {
        let mut errors = vec![0.3; 11];
        errors[4] = 1.8;
        assert_eq!(worst_view(&errors, 10, 1.0), Some(4));
        // 少ないうちは捨てない
        assert_eq!(worst_view(&errors[..10], 10, 1.0), None);
        errors[4] = 0.9;
        assert_eq!(worst_view(&errors, 10, 1.0), None);
    }
}
