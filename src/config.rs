use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::camera::CameraIntrinsics;
use crate::marker::MarkerLayout;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vmt: VmtConfig,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default = "default_trackers")]
    pub trackers: Vec<TrackerConfig>,
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub charuco: CharucoConfig,
    #[serde(default)]
    pub multicam: MultiCamConfig,
    #[serde(default)]
    pub playspace: PlayspaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vmt: VmtConfig::default(),
            markers: MarkerConfig::default(),
            trackers: default_trackers(),
            cameras: default_cameras(),
            smoothing: SmoothingConfig::default(),
            calibration: CalibrationConfig::default(),
            charuco: CharucoConfig::default(),
            multicam: MultiCamConfig::default(),
            playspace: PlayspaceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmtConfig {
    /// 送信先 (VMTデフォルト 127.0.0.1:39570)
    #[serde(default = "default_vmt_addr")]
    pub addr: String,
    /// 送信レート (Hz)
    #[serde(default = "default_send_rate")]
    pub send_rate: f64,
}

fn default_vmt_addr() -> String { crate::vmt::VMT_DEFAULT_ADDR.to_string() }
fn default_send_rate() -> f64 { 60.0 }

impl Default for VmtConfig {
    fn default() -> Self {
        Self {
            addr: default_vmt_addr(),
            send_rate: default_send_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// マーカー辺長（メートル、黒枠の外側）
    #[serde(default = "default_marker_size")]
    pub size: f64,
    /// 辞書名 (e.g. "DICT_4X4_50", "DICT_APRILTAG_36h11")
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    /// 1トラッカーあたりのマーカーID数
    #[serde(default = "default_markers_per_tracker")]
    pub markers_per_tracker: u32,
    /// 出力原点をルートマーカーではなく全マーカーの中心にする
    #[serde(default)]
    pub use_centers: bool,
    /// 前フレームの姿勢を初期値候補に使う
    #[serde(default = "default_true")]
    pub use_predictive: bool,
}

fn default_marker_size() -> f64 { 0.05 }
fn default_dictionary() -> String { "DICT_4X4_50".to_string() }
fn default_markers_per_tracker() -> u32 { 45 }
fn default_true() -> bool { true }

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            size: default_marker_size(),
            dictionary: default_dictionary(),
            markers_per_tracker: default_markers_per_tracker(),
            use_centers: false,
            use_predictive: default_true(),
        }
    }
}

impl MarkerConfig {
    pub fn layout(&self) -> MarkerLayout {
        MarkerLayout::new(self.markers_per_tracker)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// 表示名
    #[serde(default)]
    pub name: String,
    /// 推定・送信しない
    #[serde(default)]
    pub ignore: bool,
    /// VMTのトラッカー番号（省略時はトラッカー番号と同じ）
    #[serde(default)]
    pub vmt_index: Option<i32>,
}

fn default_trackers() -> Vec<TrackerConfig> {
    ["hip", "left_foot", "right_foot"]
        .iter()
        .map(|name| TrackerConfig {
            name: name.to_string(),
            ..Default::default()
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// デバイス番号
    #[serde(default)]
    pub index: i32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// カメラ遅延（秒）
    #[serde(default)]
    pub latency: f64,
    /// 垂直画角（度）。intrinsics がない場合のみ使用
    #[serde(default = "default_fov")]
    pub fov_v: f64,
    /// キャリブレーション済み内部パラメータ
    #[serde(default)]
    pub intrinsics: Option<IntrinsicsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsConfig {
    /// K (row-major 3x3)
    pub matrix: [f64; 9],
    /// [k1, k2, p1, p2, k3]
    #[serde(default)]
    pub dist_coeffs: Vec<f64>,
}

fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 60 }
fn default_fov() -> f64 { 60.0 }

fn default_cameras() -> Vec<CameraConfig> {
    vec![CameraConfig::default()]
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            latency: 0.0,
            fov_v: default_fov(),
            intrinsics: None,
        }
    }
}

impl CameraConfig {
    pub fn intrinsics(&self) -> CameraIntrinsics {
        match &self.intrinsics {
            Some(i) => CameraIntrinsics::from_calibration(&i.matrix, &i.dist_coeffs, self.width, self.height),
            None => CameraIntrinsics::from_fov(self.fov_v, self.width, self.height),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// 平滑化ウィンドウ（秒）
    #[serde(default = "default_window")]
    pub window: f64,
    /// 追加平滑化係数 (0 = なし, 0.99まで)
    #[serde(default = "default_additional")]
    pub additional: f64,
    /// 奥行き方向の平滑化係数 (0 = なし, 0.99まで)
    #[serde(default)]
    pub depth: f64,
    /// ウィンドウ最古サンプルの重み（最新 = 1）
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
}

fn default_window() -> f64 { 0.2 }
fn default_additional() -> f64 { 0.2 }
fn default_min_weight() -> f64 { 0.1 }

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            additional: default_additional(),
            depth: 0.0,
            min_weight: default_min_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// これより遠いマーカーは追加しない（メートル）
    #[serde(default = "default_calib_distance")]
    pub distance_threshold: f64,
    /// 1マーカーの最低観測時間（秒）
    #[serde(default = "default_min_duration")]
    pub min_duration: f64,
    /// 1マーカーの最低サンプル数
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// 安定判定の位置許容誤差（メートル）
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    /// 安定判定の回転許容誤差（度）
    #[serde(default = "default_angle_tolerance")]
    pub angle_tolerance_deg: f64,
    /// 全体最適化の間隔（秒）
    #[serde(default = "default_refine_interval")]
    pub refine_interval: f64,
    /// 全体最適化に使う最大フレーム数
    #[serde(default = "default_max_refine_frames")]
    pub max_refine_frames: usize,
    /// 保持する観測フレーム数
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    /// 保存先パス
    #[serde(default = "default_calibration_output")]
    pub output_path: String,
}

fn default_calib_distance() -> f64 { 0.5 }
fn default_min_duration() -> f64 { 1.0 }
fn default_min_samples() -> usize { 15 }
fn default_position_tolerance() -> f64 { 0.02 }
fn default_angle_tolerance() -> f64 { 10.0 }
fn default_refine_interval() -> f64 { 5.0 }
fn default_max_refine_frames() -> usize { 30 }
fn default_max_observations() -> usize { 300 }
fn default_calibration_output() -> String { "calibration.json".to_string() }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_calib_distance(),
            min_duration: default_min_duration(),
            min_samples: default_min_samples(),
            position_tolerance: default_position_tolerance(),
            angle_tolerance_deg: default_angle_tolerance(),
            refine_interval: default_refine_interval(),
            max_refine_frames: default_max_refine_frames(),
            max_observations: default_max_observations(),
            output_path: default_calibration_output(),
        }
    }
}

/// カメラ内部パラメータ校正用の ChArUco ボード
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharucoConfig {
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    #[serde(default = "default_squares_x")]
    pub squares_x: i32,
    #[serde(default = "default_squares_y")]
    pub squares_y: i32,
    /// マス辺長（メートル）
    #[serde(default = "default_square_length")]
    pub square_length: f64,
    /// マーカー辺長（メートル）
    #[serde(default = "default_charuco_marker_length")]
    pub marker_length: f64,
    /// キャプチャするフレーム数
    #[serde(default = "default_intrinsic_frames")]
    pub frames: usize,
    /// キャプチャに必要なコーナー数
    #[serde(default = "default_min_corners")]
    pub min_corners: usize,
    /// キャプチャ間隔（秒）
    #[serde(default = "default_capture_interval")]
    pub capture_interval: f64,
    /// これより再投影誤差の大きいフレームは捨てる（ピクセル）
    #[serde(default = "default_max_view_error")]
    pub max_view_error: f64,
    #[serde(default = "default_intrinsics_output")]
    pub output_path: String,
}

fn default_squares_x() -> i32 { 8 }
fn default_squares_y() -> i32 { 7 }
fn default_square_length() -> f64 { 0.04 }
fn default_charuco_marker_length() -> f64 { 0.02 }
fn default_intrinsic_frames() -> usize { 20 }
fn default_min_corners() -> usize { 15 }
fn default_capture_interval() -> f64 { 1.0 }
fn default_max_view_error() -> f64 { 1.0 }
fn default_intrinsics_output() -> String { "camera_calibration.json".to_string() }

impl Default for CharucoConfig {
    fn default() -> Self {
        Self {
            dictionary: default_dictionary(),
            squares_x: default_squares_x(),
            squares_y: default_squares_y(),
            square_length: default_square_length(),
            marker_length: default_charuco_marker_length(),
            frames: default_intrinsic_frames(),
            min_corners: default_min_corners(),
            capture_interval: default_capture_interval(),
            max_view_error: default_max_view_error(),
            output_path: default_intrinsics_output(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCamConfig {
    /// 基準カメラ番号
    #[serde(default)]
    pub primary: usize,
    /// 同時観測とみなす時間差（秒）
    #[serde(default = "default_pair_window")]
    pub pair_window: f64,
    /// アライメント用サンプルの最低信頼度
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// カメラごとに保持するサンプル数
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
    /// 自動アライメント間隔（秒、0 = 手動のみ）
    #[serde(default)]
    pub auto_refine_interval: f64,
}

fn default_pair_window() -> f64 { 0.03 }
fn default_min_confidence() -> f64 { 0.5 }
fn default_max_pairs() -> usize { 200 }

impl Default for MultiCamConfig {
    fn default() -> Self {
        Self {
            primary: 0,
            pair_window: default_pair_window(),
            min_confidence: default_min_confidence(),
            max_pairs: default_max_pairs(),
            auto_refine_interval: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayspaceConfig {
    /// ルーム座標でのカメラ位置（メートル）
    #[serde(default)]
    pub position: [f64; 3],
    /// カメラ回転 [rx, ry, rz] 度
    #[serde(default)]
    pub rotation_deg: [f64; 3],
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 { 1.0 }

impl Default for PlayspaceConfig {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation_deg: [0.0; 3],
            scale: default_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing フィルタ（RUST_LOG が優先）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// ログファイルの出力先
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "logs".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            file: true,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config.validated())
    }

    /// 読めなければデフォルト
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{e:#}, using defaults");
                Self::default().validated()
            }
        }
    }

    /// 範囲外の値を丸める
    pub fn validated(mut self) -> Self {
        if !(self.markers.size > 0.0 && self.markers.size <= 1.0) {
            tracing::warn!(size = self.markers.size, "marker size out of range, using default");
            self.markers.size = default_marker_size();
        }
        self.markers.markers_per_tracker = self.markers.markers_per_tracker.max(1);

        if self.trackers.is_empty() {
            self.trackers = default_trackers();
        }
        if self.cameras.is_empty() {
            self.cameras = default_cameras();
        }
        for cam in &mut self.cameras {
            cam.latency = cam.latency.max(0.0);
            cam.fps = cam.fps.max(1);
        }

        let s = &mut self.smoothing;
        // 0 は最新サンプルをそのまま使う
        if !s.window.is_finite() {
            s.window = default_window();
        }
        s.window = s.window.max(0.0);
        s.additional = clamp_factor(s.additional);
        s.depth = clamp_factor(s.depth);
        s.min_weight = s.min_weight.clamp(0.0, 1.0);

        let c = &mut self.calibration;
        if !(c.distance_threshold > 0.0) {
            c.distance_threshold = default_calib_distance();
        }
        c.min_duration = c.min_duration.max(0.0);
        c.min_samples = c.min_samples.max(1);
        c.max_refine_frames = c.max_refine_frames.max(2);
        c.max_observations = c.max_observations.max(c.max_refine_frames);

        let b = &mut self.charuco;
        b.squares_x = b.squares_x.max(3);
        b.squares_y = b.squares_y.max(3);
        if !(b.square_length > 0.0) {
            b.square_length = default_square_length();
        }
        if !(b.marker_length > 0.0 && b.marker_length < b.square_length) {
            tracing::warn!(marker_length = b.marker_length, "ChArUco marker must fit in a square, using 1/2");
            b.marker_length = b.square_length * 0.5;
        }
        b.frames = b.frames.max(3);
        // 歪み係数5個 + K を解くのに最低6点
        b.min_corners = b.min_corners.max(6);
        b.capture_interval = b.capture_interval.max(0.0);

        let m = &mut self.multicam;
        if m.primary >= self.cameras.len() {
            m.primary = 0;
        }
        m.pair_window = m.pair_window.max(0.0);
        m.max_pairs = m.max_pairs.max(3);

        if !(self.playspace.scale > 0.0) {
            self.playspace.scale = default_scale();
        }
        if !(self.vmt.send_rate > 0.0) {
            self.vmt.send_rate = default_send_rate();
        }
        self
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }
}

/// 平滑化係数は [0, 0.99]
fn clamp_factor(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 0.99)
    } else {
        0.0
    }
}
