use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// カメラ内部パラメータ（ピンホール + 歪み係数 [k1, k2, p1, p2, k3]）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub dist_coeffs: [f64; 5],
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            dist_coeffs: [0.0; 5],
            width,
            height,
        }
    }

    /// FOVから構築（正方ピクセル、主点は画像中心）
    pub fn from_fov(fov_v_deg: f64, width: u32, height: u32) -> Self {
        let h = height as f64;
        let fy = h / (2.0 * (fov_v_deg.to_radians() / 2.0).tan());
        Self::new(fy, fy, width as f64 / 2.0, h / 2.0, width, height)
    }

    /// キャリブレーション結果から構築
    ///
    /// - intrinsic: 内部パラメータ行列 K (row-major 3x3)
    /// - dist_coeffs: 歪み係数（5個未満なら残りはゼロ）
    pub fn from_calibration(intrinsic: &[f64; 9], dist_coeffs: &[f64], width: u32, height: u32) -> Self {
        let mut dc = [0.0; 5];
        for (dst, src) in dc.iter_mut().zip(dist_coeffs) {
            *dst = *src;
        }
        Self {
            fx: intrinsic[0],
            fy: intrinsic[4],
            cx: intrinsic[2],
            cy: intrinsic[5],
            dist_coeffs: dc,
            width,
            height,
        }
    }

    pub fn with_distortion(mut self, dist_coeffs: [f64; 5]) -> Self {
        self.dist_coeffs = dist_coeffs;
        self
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn has_distortion(&self) -> bool {
        self.dist_coeffs.iter().any(|c| *c != 0.0)
    }

    /// 正規化座標に順方向歪みを適用
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// カメラ座標系の3D点を歪みありピクセル座標へ投影
    /// カメラの後ろにある点は None
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= 1e-9 {
            return None;
        }
        let (xd, yd) = self.distort_normalized(p.x / p.z, p.y / p.z);
        Some(Point2::new(self.fx * xd + self.cx, self.fy * yd + self.cy))
    }

    /// 歪んだピクセル座標 → 歪み補正済みの正規化カメラ座標
    pub fn normalize_point(&self, px: &Point2<f64>) -> Point2<f64> {
        let (u, v) = self.undistort_point(px.x, px.y);
        Point2::new((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// 歪んだピクセル座標を歪み補正して理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f64, v_dist: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u_dist, v_dist);
        }
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;

        let xd = (u_dist - self.cx) / self.fx;
        let yd = (v_dist - self.cy) / self.fy;

        let mut x = xd;
        let mut y = yd;
        let mut best = (x, y);
        let mut best_residual = f64::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let (fx_val, fy_val) = {
                let (dx, dy) = self.distort_normalized(x, y);
                (dx - xd, dy - yd)
            };

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best = (x, y);
            }
            // 十分収束したら終了
            if residual < 1e-24 {
                break;
            }

            // ヤコビアン (j10 == j01)

            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j01;
            if det.abs() < 1e-14 {
                break; // 特異ヤコビアン → best値を使用
            }

            x -= (j11 * fx_val - j01 * fy_val) / det;
            y -= (-j01 * fx_val + j00 * fy_val) / det;
        }

        (best.0 * self.fx + self.cx, best.1 * self.fy + self.cy)
    }

    pub fn contains(&self, px: &Point2<f64>) -> bool {
        px.x >= 0.0 && px.y >= 0.0 && px.x < self.width as f64 && px.y < self.height as f64
    }
}
