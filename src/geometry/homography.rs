use nalgebra::{
    Isometry3, Matrix3, Point2, Rotation3, SMatrix, SVector, Translation3, UnitQuaternion, Vector3,
};

/// 平面 (Z=0) → 画像のホモグラフィをDLTで推定
///
/// 点数4以上。AᵀA (9x9) の最小固有値の固有ベクトルを解とするので、
/// ちょうど4点の場合も解ける。数値安定のため両側をHartley正規化する。
pub fn dlt_homography(plane: &[Point2<f64>], image: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = plane.len();
    if n < 4 || image.len() != n {
        return None;
    }

    let t_plane = normalizing_transform(plane)?;
    let t_image = normalizing_transform(image)?;

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (pw, pi) in plane.iter().zip(image) {
        let w = t_plane * Vector3::new(pw.x, pw.y, 1.0);
        let i = t_image * Vector3::new(pi.x, pi.y, 1.0);
        let (x, y) = (w.x, w.y);
        let (u, v) = (i.x, i.y);

        let r0 = SVector::<f64, 9>::from_column_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        let r1 = SVector::<f64, 9>::from_column_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        ata += r0 * r0.transpose() + r1 * r1.transpose();
    }

    let eig = ata.symmetric_eigen();
    let (idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eig.eigenvectors.column(idx);

    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    // 正規化を戻す: H = T_img⁻¹ Hn T_plane
    let mut hmat = t_image.try_inverse()? * hn * t_plane;
    let scale = hmat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        hmat /= scale;
    }
    Some(hmat)
}

/// 重心を原点、平均距離を√2にする変換
fn normalizing_transform(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-15 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// 平面ターゲットの2つの姿勢候補
///
/// 正面に近い小さなマーカーでは「奥に倒れた」姿勢と「手前に倒れた」姿勢の
/// 再投影がほぼ一致する。`flipped` は視線方向に対して法線を鏡映した方。
#[derive(Debug, Clone, Copy)]
pub struct PlanarCandidates {
    pub primary: Isometry3<f64>,
    pub flipped: Option<Isometry3<f64>>,
}

/// 正規化カメラ座標でのホモグラフィ (K = I) を姿勢に分解
///
/// 戻り値の姿勢は平面座標 → カメラ座標。平面はカメラ前方 (t.z > 0)。
pub fn decompose_planar(h: &Matrix3<f64>) -> Option<PlanarCandidates> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm = h1.norm() + h2.norm();
    if norm < 1e-15 {
        return None;
    }
    let mut lambda = 2.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);

    let mut r = Matrix3::zeros();
    r.set_column(0, &r1);
    r.set_column(1, &r2);
    r.set_column(2, &r3);

    // SO(3)へ射影
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let t = h3 * lambda;
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    let primary = Isometry3::from_parts(Translation3::from(t), rotation);

    Some(PlanarCandidates {
        primary,
        flipped: flip_about_view_ray(&primary),
    })
}

/// 平面法線を視線方向について鏡映した姿勢
fn flip_about_view_ray(pose: &Isometry3<f64>) -> Option<Isometry3<f64>> {
    let t = pose.translation.vector;
    let ray = t.try_normalize(1e-12)?;
    let normal = pose.rotation * Vector3::z();
    let mirrored = ray * (2.0 * normal.dot(&ray)) - normal;
    let q = UnitQuaternion::rotation_between(&normal, &mirrored)?;
    if q.angle() < 1e-9 {
        return None;
    }
    Some(Isometry3::from_parts(pose.translation, q * pose.rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn square(half: f64) -> Vec<Point2<f64>> {
        vec![
            Point2::new(-half, half),
            Point2::new(half, half),
            Point2::new(half, -half),
            Point2::new(-half, -half),
        ]
    }

    fn project(pose: &Isometry3<f64>, p: &Point2<f64>) -> Point2<f64> {
        let c = pose * Point3::new(p.x, p.y, 0.0);
        Point2::new(c.x / c.z, c.y / c.z)
    }

    #[test]
    fn test_four_point_homography_is_exact() {
        let plane = square(0.025);
        let image = vec![
            Point2::new(0.1, 0.2),
            Point2::new(0.3, 0.25),
            Point2::new(0.28, 0.4),
            Point2::new(0.08, 0.38),
        ];
        let h = dlt_homography(&plane, &image).unwrap();
        for (p, i) in plane.iter().zip(&image) {
            let m = h * Vector3::new(p.x, p.y, 1.0);
            assert!(approx_eq(m.x / m.z, i.x, 1e-9));
            assert!(approx_eq(m.y / m.z, i.y, 1e-9));
        }
    }

    #[test]
    fn test_decompose_recovers_pose() {
        let gt = Isometry3::new(Vector3::new(0.05, -0.02, 0.6), Vector3::new(2.9, 0.2, 0.1));
        let plane = square(0.03);
        let image: Vec<_> = plane.iter().map(|p| project(&gt, p)).collect();
        let h = dlt_homography(&plane, &image).unwrap();
        let c = decompose_planar(&h).unwrap();
        assert!((c.primary.translation.vector - gt.translation.vector).norm() < 1e-6);
        assert!(c.primary.rotation.angle_to(&gt.rotation) < 1e-6);
    }

    #[test]
    fn test_flipped_candidate_keeps_translation() {
        let gt = Isometry3::new(Vector3::new(0.1, 0.0, 0.5), Vector3::new(3.0, 0.0, 0.0));
        let plane = square(0.03);
        let image: Vec<_> = plane.iter().map(|p| project(&gt, p)).collect();
        let c = decompose_planar(&dlt_homography(&plane, &image).unwrap()).unwrap();
        let flipped = c.flipped.unwrap();
        assert_eq!(flipped.translation, c.primary.translation);
        assert!(flipped.rotation.angle_to(&c.primary.rotation) > 1e-3);
    }

    #[test]
    fn test_degenerate_points() {
        let plane = square(0.03);
        let same = vec![Point2::new(0.1, 0.1); 4];
        assert!(dlt_homography(&plane, &same).is_none());
        assert!(dlt_homography(&plane[..3], &plane[..3]).is_none());
    }
}
