use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// 点対応から剛体変換を最小二乗推定（Kabsch、スケール固定）
///
/// 戻り値 T は `dst ≈ T * src`。点が3未満、または全点が一直線上なら None。
pub fn fit_rigid(src: &[Point3<f64>], dst: &[Point3<f64>]) -> Option<Isometry3<f64>> {
    let n = src.len();
    if n < 3 || dst.len() != n {
        return None;
    }

    let centroid_src = centroid(src);
    let centroid_dst = centroid(dst);

    // 共分散行列 H = Σ (src - c_src)(dst - c_dst)ᵀ
    let mut h = Matrix3::zeros();
    for (a, b) in src.iter().zip(dst) {
        h += (a.coords - centroid_src) * (b.coords - centroid_dst).transpose();
    }

    let svd = h.svd(true, true);
    // 縮退（ランク1以下）
    let mut sv = [svd.singular_values[0], svd.singular_values[1], svd.singular_values[2]];
    sv.sort_by(|a, b| b.total_cmp(a));
    if sv[1] <= 1e-12 * sv[0] {
        return None;
    }
    let u = svd.u?;
    let v_t = svd.v_t?;

    // R = V Uᵀ
    let mut r = v_t.transpose() * u.transpose();

    // 反射の補正 (det(R) = -1)
    if r.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.column_mut(2).neg_mut();
        r = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = centroid_dst - rotation * centroid_src;

    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

fn centroid(points: &[Point3<f64>]) -> Vector3<f64> {
    points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / points.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_points() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.3, -0.7, 0.2),
        ]
    }

    #[test]
    fn test_identity() {
        let pts = sample_points();
        let t = fit_rigid(&pts, &pts).unwrap();
        assert!(t.translation.vector.norm() < 1e-10);
        assert!(t.rotation.angle() < 1e-10);
    }

    #[test]
    fn test_recovers_transform() {
        let gt = Isometry3::new(Vector3::new(0.5, -1.2, 2.0), Vector3::new(0.2, -0.4, 1.1));
        let src = sample_points();
        let dst: Vec<_> = src.iter().map(|p| gt * p).collect();
        let t = fit_rigid(&src, &dst).unwrap();
        assert_relative_eq!(t.translation.vector, gt.translation.vector, epsilon = 1e-9);
        assert!(t.rotation.angle_to(&gt.rotation) < 1e-9);
    }

    #[test]
    fn test_reflection_is_not_returned() {
        let src = sample_points();
        // x軸反転（鏡像）
        let dst: Vec<_> = src.iter().map(|p| Point3::new(-p.x, p.y, p.z)).collect();
        let t = fit_rigid(&src, &dst).unwrap();
        let r = t.rotation.to_rotation_matrix();
        assert!((r.matrix().determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        let pts = sample_points();
        assert!(fit_rigid(&pts[..2], &pts[..2]).is_none());
        let line: Vec<_> = (0..5).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        assert!(fit_rigid(&line, &line).is_none());
    }
}
