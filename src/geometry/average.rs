use nalgebra::{Matrix4, UnitQuaternion, Vector3, Vector4};

/// 重み付きクォータニオン平均（Markley法）
///
/// M = Σ wᵢ qᵢ qᵢᵀ の最大固有値に対応する固有ベクトル。
/// q と -q を区別しないので符号の事前合わせは不要。
/// 結果の符号は最初のサンプルに揃える。
pub fn average_quaternions(samples: &[(UnitQuaternion<f64>, f64)]) -> Option<UnitQuaternion<f64>> {
    let first = samples.iter().find(|(_, w)| *w > 0.0)?;
    if samples.len() == 1 {
        return Some(first.0);
    }

    let mut m = Matrix4::<f64>::zeros();
    let mut total = 0.0;
    for (q, w) in samples {
        if *w <= 0.0 {
            continue;
        }
        let v: Vector4<f64> = q.as_vector().into_owned();
        m += v * v.transpose() * *w;
        total += *w;
    }
    if total <= 0.0 {
        return None;
    }

    let eig = m.symmetric_eigen();
    let (idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    let mut v: Vector4<f64> = eig.eigenvectors.column(idx).into_owned();
    if v.dot(first.0.as_vector()) < 0.0 {
        v = -v;
    }
    if v.norm() < 1e-12 {
        return None;
    }
    Some(UnitQuaternion::from_quaternion(nalgebra::Quaternion::from(v)))
}

/// 重み付き算術平均
pub fn weighted_mean(samples: &[(Vector3<f64>, f64)]) -> Option<Vector3<f64>> {
    let total: f64 = samples.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let sum = samples
        .iter()
        .fold(Vector3::zeros(), |acc, (p, w)| acc + p * w.max(0.0));
    Some(sum / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sample() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1);
        let avg = average_quaternions(&[(q, 1.0)]).unwrap();
        assert!(avg.angle_to(&q) < 1e-12);
    }

    #[test]
    fn test_symmetric_spread_averages_to_centre() {
        let centre = UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0);
        let d = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1);
        let samples = vec![(centre * d, 1.0), (centre * d.inverse(), 1.0)];
        let avg = average_quaternions(&samples).unwrap();
        assert!(avg.angle_to(&centre) < 1e-9);
    }

    #[test]
    fn test_sign_invariance() {
        let a = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.0);
        let b = UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0);
        let neg_b = UnitQuaternion::new_unchecked(-*b.quaternion());
        let avg1 = average_quaternions(&[(a, 1.0), (b, 1.0)]).unwrap();
        let avg2 = average_quaternions(&[(a, 1.0), (neg_b, 1.0)]).unwrap();
        assert!(avg1.angle_to(&avg2) < 1e-9);
        assert!(avg1.angle_to(&UnitQuaternion::from_euler_angles(0.2, 0.0, 0.0)) < 1e-3);
    }

    #[test]
    fn test_weights_pull_towards_heavier_sample() {
        let a = UnitQuaternion::identity();
        let b = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4);
        let avg = average_quaternions(&[(a, 1.0), (b, 3.0)]).unwrap();
        assert!(avg.angle_to(&b) < avg.angle_to(&a));
    }

    #[test]
    fn test_no_positive_weight() {
        let q = UnitQuaternion::identity();
        assert!(average_quaternions(&[(q, 0.0)]).is_none());
        assert!(average_quaternions(&[]).is_none());
        assert!(weighted_mean(&[(Vector3::x(), 0.0)]).is_none());
    }

    #[test]
    fn test_weighted_mean() {
        let m = weighted_mean(&[(Vector3::new(0.0, 0.0, 0.0), 1.0), (Vector3::new(4.0, 0.0, 0.0), 3.0)]).unwrap();
        assert!((m.x - 3.0).abs() < 1e-12);
    }
}
