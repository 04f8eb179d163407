//! Rigid-body superposition via the Kabsch algorithm (SVD form).

use nalgebra::{Matrix3, Vector3};

use crate::error::{FoldscanError, Result};

/// A proper rigid transform: row-major rotation (orthonormal, det = +1)
/// plus translation, mapping target coordinates into the query frame.
#[derive(Debug, Clone, Copy)]
pub struct Superposition {
    pub rotation: [[f64; 3]; 3],
    pub translation: [f64; 3],
}

impl Superposition {
    pub fn identity() -> Self {
        Superposition {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0, 0.0, 0.0],
        }
    }

    /// Transform a point into the query frame.
    pub fn apply(&self, p: &[f32; 3]) -> [f64; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        let (x, y, z) = (f64::from(p[0]), f64::from(p[1]), f64::from(p[2]));
        [
            r[0][0] * x + r[0][1] * y + r[0][2] * z + t[0],
            r[1][0] * x + r[1][1] * y + r[1][2] * z + t[1],
            r[2][0] * x + r[2][1] * y + r[2][2] * z + t[2],
        ]
    }
}

/// Least-squares fit of `mobile` onto `reference` (paired one-to-one).
///
/// The rotation comes out of a fresh SVD on every call, so repeated
/// refinement cannot drift away from orthonormality. A negative
/// determinant (reflection) is corrected by flipping the singular vector
/// of the smallest singular value.
pub fn kabsch_fit(reference: &[[f32; 3]], mobile: &[[f32; 3]]) -> Result<Superposition> {
    if reference.len() != mobile.len() {
        return Err(FoldscanError::LengthMismatch(format!(
            "point sets differ: {} vs {}",
            reference.len(),
            mobile.len()
        )));
    }
    if reference.len() < 3 {
        return Err(FoldscanError::DegenerateAlignment(format!(
            "{} point pairs are too few for a rigid fit",
            reference.len()
        )));
    }

    let n = reference.len() as f64;
    let mut ref_center = Vector3::zeros();
    let mut mob_center = Vector3::zeros();
    for (r, m) in reference.iter().zip(mobile) {
        ref_center += Vector3::new(f64::from(r[0]), f64::from(r[1]), f64::from(r[2]));
        mob_center += Vector3::new(f64::from(m[0]), f64::from(m[1]), f64::from(m[2]));
    }
    ref_center /= n;
    mob_center /= n;

    // Cross-covariance H = sum over pairs of mobile_centered * ref_centered^T
    let mut h = Matrix3::zeros();
    for (r, m) in reference.iter().zip(mobile) {
        let rc = Vector3::new(f64::from(r[0]), f64::from(r[1]), f64::from(r[2])) - ref_center;
        let mc = Vector3::new(f64::from(m[0]), f64::from(m[1]), f64::from(m[2])) - mob_center;
        h += mc * rc.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| FoldscanError::DegenerateAlignment("SVD failed to converge".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| FoldscanError::DegenerateAlignment("SVD failed to converge".to_string()))?;

    let v = v_t.transpose();
    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        // Improper rotation: flip the column of V paired with the smallest
        // singular value (last after nalgebra's descending sort).
        let mut v_fixed = v;
        for row in 0..3 {
            v_fixed[(row, 2)] = -v_fixed[(row, 2)];
        }
        rotation = v_fixed * u.transpose();
    }

    if rotation.iter().any(|x| !x.is_finite()) {
        return Err(FoldscanError::DegenerateAlignment(
            "rotation fit produced non-finite values".to_string(),
        ));
    }

    let translation = ref_center - rotation * mob_center;
    Ok(Superposition {
        rotation: [
            [rotation[(0, 0)], rotation[(0, 1)], rotation[(0, 2)]],
            [rotation[(1, 0)], rotation[(1, 1)], rotation[(1, 2)]],
            [rotation[(2, 0)], rotation[(2, 1)], rotation[(2, 2)]],
        ],
        translation: [translation[0], translation[1], translation[2]],
    })
}

/// RMSD of paired points under a superposition of the mobile set.
pub fn rmsd_under(
    reference: &[[f32; 3]],
    mobile: &[[f32; 3]],
    superposition: &Superposition,
) -> f64 {
    if reference.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = reference
        .iter()
        .zip(mobile)
        .map(|(r, m)| {
            let p = superposition.apply(m);
            let dx = p[0] - f64::from(r[0]);
            let dy = p[1] - f64::from(r[1]);
            let dz = p[2] - f64::from(r[2]);
            dx * dx + dy * dy + dz * dz
        })
        .sum();
    (sum_sq / reference.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_points_fit_to_identity() {
        let pts = vec![
            [0.0, 0.0, 0.0],
            [3.8, 0.0, 0.0],
            [5.0, 2.9, 0.0],
            [6.1, 4.0, 3.3],
        ];
        let sp = kabsch_fit(&pts, &pts).unwrap();
        assert!(rmsd_under(&pts, &pts, &sp) < 1e-6);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((sp.rotation[i][j] - expected).abs() < 1e-6);
            }
            assert!(sp.translation[i].abs() < 1e-6);
        }
    }

    #[test]
    fn translated_points_fit_exactly() {
        let p1 = vec![
            [0.0, 0.0, 0.0],
            [3.8, 0.0, 0.0],
            [5.0, 2.9, 0.0],
            [6.1, 4.0, 3.3],
        ];
        let p2: Vec<[f32; 3]> = p1.iter().map(|p| [p[0] + 10.0, p[1] - 4.0, p[2] + 7.5]).collect();
        let sp = kabsch_fit(&p1, &p2).unwrap();
        assert!(rmsd_under(&p1, &p2, &sp) < 1e-5);
    }

    #[test]
    fn rotated_points_fit_exactly() {
        // 90 degrees around Z: (x, y) -> (-y, x)
        let p1 = vec![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 0.0, 2.0],
        ];
        let p2 = vec![
            [0.0, 1.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 0.0, 2.0],
        ];
        let sp = kabsch_fit(&p1, &p2).unwrap();
        assert!(rmsd_under(&p1, &p2, &sp) < 1e-5);
        // Proper rotation, no reflection.
        let r = Matrix3::from_fn(|i, j| sp.rotation[i][j]);
        assert!((r.determinant() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mirrored_points_get_proper_rotation() {
        let p1 = vec![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
        ];
        let p2: Vec<[f32; 3]> = p1.iter().map(|p| [-p[0], p[1], p[2]]).collect();
        let sp = kabsch_fit(&p1, &p2).unwrap();
        let r = Matrix3::from_fn(|i, j| sp.rotation[i][j]);
        assert!((r.determinant() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_pairs_rejected() {
        let p = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        assert!(matches!(
            kabsch_fit(&p, &p).unwrap_err(),
            FoldscanError::DegenerateAlignment(_)
        ));
    }
}
