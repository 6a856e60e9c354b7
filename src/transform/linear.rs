//! Affine (6-parameter) and constant-shift maps.
//!
//! Parameter layout for the affine map:
//!
//! ```text
//! x_world = v0 + v1·x + v2·y
//! y_world = v3 + v4·x + v5·y
//! ```

use nalgebra::Matrix2;

/// Number of affine parameters.
pub const LINEAR_PARAMS: usize = 6;

/// Number of constant-shift parameters.
pub const CONSTANT_PARAMS: usize = 2;

/// Parameters of the identity affine map.
pub fn identity_params() -> Vec<f64> {
    vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}

#[inline]
pub fn to_world(v: &[f64], x: f64, y: f64) -> (f64, f64) {
    (v[0] + v[1] * x + v[2] * y, v[3] + v[4] * x + v[5] * y)
}

#[inline]
pub fn jacobian(v: &[f64]) -> Matrix2<f64> {
    Matrix2::new(v[1], v[2], v[4], v[5])
}

/// Analytic inverse. Returns `None` if the 2×2 part is singular.
pub fn to_pix(v: &[f64], xw: f64, yw: f64) -> Option<(f64, f64)> {
    let det = v[1] * v[5] - v[2] * v[4];
    if det.abs() < 1e-300 {
        return None;
    }
    let dx = xw - v[0];
    let dy = yw - v[3];
    Some(((v[5] * dx - v[2] * dy) / det, (-v[4] * dx + v[1] * dy) / det))
}

/// Derivatives of `(x_world, y_world)` with respect to the 6 parameters.
pub fn param_derivs(x: f64, y: f64) -> [[f64; LINEAR_PARAMS]; 2] {
    [[1.0, x, y, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0, x, y]]
}
