//! Two-dimensional polynomial maps.
//!
//! Each world axis is an independent polynomial in the pixel coordinates:
//!
//! ```text
//! x_world = Σ A_pq · x^p · y^q
//! y_world = Σ B_pq · x^p · y^q
//! ```
//!
//! The set of `(p, q)` terms is either every pair with `p + q <= order`
//! ([`PolyOrder::Total`]) or every pair with `p <= order_x` and `q <= order_y`
//! ([`PolyOrder::Separate`]). Parameters are laid out as all `A` coefficients
//! followed by all `B` coefficients, both in [`term_pairs`] order.

use nalgebra::Matrix2;

/// Term set of a polynomial map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolyOrder {
    /// All terms with `p + q <= order`.
    Total(u32),
    /// All terms with `p <= x` and `q <= y`.
    Separate { x: u32, y: u32 },
}

impl PolyOrder {
    /// Highest power of `x` that appears.
    pub fn max_x(&self) -> u32 {
        match *self {
            PolyOrder::Total(n) => n,
            PolyOrder::Separate { x, .. } => x,
        }
    }

    /// Highest power of `y` that appears.
    pub fn max_y(&self) -> u32 {
        match *self {
            PolyOrder::Total(n) => n,
            PolyOrder::Separate { y, .. } => y,
        }
    }

    fn contains(&self, p: u32, q: u32) -> bool {
        match *self {
            PolyOrder::Total(n) => p + q <= n,
            PolyOrder::Separate { x, y } => p <= x && q <= y,
        }
    }

    /// True if the polynomial can represent the identity map.
    pub fn supports_identity(&self) -> bool {
        self.contains(1, 0) && self.contains(0, 1)
    }
}

/// Enumerate all (p, q) pairs for the given order.
///
/// Terms are enumerated in order of increasing sum, then decreasing p:
///   sum=0: (0,0)
///   sum=1: (1,0), (0,1)
///   sum=2: (2,0), (1,1), (0,2)
///
/// Separate orders keep the same ordering and skip pairs outside the box.
pub fn term_pairs(order: PolyOrder) -> Vec<(u32, u32)> {
    let max_sum = order.max_x() + order.max_y();
    let mut pairs = Vec::new();
    for s in 0..=max_sum {
        for p in (0..=s).rev() {
            let q = s - p;
            if order.contains(p, q) {
                pairs.push((p, q));
            }
        }
    }
    pairs
}

/// Number of coefficients per axis.
pub fn num_coeffs(order: PolyOrder) -> usize {
    match order {
        PolyOrder::Total(n) => ((n + 1) * (n + 2) / 2) as usize,
        PolyOrder::Separate { x, y } => ((x + 1) * (y + 1)) as usize,
    }
}

/// Flat index of term `(p, q)`, if present.
pub fn coeff_index(order: PolyOrder, p: u32, q: u32) -> Option<usize> {
    term_pairs(order).iter().position(|&t| t == (p, q))
}

/// Parameter vector (A then B) of the identity map.
///
/// Terms that the order cannot hold are left at zero.
pub fn identity_params(order: PolyOrder) -> Vec<f64> {
    let n = num_coeffs(order);
    let mut params = vec![0.0; 2 * n];
    if let Some(i) = coeff_index(order, 1, 0) {
        params[i] = 1.0;
    }
    if let Some(i) = coeff_index(order, 0, 1) {
        params[n + i] = 1.0;
    }
    params
}

/// Powers `x^0..=x^max`.
fn powers(v: f64, max: u32) -> Vec<f64> {
    let mut out = Vec::with_capacity(max as usize + 1);
    let mut acc = 1.0;
    for _ in 0..=max {
        out.push(acc);
        acc *= v;
    }
    out
}

/// Values of every term at `(x, y)`, in [`term_pairs`] order.
pub fn term_values(order: PolyOrder, x: f64, y: f64) -> Vec<f64> {
    let xp = powers(x, order.max_x());
    let yp = powers(y, order.max_y());
    term_pairs(order)
        .into_iter()
        .map(|(p, q)| xp[p as usize] * yp[q as usize])
        .collect()
}

/// Evaluate both axes: returns `(x_world, y_world)`.
pub fn eval(order: PolyOrder, params: &[f64], x: f64, y: f64) -> (f64, f64) {
    let n = num_coeffs(order);
    let terms = term_values(order, x, y);
    let xw = terms.iter().zip(&params[..n]).map(|(t, c)| t * c).sum();
    let yw = terms.iter().zip(&params[n..2 * n]).map(|(t, c)| t * c).sum();
    (xw, yw)
}

/// Jacobian `d(world)/d(pix)` at `(x, y)`.
pub fn jacobian(order: PolyOrder, params: &[f64], x: f64, y: f64) -> Matrix2<f64> {
    let n = num_coeffs(order);
    let xp = powers(x, order.max_x());
    let yp = powers(y, order.max_y());
    let mut j = Matrix2::zeros();
    for (k, (p, q)) in term_pairs(order).into_iter().enumerate() {
        let (p, q) = (p as usize, q as usize);
        let d_dx = if p > 0 { p as f64 * xp[p - 1] * yp[q] } else { 0.0 };
        let d_dy = if q > 0 { q as f64 * xp[p] * yp[q - 1] } else { 0.0 };
        j[(0, 0)] += params[k] * d_dx;
        j[(0, 1)] += params[k] * d_dy;
        j[(1, 0)] += params[n + k] * d_dx;
        j[(1, 1)] += params[n + k] * d_dy;
    }
    j
}
