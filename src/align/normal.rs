//! Normal equations with each match's consensus position profiled out.
//!
//! For a match with live detections `i`, world positions `wᵢ`, weights `Wᵢ`
//! and free-parameter derivatives `Dᵢ`, the consensus is the weighted mean
//! `w̄ = (ΣWᵢ)⁻¹ ΣWᵢwᵢ` and the contributions are
//!
//! ```text
//! α += Σ DᵢᵀWᵢDᵢ − (ΣWᵢDᵢ)ᵀ (ΣWᵢ)⁻¹ (ΣWᵢDᵢ)
//! β += Σ DᵢᵀWᵢ(wᵢ − w̄)
//! ```
//!
//! so that the Gauss-Newton step solves `α Δ = −β`.

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2xX, Vector2};

use super::Match;
use crate::error::{FitError, Result};
use crate::registry::{FreeBlock, TransformRegistry};

/// Smallest acceptable pivot of the diagonally scaled system.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Per-worker accumulator for one pass over the matches.
#[derive(Debug, Clone)]
pub(crate) struct NormalEquations {
    pub alpha: DMatrix<f64>,
    pub beta: DVector<f64>,
    pub chisq: f64,
    /// Residual degrees of freedom before subtracting free parameters.
    pub dof: usize,
    pub n_matches: usize,
}

impl NormalEquations {
    pub fn zeros(n: usize) -> Self {
        Self {
            alpha: DMatrix::zeros(n, n),
            beta: DVector::zeros(n),
            chisq: 0.0,
            dof: 0,
            n_matches: 0,
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.alpha += other.alpha;
        self.beta += other.beta;
        self.chisq += other.chisq;
        self.dof += other.dof;
        self.n_matches += other.n_matches;
        self
    }

    /// Remap one match and add its terms.
    pub fn accumulate(&mut self, m: &mut Match, registry: &TransformRegistry) -> Result<()> {
        let mut live: Vec<(Vector2<f64>, Matrix2<f64>, Vec<FreeBlock>)> = Vec::new();
        for d in m.detections_mut() {
            let bound = d.map.bind(registry)?;
            let (world, blocks) = bound.free_derivs(d.pix.0, d.pix.1);
            d.world = world;
            if !d.clipped {
                live.push((Vector2::new(world.0, world.1), d.inv_cov, blocks));
            }
        }
        if live.len() < 2 {
            return Ok(());
        }

        let wsum = live.iter().fold(Matrix2::<f64>::zeros(), |acc, (_, w, _)| acc + w);
        let Some(wsum_inv) = wsum.try_inverse() else {
            return Ok(());
        };
        let mean = wsum_inv * live.iter().fold(Vector2::<f64>::zeros(), |acc, (p, w, _)| acc + w * p);

        self.n_matches += 1;
        self.dof += 2 * (live.len() - 1);
        for (p, w, _) in &live {
            let r = p - mean;
            self.chisq += r.dot(&(w * r));
        }

        // Compact column set of every free block touched by this match.
        let mut spans: Vec<(usize, usize)> = live
            .iter()
            .flat_map(|(_, _, blocks)| blocks.iter().map(|b| (b.offset, b.derivs.ncols())))
            .filter(|&(_, n)| n > 0)
            .collect();
        spans.sort_unstable();
        spans.dedup();
        if spans.is_empty() {
            return Ok(());
        }
        let mut globals = Vec::new();
        for &(offset, count) in &spans {
            globals.extend(offset..offset + count);
        }
        let local_start = |offset: usize| -> usize {
            let mut start = 0;
            for &(o, c) in &spans {
                if o == offset {
                    break;
                }
                start += c;
            }
            start
        };

        let m_loc = globals.len();
        let mut alpha = DMatrix::<f64>::zeros(m_loc, m_loc);
        let mut beta = DVector::<f64>::zeros(m_loc);
        let mut b_sum = Matrix2xX::<f64>::zeros(m_loc);
        for (p, w, blocks) in &live {
            let mut d = Matrix2xX::<f64>::zeros(m_loc);
            for block in blocks {
                let start = local_start(block.offset);
                let mut cols = d.columns_mut(start, block.derivs.ncols());
                cols += &block.derivs;
            }
            let wd = w * &d;
            alpha += d.tr_mul(&wd);
            beta += d.tr_mul(&(w * (p - mean)));
            b_sum += wd;
        }
        alpha -= b_sum.tr_mul(&(wsum_inv * &b_sum));

        for (i, &gi) in globals.iter().enumerate() {
            self.beta[gi] += beta[i];
            for (j, &gj) in globals.iter().enumerate() {
                self.alpha[(gi, gj)] += alpha[(i, j)];
            }
        }
        Ok(())
    }
}

/// Solve `α Δ = −β` by Cholesky decomposition of the diagonally scaled system.
///
/// A non-positive or vanishing pivot is reported as [`FitError::SingularSystem`]
/// naming the atomic map that owns the offending parameter.
pub(crate) fn solve(
    alpha: &DMatrix<f64>,
    beta: &DVector<f64>,
    registry: &TransformRegistry,
) -> Result<DVector<f64>> {
    let n = beta.len();
    let singular = |index: usize| match registry.param_block_of(index) {
        Some((block, i)) => FitError::SingularSystem {
            block: block.to_string(),
            index: i,
        },
        None => FitError::SingularSystem {
            block: "free parameter vector".to_string(),
            index,
        },
    };

    let mut scale = DVector::<f64>::zeros(n);
    for i in 0..n {
        let d = alpha[(i, i)];
        if !(d > 0.0) || !d.is_finite() {
            return Err(singular(i));
        }
        scale[i] = 1.0 / d.sqrt();
    }

    let scaled = DMatrix::from_fn(n, n, |i, j| alpha[(i, j)] * scale[i] * scale[j]);
    let rhs = beta.component_mul(&scale);
    let chol = match scaled.clone().cholesky() {
        Some(c) => c,
        None => return Err(singular(first_bad_pivot(&scaled).unwrap_or(0))),
    };
    let l = chol.l_dirty();
    if let Some(k) = (0..n).find(|&k| l[(k, k)] * l[(k, k)] < PIVOT_TOLERANCE) {
        return Err(singular(k));
    }

    let x = chol.solve(&rhs);
    Ok(-x.component_mul(&scale))
}

/// Index of the first pivot that fails a column-wise Cholesky factorization.
fn first_bad_pivot(a: &DMatrix<f64>) -> Option<usize> {
    let n = a.nrows();
    let mut l = DMatrix::<f64>::zeros(n, n);
    for k in 0..n {
        let mut d = a[(k, k)];
        for j in 0..k {
            d -= l[(k, j)] * l[(k, j)];
        }
        if !(d > PIVOT_TOLERANCE) {
            return Some(k);
        }
        let lkk = d.sqrt();
        l[(k, k)] = lkk;
        for i in k + 1..n {
            let mut s = a[(i, k)];
            for j in 0..k {
                s -= l[(i, j)] * l[(k, j)];
            }
            l[(i, k)] = s / lkk;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::MapShape;

    #[test]
    fn test_first_bad_pivot() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.5, 1.0, 0.5, 1.0, 0.5, 1.0, 0.5, 1.0]);
        assert_eq!(first_bad_pivot(&a), Some(2));
        let b = DMatrix::<f64>::identity(3, 3);
        assert_eq!(first_bad_pivot(&b), None);
    }

    #[test]
    fn test_solve_names_block() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("a", MapShape::Constant, Some(&[0.0, 0.0])).unwrap();
        reg.learn_atomic("b", MapShape::Constant, Some(&[0.0, 0.0])).unwrap();
        reg.rebuild_parameter_vector();

        // Columns 1 and 3 (a.y and b.y) are identical.
        let mut alpha = DMatrix::<f64>::identity(4, 4);
        alpha[(1, 3)] = 1.0;
        alpha[(3, 1)] = 1.0;
        let beta = DVector::from_element(4, 1.0);
        match solve(&alpha, &beta, &reg).unwrap_err() {
            FitError::SingularSystem { block, index } => {
                assert_eq!(block, "b");
                assert_eq!(index, 1);
            }
            e => panic!("unexpected error {e}"),
        }

        let x = solve(&DMatrix::identity(4, 4), &beta, &reg).unwrap();
        assert!((x[2] + 1.0).abs() < 1e-15);

        let mut zero = DMatrix::<f64>::identity(4, 4);
        zero[(0, 0)] = 0.0;
        assert!(matches!(
            solve(&zero, &beta, &reg),
            Err(FitError::SingularSystem { ref block, index: 0 }) if block == "a"
        ));
    }
}
