//! Robust least-squares alignment of matched detections.
//!
//! A [`Match`] groups detections of one physical point, each seen through its
//! own registry map. [`CoordAlign`] adjusts the registry's free parameters so
//! that every match's detections agree on a common world position:
//!
//! 1. Remap each detection and profile out the match's weighted consensus.
//! 2. Accumulate the normal equations over matches in parallel.
//! 3. Solve by Cholesky decomposition and apply the step, halving it if the
//!    chi-square rose.
//! 4. Stop when the fractional chi-square decrease falls below the tolerance.
//!
//! [`CoordAlign::fit`] wraps the loop in sigma clipping: coarse passes at ten
//! times the tolerance, then fine passes at the full tolerance until a pass
//! clips nothing.

mod normal;

use std::sync::Arc;

use nalgebra::{Matrix2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::accum::Accum;
use crate::error::{FitError, Result};
use crate::registry::{MapView, TransformRegistry};
use crate::transform::PixelMap;

use normal::NormalEquations;

/// Matches per rayon work item.
const MIN_MATCHES_PER_TASK: usize = 64;

// ── Detections and matches ──────────────────────────────────────────────────

/// One measured position and the map that takes it to world coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub pix: (f64, f64),
    /// World position from the most recent remap.
    pub world: (f64, f64),
    /// Inverse covariance of the world position.
    pub inv_cov: Matrix2<f64>,
    pub map: Arc<MapView>,
    pub clipped: bool,
}

impl Detection {
    /// A detection with isotropic per-axis weights `(wx, wy)`.
    pub fn new(pix: (f64, f64), weights: (f64, f64), map: Arc<MapView>) -> Self {
        Self::with_inv_cov(pix, Matrix2::new(weights.0, 0.0, 0.0, weights.1), map)
    }

    pub fn with_inv_cov(pix: (f64, f64), inv_cov: Matrix2<f64>, map: Arc<MapView>) -> Self {
        Self {
            pix,
            world: pix,
            inv_cov,
            map,
            clipped: false,
        }
    }

    pub fn remap(&mut self, registry: &TransformRegistry) -> Result<()> {
        self.world = self.map.bind(registry)?.to_world(self.pix.0, self.pix.1);
        Ok(())
    }

    fn world_vec(&self) -> Vector2<f64> {
        Vector2::new(self.world.0, self.world.1)
    }
}

/// Detections believed to be the same physical point.
#[derive(Debug, Clone, Default)]
pub struct Match {
    detections: Vec<Detection>,
    /// Excluded from the fit; remapped and reported separately.
    pub reserved: bool,
}

impl Match {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            reserved: false,
        }
    }

    pub fn push(&mut self, detection: Detection) {
        self.detections.push(detection);
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn detections_mut(&mut self) -> &mut [Detection] {
        &mut self.detections
    }

    /// Number of unclipped detections.
    pub fn n_live(&self) -> usize {
        self.detections.iter().filter(|d| !d.clipped).count()
    }

    /// True if the match constrains anything.
    pub fn is_live(&self) -> bool {
        self.n_live() >= 2
    }

    pub fn clip_all(&mut self) {
        for d in &mut self.detections {
            d.clipped = true;
        }
    }

    pub fn remap(&mut self, registry: &TransformRegistry) -> Result<()> {
        for d in &mut self.detections {
            d.remap(registry)?;
        }
        Ok(())
    }

    /// Weighted mean of the live detections and the summed weight.
    fn consensus(&self) -> Option<(Vector2<f64>, Matrix2<f64>)> {
        if !self.is_live() {
            return None;
        }
        let live = || self.detections.iter().filter(|d| !d.clipped);
        let wsum = live().fold(Matrix2::<f64>::zeros(), |acc, d| acc + d.inv_cov);
        let inv = wsum.try_inverse()?;
        let wx = live().fold(Vector2::<f64>::zeros(), |acc, d| acc + d.inv_cov * d.world_vec());
        Some((inv * wx, wsum))
    }

    /// Expected share of one detection in the match chi-square, per axis.
    fn dof_share(d: &Detection, wsum: &Matrix2<f64>) -> f64 {
        (1.0 - d.inv_cov.trace() / wsum.trace()).max(0.0)
    }

    /// Clip the worst live detection if its normalized chi-square exceeds
    /// `threshold²`; with `entire_match` clip the whole match instead.
    /// Returns the number of detections clipped.
    fn clip_worst(&mut self, threshold: f64, entire_match: bool) -> usize {
        let Some((mean, wsum)) = self.consensus() else {
            return 0;
        };
        let mut worst: Option<(usize, f64)> = None;
        for (i, d) in self.detections.iter().enumerate() {
            if d.clipped {
                continue;
            }
            let share = Self::dof_share(d, &wsum);
            if share <= 0.0 {
                continue;
            }
            let r = d.world_vec() - mean;
            let chi = r.dot(&(d.inv_cov * r)) / (2.0 * share);
            if worst.map_or(true, |(_, c)| chi > c) {
                worst = Some((i, chi));
            }
        }
        match worst {
            Some((_, chi)) if chi > threshold * threshold && entire_match => {
                let n = self.n_live();
                self.clip_all();
                n
            }
            Some((i, chi)) if chi > threshold * threshold => {
                self.detections[i].clipped = true;
                1
            }
            _ => 0,
        }
    }

    /// Add every live detection's offset from the consensus to `acc`.
    fn accumulate(&self, acc: &mut Accum) {
        let Some((mean, wsum)) = self.consensus() else {
            return;
        };
        for d in self.detections.iter().filter(|d| !d.clipped) {
            acc.add(d, mean.x, mean.y, Self::dof_share(d, &wsum));
        }
    }
}

/// Mark a random `fraction` of matches as reserved. Returns how many were marked.
pub fn reserve_matches(matches: &mut [Match], fraction: f64, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut n = 0;
    for m in matches.iter_mut() {
        if rng.random::<f64>() < fraction {
            m.reserved = true;
            n += 1;
        }
    }
    n
}

// ── Configuration and results ───────────────────────────────────────────────

/// Configuration for [`CoordAlign`].
#[derive(Debug, Clone)]
pub struct AlignConfig {
    /// Fractional chi-square decrease below which the fit has converged. Default 0.001.
    pub tolerance: f64,
    /// Gauss-Newton iterations per [`CoordAlign::fit_once`]. Default 100.
    pub max_iterations: usize,
    /// Times a step may be halved when chi-square rises. Default 8.
    pub max_step_halvings: usize,
    /// Sigma-clipping threshold; `None` disables clipping. Default 5.0.
    pub clip_sigma: Option<f64>,
    /// In fine passes, clip a whole match when any detection is an outlier. Default false.
    pub clip_entire_match: bool,
    /// Coarse clipping ends once a pass improves chisq/dof by less than this
    /// fraction. Default 0.02.
    pub minimum_improvement: f64,
    /// Upper bound on fit/clip passes in [`CoordAlign::fit`]. Default 50.
    pub max_clip_passes: usize,
    /// Fraction of matches held out of the fit by [`align`]. Default 0.
    pub reserve_fraction: f64,
    /// Seed for reserve selection. Default 1234.
    pub seed: u64,
    /// Treat the iteration cap as an error. Default false.
    pub strict: bool,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.001,
            max_iterations: 100,
            max_step_halvings: 8,
            clip_sigma: Some(5.0),
            clip_entire_match: false,
            minimum_improvement: 0.02,
            max_clip_passes: 50,
            reserve_fraction: 0.0,
            seed: 1234,
            strict: false,
        }
    }
}

/// How a fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    /// No step lowered chi-square even after halving; parameters are unchanged
    /// from the last accepted step.
    Stalled,
    /// The iteration cap was reached; parameters are the best found.
    IterationCap,
}

/// Summary of a finished fit.
#[derive(Debug, Clone)]
pub struct FitStatistics {
    pub chisq: f64,
    /// Residual degrees of freedom less the number of free parameters.
    pub dof: usize,
    pub iterations: usize,
    pub status: FitStatus,
    /// Detections clipped, in total.
    pub clipped: usize,
    /// Matches that contributed to the fit.
    pub n_matches: usize,
    /// Reserved matches with at least two live detections.
    pub n_reserved: usize,
    pub fit: Accum,
    pub reserved: Accum,
}

impl FitStatistics {
    pub fn reduced_chisq(&self) -> f64 {
        if self.dof == 0 {
            0.0
        } else {
            self.chisq / self.dof as f64
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Iteratively reweighted least squares over a registry and a set of matches.
pub struct CoordAlign<'a> {
    registry: &'a mut TransformRegistry,
    matches: &'a mut [Match],
    config: AlignConfig,
    tolerance: f64,
    iterations: usize,
    status: FitStatus,
    /// Chi-square and dof at the current parameters.
    last: Option<(f64, usize)>,
}

impl<'a> CoordAlign<'a> {
    pub fn new(registry: &'a mut TransformRegistry, matches: &'a mut [Match], config: AlignConfig) -> Self {
        let tolerance = config.tolerance;
        Self {
            registry,
            matches,
            config,
            tolerance,
            iterations: 0,
            status: FitStatus::Converged,
            last: None,
        }
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn normal_equations(&mut self) -> Result<NormalEquations> {
        self.registry.require_clean()?;
        let n = self.registry.n_free_params();
        let registry = &*self.registry;
        let eq = self
            .matches
            .par_iter_mut()
            .with_min_len(MIN_MATCHES_PER_TASK)
            .filter(|m| !m.reserved)
            .try_fold(
                || NormalEquations::zeros(n),
                |mut acc, m| -> Result<NormalEquations> {
                    acc.accumulate(m, registry)?;
                    Ok(acc)
                },
            )
            .try_reduce(|| NormalEquations::zeros(n), |a, b| Ok(a.merge(b)))?;
        self.last = Some((eq.chisq, eq.dof.saturating_sub(n)));
        Ok(eq)
    }

    /// Remap every detection, reserved matches included.
    pub fn remap(&mut self) -> Result<()> {
        self.registry.require_clean()?;
        let registry = &*self.registry;
        self.matches
            .par_iter_mut()
            .try_for_each(|m| m.remap(registry))
    }

    /// Chi-square and degrees of freedom at the current parameters.
    pub fn chisq(&mut self) -> Result<(f64, usize)> {
        let eq = self.normal_equations()?;
        Ok((eq.chisq, eq.dof.saturating_sub(eq.beta.len())))
    }

    /// Iterate to convergence at the current tolerance, without clipping.
    pub fn fit_once(&mut self) -> Result<FitStatus> {
        let mut params = self.registry.free_parameters()?;
        let mut eq = self.normal_equations()?;
        if params.is_empty() {
            self.status = FitStatus::Converged;
            return Ok(self.status);
        }

        for _ in 0..self.config.max_iterations {
            let delta = normal::solve(&eq.alpha, &eq.beta, self.registry)?;
            let old = eq.chisq;

            let mut step = 1.0;
            let mut halvings = 0;
            let (trial_params, trial) = loop {
                let trial_params = &params + &delta * step;
                self.registry.set_free_parameters(&trial_params)?;
                let trial = self.normal_equations()?;
                if trial.chisq <= old || halvings >= self.config.max_step_halvings {
                    break (trial_params, trial);
                }
                halvings += 1;
                step *= 0.5;
            };
            self.iterations += 1;

            if !(trial.chisq <= old) {
                self.registry.set_free_parameters(&params)?;
                self.normal_equations()?;
                // A rise within tolerance is roundoff at the minimum.
                if trial.chisq - old <= self.tolerance * old {
                    debug!("No downhill step at chisq {:.6e}; at minimum", old);
                    self.status = FitStatus::Converged;
                    return Ok(self.status);
                }
                warn!(
                    "No downhill step after {} halvings in iteration {}; keeping chisq {:.6e}",
                    halvings, self.iterations, old
                );
                self.status = FitStatus::Stalled;
                return Ok(self.status);
            }

            debug!(
                "Iteration {}: chisq {:.6e} -> {:.6e} over {} matches (step {})",
                self.iterations, old, trial.chisq, trial.n_matches, step
            );
            params = trial_params;
            let converged = old - trial.chisq <= self.tolerance * old;
            eq = trial;
            if converged {
                self.status = FitStatus::Converged;
                return Ok(self.status);
            }
        }

        if self.config.strict {
            return Err(FitError::ConvergenceNotReached {
                iterations: self.iterations,
                chisq: eq.chisq,
            });
        }
        warn!(
            "Iteration cap {} reached with chisq {:.6e}",
            self.config.max_iterations, eq.chisq
        );
        self.status = FitStatus::IterationCap;
        Ok(self.status)
    }

    /// Clip outliers among non-reserved matches. Returns the number clipped.
    pub fn sigma_clip(&mut self, threshold: f64, entire_match: bool) -> Result<usize> {
        self.registry.require_clean()?;
        let registry = &*self.registry;
        let n = self
            .matches
            .par_iter_mut()
            .with_min_len(MIN_MATCHES_PER_TASK)
            .filter(|m| !m.reserved)
            .map(|m| -> Result<usize> {
                m.remap(registry)?;
                Ok(m.clip_worst(threshold, entire_match))
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))?;
        if n > 0 {
            self.last = None;
        }
        Ok(n)
    }

    /// Fit with sigma clipping as configured, then report.
    pub fn fit(&mut self) -> Result<FitStatistics> {
        let base = self.config.tolerance;
        let Some(clip_sigma) = self.config.clip_sigma else {
            self.tolerance = base;
            self.fit_once()?;
            return self.statistics();
        };

        let mut coarse = true;
        self.tolerance = 10.0 * base;
        let mut last_reduced = f64::INFINITY;
        let mut passes = 0;
        loop {
            self.fit_once()?;
            let (chisq, dof) = match self.last {
                Some(l) => l,
                None => self.chisq()?,
            };
            let reduced = chisq / dof.max(1) as f64;
            let threshold = clip_sigma * reduced.sqrt();
            let entire = !coarse && self.config.clip_entire_match;
            let n_clipped = self.sigma_clip(threshold, entire)?;
            info!(
                "{} pass {}: chisq/dof {:.4} ({} dof), clipped {} at {:.2}",
                if coarse { "Coarse" } else { "Fine" },
                passes + 1,
                reduced,
                dof,
                n_clipped,
                threshold
            );

            if coarse {
                let improvement = (last_reduced - reduced) / last_reduced;
                if n_clipped == 0 || improvement < self.config.minimum_improvement {
                    coarse = false;
                    self.tolerance = base;
                }
            } else if n_clipped == 0 {
                break;
            }
            last_reduced = reduced;

            passes += 1;
            if passes >= self.config.max_clip_passes {
                warn!("Stopping sigma clipping after {} passes", passes);
                self.fit_once()?;
                break;
            }
        }
        self.statistics()
    }

    /// Residual statistics at the current parameters.
    pub fn statistics(&mut self) -> Result<FitStatistics> {
        let (chisq, dof) = match self.last {
            Some(l) => l,
            None => self.chisq()?,
        };
        self.remap()?;

        let mut fit = Accum::new();
        let mut reserved = Accum::new();
        let (mut n_matches, mut n_reserved, mut clipped) = (0, 0, 0);
        for m in self.matches.iter() {
            clipped += m.detections.iter().filter(|d| d.clipped).count();
            if !m.is_live() {
                continue;
            }
            if m.reserved {
                n_reserved += 1;
                m.accumulate(&mut reserved);
            } else {
                n_matches += 1;
                m.accumulate(&mut fit);
            }
        }

        Ok(FitStatistics {
            chisq,
            dof,
            iterations: self.iterations,
            status: self.status,
            clipped,
            n_matches,
            n_reserved,
            fit,
            reserved,
        })
    }
}

/// Reserve matches as configured, then fit with clipping.
pub fn align(
    registry: &mut TransformRegistry,
    matches: &mut [Match],
    config: &AlignConfig,
) -> Result<FitStatistics> {
    if config.reserve_fraction > 0.0 {
        let n = reserve_matches(matches, config.reserve_fraction, config.seed);
        info!("Reserved {} of {} matches", n, matches.len());
    }
    let stats = CoordAlign::new(registry, matches, config.clone()).fit()?;
    info!(
        "Fit {} matches: chisq {:.2} / {} dof, {} clipped, {} iterations",
        stats.n_matches, stats.chisq, stats.dof, stats.clipped, stats.iterations
    );
    Ok(stats)
}
