//! Initialization of defaulted maps from a trusted reference transform.
//!
//! Maps learned without parameters start at the identity, which can be far
//! from the truth (a device polynomial in pixels versus a world system in
//! degrees). Before the real fit, each group of points that shares defaulted
//! maps is fitted to synthetic matches: a grid of pixel positions across every
//! device, each paired with the position its reference transform (typically
//! the starting WCS reprojected into the field) assigns it.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::align::{AlignConfig, CoordAlign, Detection, Match};
use crate::error::{FitError, Result};
use crate::registry::TransformRegistry;
use crate::transform::{PixelMap, IDENTITY_NAME};

/// One arcsecond in degrees.
const ARCSEC: f64 = 1.0 / 3600.0;

/// Pixel rectangle of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Bounds {
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }
}

/// A point whose map is to be initialized, with its device and reference.
#[derive(Clone, Copy)]
pub struct BootstrapPoint<'a> {
    pub map_name: &'a str,
    pub bounds: Bounds,
    pub reference: &'a dyn PixelMap,
}

/// Configuration for [`fit_defaulted`].
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Samples per point. Default 512.
    pub grid_points: usize,
    /// Nominal positional uncertainty in world units. Default 0.01 arcsec in degrees.
    pub sigma: f64,
    /// Weight of reference detections relative to fit detections. Default 10.
    pub ref_weight_factor: f64,
    /// Relative chi-square tolerance of the fit. Default 0.01.
    pub tolerance: f64,
    /// Iteration cap of the fit. Default 50.
    pub max_iterations: usize,
    /// Seed for the y-index shuffle. Default 1234.
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            grid_points: 512,
            sigma: 0.01 * ARCSEC,
            ref_weight_factor: 10.0,
            tolerance: 0.01,
            max_iterations: 50,
            seed: 1234,
        }
    }
}

/// Result of one [`fit_defaulted`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapOutcome {
    /// No map in the point set was defaulted; nothing was done.
    NothingDefaulted,
    /// The named atomic maps were solved and written back.
    Initialized {
        maps: Vec<String>,
        chisq: f64,
        iterations: usize,
    },
}

/// Pixel sample positions spanning `bounds`, with the y index shuffled.
fn grid(bounds: &Bounds, n: usize, rng: &mut StdRng) -> Vec<(f64, f64)> {
    let mut ys: Vec<usize> = (0..n).collect();
    ys.shuffle(rng);
    let dx = (bounds.xmax - bounds.xmin) / n as f64;
    let dy = (bounds.ymax - bounds.ymin) / n as f64;
    ys.into_iter()
        .enumerate()
        .map(|(ix, iy)| {
            (
                bounds.xmin + (ix as f64 + 0.5) * dx,
                bounds.ymin + (iy as f64 + 0.5) * dy,
            )
        })
        .collect()
}

/// Initialize the defaulted maps used by `points` and copy the solution back.
///
/// Non-defaulted maps are held fixed. On error nothing is written back and the
/// defaulted flags stay set.
pub fn fit_defaulted(
    registry: &mut TransformRegistry,
    points: &[BootstrapPoint<'_>],
    config: &BootstrapConfig,
) -> Result<BootstrapOutcome> {
    let mut work = TransformRegistry::new();
    for p in points {
        work.learn(&registry.clone_map(p.map_name)?)?;
    }

    let (defaulted, settled): (Vec<String>, Vec<String>) = work
        .atomic_names()
        .into_iter()
        .map(str::to_string)
        .partition(|n| work.is_defaulted(n).unwrap_or(false));
    if defaulted.is_empty() {
        return Ok(BootstrapOutcome::NothingDefaulted);
    }
    debug!(
        "Initializing {:?} from {} points ({} fixed maps)",
        defaulted,
        points.len(),
        settled.len()
    );

    if !settled.is_empty() {
        work.set_fixed(&settled)?;
    }
    work.learn_identity()?;
    work.validate()?;
    work.rebuild_parameter_vector();

    let identity = Arc::new(work.issue(IDENTITY_NAME)?);
    let fit_weight = 1.0 / (config.sigma * config.sigma);
    let ref_weight = config.ref_weight_factor * fit_weight;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut matches = Vec::with_capacity(points.len() * config.grid_points);
    for p in points {
        let view = Arc::new(work.issue(p.map_name)?);
        if !view.has_free() {
            continue;
        }
        for (x, y) in grid(&p.bounds, config.grid_points, &mut rng) {
            let world = p.reference.to_world(x, y);
            if !world.0.is_finite() || !world.1.is_finite() {
                continue;
            }
            matches.push(Match::new(vec![
                Detection::new(world, (ref_weight, ref_weight), identity.clone()),
                Detection::new((x, y), (fit_weight, fit_weight), view.clone()),
            ]));
        }
    }

    let align_config = AlignConfig {
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        clip_sigma: None,
        ..Default::default()
    };
    let stats = CoordAlign::new(&mut work, &mut matches, align_config).fit()?;

    for name in &defaulted {
        let solved = work.clone_map(name)?;
        registry.copy_params_into(name, &solved)?;
    }
    info!(
        "Initialized {} defaulted maps from {} synthetic matches (chisq {:.3e}, {} iterations)",
        defaulted.len(),
        stats.n_matches,
        stats.chisq,
        stats.iterations
    );
    Ok(BootstrapOutcome::Initialized {
        maps: defaulted,
        chisq: stats.chisq,
        iterations: stats.iterations,
    })
}

/// Run [`fit_defaulted`] for each group of point indices in order, then for
/// every point not covered by a group. Stops at the first error.
pub fn bootstrap_defaulted(
    registry: &mut TransformRegistry,
    groups: &[Vec<usize>],
    points: &[BootstrapPoint<'_>],
    config: &BootstrapConfig,
) -> Result<Vec<BootstrapOutcome>> {
    let mut covered = BTreeSet::new();
    let mut outcomes = Vec::with_capacity(groups.len());
    for group in groups {
        let selected = group
            .iter()
            .map(|&i| {
                points.get(i).copied().ok_or_else(|| {
                    FitError::configuration(
                        format!("group refers to point {i} of {}", points.len()),
                        vec![i.to_string()],
                    )
                })
            })
            .collect::<Result<Vec<BootstrapPoint<'_>>>>()?;
        covered.extend(group.iter().copied());
        outcomes.push(fit_defaulted(registry, &selected, config)?);
    }

    // Anything still defaulted outside the groups (e.g. non-polynomial maps).
    for (i, p) in points.iter().enumerate() {
        if covered.contains(&i) {
            continue;
        }
        let outcome = fit_defaulted(registry, std::slice::from_ref(p), config)?;
        if outcome != BootstrapOutcome::NothingDefaulted {
            outcomes.push(outcome);
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{AtomicMap, MapShape, PolyOrder};

    #[test]
    fn test_grid_covers_rectangle() {
        let bounds = Bounds::new(0.0, 2048.0, 100.0, 4196.0);
        let mut rng = StdRng::seed_from_u64(1);
        let pts = grid(&bounds, 512, &mut rng);
        assert_eq!(pts.len(), 512);
        let mut ys: Vec<f64> = pts.iter().map(|p| p.1).collect();
        ys.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((ys[0] - (100.0 + 4.0)).abs() < 1e-9);
        assert!((ys[511] - (4196.0 - 4.0)).abs() < 1e-9);
        assert!((pts[0].0 - 2.0).abs() < 1e-9);
        // The y index is not walked in raster order.
        assert!(pts.windows(2).any(|w| w[1].1 < w[0].1));
    }

    #[test]
    fn test_nothing_defaulted_is_noop() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("lin", MapShape::Linear, Some(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]))
            .unwrap();
        reg.rebuild_parameter_vector();
        let generation = reg.generation();
        let reference = AtomicMap::identity("ref");
        let points = [BootstrapPoint {
            map_name: "lin",
            bounds: Bounds::new(0.0, 100.0, 0.0, 100.0),
            reference: &reference,
        }];
        let outcome = fit_defaulted(&mut reg, &points, &BootstrapConfig::default()).unwrap();
        assert_eq!(outcome, BootstrapOutcome::NothingDefaulted);
        assert_eq!(reg.generation(), generation);
    }

    #[test]
    fn test_only_defaulted_maps_are_written() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("dev", MapShape::Poly(PolyOrder::Total(1)), None)
            .unwrap();
        reg.learn_atomic("expo", MapShape::Constant, Some(&[0.5, 0.5]))
            .unwrap();
        reg.learn_composite("expo/dev", vec!["dev".into(), "expo".into()])
            .unwrap();
        reg.rebuild_parameter_vector();

        let reference = AtomicMap::with_params(
            "ref",
            MapShape::Linear,
            vec![10.0, 2.0, 0.0, -5.0, 0.0, 2.0],
        )
        .unwrap();
        let points = [BootstrapPoint {
            map_name: "expo/dev",
            bounds: Bounds::new(0.0, 100.0, 0.0, 50.0),
            reference: &reference,
        }];
        let config = BootstrapConfig {
            grid_points: 64,
            ..Default::default()
        };
        let outcome = fit_defaulted(&mut reg, &points, &config).unwrap();
        assert!(matches!(outcome, BootstrapOutcome::Initialized { ref maps, .. } if maps == &["dev"]));
        assert!(!reg.is_defaulted("dev").unwrap());
        assert_eq!(reg.params_of("expo").unwrap().as_slice(), &[0.5, 0.5]);

        // dev ∘ expo reproduces the reference: dev = ref - (0.5, 0.5).
        let dev = reg.params_of("dev").unwrap();
        let expected = [9.5, 2.0, 0.0, -5.5, 0.0, 2.0];
        for (p, e) in dev.iter().zip(expected) {
            assert!((p - e).abs() < 1e-6, "{dev:?}");
        }
    }

    #[test]
    fn test_failed_fit_leaves_maps_defaulted() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("a", MapShape::Constant, None).unwrap();
        reg.learn_atomic("b", MapShape::Constant, None).unwrap();
        reg.learn_composite("pair", vec!["a".into(), "b".into()])
            .unwrap();
        reg.rebuild_parameter_vector();

        // Two free shifts in one chain cannot be told apart.
        let reference = AtomicMap::with_params("ref", MapShape::Constant, vec![3.0, -1.0]).unwrap();
        let points = [BootstrapPoint {
            map_name: "pair",
            bounds: Bounds::new(0.0, 100.0, 0.0, 100.0),
            reference: &reference,
        }];
        let err = fit_defaulted(&mut reg, &points, &BootstrapConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::SingularSystem { .. }), "{err}");
        for name in ["a", "b"] {
            assert!(reg.is_defaulted(name).unwrap());
            assert_eq!(reg.params_of(name).unwrap().as_slice(), &[0.0, 0.0]);
        }
    }

    #[test]
    fn test_group_index_out_of_range() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("dev", MapShape::Linear, None).unwrap();
        reg.rebuild_parameter_vector();
        let reference = AtomicMap::identity("ref");
        let points = [BootstrapPoint {
            map_name: "dev",
            bounds: Bounds::new(0.0, 100.0, 0.0, 100.0),
            reference: &reference,
        }];
        let err = bootstrap_defaulted(&mut reg, &[vec![0, 3]], &points, &BootstrapConfig::default())
            .unwrap_err();
        match err {
            FitError::Configuration { names, .. } => assert_eq!(names, vec!["3".to_string()]),
            e => panic!("unexpected error {e}"),
        }
        // Nothing ran, so the map is untouched.
        assert!(reg.is_defaulted("dev").unwrap());
    }
}
