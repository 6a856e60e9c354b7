//! Top-level preparation of a registry before the final fit.
//!
//! [`initialize_defaulted`] runs the configuration checks and initialization
//! steps in the order a full astrometric solution needs them:
//!
//! 1. apply fix lists and validate the registry,
//! 2. require a fixed anchor in every field,
//! 3. replace exposure maps by the identity where polynomial maps are degenerate,
//! 4. bootstrap the defaulted maps group by group,
//! 5. rebuild the free-parameter vector.
//!
//! The caller then runs [`crate::align::align`] over its real matches.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::bootstrap::{bootstrap_defaulted, BootstrapConfig, BootstrapOutcome, BootstrapPoint};
use crate::degeneracy::{check_field_anchors, MapDegeneracies};
use crate::error::{FitError, Result};
use crate::registry::TransformRegistry;
use crate::transform::MapKind;

/// Kinds that can absorb each other's freedom inside one chain.
pub const POLY_KINDS: [MapKind; 3] = [MapKind::Poly, MapKind::Linear, MapKind::Constant];

/// One device of one exposure, as seen by the pipeline.
#[derive(Clone, Copy)]
pub struct PipelinePoint<'a> {
    /// Field the exposure belongs to.
    pub field: &'a str,
    /// Name of the exposure's own map, a candidate for identity substitution.
    pub exposure: &'a str,
    pub point: BootstrapPoint<'a>,
}

/// Options of [`initialize_defaulted`].
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Regexes of map or instrument names to hold fixed. Default empty.
    pub fix_patterns: Vec<String>,
    /// Device names of each instrument, for instrument-wide fix patterns.
    pub instruments: BTreeMap<String, Vec<String>>,
    pub bootstrap: BootstrapConfig,
}

/// What [`initialize_defaulted`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    /// Maps fixed by pattern.
    pub fixed: Vec<String>,
    /// Exposure maps replaced by the identity.
    pub replaced: Vec<String>,
    /// One outcome per bootstrap fit that ran.
    pub outcomes: Vec<BootstrapOutcome>,
}

/// Replace degenerate exposure maps by the identity. Returns the names replaced.
pub fn break_poly_degeneracies(
    registry: &mut TransformRegistry,
    points: &[PipelinePoint<'_>],
) -> Result<Vec<String>> {
    let names: Vec<&str> = points.iter().map(|p| p.point.map_name).collect();
    let mut candidates: Vec<&str> = points.iter().map(|p| p.exposure).collect();
    candidates.sort_unstable();
    candidates.dedup();

    let replaced = MapDegeneracies::new(registry, &names, &POLY_KINDS, false)?
        .replace_with_identity(&candidates)?;
    for name in &replaced {
        warn!("Exposure map <{}> is degenerate; replacing it with identity", name);
        registry.set_identity(name)?;
    }
    Ok(replaced.into_iter().collect())
}

/// Prepare `registry` for the final fit. See the module documentation for the
/// order of steps. Any error leaves the registry partially updated.
pub fn initialize_defaulted(
    registry: &mut TransformRegistry,
    points: &[PipelinePoint<'_>],
    config: &PipelineConfig,
) -> Result<InitReport> {
    let fixed = if config.fix_patterns.is_empty() {
        Vec::new()
    } else {
        registry.fix_matching(&config.fix_patterns, &config.instruments)?
    };
    registry.validate()?;

    let anchors: Vec<(&str, &str)> = points.iter().map(|p| (p.field, p.point.map_name)).collect();
    check_field_anchors(registry, &anchors)?;

    let replaced = break_poly_degeneracies(registry, points)?;

    let names: Vec<&str> = points.iter().map(|p| p.point.map_name).collect();
    let groups = MapDegeneracies::new(registry, &names, &POLY_KINDS, true)?.initialization_order()?;
    let bootstrap_points: Vec<BootstrapPoint<'_>> = points.iter().map(|p| p.point).collect();
    let outcomes = bootstrap_defaulted(registry, &groups, &bootstrap_points, &config.bootstrap)?;

    let mut left = Vec::new();
    for name in &names {
        for atom in registry.order_atoms(name)? {
            if registry.is_defaulted(&atom)? && !left.contains(&atom) {
                left.push(atom);
            }
        }
    }
    if !left.is_empty() {
        return Err(FitError::configuration(
            "maps are still defaulted after initialization",
            left,
        ));
    }

    registry.rebuild_parameter_vector();
    info!(
        "Initialized registry: {} maps fixed by pattern, {} replaced by identity, {} bootstrap fits, {} free parameters",
        fixed.len(),
        replaced.len(),
        outcomes.len(),
        registry.n_free_params()
    );
    Ok(InitReport {
        fixed,
        replaced,
        outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bounds;
    use crate::transform::{AtomicMap, MapShape};

    const IDENTITY: [f64; 6] = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    /// One shared device map and two exposures of one field.
    fn registry() -> TransformRegistry {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("cam/ccd", MapShape::Linear, None).unwrap();
        reg.learn_atomic("e1", MapShape::Constant, Some(&[0.0, 0.0])).unwrap();
        reg.learn_atomic("e2", MapShape::Constant, Some(&[0.0, 0.0])).unwrap();
        reg.learn_atomic("ref", MapShape::Linear, Some(&IDENTITY)).unwrap();
        for e in ["e1", "e2"] {
            reg.learn_composite(&format!("{e}/ccd"), vec!["cam/ccd".into(), e.into()])
                .unwrap();
        }
        reg
    }

    fn points<'a>(reference: &'a AtomicMap) -> Vec<PipelinePoint<'a>> {
        let bounds = Bounds::new(0.0, 100.0, 0.0, 100.0);
        ["e1/ccd", "e2/ccd", "ref"]
            .into_iter()
            .zip(["e1", "e2", "ref"])
            .map(|(map_name, exposure)| PipelinePoint {
                field: "f",
                exposure,
                point: BootstrapPoint {
                    map_name,
                    bounds,
                    reference,
                },
            })
            .collect()
    }

    #[test]
    fn test_unanchored_field_is_rejected() {
        let mut reg = registry();
        let reference = AtomicMap::with_params("wcs", MapShape::Linear, IDENTITY.to_vec()).unwrap();
        let pts = points(&reference);
        match initialize_defaulted(&mut reg, &pts, &PipelineConfig::default()) {
            Err(FitError::Configuration { names, .. }) => assert_eq!(names, vec!["f"]),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_initialize_breaks_degeneracy_and_bootstraps() {
        let mut reg = registry();
        let reference = AtomicMap::with_params(
            "wcs",
            MapShape::Linear,
            vec![0.1, 1e-4, 0.0, -0.2, 0.0, 1e-4],
        )
        .unwrap();
        let pts = points(&reference);
        let config = PipelineConfig {
            fix_patterns: vec!["ref".to_string()],
            bootstrap: BootstrapConfig {
                grid_points: 32,
                ..Default::default()
            },
            ..Default::default()
        };
        let report = initialize_defaulted(&mut reg, &pts, &config).unwrap();
        assert_eq!(report.fixed, vec!["ref"]);
        assert_eq!(report.replaced, vec!["e1"]);
        assert_eq!(reg.kind("e1").unwrap(), MapKind::Identity);
        assert!(!reg.is_defaulted("cam/ccd").unwrap());
        assert!(!reg.is_dirty());

        let ccd = reg.params_of("cam/ccd").unwrap();
        for (p, e) in ccd.iter().zip([0.1, 1e-4, 0.0, -0.2, 0.0, 1e-4]) {
            assert!((p - e).abs() < 1e-9, "{ccd:?}");
        }
    }
}
