//! Structural degeneracies among free maps.
//!
//! Each point sees the world through a chain of atomic maps. If two free maps
//! occur together in every point that constrains them, only their composition
//! is determined by the data. The analysis here is peeling on the bipartite
//! graph of points and target atomics: an atomic is determined when it is the
//! only undetermined target left in some point, and determined atomics are
//! removed from every point until nothing changes.
//!
//! - [`MapDegeneracies::initialization_order`] turns the peeling rounds into
//!   groups of points that can be bootstrapped one after another.
//! - [`MapDegeneracies::replace_with_identity`] picks candidate maps to force
//!   to the identity whenever peeling stalls.
//! - [`check_field_anchors`] catches fields whose data are all free, which
//!   leaves a shift of the whole field undetermined.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{FitError, Result};
use crate::registry::TransformRegistry;
use crate::transform::MapKind;

/// Point/atomic incidence for a set of points.
#[derive(Debug, Clone)]
pub struct MapDegeneracies {
    /// Map name of each point, for diagnostics.
    point_maps: Vec<String>,
    /// Target atomics in each point's chain.
    targets: Vec<BTreeSet<String>>,
}

impl MapDegeneracies {
    /// Collect, for each point's map, the free atomics of the given kinds
    /// (restricted to defaulted ones when `defaulted_only`).
    pub fn new<S: AsRef<str>>(
        registry: &TransformRegistry,
        points: &[S],
        kinds: &[MapKind],
        defaulted_only: bool,
    ) -> Result<Self> {
        let mut point_maps = Vec::with_capacity(points.len());
        let mut targets = Vec::with_capacity(points.len());
        for p in points {
            let name = p.as_ref();
            let mut set = BTreeSet::new();
            for atom in registry.order_atoms(name)? {
                if registry.is_fixed(&atom)? || !kinds.contains(&registry.kind(&atom)?) {
                    continue;
                }
                if defaulted_only && !registry.is_defaulted(&atom)? {
                    continue;
                }
                set.insert(atom);
            }
            point_maps.push(name.to_string());
            targets.push(set);
        }
        Ok(Self {
            point_maps,
            targets,
        })
    }

    /// Target atomics of point `i`.
    pub fn targets(&self, i: usize) -> &BTreeSet<String> {
        &self.targets[i]
    }

    fn degeneracy(&self, remaining: &[BTreeSet<String>]) -> FitError {
        let stuck: Vec<usize> = (0..remaining.len())
            .filter(|&i| remaining[i].len() >= 2)
            .collect();
        let atoms: BTreeSet<String> = stuck
            .iter()
            .flat_map(|&i| remaining[i].iter().cloned())
            .collect();
        FitError::Degeneracy {
            atoms: atoms.into_iter().collect(),
            points: stuck
                .iter()
                .map(|&i| format!("#{} <{}>", i, self.point_maps[i]))
                .collect(),
        }
    }

    /// Groups of point indices in an order in which they can be initialized.
    ///
    /// Every peeling round yields one group per newly determined atomic,
    /// holding the points whose only remaining target it is. Groups within a
    /// round are ordered by size, then atomic name. Points without targets
    /// never appear.
    pub fn initialization_order(&self) -> Result<Vec<Vec<usize>>> {
        let mut remaining = self.targets.clone();
        let mut groups = Vec::new();
        loop {
            if remaining.iter().all(|r| r.is_empty()) {
                break;
            }
            let mut by_atom: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, r) in remaining.iter().enumerate() {
                if r.len() == 1 {
                    if let Some(atom) = r.iter().next() {
                        by_atom.entry(atom.clone()).or_default().push(i);
                    }
                }
            }
            if by_atom.is_empty() {
                return Err(self.degeneracy(&remaining));
            }

            let mut round: Vec<(String, Vec<usize>)> = by_atom.into_iter().collect();
            round.sort_by(|a, b| (a.1.len(), &a.0).cmp(&(b.1.len(), &b.0)));
            for (atom, group) in round {
                debug!("Initialization group for <{}>: {} points", atom, group.len());
                for r in remaining.iter_mut() {
                    r.remove(&atom);
                }
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Names among `candidates` that must be replaced by the identity so that
    /// every target atomic becomes determined. Never mutates the registry.
    pub fn replace_with_identity<S: AsRef<str>>(&self, candidates: &[S]) -> Result<BTreeSet<String>> {
        let candidates: BTreeSet<&str> = candidates.iter().map(|c| c.as_ref()).collect();
        let mut remaining = self.targets.clone();
        let mut replaced = BTreeSet::new();
        loop {
            peel(&mut remaining);
            if remaining.iter().all(|r| r.len() < 2) {
                return Ok(replaced);
            }

            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for r in remaining.iter().filter(|r| r.len() >= 2) {
                for atom in r {
                    if candidates.contains(atom.as_str()) {
                        *counts.entry(atom.as_str()).or_default() += 1;
                    }
                }
            }
            // Most stuck points first; BTreeMap order breaks ties by name.
            let mut best: Option<(&str, usize)> = None;
            for (&name, &n) in &counts {
                if best.map_or(true, |(_, m)| n > m) {
                    best = Some((name, n));
                }
            }
            let Some((choice, _)) = best else {
                return Err(self.degeneracy(&remaining));
            };
            let choice = choice.to_string();
            debug!("Replacing <{}> with identity", choice);
            for r in remaining.iter_mut() {
                r.remove(&choice);
            }
            replaced.insert(choice);
        }
    }
}

/// Remove atomics that are the sole target of some point until nothing changes.
fn peel(remaining: &mut [BTreeSet<String>]) {
    loop {
        let determined: BTreeSet<String> = remaining
            .iter()
            .filter(|r| r.len() == 1)
            .flat_map(|r| r.iter().cloned())
            .collect();
        if determined.is_empty() {
            return;
        }
        for r in remaining.iter_mut() {
            r.retain(|a| !determined.contains(a));
        }
    }
}

/// Every field with a free map must also contain a fully fixed map.
///
/// `points` pairs a field name with the map of one point in that field.
pub fn check_field_anchors<F: AsRef<str>, M: AsRef<str>>(
    registry: &TransformRegistry,
    points: &[(F, M)],
) -> Result<()> {
    let mut fields: BTreeMap<&str, (bool, bool)> = BTreeMap::new();
    for (field, map) in points {
        let fixed = registry.is_fixed(map.as_ref())?;
        let entry = fields.entry(field.as_ref()).or_default();
        if fixed {
            entry.1 = true;
        } else {
            entry.0 = true;
        }
    }
    let unanchored: Vec<String> = fields
        .into_iter()
        .filter(|(_, (free, fixed))| *free && !*fixed)
        .map(|(f, _)| f.to_string())
        .collect();
    if unanchored.is_empty() {
        Ok(())
    } else {
        Err(FitError::configuration(
            "no data in these fields have fixed maps to break the shift degeneracy",
            unanchored,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::MapShape;

    const POLY_KINDS: [MapKind; 3] = [MapKind::Poly, MapKind::Linear, MapKind::Constant];

    #[test]
    fn test_order_solves_single_map_point_first() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("A", MapShape::Linear, None).unwrap();
        reg.learn_atomic("B", MapShape::Linear, None).unwrap();
        reg.learn_composite("P1", vec!["A".into(), "B".into()]).unwrap();
        reg.learn_composite("P2", vec!["A".into()]).unwrap();
        reg.rebuild_parameter_vector();

        let degen = MapDegeneracies::new(&reg, &["P1", "P2"], &POLY_KINDS, true).unwrap();
        let order = degen.initialization_order().unwrap();
        assert_eq!(order, vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_order_groups_by_size_then_name() {
        let mut reg = TransformRegistry::new();
        for name in ["D1", "D2", "E"] {
            reg.learn_atomic(name, MapShape::Linear, None).unwrap();
        }
        reg.learn_atomic("Fixed", MapShape::Linear, Some(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]))
            .unwrap();
        reg.set_fixed(["Fixed"]).unwrap();
        reg.learn_composite("D1+E", vec!["D1".into(), "E".into()])
            .unwrap();
        reg.rebuild_parameter_vector();
        // D2 alone in two points, D1 alone in one point, E only alongside D1.
        let points = ["D2", "D1", "D2", "Fixed", "D1+E"];
        let degen = MapDegeneracies::new(&reg, &points, &POLY_KINDS, true).unwrap();
        assert!(degen.targets(3).is_empty());
        let order = degen.initialization_order().unwrap();
        assert_eq!(order, vec![vec![1], vec![0, 2], vec![4]]);
    }

    #[test]
    fn test_stalled_order_is_degenerate() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("A", MapShape::Poly(crate::transform::PolyOrder::Total(2)), None)
            .unwrap();
        reg.learn_atomic("B", MapShape::Linear, None).unwrap();
        reg.learn_composite("AB", vec!["A".into(), "B".into()]).unwrap();
        reg.learn_composite("BA", vec!["B".into(), "A".into()]).unwrap();
        let degen = MapDegeneracies::new(&reg, &["AB", "BA"], &POLY_KINDS, true).unwrap();
        match degen.initialization_order().unwrap_err() {
            FitError::Degeneracy { atoms, points } => {
                assert_eq!(atoms, vec!["A", "B"]);
                assert_eq!(points.len(), 2);
            }
            e => panic!("unexpected error {e}"),
        }
    }

    /// Device maps shared by exposures, with no exposure map fixed.
    fn exposure_registry(fix_first_exposure: bool) -> (TransformRegistry, Vec<String>) {
        let identity = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("inst/d1", MapShape::Linear, Some(&identity)).unwrap();
        reg.learn_atomic("inst/d2", MapShape::Linear, Some(&identity)).unwrap();
        let mut points = Vec::new();
        for e in ["e1", "e2", "e3"] {
            reg.learn_atomic(e, MapShape::Linear, Some(&identity)).unwrap();
            for d in ["d1", "d2"] {
                let name = format!("{e}/{d}");
                reg.learn_composite(&name, vec![format!("inst/{d}"), e.to_string()])
                    .unwrap();
                points.push(name);
            }
        }
        if fix_first_exposure {
            reg.set_fixed(["e1"]).unwrap();
        }
        reg.rebuild_parameter_vector();
        (reg, points)
    }

    #[test]
    fn test_break_mode_replaces_one_exposure() {
        let (reg, points) = exposure_registry(false);
        let degen = MapDegeneracies::new(&reg, &points, &POLY_KINDS, false).unwrap();
        let replaced = degen.replace_with_identity(&["e1", "e2", "e3"]).unwrap();
        assert_eq!(replaced.into_iter().collect::<Vec<_>>(), vec!["e1"]);
    }

    #[test]
    fn test_break_mode_with_fixed_exposure() {
        let (reg, points) = exposure_registry(true);
        let degen = MapDegeneracies::new(&reg, &points, &POLY_KINDS, false).unwrap();
        assert!(degen.replace_with_identity(&["e1", "e2", "e3"]).unwrap().is_empty());
    }

    #[test]
    fn test_break_mode_without_candidates() {
        let (reg, points) = exposure_registry(false);
        let degen = MapDegeneracies::new(&reg, &points, &POLY_KINDS, false).unwrap();
        let none: [&str; 0] = [];
        assert!(matches!(
            degen.replace_with_identity(&none),
            Err(FitError::Degeneracy { .. })
        ));
    }

    #[test]
    fn test_field_anchors() {
        let (reg, _) = exposure_registry(true);
        check_field_anchors(&reg, &[("f1", "e1"), ("f1", "e2/d1")]).unwrap();
        match check_field_anchors(&reg, &[("f1", "e1"), ("f2", "e2/d1"), ("f2", "e3/d2")]) {
            Err(FitError::Configuration { names, .. }) => assert_eq!(names, vec!["f2"]),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
