//! Generation-scoped views of registry maps.

use nalgebra::{DVector, Matrix2};

use super::TransformRegistry;
use crate::error::{FitError, Result};
use crate::transform::{
    chain_derivs, chain_jacobian, chain_to_world, concat_blocks, AtomRef, MapShape, ParamDerivs,
    PixelMap,
};

/// One atomic member of an issued chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub name: String,
    pub shape: MapShape,
    /// Arena offset; equal to the free-vector index when `free`.
    pub offset: usize,
    pub count: usize,
    pub free: bool,
}

/// A map flattened to its atomic links, valid for one registry generation.
///
/// Holds indices only; evaluate it through [`MapView::bind`].
#[derive(Debug, Clone, PartialEq)]
pub struct MapView {
    name: String,
    generation: u64,
    links: Vec<Link>,
}

/// Derivatives of a map's world position with respect to one free atomic.
#[derive(Debug, Clone)]
pub struct FreeBlock {
    /// Free-vector index of the block's first parameter.
    pub offset: usize,
    pub derivs: ParamDerivs,
}

impl MapView {
    pub(super) fn new(name: String, generation: u64, links: Vec<Link>) -> Self {
        Self {
            name,
            generation,
            links,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// True if any link has free parameters.
    pub fn has_free(&self) -> bool {
        self.links.iter().any(|l| l.free)
    }

    /// Attach the view to the registry's live parameters.
    pub fn bind<'a>(&'a self, registry: &'a TransformRegistry) -> Result<BoundMap<'a>> {
        if registry.generation() != self.generation {
            return Err(FitError::StaleView {
                name: self.name.clone(),
                issued: self.generation,
                current: registry.generation(),
            });
        }
        let arena = registry.arena();
        let atoms = self
            .links
            .iter()
            .map(|l| AtomRef {
                name: &l.name,
                shape: &l.shape,
                params: &arena[l.offset..l.offset + l.count],
            })
            .collect();
        Ok(BoundMap { view: self, atoms })
    }
}

/// A [`MapView`] evaluated against live registry parameters.
#[derive(Debug, Clone)]
pub struct BoundMap<'a> {
    view: &'a MapView,
    atoms: Vec<AtomRef<'a>>,
}

impl BoundMap<'_> {
    /// World position plus one derivative block per free link.
    pub fn free_derivs(&self, x: f64, y: f64) -> ((f64, f64), Vec<FreeBlock>) {
        let (world, blocks) = chain_derivs(&self.atoms, x, y);
        let free = self
            .view
            .links
            .iter()
            .zip(blocks)
            .filter(|(l, _)| l.free)
            .map(|(l, derivs)| FreeBlock {
                offset: l.offset,
                derivs,
            })
            .collect();
        (world, free)
    }
}

impl PixelMap for BoundMap<'_> {
    fn name(&self) -> &str {
        &self.view.name
    }

    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        chain_to_world(&self.atoms, x, y)
    }

    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        chain_jacobian(&self.atoms, x, y)
    }

    fn n_params(&self) -> usize {
        self.atoms.iter().map(|a| a.params.len()).sum()
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_params(),
            self.atoms.iter().flat_map(|a| a.params.iter().copied()),
        )
    }

    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        let (world, blocks) = chain_derivs(&self.atoms, x, y);
        (world, concat_blocks(&blocks))
    }

    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        match self.atoms.as_slice() {
            [single] => single.to_pix(xw, yw),
            _ => crate::transform::invert_newton(self, xw, yw),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::TransformRegistry;
    use crate::transform::{MapShape, PixelMap};

    #[test]
    fn test_free_derivs_skip_fixed_links() {
        let mut reg = TransformRegistry::new();
        reg.learn_atomic("dev", MapShape::Linear, Some(&[0.0, 2.0, 0.0, 0.0, 0.0, 2.0]))
            .unwrap();
        reg.learn_atomic("expo", MapShape::Constant, Some(&[1.0, -1.0]))
            .unwrap();
        reg.learn_composite("chip", vec!["dev".into(), "expo".into()])
            .unwrap();
        reg.set_fixed(["dev"]).unwrap();
        reg.rebuild_parameter_vector();

        let view = reg.issue("chip").unwrap();
        assert!(view.has_free());
        let bound = view.bind(&reg).unwrap();
        let ((xw, yw), blocks) = bound.free_derivs(3.0, 4.0);
        assert!((xw - 7.0).abs() < 1e-12);
        assert!((yw - 7.0).abs() < 1e-12);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].derivs.ncols(), 2);
        assert_eq!(bound.n_params(), 8);

        let (x, y) = bound.to_pix(xw, yw).unwrap();
        assert!((x - 3.0).abs() < 1e-9);
        assert!((y - 4.0).abs() < 1e-9);
    }
}
