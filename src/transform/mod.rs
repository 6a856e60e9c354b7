//! Pixel-to-world coordinate transforms.
//!
//! The set of transform kinds is closed: [`MapShape`] enumerates the atomic
//! kinds (each owning a parameter vector) and [`Transform`] adds composites,
//! ordered chains of named atomics applied first to last. Every kind exposes
//! the same capability set through the [`PixelMap`] trait, which is also the
//! seam through which external reference transforms (see [`WcsMap`]) enter the
//! fitting code.
//!
//! # Supported kinds
//!
//! - `Identity` — no parameters.
//! - `Constant` — shift, 2 parameters.
//! - `Linear` — affine, 6 parameters (see [`linear`]).
//! - `Poly` — independent x/y polynomials (see [`polynomial`]).
//! - `Composite` — chain of other transforms, no own parameters.

pub mod linear;
pub mod polynomial;
pub mod wcs;

use std::fmt;

use nalgebra::{DVector, Matrix2, Matrix2xX, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

pub use polynomial::PolyOrder;
pub use wcs::{Gnomonic, SkyProjection, WcsMap};

/// Name under which every registry knows the identity map.
pub const IDENTITY_NAME: &str = "Identity";

/// Maximum Newton steps for numerical inversion.
const INVERSION_MAX_ITER: usize = 50;

/// Parameter derivatives of `(x_world, y_world)`: one column per parameter.
pub type ParamDerivs = Matrix2xX<f64>;

/// Kind tag of a transform, used for exhaustive dispatch and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapKind {
    Identity,
    Constant,
    Linear,
    Poly,
    Composite,
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MapKind::Identity => "Identity",
            MapKind::Constant => "Constant",
            MapKind::Linear => "Linear",
            MapKind::Poly => "Poly",
            MapKind::Composite => "Composite",
        };
        f.write_str(s)
    }
}

/// Functional form of an atomic transform, independent of its parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapShape {
    Identity,
    Constant,
    Linear,
    Poly(PolyOrder),
}

impl MapShape {
    pub fn kind(&self) -> MapKind {
        match self {
            MapShape::Identity => MapKind::Identity,
            MapShape::Constant => MapKind::Constant,
            MapShape::Linear => MapKind::Linear,
            MapShape::Poly(_) => MapKind::Poly,
        }
    }

    pub fn n_params(&self) -> usize {
        match self {
            MapShape::Identity => 0,
            MapShape::Constant => linear::CONSTANT_PARAMS,
            MapShape::Linear => linear::LINEAR_PARAMS,
            MapShape::Poly(order) => 2 * polynomial::num_coeffs(*order),
        }
    }

    /// Parameters that make this shape the identity (zero shift for `Constant`).
    pub fn identity_params(&self) -> Vec<f64> {
        match self {
            MapShape::Identity => Vec::new(),
            MapShape::Constant => vec![0.0; linear::CONSTANT_PARAMS],
            MapShape::Linear => linear::identity_params(),
            MapShape::Poly(order) => polynomial::identity_params(*order),
        }
    }
}

/// The capability set shared by every transform.
pub trait PixelMap {
    fn name(&self) -> &str;

    fn to_world(&self, x: f64, y: f64) -> (f64, f64);

    /// Jacobian `d(world)/d(pix)`.
    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64>;

    fn n_params(&self) -> usize;

    fn params(&self) -> DVector<f64>;

    /// World position and its derivatives with respect to every parameter.
    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs);

    /// Inverse map. The default implementation is Newton iteration.
    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        invert_newton(self, xw, yw)
    }
}

/// Solve `to_world(x, y) = (xw, yw)` by Newton iteration.
///
/// The starting point is the linearization of the map about the pixel origin.
pub fn invert_newton<M: PixelMap + ?Sized>(map: &M, xw: f64, yw: f64) -> Result<(f64, f64)> {
    let failure = || FitError::Inversion {
        name: map.name().to_string(),
        xw,
        yw,
    };

    let (w0x, w0y) = map.to_world(0.0, 0.0);
    let (mut x, mut y) = match map.d_world_d_pix(0.0, 0.0).try_inverse() {
        Some(inv) => {
            let d = inv * Vector2::new(xw - w0x, yw - w0y);
            (d.x, d.y)
        }
        None => (xw, yw),
    };

    let world_tol = 1e-13 * (1.0 + xw.abs().max(yw.abs()));
    for _ in 0..INVERSION_MAX_ITER {
        let (fx, fy) = map.to_world(x, y);
        let (rx, ry) = (xw - fx, yw - fy);
        if !rx.is_finite() || !ry.is_finite() {
            return Err(failure());
        }
        if rx.abs().max(ry.abs()) <= world_tol {
            return Ok((x, y));
        }
        let inv = map
            .d_world_d_pix(x, y)
            .try_inverse()
            .ok_or_else(failure)?;
        let step = inv * Vector2::new(rx, ry);
        x += step.x;
        y += step.y;
        if step.x.abs().max(step.y.abs()) <= 1e-12 * (1.0 + x.abs().max(y.abs())) {
            return Ok((x, y));
        }
    }
    Err(failure())
}

/// Borrowed view of one atomic transform: shape plus a parameter slice.
///
/// This is what both owned maps and registry-bound views evaluate through.
#[derive(Debug, Clone, Copy)]
pub struct AtomRef<'a> {
    pub name: &'a str,
    pub shape: &'a MapShape,
    pub params: &'a [f64],
}

impl PixelMap for AtomRef<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let p = self.params;
        match self.shape {
            MapShape::Identity => (x, y),
            MapShape::Constant => (x + p[0], y + p[1]),
            MapShape::Linear => linear::to_world(p, x, y),
            MapShape::Poly(order) => polynomial::eval(*order, p, x, y),
        }
    }

    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        match self.shape {
            MapShape::Identity | MapShape::Constant => Matrix2::identity(),
            MapShape::Linear => linear::jacobian(self.params),
            MapShape::Poly(order) => polynomial::jacobian(*order, self.params, x, y),
        }
    }

    fn n_params(&self) -> usize {
        self.shape.n_params()
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.params)
    }

    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        let world = self.to_world(x, y);
        let n = self.n_params();
        let mut d = ParamDerivs::zeros(n);
        match self.shape {
            MapShape::Identity => {}
            MapShape::Constant => {
                d[(0, 0)] = 1.0;
                d[(1, 1)] = 1.0;
            }
            MapShape::Linear => {
                let rows = linear::param_derivs(x, y);
                for (c, (&dx, &dy)) in rows[0].iter().zip(&rows[1]).enumerate() {
                    d[(0, c)] = dx;
                    d[(1, c)] = dy;
                }
            }
            MapShape::Poly(order) => {
                let terms = polynomial::term_values(*order, x, y);
                let nt = terms.len();
                for (k, t) in terms.into_iter().enumerate() {
                    d[(0, k)] = t;
                    d[(1, nt + k)] = t;
                }
            }
        }
        (world, d)
    }

    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        let p = self.params;
        match self.shape {
            MapShape::Identity => Ok((xw, yw)),
            MapShape::Constant => Ok((xw - p[0], yw - p[1])),
            MapShape::Linear => linear::to_pix(p, xw, yw).ok_or_else(|| FitError::Inversion {
                name: self.name.to_string(),
                xw,
                yw,
            }),
            MapShape::Poly(_) => invert_newton(self, xw, yw),
        }
    }
}

// ── Chain evaluation ────────────────────────────────────────────────────────

pub(crate) fn chain_to_world(atoms: &[AtomRef<'_>], x: f64, y: f64) -> (f64, f64) {
    atoms
        .iter()
        .fold((x, y), |(x, y), atom| atom.to_world(x, y))
}

pub(crate) fn chain_jacobian(atoms: &[AtomRef<'_>], x: f64, y: f64) -> Matrix2<f64> {
    let mut j = Matrix2::identity();
    let (mut cx, mut cy) = (x, y);
    for atom in atoms {
        j = atom.d_world_d_pix(cx, cy) * j;
        (cx, cy) = atom.to_world(cx, cy);
    }
    j
}

/// World position of a chain plus one derivative block per atom.
///
/// The block for atom `k` is `J_m ⋯ J_{k+1} · D_k`, with each Jacobian and
/// parameter derivative evaluated at that atom's own input.
pub(crate) fn chain_derivs(atoms: &[AtomRef<'_>], x: f64, y: f64) -> ((f64, f64), Vec<ParamDerivs>) {
    let mut locals = Vec::with_capacity(atoms.len());
    let (mut cx, mut cy) = (x, y);
    for atom in atoms {
        let jac = atom.d_world_d_pix(cx, cy);
        let (world, d) = atom.to_world_derivs(cx, cy);
        locals.push((jac, d));
        (cx, cy) = world;
    }

    let mut blocks = vec![ParamDerivs::zeros(0); atoms.len()];
    let mut downstream = Matrix2::<f64>::identity();
    for (k, (jac, d)) in locals.into_iter().enumerate().rev() {
        blocks[k] = downstream * d;
        downstream *= jac;
    }
    ((cx, cy), blocks)
}

/// Concatenate per-atom derivative blocks in chain order.
pub(crate) fn concat_blocks(blocks: &[ParamDerivs]) -> ParamDerivs {
    let n = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = ParamDerivs::zeros(n);
    let mut offset = 0;
    for b in blocks {
        out.columns_mut(offset, b.ncols()).copy_from(b);
        offset += b.ncols();
    }
    out
}

// ── Owned transforms ────────────────────────────────────────────────────────

/// An owned atomic transform with its flags.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicMap {
    name: String,
    shape: MapShape,
    params: Vec<f64>,
    /// Excluded from the free parameter vector.
    pub fixed: bool,
    /// Parameters not yet meaningfully set.
    pub defaulted: bool,
}

impl AtomicMap {
    /// A map of the given shape initialized to the identity.
    pub fn new(name: impl Into<String>, shape: MapShape) -> Self {
        Self {
            name: name.into(),
            params: shape.identity_params(),
            shape,
            fixed: false,
            defaulted: false,
        }
    }

    /// A map initialized to the identity and flagged as needing initialization.
    pub fn defaulted(name: impl Into<String>, shape: MapShape) -> Self {
        let mut map = Self::new(name, shape);
        map.defaulted = shape.n_params() > 0;
        map
    }

    pub fn identity(name: impl Into<String>) -> Self {
        Self::new(name, MapShape::Identity)
    }

    pub fn with_params(name: impl Into<String>, shape: MapShape, params: Vec<f64>) -> Result<Self> {
        let name = name.into();
        if params.len() != shape.n_params() {
            return Err(FitError::ParameterCount {
                name,
                expected: shape.n_params(),
                got: params.len(),
            });
        }
        Ok(Self {
            name,
            shape,
            params,
            fixed: false,
            defaulted: false,
        })
    }

    pub fn shape(&self) -> &MapShape {
        &self.shape
    }

    pub fn param_slice(&self) -> &[f64] {
        &self.params
    }

    pub fn set_params(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(FitError::ParameterCount {
                name: self.name.clone(),
                expected: self.params.len(),
                got: params.len(),
            });
        }
        self.params.copy_from_slice(params);
        Ok(())
    }

    pub fn atom_ref(&self) -> AtomRef<'_> {
        AtomRef {
            name: &self.name,
            shape: &self.shape,
            params: &self.params,
        }
    }
}

impl PixelMap for AtomicMap {
    fn name(&self) -> &str {
        &self.name
    }
    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        self.atom_ref().to_world(x, y)
    }
    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        self.atom_ref().d_world_d_pix(x, y)
    }
    fn n_params(&self) -> usize {
        self.params.len()
    }
    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.params)
    }
    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        self.atom_ref().to_world_derivs(x, y)
    }
    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        self.atom_ref().to_pix(xw, yw)
    }
}

/// An owned chain of transforms, applied first to last.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeMap {
    name: String,
    elements: Vec<Transform>,
}

impl CompositeMap {
    pub fn new(name: impl Into<String>, elements: Vec<Transform>) -> Self {
        Self {
            name: name.into(),
            elements,
        }
    }

    pub fn elements(&self) -> &[Transform] {
        &self.elements
    }

    fn atom_refs(&self) -> Vec<AtomRef<'_>> {
        let mut out = Vec::new();
        for e in &self.elements {
            e.collect_atoms(&mut out);
        }
        out
    }
}

impl PixelMap for CompositeMap {
    fn name(&self) -> &str {
        &self.name
    }
    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        chain_to_world(&self.atom_refs(), x, y)
    }
    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        chain_jacobian(&self.atom_refs(), x, y)
    }
    fn n_params(&self) -> usize {
        self.atom_refs().iter().map(|a| a.params.len()).sum()
    }
    fn params(&self) -> DVector<f64> {
        let all: Vec<f64> = self
            .atom_refs()
            .iter()
            .flat_map(|a| a.params.iter().copied())
            .collect();
        DVector::from_vec(all)
    }
    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        let (world, blocks) = chain_derivs(&self.atom_refs(), x, y);
        (world, concat_blocks(&blocks))
    }
}

/// An owned transform: a single atomic map or a named chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Atomic(AtomicMap),
    Composite(CompositeMap),
}

impl Transform {
    pub fn kind(&self) -> MapKind {
        match self {
            Transform::Atomic(a) => a.shape.kind(),
            Transform::Composite(_) => MapKind::Composite,
        }
    }

    /// Every atomic map in application order (nested chains flattened).
    pub fn atoms(&self) -> Vec<&AtomicMap> {
        match self {
            Transform::Atomic(a) => vec![a],
            Transform::Composite(c) => c.elements.iter().flat_map(|e| e.atoms()).collect(),
        }
    }

    /// Find a constituent atomic map by name.
    pub fn atom(&self, name: &str) -> Option<&AtomicMap> {
        self.atoms().into_iter().find(|a| a.name == name)
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<AtomRef<'a>>) {
        match self {
            Transform::Atomic(a) => out.push(a.atom_ref()),
            Transform::Composite(c) => {
                for e in &c.elements {
                    e.collect_atoms(out);
                }
            }
        }
    }

    fn atoms_mut(&mut self) -> Vec<&mut AtomicMap> {
        match self {
            Transform::Atomic(a) => vec![a],
            Transform::Composite(c) => c.elements.iter_mut().flat_map(|e| e.atoms_mut()).collect(),
        }
    }

    /// Set all parameters; a composite splits the vector across its atoms in
    /// chain order.
    pub fn set_params(&mut self, params: &[f64]) -> Result<()> {
        let expected = self.n_params();
        if params.len() != expected {
            return Err(FitError::ParameterCount {
                name: self.name().to_string(),
                expected,
                got: params.len(),
            });
        }
        let mut offset = 0;
        for atom in self.atoms_mut() {
            let n = atom.params.len();
            atom.set_params(&params[offset..offset + n])?;
            offset += n;
        }
        Ok(())
    }
}

impl From<AtomicMap> for Transform {
    fn from(a: AtomicMap) -> Self {
        Transform::Atomic(a)
    }
}

impl From<CompositeMap> for Transform {
    fn from(c: CompositeMap) -> Self {
        Transform::Composite(c)
    }
}

impl PixelMap for Transform {
    fn name(&self) -> &str {
        match self {
            Transform::Atomic(a) => a.name(),
            Transform::Composite(c) => c.name(),
        }
    }
    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Transform::Atomic(a) => a.to_world(x, y),
            Transform::Composite(c) => c.to_world(x, y),
        }
    }
    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        match self {
            Transform::Atomic(a) => a.d_world_d_pix(x, y),
            Transform::Composite(c) => c.d_world_d_pix(x, y),
        }
    }
    fn n_params(&self) -> usize {
        match self {
            Transform::Atomic(a) => a.n_params(),
            Transform::Composite(c) => c.n_params(),
        }
    }
    fn params(&self) -> DVector<f64> {
        match self {
            Transform::Atomic(a) => a.params(),
            Transform::Composite(c) => c.params(),
        }
    }
    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        match self {
            Transform::Atomic(a) => a.to_world_derivs(x, y),
            Transform::Composite(c) => c.to_world_derivs(x, y),
        }
    }
    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        match self {
            Transform::Atomic(a) => a.to_pix(xw, yw),
            Transform::Composite(c) => c.to_pix(xw, yw),
        }
    }
}
