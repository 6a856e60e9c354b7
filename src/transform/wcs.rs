//! World coordinate systems: a pixel map anchored to the sky by a projection.
//!
//! A [`WcsMap`] maps pixels through its inner [`PixelMap`] into projection-plane
//! coordinates (scaled by `world_scale`, radians per world unit), and from there
//! onto the celestial sphere through a [`SkyProjection`]. It can be reprojected
//! into a different projection so that its world coordinates agree with, e.g.,
//! the tangent plane of a field; that is how a starting WCS serves as the
//! reference transform for bootstrap initialization.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DVector, Matrix2};

use super::{ParamDerivs, PixelMap};
use crate::error::{FitError, Result};

/// Radians per degree: the default world unit.
pub const DEGREE: f64 = std::f64::consts::PI / 180.0;

/// Maps between sky coordinates `(lon, lat)` and a projection plane, both in radians.
pub trait SkyProjection: fmt::Debug + Send + Sync {
    /// Returns `None` if the point cannot be projected.
    fn project(&self, lon: f64, lat: f64) -> Option<(f64, f64)>;
    fn deproject(&self, x: f64, y: f64) -> (f64, f64);
}

/// Gnomonic (TAN) projection about a reference point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gnomonic {
    pub ra: f64,
    pub dec: f64,
}

impl Gnomonic {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }
}

impl SkyProjection for Gnomonic {
    fn project(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        tan_project(lon, lat, self.ra, self.dec)
    }

    fn deproject(&self, x: f64, y: f64) -> (f64, f64) {
        inverse_tan_project(x, y, self.ra, self.dec)
    }
}

/// Forward gnomonic (TAN) projection.
///
/// Projects celestial point `(ra, dec)` onto the tangent plane at `(crval_ra, crval_dec)`.
/// Returns `(ξ, η)` in radians, or `None` if the point is on or behind the tangent plane.
///
/// Reference: Calabretta & Greisen (2002), FITS WCS Paper II, §5.1.1.
#[inline]
pub fn tan_project(ra: f64, dec: f64, crval_ra: f64, crval_dec: f64) -> Option<(f64, f64)> {
    let da = ra - crval_ra;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }

    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

/// Inverse gnomonic (TAN) projection.
#[inline]
pub fn inverse_tan_project(xi: f64, eta: f64, crval_ra: f64, crval_dec: f64) -> (f64, f64) {
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let rho_sq = xi * xi + eta * eta;
    if rho_sq < 1e-30 {
        return (crval_ra, crval_dec);
    }

    let rho = rho_sq.sqrt();
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
    let ra = crval_ra + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

/// A pixel map plus the sky projection its world coordinates live in.
#[derive(Debug, Clone)]
pub struct WcsMap<M> {
    name: String,
    map: M,
    native: Arc<dyn SkyProjection>,
    target: Option<Arc<dyn SkyProjection>>,
    world_scale: f64,
}

impl<M: PixelMap> WcsMap<M> {
    /// World coordinates of `map` are interpreted in degrees.
    pub fn new(name: impl Into<String>, map: M, native: Arc<dyn SkyProjection>) -> Self {
        Self::with_scale(name, map, native, DEGREE)
    }

    pub fn with_scale(
        name: impl Into<String>,
        map: M,
        native: Arc<dyn SkyProjection>,
        world_scale: f64,
    ) -> Self {
        Self {
            name: name.into(),
            map,
            native,
            target: None,
            world_scale,
        }
    }

    pub fn inner(&self) -> &M {
        &self.map
    }

    /// Sky position `(ra, dec)` in radians of a pixel.
    pub fn to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let (u, v) = self.map.to_world(x, y);
        self.native
            .deproject(u * self.world_scale, v * self.world_scale)
    }

    /// Pixel position of a sky position.
    pub fn from_sky(&self, ra: f64, dec: f64) -> Result<(f64, f64)> {
        let (u, v) = self.native.project(ra, dec).ok_or_else(|| FitError::Inversion {
            name: self.name.clone(),
            xw: ra,
            yw: dec,
        })?;
        self.map.to_pix(u / self.world_scale, v / self.world_scale)
    }

    /// Report world coordinates in `target` rather than the native projection.
    pub fn reproject_to(&mut self, target: Arc<dyn SkyProjection>) {
        self.target = Some(target);
    }

    pub fn use_native_projection(&mut self) {
        self.target = None;
    }

    /// Native world → target world, NaN if the target cannot project the point.
    fn reproject(&self, target: &dyn SkyProjection, u: f64, v: f64) -> (f64, f64) {
        let (ra, dec) = self
            .native
            .deproject(u * self.world_scale, v * self.world_scale);
        match target.project(ra, dec) {
            Some((a, b)) => (a / self.world_scale, b / self.world_scale),
            None => (f64::NAN, f64::NAN),
        }
    }

    /// Jacobian of the native → target reprojection by central differences.
    fn reprojection_jacobian(&self, target: &dyn SkyProjection, u: f64, v: f64) -> Matrix2<f64> {
        let hu = 1e-7 * (1.0 + u.abs());
        let hv = 1e-7 * (1.0 + v.abs());
        let (a1, b1) = self.reproject(target, u + hu, v);
        let (a0, b0) = self.reproject(target, u - hu, v);
        let (c1, d1) = self.reproject(target, u, v + hv);
        let (c0, d0) = self.reproject(target, u, v - hv);
        Matrix2::new(
            (a1 - a0) / (2.0 * hu),
            (c1 - c0) / (2.0 * hv),
            (b1 - b0) / (2.0 * hu),
            (d1 - d0) / (2.0 * hv),
        )
    }
}

impl<M: PixelMap> PixelMap for WcsMap<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let (u, v) = self.map.to_world(x, y);
        match &self.target {
            Some(t) => self.reproject(t.as_ref(), u, v),
            None => (u, v),
        }
    }

    fn d_world_d_pix(&self, x: f64, y: f64) -> Matrix2<f64> {
        let j = self.map.d_world_d_pix(x, y);
        match &self.target {
            Some(t) => {
                let (u, v) = self.map.to_world(x, y);
                self.reprojection_jacobian(t.as_ref(), u, v) * j
            }
            None => j,
        }
    }

    fn n_params(&self) -> usize {
        self.map.n_params()
    }

    fn params(&self) -> DVector<f64> {
        self.map.params()
    }

    fn to_world_derivs(&self, x: f64, y: f64) -> ((f64, f64), ParamDerivs) {
        let ((u, v), d) = self.map.to_world_derivs(x, y);
        match &self.target {
            Some(t) => {
                let jr = self.reprojection_jacobian(t.as_ref(), u, v);
                (self.reproject(t.as_ref(), u, v), jr * d)
            }
            None => ((u, v), d),
        }
    }

    fn to_pix(&self, xw: f64, yw: f64) -> Result<(f64, f64)> {
        let Some(target) = &self.target else {
            return self.map.to_pix(xw, yw);
        };
        let (ra, dec) = target.deproject(xw * self.world_scale, yw * self.world_scale);
        self.from_sky(ra, dec)
    }
}
