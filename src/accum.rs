//! Streaming residual statistics.
//!
//! An [`Accum`] keeps running weighted sums of detection offsets without
//! storing the detections, and renders them as a one-line report in
//! milliarcseconds (world coordinates are taken to be degrees).

use crate::align::Detection;

/// Milliarcseconds per degree.
const MAS_PER_DEGREE: f64 = 3_600_000.0;

/// Column titles matching [`Accum::summary`].
pub const SUMMARY_HEADER: &str =
    "   N    DOF    dx   +-    dy   +-   RMS chisq  xpix  ypix        xw        yw";

/// Running first and second moments of residuals, per axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accum {
    sum_x: f64,
    sum_y: f64,
    sum_xw: f64,
    sum_yw: f64,
    sum_xxw: f64,
    sum_yyw: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_wx: f64,
    sum_wy: f64,
    sum_dof: f64,
    n: usize,
    /// Representative pixel and world location, for reports.
    pub xpix: f64,
    pub ypix: f64,
    pub xw: f64,
    pub yw: f64,
}

impl Accum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one detection's offset from `(xoff, yoff)` with `dof` degrees of
    /// freedom per axis. Weights are the diagonal of its inverse covariance.
    pub fn add(&mut self, detection: &Detection, xoff: f64, yoff: f64, dof: f64) {
        let dx = detection.world.0 - xoff;
        let dy = detection.world.1 - yoff;
        let wx = detection.inv_cov[(0, 0)];
        let wy = detection.inv_cov[(1, 1)];
        self.sum_x += dx;
        self.sum_y += dy;
        self.sum_xw += dx * wx;
        self.sum_yw += dy * wy;
        self.sum_xxw += dx * dx * wx;
        self.sum_yyw += dy * dy * wy;
        self.sum_xx += dx * dx;
        self.sum_yy += dy * dy;
        self.sum_wx += wx;
        self.sum_wy += wy;
        self.sum_dof += dof;
        self.n += 1;
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn dof(&self) -> f64 {
        self.sum_dof
    }

    /// Unweighted mean offset per axis.
    pub fn mean(&self) -> (f64, f64) {
        if self.n == 0 {
            return (0.0, 0.0);
        }
        (self.sum_x / self.n as f64, self.sum_y / self.n as f64)
    }

    /// Weighted mean offset per axis and its standard error.
    pub fn weighted_mean(&self) -> ((f64, f64), (f64, f64)) {
        if self.n == 0 || self.sum_wx <= 0.0 || self.sum_wy <= 0.0 {
            return ((0.0, 0.0), (0.0, 0.0));
        }
        (
            (self.sum_xw / self.sum_wx, self.sum_yw / self.sum_wy),
            (1.0 / self.sum_wx.sqrt(), 1.0 / self.sum_wy.sqrt()),
        )
    }

    /// RMS offset over both axes.
    pub fn rms(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        ((self.sum_xx + self.sum_yy) / (2.0 * self.n as f64)).sqrt()
    }

    /// Weighted sum of squares per degree of freedom; 0 with no dof.
    pub fn reduced_chisq(&self) -> f64 {
        if self.sum_dof <= 0.0 {
            return 0.0;
        }
        (self.sum_xxw + self.sum_yyw) / (2.0 * self.sum_dof)
    }

    /// Record a representative location for [`Accum::summary`].
    pub fn set_location(&mut self, xpix: f64, ypix: f64, xw: f64, yw: f64) {
        self.xpix = xpix;
        self.ypix = ypix;
        self.xw = xw;
        self.yw = yw;
    }

    /// Fixed-width report: count, dof, mean ± error per axis and rms (mas),
    /// reduced chi-square, then the representative location.
    pub fn summary(&self) -> String {
        let ((dx, dy), (sigx, sigy)) = self.weighted_mean();
        format!(
            "{:4} {:6.1} {:5.1} {:5.1} {:5.1} {:5.1} {:5.1} {:5.2} {:5.0} {:5.0} {:+9.5} {:+9.5}",
            self.n,
            self.sum_dof,
            dx * MAS_PER_DEGREE,
            sigx * MAS_PER_DEGREE,
            dy * MAS_PER_DEGREE,
            sigy * MAS_PER_DEGREE,
            self.rms() * MAS_PER_DEGREE,
            self.reduced_chisq(),
            self.xpix,
            self.ypix,
            self.xw,
            self.yw,
        )
    }

    /// Fold another accumulator's sums into this one. The location is kept.
    pub fn merge(&mut self, other: &Accum) {
        self.sum_x += other.sum_x;
        self.sum_y += other.sum_y;
        self.sum_xw += other.sum_xw;
        self.sum_yw += other.sum_yw;
        self.sum_xxw += other.sum_xxw;
        self.sum_yyw += other.sum_yyw;
        self.sum_xx += other.sum_xx;
        self.sum_yy += other.sum_yy;
        self.sum_wx += other.sum_wx;
        self.sum_wy += other.sum_wy;
        self.sum_dof += other.sum_dof;
        self.n += other.n;
    }
}
