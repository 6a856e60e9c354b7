//! # wcsfit
//!
//! Simultaneous astrometric fitting of **shared, composable pixel-to-sky
//! transforms**.
//!
//! A mosaic camera observed over many exposures is described by named pieces:
//! a polynomial per device, a linear or constant correction per exposure, and
//! a projection onto the sky per field. Every detection sees the world through
//! a chain of these pieces, and one piece appears in many chains. `wcsfit`
//! keeps all pieces in one registry with a single free-parameter vector, and
//! fits every parameter at once against cross-matched detections.
//!
//! ## Features
//!
//! - **Transform registry** — named atomic maps (identity, constant, linear,
//!   polynomial) and composite chains, with fixed/defaulted flags, YAML
//!   serialization, and regex fix lists
//! - **Degeneracy analysis** — detects free maps that only ever appear together
//!   and finds a safe order in which to initialize defaulted maps
//! - **Bootstrap** — seeds defaulted maps from synthetic matches generated
//!   through a trusted reference transform
//! - **Robust fitting** — Gauss-Newton with the per-match consensus profiled
//!   out, parallel normal-equation assembly, and two-stage sigma clipping
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wcsfit::{align, AlignConfig, Detection, MapShape, Match, TransformRegistry};
//!
//! let mut registry = TransformRegistry::new();
//! registry.learn_identity()?;
//! registry.learn_atomic("cam/ccd1", MapShape::Linear, Some(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]))?;
//! registry.rebuild_parameter_vector();
//!
//! let reference = Arc::new(registry.issue("Identity")?);
//! let device = Arc::new(registry.issue("cam/ccd1")?);
//! let mut matches = vec![Match::new(vec![
//!     Detection::new((0.10, 0.20), (1.0e8, 1.0e8), reference.clone()),
//!     Detection::new((1024.0, 512.0), (1.0e8, 1.0e8), device.clone()),
//! ])];
//!
//! let stats = align(&mut registry, &mut matches, &AlignConfig::default())?;
//! println!("chisq {:.2} over {} dof", stats.chisq, stats.dof);
//! # Ok::<(), wcsfit::FitError>(())
//! ```
//!
//! ## Workflow
//!
//! 1. **Configure** — read a registry from YAML, apply fix lists, validate
//! 2. **Break degeneracies** — replace exposure maps by the identity where
//!    polynomial maps cannot be separated
//! 3. **Initialize** — bootstrap defaulted maps group by group
//!    ([`pipeline::initialize_defaulted`])
//! 4. **Fit** — [`align`] over the real matches, with clipping
//! 5. **Report** — [`FitStatistics`] and [`Accum`] summaries
//!

pub mod accum;
pub mod align;
pub mod bootstrap;
pub mod degeneracy;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod transform;

pub use accum::{Accum, SUMMARY_HEADER};
pub use align::{
    align, reserve_matches, AlignConfig, CoordAlign, Detection, FitStatistics, FitStatus, Match,
};
pub use bootstrap::{
    bootstrap_defaulted, fit_defaulted, BootstrapConfig, BootstrapOutcome, BootstrapPoint, Bounds,
};
pub use degeneracy::{check_field_anchors, MapDegeneracies};
pub use error::{FitError, Result};
pub use pipeline::{initialize_defaulted, InitReport, PipelineConfig, PipelinePoint};
pub use registry::{MapView, TransformRegistry};
pub use transform::{
    AtomicMap, CompositeMap, Gnomonic, MapKind, MapShape, PixelMap, PolyOrder, SkyProjection,
    Transform, WcsMap,
};
