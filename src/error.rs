//! Error taxonomy shared by the registry, the analyzer, and the fitting engine.
//!
//! Every variant carries the offending name(s) so that a failure deep inside a
//! fit can be traced back to a transform, a point, or a parameter block.

use thiserror::Error;

/// Errors raised while configuring or fitting transforms.
#[derive(Debug, Error)]
pub enum FitError {
    /// A name was registered twice with a different structure.
    #[error("transform <{0}> is already defined with a different structure")]
    DuplicateName(String),

    /// A transform name is not known to the registry.
    #[error("transform <{0}> not found")]
    NotFound(String),

    /// The transform configuration cannot be fitted (fixed and defaulted maps,
    /// dangling chain references, fields without a fixed anchor, ...).
    #[error("configuration error: {message} [{}]", names.join(", "))]
    Configuration { message: String, names: Vec<String> },

    /// No safe initialization order exists for a set of free transforms.
    #[error("degenerate transforms {} in points {}", atoms.join(", "), points.join(", "))]
    Degeneracy {
        atoms: Vec<String>,
        points: Vec<String>,
    },

    /// The normal equations could not be solved.
    #[error("singular normal equations in parameter block <{block}> (parameter {index})")]
    SingularSystem { block: String, index: usize },

    /// The engine hit its iteration cap in strict mode.
    #[error("no convergence after {iterations} iterations (chisq {chisq:.6e})")]
    ConvergenceNotReached { iterations: usize, chisq: f64 },

    /// Parameters were addressed by offset before the vector was rebuilt.
    #[error("parameter layout is stale; rebuild_parameter_vector() must be called first")]
    LayoutStale,

    /// An issued view outlived a structural change of its registry.
    #[error("view of <{name}> was issued at generation {issued}, registry is at {current}")]
    StaleView {
        name: String,
        issued: u64,
        current: u64,
    },

    /// A parameter vector of the wrong length was supplied.
    #[error("transform <{name}> expects {expected} parameters, got {got}")]
    ParameterCount {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Numerical inversion of a transform failed.
    #[error("inverse of <{name}> did not converge at world ({xw}, {yw})")]
    Inversion { name: String, xw: f64, yw: f64 },

    /// The textual transform specification could not be parsed or written.
    #[error("transform specification: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A fix-list pattern is not a valid regular expression.
    #[error("invalid map pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<serde_yml::Error> for FitError {
    fn from(e: serde_yml::Error) -> Self {
        FitError::Serialization(e.to_string())
    }
}

impl FitError {
    pub(crate) fn configuration(message: impl Into<String>, names: Vec<String>) -> Self {
        FitError::Configuration {
            message: message.into(),
            names,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FitError>;
