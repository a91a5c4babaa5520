// Exploratory factor analysis (EFA)

#![doc = include_str!("../README.md")]

pub mod adequacy;
pub mod analysis;
pub mod constants;
pub mod corr;
pub mod error;
pub mod extract;
pub mod post;
pub mod rotate;
pub mod score;
pub mod smc;

pub use adequacy::Adequacy;
pub use analysis::{
    fit, fit_correlation, FactorCount, FactorModel, FactorOptions, FactorResult, RotationSpec,
};
pub use corr::CorrelationInput;
pub use error::{FaError, FaWarning};
pub use extract::{extract as extract_factors, Extraction, ExtractionMethod};
pub use rotate::{rotate as rotate_loadings, Criterion, Rotation};
pub use score::ScoreMethod;
pub use smc::SmcEstimate;
