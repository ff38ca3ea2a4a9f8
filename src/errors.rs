use thiserror::Error;

/// Error taxonomy for the demand engine.
///
/// Configuration and consistency errors represent invalid model input and are
/// never retried; non-convergence is raised only after the sigmoid fitter has
/// exhausted its whole retry ladder.
#[derive(Debug, Error)]
pub enum DemandError {
    #[error("Invalid model configuration: {0}")]
    Configuration(String),
    #[error("Sigmoid fit did not converge for enduse '{enduse}', technology '{technology}': {reason}")]
    NonConvergence {
        enduse: String,
        technology: String,
        reason: String,
    },
    #[error("Consistency violation: {0}")]
    Consistency(String),
}
