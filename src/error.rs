//! Error taxonomy for selection, risk modelling and optimization.

use crate::portfolio::OptimizationResult;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizeError {
    /// Not enough return periods for the requested window.
    #[error("Insufficient history for {ticker}: need at least {required} periods, got {available}")]
    InsufficientHistory {
        ticker: String,
        required: usize,
        available: usize,
    },

    /// Zero or non-finite volatility; the series carries no usable risk signal.
    #[error("Degenerate return series for {ticker}")]
    DegenerateSeries { ticker: String },

    /// Weights, covariance or return matrices disagree on shape or ordering.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid confidence level {0}: must lie strictly between 0 and 1")]
    InvalidConfidence(f64),

    #[error("Invalid constraints: {0}")]
    InvalidConstraints(String),

    /// No subset of the requested size can satisfy the hard sector rules.
    /// Carries the result of a run with relaxed sector rules when one was possible.
    #[error("Constraints unsatisfiable: {reason}")]
    ConstraintUnsatisfiable {
        reason: String,
        relaxed: Option<Box<OptimizationResult>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OptimizeError>;
