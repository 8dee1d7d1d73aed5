//! Error types for solver construction
//!
//! Only setup is fallible: constructors validate configurations, hierarchy
//! shapes, and model parameters, and return one of the variants below. A
//! `solve` call itself never fails; non-convergence travels in the returned
//! state, not as an error.

use thiserror::Error;

/// Errors raised while building a solver
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("hierarchy has no levels")]
    EmptyHierarchy,

    #[error("invalid tolerance: {name} = {value}")]
    InvalidTolerance { name: &'static str, value: f64 },

    #[error("linear tolerance floor {floor:e} exceeds initial value {initial:e}")]
    LinearTolOrder { floor: f64, initial: f64 },

    #[error("invalid coefficient parameter: {name} = {value}")]
    InvalidCoefficient { name: &'static str, value: f64 },

    #[error("level {level}: elevation has {actual} entries, expected {expected}")]
    ElevationSize {
        level: usize,
        expected: usize,
        actual: usize,
    },

    #[error("level {level}: {operation} produced {actual} dofs, expected {expected}")]
    TransferShape {
        level: usize,
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("expected {expected} elevation vectors (one per level), got {actual}")]
    ElevationCount { expected: usize, actual: usize },
}
