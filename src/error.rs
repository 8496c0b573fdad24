use thiserror::Error;

use crate::geo::key::Resolution;

/// Structural failures. Sparse-data conditions (zero weights, missing parents,
/// unmapped units) never show up here; they are counted in the operation reports.
#[derive(Debug, Error)]
pub enum ReconError {
    /// A geographic key is too short or carries non-digit characters.
    #[error("malformed key `{key}` for {level}: {reason}")]
    MalformedKey {
        key: String,
        level: Resolution,
        reason: String,
    },
    /// The requested level cannot be reached by slicing a GEOID.
    #[error("{0} keys are not prefix-derivable; supply a crosswalk")]
    NotPrefixDerivable(Resolution),
    /// The target table lacks the `{sum_variable}_target` column.
    #[error("target table has no column `{column}`")]
    MissingTargetColumn { column: String },
    #[error("table `{table}` has no column `{column}`")]
    MissingColumn { column: String, table: String },
    #[error("duplicate row key `{0}`")]
    DuplicateKey(String),
    /// A table cell holds NaN or an infinity.
    #[error("column `{column}` holds a non-finite value at `{key}`")]
    NonFinite { column: String, key: String },
    #[error("column `{column}` has {found} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },
    /// Some crosswalk rows carry weights and some do not.
    #[error("crosswalk mixes explicit and defaulted weights")]
    MixedCrosswalkWeights,
    #[error("crosswalk row {fine} -> {target} has no population to weight by")]
    MissingCrosswalkWeight { fine: String, target: String },
    #[error("crosswalk has no weights and no default weighting was selected")]
    UnspecifiedCrosswalkWeighting,
    /// A derived target reads a variable that a later step rescales.
    #[error("step `{step}` derives its target from `{variable}`, which is rescaled later by `{producer}`")]
    CascadeOrder {
        step: String,
        variable: String,
        producer: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ReconResult<T> = Result<T, ReconError>;
