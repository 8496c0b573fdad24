pub mod cascade;
pub mod rounding;
pub mod scale;

pub use cascade::{
    CascadeOrchestrator, CascadeReport, CascadeStep, PlannedStep, StepOutcome, StepReport,
    TargetSource,
};
pub use rounding::{Correction, Reconciled, reconcile_to_total, round_half_even};
pub use scale::{ControlTotalScaler, ScaleReport, UnitTotal};
