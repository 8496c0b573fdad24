//! Geographic disaggregation, aggregation and control-total reconciliation.
//!
//! Coarse counts are pushed down to fine geography by population share,
//! summed up to a target geography through a weighted crosswalk, then raked
//! to external control totals so every variable group still adds up exactly
//! in integers, row by row.

pub mod allocate;
pub mod config;
pub mod error;
pub mod geo;
pub mod io;
pub mod logging;
pub mod reconcile;
pub mod runtime;
pub mod table;

pub use allocate::{
    AggregateReport, DisaggregateReport, ShareReport, aggregate, aggregate_parallel,
    compute_shares, disaggregate, disaggregate_by_prefix,
};
pub use config::Config;
pub use error::{ReconError, ReconResult};
pub use geo::{
    Crosswalk, CrosswalkRow, GeoKey, GeoKeyDeriver, GeoUnit, KeyWidths, ParentMap, Resolution,
    WeightDefault,
};
pub use logging::{default_log_level, init_logging};
pub use reconcile::{
    CascadeOrchestrator, CascadeReport, CascadeStep, ControlTotalScaler, Correction, ScaleReport,
    StepOutcome, TargetSource, UnitTotal, reconcile_to_total, round_half_even,
};
pub use table::{ControlTarget, ShareTable, VariableGroup, VariableTable};
