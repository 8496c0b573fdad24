pub mod aggregate;
pub mod disaggregate;
pub mod shares;

pub use aggregate::{AggregateReport, aggregate, aggregate_parallel};
pub use disaggregate::{DisaggregateReport, disaggregate, disaggregate_by_prefix};
pub use shares::{ShareReport, compute_shares};
