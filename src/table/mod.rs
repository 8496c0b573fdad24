pub mod types;

pub use types::{ControlTarget, ShareEntry, ShareTable, VariableGroup, VariableTable};
