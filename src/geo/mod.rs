pub mod crosswalk;
pub mod key;

pub use crosswalk::{Crosswalk, CrosswalkRow, ParentMap, WeightDefault};
pub use key::{GeoKey, GeoKeyDeriver, GeoUnit, KeyWidths, Resolution};
