//! Run configuration.
//!
//! One explicit object handed to each component; nothing is read at import
//! time. YAML on disk, a few environment overrides on top.

use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ReconError, ReconResult};
use crate::geo::crosswalk::WeightDefault;
use crate::geo::key::{KeyWidths, Resolution};
use crate::reconcile::cascade::CascadeStep;
use crate::reconcile::scale::UnitTotal;

/// State and county FIPS codes for the region.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Fips {
    pub state: Option<String>,
    /// Three-digit county code -> county name.
    pub counties: BTreeMap<String, String>,
    /// Label column holding county codes in npz tables.
    pub label_column: String,
}

impl Default for Fips {
    fn default() -> Self {
        Self {
            state: None,
            counties: BTreeMap::new(),
            label_column: "county".to_string(),
        }
    }
}

impl Fips {
    /// County name for an integer county code, or the code itself.
    pub fn county_label(&self, code: i64) -> String {
        self.counties
            .get(&format!("{code:03}"))
            .cloned()
            .unwrap_or_else(|| code.to_string())
    }

    /// Inverse of [`county_label`](Self::county_label).
    pub fn county_code(&self, label: &str) -> Option<i64> {
        self.counties
            .iter()
            .find(|(_, name)| name.as_str() == label)
            .and_then(|(code, _)| code.parse().ok())
            .or_else(|| label.parse().ok())
    }
}

/// Aggregation stage run by the CLI before the cascade.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateStage {
    pub crosswalk: PathBuf,
    pub target_resolution: Resolution,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub key_widths: KeyWidths,
    pub fips: Fips,
    /// Variable name -> source column code (e.g. `tothh: B11001_001E`).
    pub variables: BTreeMap<String, String>,
    pub scale_epsilon: f64,
    pub unit_total: UnitTotal,
    pub crosswalk_weighting: Option<WeightDefault>,
    pub parallel: bool,
    pub threads: Option<usize>,
    pub aggregate: Option<AggregateStage>,
    pub cascade: Vec<CascadeStep>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_widths: KeyWidths::default(),
            fips: Fips::default(),
            variables: BTreeMap::new(),
            scale_epsilon: 1e-4,
            unit_total: UnitTotal::default(),
            crosswalk_weighting: None,
            parallel: false,
            threads: None,
            aggregate: None,
            cascade: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_yaml_str(raw: &str) -> ReconResult<Self> {
        let cfg: Self =
            serde_yaml::from_str(raw).map_err(|e| ReconError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads YAML from `path`, applies environment overrides, validates.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `GEORECON_SCALE_EPSILON`, `GEORECON_THREADS`, `GEORECON_PARALLEL`.
    pub fn apply_env(&mut self) {
        if let Some(eps) = env_parse::<f64>("GEORECON_SCALE_EPSILON") {
            self.scale_epsilon = eps;
        }
        if let Some(n) = env_parse::<usize>("GEORECON_THREADS").filter(|&n| n > 0) {
            self.threads = Some(n);
        }
        if let Some(flag) = env_parse::<bool>("GEORECON_PARALLEL") {
            self.parallel = flag;
        }
    }

    pub fn validate(&self) -> ReconResult<()> {
        let w = &self.key_widths;
        if w.tract == 0 || !(w.tract < w.block_group && w.block_group < w.block) {
            return Err(ReconError::InvalidConfig(format!(
                "key widths must satisfy 0 < tract < block_group < block, got {}/{}/{}",
                w.tract, w.block_group, w.block
            )));
        }
        if !self.scale_epsilon.is_finite() || self.scale_epsilon < 0.0 {
            return Err(ReconError::InvalidConfig(format!(
                "scale_epsilon must be a non-negative number, got {}",
                self.scale_epsilon
            )));
        }
        if let Some(state) = &self.fips.state {
            if state.len() != 2 || !state.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ReconError::InvalidConfig(format!(
                    "state FIPS must be two digits, got `{state}`"
                )));
            }
        }
        if let Some(code) = self
            .fips
            .counties
            .keys()
            .find(|c| c.len() != 3 || !c.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(ReconError::InvalidConfig(format!(
                "county FIPS must be three digits, got `{code}`"
            )));
        }
        Ok(())
    }

    /// Variable name for a source column code, if mapped.
    pub fn variable_for_source(&self, source: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|(_, code)| code.as_str() == source)
            .map(|(name, _)| name.as_str())
    }
}
