use ahash::AHashMap;
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::key::{GeoKey, GeoKeyDeriver, Resolution};
use crate::allocate::shares::normalize_within;
use crate::error::{ReconError, ReconResult};

/// Child -> parent mapping, exactly one parent per child.
#[derive(Debug, Clone)]
pub struct ParentMap {
    child_resolution: Resolution,
    parent_resolution: Resolution,
    parents: AHashMap<GeoKey, GeoKey>,
}

impl ParentMap {
    /// Builds the mapping by slicing each child GEOID down to `level`.
    pub fn from_prefix<'a>(
        children: impl IntoIterator<Item = &'a GeoKey>,
        source: Resolution,
        level: Resolution,
        deriver: &GeoKeyDeriver,
    ) -> ReconResult<Self> {
        let mut parents = AHashMap::new();
        for child in children {
            let parent = deriver.derive_from(child.as_str(), source, level)?;
            parents.insert(child.clone(), parent);
        }
        Ok(Self {
            child_resolution: source,
            parent_resolution: level,
            parents,
        })
    }

    /// Builds the mapping from an external crosswalk (TAZ, county).
    /// A child listed twice with different parents is rejected.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (GeoKey, GeoKey)>,
        child_resolution: Resolution,
        parent_resolution: Resolution,
    ) -> ReconResult<Self> {
        let mut parents: AHashMap<GeoKey, GeoKey> = AHashMap::new();
        for (child, parent) in pairs {
            match parents.get(&child) {
                Some(existing) if *existing != parent => {
                    return Err(ReconError::DuplicateKey(child.to_string()));
                }
                Some(_) => {}
                None => {
                    parents.insert(child, parent);
                }
            }
        }
        Ok(Self {
            child_resolution,
            parent_resolution,
            parents,
        })
    }

    pub fn child_resolution(&self) -> Resolution {
        self.child_resolution
    }

    pub fn parent_resolution(&self) -> Resolution {
        self.parent_resolution
    }

    pub fn parent_of(&self, child: &str) -> Option<&GeoKey> {
        self.parents.get(child)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Pairs in child-key order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (&GeoKey, &GeoKey)> {
        self.parents.iter().sorted_by(|a, b| a.0.cmp(b.0))
    }
}

/// How to weight crosswalk rows that carry no explicit weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDefault {
    /// Piece population over the fine unit's total population.
    PopulationShare,
    /// `1 / k` for a fine unit mapped to `k` targets.
    EqualShare,
}

/// One raw crosswalk record.
#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkRow {
    pub fine: GeoKey,
    pub target: GeoKey,
    pub weight: Option<f64>,
    pub population: Option<f64>,
}

impl CrosswalkRow {
    pub fn weighted(fine: impl Into<GeoKey>, target: impl Into<GeoKey>, weight: f64) -> Self {
        Self {
            fine: fine.into(),
            target: target.into(),
            weight: Some(weight),
            population: None,
        }
    }

    pub fn unweighted(fine: impl Into<GeoKey>, target: impl Into<GeoKey>) -> Self {
        Self {
            fine: fine.into(),
            target: target.into(),
            weight: None,
            population: None,
        }
    }

    pub fn with_population(mut self, population: f64) -> Self {
        self.population = Some(population);
        self
    }
}

pub type Links = SmallVec<[(GeoKey, f64); 2]>;

/// Fine unit -> weighted target units. One fine unit may straddle several targets.
#[derive(Debug, Clone)]
pub struct Crosswalk {
    target_resolution: Resolution,
    links: AHashMap<GeoKey, Links>,
}

impl Crosswalk {
    pub fn new(target_resolution: Resolution) -> Self {
        Self {
            target_resolution,
            links: AHashMap::new(),
        }
    }

    /// Adds an explicit link; repeated (fine, target) pairs accumulate weight.
    pub fn link(&mut self, fine: GeoKey, target: GeoKey, weight: f64) {
        let links = self.links.entry(fine).or_default();
        match links.iter_mut().find(|(t, _)| *t == target) {
            Some((_, w)) => *w += weight,
            None => links.push((target, weight)),
        }
    }

    /// Many-to-one crosswalk with unit weights.
    pub fn from_parent_map(map: &ParentMap) -> Self {
        let mut out = Self::new(map.parent_resolution());
        for (child, parent) in map.iter_sorted() {
            out.link(child.clone(), parent.clone(), 1.0);
        }
        out
    }

    /// Builds a crosswalk from raw rows.
    ///
    /// All rows weighted: weights are used as given. No row weighted: the
    /// selected `default` applies. Anything in between is rejected, as is a
    /// weightless crosswalk without a selected default.
    pub fn from_rows(
        rows: &[CrosswalkRow],
        target_resolution: Resolution,
        default: Option<WeightDefault>,
    ) -> ReconResult<Self> {
        let mut out = Self::new(target_resolution);
        let explicit = rows.iter().filter(|r| r.weight.is_some()).count();

        if explicit == rows.len() {
            for r in rows {
                out.link(r.fine.clone(), r.target.clone(), r.weight.unwrap_or_default());
            }
            return Ok(out);
        }
        if explicit > 0 {
            return Err(ReconError::MixedCrosswalkWeights);
        }

        match default.ok_or(ReconError::UnspecifiedCrosswalkWeighting)? {
            WeightDefault::EqualShare => {
                let mut fanout: AHashMap<&GeoKey, usize> = AHashMap::new();
                for r in rows {
                    *fanout.entry(&r.fine).or_insert(0) += 1;
                }
                for r in rows {
                    let k = fanout.get(&r.fine).copied().unwrap_or(1) as f64;
                    out.link(r.fine.clone(), r.target.clone(), 1.0 / k);
                }
            }
            WeightDefault::PopulationShare => {
                let mut pieces: Vec<(&GeoKey, f64)> = Vec::with_capacity(rows.len());
                for r in rows {
                    let pop = r.population.ok_or_else(|| ReconError::MissingCrosswalkWeight {
                        fine: r.fine.to_string(),
                        target: r.target.to_string(),
                    })?;
                    pieces.push((&r.fine, pop));
                }
                let (shares, zero_parents) = normalize_within(&pieces);
                if zero_parents > 0 {
                    warn!(
                        "event=crosswalk_zero_population module=crosswalk fine_units={}",
                        zero_parents
                    );
                }
                for (r, share) in rows.iter().zip(shares) {
                    out.link(r.fine.clone(), r.target.clone(), share);
                }
            }
        }
        debug!(
            "event=crosswalk_built module=crosswalk rows={} fine_units={} weighting={:?}",
            rows.len(),
            out.links.len(),
            default
        );
        Ok(out)
    }

    pub fn target_resolution(&self) -> Resolution {
        self.target_resolution
    }

    pub fn targets_of(&self, fine: &str) -> &[(GeoKey, f64)] {
        self.links.get(fine).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
