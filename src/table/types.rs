use ahash::AHashMap;
use itertools::Itertools;
use ndarray::Array1;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::error::{ReconError, ReconResult};
use crate::geo::key::{GeoKey, GeoUnit, Resolution};

#[derive(Debug, Clone, PartialEq)]
struct Column {
    name: String,
    values: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Label {
    name: String,
    values: Vec<String>,
}

/// Keyed numeric table: one row per geographic unit, named `f64` columns,
/// plus string label columns (e.g. the county each TAZ belongs to).
///
/// Tables are values. Every operation in this crate hands back a new table.
#[derive(Debug, Clone)]
pub struct VariableTable {
    name: String,
    resolution: Resolution,
    keys: Vec<GeoKey>,
    index: AHashMap<GeoKey, usize>,
    columns: Vec<Column>,
    labels: Vec<Label>,
}

impl PartialEq for VariableTable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.resolution == other.resolution
            && self.keys == other.keys
            && self.columns == other.columns
            && self.labels == other.labels
    }
}

impl VariableTable {
    /// Empty-columned table over `keys`. Keys must be unique.
    pub fn new(
        name: impl Into<String>,
        resolution: Resolution,
        keys: Vec<GeoKey>,
    ) -> ReconResult<Self> {
        let mut index = AHashMap::with_capacity(keys.len());
        for (row, key) in keys.iter().enumerate() {
            if index.insert(key.clone(), row).is_some() {
                return Err(ReconError::DuplicateKey(key.to_string()));
            }
        }
        Ok(Self {
            name: name.into(),
            resolution,
            keys,
            index,
            columns: Vec::new(),
            labels: Vec::new(),
        })
    }

    /// Adds (or replaces) a numeric column.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> ReconResult<Self> {
        self.set_column(name, Array1::from_vec(values))?;
        Ok(self)
    }

    /// Adds (or replaces) a label column.
    pub fn with_label(mut self, name: impl Into<String>, values: Vec<String>) -> ReconResult<Self> {
        let name = name.into();
        self.check_len(&name, values.len())?;
        match self.labels.iter_mut().find(|l| l.name == name) {
            Some(label) => label.values = values,
            None => self.labels.push(Label { name, values }),
        }
        Ok(self)
    }

    /// Label column filled through a child -> parent lookup. Rows without a
    /// parent get an empty label, which never matches a target unit.
    pub fn with_label_from(
        self,
        name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ReconResult<Self> {
        let values: Vec<String> = self
            .keys
            .iter()
            .map(|k| lookup(k.as_str()).unwrap_or_default())
            .collect();
        let missing = values.iter().filter(|v| v.is_empty()).count();
        if missing > 0 {
            log::warn!(
                "event=label_unmatched module=table table={} rows={}",
                self.name,
                missing
            );
        }
        self.with_label(name, values)
    }

    /// Adds (or replaces) a numeric column. NaN and infinities are rejected.
    pub fn set_column(&mut self, name: impl Into<String>, values: Array1<f64>) -> ReconResult<()> {
        let name = name.into();
        self.check_len(&name, values.len())?;
        if let Some(row) = values.iter().position(|v| !v.is_finite()) {
            return Err(ReconError::NonFinite {
                column: name,
                key: self.keys[row].to_string(),
            });
        }
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(col) => col.values = values,
            None => self.columns.push(Column { name, values }),
        }
        Ok(())
    }

    fn check_len(&self, column: &str, found: usize) -> ReconResult<()> {
        if found != self.keys.len() {
            return Err(ReconError::ColumnLength {
                column: column.to_string(),
                expected: self.keys.len(),
                found,
            });
        }
        Ok(())
    }

    fn missing(&self, column: &str) -> ReconError {
        ReconError::MissingColumn {
            column: column.to_string(),
            table: self.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[GeoKey] {
        &self.keys
    }

    pub fn units(&self) -> impl Iterator<Item = GeoUnit> + '_ {
        self.keys.iter().map(|k| GeoUnit {
            key: k.clone(),
            resolution: self.resolution,
        })
    }

    #[inline]
    pub fn row_of(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn column(&self, name: &str) -> ReconResult<&Array1<f64>> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.values)
            .ok_or_else(|| self.missing(name))
    }

    pub fn label(&self, name: &str) -> ReconResult<&[String]> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.values.as_slice())
            .ok_or_else(|| self.missing(name))
    }

    /// Value of `column` for `key`, `None` when either is absent.
    pub fn value(&self, key: &str, column: &str) -> Option<f64> {
        let row = self.row_of(key)?;
        let col = self.columns.iter().find(|c| c.name == column)?;
        Some(col.values[row])
    }

    pub fn require_columns<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ReconResult<()> {
        for name in names {
            if !self.has_column(name) {
                return Err(self.missing(name));
            }
        }
        Ok(())
    }

    /// Row indices grouped by the value of a label column, groups in label order.
    pub fn rows_by_label(&self, label: &str) -> ReconResult<Vec<(&str, Vec<usize>)>> {
        let values = self.label(label)?;
        let mut groups: AHashMap<&str, Vec<usize>> = AHashMap::new();
        for (row, unit) in values.iter().enumerate() {
            groups.entry(unit.as_str()).or_default().push(row);
        }
        Ok(groups
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .collect())
    }

    /// Column total.
    pub fn total(&self, column: &str) -> ReconResult<f64> {
        Ok(self.column(column)?.sum())
    }
}

/// One child's share of its parent's weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareEntry {
    pub child: GeoKey,
    pub parent: GeoKey,
    pub share: f64,
}

/// Immutable (child, parent) -> share table; shares of a nonzero-weight
/// parent sum to 1, shares of a zero-weight parent are all 0.
#[derive(Debug, Clone)]
pub struct ShareTable {
    child_resolution: Resolution,
    parent_resolution: Resolution,
    entries: Vec<ShareEntry>,
    index: AHashMap<GeoKey, usize>,
}

impl ShareTable {
    pub(crate) fn from_entries(
        child_resolution: Resolution,
        parent_resolution: Resolution,
        entries: Vec<ShareEntry>,
    ) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.child.clone(), i))
            .collect();
        Self {
            child_resolution,
            parent_resolution,
            entries,
            index,
        }
    }

    pub fn child_resolution(&self) -> Resolution {
        self.child_resolution
    }

    pub fn parent_resolution(&self) -> Resolution {
        self.parent_resolution
    }

    pub fn entries(&self) -> &[ShareEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn share(&self, child: &str) -> Option<f64> {
        self.index.get(child).map(|&i| self.entries[i].share)
    }

    pub fn parent_of(&self, child: &str) -> Option<&GeoKey> {
        self.index.get(child).map(|&i| &self.entries[i].parent)
    }

    /// Σ shares per parent.
    pub fn parent_sums(&self) -> AHashMap<GeoKey, f64> {
        let mut sums: AHashMap<GeoKey, f64> = AHashMap::new();
        for e in &self.entries {
            *sums.entry(e.parent.clone()).or_insert(0.0) += e.share;
        }
        sums
    }
}

#[derive(Debug, Deserialize)]
struct GroupSpec {
    name: String,
    sum: String,
    partials: Vec<String>,
}

/// A sum variable and the partials that must add up to it, row by row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "GroupSpec")]
pub struct VariableGroup {
    name: String,
    sum_variable: String,
    partials: SmallVec<[String; 4]>,
}

impl TryFrom<GroupSpec> for VariableGroup {
    type Error = ReconError;

    fn try_from(spec: GroupSpec) -> Result<Self, Self::Error> {
        Self::new(spec.name, spec.sum, spec.partials)
    }
}

impl VariableGroup {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        sum_variable: impl Into<String>,
        partials: impl IntoIterator<Item = S>,
    ) -> ReconResult<Self> {
        let name = name.into();
        let sum_variable = sum_variable.into();
        let partials: SmallVec<[String; 4]> = partials.into_iter().map(Into::into).collect();
        if partials.is_empty() {
            return Err(ReconError::InvalidConfig(format!(
                "group `{name}` has no partial variables"
            )));
        }
        if partials.contains(&sum_variable) {
            return Err(ReconError::InvalidConfig(format!(
                "group `{name}` lists its sum `{sum_variable}` as a partial"
            )));
        }
        if partials.iter().duplicates().next().is_some() {
            return Err(ReconError::InvalidConfig(format!(
                "group `{name}` repeats a partial variable"
            )));
        }
        Ok(Self {
            name,
            sum_variable,
            partials,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sum_variable(&self) -> &str {
        &self.sum_variable
    }

    pub fn partials(&self) -> &[String] {
        &self.partials
    }

    /// `{sum_variable}_target`.
    pub fn target_column(&self) -> String {
        format!("{}_target", self.sum_variable)
    }

    /// Sum first, then partials in declaration order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.sum_variable.as_str()).chain(self.partials.iter().map(|p| p.as_str()))
    }

    pub fn contains(&self, variable: &str) -> bool {
        self.variables().any(|v| v == variable)
    }

    pub fn validate_against(&self, table: &VariableTable) -> ReconResult<()> {
        table.require_columns(self.variables())
    }

    /// Keys of rows that are not whole numbers with `sum == Σ partials`.
    pub fn violations(&self, table: &VariableTable) -> ReconResult<Vec<GeoKey>> {
        let sum = table.column(&self.sum_variable)?;
        let parts = self
            .partials
            .iter()
            .map(|p| table.column(p))
            .collect::<ReconResult<Vec<_>>>()?;
        Ok((0..table.len())
            .filter(|&r| {
                let total: f64 = parts.iter().map(|c| c[r]).sum();
                sum[r] != total || !is_whole(sum[r]) || parts.iter().any(|c| !is_whole(c[r]))
            })
            .map(|r| table.keys()[r].clone())
            .collect())
    }
}

#[inline]
pub(crate) fn is_whole(x: f64) -> bool {
    x.fract() == 0.0
}

/// Aggregation-unit key -> `{variable}_target` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTarget {
    units: Vec<String>,
    index: AHashMap<String, usize>,
    columns: Vec<(String, Vec<f64>)>,
}

impl ControlTarget {
    pub fn new(units: Vec<String>) -> ReconResult<Self> {
        let mut index = AHashMap::with_capacity(units.len());
        for (i, u) in units.iter().enumerate() {
            if index.insert(u.clone(), i).is_some() {
                return Err(ReconError::DuplicateKey(u.clone()));
            }
        }
        Ok(Self {
            units,
            index,
            columns: Vec::new(),
        })
    }

    /// Single-column target built from (unit, value) pairs.
    pub fn from_values(
        column: impl Into<String>,
        values: impl IntoIterator<Item = (String, f64)>,
    ) -> ReconResult<Self> {
        let (units, vals): (Vec<String>, Vec<f64>) = values.into_iter().unzip();
        Self::new(units)?.with_column(column, vals)
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> ReconResult<Self> {
        let name = name.into();
        if values.len() != self.units.len() {
            return Err(ReconError::ColumnLength {
                column: name,
                expected: self.units.len(),
                found: values.len(),
            });
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = values,
            None => self.columns.push((name, values)),
        }
        Ok(self)
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn column(&self, name: &str) -> ReconResult<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| ReconError::MissingTargetColumn {
                column: name.to_string(),
            })
    }

    /// Target for `unit`; `None` when the unit is absent or the value is NaN.
    pub fn target(&self, unit: &str, column: &str) -> ReconResult<Option<f64>> {
        let values = self.column(column)?;
        Ok(self
            .index
            .get(unit)
            .map(|&i| values[i])
            .filter(|v| !v.is_nan()))
    }

    /// The `source` column re-exposed under `as_column`, alone.
    pub fn view(&self, source: &str, as_column: &str) -> ReconResult<Self> {
        let values = self.column(source)?.to_vec();
        Ok(Self {
            units: self.units.clone(),
            index: self.index.clone(),
            columns: vec![(as_column.to_string(), values)],
        })
    }
}
