use log::{debug, warn};
use ndarray::Array1;

use super::shares::{ShareReport, compute_shares};
use crate::error::ReconResult;
use crate::geo::crosswalk::ParentMap;
use crate::geo::key::GeoKeyDeriver;
use crate::table::types::{ShareTable, VariableTable};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisaggregateReport {
    pub children: usize,
    /// Children whose parent has no row in the parent table; they get 0s.
    pub orphaned: usize,
}

/// `child_value = parent_value * share` for every child in `shares`.
///
/// Never touches `parent_vars`. A child whose parent is missing from
/// `parent_vars` receives 0 for every variable.
pub fn disaggregate(
    parent_vars: &VariableTable,
    shares: &ShareTable,
    variables: &[&str],
) -> ReconResult<(VariableTable, DisaggregateReport)> {
    parent_vars.require_columns(variables.iter().copied())?;

    let entries = shares.entries();
    let keys = entries.iter().map(|e| e.child.clone()).collect();
    let mut out = VariableTable::new(
        format!("{}_by_{:?}", parent_vars.name(), shares.child_resolution()).to_lowercase(),
        shares.child_resolution(),
        keys,
    )?;

    let parent_rows: Vec<Option<usize>> = entries
        .iter()
        .map(|e| parent_vars.row_of(e.parent.as_str()))
        .collect();
    let orphaned = parent_rows.iter().filter(|r| r.is_none()).count();

    for &var in variables {
        let source = parent_vars.column(var)?;
        let values: Array1<f64> = entries
            .iter()
            .zip(&parent_rows)
            .map(|(e, row)| match row {
                Some(r) => source[*r] * e.share,
                None => 0.0,
            })
            .collect();
        out.set_column(var, values)?;
    }

    if orphaned > 0 {
        warn!(
            "event=disaggregate_orphans module=disaggregate parent_table={} children={}",
            parent_vars.name(),
            orphaned
        );
    }
    debug!(
        "event=disaggregate_done module=disaggregate parent_table={} children={} variables={}",
        parent_vars.name(),
        entries.len(),
        variables.len()
    );

    Ok((
        out,
        DisaggregateReport {
            children: entries.len(),
            orphaned,
        },
    ))
}

/// Prefix-derived pipeline: parents are sliced out of the child GEOIDs in
/// `child_weights`, shares come from `weight_col`, then `variables` of
/// `parent_vars` are pushed down.
pub fn disaggregate_by_prefix(
    parent_vars: &VariableTable,
    child_weights: &VariableTable,
    weight_col: &str,
    deriver: &GeoKeyDeriver,
    variables: &[&str],
) -> ReconResult<(VariableTable, ShareReport, DisaggregateReport)> {
    let map = ParentMap::from_prefix(
        child_weights.keys(),
        child_weights.resolution(),
        parent_vars.resolution(),
        deriver,
    )?;
    let (shares, share_report) = compute_shares(child_weights, weight_col, &map)?;
    let (table, report) = disaggregate(parent_vars, &shares, variables)?;
    Ok((table, share_report, report))
}
