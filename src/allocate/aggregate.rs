use ahash::AHashMap;
use itertools::Itertools;
use log::{info, warn};
use ndarray::Array1;
use rayon::prelude::*;

use crate::error::ReconResult;
use crate::geo::crosswalk::Crosswalk;
use crate::geo::key::GeoKey;
use crate::table::types::VariableTable;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub mapped: usize,
    /// Fine units with no crosswalk entry.
    pub dropped: usize,
    pub targets: usize,
}

type Acc = AHashMap<GeoKey, Vec<f64>>;

fn fold_row(acc: &mut Acc, crosswalk: &Crosswalk, key: &GeoKey, row: &[f64]) -> bool {
    let links = crosswalk.targets_of(key.as_str());
    if links.is_empty() {
        return false;
    }
    for (target, weight) in links {
        let slot = acc
            .entry(target.clone())
            .or_insert_with(|| vec![0.0; row.len()]);
        for (s, v) in slot.iter_mut().zip(row) {
            *s += v * weight;
        }
    }
    true
}

fn merge(mut a: Acc, b: Acc) -> Acc {
    for (k, vb) in b {
        match a.get_mut(&k) {
            Some(va) => va.iter_mut().zip(vb).for_each(|(x, y)| *x += y),
            None => {
                a.insert(k, vb);
            }
        }
    }
    a
}

fn gather_rows(fine_vars: &VariableTable, variables: &[&str]) -> ReconResult<Vec<Vec<f64>>> {
    let cols = variables
        .iter()
        .map(|v| fine_vars.column(v))
        .collect::<ReconResult<Vec<_>>>()?;
    Ok((0..fine_vars.len())
        .map(|r| cols.iter().map(|c| c[r]).collect())
        .collect())
}

fn finish(
    fine_vars: &VariableTable,
    crosswalk: &Crosswalk,
    variables: &[&str],
    acc: Acc,
    mapped: usize,
) -> ReconResult<(VariableTable, AggregateReport)> {
    let dropped = fine_vars.len() - mapped;
    if dropped > 0 {
        warn!(
            "event=aggregate_dropped module=aggregate table={} dropped={} mapped={}",
            fine_vars.name(),
            dropped,
            mapped
        );
    }

    let rows: Vec<(GeoKey, Vec<f64>)> = acc.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect();
    let keys = rows.iter().map(|(k, _)| k.clone()).collect();
    let mut out = VariableTable::new(
        format!("{}_by_{:?}", fine_vars.name(), crosswalk.target_resolution()).to_lowercase(),
        crosswalk.target_resolution(),
        keys,
    )?;
    for (i, var) in variables.iter().enumerate() {
        let values: Array1<f64> = rows.iter().map(|(_, v)| v[i]).collect();
        out.set_column(*var, values)?;
    }
    info!(
        "event=aggregate_done module=aggregate table={} targets={} mapped={} dropped={}",
        fine_vars.name(),
        out.len(),
        mapped,
        dropped
    );
    let report = AggregateReport {
        mapped,
        dropped,
        targets: out.len(),
    };
    Ok((out, report))
}

/// Σ `fine_value * weight` per target unit over every (fine, target, weight) link.
///
/// Unmapped fine units are dropped and counted, never an error.
pub fn aggregate(
    fine_vars: &VariableTable,
    crosswalk: &Crosswalk,
    variables: &[&str],
) -> ReconResult<(VariableTable, AggregateReport)> {
    let rows = gather_rows(fine_vars, variables)?;
    let mut acc = Acc::new();
    let mut mapped = 0usize;
    for (key, row) in fine_vars.keys().iter().zip(&rows) {
        if fold_row(&mut acc, crosswalk, key, row) {
            mapped += 1;
        }
    }
    finish(fine_vars, crosswalk, variables, acc, mapped)
}

/// Same fold split over the rayon pool. Float addition order differs from
/// [`aggregate`], so results may differ in the last bits.
pub fn aggregate_parallel(
    fine_vars: &VariableTable,
    crosswalk: &Crosswalk,
    variables: &[&str],
) -> ReconResult<(VariableTable, AggregateReport)> {
    let rows = gather_rows(fine_vars, variables)?;
    let (acc, mapped) = fine_vars
        .keys()
        .par_iter()
        .zip(rows.par_iter())
        .fold(
            || (Acc::new(), 0usize),
            |(mut acc, n), (key, row)| {
                let hit = fold_row(&mut acc, crosswalk, key, row);
                (acc, n + hit as usize)
            },
        )
        .reduce(|| (Acc::new(), 0usize), |(a, na), (b, nb)| (merge(a, b), na + nb));
    finish(fine_vars, crosswalk, variables, acc, mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::crosswalk::CrosswalkRow;
    use crate::geo::key::Resolution;

    fn fine() -> VariableTable {
        VariableTable::new(
            "bg",
            Resolution::BlockGroup,
            ["a", "b", "c"].iter().map(|&k| GeoKey::from(k)).collect(),
        )
        .unwrap()
        .with_column("tothh", vec![10.0, 20.0, 30.0])
        .unwrap()
        .with_column("empres", vec![1.0, 2.0, 3.0])
        .unwrap()
    }

    fn crosswalk() -> Crosswalk {
        let rows = vec![
            CrosswalkRow::weighted("a", "1", 1.0),
            CrosswalkRow::weighted("b", "1", 0.25),
            CrosswalkRow::weighted("b", "2", 0.75),
        ];
        Crosswalk::from_rows(&rows, Resolution::Taz, None).unwrap()
    }

    #[test]
    fn straddling_units_split_by_weight() {
        let (out, report) = aggregate(&fine(), &crosswalk(), &["tothh", "empres"]).unwrap();
        assert_eq!(report, AggregateReport { mapped: 2, dropped: 1, targets: 2 });
        assert_eq!(out.value("1", "tothh"), Some(15.0));
        assert_eq!(out.value("2", "tothh"), Some(15.0));
        assert_eq!(out.value("2", "empres"), Some(1.5));
        assert_eq!(out.resolution(), Resolution::Taz);
    }

    #[test]
    fn parallel_fold_matches_sequential() {
        let (seq, r1) = aggregate(&fine(), &crosswalk(), &["tothh"]).unwrap();
        let (par, r2) = aggregate_parallel(&fine(), &crosswalk(), &["tothh"]).unwrap();
        assert_eq!(r1, r2);
        for key in seq.keys() {
            let a = seq.value(key.as_str(), "tothh").unwrap();
            let b = par.value(key.as_str(), "tothh").unwrap();
            assert!((a - b).abs() < 1e-9);
        }
    }
}
