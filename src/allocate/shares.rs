use ahash::AHashMap;
use log::{debug, warn};
use std::hash::Hash;

use crate::error::ReconResult;
use crate::geo::crosswalk::ParentMap;
use crate::geo::key::GeoKey;
use crate::table::types::{ShareEntry, ShareTable, VariableTable};

/// How many children/parents fell into the sparse-data cases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareReport {
    pub children: usize,
    pub parents: usize,
    /// Parents whose children weigh nothing; all their shares are 0.
    pub zero_weight_parents: usize,
    /// Children in the parent map with no row in the weight table.
    pub missing_children: usize,
}

/// `weight / Σ weight` within each parent, aligned with `items`.
/// A parent whose total is 0 gives all of its items a 0 share.
/// Also returns the number of such parents.
pub(crate) fn normalize_within<P: Hash + Eq>(items: &[(P, f64)]) -> (Vec<f64>, usize) {
    let mut totals: AHashMap<&P, f64> = AHashMap::new();
    for (parent, w) in items {
        *totals.entry(parent).or_insert(0.0) += *w;
    }
    let zero = totals.values().filter(|&&t| t == 0.0).count();
    let shares = items
        .iter()
        .map(|(parent, w)| match totals.get(parent) {
            Some(&t) if t != 0.0 => *w / t,
            _ => 0.0,
        })
        .collect();
    (shares, zero)
}

#[inline]
fn clean_weight(w: f64) -> f64 {
    if w > 0.0 { w } else { 0.0 }
}

/// Each child's share of its parent's total `weight_col`.
///
/// Children listed in `child_to_parent` but absent from `weights` get a 0
/// share and are counted (and logged) rather than failing the call. Negative
/// weights count as 0.
pub fn compute_shares(
    weights: &VariableTable,
    weight_col: &str,
    child_to_parent: &ParentMap,
) -> ReconResult<(ShareTable, ShareReport)> {
    let column = weights.column(weight_col)?;
    let mut report = ShareReport::default();
    let mut missing: Vec<&GeoKey> = Vec::new();

    let mut items: Vec<(&GeoKey, f64)> = Vec::with_capacity(child_to_parent.len());
    let mut children: Vec<&GeoKey> = Vec::with_capacity(child_to_parent.len());
    for (child, parent) in child_to_parent.iter_sorted() {
        let w = match weights.row_of(child.as_str()) {
            Some(row) => clean_weight(column[row]),
            None => {
                missing.push(child);
                0.0
            }
        };
        items.push((parent, w));
        children.push(child);
    }

    let (shares, zero_parents) = normalize_within(&items);
    report.children = children.len();
    report.parents = items.iter().map(|(p, _)| *p).collect::<ahash::AHashSet<_>>().len();
    report.zero_weight_parents = zero_parents;
    report.missing_children = missing.len();

    if !missing.is_empty() {
        let sample: Vec<&str> = missing.iter().take(5).map(|k| k.as_str()).collect();
        warn!(
            "event=share_child_missing module=shares table={} children={} sample={:?}",
            weights.name(),
            missing.len(),
            sample
        );
    }
    if zero_parents > 0 {
        debug!(
            "event=share_zero_parent module=shares table={} parents={}",
            weights.name(),
            zero_parents
        );
    }

    let entries = children
        .into_iter()
        .zip(items)
        .zip(shares)
        .map(|((child, (parent, _)), share)| ShareEntry {
            child: child.clone(),
            parent: parent.clone(),
            share,
        })
        .collect();

    Ok((
        ShareTable::from_entries(
            child_to_parent.child_resolution(),
            child_to_parent.parent_resolution(),
            entries,
        ),
        report,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::key::{GeoKeyDeriver, Resolution};

    fn blocks(pops: &[(&str, f64)]) -> VariableTable {
        let keys = pops.iter().map(|(k, _)| GeoKey::from(*k)).collect();
        VariableTable::new("blocks", Resolution::Block, keys)
            .unwrap()
            .with_column("pop", pops.iter().map(|(_, p)| *p).collect())
            .unwrap()
    }

    fn by_prefix(t: &VariableTable) -> ParentMap {
        ParentMap::from_prefix(
            t.keys(),
            Resolution::Block,
            Resolution::BlockGroup,
            &GeoKeyDeriver::default(),
        )
        .unwrap()
    }

    #[test]
    fn shares_normalize_per_parent() {
        let t = blocks(&[
            ("060010001001000", 60.0),
            ("060010001001001", 40.0),
            ("060010001002000", 7.0),
            ("060010001002001", 0.0),
            ("060010001002002", 14.0),
        ]);
        let (shares, report) = compute_shares(&t, "pop", &by_prefix(&t)).unwrap();
        assert_eq!(report.parents, 2);
        assert_eq!(report.zero_weight_parents, 0);
        assert!((shares.share("060010001001000").unwrap() - 0.6).abs() < 1e-12);
        assert!((shares.share("060010001002000").unwrap() - 1.0 / 3.0).abs() < 1e-12);
        for (_, s) in shares.parent_sums() {
            assert!((s - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_weight_parent_gets_zero_shares() {
        let t = blocks(&[("060010001001000", 0.0), ("060010001001001", 0.0)]);
        let (shares, report) = compute_shares(&t, "pop", &by_prefix(&t)).unwrap();
        assert_eq!(report.zero_weight_parents, 1);
        assert_eq!(shares.share("060010001001000"), Some(0.0));
        assert_eq!(shares.share("060010001001001"), Some(0.0));
    }

    #[test]
    fn missing_child_weight_is_zero_not_an_error() {
        let t = blocks(&[("060010001001000", 10.0)]);
        let map = ParentMap::from_pairs(
            vec![
                (GeoKey::from("060010001001000"), GeoKey::from("060010001001")),
                (GeoKey::from("060010001001009"), GeoKey::from("060010001001")),
            ],
            Resolution::Block,
            Resolution::BlockGroup,
        )
        .unwrap();
        let (shares, report) = compute_shares(&t, "pop", &map).unwrap();
        assert_eq!(report.missing_children, 1);
        assert_eq!(shares.share("060010001001009"), Some(0.0));
        assert_eq!(shares.share("060010001001000"), Some(1.0));
    }
}
