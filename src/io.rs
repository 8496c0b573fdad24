//! npz table bundles.
//!
//! Table layout: `meta_resolution` (i32, one value), `keys` (u64 GEOIDs or
//! zone numbers), `col_<name>` (f64) and `label_<name>` (i64 codes).
//! Target layout: `unit_keys` (i64) plus `col_<name>_target` (f64).
//! Crosswalk layout: `fine`, `target` (u64), optional `weight` and
//! `population` (f64), optional `label_<name>` (i64 unit code per target).
//!
//! Label code `-1` stands for a row with no unit (an empty label).

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use ndarray::Array1;
use ndarray_npy::{NpzReader, NpzWriter, ReadableElement};
use std::fs::File;

use crate::config::{Config, Fips};
use crate::geo::crosswalk::{Crosswalk, CrosswalkRow, ParentMap};
use crate::geo::key::{GeoKey, GeoKeyDeriver, Resolution};
use crate::table::types::{ControlTarget, VariableTable};

type Reader = NpzReader<File>;

const UNMATCHED_CODE: i64 = -1;

fn open(path: &str) -> Result<Reader> {
    let f = File::open(path).with_context(|| format!("open {}", path))?;
    NpzReader::new(f).with_context(|| format!("read npz {}", path))
}

fn entry_names(npz: &mut Reader) -> Result<Vec<String>> {
    let mut names: Vec<String> = npz
        .names()
        .context("list npz entries")?
        .into_iter()
        .map(|n| n.strip_suffix(".npy").unwrap_or(&n).to_string())
        .collect();
    names.sort_unstable();
    Ok(names)
}

fn read<T: ReadableElement>(npz: &mut Reader, name: &str) -> Result<Array1<T>> {
    let arr: Array1<T> = npz
        .by_name(&format!("{name}.npy"))
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

fn label_value(fips: &Fips, label: &str, code: i64) -> String {
    if code == UNMATCHED_CODE {
        String::new()
    } else if label == fips.label_column {
        fips.county_label(code)
    } else {
        code.to_string()
    }
}

pub fn load_table(path: &str, name: &str, cfg: &Config) -> Result<VariableTable> {
    let mut npz = open(path)?;
    let names = entry_names(&mut npz)?;

    let code = read::<i32>(&mut npz, "meta_resolution")?;
    let resolution = code
        .first()
        .copied()
        .and_then(Resolution::from_code)
        .with_context(|| format!("{}: bad meta_resolution", path))?;

    let deriver = GeoKeyDeriver::new(cfg.key_widths);
    let keys = read::<u64>(&mut npz, "keys")?
        .iter()
        .map(|&k| deriver.from_numeric(k, resolution))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("{}: keys", path))?;
    let mut table = VariableTable::new(name, resolution, keys)?;

    for entry in &names {
        if let Some(col) = entry.strip_prefix("col_") {
            let values = read::<f64>(&mut npz, entry)?;
            let var = cfg.variable_for_source(col).unwrap_or(col);
            table.set_column(var, values)?;
        } else if let Some(label) = entry.strip_prefix("label_") {
            let values = read::<i64>(&mut npz, entry)?
                .iter()
                .map(|&c| label_value(&cfg.fips, label, c))
                .collect();
            table = table.with_label(label, values)?;
        }
    }
    debug!(
        "event=table_loaded module=io path={} rows={} columns={}",
        path,
        table.len(),
        table.column_names().count()
    );
    Ok(table)
}

pub fn save_table(path: &str, table: &VariableTable, cfg: &Config) -> Result<()> {
    let keys = table
        .keys()
        .iter()
        .map(|k| {
            k.as_str()
                .parse::<u64>()
                .with_context(|| format!("key `{}` is not numeric", k))
        })
        .collect::<Result<Vec<u64>>>()?;

    let f = File::create(path).with_context(|| format!("create {}", path))?;
    let mut npz = NpzWriter::new(f);
    npz.add_array(
        "meta_resolution.npy",
        &Array1::from_vec(vec![table.resolution().code()]),
    )?;
    npz.add_array("keys.npy", &Array1::from_vec(keys))?;

    for name in table.column_names() {
        npz.add_array(format!("col_{name}.npy"), table.column(name)?)?;
    }
    for name in table.label_names() {
        let codes: Option<Vec<i64>> = table
            .label(name)?
            .iter()
            .map(|v| {
                if v.is_empty() {
                    Some(UNMATCHED_CODE)
                } else if name == cfg.fips.label_column {
                    cfg.fips.county_code(v)
                } else {
                    v.parse().ok()
                }
            })
            .collect();
        match codes {
            Some(codes) => npz.add_array(format!("label_{name}.npy"), &Array1::from_vec(codes))?,
            None => warn!(
                "event=label_not_saved module=io label={} reason=non_numeric",
                name
            ),
        }
    }

    npz.finish()?;
    Ok(())
}

pub fn load_targets(path: &str, cfg: &Config) -> Result<ControlTarget> {
    let mut npz = open(path)?;
    let names = entry_names(&mut npz)?;
    let units = read::<i64>(&mut npz, "unit_keys")?
        .iter()
        .map(|&c| cfg.fips.county_label(c))
        .collect();
    let mut targets = ControlTarget::new(units)?;
    for entry in &names {
        if let Some(col) = entry.strip_prefix("col_") {
            let values = read::<f64>(&mut npz, entry)?.to_vec();
            targets = targets.with_column(col, values)?;
        }
    }
    Ok(targets)
}

/// Crosswalk plus, per `label_<name>` entry, a target -> unit map.
pub fn load_crosswalk(
    path: &str,
    source: Resolution,
    target_resolution: Resolution,
    cfg: &Config,
) -> Result<(Crosswalk, Vec<(String, ParentMap)>)> {
    let mut npz = open(path)?;
    let names = entry_names(&mut npz)?;
    let deriver = GeoKeyDeriver::new(cfg.key_widths);

    let fine = read::<u64>(&mut npz, "fine")?;
    let target = read::<u64>(&mut npz, "target")?;
    if fine.len() != target.len() {
        bail!("{}: fine/target length mismatch", path);
    }
    let optional = |npz: &mut Reader, entry: &str| -> Result<Option<Array1<f64>>> {
        if names.iter().any(|n| n == entry) {
            Ok(Some(read::<f64>(npz, entry)?))
        } else {
            Ok(None)
        }
    };
    let weight = optional(&mut npz, "weight")?;
    let population = optional(&mut npz, "population")?;

    let mut rows = Vec::with_capacity(fine.len());
    let mut target_keys = Vec::with_capacity(fine.len());
    for i in 0..fine.len() {
        let row = CrosswalkRow {
            fine: deriver.from_numeric(fine[i], source)?,
            target: deriver.from_numeric(target[i], target_resolution)?,
            weight: weight.as_ref().map(|w| w[i]),
            population: population.as_ref().map(|p| p[i]),
        };
        target_keys.push(row.target.clone());
        rows.push(row);
    }
    let crosswalk = Crosswalk::from_rows(&rows, target_resolution, cfg.crosswalk_weighting)?;

    let mut unit_maps = Vec::new();
    for entry in &names {
        if let Some(label) = entry.strip_prefix("label_") {
            let codes = read::<i64>(&mut npz, entry)?;
            let pairs = target_keys
                .iter()
                .zip(codes.iter())
                .filter(|&(_, &c)| c != UNMATCHED_CODE)
                .map(|(t, &c)| (t.clone(), GeoKey::from(label_value(&cfg.fips, label, c))));
            let map = ParentMap::from_pairs(pairs, target_resolution, Resolution::County)?;
            unit_maps.push((label.to_string(), map));
        }
    }
    Ok((crosswalk, unit_maps))
}
