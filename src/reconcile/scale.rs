use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::rounding::{Correction, reconcile_to_total, round_half_even};
use crate::config::Config;
use crate::error::ReconResult;
use crate::table::types::{ControlTarget, VariableGroup, VariableTable, is_whole};

/// Whether the rows of a scaled unit must also add up to the rounded target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTotal {
    /// Row sums are reconciled to `round(target)` before partials are.
    #[default]
    Exact,
    /// Each row's sum is rounded on its own.
    RowsOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub scaled_units: usize,
    /// Units in the table with no (or a NaN/negative) target; passed through.
    pub untargeted_units: usize,
    /// Units whose current total is 0; left at zero.
    pub zero_base_units: usize,
    /// Units already within epsilon of their target.
    pub unchanged_units: usize,
    pub rows_written: usize,
    /// Rows whose partials needed the proportional correction.
    pub proportional_rows: usize,
    /// Passed-through rows that were not whole and consistent, rounded in place.
    pub settled_rows: usize,
}

/// Multiplicative raking of one variable group to per-unit control totals.
#[derive(Debug, Clone, Copy)]
pub struct ControlTotalScaler {
    epsilon: f64,
    unit_total: UnitTotal,
}

impl Default for ControlTotalScaler {
    fn default() -> Self {
        Self {
            epsilon: 1e-4,
            unit_total: UnitTotal::Exact,
        }
    }
}

impl ControlTotalScaler {
    pub fn new(epsilon: f64, unit_total: UnitTotal) -> Self {
        Self {
            epsilon,
            unit_total,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.scale_epsilon, cfg.unit_total)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Scales `group` so each unit of `unit_key_col` meets its
    /// `{sum_variable}_target`, then restores `sum == Σ partials` per row.
    ///
    /// Rows left unscaled (no target, zero base, already met) come back as
    /// whole numbers too: a fractional or inconsistent row is rounded and its
    /// partials reconciled to `round(sum)`. Whole consistent rows are untouched.
    ///
    /// # Errors
    /// - `MissingTargetColumn` when `targets` lacks `{sum_variable}_target`.
    /// - `MissingColumn` when the table lacks a group variable or the unit label.
    pub fn scale_to_target(
        &self,
        table: &VariableTable,
        group: &VariableGroup,
        targets: &ControlTarget,
        unit_key_col: &str,
    ) -> ReconResult<(VariableTable, ScaleReport)> {
        let target_col = group.target_column();
        targets.column(&target_col)?;
        group.validate_against(table)?;
        let units = table.rows_by_label(unit_key_col)?;

        let mut sum = table.column(group.sum_variable())?.to_vec();
        let mut parts: Vec<Vec<f64>> = group
            .partials()
            .iter()
            .map(|p| table.column(p).map(|c| c.to_vec()))
            .collect::<ReconResult<_>>()?;
        let mut report = ScaleReport::default();
        let mut written = vec![false; table.len()];

        for (unit, rows) in &units {
            let target = match targets.target(unit, &target_col)? {
                Some(t) if t >= 0.0 => t,
                Some(t) => {
                    warn!(
                        "event=scale_negative_target module=scale group={} unit={} target={}",
                        group.name(),
                        unit,
                        t
                    );
                    report.untargeted_units += 1;
                    continue;
                }
                None => {
                    report.untargeted_units += 1;
                    continue;
                }
            };

            let current: f64 = rows.iter().map(|&r| sum[r]).sum();
            if current == 0.0 {
                if target != 0.0 {
                    warn!(
                        "event=scale_zero_base module=scale group={} unit={} target={}",
                        group.name(),
                        unit,
                        target
                    );
                }
                report.zero_base_units += 1;
                continue;
            }

            let scale = target / current;
            if (scale - 1.0).abs() < self.epsilon {
                report.unchanged_units += 1;
                continue;
            }
            debug!(
                "event=scale_unit module=scale group={} unit={} current={} target={} factor={:.6}",
                group.name(),
                unit,
                current,
                target,
                scale
            );

            let raw: Vec<f64> = rows.iter().map(|&r| sum[r] * scale).collect();
            let row_totals: Vec<i64> = match self.unit_total {
                UnitTotal::Exact => reconcile_to_total(round_half_even(target), &raw)
                    .values
                    .into_vec(),
                UnitTotal::RowsOnly => raw.iter().map(|&x| round_half_even(x)).collect(),
            };

            for (&r, &total) in rows.iter().zip(&row_totals) {
                let scaled: Vec<f64> = parts.iter().map(|col| col[r] * scale).collect();
                let fixed = reconcile_to_total(total, &scaled);
                if fixed.correction == Correction::Proportional {
                    report.proportional_rows += 1;
                }
                sum[r] = total as f64;
                for (col, q) in parts.iter_mut().zip(&fixed.values) {
                    col[r] = *q as f64;
                }
                written[r] = true;
                report.rows_written += 1;
            }
            report.scaled_units += 1;
        }

        for r in (0..table.len()).filter(|&r| !written[r]) {
            let row: Vec<f64> = parts.iter().map(|col| col[r]).collect();
            let consistent = is_whole(sum[r])
                && row.iter().all(|&p| is_whole(p))
                && row.iter().sum::<f64>() == sum[r];
            if consistent {
                continue;
            }
            let total = round_half_even(sum[r]);
            let fixed = reconcile_to_total(total, &row);
            sum[r] = total as f64;
            for (col, q) in parts.iter_mut().zip(&fixed.values) {
                col[r] = *q as f64;
            }
            report.settled_rows += 1;
        }

        let mut out = table.clone();
        out.set_column(group.sum_variable(), sum.into())?;
        for (name, col) in group.partials().iter().zip(parts) {
            out.set_column(name.as_str(), col.into())?;
        }

        info!(
            "event=scale_done module=scale group={} scaled={} untargeted={} zero_base={} unchanged={} proportional_rows={} settled_rows={}",
            group.name(),
            report.scaled_units,
            report.untargeted_units,
            report.zero_base_units,
            report.unchanged_units,
            report.proportional_rows,
            report.settled_rows
        );
        Ok((out, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconError;
    use crate::geo::key::{GeoKey, Resolution};

    fn gq_table() -> VariableTable {
        VariableTable::new(
            "taz",
            Resolution::Taz,
            ["1", "2", "3", "4"].iter().map(|&k| GeoKey::from(k)).collect(),
        )
        .unwrap()
        .with_label(
            "county",
            vec!["Alameda".into(), "Alameda".into(), "Alameda".into(), "Marin".into()],
        )
        .unwrap()
        .with_column("gqpop", vec![1001.0, 1499.0, 1500.0, 10.0])
        .unwrap()
        .with_column("gq_univ", vec![501.0, 700.0, 100.0, 5.0])
        .unwrap()
        .with_column("gq_mil", vec![300.0, 0.0, 400.0, 5.0])
        .unwrap()
        .with_column("gq_othnon", vec![200.0, 799.0, 1000.0, 0.0])
        .unwrap()
    }

    fn gq_group() -> VariableGroup {
        VariableGroup::new("gq", "gqpop", ["gq_univ", "gq_mil", "gq_othnon"]).unwrap()
    }

    fn targets(value: f64) -> ControlTarget {
        ControlTarget::from_values("gqpop_target", vec![("Alameda".to_string(), value)]).unwrap()
    }

    #[test]
    fn scales_unit_and_keeps_rows_consistent() {
        let (out, report) = ControlTotalScaler::default()
            .scale_to_target(&gq_table(), &gq_group(), &targets(5000.0), "county")
            .unwrap();
        assert_eq!(report.scaled_units, 1);
        assert_eq!(report.untargeted_units, 1);
        assert_eq!(report.rows_written, 3);
        assert!(gq_group().violations(&out).unwrap().is_empty());
        let alameda: f64 = (0..3).map(|r| out.column("gqpop").unwrap()[r]).sum();
        assert_eq!(alameda, 5000.0);
        // Marin passes through
        assert_eq!(out.value("4", "gqpop"), Some(10.0));
    }

    #[test]
    fn met_target_is_a_no_op() {
        let table = gq_table();
        let (out, report) = ControlTotalScaler::default()
            .scale_to_target(&table, &gq_group(), &targets(4000.0), "county")
            .unwrap();
        assert_eq!(report.unchanged_units, 1);
        assert_eq!(out, table);
    }

    #[test]
    fn missing_target_column_is_fatal() {
        let wrong = ControlTarget::from_values("GQPOP", vec![("Alameda".to_string(), 1.0)]).unwrap();
        let err = ControlTotalScaler::default()
            .scale_to_target(&gq_table(), &gq_group(), &wrong, "county")
            .unwrap_err();
        assert!(matches!(err, ReconError::MissingTargetColumn { column } if column == "gqpop_target"));
    }

    #[test]
    fn untargeted_fractional_rows_come_back_whole() {
        let table = gq_table()
            .with_column("gqpop", vec![1001.0, 1499.0, 1500.0, 3.0])
            .unwrap()
            .with_column("gq_univ", vec![501.0, 700.0, 100.0, 1.5])
            .unwrap()
            .with_column("gq_mil", vec![300.0, 0.0, 400.0, 1.5])
            .unwrap();
        let (out, report) = ControlTotalScaler::default()
            .scale_to_target(&table, &gq_group(), &targets(5000.0), "county")
            .unwrap();
        assert_eq!(report.settled_rows, 1);
        assert!(gq_group().violations(&out).unwrap().is_empty());
        assert_eq!(out.value("4", "gqpop"), Some(3.0));
        assert_eq!(out.value("4", "gq_univ"), Some(1.0));
        assert_eq!(out.value("4", "gq_mil"), Some(2.0));
    }

    #[test]
    fn rows_only_rounds_each_row_independently() {
        let scaler = ControlTotalScaler::new(1e-4, UnitTotal::RowsOnly);
        let (out, _) = scaler
            .scale_to_target(&gq_table(), &gq_group(), &targets(5000.0), "county")
            .unwrap();
        // 1001 * 1.25 = 1251.25, 1499 * 1.25 = 1873.75
        assert_eq!(out.value("1", "gqpop"), Some(1251.0));
        assert_eq!(out.value("2", "gqpop"), Some(1874.0));
        assert!(gq_group().violations(&out).unwrap().is_empty());
    }
}
