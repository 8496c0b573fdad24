use indicatif::ProgressBar;
use log::{info, warn};
use serde::Deserialize;

use super::scale::{ControlTotalScaler, ScaleReport};
use crate::error::{ReconError, ReconResult};
use crate::table::types::{ControlTarget, VariableGroup, VariableTable};

/// Where a step's per-unit target comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    /// A column of the shared target table, exposed as `{sum_variable}_target`.
    Column(String),
    /// `factor * Σ variable` over the unit's rows of the evolving table.
    Derived { variable: String, factor: f64 },
}

/// One scaling pass of the cascade.
#[derive(Debug, Clone, Deserialize)]
pub struct CascadeStep {
    pub name: String,
    pub group: VariableGroup,
    pub unit_key: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub target: TargetSource,
    /// Skip (with a warning) instead of failing when the target column is absent.
    #[serde(default)]
    pub allow_missing_target: bool,
}

impl CascadeStep {
    pub fn new(
        name: impl Into<String>,
        group: VariableGroup,
        unit_key: impl Into<String>,
        target: TargetSource,
    ) -> Self {
        Self {
            name: name.into(),
            group,
            unit_key: unit_key.into(),
            target,
            allow_missing_target: false,
        }
    }

    pub fn allow_missing_target(mut self) -> Self {
        self.allow_missing_target = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Scaled(ScaleReport),
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeReport {
    pub steps: Vec<StepReport>,
}

impl CascadeReport {
    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped { .. }))
    }
}

/// What the pre-flight check decided for each step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedStep {
    Run,
    Skip(String),
}

/// Ordered control-total passes; each pass consumes the previous pass's table.
#[derive(Debug, Clone)]
pub struct CascadeOrchestrator {
    steps: Vec<CascadeStep>,
    scaler: ControlTotalScaler,
}

impl CascadeOrchestrator {
    pub fn new(steps: Vec<CascadeStep>, scaler: ControlTotalScaler) -> Self {
        Self { steps, scaler }
    }

    pub fn steps(&self) -> &[CascadeStep] {
        &self.steps
    }

    /// Checks the whole cascade before any work is done.
    ///
    /// # Errors
    /// - `MissingColumn` when a group variable, a derived-target variable or a
    ///   unit label is absent from `table`.
    /// - `MissingTargetColumn` when a target column is absent and the step
    ///   does not allow it.
    /// - `CascadeOrder` when a derived target reads a variable that a later
    ///   step rescales.
    /// - `InvalidConfig` for a non-finite or negative derivation factor.
    pub fn plan(
        &self,
        table: &VariableTable,
        targets: &ControlTarget,
    ) -> ReconResult<Vec<PlannedStep>> {
        let mut plan = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            step.group.validate_against(table)?;
            table.label(&step.unit_key)?;

            match &step.target {
                TargetSource::Column(col) => {
                    if targets.has_column(col) {
                        plan.push(PlannedStep::Run);
                    } else if step.allow_missing_target {
                        plan.push(PlannedStep::Skip(format!("target column `{col}` absent")));
                    } else {
                        return Err(ReconError::MissingTargetColumn { column: col.clone() });
                    }
                }
                TargetSource::Derived { variable, factor } => {
                    if !factor.is_finite() || *factor < 0.0 {
                        return Err(ReconError::InvalidConfig(format!(
                            "step `{}` has derivation factor {factor}",
                            step.name
                        )));
                    }
                    table.require_columns([variable.as_str()])?;
                    if let Some(later) = self.steps[i + 1..]
                        .iter()
                        .find(|s| s.group.contains(variable))
                    {
                        return Err(ReconError::CascadeOrder {
                            step: step.name.clone(),
                            variable: variable.clone(),
                            producer: later.name.clone(),
                        });
                    }
                    plan.push(PlannedStep::Run);
                }
            }
        }
        Ok(plan)
    }

    /// Target table for `step` against the table as it stands now.
    fn step_targets(
        step: &CascadeStep,
        table: &VariableTable,
        targets: &ControlTarget,
    ) -> ReconResult<ControlTarget> {
        let as_column = step.group.target_column();
        match &step.target {
            TargetSource::Column(col) => targets.view(col, &as_column),
            TargetSource::Derived { variable, factor } => {
                let values = table.column(variable)?;
                let per_unit = table
                    .rows_by_label(&step.unit_key)?
                    .into_iter()
                    .filter(|(unit, _)| !unit.is_empty())
                    .map(|(unit, rows)| {
                        let base: f64 = rows.iter().map(|&r| values[r]).sum();
                        (unit.to_string(), factor * base)
                    });
                ControlTarget::from_values(as_column, per_unit)
            }
        }
    }

    pub fn run(
        &self,
        table: &VariableTable,
        targets: &ControlTarget,
    ) -> ReconResult<(VariableTable, CascadeReport)> {
        self.run_with_progress(table, targets, &ProgressBar::hidden())
    }

    /// Runs every planned step in order; `pb` advances once per step.
    pub fn run_with_progress(
        &self,
        table: &VariableTable,
        targets: &ControlTarget,
        pb: &ProgressBar,
    ) -> ReconResult<(VariableTable, CascadeReport)> {
        let plan = self.plan(table, targets)?;
        pb.set_length(self.steps.len() as u64);

        let mut current = table.clone();
        let mut report = CascadeReport::default();
        for (step, planned) in self.steps.iter().zip(plan) {
            pb.set_message(step.name.clone());
            let outcome = match planned {
                PlannedStep::Skip(reason) => {
                    warn!(
                        "event=cascade_step_skipped module=cascade step={} reason={}",
                        step.name, reason
                    );
                    StepOutcome::Skipped { reason }
                }
                PlannedStep::Run => {
                    let step_targets = Self::step_targets(step, &current, targets)?;
                    let (next, scaled) = self.scaler.scale_to_target(
                        &current,
                        &step.group,
                        &step_targets,
                        &step.unit_key,
                    )?;
                    current = next;
                    StepOutcome::Scaled(scaled)
                }
            };
            report.steps.push(StepReport {
                name: step.name.clone(),
                outcome,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            "event=cascade_done module=cascade steps={} skipped={}",
            report.steps.len(),
            report.skipped().count()
        );
        Ok((current, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::key::{GeoKey, Resolution};

    fn table() -> VariableTable {
        VariableTable::new(
            "taz",
            Resolution::Taz,
            ["1", "2"].iter().map(|&k| GeoKey::from(k)).collect(),
        )
        .unwrap()
        .with_label("county", vec!["Napa".into(), "Napa".into()])
        .unwrap()
        .with_column("gqpop", vec![60.0, 40.0])
        .unwrap()
        .with_column("gq_a", vec![30.0, 20.0])
        .unwrap()
        .with_column("gq_b", vec![30.0, 20.0])
        .unwrap()
        .with_column("gq_emp", vec![20.0, 10.0])
        .unwrap()
        .with_column("gq_emp_x", vec![20.0, 10.0])
        .unwrap()
    }

    fn gq() -> VariableGroup {
        VariableGroup::new("gq", "gqpop", ["gq_a", "gq_b"]).unwrap()
    }

    fn emp() -> VariableGroup {
        VariableGroup::new("gq_emp", "gq_emp", ["gq_emp_x"]).unwrap()
    }

    fn targets() -> ControlTarget {
        ControlTarget::from_values("GQPOP_target", vec![("Napa".to_string(), 200.0)]).unwrap()
    }

    #[test]
    fn derived_target_reads_the_already_scaled_table() {
        let steps = vec![
            CascadeStep::new("gq", gq(), "county", TargetSource::Column("GQPOP_target".into())),
            CascadeStep::new(
                "gq_emp",
                emp(),
                "county",
                TargetSource::Derived {
                    variable: "gqpop".into(),
                    factor: 0.5,
                },
            ),
        ];
        let (out, report) = CascadeOrchestrator::new(steps, ControlTotalScaler::default())
            .run(&table(), &targets())
            .unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(out.total("gqpop").unwrap(), 200.0);
        assert_eq!(out.total("gq_emp").unwrap(), 100.0);
    }

    #[test]
    fn derived_target_from_a_later_step_is_rejected_up_front() {
        let steps = vec![
            CascadeStep::new(
                "gq_emp",
                emp(),
                "county",
                TargetSource::Derived {
                    variable: "gqpop".into(),
                    factor: 0.5,
                },
            ),
            CascadeStep::new("gq", gq(), "county", TargetSource::Column("GQPOP_target".into())),
        ];
        let err = CascadeOrchestrator::new(steps, ControlTotalScaler::default())
            .run(&table(), &targets())
            .unwrap_err();
        assert!(matches!(err, ReconError::CascadeOrder { producer, .. } if producer == "gq"));
    }

    #[test]
    fn missing_target_columns_fail_unless_allowed() {
        let strict = vec![CascadeStep::new(
            "gq",
            gq(),
            "county",
            TargetSource::Column("EMPRES_target".into()),
        )];
        let orch = CascadeOrchestrator::new(strict, ControlTotalScaler::default());
        assert!(matches!(
            orch.plan(&table(), &targets()),
            Err(ReconError::MissingTargetColumn { .. })
        ));

        let lenient = vec![
            CascadeStep::new("gq", gq(), "county", TargetSource::Column("EMPRES_target".into()))
                .allow_missing_target(),
        ];
        let (out, report) = CascadeOrchestrator::new(lenient, ControlTotalScaler::default())
            .run(&table(), &targets())
            .unwrap();
        assert_eq!(report.skipped().count(), 1);
        assert_eq!(out, table());
    }
}
