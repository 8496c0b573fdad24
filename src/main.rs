use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::env;
use std::path::{Path, PathBuf};

use georecon::{
    CascadeOrchestrator, Config, ControlTotalScaler, StepOutcome, aggregate, aggregate_parallel,
    io, logging, runtime,
};

struct RunArgs {
    config: PathBuf,
    table: PathBuf,
    targets: PathBuf,
    out: PathBuf,
}

fn usage() -> ! {
    eprintln!("usage: georecon <config.yaml> <table.npz> <targets.npz> [out.npz]");
    std::process::exit(1);
}

fn default_out_path(input: &Path) -> PathBuf {
    let parent = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("table");
    parent.join(format!("{stem}_reconciled.npz"))
}

fn parse_args() -> Result<RunArgs> {
    let mut args = env::args().skip(1);
    let config = PathBuf::from(args.next().unwrap_or_else(|| usage()));
    let table = PathBuf::from(args.next().unwrap_or_else(|| usage()));
    let targets = PathBuf::from(args.next().unwrap_or_else(|| usage()));
    for p in [&config, &table, &targets] {
        if !p.exists() {
            bail!("input {:?} does not exist", p);
        }
    }
    let out = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_out_path(&table));
    Ok(RunArgs {
        config,
        table,
        targets,
        out,
    })
}

fn main() -> Result<()> {
    let level = env::var("GEORECON_LOG").unwrap_or_else(|_| logging::default_log_level().into());
    logging::init_logging(&level)?;

    let args = parse_args()?;
    let cfg = Config::load(&args.config)?;
    if cfg.parallel {
        runtime::configure_thread_pool(cfg.threads);
    }

    let table_path = args.table.to_string_lossy().into_owned();
    let mut table = io::load_table(&table_path, "input", &cfg)?;
    info!(
        "event=input_loaded path={} rows={} resolution={}",
        table_path,
        table.len(),
        table.resolution()
    );

    if let Some(stage) = &cfg.aggregate {
        let cw_path = stage.crosswalk.to_string_lossy().into_owned();
        let (crosswalk, unit_maps) =
            io::load_crosswalk(&cw_path, table.resolution(), stage.target_resolution, &cfg)?;
        let vars: Vec<&str> = stage.variables.iter().map(|v| v.as_str()).collect();
        let (mut aggregated, _) = if cfg.parallel {
            aggregate_parallel(&table, &crosswalk, &vars)?
        } else {
            aggregate(&table, &crosswalk, &vars)?
        };
        for (label, map) in &unit_maps {
            aggregated = aggregated
                .with_label_from(label.as_str(), |k| map.parent_of(k).map(|p| p.to_string()))?;
        }
        table = aggregated;
    }

    let targets_path = args.targets.to_string_lossy().into_owned();
    let targets = io::load_targets(&targets_path, &cfg)?;

    let orchestrator =
        CascadeOrchestrator::new(cfg.cascade.clone(), ControlTotalScaler::from_config(&cfg));
    let pb = ProgressBar::new(orchestrator.steps().len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")
            .context("progress template")?
            .progress_chars("=>-"),
    );
    let (out, report) = orchestrator.run_with_progress(&table, &targets, &pb)?;

    for step in &report.steps {
        match &step.outcome {
            StepOutcome::Scaled(r) => info!(
                "event=step step={} scaled={} untargeted={} zero_base={} unchanged={}",
                step.name, r.scaled_units, r.untargeted_units, r.zero_base_units, r.unchanged_units
            ),
            StepOutcome::Skipped { reason } => {
                warn!("event=step step={} skipped={}", step.name, reason)
            }
        }
    }

    if let Some(parent) = args.out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    let out_path = args.out.to_string_lossy().into_owned();
    io::save_table(&out_path, &out, &cfg)?;
    info!("event=output_written path={} rows={}", out_path, out.len());
    Ok(())
}
