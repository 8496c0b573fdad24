use log::{info, warn};
use rayon::ThreadPoolBuilder;
use std::sync::Once;

const ENV_HINTS: [&str; 4] = [
    "GEORECON_THREADS",
    "RAYON_NUM_THREADS",
    "SLURM_CPUS_PER_TASK",
    "OMP_NUM_THREADS",
];

#[derive(Debug, PartialEq, Eq)]
struct ThreadConfig {
    count: usize,
    source: &'static str,
}

fn env_hint(keys: &[&'static str]) -> Option<ThreadConfig> {
    keys.iter().find_map(|&key| {
        let count = std::env::var(key).ok()?.trim().parse::<usize>().ok()?;
        (count > 0).then_some(ThreadConfig { count, source: key })
    })
}

/// Config value first, then the first positive env hint, then the core count.
fn detect_thread_config(explicit: Option<usize>) -> ThreadConfig {
    if let Some(count) = explicit.filter(|&n| n > 0) {
        return ThreadConfig {
            count,
            source: "config",
        };
    }
    env_hint(&ENV_HINTS).unwrap_or_else(|| ThreadConfig {
        count: std::thread::available_parallelism().map_or(1, |n| n.get()),
        source: "available_parallelism",
    })
}

/// Sizes the global rayon pool used by the parallel aggregation fold.
/// Only the first call has any effect.
pub fn configure_thread_pool(explicit: Option<usize>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let cfg = detect_thread_config(explicit);
        let built = ThreadPoolBuilder::new()
            .num_threads(cfg.count)
            .thread_name(|i| format!("georecon-agg-{i}"))
            .build_global();
        if let Err(err) = built {
            warn!(
                "event=thread_pool module=runtime status=default reason={}",
                err
            );
            return;
        }
        info!(
            "event=thread_pool module=runtime threads={} hint={}",
            cfg.count, cfg.source
        );
    });
}
