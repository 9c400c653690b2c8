use crate::progress::ProgressHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Extract,
    Export,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Export => "export",
        }
    }
}

/// Pool size for `stage`. An explicit request wins (at least one worker).
pub fn workers_for(stage: Stage, requested: Option<usize>, progress: &ProgressHandle) -> usize {
    let cores = num_cpus::get().max(1);
    let workers = pick_workers(stage, requested, cores);
    progress.log(format!(
        "Auto-tune ({}): cores={} requested={} workers={}",
        stage.as_str(),
        cores,
        requested.map(|n| n.to_string()).unwrap_or_else(|| "auto".to_string()),
        workers
    ));
    workers
}

fn pick_workers(stage: Stage, requested: Option<usize>, cores: usize) -> usize {
    if let Some(n) = requested {
        return n.max(1);
    }
    match stage {
        // Network bound; the fetcher does its own buffering.
        Stage::Download => 8,
        // One decoder process per worker, each already multi-threaded.
        Stage::Extract => (cores / 2).clamp(1, 16),
        Stage::Export => cores.clamp(1, 32),
    }
}
