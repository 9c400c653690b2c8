use anyhow::{Context, Result};
use clap::ValueEnum;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;
const MAX_SHOWN_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Append-only log file shared by every reporter of a run.
///
/// Lines look like `2024-01-31 12:00:00 | INFO | extract | 4242 | message`.
pub struct LogSink {
    out: Mutex<BufWriter<File>>,
}

impl LogSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {:?}", path))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line(&self, level: Level, label: &str, message: &str) {
        let line = format_log_line(
            &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level,
            label,
            std::process::id(),
            message,
        );
        let mut out = self.out.lock().unwrap();
        // Write failures are dropped; the console still has the message.
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

fn format_log_line(stamp: &str, level: Level, label: &str, pid: u32, message: &str) -> String {
    format!("{} | {} | {} | {} | {}", stamp, level.as_str(), label, pid, message)
}

#[derive(Clone)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    pub log_sink: Option<Arc<LogSink>>,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(120),
            plain_interval: Duration::from_secs(2),
            log_sink: None,
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_log_sink(mut self, sink: Option<Arc<LogSink>>) -> Self {
        self.log_sink = sink;
        self
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(&self) -> ResolvedProgressMode {
        self.mode.resolve(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

impl ProgressMode {
    fn resolve(self, stderr_is_tty: bool) -> ResolvedProgressMode {
        match self {
            ProgressMode::Auto => {
                if stderr_is_tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub output_dir: PathBuf,
    pub splits: Vec<String>,
    pub metadata_files: usize,
    pub parse_failures: usize,
    pub videos: usize,
    pub videos_fetched: usize,
    pub videos_skipped: usize,
    pub videos_failed: usize,
    pub sequences_listed: usize,
    pub sequences_dropped: usize,
    pub workers: usize,
    pub elapsed: Duration,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractSummary {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub resume: String,
    pub sequences: usize,
    pub extracted: usize,
    pub already_complete: usize,
    pub failed: usize,
    pub frames_written: u64,
    pub sequences_listed: usize,
    pub sequences_dropped: usize,
    pub workers: usize,
    pub elapsed: Duration,
    pub avg_items_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub sequences: usize,
    pub written: usize,
    pub failed: usize,
    pub manifest_entries: usize,
    pub workers: usize,
    pub elapsed: Duration,
    pub avg_items_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub total_items: u64,
    pub processed_items: u64,
    pub avg_items_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// What both renderers draw from.
#[derive(Debug, Clone)]
struct Snapshot {
    stage: String,
    processed: u64,
    total: u64,
    elapsed: Duration,
    rate: f64,
    in_flight: Vec<String>,
}

impl Snapshot {
    fn in_flight_display(&self) -> String {
        if self.in_flight.is_empty() {
            "-".to_string()
        } else {
            self.in_flight.join(",")
        }
    }
}

/// Cloneable handle passed into every component that reports progress or logs.
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<Shared>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

struct Shared {
    label: String,
    mode: ResolvedProgressMode,
    idle_threshold: Duration,
    plain_interval: Duration,
    log_sink: Option<Arc<LogSink>>,
    bar: Option<ProgressBar>,
    state: Mutex<State>,
    stop: AtomicBool,
    finalized: AtomicBool,
}

#[derive(Debug)]
struct State {
    started: Instant,
    stage: String,
    total: u64,
    processed: u64,
    last_progress: Instant,
    last_plain_emit: Instant,
    last_idle_warn: Option<Instant>,
    /// Worker slot -> key of the item it is working on.
    in_flight: HashMap<String, String>,
    warnings: VecDeque<String>,
    warning_total: usize,
}

impl State {
    fn push_warning(&mut self, message: &str) {
        self.warning_total += 1;
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.pop_front();
        }
        self.warnings.push_back(message.to_string());
    }

    fn snapshot(&self) -> Snapshot {
        let elapsed = self.started.elapsed();
        let mut in_flight = self.in_flight.values().cloned().collect::<Vec<_>>();
        in_flight.sort();
        in_flight.truncate(MAX_SHOWN_IN_FLIGHT);
        Snapshot {
            stage: self.stage.clone(),
            processed: self.processed,
            total: self.total,
            elapsed,
            rate: average_rate(self.processed, elapsed),
            in_flight,
        }
    }

    fn outcome(&self) -> ProgressOutcome {
        let elapsed = self.started.elapsed();
        ProgressOutcome {
            elapsed,
            total_items: self.total,
            processed_items: self.processed,
            avg_items_per_sec: average_rate(self.processed, elapsed),
            warning_count: self.warning_total,
            warnings: self.warnings.iter().cloned().collect(),
        }
    }
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, total_items: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();

        let bar = (mode == ResolvedProgressMode::Rich).then(|| item_bar(&label, total_items));

        let inner = Arc::new(Shared {
            label,
            mode,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            log_sink: config.log_sink.clone(),
            bar,
            state: Mutex::new(State {
                started: now,
                stage: "starting".to_string(),
                total: total_items,
                processed: 0,
                last_progress: now,
                last_plain_emit: now.checked_sub(config.plain_interval).unwrap_or(now),
                last_idle_warn: None,
                in_flight: HashMap::new(),
                warnings: VecDeque::new(),
                warning_total: 0,
            }),
            stop: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        let ticker_inner = Arc::clone(&inner);
        let ticker = thread::spawn(move || {
            while !ticker_inner.stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(250));
                ticker_inner.tick();
            }
        });

        Self {
            handle: ProgressHandle { inner },
            ticker: Some(ticker),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.shutdown_ticker();
        self.handle.inner.finalize(Some(final_message.into()))
    }

    fn shutdown_ticker(&mut self) {
        self.handle.inner.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown_ticker();
        let _ = self.handle.inner.finalize(None);
    }
}

impl ProgressHandle {
    pub fn set_total_items(&self, total_items: u64) {
        self.update(true, |state| state.total = total_items);
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        self.update(true, |state| state.stage = stage);
    }

    /// Marks `key` as in flight on worker `slot`.
    pub fn start_item(&self, slot: &str, key: &str) {
        self.update(false, |state| {
            state.in_flight.insert(slot.to_string(), key.to_string());
        });
    }

    /// Counts the item on `slot` as processed, whatever its result.
    pub fn finish_item(&self, slot: &str) {
        self.update(false, |state| {
            state.in_flight.remove(slot);
            state.processed = state.processed.saturating_add(1);
            if state.total > 0 {
                state.processed = state.processed.min(state.total);
            }
            state.last_progress = Instant::now();
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.inner.emit(Level::Info, &message.into());
    }

    /// Logs and keeps the message in the stage warnings.
    pub fn warn(&self, message: impl Into<String>) {
        self.record_warning(Level::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record_warning(Level::Error, message.into());
    }

    fn record_warning(&self, level: Level, message: String) {
        self.inner.state.lock().unwrap().push_warning(&message);
        self.inner.emit(level, &message);
    }

    fn update(&self, force_plain: bool, apply: impl FnOnce(&mut State)) {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            apply(&mut state);
            state.snapshot()
        };
        self.inner.render(&snapshot, force_plain);
    }
}

impl Shared {
    fn tick(&self) {
        let (snapshot, plain_due, idle_warning) = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();

            let plain_due = now.duration_since(state.last_plain_emit) >= self.plain_interval;
            if plain_due {
                state.last_plain_emit = now;
            }

            let idle_warning = idle_warning_due(
                now,
                state.last_progress,
                state.last_idle_warn,
                self.idle_threshold,
                state.processed,
                state.total,
            )
            .then(|| {
                state.last_idle_warn = Some(now);
                let msg = format!(
                    "IDLE WARNING: no item finished for {}s (stage={}, in flight={})",
                    now.duration_since(state.last_progress).as_secs(),
                    state.stage,
                    state.snapshot().in_flight_display()
                );
                state.push_warning(&msg);
                msg
            });

            (state.snapshot(), plain_due, idle_warning)
        };

        self.render(&snapshot, plain_due);
        if let Some(msg) = idle_warning {
            self.emit(Level::Warn, &msg);
        }
    }

    fn render(&self, snapshot: &Snapshot, force_plain: bool) {
        match self.mode {
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.set_length(snapshot.total.max(1));
                    bar.set_position(snapshot.processed.min(snapshot.total.max(1)));
                    bar.set_message(format!(
                        "{} | {} | in flight: {}",
                        snapshot.stage,
                        format_rate(snapshot.rate),
                        snapshot.in_flight_display()
                    ));
                }
            }
            ResolvedProgressMode::Plain if force_plain => {
                eprintln!("{}", plain_line(&self.label, snapshot));
            }
            _ => {}
        }
    }

    fn emit(&self, level: Level, message: &str) {
        if let Some(sink) = &self.log_sink {
            sink.write_line(level, &self.label, message);
        }
        let line = format!("[{}] {}: {}", level.as_str(), self.label, message);
        match (self.mode, &self.bar) {
            (ResolvedProgressMode::Quiet, _) => {}
            (ResolvedProgressMode::Rich, Some(bar)) => bar.println(line),
            _ => eprintln!("{}", line),
        }
    }

    fn finalize(&self, final_message: Option<String>) -> ProgressOutcome {
        let (snapshot, outcome) = {
            let state = self.state.lock().unwrap();
            (state.snapshot(), state.outcome())
        };
        if self.finalized.swap(true, Ordering::Relaxed) {
            return outcome;
        }

        if let (Some(sink), Some(msg)) = (&self.log_sink, final_message.as_deref()) {
            sink.write_line(Level::Info, &self.label, msg);
        }

        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("{}", plain_line(&self.label, &snapshot));
                if let Some(msg) = final_message.as_deref() {
                    eprintln!("[DONE] {}: {}", self.label, msg);
                }
            }
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    match final_message {
                        Some(msg) => bar.finish_with_message(format!(
                            "{} ({} in {})",
                            msg,
                            HumanCount(snapshot.processed),
                            format_duration(snapshot.elapsed)
                        )),
                        None => bar.finish_and_clear(),
                    }
                }
            }
        }

        outcome
    }
}

fn item_bar(label: &str, total_items: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_items.max(1));
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {prefix:.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} ETA {eta} | {msg}",
        )
        .expect("valid progress template"),
    );
    bar.set_prefix(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn plain_line(label: &str, snapshot: &Snapshot) -> String {
    let pct = if snapshot.total == 0 {
        0.0
    } else {
        (snapshot.processed as f64 / snapshot.total as f64) * 100.0
    };
    format!(
        "[PROGRESS] {} elapsed={} stage={} done={} / {} ({:.1}%) rate={} ETA={} in_flight={}",
        label,
        format_duration(snapshot.elapsed),
        snapshot.stage,
        HumanCount(snapshot.processed),
        HumanCount(snapshot.total),
        pct,
        format_rate(snapshot.rate),
        compute_eta(snapshot.total, snapshot.processed, snapshot.rate)
            .map(format_duration)
            .unwrap_or_else(|| "--:--".to_string()),
        snapshot.in_flight_display()
    )
}

fn average_rate(items: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    items as f64 / secs
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub fn format_rate(items_per_sec: f64) -> String {
    if items_per_sec <= 0.001 {
        "0/s".to_string()
    } else if items_per_sec < 1.0 {
        format!("{:.1}/min", items_per_sec * 60.0)
    } else {
        format!("{:.1}/s", items_per_sec)
    }
}

fn compute_eta(total: u64, processed: u64, rate: f64) -> Option<Duration> {
    if rate <= 0.001 || processed >= total {
        return None;
    }
    let remaining = total.saturating_sub(processed) as f64;
    Some(Duration::from_secs_f64(remaining / rate))
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    processed: u64,
    total: u64,
) -> bool {
    if processed >= total && total > 0 {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    match last_idle_warn {
        Some(last_warn) => now.duration_since(last_warn) >= idle_threshold,
        None => true,
    }
}

#[cfg(test)]
pub(crate) fn quiet_reporter(label: &str) -> ProgressReporter {
    ProgressReporter::new(label, 0, ProgressConfig::new(ProgressMode::Quiet))
}
