//! Instrumented train-batch timing.
//!
//! When a trace path is configured the trainer routes every training batch
//! through a [`BatchProfiler`]. Each phase of the batch is timed, running
//! per-phase averages go to the `log` facade and the spans of the latest batch
//! are written as a Chrome trace (`chrome://tracing`, Perfetto).

use std::{
    fmt, fs,
    path::PathBuf,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::TrainingError;

/// Phases of one training batch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchPhase {
    Visualize,
    Transfer,
    Forward,
    Loss,
    Backward,
    Optimizer,
}

impl BatchPhase {
    pub const ALL: [BatchPhase; 6] = [
        BatchPhase::Visualize,
        BatchPhase::Transfer,
        BatchPhase::Forward,
        BatchPhase::Loss,
        BatchPhase::Backward,
        BatchPhase::Optimizer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BatchPhase::Visualize => "visualize",
            BatchPhase::Transfer => "transfer",
            BatchPhase::Forward => "forward",
            BatchPhase::Loss => "loss",
            BatchPhase::Backward => "backward",
            BatchPhase::Optimizer => "optimizer",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseSpan {
    pub phase: BatchPhase,
    /// Offset from the profiler's creation.
    pub start: Duration,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct BatchProfiler {
    trace_path: PathBuf,
    origin: Instant,
    batch_start: Option<Instant>,
    spans: Vec<PhaseSpan>,
    totals: [Duration; 6],
    counts: [usize; 6],
    batch_total: Duration,
    batches: usize,
}

impl BatchProfiler {
    pub fn new(trace_path: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_path.into(),
            origin: Instant::now(),
            batch_start: None,
            spans: Vec::new(),
            totals: [Duration::ZERO; 6],
            counts: [0; 6],
            batch_total: Duration::ZERO,
            batches: 0,
        }
    }

    /// Number of batches finished so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn begin_batch(&mut self) {
        self.spans.clear();
        self.batch_start = Some(Instant::now());
    }

    /// Times `f` as one occurrence of `phase`.
    pub fn span<R>(&mut self, phase: BatchPhase, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let duration = start.elapsed();

        self.spans.push(PhaseSpan {
            phase,
            start: start.duration_since(self.origin),
            duration,
        });
        self.totals[phase.index()] += duration;
        self.counts[phase.index()] += 1;
        result
    }

    /// Mean duration of `phase` over every recorded occurrence.
    pub fn phase_average(&self, phase: BatchPhase) -> Option<Duration> {
        let count = self.counts[phase.index()];
        (count > 0).then(|| self.totals[phase.index()] / count as u32)
    }

    /// Closes the batch: logs the running averages and rewrites the trace file
    /// with this batch's spans.
    pub fn finish_batch(&mut self) -> Result<(), TrainingError> {
        if let Some(start) = self.batch_start.take() {
            self.batch_total += start.elapsed();
        }
        self.batches += 1;

        for phase in BatchPhase::ALL {
            if let Some(average) = self.phase_average(phase) {
                log::info!("profile {phase}: {:.3} ms", average.as_secs_f64() * 1e3);
            }
        }
        log::info!(
            "profile batch: {:.3} ms over {} batch(es)",
            self.batch_total.as_secs_f64() * 1e3 / self.batches as f64,
            self.batches
        );

        self.write_trace()
    }

    fn write_trace(&self) -> Result<(), TrainingError> {
        let trace = ChromeTrace {
            trace_events: self
                .spans
                .iter()
                .map(|span| TraceEvent {
                    name: span.phase.name(),
                    cat: "train_batch",
                    ph: "X",
                    ts: span.start.as_secs_f64() * 1e6,
                    dur: span.duration.as_secs_f64() * 1e6,
                    pid: 1,
                    tid: 1,
                })
                .collect(),
            display_time_unit: "ms",
        };

        if let Some(parent) = self.trace_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&trace)
            .map_err(|err| TrainingError::runtime(format!("failed to encode trace: {err}")))?;
        fs::write(&self.trace_path, json).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write trace {}: {err}",
                self.trace_path.display()
            ))
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChromeTrace {
    trace_events: Vec<TraceEvent>,
    display_time_unit: &'static str,
}

#[derive(Serialize)]
struct TraceEvent {
    name: &'static str,
    cat: &'static str,
    ph: &'static str,
    ts: f64,
    dur: f64,
    pid: u32,
    tid: u32,
}
