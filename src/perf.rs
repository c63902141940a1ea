//! Process-global timing spans and counters for end-of-run summaries.
//!
//! Training and synthesis record into one collector; the binary prints
//! [`report`] when run with `--verbose`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Named metrics tracked by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    TrainIteration,
    TrainBackward,
    TrainOptimizerStep,
    TrainValidation,
    TrainSamples,
    CheckpointSave,
    CheckpointLoad,
    RuntimeFromConfig,
    SynthesizeBatch,
    EncoderForward,
    DecoderSteps,
    TrainExamples,
    SynthesizedFrames,
}

impl Metric {
    const COUNT: usize = 13;
    const ALL: [Metric; Metric::COUNT] = [
        Metric::TrainIteration,
        Metric::TrainBackward,
        Metric::TrainOptimizerStep,
        Metric::TrainValidation,
        Metric::TrainSamples,
        Metric::CheckpointSave,
        Metric::CheckpointLoad,
        Metric::RuntimeFromConfig,
        Metric::SynthesizeBatch,
        Metric::EncoderForward,
        Metric::DecoderSteps,
        Metric::TrainExamples,
        Metric::SynthesizedFrames,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::TrainIteration => "train.iteration",
            Metric::TrainBackward => "train.backward",
            Metric::TrainOptimizerStep => "train.optimizer_step",
            Metric::TrainValidation => "train.validation",
            Metric::TrainSamples => "train.samples",
            Metric::CheckpointSave => "checkpoint.save",
            Metric::CheckpointLoad => "checkpoint.load",
            Metric::RuntimeFromConfig => "runtime.from_config",
            Metric::SynthesizeBatch => "synthesize.batch",
            Metric::EncoderForward => "encoder.forward",
            Metric::DecoderSteps => "decoder.steps",
            Metric::TrainExamples => "train.examples",
            Metric::SynthesizedFrames => "synthesize.frames",
        }
    }

    fn is_counter(self) -> bool {
        matches!(
            self,
            Metric::DecoderSteps | Metric::TrainExamples | Metric::SynthesizedFrames
        )
    }
}

struct Collector {
    start: Instant,
    totals_us: [AtomicU64; Metric::COUNT],
    counts: [AtomicU64; Metric::COUNT],
}

static COLLECTOR: OnceLock<Collector> = OnceLock::new();

fn collector() -> &'static Collector {
    COLLECTOR.get_or_init(|| Collector {
        start: Instant::now(),
        totals_us: std::array::from_fn(|_| AtomicU64::new(0)),
        counts: std::array::from_fn(|_| AtomicU64::new(0)),
    })
}

/// Timer that records its elapsed time when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        let micros = u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let index = self.metric as usize;
        let collector = collector();
        collector.totals_us[index].fetch_add(micros, Ordering::Relaxed);
        collector.counts[index].fetch_add(1, Ordering::Relaxed);
    }
}

/// Begin a timing span for `metric`.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Add `delta` to a counter metric.
pub fn add_count(metric: Metric, delta: u64) {
    collector().counts[metric as usize].fetch_add(delta, Ordering::Relaxed);
}

/// Human-readable summary of every metric recorded so far.
pub fn report() -> String {
    let collector = collector();
    let mut output = String::new();
    let _ = writeln!(
        output,
        "Performance summary (uptime: {:.3}s)",
        collector.start.elapsed().as_secs_f64()
    );
    let mut rows = 0;
    for metric in Metric::ALL {
        let index = metric as usize;
        let count = collector.counts[index].load(Ordering::Relaxed);
        if count == 0 {
            continue;
        }
        rows += 1;
        if metric.is_counter() {
            let _ = writeln!(output, "  {:<24} {count}", metric.name());
        } else {
            let total_ms = collector.totals_us[index].load(Ordering::Relaxed) as f64 / 1000.0;
            let _ = writeln!(
                output,
                "  {:<24} {:>10.3}ms over {count} (avg {:.3}ms)",
                metric.name(),
                total_ms,
                total_ms / count as f64
            );
        }
    }
    if rows == 0 {
        let _ = writeln!(output, "No performance data recorded.");
    }
    output
}
