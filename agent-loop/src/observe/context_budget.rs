//! Context window accounting per iteration.
//!
//! Each [`measure`](ContextBudgetTracker::measure) samples the full context at
//! a named point. Within one iteration the cumulative count only grows (a
//! shrinking sample contributes zero), so `percentage_used` never decreases
//! inside an iteration.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::text::truncate_chars;
use crate::core::tokens::{Tokenizer, estimate_tokens};
use crate::core::types::{LogLevel, MeasurePoint, UsageTier};
use crate::io::atomic::write_json_atomic;
use crate::observe::entry::{LogEntry, group_thousands};
use crate::observe::multiplexer::ObservabilityMultiplexer;

const COMPONENT: &str = "Context";
const LABEL_WIDTH: usize = 15;

/// Known executor context windows, in tokens.
pub const CONTEXT_LIMITS: &[(&str, u64)] = &[
    ("claude", 200_000),
    ("gemini", 32_000),
    ("qchat", 8_000),
    ("kiro", 8_000),
];

pub const DEFAULT_CONTEXT_LIMIT: u64 = 100_000;

pub fn context_limit_for(adapter: &str) -> u64 {
    CONTEXT_LIMITS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(adapter))
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMeasurement {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub measure_point: MeasurePoint,
    pub tokens: u64,
    pub chars: u64,
    pub component: String,
    pub delta_tokens: i64,
    pub cumulative_tokens: u64,
    pub context_limit: u64,
    pub percentage_used: f64,
}

impl ContextMeasurement {
    pub fn tier(&self) -> UsageTier {
        UsageTier::from_percentage(self.percentage_used)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub total_measurements: usize,
    pub iterations_tracked: usize,
    pub peak_usage_percent: f64,
    pub peak_tokens: u64,
    pub context_limit: u64,
    pub adapter: String,
}

#[derive(Serialize)]
struct TimelineMetadata<'a> {
    adapter: &'a str,
    context_limit: u64,
    generated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct TimelineFile<'a> {
    metadata: TimelineMetadata<'a>,
    summary: Option<ContextSummary>,
    measurements: &'a [ContextMeasurement],
}

#[derive(Default)]
struct BudgetState {
    measurements: Vec<ContextMeasurement>,
    current_iteration: u32,
}

pub struct ContextBudgetTracker {
    adapter: String,
    context_limit: u64,
    output_dir: PathBuf,
    tokenizer: Option<Box<dyn Tokenizer>>,
    mux: Arc<ObservabilityMultiplexer>,
    state: Mutex<BudgetState>,
}

impl ContextBudgetTracker {
    /// Tracker for `adapter`, using the character heuristic for counting.
    pub fn new(
        adapter: &str,
        output_dir: impl Into<PathBuf>,
        mux: Arc<ObservabilityMultiplexer>,
    ) -> Self {
        Self {
            adapter: adapter.to_string(),
            context_limit: context_limit_for(adapter),
            output_dir: output_dir.into(),
            tokenizer: None,
            mux,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Box<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn context_limit(&self) -> u64 {
        self.context_limit
    }

    pub fn tokenizer_name(&self) -> &str {
        self.tokenizer
            .as_ref()
            .map_or("heuristic", |tokenizer| tokenizer.name())
    }

    pub fn count_tokens(&self, text: &str) -> u64 {
        let count = match &self.tokenizer {
            Some(tokenizer) => tokenizer.count(text),
            None => estimate_tokens(text),
        };
        count as u64
    }

    /// Record a sample of the full context at `point`.
    ///
    /// `iteration` switches the tracker to that iteration; `None` keeps the
    /// current one.
    pub fn measure(
        &self,
        point: MeasurePoint,
        content: &str,
        component: &str,
        iteration: Option<u32>,
    ) -> ContextMeasurement {
        let tokens = self.count_tokens(content);
        let chars = content.chars().count() as u64;

        let measurement = {
            let mut state = self.lock();
            if let Some(iteration) = iteration {
                state.current_iteration = iteration;
            }
            let current = state.current_iteration;
            let previous = state
                .measurements
                .iter()
                .rev()
                .find(|m| m.iteration == current);
            let (delta_tokens, cumulative_tokens) = match previous {
                Some(prev) => {
                    let delta = tokens as i64 - prev.tokens as i64;
                    (delta, prev.cumulative_tokens + delta.max(0) as u64)
                }
                None => (tokens as i64, tokens),
            };
            let measurement = ContextMeasurement {
                timestamp: Utc::now(),
                iteration: current,
                measure_point: point,
                tokens,
                chars,
                component: component.to_string(),
                delta_tokens,
                cumulative_tokens,
                context_limit: self.context_limit,
                percentage_used: percentage(cumulative_tokens, self.context_limit),
            };
            state.measurements.push(measurement.clone());
            measurement
        };

        self.mux.emit(
            LogEntry::new(
                LogLevel::Info,
                COMPONENT,
                format!(
                    "{} {}: {} tokens ({:.1}% of {})",
                    measurement.tier().indicator(),
                    point.as_str(),
                    group_thousands(tokens),
                    measurement.percentage_used,
                    group_thousands(self.context_limit)
                ),
            )
            .with_iteration(measurement.iteration)
            .with_context_tokens(tokens)
            .with_meta("percentage", measurement.percentage_used)
            .with_meta("component", component),
        );
        measurement
    }

    pub fn measurements(&self) -> Vec<ContextMeasurement> {
        self.lock().measurements.clone()
    }

    /// Aggregates, or `None` before the first measurement.
    pub fn summary(&self) -> Option<ContextSummary> {
        let state = self.lock();
        summarize(&state.measurements, &self.adapter, self.context_limit)
    }

    /// Bar chart of every measurement grouped by iteration.
    pub fn timeline_ascii(&self, width: usize) -> String {
        let state = self.lock();
        if state.measurements.is_empty() {
            return "No measurements recorded".to_string();
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Context Usage Timeline (limit: {} tokens)",
            group_thousands(self.context_limit)
        );
        out.push_str(&"=".repeat(width));

        let iterations: BTreeSet<u32> = state.measurements.iter().map(|m| m.iteration).collect();
        let bar_width = width.saturating_sub(40);
        for iteration in iterations {
            let _ = write!(out, "\n\nIteration {iteration}:\n{}", "-".repeat(width));
            for m in state.measurements.iter().filter(|m| m.iteration == iteration) {
                let filled = ((m.percentage_used / 100.0) * bar_width as f64) as usize;
                let filled = filled.min(bar_width);
                let title = m.measure_point.title();
                let label = truncate_chars(&title, LABEL_WIDTH);
                let _ = write!(
                    out,
                    "\n  {label:<label_width$} |{}{}| {:5.1}% {}",
                    "█".repeat(filled),
                    "░".repeat(bar_width - filled),
                    m.percentage_used,
                    m.tier().indicator(),
                    label_width = LABEL_WIDTH
                );
            }
        }
        out
    }

    /// Write the timeline JSON under the output directory.
    ///
    /// Defaults to `context-timeline-YYYYmmdd-HHMMSS.json`.
    pub fn save_timeline(&self, filename: Option<&str>) -> Result<PathBuf> {
        let filename = filename.map(str::to_string).unwrap_or_else(|| {
            format!(
                "context-timeline-{}.json",
                Local::now().format("%Y%m%d-%H%M%S")
            )
        });
        let path = self.output_dir.join(filename);
        let state = self.lock();
        let file = TimelineFile {
            metadata: TimelineMetadata {
                adapter: &self.adapter,
                context_limit: self.context_limit,
                generated_at: Utc::now(),
            },
            summary: summarize(&state.measurements, &self.adapter, self.context_limit),
            measurements: &state.measurements,
        };
        write_json_atomic(&path, &file)?;
        debug!(path = %path.display(), measurements = state.measurements.len(), "saved context timeline");
        Ok(path)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.measurements.clear();
        state.current_iteration = 0;
    }
}

fn percentage(tokens: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    tokens as f64 / limit as f64 * 100.0
}

fn summarize(
    measurements: &[ContextMeasurement],
    adapter: &str,
    context_limit: u64,
) -> Option<ContextSummary> {
    if measurements.is_empty() {
        return None;
    }
    let iterations: BTreeSet<u32> = measurements.iter().map(|m| m.iteration).collect();
    Some(ContextSummary {
        total_measurements: measurements.len(),
        iterations_tracked: iterations.len(),
        peak_usage_percent: measurements
            .iter()
            .map(|m| m.percentage_used)
            .fold(0.0, f64::max),
        peak_tokens: measurements.iter().map(|m| m.tokens).max().unwrap_or(0),
        context_limit,
        adapter: adapter.to_string(),
    })
}
